//! Canary router — hash-deterministic traffic split.
//!
//! Bucket scheme: the first 8 bytes of `md5(conversation_id)` read as a
//! big-endian `u64`, mod 100. The mapping depends only on the
//! conversation id, so a conversation stays on one path across turns.

use md5::{Digest, Md5};

use orq_domain::config::EnvConfig;
use orq_domain::redact::hash_tag;
use orq_domain::trace::TraceEvent;

/// Convention: `canary_percent == 0` with the staged pipeline enabled
/// routes 100% of traffic to the staged path.
pub const CANARY_ALL: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Legacy,
    Staged,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Legacy => "legacy",
            Route::Staged => "staged",
        }
    }
}

pub struct CanaryRouter {
    staged_enabled: bool,
    canary_percent: u8,
}

impl CanaryRouter {
    pub fn new(staged_enabled: bool, canary_percent: u8) -> Self {
        Self {
            staged_enabled,
            canary_percent: canary_percent.min(100),
        }
    }

    pub fn from_env(env: &EnvConfig) -> Self {
        Self::new(env.staged_enabled, env.canary_percent)
    }

    /// Deterministic bucket in `0..100` for a conversation id.
    pub fn bucket(conversation_id: &str) -> u8 {
        let digest = Md5::digest(conversation_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % 100) as u8
    }

    pub fn route(&self, _workspace_id: &str, conversation_id: &str, _request_id: &str) -> Route {
        if !self.staged_enabled {
            return Route::Legacy;
        }

        let bucket = Self::bucket(conversation_id);
        let route = if self.canary_percent == CANARY_ALL || bucket < self.canary_percent {
            Route::Staged
        } else {
            Route::Legacy
        };

        TraceEvent::CanaryRouted {
            route: route.as_str().to_owned(),
            bucket,
            conversation_key: hash_tag(conversation_id),
        }
        .emit();

        route
    }
}

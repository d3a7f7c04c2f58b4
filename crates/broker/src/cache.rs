//! TTL-bounded idempotency cache, sharded by workspace.
//!
//! Successful observations are stored under their request fingerprint;
//! an equal fingerprint within the TTL replays the original payload as
//! a `DUPLICATE` observation without re-invoking the tool. Failures are
//! never cached — a failed call must stay observable to the circuit
//! breaker on replay.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use orq_domain::turn::Observation;

struct CacheEntry {
    observation: Observation,
    stored_at: Instant,
}

/// Process-wide cache; mutated by the broker only.
pub struct IdempotencyCache {
    shards: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a fingerprint. Returns the cached observation and its
    /// age in milliseconds, or `None` if absent or expired.
    pub fn get(&self, workspace_id: &str, fingerprint: &str) -> Option<(Observation, u64)> {
        let shards = self.shards.read();
        let entry = shards.get(workspace_id)?.get(fingerprint)?;
        let age = Instant::now().saturating_duration_since(entry.stored_at);
        if age > self.ttl {
            return None;
        }
        Some((entry.observation.clone(), age.as_millis() as u64))
    }

    /// Store a successful observation under its fingerprint.
    pub fn put(&self, workspace_id: &str, fingerprint: &str, observation: Observation) {
        let mut shards = self.shards.write();
        shards
            .entry(workspace_id.to_owned())
            .or_default()
            .insert(
                fingerprint.to_owned(),
                CacheEntry {
                    observation,
                    stored_at: Instant::now(),
                },
            );
    }

    /// Drop expired entries and empty shards.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut shards = self.shards.write();
        for shard in shards.values_mut() {
            shard.retain(|_, e| now.saturating_duration_since(e.stored_at) <= self.ttl);
        }
        shards.retain(|_, shard| !shard.is_empty());
    }

    /// Live (possibly-expired) entry count across all shards.
    pub fn len(&self) -> usize {
        self.shards.read().values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Per-turn contracts: the immutable turn snapshot and the typed JSON
//! payloads exchanged between pipeline stages.
//!
//! No stage emits free text that another stage must parse — the reply's
//! `text` is a terminal surface for the end user only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::state::{DialogueState, IntentLabel, NextAction, SlotValue};

/// Hard cap on planned tool calls per turn.
pub const MAX_PLAN_ACTIONS: usize = 3;

/// Hard cap on reply length, in characters.
pub const MAX_REPLY_CHARS: usize = 480;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The immutable input to one pipeline run. Created per inbound message,
/// discarded after the turn; the orchestrator is its sole owner.
#[derive(Debug, Clone)]
pub struct TurnSnapshot {
    pub workspace_id: String,
    pub conversation_id: String,
    pub channel: String,
    /// The latest user utterance, verbatim.
    pub text: String,
    pub state: DialogueState,
    /// Reference instant for relative date/time resolution.
    pub now: DateTime<Utc>,
    /// Caller-supplied request id, used for idempotent retries.
    pub request_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Output of the extractor stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub intent: IntentLabel,
    #[serde(default)]
    pub slots: BTreeMap<String, SlotValue>,
    /// In `[0, 1]`. Below the tenant's threshold, the response
    /// generator phrases replies more tentatively.
    pub confidence: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool invocation the planner wants to make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub tool_name: String,
    /// JSON object of arguments. The planner always injects the turn's
    /// `workspace_id` here, overwriting whatever the model produced.
    pub args: Value,
}

/// Output of the planner stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Plan {
    #[serde(default)]
    pub actions: Vec<PlannedAction>,
    #[serde(default)]
    pub needs_confirmation: bool,
    #[serde(default)]
    pub missing_slots: Vec<String>,
}

impl Plan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn missing(slots: Vec<String>) -> Self {
        Self {
            actions: Vec::new(),
            needs_confirmation: false,
            missing_slots: slots,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call / observation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully-resolved tool invocation handed to the broker.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool_name: String,
    pub args: Value,
    /// Deterministic fingerprint of `(workspace, tool, args)`.
    pub request_id: String,
    pub retry_safe: bool,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub idempotency_key: Option<String>,
}

/// Terminal classification of one tool dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultKind {
    Success,
    Failure,
    Timeout,
    CircuitOpen,
    Duplicate,
    DeniedByPolicy,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Success => "SUCCESS",
            ResultKind::Failure => "FAILURE",
            ResultKind::Timeout => "TIMEOUT",
            ResultKind::CircuitOpen => "CIRCUIT_OPEN",
            ResultKind::Duplicate => "DUPLICATE",
            ResultKind::DeniedByPolicy => "DENIED_BY_POLICY",
        }
    }
}

/// The immutable result of one tool dispatch. Exactly one per tool
/// call; appended to the dialogue state's bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub tool_name: String,
    pub kind: ResultKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub attempt_count: u32,
    /// Request fingerprint of the call that produced this observation.
    /// Lets the policy engine spot redundant re-invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Observation {
    pub fn success(
        tool_name: impl Into<String>,
        payload: Value,
        latency_ms: u64,
        attempt_count: u32,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind: ResultKind::Success,
            payload,
            status_code: None,
            latency_ms,
            attempt_count,
            request_id: None,
        }
    }

    pub fn failure(
        tool_name: impl Into<String>,
        payload: Value,
        status_code: Option<u16>,
        latency_ms: u64,
        attempt_count: u32,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind: ResultKind::Failure,
            payload,
            status_code,
            latency_ms,
            attempt_count,
            request_id: None,
        }
    }

    pub fn timeout(tool_name: impl Into<String>, latency_ms: u64, attempt_count: u32) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind: ResultKind::Timeout,
            payload: Value::Null,
            status_code: None,
            latency_ms,
            attempt_count,
            request_id: None,
        }
    }

    pub fn circuit_open(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind: ResultKind::CircuitOpen,
            payload: Value::Null,
            status_code: None,
            latency_ms: 0,
            attempt_count: 0,
            request_id: None,
        }
    }

    /// A cache replay. Carries the original payload untouched.
    pub fn duplicate(tool_name: impl Into<String>, payload: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind: ResultKind::Duplicate,
            payload,
            status_code: None,
            latency_ms: 0,
            attempt_count: 0,
            request_id: None,
        }
    }

    pub fn denied(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind: ResultKind::DeniedByPolicy,
            payload: serde_json::json!({ "reason": reason.into() }),
            status_code: None,
            latency_ms: 0,
            attempt_count: 0,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, ResultKind::Success | ResultKind::Duplicate)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Surface tone of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Friendly,
    Neutral,
    Apologetic,
}

/// The natural-language reply produced by the response generator.
/// Free-text surface; never consumed by another stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    #[serde(default)]
    pub tone: Tone,
    pub suggested_next: NextAction,
    #[serde(default)]
    pub quick_replies: Vec<String>,
}

impl Reply {
    /// Build a reply, truncating `text` to [`MAX_REPLY_CHARS`] on a char
    /// boundary.
    pub fn new(text: impl Into<String>, tone: Tone, suggested_next: NextAction) -> Self {
        let mut text: String = text.into();
        if text.chars().count() > MAX_REPLY_CHARS {
            text = text.chars().take(MAX_REPLY_CHARS).collect();
        }
        Self {
            text,
            tone,
            suggested_next,
            quick_replies: Vec::new(),
        }
    }

    pub fn with_quick_replies(mut self, quick_replies: Vec<String>) -> Self {
        self.quick_replies = quick_replies;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fingerprinting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render a JSON value with all object keys sorted, recursively, in
/// compact form. Two structurally-equal values render identically
/// regardless of original key order.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string serializes"));
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => {
                out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
            }
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Stable request fingerprint: `sha256(workspace \x1f tool \x1f canonical args)`.
///
/// Equal fingerprints within the idempotency TTL are served from cache
/// without re-invoking the tool.
pub fn fingerprint(workspace_id: &str, tool_name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workspace_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(tool_name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(args).as_bytes());
    hex::encode(hasher.finalize())
}

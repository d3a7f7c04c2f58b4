//! The inbound-turn RPC envelope.
//!
//! Stable wire contract, versioned by additive fields only. The HTTP
//! layer that carries it is a collaborator; this crate only defines the
//! typed request/response pair.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use orq_domain::state::StatePatch;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
}

/// Caller-supplied context for the turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical: Option<String>,
    /// Reference instant for relative date resolution; defaults to the
    /// server clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub workspace_id: String,
    pub conversation_id: String,
    pub channel: String,
    /// Caller request id, reused verbatim on idempotent retries.
    pub request_id: String,
    pub user_message: UserMessage,
    /// Slots the caller already knows; used to seed a conversation the
    /// store has not seen yet.
    #[serde(default)]
    pub slots: BTreeMap<String, Value>,
    #[serde(default)]
    pub context: TurnContext,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub text: String,
    #[serde(default)]
    pub suggested_replies: Vec<String>,
}

/// Summary of one tool invocation (args already redacted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub tool_name: String,
    pub result_kind: String,
    pub args_summary: String,
    pub latency_ms: u64,
}

/// Per-stage timings and routing facts for the turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TurnTelemetry {
    pub route: String,
    pub intent: String,
    pub confidence: f64,
    pub t_extract_ms: u64,
    pub t_plan_ms: u64,
    pub t_policy_ms: u64,
    pub t_broker_ms: u64,
    pub t_reduce_ms: u64,
    pub t_nlg_ms: u64,
    pub total_ms: u64,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub assistant: AssistantMessage,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallSummary>,
    #[serde(default)]
    pub patch: StatePatch,
    pub telemetry: TurnTelemetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deserializes_with_minimal_body() {
        let raw = r#"{
            "workspace_id": "ws1",
            "conversation_id": "c1",
            "channel": "whatsapp",
            "request_id": "r1",
            "user_message": { "text": "hola" }
        }"#;
        let req: TurnRequest = serde_json::from_str(raw).unwrap();
        assert!(req.slots.is_empty());
        assert!(req.context.now.is_none());
    }

    #[test]
    fn response_round_trips() {
        let resp = TurnResponse {
            assistant: AssistantMessage {
                text: "¡Hola!".into(),
                suggested_replies: vec!["Precios".into()],
            },
            tool_calls: vec![],
            patch: StatePatch::default(),
            telemetry: TurnTelemetry {
                route: "staged".into(),
                intent: "greeting".into(),
                confidence: 0.95,
                ..TurnTelemetry::default()
            },
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: TurnResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.assistant.text, "¡Hola!");
        assert_eq!(back.telemetry.route, "staged");
    }
}

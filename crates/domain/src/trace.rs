//! Structured trace events emitted across all Orquesta crates.
//!
//! Events are serialized to JSON and logged through `tracing`; a
//! telemetry backend can pick them up from the subscriber. Argument
//! summaries and conversation keys are redacted before they get here —
//! no raw user text, phone numbers or emails appear in any field.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    CanaryRouted {
        route: String,
        bucket: u8,
        /// Redaction hash of the conversation id, not the raw id.
        conversation_key: String,
    },
    ExtractionDone {
        workspace: String,
        intent: String,
        confidence: f64,
        slot_count: usize,
        heuristic: bool,
        duration_ms: u64,
    },
    PlanBuilt {
        workspace: String,
        action_count: usize,
        missing_slots: usize,
        fallback: bool,
        duration_ms: u64,
    },
    PolicyDenial {
        workspace: String,
        tool: String,
        reason: String,
    },
    ToolAttempt {
        workspace: String,
        tool: String,
        result_kind: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        attempt: u32,
        latency_ms: u64,
        /// Redacted argument summary.
        args_summary: String,
    },
    BreakerTransition {
        workspace: String,
        tool: String,
        from: String,
        to: String,
    },
    IdempotentReplay {
        workspace: String,
        tool: String,
        age_ms: u64,
    },
    StateReduced {
        slots_written: usize,
        history_len: usize,
        duration_ms: u64,
    },
    ReplyComposed {
        workspace: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        template: Option<String>,
        model_fallback: bool,
        chars: usize,
        duration_ms: u64,
    },
    TurnCompleted {
        workspace: String,
        route: String,
        intent: String,
        confidence: f64,
        t_extract_ms: u64,
        t_plan_ms: u64,
        t_policy_ms: u64,
        t_broker_ms: u64,
        t_reduce_ms: u64,
        t_nlg_ms: u64,
        total_ms: u64,
        fallback: bool,
        degraded: bool,
    },
    /// Security-class event: a cross-workspace access attempt.
    TenantViolation {
        expected: String,
        got: String,
    },
    ConfigRefreshed {
        workspaces: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "orq_event");
    }
}

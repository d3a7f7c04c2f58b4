//! The staged turn pipeline and its front door.
//!
//! One inbound utterance flows through extract → plan → policy →
//! dispatch → reduce → respond, under a turn deadline, with the canary
//! router deciding between this path and the legacy single-model path.

mod envelope;
mod extract;
mod legacy;
mod orchestrator;
mod plan;
mod policy;
mod reduce;
mod respond;
mod router;

pub use envelope::{
    AssistantMessage, ToolCallSummary, TurnContext, TurnRequest, TurnResponse, TurnTelemetry,
    UserMessage,
};
pub use extract::Extractor;
pub use legacy::LegacyResponder;
pub use orchestrator::Pipeline;
pub use plan::Planner;
pub use policy::{Denial, PolicyEngine, PolicyOutcome};
pub use reduce::StateReducer;
pub use respond::ResponseGenerator;
pub use router::{CanaryRouter, Route, CANARY_ALL};

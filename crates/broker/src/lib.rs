//! Tool Broker — typed tool dispatch with retry, timeout, idempotency,
//! circuit breaking, concurrency caps and PII-redacted telemetry.
//!
//! The broker owns every outbound tool call. Each validated call
//! produces exactly one [`orq_domain::turn::Observation`]; tool-level
//! errors never escape as `Err`.

mod breaker;
mod cache;
mod deadline;
mod dispatch;
mod transport;

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use cache::IdempotencyCache;
pub use deadline::Deadline;
pub use dispatch::ToolBroker;
pub use transport::{
    FnTool, HttpToolTransport, LocalTool, LocalToolTransport, ToolRequest, ToolTransport,
    TransportError,
};

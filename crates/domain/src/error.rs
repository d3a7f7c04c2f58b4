/// Shared error type used across all Orquesta crates.
///
/// Tool-level failures are normally absorbed by the broker into
/// [`crate::turn::Observation`]s; the variants here exist for the paths
/// where an error must propagate (model calls, store access, tenant
/// violations, turn deadlines).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("config: {0}")]
    Config(String),

    #[error("model output failed schema validation: {0}")]
    SchemaInvalid(String),

    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("tool '{tool}' transient failure: {message}")]
    ToolTransient {
        tool: String,
        status: Option<u16>,
        message: String,
    },

    #[error("tool '{tool}' permanent failure: {message}")]
    ToolPermanent {
        tool: String,
        status: Option<u16>,
        message: String,
    },

    #[error("circuit open for tool '{tool}'")]
    CircuitOpen { tool: String },

    #[error("denied by policy: {reason}")]
    PolicyDenied { reason: String },

    #[error("workspace mismatch: expected '{expected}', got '{got}'")]
    TenantMismatch { expected: String, got: String },

    #[error("turn deadline exceeded")]
    DeadlineExceeded,

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the broker may retry the attempt that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ToolTimeout { .. } | Error::ToolTransient { .. } | Error::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

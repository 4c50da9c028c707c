//! Error types for the resource layer.
//!
//! Every manager reports failures through [`ResourceError`] instead of
//! panicking or leaking executor faults to the caller. [`ResourceError::reason`]
//! gives a stable machine-readable code for dashboards and tests.

use thiserror::Error;

pub type ResourceResult<T> = Result<T, ResourceError>;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Operation disabled by feature gate: {0}")]
    Disabled(String),

    #[error("Connection to '{tool}' failed after {attempts} attempt(s): {details}")]
    ConnectionFailed {
        tool: String,
        attempts: u32,
        details: String,
    },

    #[error("Connection pool exhausted for tool: {0}")]
    PoolExhausted(String),

    #[error("Command queue full for tool '{tool}' ({depth} pending)")]
    QueueFull { tool: String, depth: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is not accepting commands (status: {status})")]
    SessionUnavailable { id: String, status: String },

    #[error("Command execution failed: {0}")]
    Executor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ResourceError {
    /// Stable snake_case code describing the failure class.
    pub fn reason(&self) -> &'static str {
        match self {
            ResourceError::UnknownTool(_) => "unknown_tool",
            ResourceError::Disabled(_) => "disabled",
            ResourceError::ConnectionFailed { .. } => "connection_failed",
            ResourceError::PoolExhausted(_) => "pool_exhausted",
            ResourceError::QueueFull { .. } => "queue_full",
            ResourceError::SessionNotFound(_) => "session_not_found",
            ResourceError::SessionUnavailable { .. } => "session_unavailable",
            ResourceError::Executor(_) => "executor_error",
            ResourceError::Config(_) => "config_error",
            ResourceError::Io(_) => "io_error",
            ResourceError::Yaml(_) => "config_error",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResourceError::ConnectionFailed { .. }
                | ResourceError::PoolExhausted(_)
                | ResourceError::QueueFull { .. }
        )
    }
}

/// Error reported by a [`CommandExecutor`](crate::executor::CommandExecutor).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Tool process unavailable: {0}")]
    Unavailable(String),

    #[error("Command timed out after {0}s")]
    Timeout(u64),

    #[error("Executor task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ExecutorError> for ResourceError {
    fn from(err: ExecutorError) -> Self {
        ResourceError::Executor(err.to_string())
    }
}

use thiserror::Error;

/// Convenience type alias for Results with StrandError
pub type Result<T> = std::result::Result<T, StrandError>;

/// Main error type for Strand Core
///
/// Every fallible operation in the runtime surfaces one of these kinds.
/// Recoverable kinds (`NoCapacity`, `Timeout`, `HeartbeatTimeout`,
/// `BackendUnavailable`) may be retried by the caller; `InvalidArgument`
/// is always terminal for the request that produced it.
#[derive(Error, Debug)]
pub enum StrandError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Process failed: {message}")]
    ProcessFailed {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Heartbeat timeout for agent {agent_id}")]
    HeartbeatTimeout { agent_id: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Registry backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StrandError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StrandError::NoCapacity(_)
                | StrandError::Timeout(_)
                | StrandError::HeartbeatTimeout { .. }
                | StrandError::BackendUnavailable(_)
        )
    }
}

use thiserror::Error;

/// Main error type for the agent orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Lookup errors ("agent not found", "old agent not found", ...)
    #[error("{0}")]
    NotFound(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Messaging errors
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Request to {subject} timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },

    // Durable store errors, surfaced unchanged from the backend
    #[error("Store error: {0}")]
    Store(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Agent or swap session absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }

    /// Publish failures and reply timeouts
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Communication(_) | OrchestratorError::Timeout { .. }
        )
    }
}

/// Result type alias for OrchestratorError
pub type Result<T> = std::result::Result<T, OrchestratorError>;

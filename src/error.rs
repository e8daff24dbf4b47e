//! Error types for Pulse.
//!
//! Uses thiserror for ergonomic error definitions. Validation errors are
//! surfaced synchronously to the enqueuing caller and never retried; everything
//! a processor throws is counted against the job's retry budget by the runner.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Payload validation errors (pre-persistence, never retried)
    #[error("Unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Payload too deep: nesting exceeds {max} levels")]
    PayloadTooDeep { max: usize },

    #[error("Invalid payload for {kind}: {message}")]
    InvalidPayload { kind: String, message: String },

    // Dispatch errors
    #[error("No handler registered for job kind: {0}")]
    NoHandlerRegistered(String),

    #[error("Job timed out after {0} seconds")]
    JobTimeout(u64),

    // Resource errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    // External service errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Google API error: {0}")]
    Google(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for errors raised by the payload validator before a job row exists.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownJobKind(_)
                | Self::PayloadTooLarge { .. }
                | Self::PayloadTooDeep { .. }
                | Self::InvalidPayload { .. }
        )
    }
}

// Convenience conversions
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Internal(format!("HTTP request failed: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

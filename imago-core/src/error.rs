use thiserror::Error;

/// Error taxonomy of the engine.
///
/// The variants drive retry policy in the pipeline: transient failures are
/// requeued up to the retry cap and then dead-lettered, corruption fails
/// the owning stage exactly once, and cancellation releases the message
/// back to its queue for the next boot.
#[derive(Error, Debug)]
pub enum ImagoError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("data corruption: {0}")]
    DataCorruption(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ImagoError {
    /// Whether a failed message handling attempt should be requeued.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImagoError::TransientIo(_) | ImagoError::Io(_) | ImagoError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ImagoError>;

use thiserror::Error;

/// Errors that can occur in the sync layer.
///
/// A failed compare-and-swap is not an error: it is reported as `Ok(false)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Lock contended: {0}")]
    LockContended(String),

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SyncError {
    /// Whether the error means the operation was abandoned on request rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled(_))
    }
}

//! Error taxonomy shared by the proxy and sub-HALs

use thiserror::Error;

/// Result of a synchronous sensor operation
pub type Result<T> = std::result::Result<T, SensorError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// Invalid or out of range argument, including malformed handles
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The operation has no backend able to serve it
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Called before initialization or after shutdown
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A sub-HAL call failed
    #[error("sub-HAL '{backend}' failed: {message}")]
    BackendFailure { backend: String, message: String },

    /// Buffered capacity exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl SensorError {
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        SensorError::BackendFailure {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

use thiserror::Error;

/// Errors raised by connections, response streams and configuration.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Tearing down the transport of a connection failed.
    #[error("failed to close connection to {endpoint}: {reason}")]
    CloseFailed {
        /// Endpoint the connection was bound to.
        endpoint: String,
        /// What went wrong.
        reason: String,
    },

    /// Closing or draining a response stream failed.
    #[error("failed to close response stream: {reason}")]
    StreamClose {
        /// What went wrong.
        reason: String,
    },

    /// A configuration value was rejected.
    #[error("invalid keep-alive configuration: {reason}")]
    InvalidConfig {
        /// Which limit was unusable.
        reason: String,
    },

    /// I/O error from the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

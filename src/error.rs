//! Error types for tokengate.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Capacity option was below 1
    #[error("capacity must be at least 1")]
    CapacityTooSmall,

    /// Refill interval option was zero
    #[error("refill interval must be at least 1ns")]
    RefillIntervalTooSmall,

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The limiter is not running
    #[error("limiter is not started")]
    NotStarted,

    /// The key has used up its capacity until the next decay tick
    #[error("too many requests for key {key:?}")]
    TooManyRequests {
        /// Key that was denied
        key: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`LimiterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Construction or configuration was rejected.
    InvalidConfiguration,
    /// Admission was attempted while the limiter was not running.
    NotStarted,
    /// Admission was denied because the key is at its ceiling.
    CapacityExceeded,
    /// Reading configuration from disk failed.
    Io,
}

impl LimiterError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LimiterError::CapacityTooSmall
            | LimiterError::RefillIntervalTooSmall
            | LimiterError::Config(_) => ErrorKind::InvalidConfiguration,
            LimiterError::NotStarted => ErrorKind::NotStarted,
            LimiterError::TooManyRequests { .. } => ErrorKind::CapacityExceeded,
            LimiterError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the caller may retry after the next decay tick.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::CapacityExceeded
    }
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

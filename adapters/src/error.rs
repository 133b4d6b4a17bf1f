//! Error types for adapters

use thiserror::Error;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Adapter errors
#[derive(Error, Debug)]
pub enum Error {
    /// Upstream answered with a non-2xx status
    #[error("Upstream error {status_code}: {message}")]
    Upstream {
        /// HTTP status code (after any channel mapping)
        status_code: u16,
        /// Error message
        message: String,
        /// Structured error type
        error_type: String,
        /// Structured error code
        code: String,
    },

    /// Upstream did not answer in time
    #[error("Timeout after {seconds}s: {operation}")]
    Timeout {
        /// Timeout duration
        seconds: u64,
        /// Operation
        operation: String,
    },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request could not be converted for the provider
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No adaptor registered for the provider
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Client stopped reading the response
    #[error("Client disconnected")]
    ClientGone,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an upstream error
    pub fn upstream(status_code: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status_code,
            message: message.into(),
            error_type: "upstream_error".to_string(),
            code: String::new(),
        }
    }

    /// HTTP status this error is reported as
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Upstream { status_code, .. } => *status_code,
            Error::Timeout { .. } => 504,
            Error::InvalidRequest(_) | Error::UnsupportedProvider(_) => 400,
            _ => 500,
        }
    }

    /// Whether the failure happened before anything reached the upstream
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_) | Error::UnsupportedProvider(_) | Error::Config(_)
        )
    }

    /// Map reqwest failures onto the transport taxonomy
    pub fn from_transport(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            Error::Timeout {
                seconds: timeout_secs,
                operation: "upstream request".to_string(),
            }
        } else if err.is_connect() {
            Error::Connection(err.to_string())
        } else {
            Error::Http(err)
        }
    }
}

//! Error types for the relay
//!
//! [`Error`] covers wiring failures (config, metrics, collaborators).
//! [`RelayError`] classifies one failed attempt; only the last one of a
//! request reaches the caller, as a sanitised [`ClientError`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Result type for relay wiring
pub type Result<T> = std::result::Result<T, Error>;

/// Relay wiring errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Quota ledger failure
    #[error("Ledger error: {0}")]
    Ledger(#[from] quota_ledger::Error),

    /// Channel index failure
    #[error("Channel error: {0}")]
    Channel(#[from] channel_index::Error),

    /// Adapter failure
    #[error("Adapter error: {0}")]
    Adapter(#[from] adapters::Error),

    /// Archive upload failure
    #[error("Archive error: {0}")]
    Archive(String),
}

/// Generic message returned instead of a raw upstream 429
pub const SATURATED_MESSAGE: &str =
    "upstream load for the current group is saturated, please try again later";

/// Why one attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Failed before any upstream byte: selection, pricing, adaptor, conversion
    #[error("{message}")]
    Local {
        /// Reported status
        status_code: u16,
        /// Error code
        code: String,
        /// Error text
        message: String,
    },

    /// User or token quota cannot cover the request
    #[error("{message}")]
    Billing {
        /// Error code
        code: String,
        /// Error text
        message: String,
    },

    /// Upstream answered with a non-2xx status
    #[error("upstream error {status_code}: {message}")]
    Upstream {
        /// Status after channel mapping
        status_code: u16,
        /// Upstream message
        message: String,
        /// Upstream error type
        error_type: String,
        /// Upstream error code
        code: String,
    },

    /// Upstream could not be reached or did not answer in time
    #[error("{message}")]
    Transport {
        /// 504 for timeouts, 500 otherwise
        status_code: u16,
        /// Error text
        message: String,
    },
}

impl RelayError {
    /// Local error with a status and code
    pub fn local(status_code: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::Local {
            status_code,
            code: code.into(),
            message: message.into(),
        }
    }

    /// The request deadline expired
    pub fn deadline() -> Self {
        RelayError::Transport {
            status_code: 504,
            message: "request deadline exceeded".to_string(),
        }
    }

    /// Status reported to the client
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Local { status_code, .. }
            | RelayError::Upstream { status_code, .. }
            | RelayError::Transport { status_code, .. } => *status_code,
            RelayError::Billing { .. } => 403,
        }
    }

    /// Whether the failure happened inside the relay (never retried)
    pub fn is_local(&self) -> bool {
        matches!(self, RelayError::Local { .. } | RelayError::Billing { .. })
    }

    /// Error text
    pub fn message(&self) -> &str {
        match self {
            RelayError::Local { message, .. }
            | RelayError::Billing { message, .. }
            | RelayError::Upstream { message, .. }
            | RelayError::Transport { message, .. } => message,
        }
    }

    /// Structured error type
    pub fn error_type(&self) -> &str {
        match self {
            RelayError::Local { .. } => "relay_error",
            RelayError::Billing { .. } => "insufficient_quota",
            RelayError::Upstream { error_type, .. } => error_type,
            RelayError::Transport { .. } => "upstream_error",
        }
    }

    /// Structured error code
    pub fn code(&self) -> &str {
        match self {
            RelayError::Local { code, .. }
            | RelayError::Billing { code, .. }
            | RelayError::Upstream { code, .. } => code,
            RelayError::Transport { status_code: 504, .. } => "upstream_timeout",
            RelayError::Transport { .. } => "do_request_failed",
        }
    }

    /// Classify an adapter failure
    pub fn from_adapter(err: adapters::Error) -> Self {
        use adapters::Error as A;
        match err {
            A::Upstream {
                status_code,
                message,
                error_type,
                code,
            } => RelayError::Upstream {
                status_code,
                message,
                error_type,
                code,
            },
            A::Timeout { .. } => RelayError::Transport {
                status_code: 504,
                message: err.to_string(),
            },
            A::ClientGone => RelayError::local(499, "client_closed_request", err.to_string()),
            A::UnsupportedProvider(_) => RelayError::local(400, "invalid_api_type", err.to_string()),
            A::InvalidRequest(_) | A::Config(_) => {
                RelayError::local(400, "convert_request_failed", err.to_string())
            }
            A::Connection(_) | A::Http(_) | A::Json(_) | A::Io(_) => RelayError::Transport {
                status_code: 500,
                message: err.to_string(),
            },
        }
    }

    /// Classify a ledger failure
    pub fn from_ledger(err: quota_ledger::Error) -> Self {
        use quota_ledger::Error as L;
        match err {
            L::InsufficientUserQuota { .. } => RelayError::Billing {
                code: "insufficient_user_quota".to_string(),
                message: err.to_string(),
            },
            L::InsufficientTokenQuota { .. } => RelayError::Billing {
                code: "pre_consume_token_quota_failed".to_string(),
                message: err.to_string(),
            },
            L::PriceNotFound { .. } => RelayError::local(500, "model_price_error", err.to_string()),
            other => RelayError::local(500, "pre_consume_failed", other.to_string()),
        }
    }
}

/// Body shape of a rendered error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFormat {
    /// `{"error": {"message", "type", "code"}}`
    #[default]
    OpenAi,
    /// `{"type": "error", "error": {"type", "message"}}`
    Claude,
}

/// Final error returned to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ClientError {
    /// HTTP status
    pub status_code: u16,
    /// User-facing message (request id appended)
    pub message: String,
    /// Structured error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// Structured error code
    pub code: String,
}

impl ClientError {
    /// Build the user-facing error for a request
    ///
    /// Raw upstream 429 messages are replaced with [`SATURATED_MESSAGE`].
    pub fn from_relay(err: &RelayError, request_id: &str) -> Self {
        let status_code = err.status_code();
        let message = if status_code == 429 {
            SATURATED_MESSAGE
        } else {
            err.message()
        };
        Self {
            status_code,
            message: format!("{} (request id: {})", message, request_id),
            error_type: err.error_type().to_string(),
            code: err.code().to_string(),
        }
    }

    /// Render the response body
    pub fn to_json(&self, format: ErrorFormat) -> serde_json::Value {
        match format {
            ErrorFormat::OpenAi => json!({
                "error": {
                    "message": self.message,
                    "type": self.error_type,
                    "param": "",
                    "code": self.code,
                }
            }),
            ErrorFormat::Claude => json!({
                "type": "error",
                "error": {
                    "type": self.error_type,
                    "message": self.message,
                }
            }),
        }
    }
}

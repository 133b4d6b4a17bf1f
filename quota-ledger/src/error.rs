//! Error types for the quota ledger

use crate::types::Quota;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// User balance cannot cover the reservation
    #[error("user quota is not enough: available {available}, required {required}")]
    InsufficientUserQuota {
        /// Balance at check time
        available: Quota,
        /// Amount requested
        required: Quota,
    },

    /// Token allotment cannot cover the reservation
    #[error("token quota is not enough: available {available}, required {required}")]
    InsufficientTokenQuota {
        /// Allotment at check time
        available: Quota,
        /// Amount requested
        required: Quota,
    },

    /// Unknown user
    #[error("User not found: {0}")]
    UserNotFound(i64),

    /// Unknown token
    #[error("Token not found: {0}")]
    TokenNotFound(i64),

    /// Model has neither a ratio nor a per-call price
    #[error("model {model} has no configured price")]
    PriceNotFound {
        /// Upstream model name
        model: String,
    },

    /// Reservation already settled or refunded
    #[error("Reservation already closed: {0}")]
    ReservationClosed(Uuid),

    /// Balance store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Audit sink failure
    #[error("Usage log error: {0}")]
    UsageLog(String),

    /// Metrics registration failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the payer ran out of quota
    pub fn is_insufficient_quota(&self) -> bool {
        matches!(
            self,
            Error::InsufficientUserQuota { .. } | Error::InsufficientTokenQuota { .. }
        )
    }
}

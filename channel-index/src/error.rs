//! Error types for the channel index

use crate::types::ChannelId;
use thiserror::Error;

/// Result type for channel index operations
pub type Result<T> = std::result::Result<T, Error>;

/// Channel index errors
#[derive(Error, Debug)]
pub enum Error {
    /// No enabled, non-excluded channel serves the (group, model) pair
    #[error("no available channel for group {group} and model {model}")]
    NoSatisfiedChannel {
        /// Requested group
        group: String,
        /// Requested model
        model: String,
    },

    /// Unknown channel
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// Unknown provider type name
    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),

    /// Channel store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Refresh task no longer running
    #[error("Cache refresher stopped")]
    RefresherStopped,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Failover decisions

use crate::error::RelayError;
use channel_index::ProviderType;
use std::collections::HashSet;

/// Decides whether a failed attempt moves on to another channel
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    bad_request_retry: HashSet<String>,
}

impl FailoverPolicy {
    /// Policy retrying 400s only for the listed providers
    pub fn new<I, S>(bad_request_retry_providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            bad_request_retry: bad_request_retry_providers
                .into_iter()
                .map(|p| p.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether to try another channel
    ///
    /// `remaining` is the retry budget left after this attempt.
    pub fn should_retry(
        &self,
        error: &RelayError,
        provider: ProviderType,
        pinned: bool,
        remaining: u32,
    ) -> bool {
        if error.is_local() || pinned || remaining == 0 {
            return false;
        }

        match error.status_code() {
            429 | 307 => true,
            // timeouts are not retried
            504 | 524 => false,
            500..=599 => true,
            400 => self.bad_request_retry.contains(provider.as_str()),
            408 => false,
            200..=299 => false,
            _ => true,
        }
    }
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::new(["anthropic"])
    }
}

//! Channel failure reporting and auto-ban
//!
//! Every failed attempt produces a [`FailureReport`] that is handled on the
//! task pool: it is logged, optionally written to the error log, and may
//! disable the channel when the failure says the credential itself is bad.

use crate::config::AutoBanConfig;
use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use channel_index::{Channel, ChannelId, ChannelIndex, ChannelStatus, ChannelStore, ProviderType};
use chrono::Utc;
use prometheus::IntCounter;
use quota_ledger::{ErrorLogRecord, Payer, UsageLogSink};
use std::sync::Arc;
use tracing::{error, warn};

/// Decides whether a failure disables its channel
#[derive(Debug, Clone)]
pub struct AutoBanPolicy {
    config: AutoBanConfig,
}

impl AutoBanPolicy {
    /// Policy from config; keywords match case-insensitively
    pub fn new(mut config: AutoBanConfig) -> Self {
        for keyword in &mut config.keywords {
            *keyword = keyword.to_lowercase();
        }
        Self { config }
    }

    /// Whether `error` disables the channel
    pub fn should_disable(&self, error: &RelayError) -> bool {
        if !self.config.enabled || error.is_local() {
            return false;
        }
        if self.config.status_codes.contains(&error.status_code()) {
            return true;
        }

        match error {
            RelayError::Upstream {
                message,
                error_type,
                code,
                ..
            } => {
                if self.config.error_codes.iter().any(|c| c == code)
                    || self.config.error_types.iter().any(|t| t == error_type)
                {
                    return true;
                }
                let message = message.to_lowercase();
                self.config.keywords.iter().any(|k| message.contains(k))
            }
            _ => false,
        }
    }
}

/// One failed attempt
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Request trace ID
    pub request_id: String,
    /// Failing channel
    pub channel_id: ChannelId,
    /// Channel display name
    pub channel_name: String,
    /// Channel provider
    pub provider: ProviderType,
    /// Channel allows auto-ban
    pub auto_ban: bool,
    /// Billed user and token
    pub payer: Payer,
    /// Client-facing model
    pub model_name: String,
    /// Billing group
    pub group: String,
    /// What went wrong
    pub error: RelayError,
}

impl FailureReport {
    /// Report for an attempt on `channel`
    ///
    /// Channel fields are copied now; the report is handled later and the
    /// channel may have changed by then.
    pub fn new(ctx: &RelayContext, channel: &Channel, error: RelayError) -> Self {
        Self {
            request_id: ctx.request_id.clone(),
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            provider: channel.provider,
            auto_ban: channel.auto_ban,
            payer: ctx.payer.clone(),
            model_name: ctx.origin_model.clone(),
            group: ctx.group.clone(),
            error,
        }
    }
}

/// Handles failure reports
#[derive(Clone)]
pub struct ErrorReporter {
    policy: AutoBanPolicy,
    error_log_enabled: bool,
    index: Arc<ChannelIndex>,
    store: Option<Arc<dyn ChannelStore>>,
    usage_log: Arc<dyn UsageLogSink>,
    bans: IntCounter,
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("policy", &self.policy)
            .field("error_log_enabled", &self.error_log_enabled)
            .finish_non_exhaustive()
    }
}

impl ErrorReporter {
    /// Reporter publishing bans to `index` and, when set, persisting them
    pub fn new(
        policy: AutoBanPolicy,
        error_log_enabled: bool,
        index: Arc<ChannelIndex>,
        store: Option<Arc<dyn ChannelStore>>,
        usage_log: Arc<dyn UsageLogSink>,
        bans: IntCounter,
    ) -> Self {
        Self {
            policy,
            error_log_enabled,
            index,
            store,
            usage_log,
            bans,
        }
    }

    /// Log, record and possibly ban
    pub async fn report(&self, report: FailureReport) -> Result<()> {
        let status_code = report.error.status_code();
        error!(
            request_id = %report.request_id,
            channel_id = report.channel_id,
            status = status_code,
            "relay error (channel #{}, status code: {}): {}",
            report.channel_id,
            status_code,
            report.error.message()
        );

        if self.error_log_enabled {
            let record = ErrorLogRecord {
                request_id: report.request_id.clone(),
                user_id: report.payer.user_id,
                token_id: report.payer.token_id,
                token_name: report.payer.token_name.clone(),
                channel_id: report.channel_id,
                channel_name: report.channel_name.clone(),
                provider: report.provider.to_string(),
                model_name: report.model_name.clone(),
                group: report.group.clone(),
                status_code,
                error_type: report.error.error_type().to_string(),
                error_code: report.error.code().to_string(),
                message: report.error.message().to_string(),
                created_at: Utc::now(),
            };
            self.usage_log.record_error(record).await?;
        }

        if report.auto_ban && self.policy.should_disable(&report.error) {
            self.disable(&report).await?;
        }
        Ok(())
    }

    async fn disable(&self, report: &FailureReport) -> Result<()> {
        // persisted first, so a reload in between cannot re-enable it
        if let Some(store) = &self.store {
            match store
                .update_status(
                    report.channel_id,
                    ChannelStatus::AutoDisabled,
                    report.error.message(),
                )
                .await
            {
                Ok(()) => {}
                Err(channel_index::Error::ChannelNotFound(_)) => {
                    warn!(channel_id = report.channel_id, "channel to disable is gone");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.index.disable(report.channel_id, ChannelStatus::AutoDisabled) {
            Ok(version) => {
                self.bans.inc();
                warn!(
                    channel_id = report.channel_id,
                    version,
                    "channel #{} ({}) auto-disabled: {}",
                    report.channel_id,
                    report.channel_name,
                    report.error.message()
                );
                Ok(())
            }
            Err(channel_index::Error::ChannelNotFound(_)) => {
                warn!(channel_id = report.channel_id, "channel to disable is gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoBanConfig;
    use channel_index::MemoryChannelStore;
    use quota_ledger::{MemoryUsageLog, TokenId, UserId};

    fn upstream(status_code: u16, message: &str, error_type: &str, code: &str) -> RelayError {
        RelayError::Upstream {
            status_code,
            message: message.into(),
            error_type: error_type.into(),
            code: code.into(),
        }
    }

    #[test]
    fn test_auto_ban_policy() {
        let policy = AutoBanPolicy::new(AutoBanConfig::default());
        assert!(policy.should_disable(&upstream(401, "bad key", "", "")));
        assert!(policy.should_disable(&upstream(403, "x", "", "account_deactivated")));
        assert!(policy.should_disable(&upstream(429, "x", "insufficient_quota", "")));
        assert!(policy.should_disable(&upstream(400, "Your credit balance is too low", "", "")));
        assert!(!policy.should_disable(&upstream(500, "overloaded", "server_error", "")));
        assert!(!policy.should_disable(&RelayError::local(401, "x", "local")));

        let off = AutoBanPolicy::new(AutoBanConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!off.should_disable(&upstream(401, "bad key", "", "")));
    }

    fn report(channel: &Channel, error: RelayError) -> FailureReport {
        FailureReport {
            request_id: "req-1".into(),
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            provider: channel.provider,
            auto_ban: channel.auto_ban,
            payer: Payer::unlimited(UserId(1), TokenId(1)),
            model_name: "gpt-4o".into(),
            group: "default".into(),
            error,
        }
    }

    #[tokio::test]
    async fn test_report_bans_and_logs() {
        let channel = Channel::new(5, ProviderType::OpenAi, "primary")
            .with_groups(["default"])
            .with_models(["gpt-4o"]);
        let index = Arc::new(ChannelIndex::new(vec![channel.clone()]));
        let store = Arc::new(MemoryChannelStore::new(vec![channel.clone()]));
        let log = Arc::new(MemoryUsageLog::new());
        let bans = IntCounter::new("bans", "bans").unwrap();
        let reporter = ErrorReporter::new(
            AutoBanPolicy::new(AutoBanConfig::default()),
            true,
            index.clone(),
            Some(store.clone()),
            log.clone(),
            bans.clone(),
        );

        reporter
            .report(report(&channel, upstream(401, "invalid key", "", "invalid_api_key")))
            .await
            .unwrap();

        assert_eq!(index.get(5).unwrap().status, ChannelStatus::AutoDisabled);
        assert_eq!(store.status_changes().len(), 1);
        assert_eq!(bans.get(), 1);
        let errors = log.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status_code, 401);
        assert_eq!(errors[0].channel_name, "primary");
    }

    #[tokio::test]
    async fn test_channel_without_auto_ban_stays_enabled() {
        let channel = Channel::new(6, ProviderType::OpenAi, "keep").with_auto_ban(false);
        let index = Arc::new(ChannelIndex::new(vec![channel.clone()]));
        let reporter = ErrorReporter::new(
            AutoBanPolicy::new(AutoBanConfig::default()),
            false,
            index.clone(),
            None,
            Arc::new(MemoryUsageLog::new()),
            IntCounter::new("bans", "bans").unwrap(),
        );

        reporter
            .report(report(&channel, upstream(401, "invalid key", "", "")))
            .await
            .unwrap();
        assert!(index.get(6).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_ban_is_not_published_until_persisted() {
        let channel = Channel::new(7, ProviderType::OpenAi, "flaky-db")
            .with_groups(["default"])
            .with_models(["gpt-4o"]);
        let index = Arc::new(ChannelIndex::new(vec![channel.clone()]));
        let store = Arc::new(MemoryChannelStore::new(vec![channel.clone()]));
        store.set_unavailable(true);
        let bans = IntCounter::new("bans", "bans").unwrap();
        let reporter = ErrorReporter::new(
            AutoBanPolicy::new(AutoBanConfig::default()),
            false,
            index.clone(),
            Some(store.clone()),
            Arc::new(MemoryUsageLog::new()),
            bans.clone(),
        );

        let result = reporter
            .report(report(&channel, upstream(401, "invalid key", "", "invalid_api_key")))
            .await;

        assert!(result.is_err());
        assert!(index.get(7).unwrap().is_enabled());
        assert!(store.status_changes().is_empty());
        assert_eq!(bans.get(), 0);
    }
}

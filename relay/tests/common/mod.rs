//! Shared relay test environment

#![allow(dead_code)]

use adapters::{AdaptorRegistry, MockAdaptorFactory};
use channel_index::{Channel, ChannelIndex, MemoryChannelStore, ProviderType};
use quota_ledger::{MemoryBalanceStore, MemoryUsageLog, Payer, QuotaLedger, TokenId, UserId};
use relay::{Config, InboundRequest, MemoryArchive, Relay, Route};
use serde_json::json;
use std::sync::Arc;

pub const MODEL: &str = "test-model";
pub const GROUP: &str = "default";
pub const USER: UserId = UserId(1);
pub const TOKEN: TokenId = TokenId(1);
pub const USER_QUOTA: i64 = 1_000;

/// Prompt tokens fixed on every route so the estimate is 10 + max_tokens
pub const PROMPT_TOKENS: u32 = 10;

pub struct TestEnvironment {
    pub relay: Arc<Relay>,
    pub index: Arc<ChannelIndex>,
    pub store: Arc<MemoryChannelStore>,
    pub balances: Arc<MemoryBalanceStore>,
    pub ledger: Arc<QuotaLedger>,
    pub mock: MockAdaptorFactory,
    pub usage_log: Arc<MemoryUsageLog>,
    pub archive: Arc<MemoryArchive>,
}

pub fn channel(id: i64, provider: ProviderType) -> Channel {
    Channel::new(id, provider, format!("ch-{}", id))
        .with_groups([GROUP])
        .with_models([MODEL])
        .with_priority(1)
}

pub fn custom_channels(count: i64) -> Vec<Channel> {
    (1..=count).map(|id| channel(id, ProviderType::Custom)).collect()
}

impl TestEnvironment {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self::with_config(channels, USER_QUOTA, |_| {})
    }

    pub fn with_config(
        channels: Vec<Channel>,
        user_quota: i64,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        Self::build(channels, user_quota, configure, false)
    }

    /// Relay that forwards client bodies untouched
    pub fn with_pass_through(channels: Vec<Channel>) -> Self {
        Self::build(channels, USER_QUOTA, |_| {}, true)
    }

    fn build(
        channels: Vec<Channel>,
        user_quota: i64,
        configure: impl FnOnce(&mut Config),
        pass_through: bool,
    ) -> Self {
        let mut config = Config::default();
        config.task_pool.workers = 2;
        configure(&mut config);

        let quota = quota_ledger::Config {
            allow_unpriced_models: true,
            ..Default::default()
        };
        let balances = Arc::new(MemoryBalanceStore::new().with_user(USER, user_quota));
        let ledger = Arc::new(QuotaLedger::new(quota, balances.clone()).unwrap());

        let store = Arc::new(MemoryChannelStore::new(channels.clone()));
        let index = Arc::new(ChannelIndex::new(channels));

        let mock = MockAdaptorFactory::new();
        let mut registry = AdaptorRegistry::new();
        registry.register(ProviderType::Custom, Arc::new(mock.clone()));
        registry.register(ProviderType::Anthropic, Arc::new(mock.clone()));

        let usage_log = Arc::new(MemoryUsageLog::new());
        let archive = Arc::new(MemoryArchive::new());
        let relay = Relay::builder(config, ledger.clone(), index.clone(), registry)
            .pass_through(pass_through)
            .channel_store(store.clone())
            .usage_log(usage_log.clone())
            .archive_store(archive.clone())
            .build()
            .unwrap();

        Self {
            relay: Arc::new(relay),
            index,
            store,
            balances,
            ledger,
            mock,
            usage_log,
            archive,
        }
    }

    pub fn route(&self, request_id: &str, first_channel: i64) -> Route {
        let channel = self.index.get(first_channel).unwrap();
        Route::new(
            request_id,
            Payer::unlimited(USER, TOKEN),
            GROUP,
            MODEL,
            channel,
        )
        .with_prompt_tokens(PROMPT_TOKENS)
    }

    pub fn user_quota(&self) -> i64 {
        self.balances.user(USER).unwrap().quota
    }

    /// Waits for queued side effects (refunds, reports, logs)
    pub async fn drain(&self) {
        self.relay.shutdown().await;
    }
}

/// Chat request reserving 10 + 90 = 100 quota at ratio 1
pub fn chat_request() -> InboundRequest {
    let body = json!({
        "model": MODEL,
        "max_tokens": 90,
        "messages": [{"role": "user", "content": "hi"}]
    });
    InboundRequest::from_json("/v1/chat/completions", body.to_string())
}

pub fn stream_request() -> InboundRequest {
    let body = json!({
        "model": MODEL,
        "max_tokens": 90,
        "stream": true,
        "messages": [{"role": "user", "content": "hi"}]
    });
    InboundRequest::from_json("/v1/chat/completions", body.to_string())
}

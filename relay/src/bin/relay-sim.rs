//! Relay simulator
//!
//! Drives concurrent requests through the full relay against scripted
//! upstreams: one overloaded channel, one with a revoked key, and two
//! healthy ones. Prints the outcome and the ledger's view afterwards.
//!
//! Usage: `relay-sim [config.toml]`

use adapters::{AdaptorRegistry, MockAdaptorFactory, MockOutcome};
use anyhow::Context;
use channel_index::{
    reload, CacheRefresher, Channel, ChannelIndex, ChannelStore, MemoryChannelStore, ProviderType,
};
use quota_ledger::{Account, MemoryBalanceStore, MemoryUsageLog, Payer, QuotaLedger, TokenId, UserId};
use relay::{GatewayConfig, InboundRequest, MemoryArchive, Relay, Route};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

const REQUESTS: usize = 24;
const MODEL: &str = "gpt-4o-mini";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("RELAY_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn channels() -> Vec<Channel> {
    let base = |id, name: &str, priority| {
        Channel::new(id, ProviderType::Custom, name)
            .with_groups(["default"])
            .with_models([MODEL])
            .with_priority(priority)
    };
    vec![
        base(1, "overloaded", 5),
        base(2, "revoked-key", 3),
        base(3, "healthy-a", 2),
        base(4, "healthy-b", 1).with_model_mapping(MODEL, "gpt-4o-mini-2024-07-18"),
    ]
}

fn script(mock: &MockAdaptorFactory) {
    mock.set_fallback(1, MockOutcome::status(503, "server overloaded"));
    mock.push(
        2,
        MockOutcome::Upstream {
            status: 401,
            message: "Incorrect API key provided".to_string(),
            error_type: "invalid_request_error".to_string(),
            code: "invalid_api_key".to_string(),
        },
    );
    mock.set_fallback(3, MockOutcome::success(120, 80));
    mock.set_fallback(4, MockOutcome::stream(["Hello", ", ", "world"], 40, 3));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        None => GatewayConfig::from_env().context("loading config from environment")?,
    };
    config.relay.error_log_enabled = true;
    config.relay.archive_enabled = true;

    let channel_store = Arc::new(MemoryChannelStore::new(channels()));
    let index = Arc::new(ChannelIndex::default());
    reload(&index, channel_store.as_ref()).await?;
    let refresher = CacheRefresher::spawn(
        index.clone(),
        channel_store.clone(),
        config.channels.refresh_interval(),
    );

    let user = UserId(1);
    let token = TokenId(1);
    let balances = Arc::new(
        MemoryBalanceStore::new()
            .with_user(user, 2_000_000)
            .with_token(token, 1_500_000),
    );
    let ledger = Arc::new(QuotaLedger::new(config.quota.clone(), balances.clone())?);

    let mock = MockAdaptorFactory::new();
    script(&mock);
    let mut registry = AdaptorRegistry::new();
    registry.register(ProviderType::Custom, Arc::new(mock.clone()));

    let usage_log = Arc::new(MemoryUsageLog::new());
    let archive = Arc::new(MemoryArchive::new());
    let relay = Arc::new(
        Relay::builder(config.relay.clone(), ledger.clone(), index.clone(), registry)
            .pass_through(config.adapters.pass_through_request_enabled)
            .channel_store(channel_store.clone())
            .usage_log(usage_log.clone())
            .archive_store(archive.clone())
            .build()?,
    );

    let payer = Payer::limited(user, token).with_token_name("sim");
    let mut requests = JoinSet::new();
    for i in 0..REQUESTS {
        let relay = relay.clone();
        let index = index.clone();
        let payer = payer.clone();
        requests.spawn(async move {
            let body = json!({
                "model": MODEL,
                "max_tokens": 200,
                "messages": [{"role": "user", "content": format!("request number {}", i)}]
            });
            let request = InboundRequest::from_json("/v1/chat/completions", body.to_string());
            let first = index
                .snapshot()
                .candidates("default", MODEL)
                .next()
                .cloned()
                .context("no channel serves the model")?;
            let route = Route::new(Uuid::new_v4().to_string(), payer, "default", MODEL, first);
            Ok::<_, anyhow::Error>(relay.relay(request, route).await)
        });
    }

    let (mut ok, mut failed) = (0usize, 0usize);
    while let Some(joined) = requests.join_next().await {
        match joined?? {
            Ok(response) => {
                ok += 1;
                info!(
                    request_id = %response.summary.request_id,
                    channel_id = response.summary.channel_id,
                    charge = response.summary.charge,
                    attempts = ?response.summary.attempts,
                    "request served"
                );
            }
            Err(e) => {
                failed += 1;
                warn!(status = e.status_code, "request failed: {}", e.message);
            }
        }
    }

    let stream_channel = index.get(4).context("streaming channel missing")?;
    let request = InboundRequest::from_json(
        "/v1/chat/completions",
        json!({"model": MODEL, "stream": true, "messages": []}).to_string(),
    );
    let route = Route::new(
        Uuid::new_v4().to_string(),
        payer.clone(),
        "default",
        MODEL,
        stream_channel,
    );
    let (mut chunks, handle) = relay.stream(request, route);
    let mut streamed = 0usize;
    while let Some(chunk) = chunks.next().await {
        streamed += chunk.len();
    }
    match handle.await? {
        Ok(summary) => info!(bytes = streamed, charge = summary.charge, "stream served"),
        Err(e) => warn!("stream failed: {}", e.message),
    }

    relay.shutdown().await;
    refresher.shutdown().await?;

    let account = balances.user(user).context("sim user missing")?;
    info!(
        ok,
        failed,
        balance = account.quota,
        used_quota = account.used_quota,
        net_user_change = balances.net_change(Account::User(user)),
        open_reservations = ledger.open_reservations(),
        consume_records = usage_log.consumes().len(),
        error_records = usage_log.errors().len(),
        archived = archive.len(),
        attempts = mock.calls().len(),
        "simulation finished"
    );
    for channel in channel_store.load_all().await? {
        info!(channel_id = channel.id, name = %channel.name, status = %channel.status, "channel state");
    }
    Ok(())
}

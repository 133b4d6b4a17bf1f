//! Retry/failover relay loop
//!
//! ```text
//! SELECT_CHANNEL ──> EXECUTE ──> EVALUATE ──┬──> RETURN_SUCCESS
//!       ▲                                   ├──> RETRY ──┐
//!       └───────────────────────────────────┼────────────┘
//!                                           └──> RETURN_FAILURE
//! ```
//!
//! Each attempt reserves quota before the upstream call. The reservation
//! is either settled with the observed usage or refunded on the task pool,
//! including when the attempt future is dropped mid-flight.

use crate::archive::{ArchiveStore, RequestArchiver};
use crate::config::Config;
use crate::context::{InboundRequest, RelayContext, RelayResponse, RelaySummary, Route};
use crate::error::{ClientError, RelayError, Result};
use crate::metrics::Metrics;
use crate::policy::FailoverPolicy;
use crate::reporter::{AutoBanPolicy, ErrorReporter, FailureReport};
use crate::tasks::TaskPool;
use adapters::{
    apply_param_override, estimate_prompt_tokens, AdaptorRegistry, BufferSink, ChannelSink,
    RelayMeta, ResponseSink,
};
use bytes::Bytes;
use channel_index::{Channel, ChannelIndex, ChannelSelector, ChannelStore};
use quota_ledger::{
    ConsumeContext, PriceQuery, QuotaLedger, Reservation, TracingUsageLog, UsageLogSink,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Refunds its reservation on drop unless disarmed
struct ReservationGuard {
    reservation: Option<Reservation>,
    ledger: Arc<QuotaLedger>,
    tasks: TaskPool,
    request_id: String,
}

impl ReservationGuard {
    fn disarm(mut self) -> Option<Reservation> {
        self.reservation.take()
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        let ledger = self.ledger.clone();
        let request_id = std::mem::take(&mut self.request_id);
        self.tasks.submit("refund_reservation", async move {
            let refunded = ledger.refund(reservation).await?;
            debug!(%request_id, refunded, "reservation refunded");
            Ok(())
        });
    }
}

async fn within<T, F>(deadline: Option<Instant>, future: F) -> std::result::Result<T, RelayError>
where
    F: Future<Output = adapters::Result<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future)
            .await
            .map_err(|_| RelayError::deadline())?
            .map_err(RelayError::from_adapter),
        None => future.await.map_err(RelayError::from_adapter),
    }
}

/// Relay orchestrator
pub struct Relay {
    config: Config,
    ledger: Arc<QuotaLedger>,
    selector: ChannelSelector,
    registry: AdaptorRegistry,
    pass_through: bool,
    policy: FailoverPolicy,
    reporter: Arc<ErrorReporter>,
    usage_log: Arc<dyn UsageLogSink>,
    archiver: Option<RequestArchiver>,
    tasks: TaskPool,
    metrics: Metrics,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("retry_times", &self.config.retry_times)
            .field("pass_through", &self.pass_through)
            .field("registry", &self.registry)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Relay`]
pub struct RelayBuilder {
    config: Config,
    ledger: Arc<QuotaLedger>,
    index: Arc<ChannelIndex>,
    registry: AdaptorRegistry,
    pass_through: bool,
    channel_store: Option<Arc<dyn ChannelStore>>,
    usage_log: Option<Arc<dyn UsageLogSink>>,
    archive_store: Option<Arc<dyn ArchiveStore>>,
}

impl std::fmt::Debug for RelayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RelayBuilder {
    /// Forward client bytes without conversion
    pub fn pass_through(mut self, enabled: bool) -> Self {
        self.pass_through = enabled;
        self
    }

    /// Persist auto-ban status changes
    pub fn channel_store(mut self, store: Arc<dyn ChannelStore>) -> Self {
        self.channel_store = Some(store);
        self
    }

    /// Destination for consume and error records
    pub fn usage_log(mut self, usage_log: Arc<dyn UsageLogSink>) -> Self {
        self.usage_log = Some(usage_log);
        self
    }

    /// Destination for archived exchanges
    pub fn archive_store(mut self, store: Arc<dyn ArchiveStore>) -> Self {
        self.archive_store = Some(store);
        self
    }

    /// Build the relay and start its task pool
    pub fn build(self) -> Result<Relay> {
        let metrics = Metrics::new()?;
        let usage_log = self
            .usage_log
            .unwrap_or_else(|| Arc::new(TracingUsageLog));

        let reporter = ErrorReporter::new(
            AutoBanPolicy::new(self.config.auto_ban.clone()),
            self.config.error_log_enabled,
            self.index.clone(),
            self.channel_store,
            usage_log.clone(),
            metrics.auto_bans_total.clone(),
        );

        let archiver = match (self.config.archive_enabled, self.archive_store) {
            (true, Some(store)) => Some(RequestArchiver::new(store)),
            (true, None) => {
                warn!("archiving enabled without an archive store, archiving disabled");
                None
            }
            (false, _) => None,
        };

        let tasks = TaskPool::new(&self.config.task_pool, metrics.task_overflow_total.clone());

        Ok(Relay {
            policy: FailoverPolicy::new(&self.config.bad_request_retry_providers),
            selector: ChannelSelector::new(self.index),
            config: self.config,
            ledger: self.ledger,
            registry: self.registry,
            pass_through: self.pass_through,
            reporter: Arc::new(reporter),
            usage_log,
            archiver,
            tasks,
            metrics,
        })
    }
}

impl Relay {
    /// Start building a relay
    pub fn builder(
        config: Config,
        ledger: Arc<QuotaLedger>,
        index: Arc<ChannelIndex>,
        registry: AdaptorRegistry,
    ) -> RelayBuilder {
        RelayBuilder {
            config,
            ledger,
            index,
            registry,
            pass_through: false,
            channel_store: None,
            usage_log: None,
            archive_store: None,
        }
    }

    /// Relay configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Relay metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Quota ledger
    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// Background task pool
    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    /// Drain pending side effects and stop the pool
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }

    /// Relay with a buffered response
    pub async fn relay(
        &self,
        request: InboundRequest,
        route: Route,
    ) -> std::result::Result<RelayResponse, ClientError> {
        let mut sink = BufferSink::new();
        let summary = self.run(&request, &route, &mut sink).await?;
        let (content_type, body) = sink.into_parts();

        if let Some(archiver) = &self.archiver {
            let archiver = archiver.clone();
            let request_id = summary.request_id.clone();
            let request_body = request.body.clone();
            let response_body = body.clone();
            self.tasks.submit("archive_exchange", async move {
                archiver
                    .archive(&request_id, &request_body, &response_body)
                    .await?;
                Ok(())
            });
        }

        Ok(RelayResponse {
            summary,
            content_type,
            body,
        })
    }

    /// Relay writing chunks to `sender` as they arrive
    ///
    /// Once a chunk has been sent the request is never retried.
    pub async fn relay_stream(
        &self,
        request: InboundRequest,
        route: Route,
        sender: mpsc::Sender<Bytes>,
    ) -> std::result::Result<RelaySummary, ClientError> {
        let mut sink = ChannelSink::new(sender);
        self.run(&request, &route, &mut sink).await
    }

    /// Spawn [`Relay::relay_stream`] and hand back the chunk stream
    pub fn stream(
        self: &Arc<Self>,
        request: InboundRequest,
        route: Route,
    ) -> (
        ReceiverStream<Bytes>,
        JoinHandle<std::result::Result<RelaySummary, ClientError>>,
    ) {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let relay = Arc::clone(self);
        let handle = tokio::spawn(async move { relay.relay_stream(request, route, tx).await });
        (ReceiverStream::new(rx), handle)
    }

    async fn run(
        &self,
        request: &InboundRequest,
        route: &Route,
        sink: &mut dyn ResponseSink,
    ) -> std::result::Result<RelaySummary, ClientError> {
        self.metrics.requests_total.inc();
        let timer = self.metrics.request_duration.start_timer();
        let result = self.run_attempts(request, route, sink).await;
        timer.observe_duration();
        if result.is_err() {
            self.metrics.requests_failed_total.inc();
        }
        result
    }

    fn prepare(
        &self,
        request: &InboundRequest,
        route: &Route,
    ) -> std::result::Result<RelayContext, RelayError> {
        let prompt_tokens = route
            .prompt_tokens
            .unwrap_or_else(|| estimate_prompt_tokens(request.mode(), &request.body));
        let prices = self
            .ledger
            .price(&PriceQuery {
                model: &route.model,
                group: &route.group,
                prompt_tokens,
                max_tokens: request.max_tokens,
            })
            .map_err(RelayError::from_ledger)?;
        let deadline = route.deadline.or_else(|| self.config.request_deadline());
        Ok(RelayContext::new(request, route, prompt_tokens, prices, deadline))
    }

    async fn run_attempts(
        &self,
        request: &InboundRequest,
        route: &Route,
        sink: &mut dyn ResponseSink,
    ) -> std::result::Result<RelaySummary, ClientError> {
        let mut ctx = match self.prepare(request, route) {
            Ok(ctx) => ctx,
            Err(error) => {
                error!(request_id = %route.request_id, error = %error, "relay setup failed");
                return Err(self.client_error(&route.request_id, &error));
            }
        };

        let mut last_error: Option<RelayError> = None;
        for attempt in 0..=self.config.retry_times {
            if ctx.deadline_passed() {
                warn!(request_id = %ctx.request_id, attempt, "request deadline passed");
                last_error.get_or_insert_with(RelayError::deadline);
                break;
            }

            let channel = if attempt == 0 {
                route.channel.clone()
            } else {
                match self
                    .selector
                    .select(&ctx.group, &ctx.origin_model, ctx.used_channels())
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        error!(request_id = %ctx.request_id, error = %e, "failed to get retry channel");
                        last_error = Some(RelayError::local(
                            500,
                            "get_channel_failed",
                            format!("failed to get retry channel: {}", e),
                        ));
                        break;
                    }
                }
            };

            ctx.add_used_channel(channel.id);
            self.metrics.attempts_total.inc();
            if attempt > 0 {
                self.metrics.retries_total.inc();
            }
            sink.reset();

            match self.attempt(&mut ctx, request, &channel, sink).await {
                Ok(summary) => {
                    self.log_trail(&ctx);
                    return Ok(summary);
                }
                Err(error) => {
                    let report = FailureReport::new(&ctx, &channel, error.clone());
                    let reporter = self.reporter.clone();
                    self.tasks.submit("report_channel_error", async move {
                        reporter.report(report).await?;
                        Ok(())
                    });

                    let remaining = self.config.retry_times - attempt;
                    let retry = if sink.committed() {
                        warn!(
                            request_id = %ctx.request_id,
                            channel_id = channel.id,
                            "stream already started, not retrying"
                        );
                        false
                    } else {
                        self.policy
                            .should_retry(&error, channel.provider, ctx.pinned, remaining)
                    };
                    last_error = Some(error);
                    if !retry {
                        break;
                    }
                }
            }
        }

        self.log_trail(&ctx);
        let error = last_error
            .unwrap_or_else(|| RelayError::local(500, "relay_failed", "no channel was attempted"));
        Err(self.client_error(&ctx.request_id, &error))
    }

    async fn attempt(
        &self,
        ctx: &mut RelayContext,
        request: &InboundRequest,
        channel: &Channel,
        sink: &mut dyn ResponseSink,
    ) -> std::result::Result<RelaySummary, RelayError> {
        let meta = RelayMeta::for_channel(channel, &ctx.request_id, &request.path, &ctx.origin_model)
            .with_stream(ctx.is_stream)
            .with_prompt_tokens(ctx.prompt_tokens);
        ctx.upstream_model = meta.upstream_model.clone();

        let reservation = self
            .ledger
            .pre_consume(&ctx.payer, ctx.prices.estimated_quota)
            .await
            .map_err(RelayError::from_ledger)?;
        let guard = ReservationGuard {
            reservation: Some(reservation),
            ledger: self.ledger.clone(),
            tasks: self.tasks.clone(),
            request_id: ctx.request_id.clone(),
        };

        let mut adaptor = self
            .registry
            .resolve(channel.provider)
            .map_err(RelayError::from_adapter)?;
        adaptor.init(&meta);

        let payload = if self.pass_through {
            request.body.clone()
        } else {
            let converted = adaptor
                .convert_request(&meta, &request.body)
                .map_err(RelayError::from_adapter)?;
            apply_param_override(converted, &channel.param_override).map_err(|e| {
                RelayError::local(400, "param_override_failed", e.to_string())
            })?
        };

        debug!(
            request_id = %ctx.request_id,
            channel_id = channel.id,
            adaptor = adaptor.name(),
            upstream_model = %meta.upstream_model,
            "sending to channel"
        );
        let response = within(ctx.deadline(), adaptor.send_request(&meta, payload)).await?;

        if !response.is_success() {
            let error = match ctx.deadline() {
                Some(deadline) => tokio::time::timeout_at(deadline, response.into_upstream_error())
                    .await
                    .map(RelayError::from_adapter)
                    .unwrap_or_else(|_| RelayError::deadline()),
                None => RelayError::from_adapter(response.into_upstream_error().await),
            };
            return Err(map_status(channel, error));
        }

        let usage = within(
            ctx.deadline(),
            adaptor.convert_response(&meta, response, sink),
        )
        .await?;

        let reservation = guard.disarm().ok_or_else(|| {
            RelayError::local(500, "reservation_missing", "reservation already released")
        })?;
        let consume = ConsumeContext {
            request_id: ctx.request_id.clone(),
            channel_id: channel.id,
            model_name: ctx.origin_model.clone(),
            group: ctx.group.clone(),
            is_stream: ctx.is_stream,
            use_time_seconds: i64::try_from(ctx.elapsed().as_secs()).unwrap_or(i64::MAX),
        };

        let charge = match self
            .ledger
            .settle(reservation, &usage, &ctx.prices, &consume)
            .await
        {
            Ok(settlement) => {
                let usage_log = self.usage_log.clone();
                let record = settlement.record;
                self.tasks.submit("record_consume", async move {
                    usage_log.record_consume(record).await?;
                    Ok(())
                });
                settlement.charge
            }
            Err(e) => {
                // a failed settlement is refunded by the ledger, or kept open when
                // even that fails; either way nothing was charged
                error!(request_id = %ctx.request_id, error = %e, "settlement failed");
                0
            }
        };

        Ok(RelaySummary {
            request_id: ctx.request_id.clone(),
            channel_id: channel.id,
            attempts: ctx.used_channels().to_vec(),
            usage,
            charge,
        })
    }

    fn log_trail(&self, ctx: &RelayContext) {
        if ctx.used_channels().len() > 1 {
            info!(request_id = %ctx.request_id, "retry: {}", ctx.retry_trail());
        }
    }

    fn client_error(&self, request_id: &str, error: &RelayError) -> ClientError {
        if error.status_code() == 429 {
            error!(request_id, "origin 429 error: {}", error.message());
        }
        ClientError::from_relay(error, request_id)
    }
}

fn map_status(channel: &Channel, error: RelayError) -> RelayError {
    match error {
        RelayError::Upstream {
            status_code,
            message,
            error_type,
            code,
        } => RelayError::Upstream {
            status_code: channel.map_status(status_code),
            message,
            error_type,
            code,
        },
        other => other,
    }
}

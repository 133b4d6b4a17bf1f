//! Reserve / settle / refund
//!
//! Every request that reaches an upstream passes through exactly one
//! reservation, closed by exactly one of [`QuotaLedger::settle`] or
//! [`QuotaLedger::refund`]. The open table enforces the "exactly one"
//! part even if two tasks race on the same reservation ID.
//!
//! Balance writes run on spawned tasks, so dropping the caller's future
//! never stops one halfway. A debit nobody is waiting for any more is
//! returned on the spot, and a settlement whose balance adjustment fails
//! falls back to a refund.

use crate::audit::ConsumeLogRecord;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pricing::{PriceQuery, PriceSnapshot};
use crate::store::BalanceStore;
use crate::types::{ConsumeContext, Payer, Quota, Reservation, Settlement, Usage};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};
use uuid::Uuid;

/// Quota ledger
pub struct QuotaLedger {
    config: Config,
    books: Arc<Books>,
}

/// State shared with the spawned balance writers
struct Books {
    store: Arc<dyn BalanceStore>,
    open: DashMap<Uuid, Quota>,
    metrics: Metrics,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("open_reservations", &self.books.open.len())
            .finish()
    }
}

impl QuotaLedger {
    /// Create a ledger over a balance store
    pub fn new(config: Config, store: Arc<dyn BalanceStore>) -> Result<Self> {
        Ok(Self {
            config,
            books: Arc::new(Books {
                store,
                open: DashMap::new(),
                metrics: Metrics::new()?,
            }),
        })
    }

    /// Ledger configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ledger metrics
    pub fn metrics(&self) -> &Metrics {
        &self.books.metrics
    }

    /// Resolve prices for a request
    pub fn price(&self, query: &PriceQuery<'_>) -> Result<PriceSnapshot> {
        self.config.prices.resolve(query, &self.config)
    }

    /// Reservations not yet settled or refunded
    pub fn open_reservations(&self) -> usize {
        self.books.open.len()
    }

    /// Whether a reservation is still open
    pub fn is_open(&self, id: Uuid) -> bool {
        self.books.open.contains_key(&id)
    }

    /// Reserve `estimate` against the payer
    ///
    /// Fails when the user balance is empty or cannot cover the estimate.
    /// When the balance (and the token's allotment, unless unlimited)
    /// exceeds `trust_multiplier` times the estimate, nothing is debited.
    #[instrument(skip(self, payer), fields(user = %payer.user_id, token = %payer.token_id))]
    pub async fn pre_consume(&self, payer: &Payer, estimate: Quota) -> Result<Reservation> {
        let estimate = estimate.max(0);
        let store = &self.books.store;
        let user_quota = store.user_quota(payer.user_id).await?;

        if user_quota <= 0 || user_quota - estimate < 0 {
            return Err(Error::InsufficientUserQuota {
                available: user_quota,
                required: estimate,
            });
        }

        let threshold = estimate.saturating_mul(self.config.trust_multiplier);
        let mut amount = estimate;
        if user_quota > threshold {
            if payer.token_unlimited {
                amount = 0;
                info!(user_quota, "user has enough quota and an unlimited token, trusted");
            } else {
                let token_quota = store.token_quota(payer.token_id).await?;
                if token_quota > threshold {
                    amount = 0;
                    info!(user_quota, token_quota, "user and token have enough quota, trusted");
                }
            }
        }

        if amount == 0 {
            return Ok(self.books.register(payer.clone(), 0, user_quota));
        }

        // debit and registration finish even if this future is dropped
        let (tx, rx) = oneshot::channel();
        let books = self.books.clone();
        let payer = payer.clone();
        tokio::spawn(
            async move {
                let result = match books.debit(&payer, amount).await {
                    Ok(()) => Ok(books.register(payer, amount, user_quota)),
                    Err(err) => Err(err),
                };
                if let Err(Ok(orphan)) = tx.send(result) {
                    warn!(reservation = %orphan.id(), "reservation abandoned by its caller, refunding");
                    if let Err(err) = books.refund(orphan).await {
                        error!(error = %err, "failed to refund abandoned reservation");
                    }
                }
            }
            .instrument(Span::current()),
        );

        rx.await
            .map_err(|_| Error::Storage("reservation task ended without a result".to_string()))?
    }

    /// Close a reservation with the observed usage
    ///
    /// Applies `charge - reserved` to the balances, updates usage counters
    /// and returns the audit record. A zero-token usage charges nothing and
    /// leaves the counters untouched.
    ///
    /// If the user balance cannot be adjusted the reservation is refunded
    /// instead, or left open when the refund fails too, and the error is
    /// returned. Counter and token failures after that point are logged.
    #[instrument(skip_all, fields(reservation = %reservation.id(), request_id = %ctx.request_id))]
    pub async fn settle(
        &self,
        reservation: Reservation,
        usage: &Usage,
        prices: &PriceSnapshot,
        ctx: &ConsumeContext,
    ) -> Result<Settlement> {
        let books = self.books.clone();
        let (usage, prices, ctx) = (usage.clone(), prices.clone(), ctx.clone());
        tokio::spawn(
            async move { books.settle(reservation, &usage, &prices, &ctx).await }
                .instrument(Span::current()),
        )
        .await
        .map_err(|e| Error::Storage(format!("settlement task failed: {}", e)))?
    }

    /// Return the full reserved amount; returns the refunded amount
    #[instrument(skip_all, fields(reservation = %reservation.id()))]
    pub async fn refund(&self, reservation: Reservation) -> Result<Quota> {
        let books = self.books.clone();
        tokio::spawn(async move { books.refund(reservation).await }.instrument(Span::current()))
            .await
            .map_err(|e| Error::Storage(format!("refund task failed: {}", e)))?
    }
}

impl Books {
    async fn debit(&self, payer: &Payer, amount: Quota) -> Result<()> {
        if !payer.token_unlimited {
            self.store.try_debit_token(payer.token_id, amount).await?;
        }
        if let Err(err) = self.store.try_debit_user(payer.user_id, amount).await {
            if !payer.token_unlimited {
                if let Err(undo) = self.store.adjust_token(payer.token_id, amount).await {
                    error!(error = %undo, "failed to return token quota after user debit failed");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn register(&self, payer: Payer, amount: Quota, user_quota: Quota) -> Reservation {
        let reservation = Reservation::new(payer, amount, user_quota);
        self.open.insert(reservation.id(), amount);
        self.metrics.record_reservation(amount == 0);
        debug!(reservation = %reservation.id(), amount, "quota reserved");
        reservation
    }

    async fn settle(
        &self,
        reservation: Reservation,
        usage: &Usage,
        prices: &PriceSnapshot,
        ctx: &ConsumeContext,
    ) -> Result<Settlement> {
        let reserved = self.close(reservation.id())?;
        let payer = reservation.payer();
        let breakdown = prices.charge(usage);
        let charge = breakdown.quota;
        let delta = charge - reserved;

        // the user balance is the commit point
        if delta != 0 {
            if let Err(err) = self.store.adjust_user(payer.user_id, -delta).await {
                error!(error = %err, charge, reserved, "failed to apply settlement");
                self.restore(&reservation, reserved).await;
                return Err(err);
            }
            if !payer.token_unlimited {
                if let Err(err) = self.store.adjust_token(payer.token_id, -delta).await {
                    error!(error = %err, token = %payer.token_id, delta, "failed to apply settlement to token");
                }
            }
        }

        if breakdown.probable_upstream_error {
            error!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                model_ratio = %prices.model_ratio,
                "total tokens is 0, cannot consume quota, probable upstream error"
            );
        } else {
            if let Err(err) = self.store.record_user_usage(payer.user_id, charge).await {
                error!(error = %err, charge, "failed to record user usage");
            }
            if let Err(err) = self.store.record_channel_usage(ctx.channel_id, charge).await {
                error!(error = %err, channel_id = ctx.channel_id, charge, "failed to record channel usage");
            }
        }

        self.metrics
            .record_settlement(charge, breakdown.probable_upstream_error);

        let record = ConsumeLogRecord {
            request_id: ctx.request_id.clone(),
            user_id: payer.user_id,
            token_id: payer.token_id,
            token_name: payer.token_name.clone(),
            channel_id: ctx.channel_id,
            model_name: ctx.model_name.clone(),
            group: ctx.group.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: charge,
            content: breakdown.summary.clone(),
            use_time_seconds: ctx.use_time_seconds,
            is_stream: ctx.is_stream,
            other: serde_json::json!({
                "model_ratio": prices.model_ratio,
                "group_ratio": prices.group_ratio,
                "completion_ratio": prices.completion_ratio,
                "cache_ratio": prices.cache_ratio,
                "model_price": prices.model_price,
                "cached_tokens": usage.prompt_tokens_details.cached_tokens,
                "web_search_quota": breakdown.web_search_quota,
                "file_search_quota": breakdown.file_search_quota,
                "audio_input_quota": breakdown.audio_input_quota,
                "user_quota": reservation.user_quota(),
            }),
            created_at: Utc::now(),
        };

        info!(charge, reserved, delta, "quota settled");
        Ok(Settlement {
            reservation_id: reservation.id(),
            charge,
            reserved,
            delta,
            probable_upstream_error: breakdown.probable_upstream_error,
            record,
        })
    }

    async fn refund(&self, reservation: Reservation) -> Result<Quota> {
        let reserved = self.close(reservation.id())?;
        if let Err(err) = self.give_back(reservation.payer(), reserved).await {
            self.open.insert(reservation.id(), reserved);
            return Err(err);
        }

        self.metrics.record_refund();
        debug!(reserved, "reservation refunded");
        Ok(reserved)
    }

    /// Refund a reservation whose settlement could not be applied
    async fn restore(&self, reservation: &Reservation, reserved: Quota) {
        match self.give_back(reservation.payer(), reserved).await {
            Ok(()) => {
                self.metrics.record_refund();
                warn!(reserved, "settlement failed, reservation refunded");
            }
            Err(err) => {
                self.open.insert(reservation.id(), reserved);
                error!(error = %err, reserved, "settlement and refund failed, reservation left open");
            }
        }
    }

    async fn give_back(&self, payer: &Payer, reserved: Quota) -> Result<()> {
        if reserved == 0 {
            return Ok(());
        }
        self.store.adjust_user(payer.user_id, reserved).await?;
        if !payer.token_unlimited {
            if let Err(err) = self.store.adjust_token(payer.token_id, reserved).await {
                error!(error = %err, token = %payer.token_id, reserved, "failed to return token quota");
            }
        }
        Ok(())
    }

    fn close(&self, id: Uuid) -> Result<Quota> {
        match self.open.remove(&id) {
            Some((_, amount)) => Ok(amount),
            None => {
                warn!(reservation = %id, "reservation already closed");
                Err(Error::ReservationClosed(id))
            }
        }
    }
}

//! Quota Ledger
//!
//! Pre-paid quota accounting for the relay: reserve an estimate before the
//! upstream call, then settle against observed usage or refund on failure.
//!
//! # Architecture
//!
//! ```text
//!  PriceTable ──resolve──> PriceSnapshot (fixed per request)
//!                                │
//!  pre_consume ──> Reservation ──┼──> settle(usage) ──> Settlement + ConsumeLogRecord
//!                                └──> refund()
//!                    │
//!                    └── BalanceStore (user balance, token allotment, usage counters)
//! ```
//!
//! # Invariants
//!
//! - A reservation is closed exactly once (settle or refund, never both)
//! - Net balance change of a request equals its final charge
//! - Zero upstream tokens means zero charge
//! - A positive charge that rounds to zero costs one unit

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod pricing;
pub mod store;
pub mod types;

// Re-exports
pub use audit::{ConsumeLogRecord, ErrorLogRecord, MemoryUsageLog, TracingUsageLog, UsageLogSink};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::QuotaLedger;
pub use pricing::{ChargeBreakdown, PriceQuery, PriceSnapshot, PriceTable};
pub use store::{Account, BalanceMutation, BalanceStore, MemoryBalanceStore, UserAccount};
pub use types::{
    BuiltInTool, CompletionTokensDetails, ConsumeContext, Payer, PromptTokensDetails, Quota,
    Reservation, Settlement, TokenId, ToolUsage, Usage, UserId,
};

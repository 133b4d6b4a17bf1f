//! Relay
//!
//! Routes one client request across upstream channels with bounded
//! failover, metering usage against the quota ledger.
//!
//! # Architecture
//!
//! ```text
//!  InboundRequest + Route
//!          │
//!          ▼
//!  ┌───────────────┐  select(excluded)  ┌────────────────┐
//!  │     Relay     │───────────────────>│ ChannelSelector│
//!  │ (retry loop)  │                    └────────────────┘
//!  │               │  pre_consume / settle / refund
//!  │               │───────────────────> QuotaLedger
//!  │               │  resolve(provider)
//!  │               │───────────────────> AdaptorRegistry ──> upstream
//!  └──────┬────────┘
//!         │ submit (never awaited)
//!         ▼
//!  ┌───────────────┐
//!  │   TaskPool    │──> ErrorReporter / AutoBan, refunds, usage log, archive
//!  └───────────────┘
//! ```
//!
//! # Invariants
//!
//! - At most `retry_times + 1` attempts; no channel is attempted twice
//! - Every reservation is settled or refunded exactly once
//! - A stream that has sent bytes to the client is never retried
//! - Local and billing errors are never retried

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod reporter;
pub mod tasks;

pub use archive::{ArchiveStore, MemoryArchive, RequestArchiver};
pub use config::{AutoBanConfig, Config, GatewayConfig, TaskPoolConfig};
pub use context::{InboundRequest, RelayContext, RelayResponse, RelaySummary, Route};
pub use error::{ClientError, Error, ErrorFormat, RelayError, Result, SATURATED_MESSAGE};
pub use metrics::Metrics;
pub use orchestrator::{Relay, RelayBuilder};
pub use policy::FailoverPolicy;
pub use reporter::{AutoBanPolicy, ErrorReporter, FailureReport};
pub use tasks::TaskPool;

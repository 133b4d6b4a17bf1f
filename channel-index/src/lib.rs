//! Channel Index
//!
//! Versioned, lock-free view of the upstream channels the relay can route to.
//!
//! # Architecture
//!
//! ```text
//!  ChannelStore ──load_all──> CacheRefresher ──replace_all──┐
//!                                                          ▼
//!  auto-ban ──disable──────────────────────────────> ChannelIndex (ArcSwap<ChannelSnapshot>)
//!                                                          │ load()
//!                                                          ▼
//!                                              ChannelSelector::select(group, model, excluded)
//! ```
//!
//! # Invariants
//!
//! - Readers always see a complete snapshot; writers never block readers
//! - Snapshot versions strictly increase
//! - Only enabled channels are ever selected; excluded IDs are never returned

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod index;
pub mod refresh;
pub mod selector;
pub mod store;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use index::{ChannelIndex, ChannelSnapshot};
pub use refresh::{reload, CacheRefresher};
pub use selector::ChannelSelector;
pub use store::{ChannelStore, MemoryChannelStore, StatusChange};
pub use types::{Channel, ChannelId, ChannelStatus, ProviderType};

//! # Relay Adapters
//!
//! Provider connectivity for the relay:
//! - Request conversion to each provider's wire format
//! - Buffered and streamed response forwarding
//! - Usage extraction (reported or estimated)
//! - Structured upstream error parsing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        AdaptorRegistry (ProviderType → factory)     │
//! └────────────┬────────────────────────────────────────┘
//!              │ create() per attempt
//!     ┌────────┼────────────────┬────────────┐
//!     │        │                │            │
//! ┌───▼────┐ ┌─▼──────┐ ┌──────▼──┐ ┌───────▼──────┐
//! │ OpenAI │ │ Azure  │ │DeepSeek │ │ Mock (tests) │
//! │        │ │        │ │ Ollama  │ │              │
//! └───┬────┘ └─┬──────┘ └──────┬──┘ └───────┬──────┘
//!     │        │                │            │
//!     └────────┼────────────────┴────────────┘
//!              │
//! ┌────────────▼─────────────────────────────────────┐
//! │     ResponseSink (BufferSink / ChannelSink)      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! - Non-2xx responses are never forwarded; they become [`Error::Upstream`]
//! - A sink that has committed bytes cannot be rewound

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod adaptor;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod openai;
pub mod registry;
pub mod sink;
pub mod types;
pub mod usage;

pub use adaptor::{apply_param_override, Adaptor, AdaptorFactory};
pub use config::Config;
pub use error::{Error, Result};
pub use mock::{MockAdaptorFactory, MockCall, MockOutcome};
pub use openai::OpenAiAdaptorFactory;
pub use registry::AdaptorRegistry;
pub use sink::{BufferSink, ChannelSink, ResponseSink};
pub use types::{RawResponse, RelayMeta, RelayMode};
pub use usage::{estimate_prompt_tokens, estimate_tokens};

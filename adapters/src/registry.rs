//! Provider to adaptor lookup

use crate::adaptor::{Adaptor, AdaptorFactory};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::openai::OpenAiAdaptorFactory;
use channel_index::ProviderType;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Maps provider families to adaptor factories
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    factories: HashMap<ProviderType, Arc<dyn AdaptorFactory>>,
}

impl fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.factories.keys().map(ProviderType::as_str).collect();
        providers.sort_unstable();
        f.debug_struct("AdaptorRegistry")
            .field("providers", &providers)
            .finish()
    }
}

impl AdaptorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the OpenAI-compatible adaptor for every provider
    /// that speaks that wire format
    pub fn with_defaults(config: &Config) -> Result<Self> {
        let openai: Arc<dyn AdaptorFactory> = Arc::new(OpenAiAdaptorFactory::new(config.clone())?);
        let mut registry = Self::new();
        for provider in [
            ProviderType::OpenAi,
            ProviderType::Azure,
            ProviderType::DeepSeek,
            ProviderType::Ollama,
            ProviderType::Custom,
        ] {
            registry.register(provider, openai.clone());
        }
        Ok(registry)
    }

    /// Register (or replace) a factory
    pub fn register(&mut self, provider: ProviderType, factory: Arc<dyn AdaptorFactory>) {
        self.factories.insert(provider, factory);
    }

    /// Whether the provider has an adaptor
    pub fn supports(&self, provider: ProviderType) -> bool {
        self.factories.contains_key(&provider)
    }

    /// Fresh adaptor for one attempt
    pub fn resolve(&self, provider: ProviderType) -> Result<Box<dyn Adaptor>> {
        self.factories
            .get(&provider)
            .map(|factory| factory.create())
            .ok_or_else(|| Error::UnsupportedProvider(provider.to_string()))
    }
}

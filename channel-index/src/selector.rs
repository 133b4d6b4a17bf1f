//! Weighted channel selection for retries

use crate::error::{Error, Result};
use crate::index::ChannelIndex;
use crate::types::{Channel, ChannelId};
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

/// Picks a channel for (group, model) from the current snapshot
#[derive(Debug, Clone)]
pub struct ChannelSelector {
    index: Arc<ChannelIndex>,
}

impl ChannelSelector {
    /// Create a selector over an index
    pub fn new(index: Arc<ChannelIndex>) -> Self {
        Self { index }
    }

    /// Underlying index
    pub fn index(&self) -> &Arc<ChannelIndex> {
        &self.index
    }

    /// Select an enabled channel not in `excluded`
    pub fn select(&self, group: &str, model: &str, excluded: &[ChannelId]) -> Result<Arc<Channel>> {
        self.select_with_rng(group, model, excluded, &mut rand::thread_rng())
    }

    /// Select with a caller-supplied RNG
    ///
    /// Weight is the channel priority; if every candidate weighs zero the
    /// pick is uniform.
    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        group: &str,
        model: &str,
        excluded: &[ChannelId],
        rng: &mut R,
    ) -> Result<Arc<Channel>> {
        let snapshot = self.index.snapshot();
        let candidates: Vec<&Arc<Channel>> = snapshot
            .candidates(group, model)
            .filter(|c| !excluded.contains(&c.id))
            .collect();

        let no_channel = || Error::NoSatisfiedChannel {
            group: group.to_string(),
            model: model.to_string(),
        };

        let chosen = match WeightedIndex::new(candidates.iter().map(|c| c.priority)) {
            Ok(dist) => candidates[dist.sample(rng)],
            Err(_) => candidates.choose(rng).copied().ok_or_else(no_channel)?,
        };

        debug!(
            channel_id = chosen.id,
            candidates = candidates.len(),
            version = snapshot.version(),
            "channel selected"
        );
        Ok(chosen.clone())
    }
}

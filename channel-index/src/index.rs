//! Versioned channel snapshot
//!
//! Readers `load()` the current [`ChannelSnapshot`] without locking and keep
//! their `Arc` for as long as they need it. Writers take the writer mutex,
//! build a complete replacement and publish it with a single `store`.

use crate::error::{Error, Result};
use crate::types::{Channel, ChannelId, ChannelStatus};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Immutable view of every channel plus the ability map
#[derive(Debug, Default)]
pub struct ChannelSnapshot {
    version: u64,
    channels: HashMap<ChannelId, Arc<Channel>>,
    abilities: HashMap<(String, String), Vec<ChannelId>>,
}

impl ChannelSnapshot {
    fn build(version: u64, channels: impl IntoIterator<Item = Arc<Channel>>) -> Self {
        let mut by_id = HashMap::new();
        let mut abilities: HashMap<(String, String), Vec<ChannelId>> = HashMap::new();

        for channel in channels {
            if channel.is_enabled() {
                for group in &channel.groups {
                    for model in &channel.models {
                        abilities
                            .entry((group.clone(), model.clone()))
                            .or_default()
                            .push(channel.id);
                    }
                }
            }
            by_id.insert(channel.id, channel);
        }

        // Deterministic candidate order for seeded selection
        for ids in abilities.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }

        Self {
            version,
            channels: by_id,
            abilities,
        }
    }

    /// Publish version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of channels (any status)
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the snapshot holds no channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel by ID (any status)
    pub fn get(&self, id: ChannelId) -> Option<&Arc<Channel>> {
        self.channels.get(&id)
    }

    /// Enabled channels serving (group, model), in ID order
    pub fn candidates<'a>(
        &'a self,
        group: &str,
        model: &str,
    ) -> impl Iterator<Item = &'a Arc<Channel>> + 'a {
        self.abilities
            .get(&(group.to_string(), model.to_string()))
            .into_iter()
            .flatten()
            .filter_map(move |id| self.channels.get(id))
    }

    /// All channels (any status)
    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }
}

/// Atomically swapped channel snapshot
#[derive(Debug)]
pub struct ChannelIndex {
    current: ArcSwap<ChannelSnapshot>,
    writer: Mutex<()>,
}

impl Default for ChannelIndex {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ChannelIndex {
    /// Create an index at version 1
    pub fn new(channels: Vec<Channel>) -> Self {
        let snapshot = ChannelSnapshot::build(1, channels.into_iter().map(Arc::new));
        Self {
            current: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.current.load_full()
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Channel by ID from the current snapshot
    pub fn get(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.current.load().get(id).cloned()
    }

    /// Replace every channel; returns the new version
    pub fn replace_all(&self, channels: Vec<Channel>) -> u64 {
        let _guard = self.writer.lock();
        let version = self.current.load().version + 1;
        let count = channels.len();
        let snapshot = ChannelSnapshot::build(version, channels.into_iter().map(Arc::new));
        self.current.store(Arc::new(snapshot));
        debug!(version, channels = count, "channel snapshot published");
        version
    }

    /// Change one channel's status; returns the new version
    pub fn set_status(&self, id: ChannelId, status: ChannelStatus) -> Result<u64> {
        let _guard = self.writer.lock();
        let current = self.current.load_full();
        let existing = current.get(id).ok_or(Error::ChannelNotFound(id))?;
        if existing.status == status {
            return Ok(current.version);
        }

        let mut updated = Channel::clone(existing);
        updated.status = status;
        let updated = Arc::new(updated);

        let version = current.version + 1;
        let channels = current
            .channels()
            .map(|c| if c.id == id { updated.clone() } else { c.clone() })
            .collect::<Vec<_>>();
        self.current
            .store(Arc::new(ChannelSnapshot::build(version, channels)));

        info!(channel_id = id, %status, version, "channel status changed");
        Ok(version)
    }

    /// Take a channel out of rotation
    pub fn disable(&self, id: ChannelId, status: ChannelStatus) -> Result<u64> {
        self.set_status(id, status)
    }
}

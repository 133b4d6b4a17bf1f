//! Channel persistence seam

use crate::error::{Error, Result};
use crate::types::{Channel, ChannelId, ChannelStatus};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Source of channel rows
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Every channel, any status
    async fn load_all(&self) -> Result<Vec<Channel>>;

    /// Persist a status change
    async fn update_status(&self, id: ChannelId, status: ChannelStatus, reason: &str) -> Result<()>;
}

/// Recorded status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Channel
    pub id: ChannelId,
    /// New status
    pub status: ChannelStatus,
    /// Why
    pub reason: String,
}

/// In-memory channel table
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    rows: RwLock<BTreeMap<ChannelId, Channel>>,
    changes: Mutex<Vec<StatusChange>>,
    unavailable: AtomicBool,
}

impl MemoryChannelStore {
    /// Store seeded with rows
    pub fn new(channels: Vec<Channel>) -> Self {
        let store = Self::default();
        {
            let mut rows = store.rows.write();
            for channel in channels {
                rows.insert(channel.id, channel);
            }
        }
        store
    }

    /// Insert or replace a row
    pub fn upsert(&self, channel: Channel) {
        self.rows.write().insert(channel.id, channel);
    }

    /// Remove a row
    pub fn remove(&self, id: ChannelId) -> Option<Channel> {
        self.rows.write().remove(&id)
    }

    /// Row by ID
    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.rows.read().get(&id).cloned()
    }

    /// Status changes persisted so far
    pub fn status_changes(&self) -> Vec<StatusChange> {
        self.changes.lock().clone()
    }

    /// Make subsequent loads fail (outage simulation)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Store("channel store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn load_all(&self) -> Result<Vec<Channel>> {
        self.check_available()?;
        Ok(self.rows.read().values().cloned().collect())
    }

    async fn update_status(&self, id: ChannelId, status: ChannelStatus, reason: &str) -> Result<()> {
        self.check_available()?;
        {
            let mut rows = self.rows.write();
            let row = rows.get_mut(&id).ok_or(Error::ChannelNotFound(id))?;
            row.status = status;
        }
        self.changes.lock().push(StatusChange {
            id,
            status,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

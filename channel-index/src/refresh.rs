//! Periodic snapshot reload
//!
//! The refresher is a small actor: a mailbox for explicit invalidations
//! and shutdown, plus a ticker for the periodic reload. A failed reload
//! keeps the previous snapshot.

use crate::error::{Error, Result};
use crate::index::ChannelIndex;
use crate::store::ChannelStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Reload the index from the store once; returns the published version
pub async fn reload(index: &ChannelIndex, store: &dyn ChannelStore) -> Result<u64> {
    let channels = store.load_all().await?;
    let count = channels.len();
    let version = index.replace_all(channels);
    debug!(version, channels = count, "channel cache reloaded");
    Ok(version)
}

enum RefreshMessage {
    Invalidate {
        response: oneshot::Sender<Result<u64>>,
    },
    Shutdown,
}

/// Handle to the background refresh task
#[derive(Debug)]
pub struct CacheRefresher {
    mailbox: mpsc::Sender<RefreshMessage>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for RefreshMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshMessage::Invalidate { .. } => f.write_str("Invalidate"),
            RefreshMessage::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl CacheRefresher {
    /// Spawn the refresh loop
    pub fn spawn(
        index: Arc<ChannelIndex>,
        store: Arc<dyn ChannelStore>,
        every: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run(index, store, every, rx));
        info!(interval_secs = every.as_secs(), "channel cache refresher started");
        Self {
            mailbox: tx,
            handle,
        }
    }

    /// Reload now; resolves once the new snapshot is published
    pub async fn invalidate(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(RefreshMessage::Invalidate { response: tx })
            .await
            .map_err(|_| Error::RefresherStopped)?;
        rx.await.map_err(|_| Error::RefresherStopped)?
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        // A closed mailbox means the loop already exited.
        let _ = self.mailbox.send(RefreshMessage::Shutdown).await;
        self.handle
            .await
            .map_err(|e| Error::Store(format!("refresher task failed: {}", e)))
    }
}

async fn run(
    index: Arc<ChannelIndex>,
    store: Arc<dyn ChannelStore>,
    every: Duration,
    mut mailbox: mpsc::Receiver<RefreshMessage>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately; the index is already populated
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = mailbox.recv() => {
                match msg {
                    Some(RefreshMessage::Invalidate { response }) => {
                        let result = reload(&index, store.as_ref()).await;
                        if let Err(e) = &result {
                            error!(error = %e, "channel cache reload failed, keeping previous snapshot");
                        }
                        let _ = response.send(result);
                    }
                    // Shutdown requested, or every handle dropped
                    Some(RefreshMessage::Shutdown) | None => break,
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = reload(&index, store.as_ref()).await {
                    error!(error = %e, "channel cache reload failed, keeping previous snapshot");
                }
            }
        }
    }

    info!("channel cache refresher stopped");
}

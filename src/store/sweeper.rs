//! Periodic expiry sweeper
//!
//! Expired records already behave as absent on read; the sweeper exists to
//! reclaim their memory. It ticks at a configurable interval, invokes
//! [`IdempotencyStore::cleanup_expired`], and is stopped and drained during
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::IdempotencyStore;

/// Handle to the background sweep task.
pub struct Sweeper {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Sweeper {
    /// Spawn a sweep task that runs `cleanup_expired` every `interval`.
    ///
    /// The first sweep happens one full interval after spawn.
    #[must_use]
    pub fn spawn(store: Arc<dyn IdempotencyStore>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval fires immediately on the first tick; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.cleanup_expired(Utc::now()).await {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed, "Expiry sweep reclaimed records"),
                            Err(e) => warn!(error = %e, "Expiry sweep failed"),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("Expiry sweeper stopped");
        });
        Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Stop the sweep task and wait for it to drain.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sweeper task did not shut down cleanly");
        }
    }
}

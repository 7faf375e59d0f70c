use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::metrics::QUEUE_SYNC_WORKER_TICKS_TOTAL;
use crate::models::progress::SyncResult;
use crate::services::offline_queue::OfflineQueue;
use crate::services::progress_store::{apply_queued_write, ProgressStore};

/// Periodically drains the offline queue into the progress store.
pub struct QueueSyncWorker {
    queue: Arc<OfflineQueue>,
    store: Arc<dyn ProgressStore>,
    interval: Duration,
}

impl QueueSyncWorker {
    pub fn new(queue: Arc<OfflineQueue>, store: Arc<dyn ProgressStore>, interval: Duration) -> Self {
        Self {
            queue,
            store,
            interval,
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting queue sync worker loop (interval {}s)",
            self.interval.as_secs()
        );

        loop {
            match self.run_once().await {
                Ok(results) => {
                    QUEUE_SYNC_WORKER_TICKS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    let failed = results.iter().filter(|r| !r.success).count();
                    if failed > 0 {
                        warn!(processed = results.len(), failed, "Queue sync tick left failed writes");
                    } else {
                        debug!(processed = results.len(), "Queue sync tick completed");
                    }
                }
                Err(err) => {
                    QUEUE_SYNC_WORKER_TICKS_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    warn!(error = %err, "Queue sync tick failed");
                }
            }

            sleep(self.interval).await;
        }
    }

    pub async fn run_once(&self) -> Result<Vec<SyncResult>> {
        // reads the shared storage, not a local copy
        if self
            .queue
            .is_empty()
            .await
            .context("Failed to read offline queue")?
        {
            return Ok(Vec::new());
        }

        let store = self.store.clone();
        self.queue
            .sync(|payload| apply_queued_write(store.clone(), payload))
            .await
            .context("Failed to sync offline queue")
    }
}

//! Stale job reaper.
//!
//! A worker that dies mid-job leaves its row `running` forever. The reaper
//! periodically returns `running` rows with an old `last_ping` to `pending`
//! so any instance can pick them up again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job_store::{JobStore, JobStoreError};

pub struct Reaper {
    store: Arc<dyn JobStore>,
    every: Duration,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, every: Duration, stale_after: Duration) -> Self {
        Self {
            store,
            every,
            stale_after,
        }
    }

    /// Requeue every row whose last ping is older than `stale_after`.
    pub async fn sweep(&self) -> Result<u64, JobStoreError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        self.store.requeue_stale(Utc::now() - stale_after).await
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so a restarting
            // fleet does not requeue jobs before their owners ping again.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match self.sweep().await {
                        Ok(0) => {}
                        Ok(requeued) => info!(requeued, "requeued stale jobs"),
                        Err(err) => warn!(error = %err, "stale job sweep failed"),
                    },
                }
            }
            debug!("reaper stopped");
        })
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;

use courier_core::JobId;

use crate::job_store::JobStore;

/// Periodic `last_ping` writer for one claimed job.
///
/// Started when the job is claimed, so rows buffered for a busy pool stay
/// fresh too. The claim itself stamps `last_ping`; the first periodic ping
/// follows one interval later. Every write goes through a single task, so
/// pings for one job never overlap.
///
/// Dropping the heartbeat cancels it; [`stop`](Self::stop) also waits for the
/// ticker to exit so no ping lands after the job's final status write. The
/// ticker ends on its own once a ping reports the row is no longer ours.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    beats: mpsc::Sender<oneshot::Sender<bool>>,
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub(crate) fn spawn(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        claimant: Arc<str>,
        every: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let (beats, mut requests) = mpsc::channel::<oneshot::Sender<bool>>(1);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    Some(reply) = requests.recv() => {
                        let owned = ping(store.as_ref(), job_id, &claimant).await;
                        ticker.reset();
                        let _ = reply.send(owned);
                        if !owned {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !ping(store.as_ref(), job_id, &claimant).await {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            beats,
            guard: token.drop_guard(),
            task,
        }
    }

    /// Ping now and wait for the write.
    ///
    /// Returns `false` once the row is no longer held by this claimant.
    pub(crate) async fn beat(&self) -> bool {
        let (reply, owned) = oneshot::channel();
        if self.beats.send(reply).await.is_err() {
            return false;
        }
        owned.await.unwrap_or(false)
    }

    pub(crate) async fn stop(self) {
        let Heartbeat { beats, guard, task } = self;
        drop(beats);
        drop(guard);
        let _ = task.await;
    }
}

/// One ping. A store error keeps the heartbeat going; only a lost row stops it.
async fn ping(store: &dyn JobStore, job_id: JobId, claimant: &str) -> bool {
    match store.update_ping(job_id, claimant, Utc::now()).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(job_id = %job_id, claimant, "job no longer owned, heartbeat stopped");
            false
        }
        Err(err) => {
            warn!(job_id = %job_id, error = %err, "heartbeat ping failed");
            true
        }
    }
}

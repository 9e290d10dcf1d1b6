//! Claims pending jobs and routes them to per-type processor pools.
//!
//! The poller is a single task that owns the routing table and the pending
//! counter. It is woken two ways:
//!
//! - **push**: one wake token per change notification
//! - **catch-up**: a periodic count of pending rows that corrects the counter
//!   for dropped or spurious tokens
//!
//! Wakes accumulate until either `prefetch_threshold` is reached (claim now)
//! or the flush interval elapses (claim whatever is pending).
//!
//! Every routed job gets its heartbeat here, at claim time, so a row waiting
//! behind a busy pool keeps its `last_ping` fresh and is not mistaken for an
//! abandoned one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use courier_core::{JobRecord, JobStatus};

use super::heartbeat::Heartbeat;
use super::processor::ClaimedJob;
use crate::job_store::JobStore;

/// A job type's claimed-job channel, registered with the poller.
#[derive(Debug)]
pub(crate) struct Route {
    pub(crate) name: String,
    pub(crate) jobs: mpsc::Sender<ClaimedJob>,
}

/// Pending-wake accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WakeState {
    pending: usize,
    capacity: usize,
    threshold: usize,
}

impl WakeState {
    pub(crate) fn new(threshold: usize, capacity: usize) -> Self {
        Self {
            pending: 0,
            capacity: capacity.max(1),
            threshold: threshold.max(1),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    /// Count one wake token. Returns `true` once the threshold is reached.
    pub(crate) fn on_wake(&mut self) -> bool {
        self.pending = (self.pending + 1).min(self.capacity);
        self.is_full()
    }

    /// Align the counter with the number of pending rows actually observed.
    pub(crate) fn reconcile(&mut self, observed: u64) {
        let observed = usize::try_from(observed).unwrap_or(usize::MAX);
        self.pending = observed.min(self.capacity);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.pending >= self.threshold
    }

    /// Size of the next claim, removed from the counter.
    pub(crate) fn take_batch(&mut self) -> usize {
        let batch = self.pending.min(self.threshold);
        self.pending -= batch;
        batch
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PollerSettings {
    pub claimant: Arc<str>,
    pub heartbeat_interval: Duration,
    pub claim_capacity: usize,
    pub prefetch_threshold: usize,
    pub wake_capacity: usize,
    pub flush_interval: Duration,
    pub catch_up_interval: Duration,
}

pub(crate) struct Poller {
    store: Arc<dyn JobStore>,
    settings: PollerSettings,
    state: WakeState,
    routes: HashMap<String, mpsc::Sender<ClaimedJob>>,
    wake: mpsc::Receiver<()>,
    registrations: mpsc::UnboundedReceiver<Route>,
    cancel: CancellationToken,
}

impl Poller {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        settings: PollerSettings,
        wake: mpsc::Receiver<()>,
        registrations: mpsc::UnboundedReceiver<Route>,
        cancel: CancellationToken,
    ) -> Self {
        let state = WakeState::new(settings.prefetch_threshold, settings.wake_capacity);
        Self {
            store,
            settings,
            state,
            routes: HashMap::new(),
            wake,
            registrations,
            cancel,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut flush = interval(self.settings.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut catch_up = interval(self.settings.catch_up_interval);
        catch_up.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(claimant = %self.settings.claimant, "poller started");

        loop {
            // Routes first so a job is never claimed ahead of its registration;
            // timers ahead of wakes so a steady token stream cannot starve them.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(route) = self.registrations.recv() => {
                    debug!(job_name = %route.name, "route registered");
                    self.routes.insert(route.name, route.jobs);
                }
                _ = flush.tick() => {
                    self.flush().await;
                }
                _ = catch_up.tick() => {
                    self.catch_up().await;
                    while self.state.is_full() {
                        self.flush().await;
                        flush.reset();
                    }
                }
                Some(()) = self.wake.recv() => {
                    if self.state.on_wake() {
                        self.flush().await;
                        flush.reset();
                    }
                }
            }
        }

        info!(claimant = %self.settings.claimant, "poller stopped");
    }

    async fn flush(&mut self) {
        let requested = self.state.take_batch();
        if requested == 0 {
            return;
        }
        self.claim_and_dispatch(requested).await;
    }

    async fn catch_up(&mut self) {
        match self.store.count_by_status(JobStatus::Pending).await {
            Ok(observed) => {
                if observed as usize != self.state.pending() {
                    debug!(observed, counted = self.state.pending(), "correcting pending count");
                }
                self.state.reconcile(observed);
            }
            Err(err) => warn!(error = %err, "catch-up count failed, retrying next tick"),
        }
    }

    #[instrument(skip(self), fields(claimant = %self.settings.claimant, claimed))]
    async fn claim_and_dispatch(&mut self, requested: usize) {
        let jobs = match self
            .store
            .claim_within_capacity(requested, self.settings.claim_capacity, &self.settings.claimant)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "claim failed, retrying next cycle");
                return;
            }
        };
        tracing::Span::current().record("claimed", jobs.len());

        for record in jobs {
            let Some(route) = self.routes.get(&record.name) else {
                warn!(job_id = %record.id, job_name = %record.name, "no processor registered for job, leaving it running");
                continue;
            };
            let heartbeat = Heartbeat::spawn(
                self.store.clone(),
                record.id,
                self.settings.claimant.clone(),
                self.settings.heartbeat_interval,
            );
            if let Err(returned) = route.send(ClaimedJob { record, heartbeat }).await {
                let ClaimedJob { record, heartbeat } = returned.0;
                heartbeat.stop().await;
                warn!(job_id = %record.id, job_name = %record.name, "processor pool closed, releasing job");
                self.release(&record).await;
            }
        }
    }

    async fn release(&self, record: &JobRecord) {
        if let Err(err) = self
            .store
            .update_status(record.id, &self.settings.claimant, JobStatus::Pending, None)
            .await
        {
            warn!(job_id = %record.id, error = %err, "failed to release job");
        }
    }
}

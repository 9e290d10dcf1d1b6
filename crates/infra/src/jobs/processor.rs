//! Per-type processor pools.

use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::{Job, JobPayload, JobRecord, JobStatus};

use super::heartbeat::Heartbeat;
use crate::job_store::JobStore;

/// A job handler. Runs on the blocking thread pool.
pub type Handler<T> = Arc<dyn Fn(&Job<T>) -> anyhow::Result<()> + Send + Sync>;

/// Copy-on-write handler list.
///
/// Workers take a snapshot per job, so adding a handler never disturbs jobs
/// already running; it applies from the next job on.
pub struct HandlerRegistry<T> {
    handlers: RwLock<Arc<Vec<Handler<T>>>>,
}

impl<T> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add<F>(&self, handler: F)
    where
        F: Fn(&Job<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: Handler<T> = Arc::new(handler);
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::with_capacity(handlers.len() + 1);
        next.extend(handlers.iter().cloned());
        next.push(handler);
        *handlers = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<Handler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for HandlerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

/// A claimed job on its way to a worker, its heartbeat already running.
#[derive(Debug)]
pub(crate) struct ClaimedJob {
    pub(crate) record: JobRecord,
    pub(crate) heartbeat: Heartbeat,
}

/// Fixed pool of workers executing claimed jobs of type `T`.
pub(crate) struct ProcessorPool<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T: JobPayload> ProcessorPool<T> {
    /// Spawn `workers` workers sharing the claimed-job channel `jobs`.
    ///
    /// On cancellation the workers finish the jobs they are running, close
    /// the channel and hand every job still buffered back to `pending`.
    pub(crate) fn spawn(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry<T>>,
        jobs: mpsc::Receiver<ClaimedJob>,
        workers: usize,
        claimant: Arc<str>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let jobs = Arc::new(Mutex::new(jobs));
        (0..workers.max(1))
            .map(|id| {
                let worker = ProcessorWorker {
                    id,
                    store: store.clone(),
                    registry: registry.clone(),
                    jobs: jobs.clone(),
                    claimant: claimant.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct ProcessorWorker<T> {
    id: usize,
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry<T>>,
    jobs: Arc<Mutex<mpsc::Receiver<ClaimedJob>>>,
    claimant: Arc<str>,
    cancel: CancellationToken,
}

impl<T: JobPayload> ProcessorWorker<T> {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = async { self.jobs.lock().await.recv().await } => next,
            };
            match next {
                Some(claimed) => self.process(claimed).await,
                None => break,
            }
        }
        self.release_buffered().await;
        debug!(job_name = T::NAME, worker = self.id, "processor worker stopped");
    }

    async fn process(&self, claimed: ClaimedJob) {
        let ClaimedJob { record, heartbeat } = claimed;

        let job = match record.decode::<T>() {
            Ok(job) => Arc::new(job),
            Err(err) => {
                heartbeat.stop().await;
                error!(job_id = %record.id, job_name = %record.name, error = %err, "undecodable job payload");
                self.mark_failed(&record).await;
                return;
            }
        };

        if !heartbeat.beat().await {
            heartbeat.stop().await;
            warn!(job_id = %record.id, job_name = %record.name, "job no longer owned, skipping");
            return;
        }

        let handlers = self.registry.snapshot();
        let outcomes = join_all(handlers.iter().map(|handler| {
            let handler = handler.clone();
            let job = job.clone();
            tokio::task::spawn_blocking(move || handler(job.as_ref()))
        }))
        .await;

        heartbeat.stop().await;

        let mut failed = false;
        for outcome in outcomes {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(job_id = %record.id, job_name = %record.name, error = %err, "job handler failed");
                    failed = true;
                }
                Err(join_err) => {
                    error!(job_id = %record.id, job_name = %record.name, error = %join_err, "job handler panicked");
                    failed = true;
                }
            }
        }

        if failed {
            self.mark_failed(&record).await;
            return;
        }

        match self.store.delete(record.id, &self.claimant).await {
            Ok(true) => info!(job_id = %record.id, job_name = %record.name, handlers = handlers.len(), "job completed"),
            Ok(false) => {
                warn!(job_id = %record.id, job_name = %record.name, "job completed after losing ownership, row left to its new owner")
            }
            Err(err) => {
                error!(job_id = %record.id, job_name = %record.name, error = %err, "failed to delete completed job")
            }
        }
    }

    async fn mark_failed(&self, record: &JobRecord) {
        match self
            .store
            .update_status(record.id, &self.claimant, JobStatus::Failed, None)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %record.id, job_name = %record.name, "job no longer owned, failure not recorded")
            }
            Err(err) => {
                error!(job_id = %record.id, job_name = %record.name, error = %err, "failed to mark job failed")
            }
        }
    }

    /// Close the channel and return every job still buffered in it to
    /// `pending`, which wakes the pollers again.
    async fn release_buffered(&self) {
        let mut jobs = self.jobs.lock().await;
        jobs.close();
        while let Ok(ClaimedJob { record, heartbeat }) = jobs.try_recv() {
            heartbeat.stop().await;
            match self
                .store
                .update_status(record.id, &self.claimant, JobStatus::Pending, None)
                .await
            {
                Ok(true) => debug!(job_id = %record.id, job_name = %record.name, "released buffered job"),
                Ok(false) => {}
                Err(err) => {
                    warn!(job_id = %record.id, job_name = %record.name, error = %err, "failed to release buffered job")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::InMemoryJobStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
    }

    impl JobPayload for SendEmail {
        const NAME: &'static str = "SendEmail";
    }

    const CLAIMANT: &str = "test-host";

    struct Harness {
        store: Arc<InMemoryJobStore>,
        registry: Arc<HandlerRegistry<SendEmail>>,
        jobs: mpsc::Sender<ClaimedJob>,
        workers: Vec<JoinHandle<()>>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_workers(2)
        }

        fn with_workers(workers: usize) -> Self {
            let store = InMemoryJobStore::arc();
            let registry = Arc::new(HandlerRegistry::new());
            let (jobs, rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            let workers = ProcessorPool::<SendEmail>::spawn(
                store.clone(),
                registry.clone(),
                rx,
                workers,
                CLAIMANT.into(),
                cancel.clone(),
            );
            Self {
                store,
                registry,
                jobs,
                workers,
                cancel,
            }
        }

        /// Insert a row, claim it, and hand it to the pool.
        async fn submit(&self, payload: &[u8]) -> JobRecord {
            let record = JobRecord::new(SendEmail::NAME, payload.to_vec());
            self.store.insert(&record).await.unwrap();
            let record = self.store.claim_batch(1, CLAIMANT).await.unwrap().remove(0);
            let heartbeat = Heartbeat::spawn(
                self.store.clone(),
                record.id,
                CLAIMANT.into(),
                Duration::from_millis(20),
            );
            self.jobs
                .send(ClaimedJob {
                    record: record.clone(),
                    heartbeat,
                })
                .await
                .unwrap();
            record
        }

        async fn shutdown(&mut self) {
            self.cancel.cancel();
            join_all(self.workers.drain(..)).await;
        }

        async fn settle(&self, record: &JobRecord) -> Option<JobRecord> {
            for _ in 0..200 {
                match self.store.get(record.id).await.unwrap() {
                    Some(row) if row.status == JobStatus::Running => {}
                    other => return other,
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.store.get(record.id).await.unwrap()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    #[test]
    fn registry_snapshots_are_stable() {
        let registry: HandlerRegistry<SendEmail> = HandlerRegistry::new();
        registry.add(|_| Ok(()));
        let before = registry.snapshot();

        registry.add(|_| Ok(()));

        assert_eq!(before.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn all_handlers_succeed_deletes_row() {
        let harness = Harness::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            harness.registry.add(move |job| {
                assert_eq!(job.payload.to, "alice@example.com");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let record = harness.submit(br#"{"to":"alice@example.com"}"#).await;

        assert!(harness.settle(&record).await.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_failing_handler_fails_the_job() {
        let harness = Harness::new();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            harness.registry.add(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        harness
            .registry
            .add(|_| Err(anyhow::anyhow!("smtp unavailable")));

        let record = harness.submit(br#"{"to":"bob@example.com"}"#).await;

        let row = harness.settle(&record).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.locked_by.is_none());
        // Siblings still ran.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_job() {
        let harness = Harness::new();
        harness.registry.add(|_| panic!("handler blew up"));

        let record = harness.submit(br#"{"to":"carol@example.com"}"#).await;

        let row = harness.settle(&record).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn undecodable_payload_fails_without_running_handlers() {
        let harness = Harness::new();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            harness.registry.add(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let record = harness.submit(b"not json").await;

        let row = harness.settle(&record).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_handlers_completes_the_job() {
        let harness = Harness::new();
        let record = harness.submit(br#"{"to":"dave@example.com"}"#).await;
        assert!(harness.settle(&record).await.is_none());
    }

    #[tokio::test]
    async fn long_handler_is_kept_alive_by_heartbeats() {
        let harness = Harness::new();
        harness.registry.add(|_| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });

        let record = harness.submit(br#"{"to":"erin@example.com"}"#).await;

        assert!(harness.settle(&record).await.is_none());
        // 20ms interval over a 100ms handler.
        assert!(harness.store.stats().pings >= 2);
    }

    #[tokio::test]
    async fn jobs_owned_elsewhere_are_skipped() {
        let harness = Harness::new();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            harness.registry.add(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        // Claimed here, then requeued and taken by another host before a
        // worker picks it up.
        let record = JobRecord::new(SendEmail::NAME, br#"{"to":"frank@example.com"}"#.to_vec());
        harness.store.insert(&record).await.unwrap();
        harness.store.claim_batch(1, CLAIMANT).await.unwrap();
        harness
            .store
            .requeue_stale(chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        harness.store.claim_batch(1, "other-host").await.unwrap();

        let heartbeat = Heartbeat::spawn(
            harness.store.clone(),
            record.id,
            CLAIMANT.into(),
            Duration::from_secs(60),
        );
        harness
            .jobs
            .send(ClaimedJob {
                record: record.clone(),
                heartbeat,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let row = harness.store.get(record.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Running);
        assert_eq!(row.locked_by.as_deref(), Some("other-host"));
    }

    #[tokio::test]
    async fn shutdown_releases_buffered_jobs() {
        let mut harness = Harness::with_workers(1);
        harness.registry.add(|_| {
            std::thread::sleep(Duration::from_millis(150));
            Ok(())
        });

        let running = harness.submit(br#"{"to":"gina@example.com"}"#).await;
        let buffered = [
            harness.submit(br#"{"to":"hal@example.com"}"#).await,
            harness.submit(br#"{"to":"ivy@example.com"}"#).await,
        ];
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness.shutdown().await;

        // The running job finished; the buffered ones are claimable again.
        assert!(harness.store.get(running.id).await.unwrap().is_none());
        for record in &buffered {
            let row = harness.store.get(record.id).await.unwrap().unwrap();
            assert_eq!(row.status, JobStatus::Pending);
            assert!(row.locked_by.is_none());
        }
        assert!(harness.jobs.is_closed());
    }
}

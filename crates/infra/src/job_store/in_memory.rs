use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use courier_core::{JobId, JobRecord, JobStatus};

use super::r#trait::{
    JOBS_CHANGED_TOPIC, JobStore, JobStoreError, Notification, NotificationStream,
};

const NOTIFICATION_BUFFER: usize = 16_384;

/// Operation counters kept by [`InMemoryJobStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub inserts: u64,
    pub deletes: u64,
    pub pings: u64,
    /// Size of every non-empty claim batch, in claim order.
    pub claim_batches: Vec<usize>,
}

/// In-memory job store for tests/dev.
///
/// Claims run under a single lock, which gives the same guarantee as
/// `FOR UPDATE SKIP LOCKED`: concurrent claimants never receive the same row.
/// Notifications emulate the Postgres trigger and fire whenever a row is
/// inserted or updated into `pending`.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    stats: Mutex<StoreStats>,
    changes: broadcast::Sender<Notification>,
    failing_inserts: AtomicUsize,
    insert_gate: Arc<RwLock<()>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            jobs: Mutex::new(HashMap::new()),
            stats: Mutex::new(StoreStats::default()),
            changes,
            failing_inserts: AtomicUsize::new(0),
            insert_gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` inserts fail with a storage error.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Hold every insert until the returned guard is dropped.
    pub async fn pause_inserts(&self) -> OwnedRwLockWriteGuard<()> {
        self.insert_gate.clone().write_owned().await
    }

    pub fn stats(&self) -> StoreStats {
        self.lock_stats().clone()
    }

    /// Snapshot of every row currently stored.
    pub fn rows(&self) -> Vec<JobRecord> {
        let mut rows: Vec<_> = self.lock_jobs().values().cloned().collect();
        rows.sort_by_key(|j| (j.created_at, j.id));
        rows
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, StoreStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, name: &str) {
        // No subscribers is fine: the poller's catch-up scan covers it.
        let _ = self.changes.send(Notification {
            topic: JOBS_CHANGED_TOPIC.to_string(),
            payload: name.to_string(),
        });
    }

    fn record_claim(&self, claimed: &[JobRecord]) {
        if !claimed.is_empty() {
            self.lock_stats().claim_batches.push(claimed.len());
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_schema(&self) -> Result<(), JobStoreError> {
        Ok(())
    }

    async fn insert(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        let _gate = self.insert_gate.read().await;
        if self.take_injected_failure() {
            return Err(JobStoreError::Storage("injected insert failure".to_string()));
        }

        {
            let mut jobs = self.lock_jobs();
            if jobs.contains_key(&job.id) {
                return Err(JobStoreError::Storage(format!("job already exists: {}", job.id)));
            }
            jobs.insert(job.id, job.clone());
        }
        self.lock_stats().inserts += 1;

        if job.status == JobStatus::Pending {
            self.publish(&job.name);
        }
        Ok(())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        claimant: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimed = claim_oldest(&mut self.lock_jobs(), limit, claimant);
        self.record_claim(&claimed);
        Ok(claimed)
    }

    async fn claim_within_capacity(
        &self,
        requested: usize,
        capacity: usize,
        claimant: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        // Count and claim under one lock so the capacity check cannot race.
        let mut jobs = self.lock_jobs();

        let in_flight = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.locked_by.as_deref() == Some(claimant)
            })
            .count();
        let limit = requested.min(capacity.saturating_sub(in_flight));
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimed = claim_oldest(&mut jobs, limit, claimant);
        drop(jobs);

        self.record_claim(&claimed);
        Ok(claimed)
    }

    async fn update_status(
        &self,
        id: JobId,
        claimant: &str,
        status: JobStatus,
        locked_by: Option<&str>,
    ) -> Result<bool, JobStoreError> {
        let name = {
            let mut jobs = self.lock_jobs();
            let Some(job) = owned_mut(&mut jobs, id, claimant) else {
                return Ok(false);
            };
            job.status = status;
            job.locked_by = locked_by.map(str::to_string);
            job.name.clone()
        };

        if status == JobStatus::Pending {
            self.publish(&name);
        }
        Ok(true)
    }

    async fn update_ping(
        &self,
        id: JobId,
        claimant: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        {
            let mut jobs = self.lock_jobs();
            let Some(job) = owned_mut(&mut jobs, id, claimant) else {
                return Ok(false);
            };
            job.last_ping = Some(at);
        }
        self.lock_stats().pings += 1;
        Ok(true)
    }

    async fn delete(&self, id: JobId, claimant: &str) -> Result<bool, JobStoreError> {
        {
            let mut jobs = self.lock_jobs();
            if owned_mut(&mut jobs, id, claimant).is_none() {
                return Ok(false);
            }
            jobs.remove(&id);
        }
        self.lock_stats().deletes += 1;
        Ok(true)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError> {
        let jobs = self.lock_jobs();
        Ok(jobs.values().filter(|j| j.status == status).count() as u64)
    }

    async fn count_by_locked_by(
        &self,
        claimant: &str,
        status: JobStatus,
    ) -> Result<u64, JobStoreError> {
        let jobs = self.lock_jobs();
        Ok(jobs
            .values()
            .filter(|j| j.status == status && j.locked_by.as_deref() == Some(claimant))
            .count() as u64)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.lock_jobs().get(&id).cloned())
    }

    async fn requeue_stale(&self, stale_before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let requeued: Vec<String> = {
            let mut jobs = self.lock_jobs();
            jobs.values_mut()
                .filter(|j| {
                    j.status == JobStatus::Running
                        && j.last_ping.unwrap_or(j.created_at) < stale_before
                })
                .map(|j| {
                    j.status = JobStatus::Pending;
                    j.locked_by = None;
                    j.tries += 1;
                    j.name.clone()
                })
                .collect()
        };

        for name in &requeued {
            self.publish(name);
        }
        Ok(requeued.len() as u64)
    }

    async fn subscribe(&self, topic: &str) -> Result<NotificationStream, JobStoreError> {
        let topic = topic.to_string();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |item| {
            let item = match item {
                Ok(n) if n.topic == topic => Some(Ok(n)),
                Ok(_) => None,
                Err(err) => {
                    // Lagged receivers lose tokens, not jobs.
                    debug!(error = %err, "in-memory subscriber lagged");
                    None
                }
            };
            futures::future::ready(item)
        });
        Ok(Box::pin(stream))
    }
}

/// The row `id`, if `claimant` holds it in `running`.
fn owned_mut<'a>(
    jobs: &'a mut HashMap<JobId, JobRecord>,
    id: JobId,
    claimant: &str,
) -> Option<&'a mut JobRecord> {
    jobs.get_mut(&id)
        .filter(|j| j.status == JobStatus::Running && j.locked_by.as_deref() == Some(claimant))
}

/// Mark up to `limit` of the oldest pending rows running under `claimant`.
fn claim_oldest(
    jobs: &mut HashMap<JobId, JobRecord>,
    limit: usize,
    claimant: &str,
) -> Vec<JobRecord> {
    let mut candidates: Vec<_> = jobs
        .values()
        .filter(|j| j.status == JobStatus::Pending)
        .map(|j| (j.created_at, j.id))
        .collect();
    candidates.sort();
    candidates.truncate(limit);

    let now = Utc::now();
    let mut claimed = Vec::with_capacity(candidates.len());
    for (_, id) in candidates {
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Running;
            job.locked_by = Some(claimant.to_string());
            job.last_ping = Some(now);
            claimed.push(job.clone());
        }
    }
    claimed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(name: &str) -> JobRecord {
        JobRecord::new(name, b"{}".to_vec())
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let store = InMemoryJobStore::new();
        let job = pending("CreateUser");
        store.insert(&job).await.unwrap();

        let claimed = store.claim_batch(10, "host-a").await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("host-a"));

        // No more jobs
        assert!(store.claim_batch(10, "host-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_capacity() {
        let store = InMemoryJobStore::new();
        for _ in 0..10 {
            store.insert(&pending("CreateUser")).await.unwrap();
        }

        let first = store.claim_within_capacity(4, 6, "host-a").await.unwrap();
        assert_eq!(first.len(), 4);

        // 4 in flight, capacity 6: only 2 more
        let second = store.claim_within_capacity(4, 6, "host-a").await.unwrap();
        assert_eq!(second.len(), 2);

        // Saturated
        assert!(store.claim_within_capacity(4, 6, "host-a").await.unwrap().is_empty());

        // Another claimant has its own capacity
        let other = store.claim_within_capacity(4, 6, "host-b").await.unwrap();
        assert_eq!(other.len(), 4);
    }

    #[tokio::test]
    async fn counts_by_status_and_claimant() {
        let store = InMemoryJobStore::new();
        for _ in 0..5 {
            store.insert(&pending("CreateUser")).await.unwrap();
        }
        store.claim_batch(2, "host-a").await.unwrap();

        assert_eq!(store.count_by_status(JobStatus::Pending).await.unwrap(), 3);
        assert_eq!(store.count_by_status(JobStatus::Running).await.unwrap(), 2);
        assert_eq!(
            store.count_by_locked_by("host-a", JobStatus::Running).await.unwrap(),
            2
        );
        assert_eq!(
            store.count_by_locked_by("host-b", JobStatus::Running).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn insert_publishes_job_name() {
        let store = InMemoryJobStore::new();
        let mut changes = store.subscribe(JOBS_CHANGED_TOPIC).await.unwrap();

        store.insert(&pending("CreateUser")).await.unwrap();

        let note = changes.next().await.unwrap().unwrap();
        assert_eq!(note.topic, JOBS_CHANGED_TOPIC);
        assert_eq!(note.payload, "CreateUser");
    }

    #[tokio::test]
    async fn requeue_stale_only_touches_stale_running_rows() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.insert(&pending("CreateUser")).await.unwrap();
        }
        let claimed = store.claim_batch(3, "host-a").await.unwrap();

        let stale = claimed[0].id;
        let fresh = claimed[1].id;
        let failed = claimed[2].id;

        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        store.update_ping(stale, "host-a", long_ago).await.unwrap();
        store.update_ping(failed, "host-a", long_ago).await.unwrap();
        store
            .update_status(failed, "host-a", JobStatus::Failed, None)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(store.requeue_stale(cutoff).await.unwrap(), 1);

        let stale = store.get(stale).await.unwrap().unwrap();
        assert_eq!(stale.status, JobStatus::Pending);
        assert_eq!(stale.tries, 1);
        assert!(stale.locked_by.is_none());

        assert_eq!(store.get(fresh).await.unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(store.get(failed).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn writes_are_fenced_on_the_owning_claimant() {
        let store = InMemoryJobStore::new();
        store.insert(&pending("CreateUser")).await.unwrap();
        let id = store.claim_batch(1, "host-a").await.unwrap()[0].id;

        // Another claimant cannot touch host-a's row.
        assert!(!store.update_ping(id, "host-b", Utc::now()).await.unwrap());
        assert!(!store.delete(id, "host-b").await.unwrap());
        assert!(
            !store
                .update_status(id, "host-b", JobStatus::Failed, None)
                .await
                .unwrap()
        );

        // Once requeued, the old owner has lost it too.
        store.requeue_stale(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert!(!store.update_ping(id, "host-a", Utc::now()).await.unwrap());
        assert!(!store.delete(id, "host-a").await.unwrap());

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.locked_by.is_none());
        assert_eq!(store.stats().deletes, 0);

        // The new owner can finish it.
        let reclaimed = store.claim_batch(1, "host-b").await.unwrap();
        assert_eq!(reclaimed[0].id, id);
        assert!(store.delete(id, "host-b").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn injected_insert_failures_are_consumed() {
        let store = InMemoryJobStore::new();
        store.fail_next_inserts(1);

        assert!(store.insert(&pending("CreateUser")).await.is_err());
        assert!(store.insert(&pending("CreateUser")).await.is_ok());
        assert_eq!(store.len(), 1);
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

use courier_core::{JobId, JobRecord, JobStatus};

/// Topic the store publishes job changes on.
///
/// The notification payload is the job's `name`.
pub const JOBS_CHANGED_TOPIC: &str = "jobs:changed";

/// A change notification delivered by [`JobStore::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,
    /// Name of the job whose row changed.
    pub payload: String,
}

/// Stream of change notifications. Ends (or yields an error) when the
/// underlying subscription is lost.
pub type NotificationStream = BoxStream<'static, Result<Notification, JobStoreError>>;

/// Job store error.
#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("failed to decode job row: {0}")]
    Decode(String),
}

/// Durable job storage.
///
/// This is the whole contract the queue runtime needs from a backend:
///
/// - row-level insert / update / delete / count, where updates and deletes
///   of a claimed row are fenced on its owner: they apply only while the row
///   is `running` and `locked_by` is the caller
/// - an **atomic** batch claim: select up to `limit` pending rows, skip rows
///   locked by a concurrent claim, mark them running under `claimant`, return
///   them; two concurrent claims never return the same row
/// - a publish/subscribe channel that fires on insert and update of a
///   pending row (published by the store itself, e.g. a trigger)
///
/// ## Thread Safety
///
/// Implementations are shared across the enqueue pool, the poller and every
/// processor worker, so they must be `Send + Sync`.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Idempotently create the job table and its change trigger.
    async fn create_schema(&self) -> Result<(), JobStoreError>;

    /// Persist a new job row.
    async fn insert(&self, job: &JobRecord) -> Result<(), JobStoreError>;

    /// Atomically claim up to `limit` pending rows for `claimant`.
    async fn claim_batch(
        &self,
        limit: usize,
        claimant: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Claim `min(requested, capacity - in_flight)` rows, where `in_flight`
    /// is the number of rows `claimant` already holds in `running`.
    ///
    /// Backends with transactions override this to count and claim inside a
    /// single transaction.
    async fn claim_within_capacity(
        &self,
        requested: usize,
        capacity: usize,
        claimant: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let in_flight = self
            .count_by_locked_by(claimant, JobStatus::Running)
            .await? as usize;
        let limit = requested.min(capacity.saturating_sub(in_flight));
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.claim_batch(limit, claimant).await
    }

    /// Move a row `claimant` holds in `running` to `status`, setting
    /// `locked_by`.
    ///
    /// Returns `false` when `claimant` no longer owns the row (it was
    /// requeued, reclaimed or removed); nothing is written then.
    async fn update_status(
        &self,
        id: JobId,
        claimant: &str,
        status: JobStatus,
        locked_by: Option<&str>,
    ) -> Result<bool, JobStoreError>;

    /// Record a liveness signal on a row `claimant` holds in `running`.
    ///
    /// Returns `false` when ownership was lost.
    async fn update_ping(
        &self,
        id: JobId,
        claimant: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Remove a row `claimant` holds in `running` (job completed).
    ///
    /// Returns `false` when ownership was lost.
    async fn delete(&self, id: JobId, claimant: &str) -> Result<bool, JobStoreError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError>;

    async fn count_by_locked_by(
        &self,
        claimant: &str,
        status: JobStatus,
    ) -> Result<u64, JobStoreError>;

    /// Fetch a single row (inspection / tests).
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Return `running` rows whose last ping is older than `stale_before` to
    /// `pending`, clearing `locked_by` and incrementing `tries`.
    ///
    /// Returns the number of rows requeued. `failed` rows are never touched.
    async fn requeue_stale(&self, stale_before: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Subscribe to change notifications on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<NotificationStream, JobStoreError>;
}

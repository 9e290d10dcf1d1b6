//! Job records and their typed views.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::JobId;

/// A payload type that can travel through the queue.
///
/// `NAME` is the stable job type name stored in the `name` column and used to
/// route claimed rows to the right processor pool (e.g. `"CreateUser"`).
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Lifecycle status of a stored job.
///
/// Completion has no status: a completed job's row is deleted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker process (`locked_by` is set).
    Running,
    /// At least one handler failed. Terminal.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::invalid_status(other)),
        }
    }
}

/// A job row as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Job type name, used for routing.
    pub name: String,
    /// Serialized payload bytes (JSON).
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Retry counter. Only ever increases.
    pub tries: u32,
    pub status: JobStatus,
    /// Claimant identity while `Running`.
    pub locked_by: Option<String>,
    /// Last liveness signal while `Running`.
    pub last_ping: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a fresh `pending` record from serialized payload bytes.
    ///
    /// Assigns a new id and `created_at`; `tries` starts at zero.
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            created_at: Utc::now(),
            tries: 0,
            status: JobStatus::Pending,
            locked_by: None,
            last_ping: None,
        }
    }

    /// Decode the payload into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<Job<T>> {
        let payload: T = serde_json::from_slice(&self.payload).map_err(|e| {
            CoreError::payload(format!("job {} ({}) does not decode: {}", self.id, self.name, e))
        })?;

        Ok(Job {
            id: self.id,
            name: self.name.clone(),
            payload,
            created_at: self.created_at,
            tries: self.tries,
        })
    }
}

/// Typed, in-memory view of a claimed job.
///
/// Owned by the processor working on it; never shared across workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job<T> {
    pub id: JobId,
    pub name: String,
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub tries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct CreateUser {
        name: String,
    }

    impl JobPayload for CreateUser {
        const NAME: &'static str = "CreateUser";
    }

    #[test]
    fn new_record_starts_pending_and_unlocked() {
        let job = JobRecord::new(CreateUser::NAME, br#"{"name":"alice"}"#.to_vec());

        assert_eq!(job.name, "CreateUser");
        assert_eq!(job.tries, 0);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.locked_by.is_none());
        assert!(job.last_ping.is_none());
    }

    #[test]
    fn decode_yields_typed_payload() {
        let record = JobRecord::new("CreateUser", br#"{"name":"alice"}"#.to_vec());
        let job: Job<CreateUser> = record.decode().unwrap();
        assert_eq!(job.id, record.id);
        assert_eq!(job.payload.name, "alice");
    }

    #[test]
    fn decode_reports_mismatched_payload() {
        let record = JobRecord::new("CreateUser", br#"{"title":42}"#.to_vec());
        let err = record.decode::<CreateUser>().unwrap_err();
        assert!(matches!(err, CoreError::Payload(_)));
    }

    #[test]
    fn status_strings_are_stable() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "completed".parse::<JobStatus>(),
            Err(CoreError::InvalidStatus(_))
        ));
    }
}

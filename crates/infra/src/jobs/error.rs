use thiserror::Error;

use crate::job_store::JobStoreError;

/// Queue runtime error.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("failed to serialize job payload: {0}")]
    Serialize(String),

    /// The runtime has shut down and no longer accepts work.
    #[error("job queue is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] JobStoreError),

    /// The change subscription could not be established or was lost.
    #[error("change subscription failed: {0}")]
    Subscription(String),
}

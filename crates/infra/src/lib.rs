//! Infrastructure layer: job storage, queue runtime, configuration.

pub mod config;
pub mod job_store;
pub mod jobs;


pub use config::QueueConfig;
pub use job_store::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
pub use jobs::{JobQueue, Queue, QueueError};

//! Job data model shared by the bus and the queue runtime.
//!
//! This crate contains **pure data** (no IO, no async).

pub mod error;
pub mod id;
pub mod job;

pub use error::{CoreError, CoreResult};
pub use id::JobId;
pub use job::{Job, JobPayload, JobRecord, JobStatus};

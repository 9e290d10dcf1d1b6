//! Durable job storage boundary.
//!
//! The queue runtime talks to storage only through [`JobStore`]. Two
//! backends ship here: Postgres for production and an in-memory store for
//! tests and local development.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryJobStore, StoreStats};
pub use postgres::PostgresJobStore;
pub use r#trait::{
    JOBS_CHANGED_TOPIC, JobStore, JobStoreError, Notification, NotificationStream,
};

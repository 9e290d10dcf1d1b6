//! Durable job queue runtime.
//!
//! ## Components
//!
//! - `EnqueuePool`: bounded insert workers with retry
//! - `ChangeNotifier`: turns store change notifications into wake tokens
//! - `Poller`: batches wakes into capacity-bounded claims and routes jobs
//! - `ProcessorPool`: per-type workers that run every handler and settle the row
//! - `Reaper`: optional sweep returning abandoned jobs to pending
//! - `JobQueue` / `Queue<T>`: the façade tying these together
//!
//! ## Delivery
//!
//! At-least-once. A job is deleted only after every handler succeeded and is
//! left `failed` if any handler errored or panicked. Failed jobs are not
//! retried.

pub mod enqueue;
pub mod error;
pub mod heartbeat;
pub mod notifier;
pub mod poller;
pub mod processor;
pub mod queue;
pub mod reaper;

pub use enqueue::{EnqueueHandle, EnqueuePool, EnqueueRequest};
pub use error::QueueError;
pub use notifier::ChangeNotifier;
pub use processor::{Handler, HandlerRegistry};
pub use queue::{JobQueue, Queue};
pub use reaper::Reaper;

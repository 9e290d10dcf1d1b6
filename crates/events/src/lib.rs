//! Request/response event bus with optional hand-off of listeners to a job queue.

pub mod bus;
pub mod middleware;
pub mod queue;

pub use bus::{DispatchError, EventBus, Listener, Middleware, ResultHandler};
pub use middleware::{FileEventLog, log_event};
pub use queue::ListenerQueue;

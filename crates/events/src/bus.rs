//! Request/response event bus.
//!
//! An `EventBus<P, R>` pairs a single **result handler** (the synchronous
//! "do the thing and tell me how it went" part) with any number of
//! **listeners** (fire-and-forget side-effects).
//!
//! ## Dispatch protocol
//!
//! ```text
//! dispatch(P) → middleware… → result handler ─┬─ Err → return Err (no listeners)
//!                                             └─ Ok(R) → listeners | queue.enqueue(P) → return Ok(R)
//! ```
//!
//! - Middleware runs on every dispatch, in registration order, before the
//!   result handler, whatever the outcome.
//! - Listener failures are logged and never change the dispatch result.
//!
//! ## Queue-backed buses
//!
//! A bus built with [`EventBus::queued`] does not call listeners in-line.
//! Each listener is registered with the queue once, and each successful
//! dispatch enqueues the payload exactly once; the queue then runs every
//! listener out of the request cycle.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::middleware::log_event;
use crate::queue::ListenerQueue;

/// Fire-and-forget side-effect run after a successful dispatch.
pub type Listener<P> = Arc<dyn Fn(&P) -> anyhow::Result<()> + Send + Sync>;

/// Observes every payload before the result handler runs.
pub type Middleware<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Produces the dispatch result.
pub type ResultHandler<P, R> = Arc<dyn Fn(&P) -> anyhow::Result<R> + Send + Sync>;

/// Dispatch failure.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `dispatch` was called before `set_handler`.
    #[error("result handler must be set before dispatch")]
    HandlerNotConfigured,

    /// The result handler returned an error; no listener ran.
    #[error("result handler failed: {0:#}")]
    Handler(anyhow::Error),
}

/// Generic request/response event bus.
pub struct EventBus<P, R>
where
    P: Send + Sync + 'static,
{
    listeners: Vec<Listener<P>>,
    middleware: Vec<Middleware<P>>,
    handler: Option<ResultHandler<P, R>>,
    queue: Option<Arc<dyn ListenerQueue<P>>>,
}

impl<P, R> Default for EventBus<P, R>
where
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            middleware: Vec::new(),
            handler: None,
            queue: None,
        }
    }
}

impl<P, R> EventBus<P, R>
where
    P: Send + Sync + 'static,
{
    /// A bus that runs listeners in-line, without middleware.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose listeners run through `queue`.
    pub fn queued(queue: Arc<dyn ListenerQueue<P>>) -> Self {
        Self {
            queue: Some(queue),
            ..Self::default()
        }
    }

    /// Install the default middleware stack (event logging).
    pub fn with_default_middleware(mut self) -> Self
    where
        P: Serialize,
    {
        self.add_middleware(log_event::<P>);
        self
    }

    /// Register a listener.
    ///
    /// On a queue-backed bus the listener is also registered with the queue,
    /// so it runs for payloads enqueued by this or any other process.
    pub fn listen<F>(&mut self, listener: F)
    where
        F: Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: Listener<P> = Arc::new(listener);
        if let Some(queue) = &self.queue {
            queue.register(listener.clone());
        }
        self.listeners.push(listener);
    }

    /// Append a middleware; runs after previously added ones.
    pub fn add_middleware<F>(&mut self, middleware: F)
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(middleware));
    }

    /// Set (or replace) the result handler.
    pub fn set_handler<F>(&mut self, handler: F)
    where
        F: Fn(&P) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
    }

    pub fn is_queue_backed(&self) -> bool {
        self.queue.is_some()
    }

    /// Dispatch a payload and return the result handler's output.
    pub async fn dispatch(&self, payload: P) -> Result<R, DispatchError> {
        for middleware in &self.middleware {
            middleware(&payload);
        }

        let handler = self
            .handler
            .as_ref()
            .ok_or(DispatchError::HandlerNotConfigured)?;

        let result = handler(&payload).map_err(DispatchError::Handler)?;

        match &self.queue {
            Some(queue) => {
                if !self.listeners.is_empty() {
                    if let Err(err) = queue.enqueue(&payload).await {
                        error!(
                            event = std::any::type_name::<P>(),
                            error = %err,
                            "failed to hand payload to listener queue"
                        );
                    }
                }
            }
            None => {
                for (index, listener) in self.listeners.iter().enumerate() {
                    if let Err(err) = listener(&payload) {
                        warn!(
                            event = std::any::type_name::<P>(),
                            listener = index,
                            error = %err,
                            "listener failed"
                        );
                    }
                }
            }
        }

        Ok(result)
    }
}

impl<P, R> core::fmt::Debug for EventBus<P, R>
where
    P: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .field("middleware", &self.middleware.len())
            .field("handler", &self.handler.is_some())
            .field("queue_backed", &self.queue.is_some())
            .finish()
    }
}

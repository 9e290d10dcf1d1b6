//! Seam between an [`EventBus`](crate::EventBus) and a durable job queue.

use async_trait::async_trait;

use crate::bus::Listener;

/// A queue that can run bus listeners out of the dispatch cycle.
///
/// A queue-backed bus registers each of its listeners here once, and on every
/// successful dispatch hands the payload over with a single `enqueue`. The
/// queue then runs all registered listeners for that payload asynchronously,
/// with at-least-once semantics.
///
/// `enqueue` may wait when the queue applies backpressure.
#[async_trait]
pub trait ListenerQueue<P>: Send + Sync
where
    P: Send + Sync + 'static,
{
    /// Add a listener to the set executed for every queued payload.
    fn register(&self, listener: Listener<P>);

    /// Queue one payload for asynchronous listener execution.
    async fn enqueue(&self, payload: &P) -> anyhow::Result<()>;
}

//! Bridges store change notifications to poller wake tokens.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::QueueError;
use crate::job_store::{JOBS_CHANGED_TOPIC, JobStore};

pub struct ChangeNotifier {
    store: Arc<dyn JobStore>,
}

impl ChangeNotifier {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Ensure the job table and its change trigger exist.
    pub async fn setup(&self) -> Result<(), QueueError> {
        self.store.create_schema().await?;
        Ok(())
    }

    /// Subscribe to `jobs:changed` and forward one wake token per
    /// notification.
    ///
    /// Tokens are dropped when the wake channel is full; the poller's
    /// catch-up scan repairs the count. The returned task resolves to an
    /// error if the subscription is lost, and to `Ok` on cancellation.
    pub async fn start(
        &self,
        wake: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<(), QueueError>>, QueueError> {
        let mut changes = self
            .store
            .subscribe(JOBS_CHANGED_TOPIC)
            .await
            .map_err(|e| QueueError::Subscription(e.to_string()))?;
        info!(topic = JOBS_CHANGED_TOPIC, "listening for job changes");

        Ok(tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = changes.next() => next,
                };

                match next {
                    Some(Ok(note)) => match wake.try_send(()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(())) => {
                            debug!(job_name = %note.payload, "wake channel full, dropping token");
                        }
                        // Poller gone: the runtime is shutting down.
                        Err(TrySendError::Closed(())) => return Ok(()),
                    },
                    Some(Err(err)) => {
                        error!(error = %err, "job change subscription failed");
                        return Err(QueueError::Subscription(err.to_string()));
                    }
                    None => {
                        error!("job change subscription ended");
                        return Err(QueueError::Subscription(
                            "notification stream ended".to_string(),
                        ));
                    }
                }
            }
        }))
    }
}

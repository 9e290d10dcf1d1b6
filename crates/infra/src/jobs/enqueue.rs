//! Bounded enqueue worker pool.
//!
//! Producers hand requests to a bounded channel and return as soon as the
//! request is buffered. A fixed set of workers drains the channel and inserts
//! rows. Failed inserts go back onto the same channel until the retry budget
//! is spent.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use courier_core::JobRecord;

use super::error::QueueError;
use crate::job_store::JobStore;

/// A job waiting to be inserted.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub name: String,
    pub payload: serde_json::Value,
    retries: u32,
}

impl EnqueueRequest {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            retries: 0,
        }
    }
}

/// Cloneable producer side of the pool.
#[derive(Debug, Clone)]
pub struct EnqueueHandle {
    tx: mpsc::Sender<EnqueueRequest>,
}

impl EnqueueHandle {
    /// Buffer a job for insertion.
    ///
    /// Waits only while the request channel is full.
    pub async fn enqueue(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.tx
            .send(EnqueueRequest::new(name, payload))
            .await
            .map_err(|_| QueueError::Closed)
    }
}

pub struct EnqueuePool;

impl EnqueuePool {
    /// Spawn `workers` insert workers over a channel of `capacity` requests.
    pub fn spawn(
        store: Arc<dyn JobStore>,
        workers: usize,
        capacity: usize,
        max_retries: u32,
        cancel: CancellationToken,
    ) -> (EnqueueHandle, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let tasks = (0..workers.max(1))
            .map(|worker| {
                let worker = EnqueueWorker {
                    id: worker,
                    store: store.clone(),
                    rx: rx.clone(),
                    resubmit: tx.clone(),
                    max_retries,
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        (EnqueueHandle { tx }, tasks)
    }
}

struct EnqueueWorker {
    id: usize,
    store: Arc<dyn JobStore>,
    rx: Arc<Mutex<mpsc::Receiver<EnqueueRequest>>>,
    resubmit: mpsc::Sender<EnqueueRequest>,
    max_retries: u32,
    cancel: CancellationToken,
}

impl EnqueueWorker {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = async { self.rx.lock().await.recv().await } => next,
            };
            match next {
                Some(request) => self.insert(request).await,
                None => break,
            }
        }
        debug!(worker = self.id, "enqueue worker stopped");
    }

    async fn insert(&self, mut request: EnqueueRequest) {
        let payload = match serde_json::to_vec(&request.payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(job_name = %request.name, error = %err, "dropping job with unserializable payload");
                return;
            }
        };

        let record = JobRecord::new(request.name.clone(), payload);
        let err = match self.store.insert(&record).await {
            Ok(()) => {
                debug!(job_id = %record.id, job_name = %record.name, "job enqueued");
                return;
            }
            Err(err) => err,
        };

        request.retries += 1;
        if request.retries > self.max_retries {
            error!(
                job_name = %request.name,
                retries = request.retries - 1,
                error = %err,
                "dropping job after exhausting insert retries"
            );
            return;
        }

        warn!(
            job_name = %request.name,
            retries = request.retries,
            error = %err,
            "job insert failed, resubmitting"
        );
        // Resubmit off-worker: a worker must never block on its own channel.
        let resubmit = self.resubmit.clone();
        tokio::spawn(async move {
            if let Err(returned) = resubmit.send(request).await {
                warn!(job_name = %returned.0.name, "enqueue pool closed, dropping resubmitted job");
            }
        });
    }
}

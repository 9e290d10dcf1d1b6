//! Queue runtime façade.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::{Job, JobPayload};
use courier_events::{Listener, ListenerQueue};

use super::enqueue::{EnqueueHandle, EnqueuePool};
use super::error::QueueError;
use super::notifier::ChangeNotifier;
use super::poller::{Poller, PollerSettings, Route};
use super::processor::{HandlerRegistry, ProcessorPool};
use super::reaper::Reaper;
use crate::config::QueueConfig;
use crate::job_store::JobStore;

type NotifierTask = JoinHandle<Result<(), QueueError>>;

/// A running job queue: enqueue pool, change notifier, poller, optional
/// reaper, and one processor pool per registered job type.
///
/// Cheap to clone; clones share the same runtime.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    claimant: Arc<str>,
    enqueue: EnqueueHandle,
    routes: mpsc::UnboundedSender<Route>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    notifier: Mutex<Option<NotifierTask>>,
    queues: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl JobQueue {
    /// Prepare the store and start every background task.
    ///
    /// Fails if the schema cannot be created or the change subscription
    /// cannot be established.
    pub async fn start(store: Arc<dyn JobStore>, config: QueueConfig) -> Result<Self, QueueError> {
        let cancel = CancellationToken::new();
        let claimant: Arc<str> = config.claimant_id.as_str().into();

        let notifier = ChangeNotifier::new(store.clone());
        notifier.setup().await?;
        let (wake_tx, wake_rx) = mpsc::channel(config.wake_capacity.max(1));
        let notifier_task = notifier.start(wake_tx, cancel.child_token()).await?;

        let (routes, registrations) = mpsc::unbounded_channel();
        let poller = Poller::new(
            store.clone(),
            PollerSettings {
                claimant: claimant.clone(),
                heartbeat_interval: config.heartbeat_interval,
                claim_capacity: config.claim_capacity,
                prefetch_threshold: config.prefetch_threshold,
                wake_capacity: config.wake_capacity,
                flush_interval: config.prefetch_flush_interval,
                catch_up_interval: config.catch_up_interval,
            },
            wake_rx,
            registrations,
            cancel.child_token(),
        );

        let mut tasks = vec![poller.spawn()];

        let (enqueue, enqueue_tasks) = EnqueuePool::spawn(
            store.clone(),
            config.enqueue_workers,
            config.enqueue_capacity,
            config.enqueue_max_retries,
            cancel.child_token(),
        );
        tasks.extend(enqueue_tasks);

        if let Some(every) = config.reaper_interval {
            let reaper = Reaper::new(store.clone(), every, config.stale_after);
            tasks.push(reaper.spawn(cancel.child_token()));
        }

        info!(
            claimant = %config.claimant_id,
            enqueue_workers = config.enqueue_workers,
            prefetch_threshold = config.prefetch_threshold,
            reaper = config.reaper_interval.is_some(),
            "job queue started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                claimant,
                enqueue,
                routes,
                cancel,
                tasks: Mutex::new(tasks),
                notifier: Mutex::new(Some(notifier_task)),
                queues: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Typed queue for `T`, starting its processor pool on first use.
    ///
    /// Repeated calls for the same type return handles onto the same pool.
    pub fn queue<T: JobPayload>(&self) -> Queue<T> {
        let mut queues = lock(&self.inner.queues);
        if let Some(existing) = queues.get(T::NAME) {
            if let Some(queue) = existing.downcast_ref::<Queue<T>>() {
                return queue.clone();
            }
            warn!(job_name = T::NAME, "job name reused by a different payload type, replacing its route");
        }

        let config = &self.inner.config;
        let registry = Arc::new(HandlerRegistry::new());
        // Claims are capped at `claim_capacity`, so this channel never blocks
        // the poller.
        let (jobs_tx, jobs_rx) = mpsc::channel(config.claim_capacity.max(1));

        let workers = ProcessorPool::<T>::spawn(
            self.inner.store.clone(),
            registry.clone(),
            jobs_rx,
            config.processor_workers,
            self.inner.claimant.clone(),
            self.inner.cancel.child_token(),
        );
        lock(&self.inner.tasks).extend(workers);

        let route = Route {
            name: T::NAME.to_string(),
            jobs: jobs_tx,
        };
        if self.inner.routes.send(route).is_err() {
            warn!(job_name = T::NAME, "poller stopped, route not registered");
        }

        let queue = Queue {
            registry,
            enqueue: self.inner.enqueue.clone(),
        };
        queues.insert(T::NAME, Box::new(queue.clone()));
        queue
    }

    /// Enqueue an untyped payload under `name`.
    pub async fn enqueue_raw(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.inner.enqueue.enqueue(name, payload).await
    }

    /// Resolves when the change subscription is lost (with an error) or the
    /// queue shuts down (with `Ok`).
    ///
    /// Only the first caller observes the outcome.
    pub async fn supervise(&self) -> Result<(), QueueError> {
        let Some(task) = lock(&self.inner.notifier).take() else {
            return Ok(());
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(err) => Err(QueueError::Subscription(format!("notifier task failed: {err}"))),
        }
    }

    /// Stop every background task and wait for them.
    ///
    /// Running handlers are allowed to finish. Claimed jobs still waiting for
    /// a worker go back to `pending`; jobs still buffered for insertion are
    /// discarded.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        let notifier = lock(&self.inner.notifier).take();

        join_all(tasks).await;
        if let Some(task) = notifier {
            let _ = task.await;
        }
        info!(claimant = %self.inner.config.claimant_id, "job queue stopped");
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("claimant", &self.inner.config.claimant_id)
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Typed handle onto one job type's queue.
pub struct Queue<T> {
    registry: Arc<HandlerRegistry<T>>,
    enqueue: EnqueueHandle,
}

impl<T: JobPayload> Queue<T> {
    /// Serialize `payload` and hand it to the enqueue pool.
    ///
    /// Returns once the request is buffered, not once it is stored.
    pub async fn enqueue(&self, payload: &T) -> Result<(), QueueError> {
        let value =
            serde_json::to_value(payload).map_err(|e| QueueError::Serialize(e.to_string()))?;
        self.enqueue.enqueue(T::NAME, value).await
    }

    /// Register a handler run for every job of this type.
    ///
    /// Handlers run on the blocking pool, concurrently with each other.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&Job<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.add(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.registry.len()
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            enqueue: self.enqueue.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("payload", &std::any::type_name::<T>())
            .field("registry", &self.registry)
            .finish()
    }
}

#[async_trait]
impl<T: JobPayload> ListenerQueue<T> for Queue<T> {
    fn register(&self, listener: Listener<T>) {
        self.add_handler(move |job: &Job<T>| listener(&job.payload));
    }

    async fn enqueue(&self, payload: &T) -> anyhow::Result<()> {
        Queue::enqueue(self, payload).await?;
        Ok(())
    }
}

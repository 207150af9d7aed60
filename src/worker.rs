// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Groups
//!
//! A `WorkerGroup` runs a pool of tokio tasks, each owning one piece of state (typically a
//! `MessagingChannel`) produced by a state factory. Workers either run a fixed activity
//! over and over or pull work items from a shared queue.
//!
//! Lifecycle: `new` → `initialize` (once) → `start_activity` or `start_queue` (once, one
//! of them) → `dispose`. `restart` tears the workers down and relaunches them with the
//! same factory.
//!
//! Cancellation is cooperative: every worker observes a `CancellationToken`, which is
//! also handed to the state factory so that state such as channels can stop their own
//! long-running work.
//!
//! ```ignore
//! let workers = WorkerGroup::new(2, 4)?;
//! workers.initialize(move |token| open_channel(token), || true)?;
//! workers.start_activity(move |channel: &mut MessagingChannel| {
//!     let handler = handler.clone();
//!     Box::pin(async move {
//!         let _ = channel.receive(handler).await;
//!     })
//! })?;
//! ```

use crate::errors::ChannelError;
use async_trait::async_trait;
use futures_util::{
    future::{join_all, BoxFuture},
    FutureExt,
};
use parking_lot::Mutex;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex as AsyncMutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-worker state owned by a worker group.
#[async_trait]
pub trait WorkerState: Send + 'static {
    /// Releases the state; called exactly once per state the factory produced.
    async fn dispose(&mut self);

    /// A faulted state is disposed and replaced before the next unit of work.
    fn is_faulted(&self) -> bool {
        false
    }
}

type StateFactory<S> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<S, ChannelError>> + Send + Sync>;
type RestartPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
type Activity<S> = Arc<dyn for<'a> Fn(&'a mut S) -> BoxFuture<'a, ()> + Send + Sync>;
type WorkItem<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;
type WorkQueue<S> = Arc<AsyncMutex<UnboundedReceiver<WorkItem<S>>>>;

enum Mode<S> {
    Activity(Activity<S>),
    Queue,
}

impl<S> Clone for Mode<S> {
    fn clone(&self) -> Self {
        match self {
            Mode::Activity(activity) => Mode::Activity(activity.clone()),
            Mode::Queue => Mode::Queue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Constructed,
    Initialized,
    Started,
    Disposed,
}

struct Inner<S> {
    lifecycle: Lifecycle,
    factory: Option<StateFactory<S>>,
    predicate: Option<RestartPredicate>,
    mode: Option<Mode<S>>,
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// Everything a worker task needs, cloned once per worker.
struct Worker<S> {
    id: usize,
    factory: StateFactory<S>,
    predicate: RestartPredicate,
    mode: Mode<S>,
    queue: WorkQueue<S>,
    token: CancellationToken,
    poll_interval: Duration,
    retry_delay: Duration,
}

/// Pool of workers, each bound to its own state.
pub struct WorkerGroup<S: WorkerState> {
    min_workers: usize,
    max_workers: usize,
    poll_interval: Duration,
    retry_delay: Duration,
    inner: Mutex<Inner<S>>,
    /// Held across `restart` and `dispose` so neither observes the other half done
    transition: AsyncMutex<()>,
    sender: UnboundedSender<WorkItem<S>>,
    queue: WorkQueue<S>,
}

impl<S: WorkerState> WorkerGroup<S> {
    /// Creates a group starting `min_workers` workers; `max_workers` is the capacity the
    /// group may grow to and is never exceeded.
    pub fn new(min_workers: usize, max_workers: usize) -> Result<Self, ChannelError> {
        if min_workers == 0 {
            return Err(ChannelError::Argument(
                "the minimum number of workers must be positive".to_owned(),
            ));
        }

        if max_workers < min_workers {
            return Err(ChannelError::Argument(
                "the maximum number of workers must be at least the minimum".to_owned(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        Ok(WorkerGroup {
            min_workers,
            max_workers,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Constructed,
                factory: None,
                predicate: None,
                mode: None,
                token: CancellationToken::new(),
                workers: vec![],
            }),
            transition: AsyncMutex::new(()),
            sender,
            queue: Arc::new(AsyncMutex::new(receiver)),
        })
    }

    /// How long a queue worker waits for a work item before checking for cancellation.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Delay before a worker retries a failed state factory.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Number of workers running once the group is started.
    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    /// Capacity reserved for the group; never exceeded.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Binds the state factory and the restart predicate, consulted after each unit of
    /// work to decide whether the worker keeps going.
    pub fn initialize<F, Fut, P>(&self, factory: F, predicate: P) -> Result<(), ChannelError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, ChannelError>> + Send + 'static,
        P: Fn() -> bool + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        match inner.lifecycle {
            Lifecycle::Disposed => return Err(ChannelError::ObjectDisposed("WorkerGroup")),
            Lifecycle::Constructed => {}
            _ => {
                return Err(ChannelError::InvalidOperation(
                    "the worker group is already initialized".to_owned(),
                ))
            }
        }

        inner.factory = Some(Arc::new(move |token| factory(token).boxed()));
        inner.predicate = Some(Arc::new(predicate));
        inner.lifecycle = Lifecycle::Initialized;
        Ok(())
    }

    /// Starts the workers, each running `activity` against its state until the predicate
    /// says otherwise.
    pub fn start_activity<F>(&self, activity: F) -> Result<(), ChannelError>
    where
        F: for<'a> Fn(&'a mut S) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.start(Mode::Activity(Arc::new(activity)))
    }

    /// Starts the workers, each pulling items queued through `enqueue`.
    pub fn start_queue(&self) -> Result<(), ChannelError> {
        self.start(Mode::Queue)
    }

    /// Queues a work item. Items queued before `start_queue` wait for the workers.
    pub fn enqueue<F>(&self, item: F) -> Result<(), ChannelError>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
    {
        if self.inner.lock().lifecycle == Lifecycle::Disposed {
            return Err(ChannelError::ObjectDisposed("WorkerGroup"));
        }

        self.sender
            .send(Box::new(item))
            .map_err(|_| ChannelError::ObjectDisposed("WorkerGroup"))
    }

    /// Tears the running workers down and launches a new set.
    ///
    /// # Returns
    /// `InvalidOperation` before the group is started, `ObjectDisposed` once disposed. A
    /// concurrent `dispose` waits for the restart to finish and then disposes the new set.
    pub async fn restart(&self) -> Result<(), ChannelError> {
        let _transition = self.transition.lock().await;
        let workers = {
            let mut inner = self.inner.lock();
            match inner.lifecycle {
                Lifecycle::Disposed => return Err(ChannelError::ObjectDisposed("WorkerGroup")),
                Lifecycle::Started => {}
                _ => {
                    return Err(ChannelError::InvalidOperation(
                        "the worker group has not been started".to_owned(),
                    ))
                }
            }

            debug!("restarting worker group");
            inner.token.cancel();
            inner.token = CancellationToken::new();
            std::mem::take(&mut inner.workers)
        };

        Self::join(workers).await;

        let mut inner = self.inner.lock();
        if inner.lifecycle == Lifecycle::Disposed {
            return Err(ChannelError::ObjectDisposed("WorkerGroup"));
        }
        self.launch(&mut inner);
        Ok(())
    }

    /// Cancels every worker and waits until each has disposed its state.
    pub async fn dispose(&self) {
        let _transition = self.transition.lock().await;
        let workers = {
            let mut inner = self.inner.lock();
            if inner.lifecycle == Lifecycle::Disposed {
                return;
            }

            inner.lifecycle = Lifecycle::Disposed;
            inner.token.cancel();
            std::mem::take(&mut inner.workers)
        };

        debug!(workers = workers.len(), "disposing worker group");
        Self::join(workers).await;
    }

    fn start(&self, mode: Mode<S>) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock();
        match inner.lifecycle {
            Lifecycle::Disposed => return Err(ChannelError::ObjectDisposed("WorkerGroup")),
            Lifecycle::Initialized => {}
            Lifecycle::Constructed => {
                return Err(ChannelError::InvalidOperation(
                    "the worker group has not been initialized".to_owned(),
                ))
            }
            Lifecycle::Started => {
                return Err(ChannelError::InvalidOperation(
                    "the worker group has already been started".to_owned(),
                ))
            }
        }

        inner.mode = Some(mode);
        inner.lifecycle = Lifecycle::Started;
        self.launch(&mut inner);
        Ok(())
    }

    fn launch(&self, inner: &mut Inner<S>) {
        let (Some(factory), Some(predicate), Some(mode)) = (
            inner.factory.clone(),
            inner.predicate.clone(),
            inner.mode.clone(),
        ) else {
            return;
        };

        debug!(workers = self.min_workers, "starting workers");
        for id in 0..self.min_workers {
            let worker = Worker {
                id,
                factory: factory.clone(),
                predicate: predicate.clone(),
                mode: mode.clone(),
                queue: self.queue.clone(),
                token: inner.token.clone(),
                poll_interval: self.poll_interval,
                retry_delay: self.retry_delay,
            };
            inner.workers.push(tokio::spawn(worker.run()));
        }
    }

    async fn join(workers: Vec<JoinHandle<()>>) {
        for result in join_all(workers).await {
            if let Err(err) = result {
                error!(error = err.to_string(), "worker task failed");
            }
        }
    }
}

impl<S: WorkerState> Worker<S> {
    async fn run(self) {
        let mut state: Option<S> = None;

        while !self.token.is_cancelled() {
            if state.is_none() {
                match (self.factory)(self.token.clone()).await {
                    Ok(created) => state = Some(created),
                    Err(err) => {
                        error!(
                            worker = self.id,
                            error = err.to_string(),
                            "failure to create worker state"
                        );
                        tokio::select! {
                            _ = self.token.cancelled() => break,
                            _ = tokio::time::sleep(self.retry_delay) => continue,
                        }
                    }
                }
            }

            let Some(current) = state.as_mut() else {
                continue;
            };

            let (worked, panicked) = {
                let work = match &self.mode {
                    Mode::Activity(activity) => Some(activity(current)),
                    Mode::Queue => self.next_item().await.map(|item| item(current)),
                };

                match work {
                    Some(work) => (true, AssertUnwindSafe(work).catch_unwind().await.is_err()),
                    None => (false, false),
                }
            };

            if panicked {
                error!(worker = self.id, "unit of work panicked, discarding worker state");
            }

            if panicked || state.as_ref().is_some_and(|current| current.is_faulted()) {
                if !panicked {
                    warn!(worker = self.id, "discarding faulted worker state");
                }
                if let Some(mut discarded) = state.take() {
                    discarded.dispose().await;
                }
            }

            if worked && !(self.predicate)() {
                break;
            }

            tokio::task::yield_now().await;
        }

        if let Some(mut current) = state.take() {
            current.dispose().await;
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn next_item(&self) -> Option<WorkItem<S>> {
        let mut queue = tokio::select! {
            _ = self.token.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };

        tokio::select! {
            _ = self.token.cancelled() => None,
            item = tokio::time::timeout(self.poll_interval, queue.recv()) => item.ok().flatten(),
        }
    }
}

//! Bounded worker pool
//!
//! A fixed set of long-lived worker tasks drains a bounded job queue. Jobs
//! can be handed over without waiting ([`WorkerPool::try_submit`], used to
//! admit connections) or by waiting for queue space ([`WorkerPool::submit`],
//! used for build tasks). A panicking job is caught at the worker boundary
//! and logged; the worker keeps serving.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// A unit of work run by the pool
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool `{0}` is saturated")]
    Saturated(String),

    #[error("Worker pool `{0}` is closed")]
    Closed(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Fixed-size pool of worker tasks over a bounded queue
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `queue_capacity` pending jobs.
    ///
    /// Both values are raised to at least one. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, size: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| tokio::spawn(worker_loop(name.clone(), id, receiver.clone())))
            .collect();

        tracing::debug!("Worker pool `{}` started with {} workers", name, size);

        Self {
            name,
            size,
            sender: Some(sender),
            workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job without waiting; fails immediately when the queue is full
    pub fn try_submit<F>(&self, job: F) -> PoolResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender()?;
        sender.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PoolError::Saturated(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed(self.name.clone()),
        })
    }

    /// Queue a job, waiting for queue space
    pub async fn submit<F>(&self, job: F) -> PoolResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender()?;
        sender
            .send(Box::pin(job))
            .await
            .map_err(|_| PoolError::Closed(self.name.clone()))
    }

    /// Close the queue and wait for every worker to drain it and exit
    pub async fn shutdown(mut self) {
        self.sender.take();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::error!("Worker pool `{}` worker failed: {}", self.name, e);
            }
        }

        tracing::debug!("Worker pool `{}` stopped", self.name);
    }

    fn sender(&self) -> PoolResult<&mpsc::Sender<Job>> {
        self.sender
            .as_ref()
            .ok_or_else(|| PoolError::Closed(self.name.clone()))
    }
}

async fn worker_loop(name: String, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };

        let Some(job) = job else {
            tracing::trace!("Worker {} of pool `{}` exiting", id, name);
            break;
        };

        // Run on its own task so a panic unwinds there instead of here
        if let Err(e) = tokio::spawn(job).await {
            if e.is_panic() {
                tracing::error!("Worker pool `{}` task panicked: {}", name, panic_message(e));
            } else {
                tracing::warn!("Worker pool `{}` task cancelled", name);
            }
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Count of outstanding work items.
///
/// Each [`PendingWork::register`] hands out a guard; dropping the guard
/// completes the item exactly once, whether the work finished, failed or
/// panicked.
#[derive(Debug, Clone, Default)]
pub struct PendingWork {
    inner: Arc<PendingInner>,
}

#[derive(Debug, Default)]
struct PendingInner {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> PendingGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        PendingGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until the count drops to zero
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One registered unit of pending work
#[derive(Debug)]
pub struct PendingGuard {
    inner: Arc<PendingInner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

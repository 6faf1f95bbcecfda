//! Bounded background work queue for backends whose calls must not block
//! the sync engine.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Drops are logged on the first occurrence and then every this many.
const DROP_LOG_EVERY: u64 = 1000;

/// Single-worker queue with drop-when-full semantics.
pub struct WorkQueue<T> {
    name: String,
    tx: Mutex<Option<mpsc::Sender<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Start the worker. Jobs are handled one at a time in arrival order.
    pub fn spawn<F, Fut>(name: impl Into<String>, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                handler(job).await;
            }
            debug!("{} queue worker stopped", worker_name);
        });
        Self {
            name,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without waiting. Returns false when the job was dropped.
    pub fn push(&self, job: T) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!("{} queue is closed, dropping job", self.name);
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    warn!("{} queue is full, dropped {} jobs so far", self.name, dropped);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Jobs dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs and wait for the worker to drain what is queued.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("{} queue worker failed: {}", self.name, e);
            }
        }
    }
}

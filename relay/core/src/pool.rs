//! Bounded Worker Pool
//!
//! Runs chat operations on a bounded set of tokio worker tasks with a bounded
//! backlog, so a burst of requests applies backpressure instead of spawning
//! without limit.
//!
//! # Sizing
//!
//! ```text
//!   submit ──► workers < core_size ? ──yes──► new worker runs the job
//!                    │ no
//!                    ▼
//!              backlog has room ? ──yes──► queued for the next idle worker
//!                    │ no
//!                    ▼
//!              workers < max_size ? ──yes──► surplus worker runs the job
//!                    │ no
//!                    ▼
//!              PoolError::Saturated
//! ```
//!
//! Surplus workers (beyond `core_size`) retire after sitting idle for
//! `keep_alive`. Core workers live until [`WorkerPool::shutdown`].
//!
//! Capacity is claimed up front with [`WorkerPool::try_reserve`], so a caller
//! learns about saturation before it gives up ownership of the job.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::sync::Mutex;

/// A unit of work for the pool
pub type Job = BoxFuture<'static, ()>;

/// Errors from submitting work
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker is busy and the backlog is full
    #[error("Worker pool saturated: {workers} workers busy, {queued} operations queued")]
    Saturated {
        /// Live workers at the time of rejection
        workers: usize,
        /// Queued operations at the time of rejection
        queued: usize,
    },

    /// The pool no longer accepts work
    #[error("Worker pool is shut down")]
    Shutdown,
}

/// Worker pool sizing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Workers kept alive while idle
    pub core_size: usize,
    /// Upper bound on live workers
    pub max_size: usize,
    /// Idle time after which a surplus worker retires
    pub keep_alive: Duration,
    /// Operations that may wait for a worker
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 2,
            max_size: 4,
            keep_alive: Duration::from_secs(90),
            queue_capacity: 50,
        }
    }
}

impl PoolConfig {
    /// Clamp the sizing into a usable shape
    ///
    /// `max_size` is at least 1 and at least `core_size`; the backlog holds at
    /// least one operation.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(self.core_size).max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}

struct PoolInner {
    config: PoolConfig,
    runtime: Handle,
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    receiver: Mutex<mpsc::Receiver<Job>>,
    workers: AtomicUsize,
}

impl PoolInner {
    /// Claim a worker slot if fewer than `limit` workers are live
    fn try_add_worker(&self, limit: usize) -> bool {
        let mut current = self.workers.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return false;
            }
            match self.workers.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give up a worker slot if more than `core_size` workers are live
    fn try_retire(&self) -> bool {
        let mut current = self.workers.load(Ordering::SeqCst);
        loop {
            if current <= self.config.core_size {
                return false;
            }
            match self.workers.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn queued(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }
}

fn spawn_worker(inner: Arc<PoolInner>, first: Option<Job>) {
    let runtime = inner.runtime.clone();
    runtime.spawn(run_worker(inner, first));
}

async fn run_job(job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        tracing::error!("Pool job panicked");
    }
}

async fn run_worker(inner: Arc<PoolInner>, first: Option<Job>) {
    if let Some(job) = first {
        run_job(job).await;
    }

    loop {
        let next = tokio::time::timeout(inner.config.keep_alive, async {
            inner.receiver.lock().await.recv().await
        })
        .await;

        match next {
            Ok(Some(job)) => run_job(job).await,
            // Queue closed and drained
            Ok(None) => break,
            Err(_idle) => {
                if inner.try_retire() {
                    tracing::debug!("Surplus worker retired after keep-alive");
                    return;
                }
            }
        }
    }

    inner.workers.fetch_sub(1, Ordering::SeqCst);
}

/// Claimed capacity for one job
///
/// Dropping a reservation without submitting releases the capacity.
#[must_use = "a reservation holds pool capacity until submitted or dropped"]
pub struct Reservation {
    inner: Arc<PoolInner>,
    slot: Option<Slot>,
}

enum Slot {
    Worker,
    Queued(OwnedPermit<Job>),
}

impl Reservation {
    /// Hand the job to the pool
    pub fn submit(mut self, job: Job) {
        match self.slot.take() {
            Some(Slot::Worker) => spawn_worker(Arc::clone(&self.inner), Some(job)),
            Some(Slot::Queued(permit)) => {
                permit.send(job);
                // A pool with no core workers may have nobody to drain the queue
                if self.inner.workers.load(Ordering::SeqCst) == 0
                    && self.inner.try_add_worker(self.inner.config.max_size)
                {
                    spawn_worker(Arc::clone(&self.inner), None);
                }
            }
            None => {}
        }
    }

    /// Whether the job will start on a fresh worker rather than wait in the backlog
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self.slot, Some(Slot::Worker))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(Slot::Worker) = self.slot.take() {
            self.inner.workers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Bounded pool of tokio worker tasks
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool whose workers run on `runtime`
    #[must_use]
    pub fn new(config: PoolConfig, runtime: Handle) -> Self {
        let config = config.normalized();
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        tracing::debug!(
            core_size = config.core_size,
            max_size = config.max_size,
            queue_capacity = config.queue_capacity,
            keep_alive_secs = config.keep_alive.as_secs(),
            "Worker pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                config,
                runtime,
                sender: RwLock::new(Some(tx)),
                receiver: Mutex::new(rx),
                workers: AtomicUsize::new(0),
            }),
        }
    }

    /// Claim capacity for one job
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Saturated`] when every worker is busy and the
    /// backlog is full, or [`PoolError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn try_reserve(&self) -> Result<Reservation, PoolError> {
        let sender = self.inner.sender.read().clone().ok_or(PoolError::Shutdown)?;

        if self.inner.try_add_worker(self.inner.config.core_size) {
            return Ok(self.reservation(Slot::Worker));
        }

        match sender.try_reserve_owned() {
            Ok(permit) => Ok(self.reservation(Slot::Queued(permit))),
            Err(TrySendError::Full(_)) => {
                if self.inner.try_add_worker(self.inner.config.max_size) {
                    Ok(self.reservation(Slot::Worker))
                } else {
                    Err(PoolError::Saturated {
                        workers: self.workers(),
                        queued: self.queued(),
                    })
                }
            }
            Err(TrySendError::Closed(_)) => Err(PoolError::Shutdown),
        }
    }

    /// Reserve capacity and submit in one step
    ///
    /// # Errors
    ///
    /// Same as [`try_reserve`](Self::try_reserve); the job is dropped on error.
    pub fn try_submit(&self, job: Job) -> Result<(), PoolError> {
        self.try_reserve()?.submit(job);
        Ok(())
    }

    fn reservation(&self, slot: Slot) -> Reservation {
        Reservation {
            inner: Arc::clone(&self.inner),
            slot: Some(slot),
        }
    }

    /// Stop accepting work; queued jobs still run, then workers exit
    pub fn shutdown(&self) {
        if self.inner.sender.write().take().is_some() {
            tracing::info!(workers = self.workers(), "Worker pool shutting down");
        }
    }

    /// Whether the pool still accepts work
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.sender.read().is_some()
    }

    /// Live worker count
    #[must_use]
    pub fn workers(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the backlog
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queued()
    }

    /// Pool sizing
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Runtime the workers are spawned on
    #[must_use]
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("workers", &self.workers())
            .field("queued", &self.queued())
            .finish()
    }
}

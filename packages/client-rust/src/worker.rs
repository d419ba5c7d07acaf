//! Background worker for periodic and on-demand cache maintenance.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc
//! channel via a `BackgroundRunnable` implementation, with periodic tick
//! callbacks, and `CacheGcRunnable`, which sweeps a [`QueryStore`] on every
//! tick.

use std::time::Duration;

use async_trait::async_trait;
use ledger_core::QueryKey;
use tokio::sync::{mpsc, oneshot};

use crate::store::QueryStore;

/// Capacity of a worker's task channel.
const TASK_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// GcTask
// ---------------------------------------------------------------------------

/// Task variants for the cache garbage collection worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcTask {
    /// Evict every expired, unreferenced entry now.
    SweepAll,
    /// Drop every entry under a prefix regardless of age.
    Remove(QueryKey),
}

// ---------------------------------------------------------------------------
// CacheGcRunnable
// ---------------------------------------------------------------------------

/// Sweeps expired entries out of a [`QueryStore`].
pub struct CacheGcRunnable<V> {
    store: QueryStore<V>,
}

impl<V: Clone + Send + Sync + 'static> CacheGcRunnable<V> {
    #[must_use]
    pub fn new(store: QueryStore<V>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> BackgroundRunnable for CacheGcRunnable<V> {
    type Task = GcTask;

    async fn run(&mut self, task: GcTask) {
        match task {
            GcTask::SweepAll => {
                self.store.sweep();
            }
            GcTask::Remove(prefix) => {
                let removed = self.store.remove(&prefix);
                tracing::debug!(prefix = %prefix, removed, "gc removed entries");
            }
        }
    }

    async fn on_tick(&mut self) {
        self.store.sweep();
    }

    async fn shutdown(&mut self) {
        tracing::debug!(entries = self.store.len(), "cache gc worker stopped");
    }
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Periodically calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable and tick interval.
    ///
    /// Must be called from within a tokio runtime. A zero interval is raised
    /// to one millisecond.
    #[must_use]
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = tick_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Returns `true` until [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the worker gracefully, waiting for the worker task to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

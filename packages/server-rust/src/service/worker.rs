//! Bounded task queue served by one tokio task.
//!
//! Live-query delivery shards run on [`BackgroundWorker`]: tasks are handled
//! one at a time in submission order, and stopping drains whatever is
//! already queued before [`BackgroundRunnable::shutdown`] runs.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Handler executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Runs once after the last task. Default is a no-op.
    async fn shutdown(&mut self) {}
}

/// A runnable driven from a bounded mpsc queue.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    tx: Option<mpsc::Sender<R::Task>>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<usize>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task. `capacity` bounds the queue; submitters wait
    /// while it is full. Must be called inside a tokio runtime.
    pub fn start(name: &'static str, mut runnable: R, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut handled = 0usize;
            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => {
                            runnable.run(task).await;
                            handled += 1;
                        }
                        None => break,
                    },
                    _ = &mut stop_rx => {
                        rx.close();
                        while let Some(task) = rx.recv().await {
                            runnable.run(task).await;
                            handled += 1;
                        }
                        break;
                    }
                }
            }
            runnable.shutdown().await;
            handled
        });

        debug!(worker = name, capacity, "background worker started");
        Self {
            name,
            tx: Some(tx),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task, waiting for space.
    ///
    /// # Errors
    ///
    /// Returns an error once the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker {} not running", self.name))?;
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker {} queue closed", self.name))
    }

    /// A sender for submitting without borrowing the worker; sends fail
    /// once the worker has stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    /// Stops accepting tasks, runs the ones already queued, then waits for
    /// the worker task.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(handled) => debug!(worker = self.name, handled, "background worker stopped"),
                Err(err) => debug!(worker = self.name, error = %err, "background worker aborted"),
            }
        }
    }
}

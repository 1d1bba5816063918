//! Bounded fan-out of live-query events to clients.
//!
//! Events are queued on one of a fixed set of [`BackgroundWorker`] shards.
//! A client is pinned to shard `client_id % shards`, so its events are
//! pushed in the order they were submitted. A full shard makes submitters
//! wait; a client whose channel stays full past `send_timeout` loses the
//! event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use basalt_core::messages::ServerMessage;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::client::{LiveClient, SendError};
use crate::service::{BackgroundRunnable, BackgroundWorker, LiveQueryConfig};

/// One message bound for one client.
#[derive(Debug)]
pub struct DeliveryTask {
    pub client: Arc<LiveClient>,
    pub message: ServerMessage,
}

struct DeliveryRunnable {
    shard: usize,
    send_timeout: Duration,
}

#[async_trait]
impl BackgroundRunnable for DeliveryRunnable {
    type Task = DeliveryTask;

    async fn run(&mut self, task: DeliveryTask) {
        let client = task.client.id.0;
        match task.client.send_timeout(task.message, self.send_timeout).await {
            Ok(()) => {}
            Err(SendError::Timeout) => {
                metrics::counter!("basalt_live_dropped_total").increment(1);
                warn!(client, shard = self.shard, "client channel full, event dropped");
            }
            Err(SendError::Disconnected) => {
                metrics::counter!("basalt_live_dropped_total").increment(1);
                debug!(client, shard = self.shard, "client gone, event dropped");
            }
        }
    }

    async fn shutdown(&mut self) {
        debug!(shard = self.shard, "delivery shard stopped");
    }
}

/// Fixed pool of delivery shards.
pub struct DeliveryPool {
    senders: Vec<mpsc::Sender<DeliveryTask>>,
    workers: Mutex<Vec<BackgroundWorker<DeliveryRunnable>>>,
}

impl DeliveryPool {
    /// Starts `delivery_workers` shards. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn start(config: &LiveQueryConfig) -> Self {
        let shards = config.delivery_workers.max(1);
        let workers: Vec<_> = (0..shards)
            .map(|shard| {
                BackgroundWorker::start(
                    "live-delivery",
                    DeliveryRunnable {
                        shard,
                        send_timeout: config.send_timeout,
                    },
                    config.delivery_queue_capacity,
                )
            })
            .collect();
        let senders = workers.iter().filter_map(BackgroundWorker::sender).collect();
        Self {
            senders,
            workers: Mutex::new(workers),
        }
    }

    /// Queues `task` on its client's shard, waiting while the shard is full.
    ///
    /// # Errors
    ///
    /// Returns an error once the pool has been stopped.
    pub async fn submit(&self, task: DeliveryTask) -> anyhow::Result<()> {
        let shard = self.shard_of(&task.client);
        let sender = self
            .senders
            .get(shard)
            .ok_or_else(|| anyhow::anyhow!("delivery pool has no shards"))?;
        sender
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("delivery shard {shard} stopped"))
    }

    fn shard_of(&self, client: &LiveClient) -> usize {
        let shards = u64::try_from(self.senders.len()).unwrap_or(1).max(1);
        usize::try_from(client.id.0 % shards).unwrap_or(0)
    }

    #[must_use]
    pub fn shards(&self) -> usize {
        self.senders.len()
    }

    /// Stops every shard after it has pushed the tasks already queued.
    pub async fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for mut worker in workers {
            worker.stop().await;
        }
    }
}

impl std::fmt::Debug for DeliveryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPool")
            .field("shards", &self.senders.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use basalt_core::messages::ConnectedPayload;

    use super::*;
    use crate::live::client::ClientRegistry;

    fn msg(n: u64) -> ServerMessage {
        ServerMessage::Connected(ConnectedPayload { client_id: n })
    }

    fn config(workers: usize) -> LiveQueryConfig {
        LiveQueryConfig {
            delivery_workers: workers,
            delivery_queue_capacity: 8,
            client_channel_capacity: 8,
            send_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn per_client_order_is_kept() {
        let pool = DeliveryPool::start(&config(3));
        assert_eq!(pool.shards(), 3);
        let registry = ClientRegistry::new();
        let (client, mut rx) = registry.register(None, 16);

        for n in 0..10 {
            pool.submit(DeliveryTask {
                client: Arc::clone(&client),
                message: msg(n),
            })
            .await
            .unwrap();
        }
        for n in 0..10 {
            assert_eq!(rx.recv().await, Some(msg(n)));
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn full_client_drops_after_timeout() {
        let pool = DeliveryPool::start(&config(1));
        let registry = ClientRegistry::new();
        let (slow, mut slow_rx) = registry.register(None, 1);
        let (fast, mut fast_rx) = registry.register(None, 4);

        for n in 0..2 {
            pool.submit(DeliveryTask {
                client: Arc::clone(&slow),
                message: msg(n),
            })
            .await
            .unwrap();
        }
        pool.submit(DeliveryTask {
            client: Arc::clone(&fast),
            message: msg(7),
        })
        .await
        .unwrap();

        assert_eq!(fast_rx.recv().await, Some(msg(7)));
        assert_eq!(slow_rx.recv().await, Some(msg(0)));
        assert!(slow_rx.try_recv().is_err());
        pool.stop().await;
    }

    #[tokio::test]
    async fn stopped_pool_rejects_tasks() {
        let pool = DeliveryPool::start(&config(2));
        pool.stop().await;
        let registry = ClientRegistry::new();
        let (client, _rx) = registry.register(None, 1);
        assert!(pool.submit(DeliveryTask { client, message: msg(1) }).await.is_err());
    }
}

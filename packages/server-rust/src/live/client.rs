//! Live-query clients and their registry.
//!
//! Each client gets a bounded outbound channel for backpressure; the
//! receiver is drained by whatever transport carries the client's traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_core::messages::ServerMessage;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::auth::Auth;

/// Identifier of a connected client, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// Error returned when pushing a message to a client fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    Timeout,
    /// The receiver was dropped.
    Disconnected,
}

/// What a client subscribed to under one request id.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub class_name: String,
    /// Key of the shared subscription in the registry.
    pub hash: String,
    pub fields: Option<Vec<String>>,
    /// Principal events of this request are filtered for.
    pub auth: Auth,
}

/// A connected live-query client.
#[derive(Debug)]
pub struct LiveClient {
    pub id: ClientId,
    tx: mpsc::Sender<ServerMessage>,
    session_token: RwLock<Option<String>>,
    subscriptions: RwLock<HashMap<u64, SubscriptionInfo>>,
    pub connected_at: Instant,
}

impl LiveClient {
    /// Pushes a message, waiting at most `timeout` for channel space.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Timeout`] if the channel stays full and
    /// [`SendError::Disconnected`] once the receiver is gone.
    pub async fn send_timeout(
        &self,
        msg: ServerMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Pushes a message without waiting; `false` if full or closed.
    #[must_use]
    pub fn try_send(&self, msg: ServerMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Session token given at connect time.
    #[must_use]
    pub fn session_token(&self) -> Option<String> {
        self.session_token.read().clone()
    }

    pub fn set_session_token(&self, token: Option<String>) {
        *self.session_token.write() = token;
    }

    #[must_use]
    pub fn subscription(&self, request_id: u64) -> Option<SubscriptionInfo> {
        self.subscriptions.read().get(&request_id).cloned()
    }

    /// Records a subscription, returning the one it replaces.
    pub fn add_subscription(
        &self,
        request_id: u64,
        info: SubscriptionInfo,
    ) -> Option<SubscriptionInfo> {
        self.subscriptions.write().insert(request_id, info)
    }

    pub fn remove_subscription(&self, request_id: u64) -> Option<SubscriptionInfo> {
        self.subscriptions.write().remove(&request_id)
    }

    /// Removes and returns every subscription of the client.
    pub fn drain_subscriptions(&self) -> Vec<(u64, SubscriptionInfo)> {
        self.subscriptions.write().drain().collect()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

/// Concurrent registry of connected clients.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<LiveClient>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a client, returning it and the receiver of its outbound
    /// messages.
    pub fn register(
        &self,
        session_token: Option<String>,
        channel_capacity: usize,
    ) -> (Arc<LiveClient>, mpsc::Receiver<ServerMessage>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let client = Arc::new(LiveClient {
            id,
            tx,
            session_token: RwLock::new(session_token),
            subscriptions: RwLock::new(HashMap::new()),
            connected_at: Instant::now(),
        });
        self.clients.insert(id, Arc::clone(&client));
        (client, rx)
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<LiveClient>> {
        self.clients.remove(&id).map(|(_, client)| client)
    }

    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<Arc<LiveClient>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

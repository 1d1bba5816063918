//! The live-query server: client lifecycle, subscriptions and event fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use basalt_core::live_match::{classify_save, matches_query};
use basalt_core::messages::{
    ClientMessage, ConnectedPayload, ErrorPayload, EventOp, EventPayload, RequestAck, ServerMessage,
    SubscribeRequest,
};
use basalt_core::{Acl, ChangeNotifier, Error, Map, Result, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client::{ClientId, ClientRegistry, LiveClient, SubscriptionInfo};
use super::delivery::{DeliveryPool, DeliveryTask};
use super::subscription::{Subscription, SubscriptionRegistry};
use crate::auth::{Auth, AuthResolver};
use crate::query::sanitize::sanitize_row;
use crate::service::ServerContext;

/// Fields every delivered object keeps regardless of `fields`.
const ALWAYS_DELIVERED: [&str; 4] = ["objectId", "className", "createdAt", "updatedAt"];

/// Tracks connected clients and their subscriptions and pushes matching
/// changes to them.
///
/// Register it on the write path with
/// [`WriteExecutor::with_notifier`](crate::query::WriteExecutor::with_notifier).
pub struct LiveQueryServer {
    ctx: Arc<ServerContext>,
    resolver: Arc<AuthResolver>,
    clients: ClientRegistry,
    subscriptions: SubscriptionRegistry,
    pool: DeliveryPool,
}

impl LiveQueryServer {
    /// Creates the server and starts its delivery pool. Must be called
    /// inside a tokio runtime.
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>, resolver: Arc<AuthResolver>) -> Self {
        let pool = DeliveryPool::start(&ctx.config.live);
        info!(shards = pool.shards(), "live query server started");
        Self {
            ctx,
            resolver,
            clients: ClientRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            pool,
        }
    }

    /// Registers a client and queues its `connected` acknowledgement.
    ///
    /// The receiver yields every message for the client and is drained by
    /// the transport.
    pub fn connect(
        &self,
        session_token: Option<String>,
    ) -> (Arc<LiveClient>, mpsc::Receiver<ServerMessage>) {
        let (client, rx) = self
            .clients
            .register(session_token, self.ctx.config.live.client_channel_capacity);
        debug!(client = client.id.0, "client connected");
        let connected = ServerMessage::Connected(ConnectedPayload { client_id: client.id.0 });
        if !client.try_send(connected) {
            warn!(client = client.id.0, "connected acknowledgement dropped");
        }
        (client, rx)
    }

    /// Subscribes `client_id` to a query under `request.request_id`,
    /// replacing an earlier subscription with the same request id.
    ///
    /// The request's session token, or else the connection's, decides which
    /// objects the subscription may see.
    ///
    /// # Errors
    ///
    /// - `ObjectNotFound` for an unknown client
    /// - `InvalidSessionToken` for an invalid session
    pub async fn subscribe(&self, client_id: ClientId, request: SubscribeRequest) -> Result<()> {
        let client = self.client(client_id)?;
        let token = request.session_token.clone().or_else(|| client.session_token());
        let auth = match token {
            Some(token) => self.resolver.for_token(&token).await?,
            None => Auth::nobody(),
        };

        let SubscribeRequest { request_id, query, .. } = request;
        if let Some(previous) = client.remove_subscription(request_id) {
            self.release(client_id, request_id, &previous);
        }
        let hash = self
            .subscriptions
            .add(&query.class_name, &query.where_clause, client_id, request_id);
        let info = SubscriptionInfo {
            class_name: query.class_name,
            hash,
            fields: query.fields,
            auth,
        };
        debug!(client = client_id.0, request_id, class = %info.class_name, "subscribed");
        client.add_subscription(request_id, info);
        self.reply(&client, ServerMessage::Subscribed(RequestAck {
            client_id: client_id.0,
            request_id,
        }));
        Ok(())
    }

    /// Removes one subscription of a client.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` for an unknown client or request id.
    pub fn unsubscribe(&self, client_id: ClientId, request_id: u64) -> Result<()> {
        let client = self.client(client_id)?;
        let info = client.remove_subscription(request_id).ok_or_else(|| {
            Error::ObjectNotFound(format!("no subscription with request id {request_id}"))
        })?;
        self.release(client_id, request_id, &info);
        debug!(client = client_id.0, request_id, "unsubscribed");
        self.reply(&client, ServerMessage::Unsubscribed(RequestAck {
            client_id: client_id.0,
            request_id,
        }));
        Ok(())
    }

    /// Forgets a client and every subscription it holds.
    pub fn disconnect(&self, client_id: ClientId) {
        let Some(client) = self.clients.remove(client_id) else {
            return;
        };
        for (request_id, info) in client.drain_subscriptions() {
            self.release(client_id, request_id, &info);
        }
        debug!(client = client_id.0, "client disconnected");
    }

    /// Handles one raw client message. Failures are reported to the client
    /// as `error` messages.
    pub async fn handle_message(&self, client_id: ClientId, raw: &str) {
        let Some(client) = self.clients.get(client_id) else {
            warn!(client = client_id.0, "message from unknown client");
            return;
        };
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                let err = Error::InvalidJson(format!("malformed live query message: {err}"));
                self.reply(&client, error_message(client_id, None, &err));
                return;
            }
        };

        let (request_id, outcome) = match message {
            ClientMessage::Connect(connect) => {
                client.set_session_token(connect.session_token);
                let connected = ConnectedPayload { client_id: client_id.0 };
                self.reply(&client, ServerMessage::Connected(connected));
                (None, Ok(()))
            }
            ClientMessage::Subscribe(request) => {
                let request_id = request.request_id;
                (Some(request_id), self.subscribe(client_id, request).await)
            }
            ClientMessage::Unsubscribe(request) => {
                (Some(request.request_id), self.unsubscribe(client_id, request.request_id))
            }
        };
        if let Err(err) = outcome {
            debug!(client = client_id.0, error = %err, "live query request failed");
            self.reply(&client, error_message(client_id, request_id, &err));
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.count()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Stops the delivery pool.
    pub async fn shutdown(&self) {
        self.pool.stop().await;
        info!("live query server stopped");
    }

    fn client(&self, client_id: ClientId) -> Result<Arc<LiveClient>> {
        self.clients
            .get(client_id)
            .ok_or_else(|| {
                Error::ObjectNotFound(format!("client {} is not connected", client_id.0))
            })
    }

    fn release(&self, client_id: ClientId, request_id: u64, info: &SubscriptionInfo) {
        self.subscriptions
            .remove(&info.class_name, &info.hash, client_id, request_id);
    }

    fn reply(&self, client: &LiveClient, message: ServerMessage) {
        if !client.try_send(message) {
            metrics::counter!("basalt_live_dropped_total").increment(1);
            warn!(client = client.id.0, "reply dropped, client channel full");
        }
    }

    /// Queues `op` for every request of `subscription` allowed to see
    /// `object`.
    async fn dispatch(&self, subscription: &Subscription, op: EventOp, object: &Map) {
        let acl = match object.get("ACL") {
            Some(value) => match Acl::from_value(value) {
                Ok(acl) => Some(acl),
                Err(err) => {
                    warn!(
                        class = %subscription.class_name,
                        error = %err,
                        "unreadable ACL, event skipped"
                    );
                    return;
                }
            },
            None => None,
        };

        for (client_id, request_ids) in &subscription.clients {
            let Some(client) = self.clients.get(*client_id) else {
                continue;
            };
            for request_id in request_ids {
                let Some(info) = client.subscription(*request_id) else {
                    continue;
                };
                if let Some(acl) = &acl {
                    match info.auth.can_read(&self.ctx, acl).await {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(err) => {
                            warn!(
                                client = client_id.0,
                                error = %err,
                                "cannot evaluate ACL, event skipped"
                            );
                            continue;
                        }
                    }
                }

                let payload = EventPayload {
                    client_id: client_id.0,
                    request_id: *request_id,
                    object: project(object, info.fields.as_deref()),
                };
                metrics::counter!("basalt_live_events_total", "op" => op.as_str()).increment(1);
                let task = DeliveryTask {
                    client: Arc::clone(&client),
                    message: op.into_message(payload),
                };
                if let Err(err) = self.pool.submit(task).await {
                    warn!(client = client_id.0, error = %err, "event not queued");
                }
            }
        }
    }
}

#[async_trait]
impl ChangeNotifier for LiveQueryServer {
    async fn after_save(
        &self,
        class_name: &str,
        current: &Map,
        original: Option<&Map>,
    ) -> anyhow::Result<()> {
        let subscriptions = self.subscriptions.matching(class_name);
        if subscriptions.is_empty() {
            return Ok(());
        }
        let object = with_class_name(current, class_name);
        for subscription in subscriptions {
            let original_matched = original.map(|o| matches_query(o, &subscription.where_clause));
            let current_matched = matches_query(current, &subscription.where_clause);
            if let Some(op) = classify_save(original_matched, current_matched) {
                self.dispatch(&subscription, op, &object).await;
            }
        }
        Ok(())
    }

    async fn after_delete(&self, class_name: &str, object: &Map) -> anyhow::Result<()> {
        let subscriptions = self.subscriptions.matching(class_name);
        if subscriptions.is_empty() {
            return Ok(());
        }
        let delivered = with_class_name(object, class_name);
        for subscription in subscriptions {
            if matches_query(object, &subscription.where_clause) {
                self.dispatch(&subscription, EventOp::Delete, &delivered).await;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LiveQueryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQueryServer")
            .field("clients", &self.clients.count())
            .field("subscriptions", &self.subscriptions.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// The delivered form of `object`: sanitized and tagged with its class.
fn with_class_name(object: &Map, class_name: &str) -> Map {
    let mut object = object.clone();
    sanitize_row(class_name, &mut object);
    object.insert("className".to_string(), Value::from(class_name));
    object
}

fn project(object: &Map, fields: Option<&[String]>) -> Map {
    let Some(fields) = fields else {
        return object.clone();
    };
    object
        .iter()
        .filter(|(key, _)| {
            ALWAYS_DELIVERED.contains(&key.as_str()) || fields.iter().any(|f| f == *key)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn error_message(client_id: ClientId, request_id: Option<u64>, err: &Error) -> ServerMessage {
    ServerMessage::Error(ErrorPayload {
        client_id: client_id.0,
        request_id,
        code: err.code(),
        error: err.message().to_string(),
        reconnect: false,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use basalt_core::messages::LiveQuery;
    use serde_json::json;

    use super::*;
    use crate::query::WriteExecutor;
    use crate::service::ServerConfig;
    use crate::storage::{MemorySchemaProvider, MemoryStorage};

    struct Harness {
        resolver: Arc<AuthResolver>,
        live: Arc<LiveQueryServer>,
        writer: WriteExecutor,
    }

    fn harness() -> Harness {
        let ctx = ServerContext::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemorySchemaProvider::new()),
            ServerConfig::default(),
        );
        let resolver = Arc::new(AuthResolver::new(Arc::clone(&ctx)));
        let live = Arc::new(LiveQueryServer::new(Arc::clone(&ctx), Arc::clone(&resolver)));
        let writer = WriteExecutor::new(Arc::clone(&ctx))
            .with_notifier(Arc::clone(&live) as Arc<dyn ChangeNotifier>);
        Harness {
            resolver,
            live,
            writer,
        }
    }

    fn map(j: serde_json::Value) -> Map {
        match Value::from_json(j).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn subscribe_request(
        request_id: u64,
        where_clause: serde_json::Value,
        fields: Option<Vec<&str>>,
    ) -> SubscribeRequest {
        SubscribeRequest {
            request_id,
            query: LiveQuery {
                class_name: "Player".to_string(),
                where_clause: map(where_clause),
                fields: fields.map(|f| f.into_iter().map(String::from).collect()),
            },
            session_token: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message in time")
            .expect("channel open")
    }

    fn event(message: &ServerMessage) -> (&'static str, &EventPayload) {
        match message {
            ServerMessage::Create(p) => ("create", p),
            ServerMessage::Update(p) => ("update", p),
            ServerMessage::Enter(p) => ("enter", p),
            ServerMessage::Leave(p) => ("leave", p),
            ServerMessage::Delete(p) => ("delete", p),
            other => panic!("expected an event, got {other:?}"),
        }
    }

    fn id_of(object: &Map) -> String {
        object.get("objectId").and_then(Value::as_str).unwrap().to_string()
    }

    #[tokio::test]
    async fn lifecycle_events_follow_the_query() {
        let h = harness();
        let (client, mut rx) = h.live.connect(None);
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Connected(ConnectedPayload { client_id: client.id.0 })
        );

        let request = subscribe_request(1, json!({"score": {"$gt": 10}}), Some(vec!["score"]));
        h.live
            .subscribe(client.id, request)
            .await
            .unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::Subscribed(_)));

        let master = Auth::master();
        let created = h
            .writer
            .create(&master, "Player", &map(json!({"name": "ann", "score": 20})))
            .await
            .unwrap();
        let id = id_of(&created);
        let msg = next(&mut rx).await;
        let (op, payload) = event(&msg);
        assert_eq!(op, "create");
        assert_eq!(payload.request_id, 1);
        assert_eq!(payload.object.get("className"), Some(&Value::from("Player")));
        assert!(payload.object.contains_key("score") && !payload.object.contains_key("name"));

        h.writer.update(&master, "Player", &id, &map(json!({"score": 30}))).await.unwrap();
        assert_eq!(event(&next(&mut rx).await).0, "update");
        h.writer.update(&master, "Player", &id, &map(json!({"score": 1}))).await.unwrap();
        assert_eq!(event(&next(&mut rx).await).0, "leave");
        h.writer.update(&master, "Player", &id, &map(json!({"score": 2}))).await.unwrap();
        h.writer.update(&master, "Player", &id, &map(json!({"score": 40}))).await.unwrap();
        assert_eq!(event(&next(&mut rx).await).0, "enter");
        h.writer.delete(&master, "Player", &id).await.unwrap();
        assert_eq!(event(&next(&mut rx).await).0, "delete");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn acl_filters_events() {
        let h = harness();
        let user = h
            .writer
            .create(
                &Auth::master(),
                basalt_core::schema::USER_CLASS,
                &map(json!({"username": "ann"})),
            )
            .await
            .unwrap();
        let user_id = id_of(&user);
        let token = h.resolver.create_session(&user_id, None).await.unwrap();

        let (anonymous, mut anonymous_rx) = h.live.connect(None);
        let (owner, mut owner_rx) = h.live.connect(Some(token));
        for client in [&anonymous, &owner] {
            h.live.subscribe(client.id, subscribe_request(1, json!({}), None)).await.unwrap();
        }
        next(&mut anonymous_rx).await;
        next(&mut anonymous_rx).await;
        next(&mut owner_rx).await;
        next(&mut owner_rx).await;

        let mut acl = serde_json::Map::new();
        acl.insert(user_id.clone(), json!({"read": true}));
        h.writer
            .create(&Auth::master(), "Player", &map(json!({"name": "secret", "ACL": acl})))
            .await
            .unwrap();
        h.writer
            .create(&Auth::master(), "Player", &map(json!({"name": "public"})))
            .await
            .unwrap();

        let first = next(&mut owner_rx).await;
        assert_eq!(event(&first).1.object.get("name"), Some(&Value::from("secret")));
        let seen = next(&mut anonymous_rx).await;
        assert_eq!(event(&seen).1.object.get("name"), Some(&Value::from("public")));
    }

    #[tokio::test]
    async fn user_events_never_carry_passwords() {
        let h = harness();
        let (client, mut rx) = h.live.connect(None);
        next(&mut rx).await;
        let request = SubscribeRequest {
            request_id: 3,
            query: LiveQuery {
                class_name: basalt_core::schema::USER_CLASS.to_string(),
                where_clause: Map::new(),
                fields: None,
            },
            session_token: None,
        };
        h.live.subscribe(client.id, request).await.unwrap();
        next(&mut rx).await;

        let raw = map(json!({"objectId": "u1", "username": "ann", "password": "hunter2"}));
        h.live.after_save(basalt_core::schema::USER_CLASS, &raw, None).await.unwrap();
        let msg = next(&mut rx).await;
        let (op, payload) = event(&msg);
        assert_eq!(op, "create");
        assert!(!payload.object.contains_key("password"));
        assert_eq!(payload.object.get("username"), Some(&Value::from("ann")));
    }

    #[tokio::test]
    async fn shared_subscriptions_and_cleanup() {
        let h = harness();
        let (a, _rx_a) = h.live.connect(None);
        let (b, _rx_b) = h.live.connect(None);
        h.live.subscribe(a.id, subscribe_request(1, json!({"name": "x"}), None)).await.unwrap();
        h.live.subscribe(b.id, subscribe_request(5, json!({"name": "x"}), None)).await.unwrap();
        h.live.subscribe(a.id, subscribe_request(2, json!({}), None)).await.unwrap();
        assert_eq!(h.live.subscription_count(), 2);

        h.live.unsubscribe(a.id, 2).unwrap();
        assert_eq!(h.live.subscription_count(), 1);
        assert!(matches!(h.live.unsubscribe(a.id, 2), Err(Error::ObjectNotFound(_))));

        h.live.disconnect(a.id);
        assert_eq!(h.live.subscription_count(), 1);
        h.live.disconnect(b.id);
        assert_eq!(h.live.subscription_count(), 0);
        assert_eq!(h.live.client_count(), 0);
        assert!(h.live.subscribe(a.id, subscribe_request(1, json!({}), None)).await.is_err());
    }

    #[tokio::test]
    async fn raw_messages_and_errors() {
        let h = harness();
        let (client, mut rx) = h.live.connect(None);
        next(&mut rx).await;

        h.live.handle_message(client.id, "not json").await;
        let ServerMessage::Error(err) = next(&mut rx).await else {
            panic!("expected an error");
        };
        assert_eq!(err.code, 107);
        assert_eq!(err.request_id, None);

        let subscribe = json!({
            "op": "subscribe",
            "requestId": 3,
            "query": {"className": "Player", "where": {"name": "x"}},
            "sessionToken": "r:bogus",
        });
        h.live.handle_message(client.id, &subscribe.to_string()).await;
        let ServerMessage::Error(err) = next(&mut rx).await else {
            panic!("expected an error");
        };
        assert_eq!((err.code, err.request_id), (209, Some(3)));

        let subscribe = json!({
            "op": "subscribe",
            "requestId": 4,
            "query": {"className": "Player"},
        });
        h.live.handle_message(client.id, &subscribe.to_string()).await;
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Subscribed(RequestAck { client_id: client.id.0, request_id: 4 })
        );
        h.live
            .handle_message(client.id, &json!({"op": "unsubscribe", "requestId": 4}).to_string())
            .await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Unsubscribed(_)));
        h.live.shutdown().await;
    }
}

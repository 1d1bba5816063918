//! Shared subscriptions with lock-free snapshot reads.
//!
//! Clients subscribing to the same `(class, where)` pair share one
//! [`Subscription`]. The registry publishes an immutable snapshot through
//! `ArcSwap`: event matching loads one snapshot and iterates it without
//! locks, while subscribe and unsubscribe serialize on a mutex and publish
//! a modified copy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use basalt_core::{Value, Where};
use parking_lot::Mutex;

use super::client::ClientId;

/// A where-clause watched on one class, with every client request bound
/// to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub class_name: String,
    pub where_clause: Where,
    pub hash: String,
    /// Client to the request ids it subscribed with.
    pub clients: BTreeMap<ClientId, BTreeSet<u64>>,
}

/// Canonical key of a where-clause; equal clauses hash equal.
#[must_use]
pub fn query_hash(where_clause: &Where) -> String {
    Value::Object(where_clause.clone()).to_json().to_string()
}

type ClassSubscriptions = HashMap<String, Arc<Subscription>>;
type Snapshot = HashMap<String, ClassSubscriptions>;

/// Registry of live subscriptions by class and query hash.
pub struct SubscriptionRegistry {
    snapshot: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Binds `(client, request_id)` to the subscription for
    /// `(class_name, where_clause)`, creating it if needed. Returns its hash.
    pub fn add(
        &self,
        class_name: &str,
        where_clause: &Where,
        client: ClientId,
        request_id: u64,
    ) -> String {
        let hash = query_hash(where_clause);
        let _guard = self.write_lock.lock();
        let mut next = Snapshot::clone(&self.snapshot.load());
        let class = next.entry(class_name.to_string()).or_default();
        let mut subscription = class.get(&hash).map_or_else(
            || Subscription {
                class_name: class_name.to_string(),
                where_clause: where_clause.clone(),
                hash: hash.clone(),
                clients: BTreeMap::new(),
            },
            |existing| Subscription::clone(existing),
        );
        subscription.clients.entry(client).or_default().insert(request_id);
        class.insert(hash.clone(), Arc::new(subscription));
        self.snapshot.store(Arc::new(next));
        hash
    }

    /// Unbinds `(client, request_id)`; the subscription is dropped with its
    /// last request. Returns whether anything was removed.
    pub fn remove(&self, class_name: &str, hash: &str, client: ClientId, request_id: u64) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();
        let Some(existing) = current.get(class_name).and_then(|class| class.get(hash)) else {
            return false;
        };
        let mut subscription = Subscription::clone(existing);
        let Some(requests) = subscription.clients.get_mut(&client) else {
            return false;
        };
        if !requests.remove(&request_id) {
            return false;
        }
        if requests.is_empty() {
            subscription.clients.remove(&client);
        }

        let mut next = Snapshot::clone(&current);
        if let Some(class) = next.get_mut(class_name) {
            if subscription.clients.is_empty() {
                class.remove(hash);
            } else {
                class.insert(hash.to_string(), Arc::new(subscription));
            }
            if class.is_empty() {
                next.remove(class_name);
            }
        }
        self.snapshot.store(Arc::new(next));
        true
    }

    /// Subscriptions on `class_name` in the current snapshot.
    #[must_use]
    pub fn matching(&self, class_name: &str) -> Vec<Arc<Subscription>> {
        self.snapshot
            .load()
            .get(class_name)
            .map(|class| class.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish_non_exhaustive()
    }
}

//! Live queries: subscriptions evaluated against every write.
//!
//! - [`client`]: connected clients with bounded outbound channels
//! - [`subscription`]: shared subscriptions in an `ArcSwap` snapshot
//! - [`delivery`]: sharded, bounded event delivery
//! - [`server`]: [`LiveQueryServer`], the [`ChangeNotifier`](basalt_core::ChangeNotifier)
//!   tying them together

pub mod client;
pub mod delivery;
pub mod server;
pub mod subscription;

pub use client::{ClientId, ClientRegistry, LiveClient, SendError, SubscriptionInfo};
pub use delivery::{DeliveryPool, DeliveryTask};
pub use server::LiveQueryServer;
pub use subscription::{query_hash, Subscription, SubscriptionRegistry};

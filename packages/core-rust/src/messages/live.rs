//! Live-query message types exchanged with subscribed clients.
//!
//! Both directions are JSON objects discriminated by an `op` field with
//! camelCase member names, e.g.
//! `{"op":"subscribe","requestId":1,"query":{"className":"C","where":{}}}`.

use serde::{Deserialize, Serialize};

use crate::query::Where;
use crate::types::Map;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Query half of a subscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQuery {
    /// Class the subscription watches.
    pub class_name: String,
    /// Where-clause evaluated against every saved object of the class.
    #[serde(rename = "where", default)]
    pub where_clause: Where,
    /// Projection applied to delivered objects; `None` delivers every field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// Flat fields of a `connect` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Session used for every subscription of the connection that does not
    /// carry its own token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

/// Flat fields of a `subscribe` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Client-chosen id, unique per connection.
    pub request_id: u64,
    pub query: LiveQuery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

/// Flat fields of an `unsubscribe` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub request_id: u64,
}

/// Every message a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientMessage {
    Connect(ConnectRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Kind of change delivered to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    /// A new object matching the query was created.
    Create,
    /// A matching object was changed and still matches.
    Update,
    /// A changed object matches now but did not before.
    Enter,
    /// A changed object matched before but no longer does.
    Leave,
    /// A matching object was deleted.
    Delete,
}

impl EventOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Delete => "delete",
        }
    }

    /// Wraps a payload in the server message for this op.
    #[must_use]
    pub fn into_message(self, payload: EventPayload) -> ServerMessage {
        match self {
            Self::Create => ServerMessage::Create(payload),
            Self::Update => ServerMessage::Update(payload),
            Self::Enter => ServerMessage::Enter(payload),
            Self::Leave => ServerMessage::Leave(payload),
            Self::Delete => ServerMessage::Delete(payload),
        }
    }
}

/// Flat fields of a `connected` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub client_id: u64,
}

/// Flat fields of `subscribed` / `unsubscribed` acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAck {
    pub client_id: u64,
    pub request_id: u64,
}

/// Flat fields of an object event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub client_id: u64,
    pub request_id: u64,
    /// The object after projection, in REST JSON form.
    pub object: Map,
}

/// Flat fields of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub client_id: u64,
    /// Request that failed, if the error is tied to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub code: i32,
    pub error: String,
    /// Whether the client may retry by reconnecting.
    #[serde(default)]
    pub reconnect: bool,
}

/// Every message the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected(ConnectedPayload),
    Subscribed(RequestAck),
    Unsubscribed(RequestAck),
    Create(EventPayload),
    Update(EventPayload),
    Enter(EventPayload),
    Leave(EventPayload),
    Delete(EventPayload),
    Error(ErrorPayload),
}

//! Wire message schemas.
//!
//! Live-query traffic is JSON with an `op` discriminator and camelCase
//! member names.

pub mod live;

pub use live::{
    ClientMessage, ConnectRequest, ConnectedPayload, ErrorPayload, EventOp, EventPayload,
    LiveQuery, RequestAck, ServerMessage, SubscribeRequest, UnsubscribeRequest,
};

//! Basalt Core: JSON object model, schemas, ACLs, query options, and the
//! in-memory live-query matcher.

pub mod acl;
pub mod error;
pub mod geo;
pub mod live_match;
pub mod messages;
pub mod query;
pub mod schema;
pub mod traits;
pub mod types;

pub use acl::{Acl, Permission};
pub use error::{Error, ErrorResponse, Result};
pub use live_match::matches_query;
pub use query::{QueryOptions, SortKey, SubqueryOp, Where};
pub use schema::{ClassSchema, FieldType};
pub use traits::ChangeNotifier;
pub use types::{Date, GeoPoint, Map, Pointer, Value};


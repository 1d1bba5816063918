//! Error taxonomy shared by the transform, compiler, auth and live layers.
//!
//! Every variant maps to a stable numeric code so that the REST and live-query
//! boundaries can report `{"code": N, "error": "..."}` without inspecting
//! message text.

use serde::{Deserialize, Serialize};

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by query compilation, transforms and auth.
///
/// An error aborts the whole in-flight query or write; there is no partial
/// success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Limit exhaustion, adapter failures and other server-side faults.
    #[error("internal server error: {0}")]
    InternalServerError(String),
    /// The object (or the session's user) does not exist or is not visible.
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    /// A sub-query operator or query constraint has an invalid shape.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// A top-level key is illegal or a reserved key is written incorrectly.
    #[error("invalid key name: {0}")]
    InvalidKeyName(String),
    /// Unrecognized option, uncoercible atom or unsupported operator.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// Operator recognized by name but not available at this layer.
    #[error("command unavailable: {0}")]
    CommandUnavailable(String),
    /// Value does not fit the type the schema declares for the field.
    #[error("incorrect type: {0}")]
    IncorrectType(String),
    /// Denied by ACL, class-creation or role restrictions.
    #[error("operation forbidden: {0}")]
    OperationForbidden(String),
    /// A nested object key contains `$` or `.`.
    #[error("invalid nested key: {0}")]
    InvalidNestedKey(String),
    /// Uniqueness violation reported by the storage adapter.
    #[error("duplicate value: {0}")]
    DuplicateValue(String),
    /// Session token is unknown or expired.
    #[error("invalid session token: {0}")]
    InvalidSessionToken(String),
}

impl Error {
    /// Numeric code reported at the wire boundary.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InternalServerError(_) => 1,
            Self::ObjectNotFound(_) => 101,
            Self::InvalidQuery(_) => 102,
            Self::InvalidKeyName(_) => 105,
            Self::InvalidJson(_) => 107,
            Self::CommandUnavailable(_) => 108,
            Self::IncorrectType(_) => 111,
            Self::OperationForbidden(_) => 119,
            Self::InvalidNestedKey(_) => 121,
            Self::DuplicateValue(_) => 137,
            Self::InvalidSessionToken(_) => 209,
        }
    }

    /// The message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InternalServerError(m)
            | Self::ObjectNotFound(m)
            | Self::InvalidQuery(m)
            | Self::InvalidKeyName(m)
            | Self::InvalidJson(m)
            | Self::CommandUnavailable(m)
            | Self::IncorrectType(m)
            | Self::OperationForbidden(m)
            | Self::InvalidNestedKey(m)
            | Self::DuplicateValue(m)
            | Self::InvalidSessionToken(m) => m,
        }
    }

    /// Wire representation of this error.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            error: self.message().to_string(),
        }
    }
}

/// `{"code": N, "error": "..."}` body returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub error: String,
}

//! Session token resolution with a bounded, expiring cache.

use std::sync::Arc;
use std::time::Instant;

use basalt_core::schema::{SESSION_CLASS, USER_CLASS};
use basalt_core::{Date, Error, Map, Pointer, QueryOptions, Result, Value, Where};
use chrono::{DateTime, Utc};
use quick_cache::sync::Cache;
use tracing::debug;

use super::Auth;
use crate::query::{QueryCompiler, WriteExecutor};
use crate::service::ServerContext;

#[derive(Clone)]
struct CachedSession {
    auth: Auth,
    expires_at: Instant,
}

/// Resolves session tokens to principals.
///
/// Resolved sessions are cached until the earlier of the session's own
/// expiry and `session_cache_ttl`. Call [`AuthResolver::invalidate`] on
/// logout and [`AuthResolver::clear`] after role changes.
pub struct AuthResolver {
    ctx: Arc<ServerContext>,
    cache: Cache<String, CachedSession>,
}

impl AuthResolver {
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let capacity = ctx.config.session_cache_capacity.max(1);
        Self {
            ctx,
            cache: Cache::new(capacity),
        }
    }

    /// The principal owning `token`.
    ///
    /// # Errors
    ///
    /// - `InvalidSessionToken` for an unknown or expired session
    /// - `ObjectNotFound` if the session's user no longer exists
    pub async fn for_token(&self, token: &str) -> Result<Auth> {
        if let Some(cached) = self.cache.get(token) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.auth);
            }
            self.cache.remove(token);
        }

        let mut where_clause = Where::new();
        where_clause.insert("sessionToken".to_string(), Value::from(token));
        let options = QueryOptions {
            limit: Some(1),
            include: vec!["user".to_string()],
            ..QueryOptions::default()
        };
        let ctx = Arc::clone(&self.ctx);
        let response = QueryCompiler::new(ctx, Auth::master(), SESSION_CLASS, where_clause, options)
            .execute()
            .await?;
        let session = response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidSessionToken("invalid session token".to_string()))?;

        let expires_at = match session.get("expiresAt") {
            Some(Value::Date(date)) => Some(date.to_datetime()?),
            _ => None,
        };
        let now = Utc::now();
        if expires_at.is_some_and(|at| at <= now) {
            debug!("session expired");
            return Err(Error::InvalidSessionToken("session token is expired".to_string()));
        }

        let mut user = match session.get("user") {
            Some(Value::Object(user)) => user.clone(),
            _ => return Err(Error::ObjectNotFound("user of session not found".to_string())),
        };
        user.remove("__type");
        user.remove("className");
        let user_id = user
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::ObjectNotFound("user of session not found".to_string()))?;

        let auth = Auth::user(user_id, user);
        let ttl = self.ctx.config.session_cache_ttl;
        let lifetime = expires_at
            .and_then(|at| (at - now).to_std().ok())
            .map_or(ttl, |left| left.min(ttl));
        self.cache.insert(
            token.to_string(),
            CachedSession {
                auth: auth.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(auth)
    }

    /// Drops the cached principal of `token`.
    pub fn invalidate(&self, token: &str) {
        self.cache.remove(token);
    }

    /// Drops every cached principal.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached sessions.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Creates a session for `user_id` and returns its token.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn create_session(
        &self,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let token = format!("r:{}", uuid::Uuid::new_v4().simple());
        let mut body = Map::new();
        body.insert("sessionToken".to_string(), Value::from(token.as_str()));
        body.insert("user".to_string(), Value::Pointer(Pointer::new(USER_CLASS, user_id)));
        if let Some(at) = expires_at {
            body.insert("expiresAt".to_string(), Value::Date(Date::from_datetime(&at)));
        }
        WriteExecutor::new(Arc::clone(&self.ctx))
            .create(&Auth::master(), SESSION_CLASS, &body)
            .await?;
        Ok(token)
    }
}

impl std::fmt::Debug for AuthResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthResolver")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

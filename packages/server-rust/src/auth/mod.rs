//! Principals and their access-control scope.
//!
//! A request runs as [`Auth::Master`] (no ACL restriction), [`Auth::Nobody`]
//! (public objects only) or a resolved user. A user's role closure is
//! computed lazily on first use and memoized in the principal.

pub mod roles;
pub mod session;

use std::sync::Arc;

use basalt_core::{Acl, Map, Result};
use tokio::sync::OnceCell;

use crate::service::ServerContext;
use crate::storage::ReadScope;

pub use roles::role_closure;
pub use session::AuthResolver;

/// The principal a query or write runs as.
#[derive(Debug, Clone)]
pub enum Auth {
    Master,
    Nobody,
    User(Arc<UserAuth>),
}

/// A signed-in user.
#[derive(Debug)]
pub struct UserAuth {
    pub user_id: String,
    /// The user object as stored, without the password.
    pub user: Map,
    roles: OnceCell<Vec<String>>,
}

impl Auth {
    #[must_use]
    pub fn master() -> Self {
        Self::Master
    }

    #[must_use]
    pub fn nobody() -> Self {
        Self::Nobody
    }

    #[must_use]
    pub fn user(user_id: impl Into<String>, user: Map) -> Self {
        Self::User(Arc::new(UserAuth {
            user_id: user_id.into(),
            user,
            roles: OnceCell::new(),
        }))
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(user) => Some(&user.user_id),
            Self::Master | Self::Nobody => None,
        }
    }

    /// `role:<name>` entities of the user, sorted. Empty for master and
    /// nobody.
    ///
    /// # Errors
    ///
    /// Propagates role closure failures.
    pub async fn roles(&self, ctx: &ServerContext) -> Result<Vec<String>> {
        match self {
            Self::User(user) => user
                .roles
                .get_or_try_init(|| role_closure(ctx, &user.user_id))
                .await
                .cloned(),
            Self::Master | Self::Nobody => Ok(Vec::new()),
        }
    }

    /// `[userId]` followed by the role entities.
    ///
    /// # Errors
    ///
    /// Propagates role closure failures.
    pub async fn entities(&self, ctx: &ServerContext) -> Result<Vec<String>> {
        let Some(user_id) = self.user_id() else {
            return Ok(Vec::new());
        };
        let mut entities = vec![user_id.to_string()];
        entities.extend(self.roles(ctx).await?);
        Ok(entities)
    }

    /// Row-level scope for storage lookups; `None` for master.
    ///
    /// # Errors
    ///
    /// Propagates role closure failures.
    pub async fn read_scope(&self, ctx: &ServerContext) -> Result<Option<ReadScope>> {
        Ok(match self {
            Self::Master => None,
            Self::Nobody => Some(ReadScope::Anonymous),
            Self::User(_) => Some(ReadScope::Entities(self.entities(ctx).await?)),
        })
    }

    /// Whether this principal may read an object carrying `acl`.
    ///
    /// # Errors
    ///
    /// Propagates role closure failures.
    pub async fn can_read(&self, ctx: &ServerContext, acl: &Acl) -> Result<bool> {
        if self.is_master() {
            return Ok(true);
        }
        Ok(acl.can_read(&self.entities(ctx).await?))
    }

    /// Whether this principal may modify an object carrying `acl`.
    ///
    /// # Errors
    ///
    /// Propagates role closure failures.
    pub async fn can_write(&self, ctx: &ServerContext, acl: &Acl) -> Result<bool> {
        if self.is_master() {
            return Ok(true);
        }
        Ok(acl.can_write(&self.entities(ctx).await?))
    }
}

//! Role closure of a user.
//!
//! Breadth-first over two join classes: `_Role.users` (user is a member of
//! a role) seeds the traversal, `_Role.roles` (a role is a member of another
//! role) walks up to the roles it inherits from. Each role id is expanded at
//! most once, so cyclic role graphs terminate.

use std::collections::HashSet;

use basalt_core::acl::role_entity;
use basalt_core::schema::ROLE_CLASS;
use basalt_core::{Error, Result};
use tracing::{debug, warn};

use crate::query::relation::owning_ids;
use crate::service::ServerContext;
use crate::storage::{adapter_error, find_all, Document, StorageQuery, StorageValue};

/// `role:<name>` for every role `user_id` belongs to directly or through
/// inheritance, sorted and deduplicated.
///
/// # Errors
///
/// Returns `InternalServerError` when more than `max_role_closure` roles are
/// visited or the adapter fails.
pub async fn role_closure(ctx: &ServerContext, user_id: &str) -> Result<Vec<String>> {
    let limit = ctx.config.max_role_closure;
    let mut visited: HashSet<String> = HashSet::new();
    let mut frontier = owning_ids(ctx, "users", ROLE_CLASS, &[user_id.to_string()]).await?;

    while !frontier.is_empty() {
        visited.extend(frontier.iter().cloned());
        if visited.len() > limit {
            warn!(user_id, limit, "role closure limit exceeded");
            return Err(Error::InternalServerError(format!(
                "role closure of {user_id} exceeds {limit} roles"
            )));
        }
        frontier = owning_ids(ctx, "roles", ROLE_CLASS, &frontier)
            .await?
            .into_iter()
            .filter(|id| !visited.contains(id))
            .collect();
    }

    let ids: Vec<String> = visited.into_iter().collect();
    let names = role_names(ctx, &ids).await?;
    debug!(user_id, roles = names.len(), "resolved role closure");
    Ok(names)
}

async fn role_names(ctx: &ServerContext, ids: &[String]) -> Result<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut constraint = Document::new();
    constraint.insert(
        "$in".to_string(),
        StorageValue::Array(ids.iter().cloned().map(StorageValue::String).collect()),
    );
    let mut query = StorageQuery::new();
    query.insert("_id".to_string(), StorageValue::Document(constraint));

    let roles = find_all(ctx.storage.as_ref(), ROLE_CLASS, &query, ctx.config.page_size)
        .await
        .map_err(|e| adapter_error(&e))?;
    let mut names: Vec<String> = roles
        .iter()
        .filter_map(|role| role.get("name").and_then(StorageValue::as_str))
        .map(role_entity)
        .collect();
    names.sort_unstable();
    names.dedup();
    Ok(names)
}

//! Query compilation and execution.
//!
//! Pipeline of one [`QueryCompiler::execute`]:
//!
//! 1. class existence check and `redirectClassNameForKey`
//! 2. sub-query resolution (`$select`, `$dontSelect`, `$inQuery`,
//!    `$notInQuery`), each executed by a nested compiler
//! 3. relation reduction (`$relatedTo`, constraints on relation fields)
//! 4. ACL scope injection and the where/sort transform
//! 5. adapter `count`/`find`, untransform, projection
//! 6. include expansion and sanitization
//!
//! Nested compilers share the principal and a resolution budget with their
//! parent and run one level deeper.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use basalt_core::live_match::lookup;
use basalt_core::schema::SESSION_CLASS;
use basalt_core::{
    ClassSchema, Error, FieldType, Map, Pointer, QueryOptions, Result, SubqueryOp, Value, Where,
};
use tracing::{debug, info_span, Instrument};

use super::include::expand_includes;
use super::relation::reduce_relations;
use super::sanitize::{apply_redirect, project, sanitize_row};
use super::subquery::{find_first, merge_values, node_at, parse_operand, Occurrence, Subquery};
use crate::auth::Auth;
use crate::service::ServerContext;
use crate::storage::{adapter_error, Document, FindOptions, ReadScope, SortDirection, StorageQuery};
use crate::transform::{transform_sort, transform_where, untransform_object};

/// Boxed future returned by [`QueryCompiler::execute`]; boxing lets
/// sub-queries execute recursively.
pub type QueryFuture = Pin<Box<dyn Future<Output = Result<QueryResponse>> + Send>>;

/// Rows of a query and, when requested, the total match count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub results: Vec<Map>,
    pub count: Option<usize>,
}

impl QueryResponse {
    fn empty(count: bool) -> Self {
        Self {
            results: Vec::new(),
            count: count.then_some(0),
        }
    }
}

/// A REST query bound to a principal.
pub struct QueryCompiler {
    ctx: Arc<ServerContext>,
    auth: Auth,
    class_name: String,
    where_clause: Where,
    options: QueryOptions,
    depth: usize,
    /// Page through every match when no `limit` is given.
    fetch_all: bool,
    resolutions: Arc<AtomicUsize>,
}

impl QueryCompiler {
    #[must_use]
    pub fn new(
        ctx: Arc<ServerContext>,
        auth: Auth,
        class_name: impl Into<String>,
        where_clause: Where,
        options: QueryOptions,
    ) -> Self {
        Self {
            ctx,
            auth,
            class_name: class_name.into(),
            where_clause,
            options,
            depth: 0,
            fetch_all: false,
            resolutions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Builds a compiler from the raw REST option map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidJson` for unrecognized or mistyped options.
    pub fn from_raw(
        ctx: Arc<ServerContext>,
        auth: Auth,
        class_name: impl Into<String>,
        where_clause: Where,
        raw_options: &Map,
    ) -> Result<Self> {
        Ok(Self::new(ctx, auth, class_name, where_clause, QueryOptions::from_raw(raw_options)?))
    }

    /// A compiler one level deeper, sharing principal and budget.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` beyond `max_subquery_depth`.
    pub(crate) fn nested(
        &self,
        class_name: impl Into<String>,
        where_clause: Where,
        options: QueryOptions,
    ) -> Result<Self> {
        let depth = self.depth + 1;
        let max = self.ctx.config.max_subquery_depth;
        if depth > max {
            return Err(Error::InvalidQuery(format!("sub-queries nested deeper than {max} levels")));
        }
        Ok(Self {
            ctx: Arc::clone(&self.ctx),
            auth: self.auth.clone(),
            class_name: class_name.into(),
            where_clause,
            fetch_all: options.limit.is_none(),
            options,
            depth,
            resolutions: Arc::clone(&self.resolutions),
        })
    }

    #[must_use]
    pub fn where_clause(&self) -> &Where {
        &self.where_clause
    }

    #[must_use]
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Runs the query.
    #[must_use]
    pub fn execute(self) -> QueryFuture {
        let span = info_span!("query", class = %self.class_name, depth = self.depth);
        Box::pin(self.run().instrument(span))
    }

    async fn run(mut self) -> Result<QueryResponse> {
        let Some(mut schema) = self.load_schema(&self.class_name).await? else {
            return Ok(QueryResponse::empty(self.options.count));
        };

        let mut redirected = None;
        if let Some(key) = self.options.redirect_class_name_for_key.clone() {
            if let Some(FieldType::Relation { target_class }) = schema.field(&key) {
                let target = target_class.clone();
                debug!(from = %self.class_name, to = %target, key = %key, "redirecting query");
                let Some(target_schema) = self.load_schema(&target).await? else {
                    return Ok(QueryResponse::empty(self.options.count));
                };
                schema = target_schema;
                self.class_name.clone_from(&target);
                redirected = Some(target);
            }
        }

        self.resolve_subqueries().await?;
        reduce_relations(&self.ctx, &schema, &mut self.where_clause).await?;

        let read_scope = self.auth.read_scope(&self.ctx).await?;
        if self.class_name == SESSION_CLASS && read_scope == Some(ReadScope::Anonymous) {
            return Err(Error::InvalidSessionToken(
                "a valid session token is required to query sessions".to_string(),
            ));
        }

        let query = transform_where(&schema, &self.where_clause)?;
        let sort = transform_sort(&schema, &self.options.order)?;

        let count = if self.options.count {
            let options = FindOptions {
                read_scope: read_scope.clone(),
                ..FindOptions::default()
            };
            let total = self
                .ctx
                .storage
                .count(&self.class_name, &query, &options)
                .await
                .map_err(|e| adapter_error(&e))?;
            Some(total)
        } else {
            None
        };

        let docs = if self.options.count && self.options.limit == Some(0) {
            Vec::new()
        } else {
            self.fetch(&query, sort, read_scope).await?
        };
        debug!(rows = docs.len(), "fetched");

        let mut results = docs
            .iter()
            .map(|doc| untransform_object(&schema, doc))
            .collect::<Result<Vec<_>>>()?;
        if let Some(keys) = &self.options.keys {
            for row in &mut results {
                project(row, keys);
            }
        }
        expand_includes(&self, &mut results).await?;
        for row in &mut results {
            sanitize_row(&self.class_name, row);
        }
        if let Some(target) = redirected {
            apply_redirect(&mut results, &target);
        }
        Ok(QueryResponse { results, count })
    }

    /// Schema of `class_name`; `None` when the class is missing and the
    /// caller may see it as empty.
    async fn load_schema(&self, class_name: &str) -> Result<Option<Arc<ClassSchema>>> {
        if let Some(schema) = self.ctx.schema.get_schema(class_name).await {
            return Ok(Some(schema));
        }
        if self.auth.is_master() || self.ctx.config.allow_client_class_creation {
            debug!(class = class_name, "querying a class that does not exist");
            return Ok(None);
        }
        Err(Error::OperationForbidden(format!(
            "this user is not allowed to access non-existent class: {class_name}"
        )))
    }

    async fn fetch(
        &self,
        query: &StorageQuery,
        mut sort: Vec<(String, SortDirection)>,
        read_scope: Option<ReadScope>,
    ) -> Result<Vec<Document>> {
        let page_size = self.ctx.config.page_size.max(1);
        let skip = self.options.skip.unwrap_or(0);
        let storage = &self.ctx.storage;

        if self.options.limit.is_some() || !self.fetch_all {
            let options = FindOptions {
                skip: Some(skip),
                limit: Some(self.options.limit.unwrap_or(page_size)),
                sort,
                read_scope,
            };
            return storage
                .find(&self.class_name, query, &options)
                .await
                .map_err(|e| adapter_error(&e));
        }

        // Stable order across pages.
        if !sort.iter().any(|(key, _)| key == "_id") {
            sort.push(("_id".to_string(), SortDirection::Ascending));
        }
        let mut rows = Vec::new();
        loop {
            let options = FindOptions {
                skip: Some(skip + rows.len()),
                limit: Some(page_size),
                sort: sort.clone(),
                read_scope: read_scope.clone(),
            };
            let page = storage
                .find(&self.class_name, query, &options)
                .await
                .map_err(|e| adapter_error(&e))?;
            let short = page.len() < page_size;
            rows.extend(page);
            if short {
                return Ok(rows);
            }
        }
    }

    /// Replaces every sub-query operator of the where-clause with the
    /// `$in`/`$nin` values it selects, until none is left.
    ///
    /// # Errors
    ///
    /// - `InvalidQuery` for a malformed operator or excessive nesting
    /// - `InternalServerError` once `max_subquery_resolutions` is exhausted
    /// - any error of the nested query
    pub async fn resolve_subqueries(&mut self) -> Result<()> {
        while let Some(Occurrence { path, op }) = find_first(&self.where_clause) {
            let used = self.resolutions.fetch_add(1, Ordering::Relaxed) + 1;
            let max = self.ctx.config.max_subquery_resolutions;
            if used > max {
                return Err(Error::InternalServerError(format!(
                    "more than {max} sub-queries in one request"
                )));
            }

            let operand = node_at(&mut self.where_clause, &path)
                .and_then(|node| node.remove(op.key()))
                .ok_or_else(|| {
                    let message = "sub-query operator moved during resolution";
                    Error::InternalServerError(message.to_string())
                })?;
            let values = self.run_subquery(op, &operand).await?;
            metrics::counter!("basalt_subqueries_resolved_total").increment(1);

            let node = node_at(&mut self.where_clause, &path)
                .ok_or_else(|| {
                    Error::InternalServerError("sub-query node moved during resolution".to_string())
                })?;
            merge_values(node, op, values)?;
        }
        Ok(())
    }

    async fn run_subquery(&self, op: SubqueryOp, operand: &Value) -> Result<Vec<Value>> {
        let Subquery {
            class_name,
            where_clause,
            key,
        } = parse_operand(op, operand)?;
        debug!(op = op.key(), class = %class_name, depth = self.depth + 1, "resolving sub-query");
        let response = self
            .nested(class_name.clone(), where_clause, QueryOptions::default())?
            .execute()
            .await?;

        Ok(match key {
            Some(key) => response
                .results
                .iter()
                .filter_map(|row| lookup(row, &key).cloned())
                .collect(),
            None => response
                .results
                .iter()
                .filter_map(|row| {
                    let id = row.get("objectId").and_then(Value::as_str)?;
                    let class = row.get("className").and_then(Value::as_str).unwrap_or(&class_name);
                    Some(Value::Pointer(Pointer::new(class, id)))
                })
                .collect(),
        })
    }
}

impl std::fmt::Debug for QueryCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCompiler")
            .field("class_name", &self.class_name)
            .field("where_clause", &self.where_clause)
            .field("options", &self.options)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

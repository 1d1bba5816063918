//! Write execution: create, update and delete of REST objects.
//!
//! Every write checks class existence, declares new fields, transforms the
//! body, applies it through the storage adapter, maintains relation joins
//! and finally reports the change to the registered [`ChangeNotifier`]s.

use std::sync::Arc;

use basalt_core::schema::INSTALLATION_CLASS;
use basalt_core::{ChangeNotifier, ClassSchema, Error, Map, Result, Value};
use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use super::relation::{add_relation, clear_relations, remove_relation};
use super::sanitize::sanitize_row;
use crate::auth::Auth;
use crate::service::ServerContext;
use crate::storage::{adapter_error, Document, FindOptions, StorageQuery, StorageValue};
use crate::transform::{
    schema_additions, transform_create, transform_update, untransform_acl, untransform_object,
};

const OBJECT_ID_LEN: usize = 10;

/// A fresh random object id of ten alphanumeric characters.
#[must_use]
pub fn new_object_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(OBJECT_ID_LEN)
        .map(char::from)
        .collect()
}

/// Applies REST writes on behalf of a principal.
pub struct WriteExecutor {
    ctx: Arc<ServerContext>,
    notifiers: Vec<Arc<dyn ChangeNotifier>>,
}

impl WriteExecutor {
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            notifiers: Vec::new(),
        }
    }

    /// Adds an observer of successful writes.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Creates an object and returns it in REST form.
    ///
    /// A `_User` body's `password` is stored as given under
    /// `_hashed_password`, so it must already be hashed. It is never part of
    /// the returned object or of notifications.
    ///
    /// # Errors
    ///
    /// - `OperationForbidden` for a missing class the principal may not create
    /// - `IncorrectType` for a value conflicting with the schema
    /// - `DuplicateValue` if the generated id already exists
    /// - any transform error of the body
    pub async fn create(&self, auth: &Auth, class_name: &str, body: &Map) -> Result<Map> {
        let schema = self.prepare_schema(auth, class_name, body).await?;
        let mut doc = transform_create(&schema, body)?;
        let now = StorageValue::Timestamp(Utc::now());
        let object_id = new_object_id();
        doc.insert("_id".to_string(), StorageValue::String(object_id.clone()));
        doc.insert("_created_at".to_string(), now.clone());
        doc.insert("_updated_at".to_string(), now);

        self.ctx
            .storage
            .insert(class_name, doc.clone())
            .await
            .map_err(|e| adapter_error(&e))?;
        self.apply_relation_ops(&schema, &object_id, body).await?;
        debug!(class = class_name, object_id = %object_id, "created object");

        let created = client_view(&schema, &doc)?;
        self.notify_save(class_name, &created, None).await;
        Ok(created)
    }

    /// Updates an object and returns its new REST form.
    ///
    /// # Errors
    ///
    /// - `ObjectNotFound` if the object is missing, unreadable or not
    ///   writable by the principal
    /// - `IncorrectType` for a value conflicting with the schema
    /// - any transform error of the body
    pub async fn update(
        &self,
        auth: &Auth,
        class_name: &str,
        object_id: &str,
        body: &Map,
    ) -> Result<Map> {
        let schema = self.prepare_schema(auth, class_name, body).await?;
        let original_doc = self.load_writable(auth, class_name, object_id).await?;

        let mut update = transform_update(&schema, body)?;
        update.set("_updated_at", StorageValue::Timestamp(Utc::now()));
        let updated_doc = self
            .ctx
            .storage
            .update(class_name, &id_query(object_id), &update)
            .await
            .map_err(|e| adapter_error(&e))?
            .ok_or_else(|| not_found(class_name, object_id))?;
        self.apply_relation_ops(&schema, object_id, body).await?;
        debug!(class = class_name, object_id, "updated object");

        let original = client_view(&schema, &original_doc)?;
        let updated = client_view(&schema, &updated_doc)?;
        self.notify_save(class_name, &updated, Some(&original)).await;
        Ok(updated)
    }

    /// Deletes an object and the relation edges it owns.
    ///
    /// # Errors
    ///
    /// - `OperationForbidden` for a non-master delete of an installation
    /// - `ObjectNotFound` if the object is missing, unreadable or not
    ///   writable by the principal
    pub async fn delete(&self, auth: &Auth, class_name: &str, object_id: &str) -> Result<()> {
        if class_name == INSTALLATION_CLASS && !auth.is_master() {
            return Err(Error::OperationForbidden(
                "installations can only be deleted with the master key".to_string(),
            ));
        }
        let Some(schema) = self.ctx.schema.get_schema(class_name).await else {
            return Err(not_found(class_name, object_id));
        };
        let doc = self.load_writable(auth, class_name, object_id).await?;

        self.ctx
            .storage
            .delete(class_name, &id_query(object_id))
            .await
            .map_err(|e| adapter_error(&e))?;
        clear_relations(&self.ctx, &schema, object_id).await?;
        debug!(class = class_name, object_id, "deleted object");

        let object = client_view(&schema, &doc)?;
        for notifier in &self.notifiers {
            if let Err(err) = notifier.after_delete(class_name, &object).await {
                warn!(class = class_name, error = %err, "delete notification failed");
            }
        }
        Ok(())
    }

    /// Schema of `class_name` after creating the class if needed and
    /// declaring every new field of `body`.
    async fn prepare_schema(
        &self,
        auth: &Auth,
        class_name: &str,
        body: &Map,
    ) -> Result<Arc<ClassSchema>> {
        let schema = match self.ctx.schema.get_schema(class_name).await {
            Some(schema) => schema,
            None if auth.is_master() || self.ctx.config.allow_client_class_creation => {
                debug!(class = class_name, "creating class on first write");
                self.ctx
                    .schema
                    .create_class(class_name)
                    .await
                    .map_err(|e| {
                        let message = format!("cannot create class {class_name}: {e:#}");
                        Error::InternalServerError(message)
                    })?
            }
            None => {
                return Err(Error::OperationForbidden(format!(
                    "this user is not allowed to create class: {class_name}"
                )))
            }
        };

        let additions = schema_additions(&schema, body)?;
        if additions.is_empty() {
            return Ok(schema);
        }
        self.ctx
            .schema
            .add_fields(class_name, &additions)
            .await
            .map_err(|e| {
                Error::InternalServerError(format!("cannot extend schema of {class_name}: {e:#}"))
            })
    }

    /// The stored document, if the principal may both see and modify it.
    async fn load_writable(
        &self,
        auth: &Auth,
        class_name: &str,
        object_id: &str,
    ) -> Result<Document> {
        let options = FindOptions {
            limit: Some(1),
            read_scope: auth.read_scope(&self.ctx).await?,
            ..FindOptions::default()
        };
        let doc = self
            .ctx
            .storage
            .find(class_name, &id_query(object_id), &options)
            .await
            .map_err(|e| adapter_error(&e))?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(class_name, object_id))?;

        if let Some(acl) = untransform_acl(&doc) {
            if !auth.can_write(&self.ctx, &acl).await? {
                return Err(not_found(class_name, object_id));
            }
        }
        Ok(doc)
    }

    /// Maintains the join classes for `AddRelation`/`RemoveRelation` fields
    /// of `body`.
    async fn apply_relation_ops(
        &self,
        schema: &ClassSchema,
        owning_id: &str,
        body: &Map,
    ) -> Result<()> {
        for (field, value) in body {
            let Some(op) = value.as_object() else {
                continue;
            };
            let add = match op.get("__op").and_then(Value::as_str) {
                Some("AddRelation") => true,
                Some("RemoveRelation") => false,
                _ => continue,
            };
            let objects = op
                .get("objects")
                .and_then(Value::as_array)
                .map_or(&[][..], Vec::as_slice);
            for object in objects {
                let Value::Pointer(pointer) = object else {
                    continue;
                };
                let (owning_class, related_id) = (&schema.class_name, &pointer.object_id);
                if add {
                    add_relation(&self.ctx, field, owning_class, owning_id, related_id).await?;
                } else {
                    remove_relation(&self.ctx, field, owning_class, owning_id, related_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn notify_save(&self, class_name: &str, current: &Map, original: Option<&Map>) {
        for notifier in &self.notifiers {
            if let Err(err) = notifier.after_save(class_name, current, original).await {
                warn!(class = class_name, error = %err, "save notification failed");
            }
        }
    }
}

impl std::fmt::Debug for WriteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteExecutor")
            .field("notifiers", &self.notifiers.len())
            .finish_non_exhaustive()
    }
}

/// The REST form a client or notifier may see.
fn client_view(schema: &ClassSchema, doc: &Document) -> Result<Map> {
    let mut object = untransform_object(schema, doc)?;
    sanitize_row(&schema.class_name, &mut object);
    Ok(object)
}

fn id_query(object_id: &str) -> StorageQuery {
    let mut query = StorageQuery::new();
    query.insert("_id".to_string(), StorageValue::from(object_id));
    query
}

fn not_found(class_name: &str, object_id: &str) -> Error {
    Error::ObjectNotFound(format!("object {object_id} not found in {class_name}"))
}

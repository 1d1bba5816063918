//! In-memory [`SchemaProvider`] with lock-free snapshot reads.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use basalt_core::schema::system_classes;
use basalt_core::{ClassSchema, FieldType};
use parking_lot::Mutex;

use crate::traits::SchemaProvider;

type SchemaMap = HashMap<String, Arc<ClassSchema>>;

/// Class schemas held in an `ArcSwap` snapshot.
///
/// Readers load the current snapshot without locking; writers serialize on a
/// mutex and publish a new snapshot (read-copy-update).
pub struct MemorySchemaProvider {
    classes: ArcSwap<SchemaMap>,
    write_lock: Mutex<()>,
}

impl MemorySchemaProvider {
    /// Creates a provider preloaded with the system classes.
    #[must_use]
    pub fn new() -> Self {
        let classes = system_classes()
            .into_iter()
            .map(|schema| (schema.class_name.clone(), Arc::new(schema)))
            .collect();
        Self {
            classes: ArcSwap::from_pointee(classes),
            write_lock: Mutex::new(()),
        }
    }

    /// Inserts or replaces a class schema.
    pub fn put_class(&self, schema: ClassSchema) -> Arc<ClassSchema> {
        let schema = Arc::new(schema);
        let _guard = self.write_lock.lock();
        let mut next = SchemaMap::clone(&self.classes.load());
        next.insert(schema.class_name.clone(), Arc::clone(&schema));
        self.classes.store(Arc::new(next));
        schema
    }

    /// Names of every known class, sorted.
    #[must_use]
    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.load().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl Default for MemorySchemaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaProvider for MemorySchemaProvider {
    async fn get_schema(&self, class_name: &str) -> Option<Arc<ClassSchema>> {
        self.classes.load().get(class_name).cloned()
    }

    async fn create_class(&self, class_name: &str) -> anyhow::Result<Arc<ClassSchema>> {
        if let Some(existing) = self.classes.load().get(class_name) {
            return Ok(Arc::clone(existing));
        }
        Ok(self.put_class(ClassSchema::new(class_name)))
    }

    async fn add_fields(
        &self,
        class_name: &str,
        fields: &[(String, FieldType)],
    ) -> anyhow::Result<Arc<ClassSchema>> {
        let _guard = self.write_lock.lock();
        let current = self.classes.load();
        let Some(existing) = current.get(class_name) else {
            anyhow::bail!("class {class_name} does not exist");
        };
        let mut schema = ClassSchema::clone(existing);
        for (name, field_type) in fields {
            if let Some(declared) = schema.field(name) {
                if declared != field_type {
                    anyhow::bail!(
                        "field {name} of {class_name} is already declared as {declared:?}"
                    );
                }
                continue;
            }
            schema.fields.insert(name.clone(), field_type.clone());
        }
        let schema = Arc::new(schema);
        let mut next = SchemaMap::clone(&current);
        next.insert(class_name.to_string(), Arc::clone(&schema));
        self.classes.store(Arc::new(next));
        Ok(schema)
    }
}

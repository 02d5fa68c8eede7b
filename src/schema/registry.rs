//! Persistence of schemas themselves.
//!
//! Type schemas live under [`TYPE_SCHEMA_PATH`] keyed by type name; field
//! schemas live under [`FIELD_SCHEMA_PATH`] keyed by a generated id and are
//! referenced by id from their owning type or field, so nested schemas are
//! stored once and never embedded. Schemas are immutable once configured and
//! re-read on every operation, so a freshly configured type takes effect on
//! the next call without restart.

use std::sync::Arc;

use futures::future::BoxFuture;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{FieldSchema, FieldType, TypeSchema};
use crate::constants::{is_reserved_field, FIELD_SCHEMA_PATH, TYPE_SCHEMA_PATH};
use crate::error::{DataTreeError, DataTreeResult};
use crate::storage::{StorageAdapter, WriteMode};

/// Persisted form of a type schema: fields are held by id.
#[derive(Debug, Serialize, Deserialize)]
struct StoredTypeSchema {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    storage_path: Option<String>,
    field_ids: Vec<String>,
}

/// Persisted form of a field schema: children are held by id.
#[derive(Debug, Serialize, Deserialize)]
struct StoredFieldSchema {
    name: String,
    field_type: FieldType,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    cascade_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    child_ids: Vec<String>,
}

/// Loads and persists type schemas through the storage adapter.
#[derive(Clone)]
pub struct SchemaRegistry {
    storage: Arc<dyn StorageAdapter>,
}

impl SchemaRegistry {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Persists a type schema under the reserved schema namespace.
    ///
    /// Schemas are immutable: configuring a type name that already exists is
    /// rejected rather than silently overwritten, since stored records may
    /// already depend on the original field layout.
    pub async fn configure_type(&self, schema: &TypeSchema) -> DataTreeResult<()> {
        if schema.name.is_empty() {
            return Err(DataTreeError::Validation(
                "type name cannot be empty".to_string(),
            ));
        }
        check_field_shape(&schema.name, &schema.fields)?;

        let type_location = format!("{}/{}", TYPE_SCHEMA_PATH, schema.name);
        if self.storage.exists_at(&type_location).await? {
            return Err(DataTreeError::Usage(format!(
                "type '{}' is already configured; schemas are immutable",
                schema.name
            )));
        }

        let mut field_ids = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            field_ids.push(self.store_field(field).await?);
        }
        let stored = StoredTypeSchema {
            name: schema.name.clone(),
            storage_path: schema.storage_path.clone(),
            field_ids,
        };
        self.storage
            .write_at(&type_location, Some(serde_json::to_value(&stored)?), WriteMode::Set)
            .await?;
        info!(
            "Configured type '{}' with {} fields",
            schema.name,
            schema.fields.len()
        );
        Ok(())
    }

    /// Persists one field schema (children first) and returns its generated id.
    fn store_field<'a>(&'a self, field: &'a FieldSchema) -> BoxFuture<'a, DataTreeResult<String>> {
        Box::pin(async move {
            let mut child_ids = Vec::with_capacity(field.children.len());
            for child in &field.children {
                child_ids.push(self.store_field(child).await?);
            }
            let id = self.storage.generate_id().await?;
            let stored = StoredFieldSchema {
                name: field.name.clone(),
                field_type: field.field_type.clone(),
                required: field.required,
                cascade_delete: field.cascade_delete,
                storage_path: field.storage_path.clone(),
                child_ids,
            };
            self.storage
                .write_at(
                    &format!("{}/{}", FIELD_SCHEMA_PATH, id),
                    Some(serde_json::to_value(&stored)?),
                    WriteMode::Set,
                )
                .await?;
            Ok(id)
        })
    }

    /// Loads a configured type schema, resolving nested field schemas by id.
    pub async fn get_type(&self, name: &str) -> DataTreeResult<TypeSchema> {
        let location = format!("{}/{}", TYPE_SCHEMA_PATH, name);
        let raw = self
            .storage
            .read_at(&location, None)
            .await?
            .ok_or_else(|| {
                DataTreeError::NotFound(format!("unconfigured or missing type '{}'", name))
            })?;
        let stored: StoredTypeSchema = serde_json::from_value(raw)?;
        let mut fields = Vec::with_capacity(stored.field_ids.len());
        for field_id in &stored.field_ids {
            fields.push(self.load_field(field_id).await?);
        }
        Ok(TypeSchema {
            name: stored.name,
            storage_path: stored.storage_path,
            fields,
        })
    }

    fn load_field<'a>(&'a self, id: &'a str) -> BoxFuture<'a, DataTreeResult<FieldSchema>> {
        Box::pin(async move {
            let location = format!("{}/{}", FIELD_SCHEMA_PATH, id);
            let raw = self
                .storage
                .read_at(&location, None)
                .await?
                .ok_or_else(|| {
                    DataTreeError::NotFound(format!("field schema '{}' is missing", id))
                })?;
            let stored: StoredFieldSchema = serde_json::from_value(raw)?;
            let mut children = Vec::with_capacity(stored.child_ids.len());
            for child_id in &stored.child_ids {
                children.push(self.load_field(child_id).await?);
            }
            Ok(FieldSchema {
                name: stored.name,
                field_type: stored.field_type,
                required: stored.required,
                cascade_delete: stored.cascade_delete,
                storage_path: stored.storage_path,
                children,
            })
        })
    }

    /// Names of every configured type.
    pub async fn list_types(&self) -> DataTreeResult<Vec<String>> {
        let raw = self.storage.read_at(TYPE_SCHEMA_PATH, None).await?;
        match raw {
            Some(Value::Object(entries)) => Ok(entries.keys().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }
}

/// Structural checks applied before a schema is persisted: non-empty and
/// non-reserved field names, unique within each nesting level, children only
/// on `object` fields, cascade only on reference fields.
fn check_field_shape(type_name: &str, fields: &[FieldSchema]) -> DataTreeResult<()> {
    let mut seen = std::collections::HashSet::new();
    for field in fields {
        if field.name.is_empty() {
            return Err(DataTreeError::Validation(format!(
                "type '{}' declares a field with an empty name",
                type_name
            )));
        }
        if is_reserved_field(&field.name) {
            return Err(DataTreeError::Validation(format!(
                "type '{}' declares reserved field name '{}'",
                type_name, field.name
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(DataTreeError::Validation(format!(
                "type '{}' declares field '{}' more than once",
                type_name, field.name
            )));
        }
        if !field.children.is_empty() && field.field_type != FieldType::Object {
            return Err(DataTreeError::Validation(format!(
                "field '{}' on type '{}' declares children but is not an object field",
                field.name, type_name
            )));
        }
        if field.cascade_delete && !field.field_type.is_reference() {
            return Err(DataTreeError::Validation(format!(
                "field '{}' on type '{}' sets cascade delete but is not a reference field",
                field.name, type_name
            )));
        }
        check_field_shape(type_name, &field.children)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(Arc::new(MemoryAdapter::new()))
    }

    fn person() -> TypeSchema {
        TypeSchema::new("Person")
            .with_field(FieldSchema::new("name", FieldType::String).required())
            .with_field(FieldSchema::new(
                "pet",
                FieldType::Reference("Animal".to_string()),
            ))
            .with_field(
                FieldSchema::new("meta", FieldType::Object).with_children(vec![
                    FieldSchema::new("color", FieldType::String),
                    FieldSchema::new("born", FieldType::Date),
                ]),
            )
    }

    #[tokio::test]
    async fn configure_then_get_round_trips() {
        let registry = registry();
        registry.configure_type(&person()).await.unwrap();
        let loaded = registry.get_type("Person").await.unwrap();
        assert_eq!(loaded.name, "Person");
        assert_eq!(loaded.fields.len(), 3);
        assert!(loaded.field("name").unwrap().required);
        assert_eq!(
            loaded.field("pet").unwrap().field_type,
            FieldType::Reference("Animal".to_string())
        );
        assert_eq!(loaded.field("meta").unwrap().children.len(), 2);
    }

    #[tokio::test]
    async fn unknown_type_is_not_found() {
        let err = registry().get_type("Ghost").await.unwrap_err();
        assert!(matches!(err, DataTreeError::NotFound(_)));
    }

    #[tokio::test]
    async fn reconfiguring_a_type_is_rejected() {
        let registry = registry();
        registry.configure_type(&person()).await.unwrap();
        assert!(matches!(
            registry.configure_type(&person()).await,
            Err(DataTreeError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn malformed_schemas_are_rejected() {
        let registry = registry();
        let duplicate = TypeSchema::new("Bad")
            .with_field(FieldSchema::new("a", FieldType::String))
            .with_field(FieldSchema::new("a", FieldType::Number));
        assert!(registry.configure_type(&duplicate).await.is_err());

        let reserved = TypeSchema::new("Bad")
            .with_field(FieldSchema::new("id", FieldType::String));
        assert!(registry.configure_type(&reserved).await.is_err());

        let stray_children = TypeSchema::new("Bad").with_field(
            FieldSchema::new("a", FieldType::String)
                .with_children(vec![FieldSchema::new("b", FieldType::String)]),
        );
        assert!(registry.configure_type(&stray_children).await.is_err());

        let bad_cascade = TypeSchema::new("Bad")
            .with_field(FieldSchema::new("a", FieldType::String).cascade_delete());
        assert!(registry.configure_type(&bad_cascade).await.is_err());
    }

    #[tokio::test]
    async fn list_types_names_configured_types() {
        let registry = registry();
        assert!(registry.list_types().await.unwrap().is_empty());
        registry.configure_type(&person()).await.unwrap();
        assert_eq!(registry.list_types().await.unwrap(), vec!["Person"]);
    }
}

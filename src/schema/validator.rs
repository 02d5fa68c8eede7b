//! Recursive record validation against a type schema.

use std::sync::Arc;

use chrono::DateTime;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::types::{FieldSchema, FieldType, TypeSchema};
use crate::constants::{is_reserved_field, FIELD_ID, FIELD_TYPE};
use crate::error::{DataTreeError, DataTreeResult};
use crate::storage::StorageAdapter;

/// Validates candidate records before they are persisted.
///
/// The validator checks required fields, declared-versus-actual types,
/// reference type tags, and rejects undeclared fields, recursing into nested
/// object fields to arbitrary depth. Required fields omitted on an update
/// (the record carries an id) are checked against the stored copy instead of
/// failing outright: a field left out of a partial update may already exist
/// remotely.
pub struct Validator {
    storage: Arc<dyn StorageAdapter>,
}

impl Validator {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Validates `record` against `schema`, failing with a descriptive
    /// message naming the offending field and embedding the record.
    pub async fn validate(
        &self,
        record: &Map<String, Value>,
        schema: &TypeSchema,
    ) -> DataTreeResult<()> {
        let declared_type = record.get(FIELD_TYPE).and_then(Value::as_str);
        if declared_type != Some(schema.name.as_str()) {
            return Err(DataTreeError::Validation(format!(
                "unconfigured or missing type on record {}",
                render(record)
            )));
        }
        // Updates get a stored-copy fallback for omitted required fields.
        let stored_base = record
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .map(|id| format!("{}/{}", schema.storage_path(), id));
        self.validate_fields(record, &schema.fields, stored_base.as_deref())
            .await
    }

    fn validate_fields<'a>(
        &'a self,
        record: &'a Map<String, Value>,
        fields: &'a [FieldSchema],
        stored_base: Option<&'a str>,
    ) -> BoxFuture<'a, DataTreeResult<()>> {
        Box::pin(async move {
            for field in fields {
                self.validate_field(record, field, stored_base).await?;
            }
            // Undeclared keys are rejected at every nesting level.
            for key in record.keys() {
                if is_reserved_field(key) {
                    continue;
                }
                if !fields.iter().any(|f| f.name == *key) {
                    return Err(DataTreeError::Validation(format!(
                        "undeclared field '{}' present on record {}",
                        key,
                        render(record)
                    )));
                }
            }
            Ok(())
        })
    }

    async fn validate_field(
        &self,
        record: &Map<String, Value>,
        field: &FieldSchema,
        stored_base: Option<&str>,
    ) -> DataTreeResult<()> {
        let value = match record.get(&field.name) {
            Some(value) if !is_empty(Some(value)) => value,
            _ => {
                if !field.required {
                    return Ok(());
                }
                // Brand-new records must carry every required field; records
                // with an id may rely on the stored copy.
                if let Some(base) = stored_base {
                    let location = format!("{}/{}", base, field.storage_path());
                    if self.storage.exists_at(&location).await? {
                        return Ok(());
                    }
                }
                return Err(DataTreeError::Validation(format!(
                    "required field '{}' missing on record {}",
                    field.name,
                    render(record)
                )));
            }
        };
        let matches = match &field.field_type {
            FieldType::String => value.is_string(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Number => value.is_number(),
            FieldType::Date => is_date(value),
            FieldType::Object => match value.as_object() {
                Some(nested) => {
                    let nested_base =
                        stored_base.map(|base| format!("{}/{}", base, field.storage_path()));
                    self.validate_fields(nested, &field.children, nested_base.as_deref())
                        .await?;
                    true
                }
                None => false,
            },
            FieldType::Reference(type_name) => is_reference_to(value, type_name),
            FieldType::ReferenceArray(type_name) => match value.as_array() {
                Some(elements) => elements.iter().all(|e| is_reference_to(e, type_name)),
                None => false,
            },
        };
        if !matches {
            return Err(DataTreeError::Validation(format!(
                "invalid type for field '{}' (declared {}) on record {}",
                field.name,
                String::from(field.field_type.clone()),
                render(record)
            )));
        }
        Ok(())
    }
}

/// Absent, null, and empty string/array/object all count as missing for the
/// purposes of required-field checks.
fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// Dates are accepted as unix-epoch milliseconds or an RFC 3339 string.
fn is_date(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => DateTime::parse_from_rfc3339(s).is_ok(),
        _ => false,
    }
}

fn is_reference_to(value: &Value, type_name: &str) -> bool {
    value
        .get(FIELD_TYPE)
        .and_then(Value::as_str)
        .map(|t| t == type_name)
        .unwrap_or(false)
}

fn render(record: &Map<String, Value>) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| "<unserializable record>".to_string())
}

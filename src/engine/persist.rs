//! The persistence engine: validates a record, computes its storage
//! location, assigns id and timestamps, then decomposes it into one write
//! per field at its configured path. Referenced records are recursively
//! saved at their own type's location and re-linked by id; related records
//! are never embedded.

use chrono::{DateTime, Utc};
use futures::future::{try_join_all, BoxFuture};
use log::debug;
use serde_json::{Map, Value};

use super::DataTree;
use crate::constants::{
    is_reserved_field, FIELD_CREATED_AT, FIELD_ID, FIELD_LAST_UPDATED_AT, FIELD_TYPE,
};
use crate::error::{DataTreeError, DataTreeResult};
use crate::schema::{FieldSchema, FieldType, TypeSchema};
use crate::storage::WriteMode;

impl DataTree {
    /// Creates a record. The record must carry a `type`; an explicit `id`
    /// that already exists fails with an "already exists" error and leaves
    /// remote state untouched. Returns the saved record with `id` and
    /// timestamps attached.
    pub async fn create(&self, record: Value) -> DataTreeResult<Value> {
        let record = as_record(record)?;
        let schema = self.load_schema_for(&record).await?;
        if let Some(id) = record.get(FIELD_ID).and_then(Value::as_str) {
            let location = format!("{}/{}", schema.storage_path(), id);
            if self.inner().storage.exists_at(&location).await? {
                return Err(DataTreeError::Usage(format!(
                    "record '{}' of type '{}' already exists",
                    id, schema.name
                )));
            }
        }
        self.save_record(record, &schema).await
    }

    /// Updates a record. Requires `type` and `id`, and fails not-found when
    /// nothing is stored at that id. Fields omitted from the record are left
    /// untouched; fields explicitly set to `null` are removed remotely.
    pub async fn update(&self, record: Value) -> DataTreeResult<Value> {
        let record = as_record(record)?;
        let schema = self.load_schema_for(&record).await?;
        let id = record
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DataTreeError::Usage(format!(
                    "update requires an 'id' on record of type '{}'",
                    schema.name
                ))
            })?;
        let location = format!("{}/{}", schema.storage_path(), id);
        if !self.inner().storage.exists_at(&location).await? {
            return Err(DataTreeError::NotFound(format!(
                "no record '{}' of type '{}' to update",
                id, schema.name
            )));
        }
        self.save_record(record, &schema).await
    }

    async fn load_schema_for(&self, record: &Map<String, Value>) -> DataTreeResult<TypeSchema> {
        let type_name = record
            .get(FIELD_TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DataTreeError::Usage("record is missing the required 'type' field".to_string())
            })?;
        self.inner().schemas.get_type(type_name).await
    }

    /// Validates and persists one record, returning it with `id` and
    /// timestamps attached. Shared by create, update, and the recursive
    /// saving of referenced records.
    pub(crate) fn save_record<'a>(
        &'a self,
        record: Map<String, Value>,
        schema: &'a TypeSchema,
    ) -> BoxFuture<'a, DataTreeResult<Value>> {
        Box::pin(async move {
            self.inner().validator.validate(&record, schema).await?;

            let type_location = schema.storage_path();
            // A new record needs its id and root stub persisted before any
            // field write happens.
            let (id, newly_created) = match record.get(FIELD_ID).and_then(Value::as_str) {
                Some(id) => {
                    let location = format!("{}/{}", type_location, id);
                    let existed = self.inner().storage.exists_at(&location).await?;
                    (id.to_string(), !existed)
                }
                None => {
                    let mut stub = Map::new();
                    stub.insert(FIELD_TYPE.to_string(), Value::String(schema.name.clone()));
                    let stub = Value::Object(stub);
                    let created = self
                        .inner()
                        .storage
                        .create_at(type_location, stub)
                        .await?;
                    let id = created
                        .get(FIELD_ID)
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            DataTreeError::Storage(format!(
                                "adapter returned no id creating record of type '{}'",
                                schema.name
                            ))
                        })?;
                    (id.to_string(), true)
                }
            };
            let record_location = format!("{}/{}", type_location, id);

            let now = Utc::now().timestamp_millis();
            let mut stamp = Map::new();
            stamp.insert(FIELD_TYPE.to_string(), Value::String(schema.name.clone()));
            stamp.insert(FIELD_LAST_UPDATED_AT.to_string(), Value::from(now));
            if newly_created {
                stamp.insert(FIELD_CREATED_AT.to_string(), Value::from(now));
            }
            self.inner()
                .storage
                .write_at(&record_location, Some(Value::Object(stamp.clone())), WriteMode::Merge)
                .await?;
            debug!(
                "Saving record '{}' of type '{}' ({} fields)",
                id,
                schema.name,
                record.len()
            );

            // One pending write per present top-level field, joined
            // all-or-nothing.
            let mut writes = Vec::new();
            for (key, value) in &record {
                if is_reserved_field(key) {
                    continue;
                }
                let field = schema.field(key).ok_or_else(|| {
                    DataTreeError::NotFound(format!(
                        "no field configuration for '{}' on type '{}'",
                        key, schema.name
                    ))
                })?;
                writes.push(self.write_field(record_location.clone(), field, value));
            }
            try_join_all(writes).await?;

            let mut saved = record;
            saved.insert(FIELD_ID.to_string(), Value::String(id));
            for (key, value) in stamp {
                saved.insert(key, value);
            }
            Ok(Value::Object(saved))
        })
    }

    /// Persists one field at `base/<storage path>`.
    ///
    /// Explicit `null` removes the path; nested objects recurse per child
    /// schema so each inner field lands at its own sub-path; reference
    /// fields save the referenced record(s) at their own type's location and
    /// write back only the link.
    fn write_field<'a>(
        &'a self,
        base: String,
        field: &'a FieldSchema,
        value: &'a Value,
    ) -> BoxFuture<'a, DataTreeResult<()>> {
        Box::pin(async move {
            let location = format!("{}/{}", base, field.storage_path());
            if value.is_null() {
                return self
                    .inner()
                    .storage
                    .write_at(&location, None, WriteMode::Set)
                    .await;
            }
            match &field.field_type {
                FieldType::Object => {
                    let nested = value.as_object().ok_or_else(|| {
                        DataTreeError::Validation(format!(
                            "field '{}' expected an object value",
                            field.name
                        ))
                    })?;
                    let mut writes = Vec::new();
                    for (key, child_value) in nested {
                        let child = field
                            .children
                            .iter()
                            .find(|c| c.name == *key)
                            .ok_or_else(|| {
                                DataTreeError::NotFound(format!(
                                    "no field configuration for '{}' under '{}'",
                                    key, field.name
                                ))
                            })?;
                        writes.push(self.write_field(location.clone(), child, child_value));
                    }
                    try_join_all(writes).await?;
                    Ok(())
                }
                FieldType::Reference(type_name) => {
                    let ref_id = self.save_reference(type_name, value).await?;
                    self.inner()
                        .storage
                        .write_at(&location, Some(Value::String(ref_id)), WriteMode::Set)
                        .await
                }
                FieldType::ReferenceArray(type_name) => {
                    let elements = value.as_array().ok_or_else(|| {
                        DataTreeError::Validation(format!(
                            "field '{}' expected an array value",
                            field.name
                        ))
                    })?;
                    let saves = elements
                        .iter()
                        .map(|element| self.save_reference(type_name, element));
                    let ids = try_join_all(saves).await?;
                    let members: Map<String, Value> =
                        ids.into_iter().map(|id| (id, Value::Bool(true))).collect();
                    // Replace, not merge: ids dropped from the array must not
                    // linger in the stored membership map.
                    self.inner()
                        .storage
                        .write_at(&location, Some(Value::Object(members)), WriteMode::Replace)
                        .await
                }
                FieldType::Date => {
                    let millis = date_to_millis(value, &field.name)?;
                    self.inner()
                        .storage
                        .write_at(&location, Some(millis), WriteMode::Set)
                        .await
                }
                FieldType::String | FieldType::Boolean | FieldType::Number => {
                    self.inner()
                        .storage
                        .write_at(&location, Some(value.clone()), WriteMode::Set)
                        .await
                }
            }
        })
    }

    /// Recursively saves a referenced record at its own type's location and
    /// returns its id, which the caller writes back as the link.
    async fn save_reference(&self, type_name: &str, value: &Value) -> DataTreeResult<String> {
        let referenced = value.as_object().ok_or_else(|| {
            DataTreeError::Validation(format!(
                "reference to type '{}' expected a record object, got {}",
                type_name, value
            ))
        })?;
        let schema = self.inner().schemas.get_type(type_name).await?;
        let saved = self.save_record(referenced.clone(), &schema).await?;
        saved
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                DataTreeError::Storage(format!(
                    "saved record of type '{}' has no id",
                    type_name
                ))
            })
    }
}

fn as_record(record: Value) -> DataTreeResult<Map<String, Value>> {
    match record {
        Value::Object(map) if !map.is_empty() => Ok(map),
        Value::Object(_) | Value::Null => Err(DataTreeError::Usage(
            "no record provided".to_string(),
        )),
        other => Err(DataTreeError::Usage(format!(
            "expected a record object, got {}",
            other
        ))),
    }
}

/// Normalizes a date value (millis or RFC 3339 string) to stored millis.
fn date_to_millis(value: &Value, field_name: &str) -> DataTreeResult<Value> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Value::from(dt.timestamp_millis()))
            .map_err(|_| {
                DataTreeError::Validation(format!(
                    "invalid date value for field '{}': '{}'",
                    field_name, s
                ))
            }),
        other => Err(DataTreeError::Validation(format!(
            "invalid date value for field '{}': {}",
            field_name, other
        ))),
    }
}

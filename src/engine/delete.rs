//! The cascade-delete engine: soft deletion with recursive fan-out through
//! reference fields marked for cascading.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::{try_join_all, BoxFuture};
use log::debug;
use serde_json::{Map, Value};

use super::DataTree;
use crate::constants::{FIELD_DELETED_AT, FIELD_LAST_UPDATED_AT};
use crate::error::{DataTreeError, DataTreeResult};
use crate::schema::FieldType;
use crate::storage::WriteMode;

impl DataTree {
    /// Soft-deletes the record: sets `deletedAt` and `lastUpdatedAt` on the
    /// stored copy (the row stays addressable), then recursively soft-deletes
    /// every record reachable through fields marked `cascade_delete`.
    ///
    /// Records are never hard-deleted by this operation; the deleted-record
    /// visibility modes on [`crate::query::QueryTree`] control whether they
    /// appear in query results.
    pub async fn delete_data(&self, type_name: &str, id: &str) -> DataTreeResult<()> {
        let visited = Arc::new(Mutex::new(HashSet::new()));
        self.soft_delete(type_name.to_string(), id.to_string(), visited)
            .await
    }

    fn soft_delete(
        &self,
        type_name: String,
        id: String,
        visited: Arc<Mutex<HashSet<(String, String)>>>,
    ) -> BoxFuture<'_, DataTreeResult<()>> {
        Box::pin(async move {
            // Cascade graphs may contain reference cycles; each record is
            // tombstoned at most once per delete.
            {
                let mut seen = visited.lock().expect("visited set poisoned");
                if !seen.insert((type_name.clone(), id.clone())) {
                    return Ok(());
                }
            }
            let schema = self.inner().schemas.get_type(&type_name).await?;
            let location = format!("{}/{}", schema.storage_path(), id);
            let raw = self
                .inner()
                .storage
                .read_at(&location, None)
                .await?
                .ok_or_else(|| {
                    DataTreeError::NotFound(format!(
                        "no record '{}' of type '{}' to delete",
                        id, type_name
                    ))
                })?;
            let Some(stored) = raw.as_object() else {
                return Err(DataTreeError::Storage(format!(
                    "expected a record at '{}'",
                    location
                )));
            };

            let now = Utc::now().timestamp_millis();
            let mut tombstone = Map::new();
            tombstone.insert(FIELD_DELETED_AT.to_string(), Value::from(now));
            tombstone.insert(FIELD_LAST_UPDATED_AT.to_string(), Value::from(now));
            self.inner()
                .storage
                .write_at(&location, Some(Value::Object(tombstone)), WriteMode::Merge)
                .await?;
            debug!("Soft-deleted record '{}' of type '{}'", id, type_name);

            // Collect cascade targets from the stored copy, then fan out.
            let mut targets: Vec<(String, String)> = Vec::new();
            for field in &schema.fields {
                if !field.cascade_delete {
                    continue;
                }
                let Some(value) = super::compose::resolve_path(stored, field.storage_path())
                else {
                    continue;
                };
                match &field.field_type {
                    FieldType::Reference(ref_type) => {
                        if let Some(ref_id) = value.as_str() {
                            targets.push((ref_type.clone(), ref_id.to_string()));
                        }
                    }
                    FieldType::ReferenceArray(ref_type) => {
                        if let Some(members) = value.as_object() {
                            for ref_id in members.keys() {
                                targets.push((ref_type.clone(), ref_id.clone()));
                            }
                        }
                    }
                    _ => {}
                }
            }
            let cascades = targets
                .into_iter()
                .map(|(ref_type, ref_id)| self.soft_delete(ref_type, ref_id, Arc::clone(&visited)));
            try_join_all(cascades).await?;
            Ok(())
        })
    }
}

//! The fetch/compose engine: walks a query tree alongside the matching type
//! schema, reads raw data through the adapter, and reassembles a typed record
//! graph, recursing into referenced types as directed by the query.
//!
//! One-shot (`search`) and live (`sync`) reads share the same recursive
//! routine; live reads additionally register idempotent per-location change
//! subscriptions before each read so no update occurring after the read is
//! missed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::DateTime;
use futures::future::{try_join_all, BoxFuture};
use log::warn;
use serde_json::{Map, Value};

use super::DataTree;
use crate::constants::{FIELD_DELETED_AT, FIELD_ID, RESERVED_FIELDS};
use crate::error::{DataTreeError, DataTreeResult};
use crate::query::{DeletedFilter, QueryTree};
use crate::schema::{FieldSchema, FieldType, TypeSchema};
use crate::storage::{ChangeCallback, ErrorCallback};

/// Receives each fresh result of a live query.
pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Receives failures occurring while a live query refreshes.
pub type QueryErrorCallback = Arc<dyn Fn(DataTreeError) + Send + Sync>;

/// Everything a change notification needs to re-run its query.
struct LiveContext {
    query_id: String,
    root: QueryTree,
    on_data: DataCallback,
    on_error: QueryErrorCallback,
}

impl DataTree {
    /// Fetches the record graph described by the query tree once.
    ///
    /// A query with a target id resolves to a single record object, or
    /// `Value::Null` when nothing (visible) is stored there. A query without
    /// one resolves to an array of records in no guaranteed order.
    pub async fn search(&self, tree: &QueryTree) -> DataTreeResult<Value> {
        let schema = self.inner().schemas.get_type(tree.type_name()).await?;
        self.compose_for_query(tree, &schema, None).await
    }

    /// Fetches the record graph and keeps it live: every composed storage
    /// location is subscribed, and any later change re-runs the query and
    /// delivers the fresh result through `on_data`. The initial result is
    /// returned directly. Tear down with [`DataTree::unsync`].
    ///
    /// Re-running `sync` with the same query tree merges into the existing
    /// registry entry rather than subscribing twice.
    pub async fn sync(
        &self,
        tree: &QueryTree,
        on_data: impl Fn(Value) + Send + Sync + 'static,
        on_error: impl Fn(DataTreeError) + Send + Sync + 'static,
    ) -> DataTreeResult<Value> {
        let schema = self.inner().schemas.get_type(tree.type_name()).await?;
        let live = LiveContext {
            query_id: tree.id().to_string(),
            root: tree.clone(),
            on_data: Arc::new(on_data),
            on_error: Arc::new(on_error),
        };
        self.compose_for_query(tree, &schema, Some(&live)).await
    }

    fn compose_for_query<'a>(
        &'a self,
        tree: &'a QueryTree,
        schema: &'a TypeSchema,
        live: Option<&'a LiveContext>,
    ) -> BoxFuture<'a, DataTreeResult<Value>> {
        Box::pin(async move {
            let location = match tree.target_id() {
                Some(id) => format!("{}/{}", schema.storage_path(), id),
                None => schema.storage_path().to_string(),
            };
            // Subscribe before the read so no change after the read is lost.
            if let Some(live) = live {
                self.subscribe_location(&location, live).await?;
            }
            let raw = self
                .inner()
                .storage
                .read_at(&location, tree.equality_filter())
                .await?;
            match tree.target_id() {
                Some(id) => {
                    let Some(value) = raw else {
                        return Ok(Value::Null);
                    };
                    let Some(fields) = value.as_object() else {
                        return Err(DataTreeError::Storage(format!(
                            "expected a record at '{}'",
                            location
                        )));
                    };
                    if !passes_deleted(fields, tree.deleted_filter()) {
                        return Ok(Value::Null);
                    }
                    self.compose_record(fields, id, tree, schema, live).await
                }
                None => {
                    let Some(value) = raw else {
                        return Ok(Value::Array(Vec::new()));
                    };
                    let Some(entries) = value.as_object() else {
                        return Err(DataTreeError::Storage(format!(
                            "expected a collection of records at '{}'",
                            location
                        )));
                    };
                    let mut compositions = Vec::new();
                    for (id, raw_record) in entries {
                        let Some(fields) = raw_record.as_object() else {
                            return Err(DataTreeError::Storage(format!(
                                "expected a record at '{}/{}'",
                                location, id
                            )));
                        };
                        if !passes_deleted(fields, tree.deleted_filter()) {
                            continue;
                        }
                        compositions.push(self.compose_record(fields, id, tree, schema, live));
                    }
                    let records = try_join_all(compositions).await?;
                    Ok(Value::Array(records))
                }
            }
        })
    }

    fn compose_record<'a>(
        &'a self,
        raw: &'a Map<String, Value>,
        id: &'a str,
        tree: &'a QueryTree,
        schema: &'a TypeSchema,
        live: Option<&'a LiveContext>,
    ) -> BoxFuture<'a, DataTreeResult<Value>> {
        Box::pin(async move {
            let mut out = self
                .compose_fields(raw, &schema.fields, Some(tree), live)
                .await?;
            out.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
            for key in RESERVED_FIELDS {
                if key == FIELD_ID {
                    continue;
                }
                if let Some(value) = raw.get(key) {
                    out.insert(key.to_string(), value.clone());
                }
            }
            Ok(Value::Object(out))
        })
    }

    /// Composes the declared fields of one raw record or nested object.
    ///
    /// Fans out one pending operation per field and joins all-or-nothing: a
    /// single field's failure fails the whole composition, so no partial
    /// records are ever returned.
    fn compose_fields<'a>(
        &'a self,
        raw: &'a Map<String, Value>,
        fields: &'a [FieldSchema],
        query: Option<&'a QueryTree>,
        live: Option<&'a LiveContext>,
    ) -> BoxFuture<'a, DataTreeResult<Map<String, Value>>> {
        Box::pin(async move {
            let mut tasks: Vec<BoxFuture<'a, DataTreeResult<Option<(String, Value)>>>> =
                Vec::new();
            for field in fields {
                let child = query.and_then(|q| q.child(&field.name));
                tasks.push(Box::pin(self.compose_field(raw, field, child, live)));
            }
            let pairs = try_join_all(tasks).await?;
            let mut out = Map::new();
            for (name, value) in pairs.into_iter().flatten() {
                out.insert(name, value);
            }
            Ok(out)
        })
    }

    async fn compose_field<'a>(
        &'a self,
        raw: &'a Map<String, Value>,
        field: &'a FieldSchema,
        child_query: Option<&'a QueryTree>,
        live: Option<&'a LiveContext>,
    ) -> DataTreeResult<Option<(String, Value)>> {
        let Some(raw_value) = resolve_path(raw, field.storage_path()) else {
            return Ok(None);
        };
        match &field.field_type {
            FieldType::Reference(type_name) => {
                // Unexpanded relations are invisible, never bare ids.
                let Some(child) = child_query else {
                    return Ok(None);
                };
                let Some(ref_id) = raw_value.as_str() else {
                    return Err(DataTreeError::Storage(format!(
                        "expected a stored id for reference field '{}', got {}",
                        field.name, raw_value
                    )));
                };
                let composed = self.compose_reference(type_name, ref_id, child, live).await?;
                Ok(composed.map(|value| (field.name.clone(), value)))
            }
            FieldType::ReferenceArray(type_name) => {
                let Some(child) = child_query else {
                    return Ok(None);
                };
                let Some(members) = raw_value.as_object() else {
                    return Err(DataTreeError::Storage(format!(
                        "expected a stored id set for reference field '{}', got {}",
                        field.name, raw_value
                    )));
                };
                let compositions = members
                    .keys()
                    .map(|ref_id| self.compose_reference(type_name, ref_id, child, live));
                let composed = try_join_all(compositions).await?;
                let elements: Vec<Value> = composed.into_iter().flatten().collect();
                Ok(Some((field.name.clone(), Value::Array(elements))))
            }
            FieldType::Object => {
                let Some(nested) = raw_value.as_object() else {
                    return Err(DataTreeError::Storage(format!(
                        "expected a stored object for field '{}', got {}",
                        field.name, raw_value
                    )));
                };
                let composed = self
                    .compose_fields(nested, &field.children, child_query, live)
                    .await?;
                Ok(Some((field.name.clone(), Value::Object(composed))))
            }
            FieldType::Date => Ok(Some((field.name.clone(), to_millis(raw_value, &field.name)?))),
            FieldType::String | FieldType::Boolean | FieldType::Number => {
                Ok(Some((field.name.clone(), raw_value.clone())))
            }
        }
    }

    /// Composes one referenced record by id, using the child query tree and
    /// the referenced type's schema. Resolves to `None` when the referenced
    /// record is absent or filtered out by the child's deleted mode, in which
    /// case the owning field is omitted (or the array element dropped).
    async fn compose_reference(
        &self,
        type_name: &str,
        ref_id: &str,
        child: &QueryTree,
        live: Option<&LiveContext>,
    ) -> DataTreeResult<Option<Value>> {
        let schema = self.inner().schemas.get_type(type_name).await?;
        let mut tree = child.clone();
        tree.set_target_id(ref_id);
        match self.compose_for_query(&tree, &schema, live).await? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    /// Registers a change subscription at `location` for the live query,
    /// idempotently per location. The first notification a fresh
    /// subscription delivers is suppressed: it merely replays the value the
    /// initial read already returned. Every later notification re-runs the
    /// root query one-shot and hands the result to the caller's callback.
    async fn subscribe_location(&self, location: &str, live: &LiveContext) -> DataTreeResult<()> {
        if !self.inner().subscriptions.reserve(&live.query_id, location) {
            return Ok(());
        }
        let seen_initial = Arc::new(AtomicBool::new(false));
        let engine = self.clone();
        let root = live.root.clone();
        let on_data = Arc::clone(&live.on_data);
        let on_error = Arc::clone(&live.on_error);
        let on_change: ChangeCallback = Arc::new(move |_current| {
            if !seen_initial.swap(true, Ordering::SeqCst) {
                return;
            }
            let engine = engine.clone();
            let root = root.clone();
            let on_data = Arc::clone(&on_data);
            let on_error = Arc::clone(&on_error);
            tokio::spawn(async move {
                match engine.search(&root).await {
                    Ok(result) => on_data(result),
                    Err(err) => {
                        warn!("live query '{}' refresh failed: {}", root.id(), err);
                        on_error(err);
                    }
                }
            });
        });
        let adapter_error: ErrorCallback = {
            let on_error = Arc::clone(&live.on_error);
            Arc::new(move |err| on_error(err))
        };
        match self
            .inner()
            .storage
            .subscribe(location, on_change, adapter_error)
            .await
        {
            Ok(handle) => {
                self.inner()
                    .subscriptions
                    .fulfill(&live.query_id, location, handle);
                Ok(())
            }
            Err(err) => {
                self.inner().subscriptions.release(&live.query_id, location);
                Err(err)
            }
        }
    }
}

fn passes_deleted(raw: &Map<String, Value>, mode: DeletedFilter) -> bool {
    let deleted = raw
        .get(FIELD_DELETED_AT)
        .map(|v| !v.is_null())
        .unwrap_or(false);
    match mode {
        DeletedFilter::Exclude => !deleted,
        DeletedFilter::Include => true,
        DeletedFilter::Only => deleted,
    }
}

/// Resolves a (possibly multi-segment) storage path against a raw record,
/// so several raw keys can nest under one logical field.
pub(crate) fn resolve_path<'v>(raw: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let mut current = raw.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Converts a stored date (millis or RFC 3339 string) to a millisecond value.
fn to_millis(value: &Value, field_name: &str) -> DataTreeResult<Value> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Value::from(dt.timestamp_millis()))
            .map_err(|_| {
                DataTreeError::Validation(format!(
                    "stored value for date field '{}' is not a timestamp: '{}'",
                    field_name, s
                ))
            }),
        other => Err(DataTreeError::Validation(format!(
            "stored value for date field '{}' is not a timestamp: {}",
            field_name, other
        ))),
    }
}

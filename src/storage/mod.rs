//! The storage adapter seam: the only boundary the engine depends on.
//!
//! Locations are `/`-separated paths into a tree-structured store. Adapters
//! own all actual I/O; the engine never touches a backend directly.

#[cfg(feature = "mock")]
pub mod memory;
pub mod sled_store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DataTreeError, DataTreeResult};
use crate::query::EqualityFilter;

#[cfg(feature = "mock")]
pub use memory::MemoryAdapter;
pub use sled_store::SledAdapter;

/// How `write_at` treats existing data at the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite the value at the path.
    Set,
    /// Replace the whole node at the path, discarding existing children.
    Replace,
    /// Shallow-merge an object value into the existing object.
    Merge,
}

/// Opaque handle identifying one active change subscription at one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Invoked with the current value at the subscribed location; the first
/// invocation fires immediately on subscribe, later ones on every change.
pub type ChangeCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Invoked when the subscription itself fails.
pub type ErrorCallback = Arc<dyn Fn(DataTreeError) + Send + Sync>;

/// Contract every storage backend must implement.
///
/// The engine assumes nothing about the backend beyond these operations:
/// existence check, point read with optional equality filter, create with id
/// assignment, write/merge/replace, delete, change subscription, named
/// advisory lock, and unique-id generation.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Whether any value is stored at the location.
    async fn exists_at(&self, location: &str) -> DataTreeResult<bool>;

    /// Reads the value at the location. When a filter is given and the value
    /// is a mapping of id to record, only entries whose `filter.field`
    /// equals `filter.value` are returned.
    async fn read_at(
        &self,
        location: &str,
        filter: Option<&EqualityFilter>,
    ) -> DataTreeResult<Option<Value>>;

    /// Stores `record` under a freshly generated child id of `location` and
    /// returns the record with `id` attached.
    async fn create_at(&self, location: &str, record: Value) -> DataTreeResult<Value>;

    /// Writes `value` at the location; `None` deletes the path.
    async fn write_at(
        &self,
        location: &str,
        value: Option<Value>,
        mode: WriteMode,
    ) -> DataTreeResult<()>;

    /// Removes the path and everything beneath it.
    async fn delete_at(&self, location: &str) -> DataTreeResult<()>;

    /// Registers a change subscription. The first notification fires
    /// immediately with the current value; subsequent notifications fire on
    /// every change at or beneath the location.
    async fn subscribe(
        &self,
        location: &str,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> DataTreeResult<SubscriptionHandle>;

    /// Tears down a subscription previously returned by `subscribe`.
    async fn unsubscribe(
        &self,
        location: &str,
        handle: SubscriptionHandle,
    ) -> DataTreeResult<()>;

    /// Acquires the named advisory lock; fails if it is already held.
    async fn lock(&self, name: &str) -> DataTreeResult<()>;

    /// Releases the named advisory lock; idempotent.
    async fn unlock(&self, name: &str) -> DataTreeResult<()>;

    /// Produces a fresh unique id.
    async fn generate_id(&self) -> DataTreeResult<String>;
}

/// Splits a location into its path segments, ignoring empty ones.
pub(crate) fn split_location(location: &str) -> Vec<&str> {
    location.split('/').filter(|s| !s.is_empty()).collect()
}

/// Whether a stored raw record matches an equality filter.
///
/// Scalar values compare directly; a stored membership map (id to `true`,
/// the persisted form of an array of references) matches when the filter
/// value is an id present in the map.
pub(crate) fn matches_filter(raw: &Value, filter: &EqualityFilter) -> bool {
    let Some(field_value) = raw.get(&filter.field) else {
        return false;
    };
    if field_value == &filter.value {
        return true;
    }
    match (field_value, &filter.value) {
        (Value::Object(members), Value::String(id)) => {
            members.get(id).map(|v| v == &Value::Bool(true)).unwrap_or(false)
        }
        _ => false,
    }
}

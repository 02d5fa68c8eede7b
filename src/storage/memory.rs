//! In-memory storage adapter.
//!
//! Backs the test suite and any in-process use: a single JSON tree behind a
//! mutex, with change subscriptions notified synchronously after each write.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{
    matches_filter, split_location, ChangeCallback, ErrorCallback, StorageAdapter,
    SubscriptionHandle, WriteMode,
};
use crate::constants::FIELD_ID;
use crate::error::{DataTreeError, DataTreeResult};
use crate::query::EqualityFilter;

struct Subscriber {
    location: String,
    on_change: ChangeCallback,
}

/// A tree-structured store held entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    data: Mutex<Value>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_handle: AtomicU64,
    locks: Mutex<HashSet<String>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn value_at(&self, location: &str) -> Option<Value> {
        let data = self.inner.data.lock().expect("memory store poisoned");
        let mut current = &*data;
        for segment in split_location(location) {
            current = current.get(segment)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current.clone())
        }
    }

    fn mutate_at(&self, location: &str, value: Option<Value>, mode: WriteMode) {
        {
            let mut data = self.inner.data.lock().expect("memory store poisoned");
            let segments = split_location(location);
            match value {
                None => remove_path(&mut data, &segments),
                Some(new_value) => {
                    let slot = ensure_path(&mut data, &segments);
                    match mode {
                        WriteMode::Set | WriteMode::Replace => *slot = new_value,
                        WriteMode::Merge => merge_into(slot, new_value),
                    }
                }
            }
        }
        self.notify(location);
    }

    /// Notifies every subscriber whose location is at, above, or below the
    /// mutated path, with the current value at its own location. Callbacks
    /// run outside the data lock.
    fn notify(&self, changed: &str) {
        let changed_segments: Vec<String> =
            split_location(changed).iter().map(|s| s.to_string()).collect();
        let interested: Vec<(String, ChangeCallback)> = {
            let subscribers = self.inner.subscribers.lock().expect("subscribers poisoned");
            subscribers
                .values()
                .filter(|sub| {
                    let sub_segments = split_location(&sub.location);
                    let len = sub_segments.len().min(changed_segments.len());
                    sub_segments[..len]
                        .iter()
                        .zip(changed_segments[..len].iter())
                        .all(|(a, b)| *a == b.as_str())
                })
                .map(|sub| (sub.location.clone(), Arc::clone(&sub.on_change)))
                .collect()
        };
        for (location, on_change) in interested {
            on_change(self.value_at(&location));
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn exists_at(&self, location: &str) -> DataTreeResult<bool> {
        Ok(self.value_at(location).is_some())
    }

    async fn read_at(
        &self,
        location: &str,
        filter: Option<&EqualityFilter>,
    ) -> DataTreeResult<Option<Value>> {
        let Some(value) = self.value_at(location) else {
            return Ok(None);
        };
        let Some(filter) = filter else {
            return Ok(Some(value));
        };
        let Value::Object(entries) = value else {
            return Ok(None);
        };
        let filtered: Map<String, Value> = entries
            .into_iter()
            .filter(|(_, raw)| matches_filter(raw, filter))
            .collect();
        if filtered.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Value::Object(filtered)))
        }
    }

    async fn create_at(&self, location: &str, record: Value) -> DataTreeResult<Value> {
        let Value::Object(mut fields) = record else {
            return Err(DataTreeError::Storage(format!(
                "create_at('{}') requires an object value",
                location
            )));
        };
        let id = fields
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let stored: Value = fields
            .iter()
            .filter(|(k, _)| k.as_str() != FIELD_ID)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Map<String, Value>>()
            .into();
        self.mutate_at(&format!("{}/{}", location, id), Some(stored), WriteMode::Set);
        fields.insert(FIELD_ID.to_string(), Value::String(id));
        Ok(Value::Object(fields))
    }

    async fn write_at(
        &self,
        location: &str,
        value: Option<Value>,
        mode: WriteMode,
    ) -> DataTreeResult<()> {
        self.mutate_at(location, value, mode);
        Ok(())
    }

    async fn delete_at(&self, location: &str) -> DataTreeResult<()> {
        self.mutate_at(location, None, WriteMode::Set);
        Ok(())
    }

    async fn subscribe(
        &self,
        location: &str,
        on_change: ChangeCallback,
        _on_error: ErrorCallback,
    ) -> DataTreeResult<SubscriptionHandle> {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        {
            let mut subscribers = self.inner.subscribers.lock().expect("subscribers poisoned");
            subscribers.insert(
                handle,
                Subscriber {
                    location: location.to_string(),
                    on_change: Arc::clone(&on_change),
                },
            );
        }
        // First notification fires immediately with the current value.
        on_change(self.value_at(location));
        Ok(SubscriptionHandle(handle))
    }

    async fn unsubscribe(
        &self,
        _location: &str,
        handle: SubscriptionHandle,
    ) -> DataTreeResult<()> {
        let mut subscribers = self.inner.subscribers.lock().expect("subscribers poisoned");
        subscribers.remove(&handle.0);
        Ok(())
    }

    async fn lock(&self, name: &str) -> DataTreeResult<()> {
        let mut locks = self.inner.locks.lock().expect("locks poisoned");
        if !locks.insert(name.to_string()) {
            return Err(DataTreeError::Storage(format!(
                "lock '{}' is already held",
                name
            )));
        }
        Ok(())
    }

    async fn unlock(&self, name: &str) -> DataTreeResult<()> {
        let mut locks = self.inner.locks.lock().expect("locks poisoned");
        locks.remove(name);
        Ok(())
    }

    async fn generate_id(&self) -> DataTreeResult<String> {
        Ok(Uuid::new_v4().to_string())
    }
}

fn ensure_path<'a>(root: &'a mut Value, segments: &[&str]) -> &'a mut Value {
    let mut current = root;
    for segment in segments {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    current
}

fn remove_path(root: &mut Value, segments: &[&str]) {
    let Some((last, parents)) = segments.split_last() else {
        *root = Value::Object(Map::new());
        return;
    };
    let mut current = root;
    for segment in parents {
        match current.get_mut(*segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(*last);
    }
}

fn merge_into(slot: &mut Value, value: Value) {
    match (slot.as_object_mut(), value) {
        (Some(existing), Value::Object(incoming)) => {
            for (key, val) in incoming {
                existing.insert(key, val);
            }
        }
        (_, value) => *slot = value,
    }
}

//! Sled-backed storage adapter.
//!
//! Every tree path maps to one sled key holding a JSON-serialized scalar
//! leaf; object writes are decomposed into one leaf per nested scalar, and
//! interior reads reassemble subtrees by prefix scan. Change notification is
//! in-process: all writes flow through the adapter, so the adapter is its own
//! notification hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{
    matches_filter, split_location, ChangeCallback, ErrorCallback, StorageAdapter,
    SubscriptionHandle, WriteMode,
};
use crate::constants::{FIELD_ID, LOCK_PATH};
use crate::error::{DataTreeError, DataTreeResult};
use crate::query::EqualityFilter;

struct Subscriber {
    location: String,
    on_change: ChangeCallback,
}

/// A tree-structured store persisted in an embedded sled database.
#[derive(Clone)]
pub struct SledAdapter {
    db: sled::Db,
    subscribers: Arc<Mutex<HashMap<u64, Subscriber>>>,
    next_handle: Arc<AtomicU64>,
}

impl SledAdapter {
    /// Wraps an already-open sled database.
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Opens (or creates) a sled database at the given filesystem path.
    pub fn open(path: &str) -> DataTreeResult<Self> {
        Ok(Self::new(sled::open(path)?))
    }

    fn read_tree(&self, location: &str) -> DataTreeResult<Option<Value>> {
        if let Some(bytes) = self.db.get(location.as_bytes())? {
            let leaf: Value = serde_json::from_slice(&bytes)?;
            return Ok(Some(leaf));
        }
        let prefix = format!("{}/", location);
        let mut root = Value::Object(Map::new());
        let mut found = false;
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, bytes) = entry?;
            let key = String::from_utf8_lossy(&key).to_string();
            let relative = &key[prefix.len()..];
            let leaf: Value = serde_json::from_slice(&bytes)?;
            insert_leaf(&mut root, &split_location(relative), leaf);
            found = true;
        }
        if found {
            Ok(Some(root))
        } else {
            Ok(None)
        }
    }

    /// Writes a value tree as one sled leaf per nested scalar.
    fn insert_tree(&self, location: &str, value: &Value) -> DataTreeResult<()> {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    self.insert_tree(&format!("{}/{}", location, key), child)?;
                }
                Ok(())
            }
            Value::Null => {
                self.remove_subtree(location)?;
                Ok(())
            }
            leaf => {
                self.db
                    .insert(location.as_bytes(), serde_json::to_vec(leaf)?)?;
                Ok(())
            }
        }
    }

    fn remove_subtree(&self, location: &str) -> DataTreeResult<()> {
        self.db.remove(location.as_bytes())?;
        let prefix = format!("{}/", location);
        let keys: Vec<sled::IVec> = self
            .db
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.db.remove(key)?;
        }
        Ok(())
    }

    fn flush(&self) -> DataTreeResult<()> {
        // Ensure the data is durably written to disk.
        self.db.flush()?;
        Ok(())
    }

    fn notify(&self, changed: &str) {
        let changed_segments: Vec<String> =
            split_location(changed).iter().map(|s| s.to_string()).collect();
        let interested: Vec<(String, ChangeCallback)> = {
            let subscribers = self.subscribers.lock().expect("subscribers poisoned");
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
            let current = self.read_tree(&location).unwrap_or(None);
            on_change(current);
        }
    }
}

#[async_trait]
impl StorageAdapter for SledAdapter {
    async fn exists_at(&self, location: &str) -> DataTreeResult<bool> {
        if self.db.contains_key(location.as_bytes())? {
            return Ok(true);
        }
        let prefix = format!("{}/", location);
        Ok(self.db.scan_prefix(prefix.as_bytes()).next().is_some())
    }

    async fn read_at(
        &self,
        location: &str,
        filter: Option<&EqualityFilter>,
    ) -> DataTreeResult<Option<Value>> {
        let Some(value) = self.read_tree(location)? else {
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
        let child = format!("{}/{}", location, id);
        for (key, value) in fields.iter() {
            if key.as_str() == FIELD_ID {
                continue;
            }
            self.insert_tree(&format!("{}/{}", child, key), value)?;
        }
        self.flush()?;
        self.notify(&child);
        fields.insert(FIELD_ID.to_string(), Value::String(id));
        Ok(Value::Object(fields))
    }

    async fn write_at(
        &self,
        location: &str,
        value: Option<Value>,
        mode: WriteMode,
    ) -> DataTreeResult<()> {
        match value {
            None => self.remove_subtree(location)?,
            Some(value) => match mode {
                WriteMode::Set | WriteMode::Replace => {
                    self.remove_subtree(location)?;
                    self.insert_tree(location, &value)?;
                }
                WriteMode::Merge => match value {
                    Value::Object(map) => {
                        for (key, child) in &map {
                            let child_location = format!("{}/{}", location, key);
                            self.remove_subtree(&child_location)?;
                            self.insert_tree(&child_location, child)?;
                        }
                    }
                    leaf => {
                        self.remove_subtree(location)?;
                        self.insert_tree(location, &leaf)?;
                    }
                },
            },
        }
        self.flush()?;
        self.notify(location);
        Ok(())
    }

    async fn delete_at(&self, location: &str) -> DataTreeResult<()> {
        self.remove_subtree(location)?;
        self.flush()?;
        self.notify(location);
        Ok(())
    }

    async fn subscribe(
        &self,
        location: &str,
        on_change: ChangeCallback,
        _on_error: ErrorCallback,
    ) -> DataTreeResult<SubscriptionHandle> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        {
            let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
            subscribers.insert(
                handle,
                Subscriber {
                    location: location.to_string(),
                    on_change: Arc::clone(&on_change),
                },
            );
        }
        on_change(self.read_tree(location)?);
        Ok(SubscriptionHandle(handle))
    }

    async fn unsubscribe(
        &self,
        _location: &str,
        handle: SubscriptionHandle,
    ) -> DataTreeResult<()> {
        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        subscribers.remove(&handle.0);
        Ok(())
    }

    async fn lock(&self, name: &str) -> DataTreeResult<()> {
        let key = format!("{}/{}", LOCK_PATH, name);
        let swap = self
            .db
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(&b"1"[..]))?;
        if swap.is_err() {
            return Err(DataTreeError::Storage(format!(
                "lock '{}' is already held",
                name
            )));
        }
        self.flush()
    }

    async fn unlock(&self, name: &str) -> DataTreeResult<()> {
        let key = format!("{}/{}", LOCK_PATH, name);
        self.db.remove(key.as_bytes())?;
        self.flush()
    }

    async fn generate_id(&self) -> DataTreeResult<String> {
        Ok(Uuid::new_v4().to_string())
    }
}

fn insert_leaf(root: &mut Value, segments: &[&str], leaf: Value) {
    let mut current = root;
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(last.to_string(), leaf);
}

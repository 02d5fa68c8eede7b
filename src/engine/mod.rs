//! The engine facade: one handle coordinating schema configuration,
//! validation, fetch/compose, persistence, cascade delete, live
//! subscriptions, and advisory locks, all over a pluggable storage adapter.

pub mod compose;
pub mod delete;
pub mod persist;
pub mod subscriptions;

use std::sync::Arc;

use log::warn;

use crate::error::DataTreeResult;
use crate::query::QueryTree;
use crate::schema::{SchemaRegistry, TypeSchema, Validator};
use crate::storage::StorageAdapter;
use subscriptions::SubscriptionRegistry;

/// The central coordination point for all data operations.
///
/// `DataTree` loads the relevant type schemas from the schema registry on
/// every operation (no cache, so schema changes take effect on the next
/// call), then drives validation, composition, persistence, or cascade
/// delete, all of which call back into the storage adapter for actual I/O.
///
/// The handle is cheap to clone; clones share the adapter and the
/// subscription registry.
#[derive(Clone)]
pub struct DataTree {
    inner: Arc<DataTreeInner>,
}

pub(crate) struct DataTreeInner {
    pub(crate) storage: Arc<dyn StorageAdapter>,
    pub(crate) schemas: SchemaRegistry,
    pub(crate) validator: Validator,
    pub(crate) subscriptions: SubscriptionRegistry,
}

impl DataTree {
    /// Creates an engine over the given storage adapter.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner: Arc::new(DataTreeInner {
                schemas: SchemaRegistry::new(Arc::clone(&storage)),
                validator: Validator::new(Arc::clone(&storage)),
                subscriptions: SubscriptionRegistry::new(),
                storage,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &DataTreeInner {
        &self.inner
    }

    /// Declares a record type. Types must be configured before records of
    /// that type are validated, saved, or queried.
    pub async fn configure_type(&self, schema: &TypeSchema) -> DataTreeResult<()> {
        self.inner.schemas.configure_type(schema).await
    }

    /// Loads a configured type schema.
    pub async fn get_type(&self, name: &str) -> DataTreeResult<TypeSchema> {
        self.inner.schemas.get_type(name).await
    }

    /// Names of every configured type.
    pub async fn list_types(&self) -> DataTreeResult<Vec<String>> {
        self.inner.schemas.list_types().await
    }

    /// Tears down every subscription recorded for the given query tree.
    /// A tree id that was never synced is a no-op.
    ///
    /// Every recorded location is attempted even when one unsubscribe fails;
    /// the first failure is returned after the sweep completes.
    pub async fn unsync(&self, tree: &QueryTree) -> DataTreeResult<()> {
        let Some(entries) = self.inner.subscriptions.drain(tree.id()) else {
            return Ok(());
        };
        let mut first_error = None;
        for (location, handle) in entries {
            if let Err(err) = self.inner.storage.unsubscribe(&location, handle).await {
                warn!("unsubscribe at '{}' failed: {}", location, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Acquires a named advisory lock. Fails if the name is already locked.
    /// No lease or expiry exists: a lock held by a crashed caller is never
    /// released automatically.
    pub async fn lock(&self, name: &str) -> DataTreeResult<()> {
        self.inner.storage.lock(name).await
    }

    /// Releases a named advisory lock. Idempotent.
    pub async fn unlock(&self, name: &str) -> DataTreeResult<()> {
        self.inner.storage.unlock(name).await
    }
}

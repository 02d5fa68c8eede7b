//! datatree: a schema-governed data-access layer for tree-structured
//! key/value stores.
//!
//! Callers declare typed record schemas at runtime, then create, update,
//! soft-delete, query, and live-subscribe to records. The engine validates
//! records against their schema, decomposes them into per-field writes at
//! configured storage paths, and recomposes nested and relational data back
//! into a single object graph on read. All I/O goes through the pluggable
//! [`storage::StorageAdapter`] boundary.

pub mod constants;
pub mod engine;
pub mod error;
pub mod query;
pub mod schema;
pub mod storage;

pub use engine::DataTree;
pub use error::{DataTreeError, DataTreeResult};
pub use query::{DeletedFilter, EqualityFilter, QueryTree};
pub use schema::{FieldSchema, FieldType, SchemaRegistry, TypeSchema, Validator};
pub use storage::{StorageAdapter, SubscriptionHandle, WriteMode};

#[cfg(feature = "mock")]
pub use storage::MemoryAdapter;
pub use storage::SledAdapter;

//! Schema management: type and field schema value objects, their persistence
//! as data under reserved namespaces, and record validation.

pub mod registry;
pub mod types;
pub mod validator;

pub use registry::SchemaRegistry;
pub use types::{FieldSchema, FieldType, TypeSchema};
pub use validator::Validator;

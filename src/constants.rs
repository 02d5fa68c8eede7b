/// Common constants used across the datatree crate.
///
/// Reserved field names are service-managed and may never be declared on a
/// type schema or set directly by callers (except `type`, which every record
/// must carry, and `id` on updates).
pub const FIELD_ID: &str = "id";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_LAST_UPDATED_AT: &str = "lastUpdatedAt";
pub const FIELD_DELETED_AT: &str = "deletedAt";

/// All reserved field names, in one place for validation.
pub const RESERVED_FIELDS: [&str; 5] = [
    FIELD_ID,
    FIELD_TYPE,
    FIELD_CREATED_AT,
    FIELD_LAST_UPDATED_AT,
    FIELD_DELETED_AT,
];

/// Reserved storage namespace for persisted type schemas, keyed by type name.
pub const TYPE_SCHEMA_PATH: &str = "_schemas/types";

/// Reserved storage namespace for persisted field schemas, keyed by a
/// generated id so nested schemas are stored once and referenced.
pub const FIELD_SCHEMA_PATH: &str = "_schemas/fields";

/// Reserved storage namespace for advisory locks.
pub const LOCK_PATH: &str = "_locks";

/// Returns true for field names managed by the service rather than declared
/// on a schema.
pub fn is_reserved_field(name: &str) -> bool {
    RESERVED_FIELDS.contains(&name)
}

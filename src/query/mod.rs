//! Query trees: value objects describing what to fetch and which relational
//! fields to expand into nested data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DataTreeError, DataTreeResult};

/// A single equality predicate applied to a fetch-all read.
///
/// For a reference field the value is the referenced record's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqualityFilter {
    pub field: String,
    pub value: Value,
}

/// Visibility of soft-deleted records in query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletedFilter {
    /// Soft-deleted records are filtered out (the default).
    #[default]
    Exclude,
    /// Soft-deleted records are returned alongside live ones.
    Include,
    /// Only soft-deleted records are returned.
    Only,
}

/// A request for a record graph: a root type, an optional target id or
/// equality filter, and a mapping of field name to child query for every
/// relational field the caller wants expanded.
///
/// A field absent from the mapping is never expanded: reference fields are
/// omitted from the result entirely, and nested objects appear with their own
/// reference sub-fields expanded only as mapped, recursively.
///
/// The generated id keys the subscription registry while a live query built
/// from this tree is active, and correlates `unsync` with the `sync` that
/// created it.
#[derive(Debug, Clone)]
pub struct QueryTree {
    id: String,
    type_name: String,
    target_id: Option<String>,
    filter: Option<EqualityFilter>,
    deleted: DeletedFilter,
    children: BTreeMap<String, QueryTree>,
}

impl QueryTree {
    /// A query for all records of `type_name`.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            type_name: type_name.into(),
            target_id: None,
            filter: None,
            deleted: DeletedFilter::default(),
            children: BTreeMap::new(),
        }
    }

    /// A query for the single record of `type_name` with the given id.
    pub fn with_id(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        let mut tree = Self::new(type_name);
        tree.target_id = Some(id.into());
        tree
    }

    /// Expands the named relational field, returning the child tree so the
    /// caller can continue configuring deeper expansion. Calling `include`
    /// again for the same field returns the already-registered child.
    pub fn include(&mut self, field: impl Into<String>) -> &mut QueryTree {
        let field = field.into();
        self.children
            .entry(field.clone())
            .or_insert_with(|| Self::new(field))
    }

    /// Restricts a fetch-all query to records whose `field` equals `value`.
    ///
    /// A filter may be set at most once, and never on a query that already
    /// targets a single id; both misuses are usage errors, not silent
    /// overwrites.
    pub fn filter(&mut self, field: impl Into<String>, value: Value) -> DataTreeResult<&mut Self> {
        if self.target_id.is_some() {
            return Err(DataTreeError::Usage(format!(
                "cannot filter query '{}': it already targets id '{}'",
                self.type_name,
                self.target_id.as_deref().unwrap_or_default()
            )));
        }
        if let Some(existing) = &self.filter {
            return Err(DataTreeError::Usage(format!(
                "filter already set on query '{}' (field '{}')",
                self.type_name, existing.field
            )));
        }
        self.filter = Some(EqualityFilter {
            field: field.into(),
            value,
        });
        Ok(self)
    }

    /// Returns soft-deleted records alongside live ones.
    pub fn with_deleted(&mut self) -> &mut Self {
        self.deleted = DeletedFilter::Include;
        self
    }

    /// Returns only soft-deleted records.
    pub fn deleted_only(&mut self) -> &mut Self {
        self.deleted = DeletedFilter::Only;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    pub(crate) fn set_target_id(&mut self, id: impl Into<String>) {
        self.target_id = Some(id.into());
    }

    pub fn equality_filter(&self) -> Option<&EqualityFilter> {
        self.filter.as_ref()
    }

    pub fn deleted_filter(&self) -> DeletedFilter {
        self.deleted
    }

    /// The child query registered for a field, if the caller expanded it.
    pub fn child(&self, field: &str) -> Option<&QueryTree> {
        self.children.get(field)
    }

    pub fn expanded_fields(&self) -> impl Iterator<Item = (&String, &QueryTree)> {
        self.children.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn include_is_idempotent() {
        let mut tree = QueryTree::new("Person");
        let first_id = tree.include("pet").id().to_string();
        let second_id = tree.include("pet").id().to_string();
        assert_eq!(first_id, second_id);
    }

    #[test]
    fn filter_twice_is_rejected() {
        let mut tree = QueryTree::new("Person");
        tree.filter("name", json!("Amy")).unwrap();
        let err = tree.filter("name", json!("Bob")).unwrap_err();
        assert!(matches!(err, DataTreeError::Usage(_)));
        // The original filter survives the failed second call.
        assert_eq!(tree.equality_filter().unwrap().value, json!("Amy"));
    }

    #[test]
    fn filter_and_target_id_are_mutually_exclusive() {
        let mut tree = QueryTree::with_id("Person", "p1");
        assert!(matches!(
            tree.filter("name", json!("Amy")),
            Err(DataTreeError::Usage(_))
        ));
    }

    #[test]
    fn fresh_trees_get_distinct_ids() {
        assert_ne!(QueryTree::new("Person").id(), QueryTree::new("Person").id());
    }
}

//! Unique secondary indexes.
//!
//! A cache may declare unique indexes on document fields before it starts.
//! Enforcement is the store's job (the index is registered there); the
//! in-memory side keeps the typed extractor and equality so reads through
//! an index can defensively re-check what the store returned.

use std::sync::Arc;

use serde_json::Value;

/// A declared unique index on one document field.
pub struct UniqueIndex<D> {
    field_name: String,
    extract: Arc<dyn Fn(&D) -> Option<Value> + Send + Sync>,
    equals: Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>,
}

impl<D> Clone for UniqueIndex<D> {
    fn clone(&self) -> Self {
        Self {
            field_name: self.field_name.clone(),
            extract: self.extract.clone(),
            equals: self.equals.clone(),
        }
    }
}

impl<D> std::fmt::Debug for UniqueIndex<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueIndex")
            .field("field_name", &self.field_name)
            .finish()
    }
}

impl<D> UniqueIndex<D> {
    /// An index on `field_name` with value-equality semantics.
    pub fn new(
        field_name: impl Into<String>,
        extract: impl Fn(&D) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            extract: Arc::new(extract),
            equals: Arc::new(|a, b| a == b),
        }
    }

    /// An index with custom equality (e.g. case-insensitive names).
    pub fn with_equality(
        field_name: impl Into<String>,
        extract: impl Fn(&D) -> Option<Value> + Send + Sync + 'static,
        equals: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            extract: Arc::new(extract),
            equals: Arc::new(equals),
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// The indexed value of `doc`, if it carries one.
    pub fn extract(&self, doc: &D) -> Option<Value> {
        (self.extract)(doc)
    }

    pub fn matches(&self, a: &Value, b: &Value) -> bool {
        (self.equals)(a, b)
    }
}

/// The immutable set of unique indexes a cache was started with.
pub struct IndexCatalog<D> {
    indexes: Vec<UniqueIndex<D>>,
}

impl<D> IndexCatalog<D> {
    pub fn new(indexes: Vec<UniqueIndex<D>>) -> Self {
        Self { indexes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &UniqueIndex<D>> {
        self.indexes.iter()
    }

    pub fn find(&self, field_name: &str) -> Option<&UniqueIndex<D>> {
        self.indexes.iter().find(|i| i.field_name() == field_name)
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

//! # dockache-storage
//!
//! The storage driver contract the cache layer consumes, the change-stream
//! event model, wire-form helpers, and a complete in-memory backend.
//!
//! A [`StoreClient`] owns a connection to one store and hands out typed
//! [`CollectionDriver`]s. Drivers expose primary-key CRUD, a conditional
//! replace used by the optimistic update loop, unique-index registration
//! and lookup, and a change-stream factory. The concrete wire-protocol
//! driver for a remote MongoDB-class store plugs in behind the same trait;
//! the in-memory backend in [`memory`] implements the full contract
//! (including CAS semantics, unique-index enforcement, resume tokens and
//! bounded event retention) for tests and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use uuid::Uuid;

use dockache_core::config::StorageMode;
use dockache_core::document::Document;
use dockache_core::error::StorageError;

pub mod events;
pub mod memory;
pub mod wire;

pub use events::{ChangeEvent, OperationTime, ResumeToken, StreamStart};
pub use memory::MemoryClient;

/// Outcome of a conditional replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceOutcome {
    /// Documents matching the `{key, version}` filter.
    pub matched: u64,
    /// Documents actually replaced.
    pub modified: u64,
}

impl ReplaceOutcome {
    pub fn committed(&self) -> bool {
        self.modified == 1
    }
}

/// Callback invoked by the driver for every stream event, on the driver's
/// delivery context. Implementations must not block.
pub type EventProducer = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// An open change stream. Dropping the handle without closing leaves the
/// subscription to be reaped by the driver.
#[async_trait]
pub trait StreamHandle: Send + Sync + std::fmt::Debug {
    async fn close(&self);
    fn is_open(&self) -> bool;
}

/// Typed per-collection driver.
#[async_trait]
pub trait CollectionDriver<D: Document>: Send + Sync {
    /// Namespaced database this collection lives in.
    fn database(&self) -> &str;

    /// Collection name.
    fn collection(&self) -> &str;

    /// Insert a new document. Fails with a duplicate-key violation when the
    /// primary key or a registered unique index collides; the violation
    /// names the offending index.
    async fn insert(&self, doc: &D) -> Result<(), StorageError>;

    async fn read(&self, key: &D::Key) -> Result<Option<D>, StorageError>;

    /// Remove by key; returns whether a document was deleted.
    async fn delete(&self, key: &D::Key) -> Result<bool, StorageError>;

    async fn read_all(&self) -> Result<BoxStream<'static, Result<D, StorageError>>, StorageError>;

    async fn read_keys(
        &self,
    ) -> Result<BoxStream<'static, Result<D::Key, StorageError>>, StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    async fn has_key(&self, key: &D::Key) -> Result<bool, StorageError>;

    /// Remove every document; returns the number removed.
    async fn clear(&self) -> Result<u64, StorageError>;

    /// Compare-and-swap replace: replaces the document only if one exists
    /// with exactly `expected_key` and `expected_version`.
    async fn replace_if_version_matches(
        &self,
        expected_key: &D::Key,
        expected_version: i64,
        new_doc: &D,
    ) -> Result<ReplaceOutcome, StorageError>;

    /// Declare a unique secondary index on `field`. Idempotent.
    async fn register_unique_index(&self, field: &str) -> Result<(), StorageError>;

    async fn read_by_unique_index(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<Option<D>, StorageError>;

    /// Current cluster operation time, captured as a resume fallback
    /// bookmark before an initial load. `None` when the store cannot
    /// provide one.
    async fn current_operation_time(&self) -> Result<Option<OperationTime>, StorageError>;

    /// Open a change stream delivering every mutation after `start` to
    /// `producer`.
    async fn open_change_stream(
        &self,
        start: StreamStart,
        producer: EventProducer,
    ) -> Result<Box<dyn StreamHandle>, StorageError>;
}

/// A connected store client: a factory of typed collection drivers.
pub trait StoreClient: Send + Sync + 'static {
    /// Which backend this client speaks to.
    fn mode(&self) -> StorageMode;

    /// Process-unique identity of this client, used by the registry.
    fn client_id(&self) -> Uuid;

    /// A typed driver for `collection` in the namespaced `database`.
    fn collection<D: Document>(&self, database: &str, collection: &str)
        -> Arc<dyn CollectionDriver<D>>;
}

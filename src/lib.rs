//! # dockache
//!
//! An embeddable, strongly-consistent document cache fronting a
//! MongoDB-class document store. Each registered collection is mirrored
//! fully in memory as typed, immutable, versioned documents; CRUD goes
//! through the cache, writes persist under optimistic concurrency control,
//! and a change-stream replicator reconciles mutations made elsewhere.
//!
//! ## Quick start
//!
//! ```ignore
//! use dockache::{enable, disable, DockacheConfig, DocCache, MemoryClient};
//!
//! let registry = enable(&DockacheConfig::default())?;
//! let client = MemoryClient::new();
//! let registration = registry.register(&client, "game")?;
//!
//! let players = DocCache::<Player>::builder("players", Player::blank)
//!     .start(&client, &registration)
//!     .await?;
//!
//! let ada = players.create("u1".into(), |p| p.with_name("Ada")).await;
//! ```
//!
//! The crates behind this facade:
//!
//! - `dockache-core`: result algebra, document contract, errors, config,
//!   metrics fan-out, task context, trace logger.
//! - `dockache-storage`: storage driver traits, change events, and the
//!   in-memory backend.
//! - `dockache-cache`: registry, unique indexes, cache engine, update
//!   transaction loop.
//! - `dockache-stream`: change-stream replicator.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

pub use dockache_core::{
    CacheConfig, CacheError, CacheTag, ChangeOperation, ChangeStreamConfig, CounterSet,
    CrudKind, CrudOutcome, DefiniteResult, DocBinding, DocKey, DocStatus, Document,
    DocumentUpdateError, DockacheConfig, KeyViolation, MetricsHub, MetricsObserver,
    OptionalResult, RandomDocKey, RejectUpdate, RejectableResult, StorageError, StorageMode,
    TaskContext, TraceLogger,
};

pub use dockache_storage::{
    events, memory, wire, ChangeEvent, CollectionDriver, MemoryClient, OperationTime,
    ReplaceOutcome, ResumeToken, StoreClient, StreamHandle, StreamStart,
};

pub use dockache_cache::{
    registry, CacheBuilder, CacheDescriptor, CacheState, CacheStats, DocCache, IndexCatalog,
    Registration, Registry, UniqueIndex, UpdateValidator,
};

pub use dockache_stream::{ReplicaSink, Replicator, ReplicatorState};

/// Initialize the process-wide pieces: validate the configuration and
/// install the registration registry under its namespace prefix.
pub fn enable(config: &DockacheConfig) -> Result<Arc<Registry>> {
    config.validate()?;
    let registry = registry::enable(config.namespace_prefix.clone());
    info!(prefix = %config.namespace_prefix, mode = ?config.storage_mode, "dockache enabled");
    Ok(registry)
}

/// Tear down the process-wide pieces. Caches must be stopped first; this
/// only clears the registry and the global metrics observer set, leaving
/// the process re-initializable.
pub fn disable() {
    registry::disable();
    MetricsHub::global().clear();
    info!("dockache disabled");
}

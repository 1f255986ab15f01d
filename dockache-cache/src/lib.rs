//! # dockache-cache
//!
//! The cache layer proper: the process-wide registration registry, the
//! unique-index catalog, the per-collection [`DocCache`] engine, and the
//! optimistic-versioned update transaction loop.
//!
//! A cache is a fully-loaded mirror of one collection. CRUD goes through
//! the store under optimistic concurrency control; a change-stream
//! replicator (from `dockache-stream`) reconciles mutations that happened
//! elsewhere. Reads are pure in-memory lookups and never suspend.

pub mod cache;
pub mod index;
pub mod registry;
pub mod update;

pub use cache::{CacheBuilder, CacheState, CacheStats, DocCache, DocFactory, UpdateValidator};
pub use index::{IndexCatalog, UniqueIndex};
pub use registry::{CacheDescriptor, Registration, Registry};

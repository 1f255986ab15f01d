//! # dockache-core
//!
//! Contracts shared by every dockache crate: the result algebra the public
//! API speaks, the document/key traits cached types implement, the typed
//! error kinds, configuration structures, the metrics fan-out, the shared
//! task context, and the file-backed trace logger.
//!
//! Nothing in this crate touches a store; it defines the vocabulary the
//! storage, cache and stream crates agree on.

pub mod config;
pub mod document;
pub mod error;
pub mod metrics;
pub mod ops;
pub mod result;
pub mod runtime;
pub mod tracelog;

pub use config::{CacheConfig, ChangeStreamConfig, DockacheConfig, StorageMode};
pub use document::{CacheTag, DocBinding, DocKey, DocStatus, Document, RandomDocKey};
pub use error::{CacheError, DocumentUpdateError, KeyViolation, RejectUpdate, StorageError};
pub use metrics::{CounterSet, MetricsHub, MetricsObserver};
pub use ops::{ChangeOperation, CrudKind, CrudOutcome};
pub use result::{DefiniteResult, OptionalResult, RejectableResult};
pub use runtime::TaskContext;
pub use tracelog::TraceLogger;

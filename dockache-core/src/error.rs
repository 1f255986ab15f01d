//! Error types for the cache and storage layers.
//!
//! Errors are carried through the result algebra, never thrown across public
//! boundaries. Write-conflict signals from the store are retry triggers, not
//! errors, and never appear here.

use thiserror::Error;

/// Which index a duplicate-key violation hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyViolation {
    /// The store's native primary-key index.
    Primary,
    /// A declared unique secondary index, by field name.
    Unique(String),
}

impl std::fmt::Display for KeyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyViolation::Primary => write!(f, "primary key"),
            KeyViolation::Unique(name) => write!(f, "unique index '{name}'"),
        }
    }
}

/// Errors surfaced by a storage driver.
///
/// Drivers must report duplicate-key failures with enough context to tell a
/// primary-key collision from a named unique-index collision; the update loop
/// relies on that distinction.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Insert or replace collided with an existing key.
    #[error("duplicate key on {violation}")]
    DuplicateKey { violation: KeyViolation },

    /// A transient write conflict; the caller should retry.
    #[error("transient write conflict")]
    WriteConflict,

    /// The addressed document does not exist in the store.
    #[error("document not found: {key}")]
    NotFound { key: String },

    /// The change-stream resume point is no longer retained by the store.
    #[error("resume point no longer available")]
    ResumeExpired,

    /// The change stream was terminated by the store (drop, rename,
    /// invalidate) and cannot continue.
    #[error("change stream terminated: {reason}")]
    StreamTerminated { reason: String },

    /// The document could not be round-tripped through the wire form.
    #[error("wire codec failure: {message}")]
    Codec { message: String },

    /// Any other driver failure, cause preserved.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StorageError {
    /// True when the error indicates a retryable write conflict.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, StorageError::WriteConflict)
    }
}

/// A subclass-level validation rejection raised by a cache's update
/// validator hook.
#[derive(Debug, Error)]
#[error("document update rejected: {message}")]
pub struct DocumentUpdateError {
    message: String,
}

impl DocumentUpdateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Cooperative rejection sentinel for `update_rejectable`.
///
/// Returning this from an update closure short-circuits the transaction loop
/// with no store I/O; it is not an error.
#[derive(Debug, Clone, Default)]
pub struct RejectUpdate {
    reason: Option<String>,
}

impl RejectUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Errors produced by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key was absent from the store at replace or CAS time.
    #[error("document not found: {key}")]
    DocumentNotFound { key: String },

    /// A create collided on the primary key.
    #[error("duplicate primary key: {key}")]
    DuplicatePrimaryKey { key: String },

    /// A write collided on a declared unique secondary index.
    #[error("duplicate value on unique index '{index}'")]
    DuplicateUniqueIndex { index: String },

    /// The update closure changed the document key.
    #[error("update closure modified the document key")]
    IllegalKeyModification,

    /// The update closure changed the document version.
    #[error("update closure modified the document version (expected {expected}, got {actual})")]
    IllegalVersionModification { expected: i64, actual: i64 },

    /// The update closure returned its input unchanged.
    #[error("update closure returned the same document instance")]
    UpdateFunctionReturnedSameInstance,

    /// `with_version` produced a copy carrying the wrong version.
    #[error("version copy helper returned version {actual}, expected {expected}")]
    InvalidCopyHelper { expected: i64, actual: i64 },

    /// The create initializer produced an invalid document.
    #[error("invalid initializer: {message}")]
    InvalidInitializer { message: String },

    /// Cache-level update validation rejected the transition.
    #[error(transparent)]
    DocumentUpdate(#[from] DocumentUpdateError),

    /// The update transaction loop exhausted its retry budget.
    #[error("update retries exceeded after {attempts} attempts")]
    RetriesExceeded { attempts: u32 },

    /// A database with the same namespaced name is already registered.
    #[error("database already registered: {database}")]
    DuplicateDatabase { database: String },

    /// The cache is not in a state that accepts this operation.
    #[error("cache '{cache}' is {state} and not accepting work")]
    NotReady { cache: String, state: String },

    /// Mass destructive operations are disabled for this cache.
    #[error("mass destructive operations are disabled for cache '{cache}'")]
    MassDestructiveOpsDisabled { cache: String },

    /// The key string could not be decoded.
    #[error("invalid key string '{input}': {message}")]
    InvalidKeyString { input: String, message: String },

    /// An unclassified storage failure, cause preserved.
    #[error("storage failure: {0}")]
    Store(#[from] StorageError),
}

impl CacheError {
    /// Translate a store-level duplicate-key violation into the cache-level
    /// kind, naming the violated index where one was reported.
    pub fn from_duplicate(violation: KeyViolation, key: &str) -> Self {
        match violation {
            KeyViolation::Primary => CacheError::DuplicatePrimaryKey {
                key: key.to_string(),
            },
            KeyViolation::Unique(index) => CacheError::DuplicateUniqueIndex { index },
        }
    }
}

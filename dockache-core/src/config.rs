//! Configuration types for the cache layer.
//!
//! These are plain serde-derived structures: loading them from files,
//! environment or flags is the host's concern. Every structure ships a
//! production-grade `Default`, and the change-stream settings additionally
//! offer a development profile with tighter bounds for local iteration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which storage backend the client connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// In-process memory store with simulated change streams. Used by
    /// tests and single-process deployments.
    Memory,
    /// A MongoDB-class document store addressed by `store_uri`.
    Mongo,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Memory
    }
}

/// Top-level configuration for a cache deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockacheConfig {
    /// Prefix prepended exactly once to every registered database name,
    /// partitioning multiple deployments sharing one store.
    pub namespace_prefix: String,

    /// Enables verbose diagnostic logging.
    pub debug: bool,

    /// Storage backend selection.
    pub storage_mode: StorageMode,

    /// Connection string for a remote store; ignored in memory mode.
    pub store_uri: Option<String>,

    /// Directory for file-backed trace logs. `None` disables trace files
    /// (the console pointer line is still emitted).
    pub trace_log_dir: Option<PathBuf>,

    /// Change-stream behavior applied to every cache's replicator.
    pub change_stream: ChangeStreamConfig,
}

impl Default for DockacheConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "dockache".to_string(),
            debug: false,
            storage_mode: StorageMode::Memory,
            store_uri: None,
            trace_log_dir: None,
            change_stream: ChangeStreamConfig::default(),
        }
    }
}

impl DockacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace_prefix.is_empty() {
            anyhow::bail!("namespace_prefix must not be empty");
        }
        if self.namespace_prefix.contains(char::is_whitespace) {
            anyhow::bail!("namespace_prefix must not contain whitespace");
        }
        if self.storage_mode == StorageMode::Mongo && self.store_uri.is_none() {
            anyhow::bail!("store_uri is required in mongo storage mode");
        }
        self.change_stream.validate()
    }
}

/// Per-stream replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStreamConfig {
    /// First reconnect delay after a stream failure.
    pub initial_retry_delay: Duration,

    /// Ceiling for the exponential reconnect backoff.
    pub max_retry_delay: Duration,

    /// Consecutive reconnect attempts before the replicator gives up and
    /// enters its failed state. `None` retries forever.
    pub max_retries: Option<u32>,

    /// Budget for applying a single event to the cache.
    pub event_processing_timeout: Duration,

    /// Capacity of the bounded event queue between the stream producer and
    /// the consumer task.
    pub max_buffered_events: usize,
}

impl ChangeStreamConfig {
    /// Production profile: patient reconnects, generous buffer.
    pub fn production() -> Self {
        Self {
            initial_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(60),
            max_retries: None,
            event_processing_timeout: Duration::from_secs(30),
            max_buffered_events: 1000,
        }
    }

    /// Development profile: fast feedback, bounded retries.
    pub fn development() -> Self {
        Self {
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(5),
            max_retries: Some(20),
            event_processing_timeout: Duration::from_secs(10),
            max_buffered_events: 100,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_retry_delay.is_zero() {
            anyhow::bail!("initial_retry_delay must be positive");
        }
        if self.max_retry_delay < self.initial_retry_delay {
            anyhow::bail!("max_retry_delay must be >= initial_retry_delay");
        }
        if self.event_processing_timeout.is_zero() {
            anyhow::bail!("event_processing_timeout must be positive");
        }
        if self.max_buffered_events == 0 {
            anyhow::bail!("max_buffered_events must be positive");
        }
        Ok(())
    }
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self::production()
    }
}

/// Per-cache behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When true, an incoming document only replaces a cached entry if it
    /// carries a strictly newer version: equal versions are no-ops and
    /// older versions are dropped. When false, incoming documents always
    /// overwrite; hosts enabling this must guarantee external
    /// monotonicity.
    pub optimistic_caching: bool,

    /// Gates mass destructive operations such as `clear_all`.
    pub enable_mass_destructive_ops: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            optimistic_caching: true,
            enable_mass_destructive_ops: false,
        }
    }
}

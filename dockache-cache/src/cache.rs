//! Cache engine.
//!
//! A [`DocCache`] is a fully-loaded in-memory mirror of one collection:
//! every document in the store, keyed by primary key, as immutable
//! versioned instances. Reads are pure map lookups; writes go through the
//! store first (primary-key and unique-index enforcement happen there) and
//! land in the mirror only after the store committed.
//!
//! Both local writes and the change-stream replicator mutate the mirror
//! through the same funnel, [`DocCache::accept_from_store_arc`] /
//! eviction, so version monotonicity is enforced at a single point no
//! matter which producer raced ahead.

use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use dockache_core::config::{CacheConfig, ChangeStreamConfig};
use dockache_core::document::{CacheTag, DocKey, DocStatus, Document, RandomDocKey};
use dockache_core::error::{CacheError, DocumentUpdateError, RejectUpdate, StorageError};
use dockache_core::metrics::MetricsHub;
use dockache_core::ops::{CrudKind, CrudOutcome};
use dockache_core::result::{DefiniteResult, OptionalResult, RejectableResult};
use dockache_core::runtime::TaskContext;
use dockache_core::tracelog::TraceLogger;
use dockache_storage::{CollectionDriver, StoreClient};
use dockache_stream::{ReplicaSink, Replicator, ReplicatorState};

use crate::index::{IndexCatalog, UniqueIndex};
use crate::registry::Registration;
use crate::update::{self, BackoffPolicy};

pub(crate) fn key_display<D: Document>(key: &D::Key) -> String {
    key.to_key_string()
}

/// Lifecycle of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Registering indexes and loading the initial mirror.
    Initializing,
    /// Serving traffic.
    Ready,
    /// Shutdown requested; rejecting new work, draining in-flight.
    Draining,
    /// Stopped.
    Stopped,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CacheState::Initializing => "initializing",
            CacheState::Ready => "ready",
            CacheState::Draining => "draining",
            CacheState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Hook for domain-level update validation (immutable secondary fields,
/// range checks). Runs on every update after the version bump and before
/// the CAS write.
pub trait UpdateValidator<D>: Send + Sync {
    fn validate(&self, before: &D, after: &D) -> Result<(), DocumentUpdateError>;
}

struct NoValidation;

impl<D> UpdateValidator<D> for NoValidation {
    fn validate(&self, _before: &D, _after: &D) -> Result<(), DocumentUpdateError> {
        Ok(())
    }
}

/// Host-provided constructor producing a fresh document at version 0 for
/// a given key.
pub type DocFactory<D> = Arc<dyn Fn(<D as Document>::Key) -> D + Send + Sync>;

/// Point-in-time snapshot of a cache, for status surfaces.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub name: String,
    pub database: String,
    pub entries: usize,
    pub state: CacheState,
    pub replicator: Option<ReplicatorState>,
    pub events_lost: u32,
}

/// Per-collection typed document cache.
pub struct DocCache<D: Document> {
    name: String,
    tag: CacheTag,
    driver: Arc<dyn CollectionDriver<D>>,
    entries: DashMap<D::Key, Arc<D>>,
    config: CacheConfig,
    indexes: IndexCatalog<D>,
    factory: DocFactory<D>,
    validator: Arc<dyn UpdateValidator<D>>,
    state: RwLock<CacheState>,
    backoff: BackoffPolicy,
    metrics: Arc<MetricsHub>,
    trace: TraceLogger,
    ctx: Arc<TaskContext>,
    replicator: OnceLock<Arc<Replicator<D>>>,
}

impl<D: Document> DocCache<D> {
    /// Start configuring a cache for `collection`, constructing missing
    /// documents with `factory`.
    pub fn builder(
        collection: impl Into<String>,
        factory: impl Fn(D::Key) -> D + Send + Sync + 'static,
    ) -> CacheBuilder<D> {
        CacheBuilder::new(collection, factory)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &str {
        self.tag.database()
    }

    pub fn state(&self) -> CacheState {
        *self.state.read()
    }

    pub fn indexes(&self) -> &IndexCatalog<D> {
        &self.indexes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name.clone(),
            database: self.tag.database().to_string(),
            entries: self.entries.len(),
            state: self.state(),
            replicator: self.replicator.get().map(|r| r.state()),
            events_lost: self.replicator.get().map(|r| r.events_lost()).unwrap_or(0),
        }
    }

    fn ensure_ready(&self) -> Result<(), CacheError> {
        let state = self.state();
        if state == CacheState::Ready {
            Ok(())
        } else {
            Err(CacheError::NotReady {
                cache: self.name.clone(),
                state: state.to_string(),
            })
        }
    }

    // ---- create ---------------------------------------------------------

    /// Instantiate a document at version 0 for `key`, run `initializer`
    /// over it, insert it into the store, then mirror it locally.
    pub async fn create<F>(&self, key: D::Key, initializer: F) -> DefiniteResult<Arc<D>>
    where
        F: FnOnce(D) -> D,
    {
        if let Err(e) = self.ensure_ready() {
            return self.fail::<Arc<D>>(CrudKind::Insert, "create", e);
        }

        let draft = (self.factory)(key.clone());
        let doc = initializer(draft);
        if doc.key() != &key {
            return self.fail(
                CrudKind::Insert,
                "create",
                CacheError::InvalidInitializer {
                    message: "initializer changed the document key".to_string(),
                },
            );
        }
        if doc.version() != 0 {
            return self.fail(
                CrudKind::Insert,
                "create",
                CacheError::InvalidInitializer {
                    message: format!(
                        "initializer must leave the version at 0, found {}",
                        doc.version()
                    ),
                },
            );
        }

        match self.driver.insert(&doc).await {
            Ok(()) => {
                let arc = Arc::new(doc);
                self.accept_from_store_arc(arc.clone());
                self.metrics
                    .crud(&self.name, CrudKind::Insert, CrudOutcome::Success);
                DefiniteResult::Success(arc)
            }
            Err(StorageError::DuplicateKey { violation }) => {
                let error = CacheError::from_duplicate(violation, &key.to_key_string());
                self.fail(CrudKind::Insert, "create", error)
            }
            Err(e) => self.fail(CrudKind::Insert, "create", CacheError::Store(e)),
        }
    }

    /// As [`create`](Self::create), with a key drawn from a uniform random
    /// source. A primary-key collision here means the source is defective.
    pub async fn create_random<F>(&self, initializer: F) -> DefiniteResult<Arc<D>>
    where
        D::Key: RandomDocKey,
        F: FnOnce(D) -> D,
    {
        let key = D::Key::random();
        let result = self.create(key, initializer).await;
        if let Some(CacheError::DuplicatePrimaryKey { key }) = result.error() {
            error!(cache = %self.name, %key,
                   "random key collided; the identifier source is defective");
        }
        result
    }

    // ---- reads ----------------------------------------------------------

    /// In-memory lookup. Never touches the store.
    pub fn read(&self, key: &D::Key) -> OptionalResult<Arc<D>> {
        match self.entries.get(key) {
            Some(entry) => {
                self.metrics
                    .crud(&self.name, CrudKind::Read, CrudOutcome::Success);
                OptionalResult::Success(entry.value().clone())
            }
            None => {
                self.metrics
                    .crud(&self.name, CrudKind::Read, CrudOutcome::Empty);
                OptionalResult::Empty
            }
        }
    }

    /// Read straight from the store, bypassing (and not touching) the
    /// mirror.
    pub async fn read_from_store(&self, key: &D::Key) -> OptionalResult<Arc<D>> {
        match self.driver.read(key).await {
            Ok(Some(doc)) => {
                doc.binding().bind(self.tag.clone());
                self.metrics
                    .crud(&self.name, CrudKind::Read, CrudOutcome::Success);
                OptionalResult::Success(Arc::new(doc))
            }
            Ok(None) => {
                self.metrics
                    .crud(&self.name, CrudKind::Read, CrudOutcome::Empty);
                OptionalResult::Empty
            }
            Err(e) => {
                let error = CacheError::Store(e);
                self.metrics
                    .crud(&self.name, CrudKind::Read, CrudOutcome::Failure);
                self.trace_failure("read from store", &error);
                OptionalResult::Failure(error)
            }
        }
    }

    /// Look a document up through a declared unique index. The store does
    /// the search; the returned document is re-checked against the index's
    /// own extractor, and a mismatch is treated as absent.
    pub async fn read_by_unique_index(
        &self,
        index: &UniqueIndex<D>,
        value: &Value,
    ) -> OptionalResult<Arc<D>> {
        match self
            .driver
            .read_by_unique_index(index.field_name(), value)
            .await
        {
            Ok(Some(doc)) => match index.extract(&doc) {
                Some(extracted) if index.matches(&extracted, value) => {
                    doc.binding().bind(self.tag.clone());
                    self.metrics
                        .crud(&self.name, CrudKind::Read, CrudOutcome::Success);
                    OptionalResult::Success(Arc::new(doc))
                }
                _ => {
                    warn!(cache = %self.name, index = index.field_name(),
                          "store returned a document that fails the index equality recheck");
                    self.metrics
                        .crud(&self.name, CrudKind::Read, CrudOutcome::Empty);
                    OptionalResult::Empty
                }
            },
            Ok(None) => {
                self.metrics
                    .crud(&self.name, CrudKind::Read, CrudOutcome::Empty);
                OptionalResult::Empty
            }
            Err(e) => {
                let error = CacheError::Store(e);
                self.metrics
                    .crud(&self.name, CrudKind::Read, CrudOutcome::Failure);
                self.trace_failure("read by unique index", &error);
                OptionalResult::Failure(error)
            }
        }
    }

    // ---- updates --------------------------------------------------------

    /// Optimistic-versioned update: `apply` maps the current document to a
    /// replacement, the version advances by one, and the store commits via
    /// compare-and-swap; concurrent writers trigger refetch-and-retry.
    pub async fn update<F>(&self, key: &D::Key, apply: F) -> DefiniteResult<Arc<D>>
    where
        F: Fn(Arc<D>) -> Arc<D>,
    {
        if let Err(e) = self.ensure_ready() {
            return self.fail::<Arc<D>>(CrudKind::Update, "update", e);
        }
        match update::run(self, key, |doc| Ok(apply(doc))).await {
            RejectableResult::Success(doc) => DefiniteResult::Success(doc),
            RejectableResult::Failure(e) => DefiniteResult::Failure(e),
            RejectableResult::Rejected(_) => {
                unreachable!("infallible update closure cannot reject")
            }
        }
    }

    /// As [`update`](Self::update), except the closure may decline with
    /// [`RejectUpdate`], which surfaces as `Rejected` with no store I/O.
    pub async fn update_rejectable<F>(&self, key: &D::Key, apply: F) -> RejectableResult<Arc<D>>
    where
        F: Fn(Arc<D>) -> Result<Arc<D>, RejectUpdate>,
    {
        if let Err(e) = self.ensure_ready() {
            self.metrics
                .crud(&self.name, CrudKind::Update, CrudOutcome::Failure);
            return RejectableResult::Failure(e);
        }
        update::run(self, key, apply).await
    }

    // ---- delete ---------------------------------------------------------

    /// Best-effort removal: evict the mirror entry, then delete from the
    /// store. The boolean reports whether the key was cached; `false` is
    /// informational, not an error.
    pub async fn delete(&self, key: &D::Key) -> DefiniteResult<bool> {
        if let Err(e) = self.ensure_ready() {
            return self.fail::<bool>(CrudKind::Delete, "delete", e);
        }
        let was_cached = self.entries.remove(key).is_some();
        match self.driver.delete(key).await {
            Ok(_) => {
                self.metrics
                    .crud(&self.name, CrudKind::Delete, CrudOutcome::Success);
                DefiniteResult::Success(was_cached)
            }
            Err(e) => self.fail(CrudKind::Delete, "delete", CacheError::Store(e)),
        }
    }

    /// Remove every document from the mirror and the store. Gated by
    /// `enable_mass_destructive_ops`.
    pub async fn clear_all(&self) -> DefiniteResult<u64> {
        if !self.config.enable_mass_destructive_ops {
            return self.fail::<u64>(
                CrudKind::Delete,
                "clear all",
                CacheError::MassDestructiveOpsDisabled {
                    cache: self.name.clone(),
                },
            );
        }
        if let Err(e) = self.ensure_ready() {
            return self.fail::<u64>(CrudKind::Delete, "clear all", e);
        }
        self.entries.clear();
        match self.driver.clear().await {
            Ok(removed) => {
                warn!(cache = %self.name, removed, "mass destructive clear executed");
                self.metrics
                    .crud(&self.name, CrudKind::Delete, CrudOutcome::Success);
                DefiniteResult::Success(removed)
            }
            Err(e) => self.fail(CrudKind::Delete, "clear all", CacheError::Store(e)),
        }
    }

    // ---- pure queries ---------------------------------------------------

    pub fn keys(&self) -> Vec<D::Key> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &D::Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Status of an instance relative to this cache. Instances never
    /// materialized by this cache are detached.
    pub fn status(&self, doc: &D) -> DocStatus {
        match doc.binding().tag() {
            Some(tag) if *tag == self.tag => self.status_of(doc.key(), doc.version()),
            _ => DocStatus::Detached,
        }
    }

    /// Status of a `(key, version)` pair against the mirror.
    pub fn status_of(&self, key: &D::Key, version: i64) -> DocStatus {
        match self.entries.get(key) {
            Some(entry) if entry.version() == version => DocStatus::Fresh,
            Some(_) => DocStatus::Stale,
            None => DocStatus::Deleted,
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Drain and stop: reject new work, stop the replicator, await
    /// in-flight tasks under the bounded drain deadline.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, CacheState::Draining | CacheState::Stopped) {
                return;
            }
            *state = CacheState::Draining;
        }
        info!(cache = %self.name, "cache draining");

        if let Some(replicator) = self.replicator.get() {
            replicator.stop().await;
        }
        self.ctx.shutdown().await;

        *self.state.write() = CacheState::Stopped;
        info!(cache = %self.name, "cache stopped");
    }

    // ---- internal funnel ------------------------------------------------

    /// Accept a store-observed document into the mirror. With optimistic
    /// caching on, only strictly newer versions replace an existing entry:
    /// an equal version is the echo of a local write and older versions
    /// are stale stream deliveries; both are dropped.
    pub(crate) fn accept_from_store_arc(&self, doc: Arc<D>) {
        doc.binding().bind(self.tag.clone());
        let key = doc.key().clone();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().version();
                if !self.config.optimistic_caching || existing < doc.version() {
                    occupied.insert(doc);
                } else if existing > doc.version() {
                    debug!(cache = %self.name, existing, incoming = doc.version(),
                           "dropped stale incoming document");
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(doc);
            }
        }
    }

    pub(crate) fn cached_entry(&self, key: &D::Key) -> Option<Arc<D>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn evict(&self, key: &D::Key) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn CollectionDriver<D>> {
        &self.driver
    }

    pub(crate) fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub(crate) fn validate_update(
        &self,
        before: &D,
        after: &D,
    ) -> Result<(), DocumentUpdateError> {
        self.validator.validate(before, after)
    }

    pub(crate) fn record_update_outcome(&self, attempts: u32, outcome: CrudOutcome) {
        self.metrics.update_attempts(&self.name, attempts);
        self.metrics.crud(&self.name, CrudKind::Update, outcome);
    }

    pub(crate) fn trace_failure(&self, context: &str, error: &CacheError) {
        self.trace.record(&self.name, context, error);
    }

    fn fail<T>(&self, kind: CrudKind, context: &str, error: CacheError) -> DefiniteResult<T> {
        let outcome = match &error {
            CacheError::DocumentNotFound { .. } => CrudOutcome::NotFound,
            CacheError::DuplicatePrimaryKey { .. } => CrudOutcome::DuplicatePrimaryKey,
            CacheError::DuplicateUniqueIndex { .. } => CrudOutcome::DuplicateUniqueIndex,
            CacheError::RetriesExceeded { .. } => CrudOutcome::RetriesExceeded,
            _ => CrudOutcome::Failure,
        };
        self.metrics.crud(&self.name, kind, outcome);
        self.trace_failure(context, &error);
        DefiniteResult::Failure(error)
    }
}

impl<D: Document> ReplicaSink<D> for DocCache<D> {
    fn sink_name(&self) -> &str {
        &self.name
    }

    fn accept_from_store(&self, doc: D) {
        self.accept_from_store_arc(Arc::new(doc));
    }

    fn evict_local(&self, key: &D::Key) {
        if self.evict(key) {
            debug!(cache = %self.name, key = %key_display::<D>(key),
                   "evicted by change stream");
        }
    }
}

impl<D: Document> std::fmt::Debug for DocCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocCache")
            .field("name", &self.name)
            .field("database", &self.tag.database())
            .field("entries", &self.entries.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Configures and starts a [`DocCache`].
pub struct CacheBuilder<D: Document> {
    collection: String,
    config: CacheConfig,
    stream_config: ChangeStreamConfig,
    indexes: Vec<UniqueIndex<D>>,
    factory: DocFactory<D>,
    validator: Arc<dyn UpdateValidator<D>>,
    metrics: Option<Arc<MetricsHub>>,
    trace: TraceLogger,
}

impl<D: Document> CacheBuilder<D> {
    pub fn new(
        collection: impl Into<String>,
        factory: impl Fn(D::Key) -> D + Send + Sync + 'static,
    ) -> Self {
        Self {
            collection: collection.into(),
            config: CacheConfig::default(),
            stream_config: ChangeStreamConfig::default(),
            indexes: Vec::new(),
            factory: Arc::new(factory),
            validator: Arc::new(NoValidation),
            metrics: None,
            trace: TraceLogger::disabled(),
        }
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stream_config(mut self, config: ChangeStreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    /// Declare a unique secondary index. Must happen before start; the
    /// catalog is immutable afterwards.
    pub fn unique_index(mut self, index: UniqueIndex<D>) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn validator(mut self, validator: impl UpdateValidator<D> + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn metrics(mut self, hub: Arc<MetricsHub>) -> Self {
        self.metrics = Some(hub);
        self
    }

    pub fn trace_logger(mut self, trace: TraceLogger) -> Self {
        self.trace = trace;
        self
    }

    /// Create the cache and walk it to READY: register unique indexes in
    /// the store, bookmark the operation time, stream the full collection
    /// into the mirror, then start the change-stream replicator.
    pub async fn start<C: StoreClient>(
        self,
        client: &C,
        registration: &Registration,
    ) -> Result<Arc<DocCache<D>>, CacheError> {
        let database = registration.database().to_string();
        let driver = client.collection::<D>(&database, &self.collection);

        let metrics = self.metrics.unwrap_or_else(MetricsHub::global);
        let cache = Arc::new(DocCache {
            name: self.collection.clone(),
            tag: CacheTag::new(self.collection.clone(), database.clone()),
            driver: driver.clone(),
            entries: DashMap::new(),
            config: self.config,
            indexes: IndexCatalog::new(self.indexes),
            factory: self.factory,
            validator: self.validator,
            state: RwLock::new(CacheState::Initializing),
            backoff: BackoffPolicy::default(),
            metrics: metrics.clone(),
            trace: self.trace.clone(),
            ctx: Arc::new(TaskContext::new()),
            replicator: OnceLock::new(),
        });
        registration.track_cache(&cache.name);

        for index in cache.indexes.iter() {
            driver.register_unique_index(index.field_name()).await?;
        }

        let sink: Arc<dyn ReplicaSink<D>> = cache.clone();
        let replicator = Replicator::new(
            cache.name.clone(),
            driver.clone(),
            Arc::downgrade(&sink),
            self.stream_config,
            cache.ctx.clone(),
            metrics,
            self.trace,
        );

        // Bookmark the stream position before loading, so a later resume
        // fallback covers the load window.
        replicator.set_load_time(driver.current_operation_time().await?);

        let mut all = driver.read_all().await?;
        let mut loaded = 0u64;
        while let Some(doc) = all.next().await {
            cache.accept_from_store_arc(Arc::new(doc?));
            loaded += 1;
        }
        info!(cache = %cache.name, database = %database, loaded, "initial load complete");

        cache
            .replicator
            .set(replicator.clone())
            .unwrap_or_else(|_| unreachable!("replicator set once during start"));
        replicator.start();

        *cache.state.write() = CacheState::Ready;
        info!(cache = %cache.name, "cache ready");
        Ok(cache)
    }
}

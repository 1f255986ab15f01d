//! Metrics fan-out.
//!
//! The cache reports every operation outcome to a [`MetricsHub`], which
//! broadcasts to registered [`MetricsObserver`]s. The fan-out never blocks
//! the reporting operation: observers must return quickly, and a panicking
//! observer is isolated and logged rather than unwinding into cache code.
//!
//! Concrete sinks (Prometheus exporters, host dashboards) live outside this
//! crate; [`CounterSet`] is the built-in observer used by tests and status
//! surfaces.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::error;

use crate::ops::{ChangeOperation, CrudKind, CrudOutcome};

/// Receiver of cache operation outcomes. All methods default to no-ops so
/// observers implement only what they consume.
pub trait MetricsObserver: Send + Sync {
    /// A CRUD operation resolved with the given outcome.
    fn on_crud(&self, cache: &str, kind: CrudKind, outcome: CrudOutcome) {
        let _ = (cache, kind, outcome);
    }

    /// An update transaction committed (or gave up) after `attempts` CAS
    /// attempts.
    fn on_update_attempts(&self, cache: &str, attempts: u32) {
        let _ = (cache, attempts);
    }

    /// A change-stream event was applied to the cache.
    fn on_stream_event(&self, cache: &str, operation: ChangeOperation) {
        let _ = (cache, operation);
    }

    /// A change-stream event was lost (queue full with no recoverable
    /// payload). Consistency is not guaranteed until the next full reload.
    fn on_stream_event_lost(&self, cache: &str) {
        let _ = cache;
    }

    /// A change-stream event was applied on the producer side because the
    /// queue was saturated.
    fn on_stream_degraded(&self, cache: &str) {
        let _ = cache;
    }
}

/// Broadcast hub for metrics observers.
pub struct MetricsHub {
    observers: RwLock<Vec<Arc<dyn MetricsObserver>>>,
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsHub {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// The process-wide hub. Observers registered here are seen by every
    /// cache that did not get a dedicated hub.
    pub fn global() -> Arc<MetricsHub> {
        static GLOBAL: OnceLock<Arc<MetricsHub>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(MetricsHub::new())).clone()
    }

    pub fn register(&self, observer: Arc<dyn MetricsObserver>) {
        self.observers.write().push(observer);
    }

    /// Remove every registered observer. Tests use this to re-initialize
    /// the global hub between runs.
    pub fn clear(&self) {
        self.observers.write().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn broadcast(&self, f: impl Fn(&dyn MetricsObserver)) {
        // Snapshot under the read lock so observer callbacks run unlocked.
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                error!("metrics observer panicked; continuing fan-out");
            }
        }
    }

    pub fn crud(&self, cache: &str, kind: CrudKind, outcome: CrudOutcome) {
        self.broadcast(|o| o.on_crud(cache, kind, outcome));
    }

    pub fn update_attempts(&self, cache: &str, attempts: u32) {
        self.broadcast(|o| o.on_update_attempts(cache, attempts));
    }

    pub fn stream_event(&self, cache: &str, operation: ChangeOperation) {
        self.broadcast(|o| o.on_stream_event(cache, operation));
    }

    pub fn stream_event_lost(&self, cache: &str) {
        self.broadcast(|o| o.on_stream_event_lost(cache));
    }

    pub fn stream_degraded(&self, cache: &str) {
        self.broadcast(|o| o.on_stream_degraded(cache));
    }
}

/// Attempt-count histogram buckets: 1, 2, 3-5, 6-10, 11-20, 21-50, 50+.
const ATTEMPT_BUCKETS: usize = 7;

fn attempt_bucket(attempts: u32) -> usize {
    match attempts {
        0 | 1 => 0,
        2 => 1,
        3..=5 => 2,
        6..=10 => 3,
        11..=20 => 4,
        21..=50 => 5,
        _ => 6,
    }
}

/// Atomic counter observer covering every reported outcome class.
#[derive(Default)]
pub struct CounterSet {
    success: AtomicU64,
    empty: AtomicU64,
    failure: AtomicU64,
    not_found: AtomicU64,
    rejected: AtomicU64,
    retries_exceeded: AtomicU64,
    duplicate_primary: AtomicU64,
    duplicate_index: AtomicU64,
    stream_events: [AtomicU64; ChangeOperation::COUNT],
    stream_lost: AtomicU64,
    stream_degraded: AtomicU64,
    attempt_histogram: [AtomicU64; ATTEMPT_BUCKETS],
}

impl CounterSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn outcome_count(&self, outcome: CrudOutcome) -> u64 {
        let counter = match outcome {
            CrudOutcome::Success => &self.success,
            CrudOutcome::Empty => &self.empty,
            CrudOutcome::Failure => &self.failure,
            CrudOutcome::NotFound => &self.not_found,
            CrudOutcome::Rejected => &self.rejected,
            CrudOutcome::RetriesExceeded => &self.retries_exceeded,
            CrudOutcome::DuplicatePrimaryKey => &self.duplicate_primary,
            CrudOutcome::DuplicateUniqueIndex => &self.duplicate_index,
        };
        counter.load(Ordering::Relaxed)
    }

    pub fn stream_event_count(&self, operation: ChangeOperation) -> u64 {
        self.stream_events[operation.index()].load(Ordering::Relaxed)
    }

    pub fn stream_lost_count(&self) -> u64 {
        self.stream_lost.load(Ordering::Relaxed)
    }

    pub fn stream_degraded_count(&self) -> u64 {
        self.stream_degraded.load(Ordering::Relaxed)
    }

    pub fn attempt_histogram(&self) -> [u64; ATTEMPT_BUCKETS] {
        std::array::from_fn(|i| self.attempt_histogram[i].load(Ordering::Relaxed))
    }
}

impl MetricsObserver for CounterSet {
    fn on_crud(&self, _cache: &str, _kind: CrudKind, outcome: CrudOutcome) {
        let counter = match outcome {
            CrudOutcome::Success => &self.success,
            CrudOutcome::Empty => &self.empty,
            CrudOutcome::Failure => &self.failure,
            CrudOutcome::NotFound => &self.not_found,
            CrudOutcome::Rejected => &self.rejected,
            CrudOutcome::RetriesExceeded => &self.retries_exceeded,
            CrudOutcome::DuplicatePrimaryKey => &self.duplicate_primary,
            CrudOutcome::DuplicateUniqueIndex => &self.duplicate_index,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_update_attempts(&self, _cache: &str, attempts: u32) {
        self.attempt_histogram[attempt_bucket(attempts)].fetch_add(1, Ordering::Relaxed);
    }

    fn on_stream_event(&self, _cache: &str, operation: ChangeOperation) {
        self.stream_events[operation.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn on_stream_event_lost(&self, _cache: &str) {
        self.stream_lost.fetch_add(1, Ordering::Relaxed);
    }

    fn on_stream_degraded(&self, _cache: &str) {
        self.stream_degraded.fetch_add(1, Ordering::Relaxed);
    }
}

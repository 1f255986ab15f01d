//! Optimistic-versioned update transaction loop.
//!
//! An update is a compare-and-swap against the store: apply the caller's
//! closure to the cached document, mint a copy with the version advanced
//! by one, and issue a replace conditioned on `{key, version}`. A CAS miss
//! means someone else committed first; the loop refetches the latest
//! document and reapplies the closure on it, backing off cooperatively
//! between attempts.
//!
//! The backoff adapts to the store: the first two retries wait a small
//! fixed floor plus jitter, later ones grow geometrically from the
//! observed half round-trip time, clamped to keep a slow store from
//! stretching retries into seconds-long stalls beyond the cap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use dockache_core::document::Document;
use dockache_core::error::{CacheError, KeyViolation, RejectUpdate, StorageError};
use dockache_core::ops::CrudOutcome;
use dockache_core::result::RejectableResult;

use crate::cache::DocCache;

/// Retry budget for one update transaction.
pub const MAX_ATTEMPTS: u32 = 50;

const MIN_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Exponentially weighted store round-trip observer feeding the backoff
/// base.
#[derive(Debug, Default)]
pub(crate) struct RttObserver {
    ewma_micros: AtomicU64,
}

impl RttObserver {
    pub(crate) fn observe(&self, sample: Duration) {
        let sample = sample.as_micros().min(u128::from(u64::MAX)) as u64;
        let previous = self.ewma_micros.load(Ordering::Relaxed);
        let next = if previous == 0 {
            sample
        } else {
            // 80/20 smoothing keeps one outlier from dominating.
            (previous * 4 + sample) / 5
        };
        self.ewma_micros.store(next, Ordering::Relaxed);
    }

    fn half_rtt(&self) -> Duration {
        Duration::from_micros(self.ewma_micros.load(Ordering::Relaxed) / 2)
    }
}

/// Cooperative delay between CAS attempts.
#[derive(Debug, Default)]
pub(crate) struct BackoffPolicy {
    rtt: RttObserver,
}

impl BackoffPolicy {
    pub(crate) fn observe_rtt(&self, sample: Duration) {
        self.rtt.observe(sample);
    }

    /// Delay applied after `attempt` (1-based) failed to commit.
    pub(crate) fn delay_after(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        if attempt <= 2 {
            return MIN_DELAY + Duration::from_millis(rng.gen_range(10..=30));
        }

        let base = self.rtt.half_rtt().max(MIN_DELAY);
        let exponent = (attempt - 2).min(64);
        let grown = base.as_secs_f64() * 1.2_f64.powi(exponent as i32);
        let clamped = grown.clamp(MIN_DELAY.as_secs_f64(), MAX_DELAY.as_secs_f64());
        let jitter = rng.gen_range(0.8..=1.2);
        Duration::from_secs_f64(
            (clamped * jitter).clamp(MIN_DELAY.as_secs_f64(), MAX_DELAY.as_secs_f64()),
        )
    }
}

/// Run one update transaction against `cache`. The closure may reject the
/// update with [`RejectUpdate`]; rejection short-circuits with no store
/// I/O.
pub(crate) async fn run<D, F>(cache: &DocCache<D>, key: &D::Key, apply: F) -> RejectableResult<Arc<D>>
where
    D: Document,
    F: Fn(Arc<D>) -> Result<Arc<D>, RejectUpdate>,
{
    let mut current: Arc<D> = match cache.cached_entry(key) {
        Some(doc) => doc,
        None => {
            return fail(
                cache,
                1,
                CacheError::DocumentNotFound {
                    key: crate::cache::key_display::<D>(key),
                },
            )
        }
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if attempt > MAX_ATTEMPTS {
            return fail(cache, attempt - 1, CacheError::RetriesExceeded {
                attempts: MAX_ATTEMPTS,
            });
        }

        // Apply the caller's closure to the freshest known document.
        let applied = match apply(current.clone()) {
            Ok(applied) => applied,
            Err(rejection) => {
                cache.record_update_outcome(attempt, CrudOutcome::Rejected);
                return RejectableResult::Rejected(rejection);
            }
        };

        if Arc::ptr_eq(&applied, &current) {
            return fail(cache, attempt, CacheError::UpdateFunctionReturnedSameInstance);
        }
        if applied.key() != current.key() {
            return fail(cache, attempt, CacheError::IllegalKeyModification);
        }
        if applied.version() != current.version() {
            return fail(cache, attempt, CacheError::IllegalVersionModification {
                expected: current.version(),
                actual: applied.version(),
            });
        }

        // Mint the next version and verify the copy helper honored it.
        let next_version = current.version() + 1;
        let next = Arc::new(applied.with_version(next_version));
        if next.version() != next_version {
            return fail(cache, attempt, CacheError::InvalidCopyHelper {
                expected: next_version,
                actual: next.version(),
            });
        }
        if let Err(validation) = cache.validate_update(&current, &next) {
            return fail(cache, attempt, CacheError::DocumentUpdate(validation));
        }

        // CAS replace conditioned on the version we read.
        let started = Instant::now();
        let replaced = cache
            .driver()
            .replace_if_version_matches(key, current.version(), next.as_ref())
            .await;
        cache.backoff().observe_rtt(started.elapsed());

        match replaced {
            Ok(outcome) if outcome.committed() => {
                cache.accept_from_store_arc(next.clone());
                cache.record_update_outcome(attempt, CrudOutcome::Success);
                return RejectableResult::Success(next);
            }
            Ok(_) => {
                // Version mismatch or concurrent delete: refetch and retry.
                match cache.driver().read(key).await {
                    Ok(Some(latest)) => {
                        debug!(
                            cache = %cache.name(),
                            key = %crate::cache::key_display::<D>(key),
                            attempt,
                            stale = current.version(),
                            latest = latest.version(),
                            "optimistic update lost the race, retrying"
                        );
                        let latest = Arc::new(latest);
                        cache.accept_from_store_arc(latest.clone());
                        current = latest;
                    }
                    Ok(None) => {
                        return fail(cache, attempt, CacheError::DocumentNotFound {
                            key: crate::cache::key_display::<D>(key),
                        });
                    }
                    Err(e) => return fail(cache, attempt, CacheError::Store(e)),
                }
                tokio::time::sleep(cache.backoff().delay_after(attempt)).await;
            }
            Err(StorageError::DuplicateKey { violation }) => {
                // The key is pinned by the CAS filter, so only a unique
                // secondary index can legitimately collide here; anything
                // else is store misbehavior and propagates opaquely.
                let error = match violation {
                    KeyViolation::Unique(index) => CacheError::DuplicateUniqueIndex { index },
                    KeyViolation::Primary => {
                        CacheError::Store(StorageError::DuplicateKey {
                            violation: KeyViolation::Primary,
                        })
                    }
                };
                return fail(cache, attempt, error);
            }
            Err(StorageError::WriteConflict) => {
                tokio::time::sleep(cache.backoff().delay_after(attempt)).await;
            }
            Err(e) => return fail(cache, attempt, CacheError::Store(e)),
        }
    }
}

fn fail<D: Document>(
    cache: &DocCache<D>,
    attempts: u32,
    error: CacheError,
) -> RejectableResult<Arc<D>> {
    let outcome = match &error {
        CacheError::DocumentNotFound { .. } => CrudOutcome::NotFound,
        CacheError::RetriesExceeded { .. } => CrudOutcome::RetriesExceeded,
        CacheError::DuplicateUniqueIndex { .. } => CrudOutcome::DuplicateUniqueIndex,
        _ => CrudOutcome::Failure,
    };
    cache.record_update_outcome(attempts, outcome);
    cache.trace_failure("update transaction", &error);
    RejectableResult::Failure(error)
}

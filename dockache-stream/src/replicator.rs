//! Change-stream replicator.
//!
//! Turns the driver's event callback into cache reconciliation:
//!
//! ```text
//! driver callback -> bounded queue -> consumer task -> ReplicaSink
//! ```
//!
//! The producer side never blocks the driver for long: a full queue is
//! retried briefly, then the event is applied degraded (directly on the
//! producer) when it carries a recoverable payload, or counted as lost.
//! The consumer applies events under a per-event timeout, advances the
//! in-flight resume token after each success, and periodically promotes it
//! to the durable checkpoint used on reconnect.
//!
//! A supervisor task drives the state machine: terminal stream events and
//! unrecoverable errors send the replicator through an exponential
//! reconnect backoff; a shutdown request closes the stream and drains.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dockache_core::config::ChangeStreamConfig;
use dockache_core::document::{DocKey, Document};
use dockache_core::error::StorageError;
use dockache_core::metrics::MetricsHub;
use dockache_core::ops::ChangeOperation;
use dockache_core::runtime::TaskContext;
use dockache_core::tracelog::TraceLogger;

use dockache_storage::events::{ChangeEvent, OperationTime};
use dockache_storage::wire;
use dockache_storage::{CollectionDriver, EventProducer, StreamHandle, StreamStart};

use crate::state::ReplicatorState;
use crate::tokens::TokenManager;

/// Offer retries before the producer falls back to degraded application.
const OFFER_RETRIES: u32 = 3;
const OFFER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Consumer wake-up cadence when no events arrive, so the loop can check
/// its state flag and the token promotion schedule.
const CONSUMER_TICK: Duration = Duration::from_millis(500);

/// Cap on the backoff exponent, preventing overflow long before the delay
/// cap would.
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Receiver of reconciliation calls. Implemented by the cache engine; the
/// replicator holds it weakly so a dropped cache ends replication.
pub trait ReplicaSink<D: Document>: Send + Sync + 'static {
    /// Cache name, for logs and metrics.
    fn sink_name(&self) -> &str;

    /// Apply a document observed in the store. Version monotonicity is
    /// the sink's concern.
    fn accept_from_store(&self, doc: D);

    /// Remove a key observed deleted in the store.
    fn evict_local(&self, key: &D::Key);
}

enum ConsumeExit {
    /// Shutdown requested.
    Stopped,
    /// The stream delivered a terminal event; reopen from the checkpoint.
    Terminal(ChangeOperation),
    /// The consumer hit a fatal condition; reopen from the checkpoint.
    Broken(String),
}

/// Resilient consumer binding one collection's change stream to a sink.
pub struct Replicator<D: Document> {
    name: String,
    driver: Arc<dyn CollectionDriver<D>>,
    sink: Weak<dyn ReplicaSink<D>>,
    config: ChangeStreamConfig,
    ctx: Arc<TaskContext>,
    metrics: Arc<MetricsHub>,
    trace: TraceLogger,

    state_tx: watch::Sender<ReplicatorState>,
    state_rx: watch::Receiver<ReplicatorState>,
    tokens: Mutex<TokenManager>,
    /// Operation time captured just before the initial full load; the
    /// resume fallback when the durable token has aged out.
    load_time: Mutex<Option<OperationTime>>,
    consecutive_failures: AtomicU32,
    stop_token: CancellationToken,
    /// Shared with producer closures, which outlive `&self` borrows.
    events_lost: Arc<AtomicU32>,
}

impl<D: Document> Replicator<D> {
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn CollectionDriver<D>>,
        sink: Weak<dyn ReplicaSink<D>>,
        config: ChangeStreamConfig,
        ctx: Arc<TaskContext>,
        metrics: Arc<MetricsHub>,
        trace: TraceLogger,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ReplicatorState::Idle);
        let stop_token = ctx.child_token();
        Arc::new(Self {
            name: name.into(),
            driver,
            sink,
            config,
            ctx,
            metrics,
            trace,
            state_tx,
            state_rx,
            tokens: Mutex::new(TokenManager::default()),
            load_time: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            stop_token,
            events_lost: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Events dropped without application since the last full load.
    /// Non-zero means consistency is not guaranteed until a reload.
    pub fn events_lost(&self) -> u32 {
        self.events_lost.load(Ordering::Relaxed)
    }

    /// Bookmark the store position ahead of the initial full load.
    pub fn set_load_time(&self, time: Option<OperationTime>) {
        *self.load_time.lock() = time;
    }

    fn set_state(&self, state: ReplicatorState) {
        if self.state_tx.send_replace(state) != state {
            debug!(cache = %self.name, %state, "replicator state change");
        }
    }

    /// Launch the supervisor task. Idempotent after the first call.
    pub fn start(self: &Arc<Self>) {
        if self.state() != ReplicatorState::Idle {
            return;
        }
        self.set_state(ReplicatorState::Starting);
        let this = self.clone();
        self.ctx.spawn(async move { this.run().await });
    }

    /// Request shutdown and wait for the supervisor to finish, bounded.
    pub async fn stop(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(ReplicatorState::Stopping);
        self.stop_token.cancel();

        let mut rx = self.state_rx.clone();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while !rx.borrow_and_update().is_terminal() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(cache = %self.name, "replicator did not reach shutdown before deadline");
            self.set_state(ReplicatorState::Shutdown);
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.stop_token.is_cancelled() {
                break;
            }
            self.set_state(ReplicatorState::Starting);

            match self.open_and_consume().await {
                ConsumeExit::Stopped => break,
                ConsumeExit::Terminal(op) => {
                    warn!(cache = %self.name, operation = %op,
                          "change stream ended by terminal event, restarting");
                }
                ConsumeExit::Broken(reason) => {
                    warn!(cache = %self.name, reason, "change stream broke, restarting");
                }
            }

            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(max) = self.config.max_retries {
                if failures > max {
                    error!(cache = %self.name, failures,
                           "change stream retry budget exhausted");
                    self.set_state(ReplicatorState::Failed);
                    return;
                }
            }

            self.set_state(ReplicatorState::BackingOff);
            let delay = self.reconnect_delay(failures);
            debug!(cache = %self.name, failures, delay_ms = delay.as_millis() as u64,
                   "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop_token.cancelled() => break,
            }
        }
        self.set_state(ReplicatorState::Shutdown);
    }

    /// Exponential reconnect backoff: factor 1.5, ±10% jitter, capped.
    fn reconnect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let base = self.config.initial_retry_delay.as_secs_f64() * 1.5_f64.powi(exponent as i32);
        let capped = base.min(self.config.max_retry_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Pick the stream start position: durable token, then the pre-load
    /// operation time, then "now" as the logged last resort.
    fn start_candidates(&self) -> Vec<StreamStart> {
        let mut candidates = Vec::new();
        if let Some(token) = self.tokens.lock().durable() {
            candidates.push(StreamStart::ResumeToken(token));
        }
        if let Some(time) = *self.load_time.lock() {
            candidates.push(StreamStart::OperationTime(time));
        }
        candidates.push(StreamStart::Now);
        candidates
    }

    async fn open_stream(
        &self,
        producer: EventProducer,
    ) -> Result<Box<dyn StreamHandle>, StorageError> {
        let candidates = self.start_candidates();
        let last = candidates.len() - 1;
        for (i, start) in candidates.into_iter().enumerate() {
            if matches!(start, StreamStart::Now) && i > 0 {
                warn!(cache = %self.name,
                      "resume points unavailable, streaming from now; events may have been missed");
            }
            match self.driver.open_change_stream(start, producer.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(StorageError::ResumeExpired) if i < last => {
                    warn!(cache = %self.name, ?start,
                          "resume point no longer available, falling back");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("StreamStart::Now never reports an expired resume point")
    }

    async fn open_and_consume(&self) -> ConsumeExit {
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(self.config.max_buffered_events);
        let producer = self.make_producer(tx);

        let handle = match self.open_stream(producer).await {
            Ok(handle) => handle,
            Err(e) => {
                self.trace.record(&self.name, "change stream open", &e);
                return ConsumeExit::Broken(e.to_string());
            }
        };

        info!(cache = %self.name, collection = %self.driver.collection(),
              "change stream running");
        self.set_state(ReplicatorState::Running);
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let exit = self.consume(&mut rx).await;
        handle.close().await;

        // Brief drain of already-queued events so a restart replays less.
        if !matches!(exit, ConsumeExit::Stopped) {
            while let Ok(event) = rx.try_recv() {
                if event.operation.is_terminal() {
                    self.tokens.lock().advance(event.resume_token);
                    continue;
                }
                if self.apply(&event).is_ok() {
                    self.tokens.lock().advance(event.resume_token);
                }
            }
        }

        // The disconnect is clean: everything applied so far is durable,
        // so the reopened stream resumes exactly after the last event.
        self.tokens.lock().promote();
        exit
    }

    async fn consume(&self, rx: &mut mpsc::Receiver<ChangeEvent>) -> ConsumeExit {
        loop {
            tokio::select! {
                _ = self.stop_token.cancelled() => return ConsumeExit::Stopped,
                _ = tokio::time::sleep(CONSUMER_TICK) => {
                    self.maybe_promote();
                }
                received = rx.recv() => {
                    let Some(event) = received else {
                        return ConsumeExit::Broken("event queue closed".to_string());
                    };
                    if event.operation.is_terminal() {
                        self.metrics.stream_event(&self.name, event.operation);
                        // Consume the terminal event itself, so the resumed
                        // stream starts after it instead of replaying it.
                        self.tokens.lock().advance(event.resume_token);
                        return ConsumeExit::Terminal(event.operation);
                    }

                    let budget = self.config.event_processing_timeout;
                    let applied = tokio::time::timeout(budget, async {
                        self.apply(&event)
                    }).await;

                    match applied {
                        Ok(Ok(())) => {
                            self.tokens.lock().advance(event.resume_token);
                            self.maybe_promote();
                        }
                        Ok(Err(ApplyError::SinkGone)) => {
                            return ConsumeExit::Broken("sink dropped".to_string());
                        }
                        Ok(Err(ApplyError::Recoverable(message))) => {
                            warn!(cache = %self.name, operation = %event.operation,
                                  message, "event skipped");
                        }
                        Err(_elapsed) => {
                            warn!(cache = %self.name, operation = %event.operation,
                                  timeout_ms = budget.as_millis() as u64,
                                  "event processing timed out");
                        }
                    }
                }
            }
        }
    }

    fn maybe_promote(&self) {
        let mut tokens = self.tokens.lock();
        if tokens.due_for_promotion() {
            if let Some(token) = tokens.promote() {
                debug!(cache = %self.name, ?token, "durable resume token advanced");
            }
        }
    }

    /// Apply one event to the sink. Synchronous: the sink touches only
    /// in-process state.
    fn apply(&self, event: &ChangeEvent) -> Result<(), ApplyError> {
        let Some(sink) = self.sink.upgrade() else {
            return Err(ApplyError::SinkGone);
        };

        match event.operation {
            op if op.is_upsert() => {
                let Some(wire_doc) = event.full_document.clone() else {
                    return Err(ApplyError::Recoverable(
                        "upsert event without full document".to_string(),
                    ));
                };
                let doc = wire::from_wire::<D>(wire_doc)
                    .map_err(|e| ApplyError::Recoverable(e.to_string()))?;
                sink.accept_from_store(doc);
                self.metrics.stream_event(&self.name, op);
            }
            ChangeOperation::Delete => {
                let Some(raw) = event.document_key.as_deref() else {
                    return Err(ApplyError::Recoverable(
                        "delete event without document key".to_string(),
                    ));
                };
                let key = D::Key::from_key_string(raw)
                    .map_err(|e| ApplyError::Recoverable(e.to_string()))?;
                sink.evict_local(&key);
                self.metrics.stream_event(&self.name, ChangeOperation::Delete);
            }
            ChangeOperation::Unknown => {
                debug!(cache = %self.name, "ignoring unknown change event");
                self.metrics.stream_event(&self.name, ChangeOperation::Unknown);
            }
            // Terminal operations are intercepted by the consumer loop.
            other => {
                debug!(cache = %self.name, operation = %other,
                       "terminal event reached apply; ignoring");
            }
        }
        Ok(())
    }

    /// Build the producer callback handed to the driver: non-blocking
    /// offer, bounded retry, then degraded application or loss.
    fn make_producer(&self, tx: mpsc::Sender<ChangeEvent>) -> EventProducer {
        let name = self.name.clone();
        let sink = self.sink.clone();
        let metrics = self.metrics.clone();
        let events_lost = self.events_lost.clone();

        Arc::new(move |event: ChangeEvent| {
            let mut pending = event;
            for attempt in 0..OFFER_RETRIES {
                match tx.try_send(pending) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        // Shutdown in progress; drop silently.
                        return;
                    }
                    Err(mpsc::error::TrySendError::Full(back)) => {
                        pending = back;
                        if attempt + 1 < OFFER_RETRIES {
                            std::thread::sleep(OFFER_RETRY_DELAY);
                        }
                    }
                }
            }

            // Queue saturated: apply directly on the producer when the
            // event carries everything needed, otherwise count it lost.
            let Some(sink) = sink.upgrade() else {
                return;
            };
            if pending.operation.is_upsert() {
                if let Some(wire_doc) = pending.full_document.clone() {
                    match wire::from_wire::<D>(wire_doc) {
                        Ok(doc) => {
                            sink.accept_from_store(doc);
                            metrics.stream_degraded(&name);
                            metrics.stream_event(&name, pending.operation);
                            return;
                        }
                        Err(e) => {
                            warn!(cache = %name, error = %e,
                                  "degraded apply failed to decode document");
                        }
                    }
                }
            } else if pending.operation == ChangeOperation::Delete {
                if let Some(raw) = pending.document_key.as_deref() {
                    if let Ok(key) = D::Key::from_key_string(raw) {
                        sink.evict_local(&key);
                        metrics.stream_degraded(&name);
                        metrics.stream_event(&name, ChangeOperation::Delete);
                        return;
                    }
                }
            }

            events_lost.fetch_add(1, Ordering::Relaxed);
            metrics.stream_event_lost(&name);
            warn!(cache = %name, operation = %pending.operation,
                  "event lost with queue full; consistency degraded until reload");
        })
    }
}

enum ApplyError {
    /// The cache behind the sink is gone; stop consuming.
    SinkGone,
    /// This event could not be applied; log and continue.
    Recoverable(String),
}

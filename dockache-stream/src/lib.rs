//! # dockache-stream
//!
//! The change-stream replicator: a resilient, bounded-buffer consumer
//! turning store-side mutation events into cache reconciliation calls.
//! Covers backpressure with a degraded producer-side fallback, resume-token
//! checkpointing, terminal-event restarts, and exponential reconnect
//! backoff behind a small state machine.

pub mod replicator;
pub mod state;
pub mod tokens;

pub use replicator::{ReplicaSink, Replicator};
pub use state::ReplicatorState;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    use dockache_core::config::ChangeStreamConfig;
    use dockache_core::document::{DocBinding, Document};
    use dockache_core::metrics::MetricsHub;
    use dockache_core::ops::ChangeOperation;
    use dockache_core::runtime::TaskContext;
    use dockache_core::tracelog::TraceLogger;
    use dockache_storage::{CollectionDriver, MemoryClient, StoreClient};

    use crate::replicator::{ReplicaSink, Replicator};
    use crate::state::ReplicatorState;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        id: String,
        version: i64,
        balance: i64,
        #[serde(skip)]
        binding: DocBinding,
    }

    impl Account {
        fn new(id: &str, balance: i64) -> Self {
            Self {
                id: id.to_string(),
                version: 0,
                balance,
                binding: DocBinding::new(),
            }
        }
    }

    impl Document for Account {
        type Key = String;
        const KEY_FIELD: &'static str = "id";

        fn key(&self) -> &String {
            &self.id
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn with_version(&self, version: i64) -> Self {
            Self {
                version,
                ..self.clone()
            }
        }

        fn binding(&self) -> &DocBinding {
            &self.binding
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        accepted: Mutex<Vec<Account>>,
        evicted: Mutex<Vec<String>>,
    }

    impl ReplicaSink<Account> for RecordingSink {
        fn sink_name(&self) -> &str {
            "accounts"
        }

        fn accept_from_store(&self, doc: Account) {
            self.accepted.lock().push(doc);
        }

        fn evict_local(&self, key: &String) {
            self.evicted.lock().push(key.clone());
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    fn build(
        driver: Arc<dyn CollectionDriver<Account>>,
        sink: &Arc<RecordingSink>,
    ) -> Arc<Replicator<Account>> {
        let sink_dyn: Arc<dyn ReplicaSink<Account>> = sink.clone();
        Replicator::new(
            "accounts",
            driver,
            Arc::downgrade(&sink_dyn),
            ChangeStreamConfig::development(),
            Arc::new(TaskContext::new()),
            Arc::new(MetricsHub::new()),
            TraceLogger::disabled(),
        )
    }

    #[tokio::test]
    async fn replicates_inserts_and_deletes() {
        let client = MemoryClient::new();
        let driver = client.collection::<Account>("ns_game", "accounts");
        let sink = Arc::new(RecordingSink::default());
        let replicator = build(driver.clone(), &sink);

        replicator.start();
        wait_until(|| replicator.state() == ReplicatorState::Running).await;

        driver.insert(&Account::new("u1", 100)).await.unwrap();
        driver.delete(&"u1".to_string()).await.unwrap();

        wait_until(|| sink.evicted.lock().len() == 1).await;
        assert_eq!(sink.accepted.lock()[0].id, "u1");
        assert_eq!(sink.evicted.lock()[0], "u1");

        replicator.stop().await;
        assert_eq!(replicator.state(), ReplicatorState::Shutdown);
    }

    #[tokio::test]
    async fn terminal_event_triggers_restart() {
        let client = MemoryClient::new();
        let driver = client.collection::<Account>("ns_game", "accounts");
        let sink = Arc::new(RecordingSink::default());
        let replicator = build(driver.clone(), &sink);

        replicator.start();
        wait_until(|| replicator.state() == ReplicatorState::Running).await;

        client.invalidate_stream("ns_game", "accounts");

        // The stream restarts and keeps replicating afterwards.
        wait_until(|| replicator.state() == ReplicatorState::Running).await;
        driver.insert(&Account::new("u2", 5)).await.unwrap();
        wait_until(|| !sink.accepted.lock().is_empty()).await;

        replicator.stop().await;
    }

    #[test]
    fn terminal_ops_match_state_machine_expectations() {
        for op in [
            ChangeOperation::Drop,
            ChangeOperation::Rename,
            ChangeOperation::DropDatabase,
            ChangeOperation::Invalidate,
        ] {
            assert!(op.is_terminal());
        }
    }
}

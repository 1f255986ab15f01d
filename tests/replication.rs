//! Change-stream replication: external mutations, echoes, resume.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{blank, env, wait_until, Player};
use dockache::{
    ChangeStreamConfig, CollectionDriver, DocBinding, Document, MemoryClient, MetricsHub,
    ReplicaSink, Replicator, ReplicatorState, StoreClient, TaskContext, TraceLogger,
};

#[tokio::test]
async fn external_insert_and_delete_reach_the_cache() {
    let env = env().await;
    let external = env.client.collection::<Player>("ns_game", "players");

    // Another process writes a document directly into the store.
    external
        .insert(&Player {
            id: "u2".into(),
            version: 42,
            name: "Ext".into(),
            balance: 1024,
            binding: DocBinding::default(),
        })
        .await
        .unwrap();

    wait_until(|| env.cache.contains(&"u2".to_string())).await;
    let mirrored = env.cache.read(&"u2".to_string()).into_result().unwrap().unwrap();
    assert_eq!(mirrored.version(), 42);
    assert_eq!(mirrored.name, "Ext");
    assert_eq!(mirrored.balance, 1024);

    // And deletes it again.
    external.delete(&"u2".to_string()).await.unwrap();
    wait_until(|| !env.cache.contains(&"u2".to_string())).await;
    assert!(env.cache.read(&"u2".to_string()).is_empty());
}

#[tokio::test]
async fn local_write_echo_is_a_no_op() {
    let env = env().await;
    let key = "u1".to_string();
    env.cache
        .create(key.clone(), |p| Player {
            name: "Ada".into(),
            balance: 1,
            ..p
        })
        .await
        .into_result()
        .unwrap();

    let committed = env
        .cache
        .update(&key, |p| {
            Arc::new(Player {
                balance: 2,
                ..p.as_ref().clone()
            })
        })
        .await
        .into_result()
        .unwrap();

    // Give the stream time to deliver the echo of our own replace.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The echo carried the same version: it neither re-applied nor
    // downgraded the entry.
    let cached = env.cache.read(&key).into_result().unwrap().unwrap();
    assert_eq!(cached.version(), committed.version());
    assert_eq!(cached.balance, 2);

    // And the mirror is quiescent: nothing further mutates the entry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = env.cache.read(&key).into_result().unwrap().unwrap();
    assert!(Arc::ptr_eq(&cached, &again));
}

#[derive(Default)]
struct CountingSink {
    applied: Mutex<HashMap<String, u32>>,
    evicted: Mutex<Vec<String>>,
}

impl CountingSink {
    fn applied_count(&self, key: &str) -> u32 {
        *self.applied.lock().unwrap().get(key).unwrap_or(&0)
    }
}

impl ReplicaSink<Player> for CountingSink {
    fn sink_name(&self) -> &str {
        "players"
    }

    fn accept_from_store(&self, doc: Player) {
        *self
            .applied
            .lock()
            .unwrap()
            .entry(doc.id.clone())
            .or_insert(0) += 1;
    }

    fn evict_local(&self, key: &String) {
        self.evicted.lock().unwrap().push(key.clone());
    }
}

#[tokio::test]
async fn restart_resumes_after_the_last_applied_event() {
    let client = MemoryClient::new();
    let driver = client.collection::<Player>("ns_game", "players");
    let sink = Arc::new(CountingSink::default());
    let sink_dyn: Arc<dyn ReplicaSink<Player>> = sink.clone();

    let replicator = Replicator::new(
        "players",
        driver.clone(),
        Arc::downgrade(&sink_dyn),
        ChangeStreamConfig::development(),
        Arc::new(TaskContext::new()),
        Arc::new(MetricsHub::new()),
        TraceLogger::disabled(),
    );
    replicator.start();
    wait_until(|| replicator.state() == ReplicatorState::Running).await;

    // Events 1..=N are applied, then the stream is invalidated.
    for i in 1..=5 {
        driver
            .insert(&blank(format!("u{i}")))
            .await
            .unwrap();
    }
    wait_until(|| sink.applied_count("u5") == 1).await;

    client.invalidate_stream("ns_game", "players");

    // A mutation committed while the consumer is down.
    driver.insert(&blank("u6".to_string())).await.unwrap();

    // After the restart the new event arrives exactly once, and none of
    // the pre-crash events are replayed.
    wait_until(|| sink.applied_count("u6") == 1).await;
    for i in 1..=5 {
        assert_eq!(sink.applied_count(&format!("u{i}")), 1, "u{i} replayed");
    }

    replicator.stop().await;
    assert_eq!(replicator.state(), ReplicatorState::Shutdown);
}

#[tokio::test]
async fn replicator_survives_a_dropped_collection() {
    let env = env().await;

    env.cache
        .create("u1".to_string(), |p| Player {
            name: "Ada".into(),
            ..p
        })
        .await
        .into_result()
        .unwrap();

    // Dropping the collection clears the store and ends the stream.
    env.client.drop_collection("ns_game", "players");

    // The replicator restarts; writes made afterwards replicate again.
    let external = env.client.collection::<Player>("ns_game", "players");
    wait_until(|| env.cache.stats().replicator == Some(ReplicatorState::Running)).await;
    external
        .insert(&Player {
            id: "u7".into(),
            version: 0,
            name: "Late".into(),
            balance: 3,
            binding: DocBinding::default(),
        })
        .await
        .unwrap();
    wait_until(|| env.cache.contains(&"u7".to_string())).await;
}

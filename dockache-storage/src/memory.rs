//! In-memory storage backend.
//!
//! A process-local store implementing the full [`CollectionDriver`]
//! contract: primary-key CRUD, conditional replace with CAS semantics,
//! unique-index enforcement, and simulated change streams with resume
//! tokens and bounded event retention. Tests and single-process
//! deployments run against this backend; it behaves like a well-behaved
//! one-node store, including the failure modes the cache layer must
//! handle (duplicate keys, version mismatches, expired resume points).
//!
//! Documents are held in wire form, so every round trip exercises the same
//! codec path a remote driver would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use dockache_core::config::StorageMode;
use dockache_core::document::{DocKey, Document};
use dockache_core::error::{KeyViolation, StorageError};
use dockache_core::ops::ChangeOperation;

use crate::events::{ChangeEvent, OperationTime, ResumeToken, StreamStart};
use crate::wire;
use crate::{CollectionDriver, EventProducer, ReplaceOutcome, StoreClient, StreamHandle};

/// Events retained per collection for resume replay. Resuming from a token
/// older than the retained window fails with `ResumeExpired`, matching the
/// oplog-retention behavior of a real store.
pub const DEFAULT_EVENT_RETENTION: usize = 1024;

struct Subscriber {
    id: u64,
    producer: EventProducer,
}

struct CollectionState {
    docs: HashMap<String, Value>,
    unique_fields: HashSet<String>,
    sequence: u64,
    events: VecDeque<ChangeEvent>,
    retention: usize,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

impl CollectionState {
    fn new(retention: usize) -> Self {
        Self {
            docs: HashMap::new(),
            unique_fields: HashSet::new(),
            sequence: 0,
            events: VecDeque::new(),
            retention,
            subscribers: Vec::new(),
            next_subscriber: 0,
        }
    }

    /// First unique field whose value in `doc` collides with another
    /// document.
    fn unique_violation(&self, key_str: &str, doc: &Value) -> Option<String> {
        for field in &self.unique_fields {
            let Some(candidate) = doc.get(field) else {
                continue;
            };
            if candidate.is_null() {
                continue;
            }
            for (other_key, other) in &self.docs {
                if other_key != key_str && other.get(field) == Some(candidate) {
                    return Some(field.clone());
                }
            }
        }
        None
    }
}

struct SharedCollection {
    database: String,
    collection: String,
    state: Mutex<CollectionState>,
}

impl SharedCollection {
    /// Append an event to the retained log and push it to every
    /// subscriber, in commit order. Called with the state lock held so no
    /// mutation can interleave between commit and delivery.
    fn emit(
        &self,
        state: &mut CollectionState,
        operation: ChangeOperation,
        full_document: Option<Value>,
        document_key: Option<String>,
    ) {
        state.sequence += 1;
        let event = ChangeEvent {
            operation,
            full_document,
            document_key,
            resume_token: ResumeToken::new(state.sequence),
        };
        state.events.push_back(event.clone());
        while state.events.len() > state.retention {
            state.events.pop_front();
        }
        for subscriber in &state.subscribers {
            (subscriber.producer)(event.clone());
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| s.id != id);
    }
}

#[derive(Debug)]
struct MemoryStreamHandle {
    shared: Weak<SharedCollection>,
    id: u64,
    open: AtomicBool,
}

#[async_trait]
impl StreamHandle for MemoryStreamHandle {
    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(shared) = self.shared.upgrade() {
                shared.unsubscribe(self.id);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// In-process store client. Cheap to clone via `Arc`; collections are
/// created on first access and shared by every driver addressing them, so
/// two clients of the same `MemoryClient` observe each other's writes —
/// including through change streams.
pub struct MemoryClient {
    id: Uuid,
    collections: DashMap<String, Arc<SharedCollection>>,
    event_retention: usize,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::with_event_retention(DEFAULT_EVENT_RETENTION)
    }

    /// A client whose collections retain only `retention` events for
    /// resume replay. Tests use small values to force the expired-resume
    /// fallback path.
    pub fn with_event_retention(retention: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            collections: DashMap::new(),
            event_retention: retention,
        }
    }

    fn shared(&self, database: &str, collection: &str) -> Arc<SharedCollection> {
        let slot = format!("{database}/{collection}");
        self.collections
            .entry(slot)
            .or_insert_with(|| {
                Arc::new(SharedCollection {
                    database: database.to_string(),
                    collection: collection.to_string(),
                    state: Mutex::new(CollectionState::new(self.event_retention)),
                })
            })
            .clone()
    }

    /// Drop a collection: discard its documents and deliver a terminal
    /// `Drop` event to every subscriber.
    pub fn drop_collection(&self, database: &str, collection: &str) {
        let shared = self.shared(database, collection);
        let mut state = shared.state.lock();
        state.docs.clear();
        shared.emit(&mut state, ChangeOperation::Drop, None, None);
    }

    /// Deliver a terminal `Invalidate` event without touching data.
    pub fn invalidate_stream(&self, database: &str, collection: &str) {
        let shared = self.shared(database, collection);
        let mut state = shared.state.lock();
        shared.emit(&mut state, ChangeOperation::Invalidate, None, None);
    }
}

impl StoreClient for MemoryClient {
    fn mode(&self) -> StorageMode {
        StorageMode::Memory
    }

    fn client_id(&self) -> Uuid {
        self.id
    }

    fn collection<D: Document>(
        &self,
        database: &str,
        collection: &str,
    ) -> Arc<dyn CollectionDriver<D>> {
        Arc::new(MemoryDriver::<D> {
            shared: self.shared(database, collection),
            _marker: PhantomData,
        })
    }
}

/// Typed driver over one shared in-memory collection.
pub struct MemoryDriver<D> {
    shared: Arc<SharedCollection>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: Document> MemoryDriver<D> {
    fn parse_key(raw: &str) -> Result<D::Key, StorageError> {
        D::Key::from_key_string(raw).map_err(|e| StorageError::Codec {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl<D: Document> CollectionDriver<D> for MemoryDriver<D> {
    fn database(&self) -> &str {
        &self.shared.database
    }

    fn collection(&self) -> &str {
        &self.shared.collection
    }

    async fn insert(&self, doc: &D) -> Result<(), StorageError> {
        let key_str = doc.key().to_key_string();
        let wire_doc = wire::to_wire(doc)?;

        let mut state = self.shared.state.lock();
        if state.docs.contains_key(&key_str) {
            return Err(StorageError::DuplicateKey {
                violation: KeyViolation::Primary,
            });
        }
        if let Some(field) = state.unique_violation(&key_str, &wire_doc) {
            return Err(StorageError::DuplicateKey {
                violation: KeyViolation::Unique(field),
            });
        }
        state.docs.insert(key_str.clone(), wire_doc.clone());
        self.shared.emit(
            &mut state,
            ChangeOperation::Insert,
            Some(wire_doc),
            Some(key_str),
        );
        Ok(())
    }

    async fn read(&self, key: &D::Key) -> Result<Option<D>, StorageError> {
        let key_str = key.to_key_string();
        let wire_doc = self.shared.state.lock().docs.get(&key_str).cloned();
        wire_doc.map(wire::from_wire).transpose()
    }

    async fn delete(&self, key: &D::Key) -> Result<bool, StorageError> {
        let key_str = key.to_key_string();
        let mut state = self.shared.state.lock();
        let removed = state.docs.remove(&key_str).is_some();
        if removed {
            self.shared
                .emit(&mut state, ChangeOperation::Delete, None, Some(key_str));
        }
        Ok(removed)
    }

    async fn read_all(&self) -> Result<BoxStream<'static, Result<D, StorageError>>, StorageError> {
        let docs: Vec<Value> = self.shared.state.lock().docs.values().cloned().collect();
        Ok(stream::iter(docs.into_iter().map(wire::from_wire)).boxed())
    }

    async fn read_keys(
        &self,
    ) -> Result<BoxStream<'static, Result<D::Key, StorageError>>, StorageError> {
        let keys: Vec<String> = self.shared.state.lock().docs.keys().cloned().collect();
        Ok(stream::iter(keys.into_iter().map(|k| Self::parse_key(&k))).boxed())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.shared.state.lock().docs.len() as u64)
    }

    async fn has_key(&self, key: &D::Key) -> Result<bool, StorageError> {
        let key_str = key.to_key_string();
        Ok(self.shared.state.lock().docs.contains_key(&key_str))
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let mut state = self.shared.state.lock();
        let keys: Vec<String> = state.docs.keys().cloned().collect();
        state.docs.clear();
        let removed = keys.len() as u64;
        for key in keys {
            self.shared
                .emit(&mut state, ChangeOperation::Delete, None, Some(key));
        }
        Ok(removed)
    }

    async fn replace_if_version_matches(
        &self,
        expected_key: &D::Key,
        expected_version: i64,
        new_doc: &D,
    ) -> Result<ReplaceOutcome, StorageError> {
        let key_str = expected_key.to_key_string();
        let wire_doc = wire::to_wire(new_doc)?;

        let mut state = self.shared.state.lock();
        let Some(existing) = state.docs.get(&key_str) else {
            return Ok(ReplaceOutcome {
                matched: 0,
                modified: 0,
            });
        };
        if wire::wire_version::<D>(existing) != Some(expected_version) {
            return Ok(ReplaceOutcome {
                matched: 0,
                modified: 0,
            });
        }
        if let Some(field) = state.unique_violation(&key_str, &wire_doc) {
            return Err(StorageError::DuplicateKey {
                violation: KeyViolation::Unique(field),
            });
        }
        state.docs.insert(key_str.clone(), wire_doc.clone());
        self.shared.emit(
            &mut state,
            ChangeOperation::Replace,
            Some(wire_doc),
            Some(key_str),
        );
        Ok(ReplaceOutcome {
            matched: 1,
            modified: 1,
        })
    }

    async fn register_unique_index(&self, field: &str) -> Result<(), StorageError> {
        let mut state = self.shared.state.lock();
        if state.unique_fields.insert(field.to_string()) {
            debug!(
                database = %self.shared.database,
                collection = %self.shared.collection,
                field,
                "registered unique index"
            );
        }
        Ok(())
    }

    async fn read_by_unique_index(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<Option<D>, StorageError> {
        let wire_doc = {
            let state = self.shared.state.lock();
            state
                .docs
                .values()
                .find(|doc| doc.get(field) == Some(value))
                .cloned()
        };
        wire_doc.map(wire::from_wire).transpose()
    }

    async fn current_operation_time(&self) -> Result<Option<OperationTime>, StorageError> {
        Ok(Some(OperationTime::new(self.shared.state.lock().sequence)))
    }

    async fn open_change_stream(
        &self,
        start: StreamStart,
        producer: EventProducer,
    ) -> Result<Box<dyn StreamHandle>, StorageError> {
        let mut state = self.shared.state.lock();

        let replay_after = match start {
            StreamStart::Now => None,
            StreamStart::ResumeToken(token) => Some(token.raw),
            StreamStart::OperationTime(time) => Some(time.raw),
        };

        let replay: Vec<ChangeEvent> = match replay_after {
            None => Vec::new(),
            Some(position) if position >= state.sequence => Vec::new(),
            Some(position) => {
                // A gap between the requested position and the oldest
                // retained event means the resume point aged out.
                let oldest = state.events.front().map(|e| e.resume_token.raw);
                match oldest {
                    None => return Err(StorageError::ResumeExpired),
                    Some(oldest) if position + 1 < oldest => {
                        return Err(StorageError::ResumeExpired)
                    }
                    Some(_) => state
                        .events
                        .iter()
                        .filter(|e| e.resume_token.raw > position)
                        .cloned()
                        .collect(),
                }
            }
        };

        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state.subscribers.push(Subscriber {
            id,
            producer: producer.clone(),
        });

        // Delivered under the state lock so concurrent mutations queue
        // strictly after the replayed history.
        for event in replay {
            producer(event);
        }

        Ok(Box::new(MemoryStreamHandle {
            shared: Arc::downgrade(&self.shared),
            id,
            open: AtomicBool::new(true),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockache_core::document::DocBinding;
    use parking_lot::Mutex as PlMutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        id: String,
        version: i64,
        name: String,
        balance: i64,
        #[serde(skip)]
        binding: DocBinding,
    }

    impl Account {
        fn new(id: &str, name: &str, balance: i64) -> Self {
            Self {
                id: id.to_string(),
                version: 0,
                name: name.to_string(),
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

    fn driver(client: &MemoryClient) -> Arc<dyn CollectionDriver<Account>> {
        client.collection::<Account>("ns_game", "accounts")
    }

    fn collector() -> (EventProducer, Arc<PlMutex<Vec<ChangeEvent>>>) {
        let seen: Arc<PlMutex<Vec<ChangeEvent>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        let producer: EventProducer = Arc::new(move |event| sink.lock().push(event));
        (producer, seen)
    }

    #[tokio::test]
    async fn insert_read_delete_round_trip() {
        let client = MemoryClient::new();
        let driver = driver(&client);

        driver.insert(&Account::new("u1", "Ada", 100)).await.unwrap();
        let read = driver.read(&"u1".to_string()).await.unwrap().unwrap();
        assert_eq!(read.balance, 100);
        assert_eq!(driver.count().await.unwrap(), 1);
        assert!(driver.has_key(&"u1".to_string()).await.unwrap());

        assert!(driver.delete(&"u1".to_string()).await.unwrap());
        assert!(!driver.delete(&"u1".to_string()).await.unwrap());
        assert_eq!(driver.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_primary_key_is_rejected() {
        let client = MemoryClient::new();
        let driver = driver(&client);

        driver.insert(&Account::new("u1", "Ada", 100)).await.unwrap();
        let err = driver
            .insert(&Account::new("u1", "Bob", 5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::DuplicateKey {
                violation: KeyViolation::Primary
            }
        ));
    }

    #[tokio::test]
    async fn duplicate_unique_index_names_the_field() {
        let client = MemoryClient::new();
        let driver = driver(&client);
        driver.register_unique_index("name").await.unwrap();

        driver.insert(&Account::new("u1", "Ada", 100)).await.unwrap();
        let err = driver
            .insert(&Account::new("u2", "Ada", 5))
            .await
            .unwrap_err();
        match err {
            StorageError::DuplicateKey {
                violation: KeyViolation::Unique(field),
            } => assert_eq!(field, "name"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cas_replace_requires_matching_version() {
        let client = MemoryClient::new();
        let driver = driver(&client);
        driver.insert(&Account::new("u1", "Ada", 100)).await.unwrap();

        let next = Account {
            version: 1,
            balance: 150,
            ..Account::new("u1", "Ada", 150)
        };
        let miss = driver
            .replace_if_version_matches(&"u1".to_string(), 3, &next)
            .await
            .unwrap();
        assert!(!miss.committed());

        let hit = driver
            .replace_if_version_matches(&"u1".to_string(), 0, &next)
            .await
            .unwrap();
        assert!(hit.committed());
        let read = driver.read(&"u1".to_string()).await.unwrap().unwrap();
        assert_eq!(read.version, 1);
        assert_eq!(read.balance, 150);
    }

    #[tokio::test]
    async fn read_by_unique_index_finds_document() {
        let client = MemoryClient::new();
        let driver = driver(&client);
        driver.register_unique_index("name").await.unwrap();
        driver.insert(&Account::new("u1", "Ada", 100)).await.unwrap();

        let found = driver
            .read_by_unique_index("name", &serde_json::json!("Ada"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "u1");

        let missing = driver
            .read_by_unique_index("name", &serde_json::json!("Nobody"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn change_stream_delivers_mutations_in_order() {
        let client = MemoryClient::new();
        let driver = driver(&client);
        let (producer, seen) = collector();

        let handle = driver
            .open_change_stream(StreamStart::Now, producer)
            .await
            .unwrap();

        driver.insert(&Account::new("u1", "Ada", 100)).await.unwrap();
        driver.delete(&"u1".to_string()).await.unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, ChangeOperation::Insert);
        assert_eq!(events[1].operation, ChangeOperation::Delete);
        assert!(events[0].resume_token < events[1].resume_token);
        drop(events);

        handle.close().await;
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn resume_token_replays_missed_events() {
        let client = MemoryClient::new();
        let driver = driver(&client);
        let (producer, seen) = collector();

        let handle = driver
            .open_change_stream(StreamStart::Now, producer)
            .await
            .unwrap();
        driver.insert(&Account::new("u1", "Ada", 100)).await.unwrap();
        let first_token = seen.lock()[0].resume_token;
        handle.close().await;

        // Mutations while disconnected.
        driver.insert(&Account::new("u2", "Bob", 50)).await.unwrap();
        driver.delete(&"u1".to_string()).await.unwrap();

        let (producer2, seen2) = collector();
        driver
            .open_change_stream(StreamStart::ResumeToken(first_token), producer2)
            .await
            .unwrap();

        let events = seen2.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, ChangeOperation::Insert);
        assert_eq!(events[0].document_key.as_deref(), Some("u2"));
        assert_eq!(events[1].operation, ChangeOperation::Delete);
    }

    #[tokio::test]
    async fn expired_resume_point_is_reported() {
        let client = MemoryClient::with_event_retention(2);
        let driver = driver(&client);
        let (producer, seen) = collector();

        let handle = driver
            .open_change_stream(StreamStart::Now, producer)
            .await
            .unwrap();
        driver.insert(&Account::new("u1", "Ada", 1)).await.unwrap();
        let stale_token = seen.lock()[0].resume_token;
        handle.close().await;

        // Push the first event out of the retained window.
        for i in 2..6 {
            driver
                .insert(&Account::new(&format!("u{i}"), &format!("n{i}"), 0))
                .await
                .unwrap();
        }

        let (producer2, _seen2) = collector();
        let err = driver
            .open_change_stream(StreamStart::ResumeToken(stale_token), producer2)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ResumeExpired));
    }

    #[tokio::test]
    async fn drop_collection_emits_terminal_event() {
        let client = MemoryClient::new();
        let driver = driver(&client);
        let (producer, seen) = collector();
        driver
            .open_change_stream(StreamStart::Now, producer)
            .await
            .unwrap();

        driver.insert(&Account::new("u1", "Ada", 1)).await.unwrap();
        client.drop_collection("ns_game", "accounts");

        let events = seen.lock();
        let last = events.last().unwrap();
        assert_eq!(last.operation, ChangeOperation::Drop);
        assert!(last.operation.is_terminal());
        assert_eq!(driver.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn operation_time_tracks_commits() {
        let client = MemoryClient::new();
        let driver = driver(&client);

        let before = driver.current_operation_time().await.unwrap().unwrap();
        driver.insert(&Account::new("u1", "Ada", 1)).await.unwrap();
        let after = driver.current_operation_time().await.unwrap().unwrap();
        assert!(before < after);

        // Resuming from the pre-insert bookmark replays the insert.
        let (producer, seen) = collector();
        driver
            .open_change_stream(StreamStart::OperationTime(before), producer)
            .await
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
    }
}

//! Random-key creation and the key string codec.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dockache::{DocBinding, DocCache, DocKey, Document, MemoryClient, RandomDocKey, Registry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ticket {
    id: Uuid,
    version: i64,
    holder: String,
    #[serde(skip)]
    binding: DocBinding,
}

impl Document for Ticket {
    type Key = Uuid;
    const KEY_FIELD: &'static str = "id";

    fn key(&self) -> &Uuid {
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

fn blank_ticket(key: Uuid) -> Ticket {
    Ticket {
        id: key,
        version: 0,
        holder: String::new(),
        binding: DocBinding::default(),
    }
}

#[test]
fn random_keys_are_distinct_at_scale() {
    let mut seen = HashSet::with_capacity(100_000);
    for _ in 0..100_000 {
        assert!(seen.insert(Uuid::random()), "random key collision");
    }
}

#[test]
fn key_strings_round_trip() {
    for _ in 0..1000 {
        let key = Uuid::random();
        assert_eq!(Uuid::from_key_string(&key.to_key_string()).unwrap(), key);
    }

    let int_key: i64 = -42;
    assert_eq!(
        i64::from_key_string(&int_key.to_key_string()).unwrap(),
        int_key
    );
}

#[tokio::test]
async fn create_random_yields_distinct_documents() {
    let client = MemoryClient::new();
    let registry = Registry::new("ns");
    let registration = registry.register(&client, "game").unwrap();
    let cache = DocCache::<Ticket>::builder("tickets", blank_ticket)
        .start(&client, &registration)
        .await
        .unwrap();

    let mut keys = HashSet::new();
    for i in 0..500 {
        let doc = cache
            .create_random(|t| Ticket {
                holder: format!("holder-{i}"),
                ..t
            })
            .await
            .into_result()
            .unwrap();
        assert_eq!(doc.version(), 0);
        assert!(keys.insert(*doc.key()), "duplicate random key");
    }
    assert_eq!(cache.size(), 500);
}

//! Shared fixtures for the integration suite.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dockache::{
    CacheConfig, ChangeStreamConfig, DocBinding, DocCache, Document, MemoryClient, Registry,
    UniqueIndex,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub balance: i64,
    #[serde(skip)]
    pub binding: DocBinding,
}

impl Document for Player {
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

pub fn blank(key: String) -> Player {
    Player {
        id: key,
        version: 0,
        name: String::new(),
        balance: 0,
        binding: DocBinding::default(),
    }
}

pub struct TestEnv {
    pub client: MemoryClient,
    pub registry: Arc<Registry>,
    pub cache: Arc<DocCache<Player>>,
}

pub async fn env_with(config: CacheConfig) -> TestEnv {
    let client = MemoryClient::new();
    let registry = Arc::new(Registry::new("ns"));
    let registration = registry.register(&client, "game").unwrap();
    let cache = DocCache::<Player>::builder("players", blank)
        .config(config)
        .stream_config(ChangeStreamConfig::development())
        .unique_index(UniqueIndex::new("name", |p: &Player| {
            Some(Value::from(p.name.clone()))
        }))
        .start(&client, &registration)
        .await
        .unwrap();
    TestEnv {
        client,
        registry,
        cache,
    }
}

pub async fn env() -> TestEnv {
    env_with(CacheConfig::default()).await
}

/// Poll `check` until it holds, or panic after ~2 seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

//! Process-wide registration registry.
//!
//! Every database a client opens through the cache layer is registered
//! here under its namespaced name. The namespace prefix is prepended
//! exactly once (registering an already-prefixed name is idempotent on the
//! prefix), and full names are globally unique case-insensitively: a
//! second registration for the same name fails rather than silently
//! sharing state across owners.
//!
//! The registry is global mutable state with an explicit lifecycle:
//! [`enable`] installs it, [`disable`] tears it down, and tests can cycle
//! both freely.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use dockache_core::error::CacheError;
use dockache_storage::StoreClient;

/// Identity of one cache attached to a registration.
#[derive(Debug, Clone)]
pub struct CacheDescriptor {
    pub name: String,
    pub database: String,
}

/// A successfully registered database.
pub struct Registration {
    client_id: Uuid,
    database: String,
    caches: RwLock<Vec<CacheDescriptor>>,
}

impl Registration {
    /// Id of the owning store client.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Full namespaced database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Snapshot of the caches created under this registration.
    pub fn caches(&self) -> Vec<CacheDescriptor> {
        self.caches.read().clone()
    }

    pub(crate) fn track_cache(&self, name: &str) {
        self.caches.write().push(CacheDescriptor {
            name: name.to_string(),
            database: self.database.clone(),
        });
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("client_id", &self.client_id)
            .field("database", &self.database)
            .field("caches", &self.caches.read().len())
            .finish()
    }
}

/// Registry of namespaced databases and their owning clients.
pub struct Registry {
    namespace_prefix: String,
    databases: DashMap<String, Arc<Registration>>,
}

impl Registry {
    pub fn new(namespace_prefix: impl Into<String>) -> Self {
        Self {
            namespace_prefix: namespace_prefix.into(),
            databases: DashMap::new(),
        }
    }

    pub fn namespace_prefix(&self) -> &str {
        &self.namespace_prefix
    }

    /// The full database name for `short_name`, with the prefix applied
    /// exactly once.
    pub fn namespaced(&self, short_name: &str) -> String {
        let prefix = format!("{}_", self.namespace_prefix);
        if short_name
            .to_lowercase()
            .starts_with(&prefix.to_lowercase())
        {
            short_name.to_string()
        } else {
            format!("{prefix}{short_name}")
        }
    }

    /// Register `short_name` for `client`. Fails when another client (or
    /// the same one, twice) already registered the lowercased full name.
    pub fn register<C: StoreClient>(
        &self,
        client: &C,
        short_name: &str,
    ) -> Result<Arc<Registration>, CacheError> {
        let database = self.namespaced(short_name);
        let slot = database.to_lowercase();

        match self.databases.entry(slot) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(%database, "rejected duplicate database registration");
                Err(CacheError::DuplicateDatabase { database })
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let registration = Arc::new(Registration {
                    client_id: client.client_id(),
                    database: database.clone(),
                    caches: RwLock::new(Vec::new()),
                });
                vacant.insert(registration.clone());
                info!(%database, client = %client.client_id(), "database registered");
                Ok(registration)
            }
        }
    }

    /// Look up a registration by short or full name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Registration>> {
        let full = self.namespaced(name).to_lowercase();
        self.databases.get(&full).map(|r| r.clone())
    }

    /// Snapshot of every registration.
    pub fn registrations(&self) -> Vec<Arc<Registration>> {
        self.databases.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

static GLOBAL: RwLock<Option<Arc<Registry>>> = RwLock::new(None);

/// Install the process-wide registry. Replaces any previous instance,
/// which tests rely on for re-initialization.
pub fn enable(namespace_prefix: impl Into<String>) -> Arc<Registry> {
    let registry = Arc::new(Registry::new(namespace_prefix));
    let mut slot = GLOBAL.write();
    if slot.is_some() {
        warn!("replacing an already-enabled registry");
    }
    *slot = Some(registry.clone());
    registry
}

/// Tear down the process-wide registry.
pub fn disable() {
    *GLOBAL.write() = None;
}

/// The process-wide registry, if enabled.
pub fn global() -> Option<Arc<Registry>> {
    GLOBAL.read().clone()
}

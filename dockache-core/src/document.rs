//! The document contract.
//!
//! A cached document is an immutable record carrying a primary key, a
//! monotonic version counter, and an application payload. Mutation never
//! happens in place: every successful update mints a fresh instance through
//! [`Document::with_version`] with the counter advanced by exactly one.
//!
//! Each document also carries a [`DocBinding`] slot — a backreference to the
//! cache that materialized it. The binding is not ownership; it is a
//! set-once tag (cache name + namespaced database) used for status queries.
//! Instances whose slot was never bound are *detached*.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CacheError;

/// Identity of the cache a document was materialized by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTag {
    cache: Arc<str>,
    database: Arc<str>,
}

impl CacheTag {
    pub fn new(cache: impl Into<Arc<str>>, database: impl Into<Arc<str>>) -> Self {
        Self {
            cache: cache.into(),
            database: database.into(),
        }
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

/// Set-once backreference from a document to its owning cache.
///
/// Deserialized and freshly built documents start unbound; the cache binds
/// the slot at materialization (initial load, change-stream accept, create).
/// Binding an already-bound slot is a no-op, so clones that inherited a
/// binding keep their original tag.
#[derive(Debug, Clone, Default)]
pub struct DocBinding {
    slot: OnceLock<CacheTag>,
}

impl DocBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the slot to a cache. First bind wins.
    pub fn bind(&self, tag: CacheTag) {
        let _ = self.slot.set(tag);
    }

    pub fn tag(&self) -> Option<&CacheTag> {
        self.slot.get()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.get().is_some()
    }
}

/// Status of a document instance `(key, version)` relative to its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    /// The cache holds exactly this version.
    Fresh,
    /// The cache holds a different version of the same key.
    Stale,
    /// The cache has no entry for the key.
    Deleted,
    /// The instance is not bound to a cache.
    Detached,
}

/// Primary-key contract: hashable, totally ordered, and round-trippable
/// through a string form used for logging and resume-time id extraction.
pub trait DocKey:
    Clone + Eq + Ord + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Render the key for logs and wire addressing.
    fn to_key_string(&self) -> String;

    /// Parse a key back from its string form.
    fn from_key_string(s: &str) -> Result<Self, CacheError>;
}

/// Keys that can be drawn from a uniform random source, for
/// `create_random`. A collision implies a defect in the source.
pub trait RandomDocKey: DocKey {
    fn random() -> Self;
}

impl DocKey for String {
    fn to_key_string(&self) -> String {
        self.clone()
    }

    fn from_key_string(s: &str) -> Result<Self, CacheError> {
        Ok(s.to_string())
    }
}

impl RandomDocKey for String {
    fn random() -> Self {
        Uuid::new_v4().to_string()
    }
}

macro_rules! int_doc_key {
    ($($ty:ty),*) => {
        $(
            impl DocKey for $ty {
                fn to_key_string(&self) -> String {
                    self.to_string()
                }

                fn from_key_string(s: &str) -> Result<Self, CacheError> {
                    s.parse::<$ty>().map_err(|e| CacheError::InvalidKeyString {
                        input: s.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        )*
    };
}

int_doc_key!(i32, i64, u64);

impl DocKey for Uuid {
    fn to_key_string(&self) -> String {
        self.to_string()
    }

    fn from_key_string(s: &str) -> Result<Self, CacheError> {
        Uuid::parse_str(s).map_err(|e| CacheError::InvalidKeyString {
            input: s.to_string(),
            message: e.to_string(),
        })
    }
}

impl RandomDocKey for Uuid {
    fn random() -> Self {
        Uuid::new_v4()
    }
}

/// An immutable, keyed, versioned document storable in a cache.
///
/// Implementations are plain data types deriving `Clone`, `Serialize` and
/// `Deserialize`, with the binding slot excluded from the wire form:
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Player {
///     id: String,
///     version: i64,
///     balance: i64,
///     #[serde(skip)]
///     binding: DocBinding,
/// }
/// ```
pub trait Document:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    type Key: DocKey;

    /// Name of the key field in the document's wire form. The storage
    /// driver maps this field to the store's native id field.
    const KEY_FIELD: &'static str;

    /// Name of the version field in the document's wire form. Drivers use
    /// it for the compare-and-swap filter.
    const VERSION_FIELD: &'static str = "version";

    fn key(&self) -> &Self::Key;

    /// Monotonic per-document counter, starting at 0 and advanced by
    /// exactly 1 on every successful update.
    fn version(&self) -> i64;

    /// Mint a fresh instance carrying `version`. This is the single point
    /// where new document instances are created during updates; the update
    /// loop verifies the copy actually carries the requested version.
    fn with_version(&self, version: i64) -> Self;

    /// The backreference slot to the owning cache.
    fn binding(&self) -> &DocBinding;

    /// Structural identity: two instances denote the same document iff
    /// their keys are equal.
    fn same_identity(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn binding_is_set_once() {
        let binding = DocBinding::new();
        assert!(!binding.is_bound());

        binding.bind(CacheTag::new("players", "ns_game"));
        binding.bind(CacheTag::new("other", "ns_other"));

        let tag = binding.tag().expect("bound");
        assert_eq!(tag.cache(), "players");
        assert_eq!(tag.database(), "ns_game");
    }

    #[test]
    fn cloned_binding_keeps_tag() {
        let binding = DocBinding::new();
        binding.bind(CacheTag::new("players", "ns_game"));
        let clone = binding.clone();
        assert_eq!(clone.tag().unwrap().cache(), "players");
    }

    #[test]
    fn uuid_key_round_trip() {
        let key = Uuid::new_v4();
        let s = key.to_key_string();
        assert_eq!(Uuid::from_key_string(&s).unwrap(), key);
    }

    #[test]
    fn bad_int_key_string_is_rejected() {
        let err = i64::from_key_string("not-a-number").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKeyString { .. }));
    }

    proptest! {
        #[test]
        fn string_key_round_trip(s in ".*") {
            let k = String::from_key_string(&s).unwrap();
            prop_assert_eq!(k.to_key_string(), s);
        }

        #[test]
        fn u64_key_round_trip(n in any::<u64>()) {
            let s = n.to_key_string();
            prop_assert_eq!(u64::from_key_string(&s).unwrap(), n);
        }

        #[test]
        fn i64_key_round_trip(n in any::<i64>()) {
            let s = n.to_key_string();
            prop_assert_eq!(i64::from_key_string(&s).unwrap(), n);
        }
    }
}

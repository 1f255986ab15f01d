//! Change-stream event model.
//!
//! Events describe mutations observed on a collection, in the order the
//! store committed them. Every event carries an opaque [`ResumeToken`] that
//! bookmarks its position; the replicator persists the token of the last
//! applied event and hands it back on reconnect.

use serde_json::Value;

use dockache_core::ops::ChangeOperation;

/// Opaque bookmark into a change stream. Ordering is meaningful only to the
/// driver that issued the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResumeToken {
    pub(crate) raw: u64,
}

impl ResumeToken {
    pub(crate) fn new(raw: u64) -> Self {
        Self { raw }
    }

    #[doc(hidden)]
    pub fn for_tests(raw: u64) -> Self {
        Self { raw }
    }
}

/// A cluster-time bookmark captured before an initial load, used as the
/// resume fallback when a token has expired out of the store's retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationTime {
    pub(crate) raw: u64,
}

impl OperationTime {
    pub(crate) fn new(raw: u64) -> Self {
        Self { raw }
    }
}

/// Where to begin consuming a change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStart {
    /// From the next mutation committed after the stream opens.
    Now,
    /// From the first mutation after the captured operation time.
    OperationTime(OperationTime),
    /// From the first mutation after the bookmarked event.
    ResumeToken(ResumeToken),
}

/// One observed mutation.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// What happened.
    pub operation: ChangeOperation,

    /// Full document in wire form, present for inserts and replaces and,
    /// when the store supports full-document lookup, updates.
    pub full_document: Option<Value>,

    /// String form of the mutated document's id, present for deletes and
    /// upserts.
    pub document_key: Option<String>,

    /// Bookmark of this event.
    pub resume_token: ResumeToken,
}

impl ChangeEvent {
    /// True when the event can be applied without consulting the store:
    /// an upsert with a full payload, or a delete with a key.
    pub fn has_recoverable_payload(&self) -> bool {
        match self.operation {
            op if op.is_upsert() => self.full_document.is_some(),
            ChangeOperation::Delete => self.document_key.is_some(),
            _ => false,
        }
    }
}

/// Extract the string form of a wire-level `_id` value.
pub fn key_string_from_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_payload_classification() {
        let token = ResumeToken::new(1);
        let upsert = ChangeEvent {
            operation: ChangeOperation::Update,
            full_document: Some(serde_json::json!({"_id": "u1", "version": 3})),
            document_key: Some("u1".into()),
            resume_token: token,
        };
        assert!(upsert.has_recoverable_payload());

        let update_without_doc = ChangeEvent {
            operation: ChangeOperation::Update,
            full_document: None,
            document_key: Some("u1".into()),
            resume_token: token,
        };
        assert!(!update_without_doc.has_recoverable_payload());

        let delete = ChangeEvent {
            operation: ChangeOperation::Delete,
            full_document: None,
            document_key: Some("u1".into()),
            resume_token: token,
        };
        assert!(delete.has_recoverable_payload());

        let drop = ChangeEvent {
            operation: ChangeOperation::Drop,
            full_document: None,
            document_key: None,
            resume_token: token,
        };
        assert!(!drop.has_recoverable_payload());
    }

    #[test]
    fn id_string_extraction() {
        assert_eq!(key_string_from_id(&Value::String("u1".into())), "u1");
        assert_eq!(key_string_from_id(&serde_json::json!(42)), "42");
    }

    #[test]
    fn tokens_order_by_position() {
        assert!(ResumeToken::new(1) < ResumeToken::new(2));
        assert!(OperationTime::new(5) < OperationTime::new(9));
    }
}

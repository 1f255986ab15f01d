//! Shared operation vocabulary used by metrics and the change-stream layer.

use serde::{Deserialize, Serialize};

/// CRUD operation families the cache dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrudKind {
    Insert,
    Read,
    Update,
    Delete,
    Replace,
}

/// Outcome classes for a dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrudOutcome {
    Success,
    Empty,
    Failure,
    NotFound,
    Rejected,
    RetriesExceeded,
    DuplicatePrimaryKey,
    DuplicateUniqueIndex,
}

/// Mutation kinds a change stream can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
    Unknown,
}

impl ChangeOperation {
    /// Terminal operations end the stream; the replicator must reopen it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeOperation::Drop
                | ChangeOperation::Rename
                | ChangeOperation::DropDatabase
                | ChangeOperation::Invalidate
        )
    }

    /// Operations that carry (or can carry) a full document payload.
    pub fn is_upsert(&self) -> bool {
        matches!(
            self,
            ChangeOperation::Insert | ChangeOperation::Update | ChangeOperation::Replace
        )
    }

    /// Stable index used by fixed-size per-operation counters.
    pub fn index(&self) -> usize {
        match self {
            ChangeOperation::Insert => 0,
            ChangeOperation::Update => 1,
            ChangeOperation::Replace => 2,
            ChangeOperation::Delete => 3,
            ChangeOperation::Drop => 4,
            ChangeOperation::Rename => 5,
            ChangeOperation::DropDatabase => 6,
            ChangeOperation::Invalidate => 7,
            ChangeOperation::Unknown => 8,
        }
    }

    pub const COUNT: usize = 9;
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Replace => "replace",
            ChangeOperation::Delete => "delete",
            ChangeOperation::Drop => "drop",
            ChangeOperation::Rename => "rename",
            ChangeOperation::DropDatabase => "drop_database",
            ChangeOperation::Invalidate => "invalidate",
            ChangeOperation::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(ChangeOperation::Drop.is_terminal());
        assert!(ChangeOperation::Rename.is_terminal());
        assert!(ChangeOperation::DropDatabase.is_terminal());
        assert!(ChangeOperation::Invalidate.is_terminal());
        assert!(!ChangeOperation::Insert.is_terminal());
        assert!(!ChangeOperation::Unknown.is_terminal());
    }

    #[test]
    fn upsert_classification() {
        assert!(ChangeOperation::Insert.is_upsert());
        assert!(ChangeOperation::Update.is_upsert());
        assert!(ChangeOperation::Replace.is_upsert());
        assert!(!ChangeOperation::Delete.is_upsert());
    }

    #[test]
    fn counter_indexes_are_distinct() {
        let mut seen = [false; ChangeOperation::COUNT];
        for op in [
            ChangeOperation::Insert,
            ChangeOperation::Update,
            ChangeOperation::Replace,
            ChangeOperation::Delete,
            ChangeOperation::Drop,
            ChangeOperation::Rename,
            ChangeOperation::DropDatabase,
            ChangeOperation::Invalidate,
            ChangeOperation::Unknown,
        ] {
            assert!(!seen[op.index()]);
            seen[op.index()] = true;
        }
    }
}

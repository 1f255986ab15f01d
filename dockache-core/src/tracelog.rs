//! File-backed trace logger.
//!
//! Failures inside the update loop and the replicator are logged in two
//! tiers: a one-line console pointer at warn level, and a detail file under
//! the configured directory carrying the full error chain. One file per
//! (cache, timestamp) keeps incidents separable without grepping a shared
//! log.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, warn};

/// Two-tier trace writer. With no directory configured, only the console
/// line is emitted.
#[derive(Debug, Clone, Default)]
pub struct TraceLogger {
    dir: Option<PathBuf>,
}

impl TraceLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A logger that only emits the console line.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Record a failure for `cache` with its full cause chain. Returns the
    /// path of the written detail file, if any.
    pub fn record(
        &self,
        cache: &str,
        context: &str,
        failure: &(dyn std::error::Error + 'static),
    ) -> Option<PathBuf> {
        let report = render_report(cache, context, failure);

        let Some(dir) = &self.dir else {
            warn!(cache, context, error = %failure, "operation failed (trace files disabled)");
            return None;
        };

        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let path = dir.join(format!("{cache}-{stamp}.log"));

        match fs::create_dir_all(dir).and_then(|_| fs::write(&path, &report)) {
            Ok(()) => {
                warn!(cache, context, error = %failure, trace = %path.display(),
                      "operation failed, full trace written");
                Some(path)
            }
            Err(io) => {
                // Fall back to inlining the whole report on the console.
                error!(cache, context, write_error = %io, "trace file write failed\n{report}");
                None
            }
        }
    }
}

fn render_report(
    cache: &str,
    context: &str,
    failure: &(dyn std::error::Error + 'static),
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "time:    {}", Utc::now().to_rfc3339());
    let _ = writeln!(out, "cache:   {cache}");
    let _ = writeln!(out, "context: {context}");
    let _ = writeln!(out, "error:   {failure}");

    let mut depth = 0;
    let mut source = failure.source();
    while let Some(cause) = source {
        depth += 1;
        let _ = writeln!(out, "  cause {depth}: {cause}");
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, KeyViolation, StorageError};

    #[test]
    fn writes_detail_file_with_cause_chain() {
        let dir = std::env::temp_dir().join(format!("dockache-trace-{}", uuid::Uuid::new_v4()));
        let logger = TraceLogger::new(&dir);

        let failure = CacheError::Store(StorageError::DuplicateKey {
            violation: KeyViolation::Unique("name".into()),
        });
        let path = logger
            .record("players", "update transaction", &failure)
            .expect("file written");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("cache:   players"));
        assert!(contents.contains("update transaction"));
        assert!(contents.contains("unique index 'name'"));
        assert!(contents.contains("cause 1:"));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = TraceLogger::disabled();
        let failure = CacheError::IllegalKeyModification;
        assert!(logger.record("players", "update", &failure).is_none());
    }
}

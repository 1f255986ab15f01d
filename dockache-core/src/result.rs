//! Result algebra for cache operations.
//!
//! Every public cache operation resolves to one of three closed sums rather
//! than a bare `Result`, so callers can pattern-match the full outcome space
//! of the operation they invoked:
//!
//! - [`DefiniteResult`]: the operation either produced a value or failed.
//! - [`OptionalResult`]: as above, plus a distinguished `Empty` outcome for
//!   lookups that found nothing (absence is not an error).
//! - [`RejectableResult`]: as definite, plus a `Rejected` outcome raised
//!   cooperatively by the caller's own update closure.
//!
//! Failures always carry the original [`CacheError`] cause; nothing is
//! stringified away at this boundary.

use crate::error::{CacheError, RejectUpdate};

/// Outcome of an operation that must produce a value.
#[derive(Debug)]
pub enum DefiniteResult<T> {
    /// The operation completed and produced a value.
    Success(T),
    /// The operation failed; the original cause is preserved.
    Failure(CacheError),
}

/// Outcome of a lookup that may legitimately find nothing.
#[derive(Debug)]
pub enum OptionalResult<T> {
    /// The lookup found a value.
    Success(T),
    /// The lookup completed but found nothing.
    Empty,
    /// The lookup failed; the original cause is preserved.
    Failure(CacheError),
}

/// Outcome of an update whose closure may decline to proceed.
#[derive(Debug)]
pub enum RejectableResult<T> {
    /// The update committed and produced the new document.
    Success(T),
    /// The update failed; the original cause is preserved.
    Failure(CacheError),
    /// The update closure rejected the update; no store I/O happened.
    Rejected(RejectUpdate),
}

impl<T> DefiniteResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// The produced value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(v) => Some(v),
            Self::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Success(_) => None,
            Self::Failure(e) => Some(e),
        }
    }

    /// Collapse into a plain `Result`, surfacing the failure cause.
    pub fn into_result(self) -> Result<T, CacheError> {
        match self {
            Self::Success(v) => Ok(v),
            Self::Failure(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DefiniteResult<U> {
        match self {
            Self::Success(v) => DefiniteResult::Success(f(v)),
            Self::Failure(e) => DefiniteResult::Failure(e),
        }
    }
}

impl<T> OptionalResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Failure(e) => Some(e),
            _ => None,
        }
    }

    /// Collapse into `Result<Option<T>>`; `Empty` becomes `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, CacheError> {
        match self {
            Self::Success(v) => Ok(Some(v)),
            Self::Empty => Ok(None),
            Self::Failure(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OptionalResult<U> {
        match self {
            Self::Success(v) => OptionalResult::Success(f(v)),
            Self::Empty => OptionalResult::Empty,
            Self::Failure(e) => OptionalResult::Failure(e),
        }
    }
}

impl<T> RejectableResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Failure(e) => Some(e),
            _ => None,
        }
    }

    /// The rejection sentinel, if the update closure declined.
    pub fn rejection(&self) -> Option<&RejectUpdate> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }

    /// Collapse into `Result<Option<T>>`; `Rejected` becomes `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, CacheError> {
        match self {
            Self::Success(v) => Ok(Some(v)),
            Self::Rejected(_) => Ok(None),
            Self::Failure(e) => Err(e),
        }
    }
}

impl<T> From<Result<T, CacheError>> for DefiniteResult<T> {
    fn from(r: Result<T, CacheError>) -> Self {
        match r {
            Ok(v) => Self::Success(v),
            Err(e) => Self::Failure(e),
        }
    }
}

impl<T> From<Result<Option<T>, CacheError>> for OptionalResult<T> {
    fn from(r: Result<Option<T>, CacheError>) -> Self {
        match r {
            Ok(Some(v)) => Self::Success(v),
            Ok(None) => Self::Empty,
            Err(e) => Self::Failure(e),
        }
    }
}

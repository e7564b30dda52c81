use std::time::Duration;

use thiserror::Error;

/// An error reported by a [`CacheBackend`](super::CacheBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// An `add` found the key already present.
    ///
    /// This is the expected outcome of lease contention, not a malfunction.
    #[error("key already exists")]
    AlreadyExists,
    /// The operation did not finish within the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The backend does not implement the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// The backend could not be reached or failed otherwise.
    ///
    /// The attached string contains the backend's description of the problem.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A bulk read answered with a different number of values than keys were requested.
    #[error("bulk read returned {actual} values for {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },
}

pub type BackendResult<T = ()> = Result<T, BackendError>;

/// A failure of the caching layer itself.
///
/// These errors are never returned to callers of the cache wrappers. They are logged and
/// counted via [`absorb`](Self::absorb), and the call continues as if the cache was empty or
/// absent.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read from cache")]
    Read(#[source] BackendError),
    #[error("failed to decode cached value")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode value for caching")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write to cache")]
    Write(#[source] BackendError),
    /// The lease lock could neither be acquired nor waited on.
    #[error("lease lock unavailable")]
    LockUnavailable(#[source] BackendError),
}

impl CacheError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Write(_) => "write",
            Self::LockUnavailable(_) => "lock",
        }
    }

    /// Logs this error and records it in the `caches.error` metric.
    pub fn absorb(self, cache: &str) {
        let dynerr: &dyn std::error::Error = &self; // tracing expects a `&dyn Error`
        tracing::warn!(error = dynerr, cache, "cache operation failed");
        metric!(counter("caches.error") += 1, "cache" => cache, "kind" => self.kind());
    }
}

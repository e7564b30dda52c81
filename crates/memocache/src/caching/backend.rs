use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use super::cache_error::{BackendError, BackendResult};

/// The storage operations the cache wrappers are built on.
///
/// Implementations must be safe for concurrent use by many callers, possibly spread across
/// processes when the storage is remote. `ttl` of `None` means the backend's default expiration.
///
/// Only [`add`](Self::add) is required to be atomic. It is what the lease lock relies on.
pub trait CacheBackend: fmt::Debug + Send + Sync + 'static {
    /// Returns the value stored under `key`, if any.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, BackendResult<Option<Bytes>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, BackendResult>;

    /// Stores `value` under `key` only if the key is absent.
    ///
    /// Fails with [`BackendError::AlreadyExists`] if the key is present.
    fn add<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, BackendResult>;

    /// Deletes `key`, returning whether it was present.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, BackendResult<bool>>;

    /// Returns the values of all `keys`, in the same order.
    fn multi_get<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, BackendResult<Vec<Option<Bytes>>>> {
        Box::pin(async move {
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                values.push(self.get(key).await?);
            }
            Ok(values)
        })
    }

    /// Stores all `pairs`.
    fn multi_set<'a>(
        &'a self,
        pairs: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, BackendResult> {
        Box::pin(async move {
            for (key, value) in pairs {
                self.set(&key, value, ttl).await?;
            }
            Ok(())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, BackendResult<bool>> {
        Box::pin(async move { Ok(self.get(key).await?.is_some()) })
    }

    /// Releases resources held by the backend.
    fn close(&self) -> BoxFuture<'_, BackendResult> {
        Box::pin(async { Ok(()) })
    }
}

/// A shared handle to a [`CacheBackend`].
pub type CacheRef = Arc<dyn CacheBackend>;

/// Bounds a backend operation by `timeout`, if one is given.
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    operation: impl Future<Output = BackendResult<T>>,
) -> BackendResult<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, operation)
            .await
            .unwrap_or(Err(BackendError::Timeout(timeout))),
        None => operation.await,
    }
}

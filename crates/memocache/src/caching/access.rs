use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::backend::{CacheRef, with_timeout};
use super::cache_error::{BackendError, CacheError};
use super::cache_key::CacheKey;
use super::lease::LeaseGuard;

/// An in-flight write-back of freshly computed values.
///
/// The caller decides whether to await it or to let it run detached via [`finish`](Self::finish).
/// Failures are absorbed either way.
#[must_use = "a pending write does nothing unless finished"]
pub struct PendingWrite {
    future: Option<BoxFuture<'static, ()>>,
}

impl PendingWrite {
    fn new(future: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            future: Some(Box::pin(future)),
        }
    }

    /// A write that has nothing to do.
    pub fn empty() -> Self {
        Self { future: None }
    }

    /// Releases `guard` once the write completed.
    pub fn and_release(self, guard: LeaseGuard) -> Self {
        Self::new(async move {
            if let Some(future) = self.future {
                future.await;
            }
            guard.release().await;
        })
    }

    /// Awaits the write, or spawns it onto the runtime when `wait` is false.
    ///
    /// A spawned write runs to completion independently of the caller.
    pub async fn finish(self, wait: bool) {
        let Some(future) = self.future else {
            return;
        };
        if wait {
            future.await;
        } else {
            tokio::spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
        }
    }
}

/// Backend access shared by the wrappers.
///
/// Values are encoded as JSON. Every failure is absorbed: reads degrade to misses and writes
/// are skipped.
#[derive(Clone, Debug)]
pub(crate) struct CacheAccess {
    pub name: Arc<str>,
    pub cache: CacheRef,
    pub ttl: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl CacheAccess {
    pub fn new(name: Arc<str>, cache: CacheRef) -> Self {
        Self {
            name,
            cache,
            ttl: None,
            timeout: None,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Option<T> {
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                CacheError::Decode(err).absorb(&self.name);
                None
            }
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Option<Bytes> {
        match serde_json::to_vec(value) {
            Ok(bytes) => Some(bytes.into()),
            Err(err) => {
                CacheError::Encode(err).absorb(&self.name);
                None
            }
        }
    }

    /// Reads and decodes the value under `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        match with_timeout(self.timeout, self.cache.get(key.as_str())).await {
            Ok(Some(bytes)) => self.decode(&bytes),
            Ok(None) => None,
            Err(err) => {
                CacheError::Read(err).absorb(&self.name);
                None
            }
        }
    }

    /// Reads and decodes the values of all `keys` in one round trip.
    ///
    /// A failing bulk read reports every key as missing. So does a bulk read that does not
    /// answer with exactly one value per key.
    pub async fn multi_get<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        let result = with_timeout(self.timeout, self.cache.multi_get(keys))
            .await
            .and_then(|values| {
                if values.len() == keys.len() {
                    Ok(values)
                } else {
                    Err(BackendError::LengthMismatch {
                        expected: keys.len(),
                        actual: values.len(),
                    })
                }
            });
        match result {
            Ok(values) => values
                .into_iter()
                .map(|bytes| bytes.and_then(|bytes| self.decode(&bytes)))
                .collect(),
            Err(err) => {
                CacheError::Read(err).absorb(&self.name);
                keys.iter().map(|_| None).collect()
            }
        }
    }

    /// Prepares writing `value` under `key`.
    pub fn set(&self, key: &CacheKey, value: Bytes) -> PendingWrite {
        let access = self.clone();
        let key = key.clone();
        PendingWrite::new(async move {
            let write = access.cache.set(key.as_str(), value, access.ttl);
            match with_timeout(access.timeout, write).await {
                Ok(()) => metric!(counter("caches.write") += 1, "cache" => &access.name),
                Err(err) => CacheError::Write(err).absorb(&access.name),
            }
        })
    }

    /// Prepares writing all `pairs` in one round trip.
    pub fn multi_set(&self, pairs: Vec<(String, Bytes)>) -> PendingWrite {
        if pairs.is_empty() {
            return PendingWrite::empty();
        }
        let access = self.clone();
        PendingWrite::new(async move {
            let count = pairs.len() as i64;
            let write = access.cache.multi_set(pairs, access.ttl);
            match with_timeout(access.timeout, write).await {
                Ok(()) => metric!(counter("caches.write") += count, "cache" => &access.name),
                Err(err) => CacheError::Write(err).absorb(&access.name),
            }
        })
    }
}

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;

use super::backend::CacheBackend;
use super::cache_error::{BackendError, BackendResult};
use crate::config::MemoryCacheConfig;

/// A value saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct StoredValue {
    /// When to evict this value, if ever.
    deadline: Option<Instant>,
    /// The actual data.
    data: Bytes,
}

type InMemoryCache = moka::future::Cache<String, StoredValue>;

/// A struct implementing [`moka::Expiry`] that uses the [`StoredValue`] deadline as the explicit
/// expiration time.
struct ValueExpiration;

impl ValueExpiration {
    fn remaining(value: &StoredValue, current_time: Instant) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| deadline.saturating_duration_since(current_time))
    }
}

impl moka::Expiry<String, StoredValue> for ValueExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        current_time: Instant,
    ) -> Option<Duration> {
        Self::remaining(value, current_time)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Self::remaining(value, current_time)
    }
}

/// A [`CacheBackend`] keeping values in process memory.
///
/// `add` is atomic within the process, which makes this backend suitable for coordinating
/// concurrent callers of a single process.
pub struct MemoryCache {
    config: MemoryCacheConfig,
    cache: InMemoryCache,
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("config", &self.config)
            .field("in-memory items", &self.cache.entry_count())
            .finish()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(config.capacity)
            .name("memocache")
            .expire_after(ValueExpiration)
            // NOTE: we count the bookkeeping structures to the weight as well
            .weigher(|k, v| {
                let size = k.len() + v.data.len() + std::mem::size_of::<StoredValue>();
                u32::try_from(size).unwrap_or(u32::MAX)
            })
            .build();

        Self { config, cache }
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// The approximate number of stored values.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    fn build_key(&self, key: &str) -> String {
        match &self.config.namespace {
            Some(namespace) => format!("{namespace}{key}"),
            None => key.to_owned(),
        }
    }

    fn stored(&self, data: Bytes, ttl: Option<Duration>) -> StoredValue {
        let deadline = ttl
            .or(self.config.default_ttl)
            .map(|ttl| Instant::now() + ttl);
        StoredValue { deadline, data }
    }
}

impl CacheBackend for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, BackendResult<Option<Bytes>>> {
        Box::pin(async move {
            let key = self.build_key(key);
            Ok(self.cache.get(&key).await.map(|value| value.data))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, BackendResult> {
        Box::pin(async move {
            let key = self.build_key(key);
            self.cache.insert(key, self.stored(value, ttl)).await;
            Ok(())
        })
    }

    fn add<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, BackendResult> {
        Box::pin(async move {
            let key = self.build_key(key);
            let entry = self
                .cache
                .entry(key)
                .or_insert(self.stored(value, ttl))
                .await;
            if entry.is_fresh() {
                Ok(())
            } else {
                Err(BackendError::AlreadyExists)
            }
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, BackendResult<bool>> {
        Box::pin(async move {
            let key = self.build_key(key);
            Ok(self.cache.remove(&key).await.is_some())
        })
    }

    fn close(&self) -> BoxFuture<'_, BackendResult> {
        Box::pin(async move {
            self.cache.run_pending_tasks().await;
            Ok(())
        })
    }
}

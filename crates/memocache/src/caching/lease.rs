//! A lease lock built on the atomic `add` of a [`CacheBackend`](super::CacheBackend).
//!
//! The holder writes a unique token under the lock key with an expiry (the lease). Everybody
//! else becomes a follower: it polls the guarded value until it shows up, and retries the lease
//! once the maximum wait elapsed. A crashed holder cannot block anybody longer than the lease.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use uuid::Uuid;

use super::backend::{CacheRef, with_timeout};
use super::cache_error::{BackendError, CacheError};
use super::cache_key::CacheKey;
use crate::config::LeaseConfig;

/// The outcome of [`LeaseLock::acquire`].
#[derive(Debug)]
pub enum Acquisition {
    /// The lease is held by this caller, which is now the only one computing the value.
    Held(LeaseGuard),
    /// Another holder finished while this caller was waiting. Contains the raw value.
    Ready(Bytes),
    /// The backend failed while waiting. The caller should proceed without protection.
    Unprotected(BackendError),
}

/// Guards the computation of a single [`CacheKey`] across all callers sharing a backend.
#[derive(Debug)]
pub struct LeaseLock {
    name: Arc<str>,
    cache: CacheRef,
    key: CacheKey,
    lock_key: String,
    config: LeaseConfig,
    timeout: Option<Duration>,
}

impl LeaseLock {
    pub fn new(name: Arc<str>, cache: CacheRef, key: CacheKey, config: LeaseConfig) -> Self {
        let lock_key = key.lock_key();
        Self {
            name,
            cache,
            key,
            lock_key,
            config,
            timeout: None,
        }
    }

    /// Bounds every backend operation of this lock.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Takes the lease, or waits for whoever holds it.
    ///
    /// Any failing `add` is treated as contention, since an outage cannot be told apart from
    /// another holder reliably. An `add` that failed for another reason than an existing lock
    /// gets a single round of polling. If that round ends without a value, or the backend fails
    /// while polling, the caller gets [`Acquisition::Unprotected`]. Waiting on a lock held
    /// elsewhere has no overall deadline.
    pub async fn acquire(&self) -> Acquisition {
        loop {
            match self.try_acquire().await {
                Ok(guard) => return Acquisition::Held(guard),
                Err(BackendError::AlreadyExists) => {
                    tracing::trace!(lock_key = %self.lock_key, "lease is held elsewhere");
                    metric!(counter("caches.lease.contended") += 1, "cache" => &self.name);
                    match self.wait_for_value().await {
                        Ok(Some(value)) => return Acquisition::Ready(value),
                        Ok(None) => continue,
                        Err(err) => return Acquisition::Unprotected(err),
                    }
                }
                Err(err) => {
                    {
                        let dynerr: &dyn std::error::Error = &err;
                        tracing::debug!(
                            error = dynerr,
                            lock_key = %self.lock_key,
                            "failed to add lease"
                        );
                    }
                    metric!(counter("caches.lease.contended") += 1, "cache" => &self.name);
                    // one round of waiting, another `add` would most likely fail the same way
                    return match self.wait_for_value().await {
                        Ok(Some(value)) => Acquisition::Ready(value),
                        Ok(None) => Acquisition::Unprotected(err),
                        Err(poll_err) => Acquisition::Unprotected(poll_err),
                    };
                }
            }
        }
    }

    /// Takes the lease if it is free, without waiting.
    ///
    /// An existing lock is reported as [`BackendError::AlreadyExists`].
    pub async fn try_acquire(&self) -> Result<LeaseGuard, BackendError> {
        let token = Bytes::from(Uuid::new_v4().to_string());
        let add = self
            .cache
            .add(&self.lock_key, token.clone(), Some(self.config.lease));
        with_timeout(self.timeout, add).await?;

        metric!(counter("caches.lease.acquired") += 1, "cache" => &self.name);
        tracing::trace!(lock_key = %self.lock_key, "acquired lease");
        Ok(LeaseGuard {
            name: Arc::clone(&self.name),
            cache: Arc::clone(&self.cache),
            lock_key: self.lock_key.clone(),
            token,
            timeout: self.timeout,
            released: false,
        })
    }

    /// Polls the guarded value until it appears or the maximum wait elapsed.
    async fn wait_for_value(&self) -> Result<Option<Bytes>, BackendError> {
        let deadline = Instant::now() + self.config.max_wait();
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let get = self.cache.get(self.key.as_str());
            if let Some(value) = with_timeout(self.timeout, get).await? {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

/// Proof of holding a lease.
///
/// Call [`release`](Self::release) at the end of the critical section. A guard dropped without
/// being released (because the caller was cancelled or panicked) releases in a spawned task.
#[derive(Debug)]
pub struct LeaseGuard {
    name: Arc<str>,
    cache: CacheRef,
    lock_key: String,
    token: Bytes,
    timeout: Option<Duration>,
    released: bool,
}

impl LeaseGuard {
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Deletes the lock key, unless the lease expired and was taken by someone else.
    pub async fn release(mut self) {
        self.released = true;
        release_lease(
            &self.name,
            &self.cache,
            &self.lock_key,
            &self.token,
            self.timeout,
        )
        .await;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(lock_key = %self.lock_key, "lease left to expire");
            return;
        };

        let name = Arc::clone(&self.name);
        let cache = Arc::clone(&self.cache);
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = self.token.clone();
        let timeout = self.timeout;
        runtime.spawn(async move {
            release_lease(&name, &cache, &lock_key, &token, timeout).await;
        });
    }
}

async fn release_lease(
    name: &str,
    cache: &CacheRef,
    lock_key: &str,
    token: &Bytes,
    timeout: Option<Duration>,
) {
    let current = match with_timeout(timeout, cache.get(lock_key)).await {
        Ok(current) => current,
        Err(err) => {
            CacheError::Write(err).absorb(name);
            return;
        }
    };
    if current.as_ref() != Some(token) {
        tracing::debug!(lock_key, "lease expired before release");
        return;
    }

    match with_timeout(timeout, cache.remove(lock_key)).await {
        Ok(_) => metric!(counter("caches.lease.released") += 1, "cache" => name),
        Err(err) => CacheError::Write(err).absorb(name),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::caching::{CacheBackend, MemoryCache};
    use crate::test::MockCache;

    fn config() -> LeaseConfig {
        LeaseConfig {
            lease: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            max_wait: None,
        }
    }

    fn lock(cache: CacheRef, key: &str) -> LeaseLock {
        LeaseLock::new("test".into(), cache, CacheKey::from(key), config())
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let cache: CacheRef = Arc::new(MemoryCache::default());
        let lock = lock(cache.clone(), "key");
        assert_eq!(lock.lock_key(), "key-lock");

        let Acquisition::Held(guard) = lock.acquire().await else {
            panic!("expected to hold the lease");
        };
        assert!(cache.exists("key-lock").await.unwrap());

        guard.release().await;
        assert!(!cache.exists("key-lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_follower_receives_value() {
        let cache: CacheRef = Arc::new(MemoryCache::default());
        let Acquisition::Held(guard) = lock(cache.clone(), "key").acquire().await else {
            panic!("expected to hold the lease");
        };

        let writer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cache.set("key", Bytes::from_static(b"42"), None).await.unwrap();
            guard.release().await;
        };
        let follower = lock(cache.clone(), "key");
        let (acquisition, ()) = tokio::join!(follower.acquire(), writer);

        match acquisition {
            Acquisition::Ready(value) => assert_eq!(value, Bytes::from_static(b"42")),
            other => panic!("unexpected acquisition: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_follower_takes_over_released_lease() {
        let cache: CacheRef = Arc::new(MemoryCache::default());
        let Acquisition::Held(guard) = lock(cache.clone(), "key").acquire().await else {
            panic!("expected to hold the lease");
        };

        // the holder gives up without writing a value
        let holder = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            guard.release().await;
        };
        let follower = LeaseLock::new(
            "test".into(),
            cache.clone(),
            CacheKey::from("key"),
            LeaseConfig {
                max_wait: Some(Duration::from_millis(50)),
                ..config()
            },
        );
        let (acquisition, ()) = tokio::join!(follower.acquire(), holder);

        assert!(matches!(acquisition, Acquisition::Held(_)));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let cache: CacheRef = Arc::new(MemoryCache::default());
        let short = LeaseConfig {
            lease: Duration::from_millis(30),
            poll_interval: Duration::from_millis(10),
            max_wait: Some(Duration::from_millis(20)),
        };
        let first = LeaseLock::new("test".into(), cache.clone(), "key".into(), short);
        let Acquisition::Held(stale) = first.acquire().await else {
            panic!("expected to hold the lease");
        };

        let second = LeaseLock::new("test".into(), cache.clone(), "key".into(), short);
        let Acquisition::Held(fresh) = second.acquire().await else {
            panic!("expected to take over the expired lease");
        };

        // the stale holder must not remove its successor's lock
        stale.release().await;
        assert!(cache.exists("key-lock").await.unwrap());
        fresh.release().await;
        assert!(!cache.exists("key-lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unprotected() {
        let cache = Arc::new(MockCache::new());
        cache.fail_add(true);
        cache.fail_get(true);

        let acquisition = lock(cache.clone(), "key").acquire().await;
        assert!(matches!(
            acquisition,
            Acquisition::Unprotected(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_add_failure_follows() {
        // A failing add alone is treated like contention.
        let cache = Arc::new(MockCache::new());
        cache.fail_add(true);
        cache
            .inner()
            .set("key", Bytes::from_static(b"1"), None)
            .await
            .unwrap();

        let acquisition = lock(cache.clone(), "key").acquire().await;
        assert!(matches!(acquisition, Acquisition::Ready(_)));
        assert_eq!(cache.calls().add, 1);
    }

    #[tokio::test]
    async fn test_add_failure_without_value_is_unprotected() {
        let cache = Arc::new(MockCache::new());
        cache.fail_add(true);

        let acquisition = tokio::time::timeout(
            Duration::from_secs(5),
            lock(cache.clone(), "key").acquire(),
        )
        .await
        .unwrap();
        assert!(matches!(
            acquisition,
            Acquisition::Unprotected(BackendError::Unavailable(_))
        ));
        assert_eq!(cache.calls().add, 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let cache: CacheRef = Arc::new(MemoryCache::default());
        let Acquisition::Held(guard) = lock(cache.clone(), "key").acquire().await else {
            panic!("expected to hold the lease");
        };

        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cache.exists("key-lock").await.unwrap());
    }

    async fn contend(cache: CacheRef, holders: &AtomicUsize, max_holders: &AtomicUsize) {
        let config = LeaseConfig {
            max_wait: Some(Duration::from_millis(30)),
            ..config()
        };
        let lock = LeaseLock::new("test".into(), cache, "key".into(), config);
        if let Acquisition::Held(guard) = lock.acquire().await {
            let current = holders.fetch_add(1, Ordering::SeqCst) + 1;
            max_holders.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            guard.release().await;
        }
    }

    #[tokio::test]
    async fn test_single_holder() {
        let cache: CacheRef = Arc::new(MemoryCache::default());
        let holders = AtomicUsize::new(0);
        let max_holders = AtomicUsize::new(0);

        futures::future::join_all(
            (0..5).map(|_| contend(cache.clone(), &holders, &max_holders)),
        )
        .await;

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    }
}

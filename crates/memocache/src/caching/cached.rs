use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::access::{CacheAccess, PendingWrite};
use super::args::{CallArgs, CallOptions, Signature};
use super::backend::CacheRef;
use super::cache_error::{BackendError, CacheError};
use super::cache_key::{CacheKey, KeyStrategy};
use super::lease::{Acquisition, LeaseGuard, LeaseLock};
use crate::config::{CacheDefaults, LeaseConfig};

/// Caches the result of a single-value computation.
///
/// On every [`call`](Self::call) the wrapper derives a [`CacheKey`], returns the cached value
/// on a hit, and otherwise runs the computation and writes its result back. With stampede
/// protection, concurrent misses for the same key are funneled through a [`LeaseLock`] so that
/// only one caller computes.
///
/// Failures of the cache never reach the caller. Errors of the computation are returned as-is
/// and are never cached.
pub struct Cached<F> {
    func: F,
    signature: Signature,
    access: CacheAccess,
    key_strategy: KeyStrategy,
    noself: bool,
    lease: Option<LeaseConfig>,
}

impl<F> fmt::Debug for Cached<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("name", &self.access.name)
            .field("cache", &self.access.cache)
            .field("ttl", &self.access.ttl)
            .field("key_strategy", &self.key_strategy)
            .field("noself", &self.noself)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl<F> Cached<F> {
    /// Wraps `func`, which is identified as `name` in cache keys and metrics.
    pub fn new(name: impl Into<Arc<str>>, cache: CacheRef, func: F) -> Self {
        Self {
            func,
            signature: Signature::default(),
            access: CacheAccess::new(name.into(), cache),
            key_strategy: KeyStrategy::default(),
            noself: false,
            lease: None,
        }
    }

    /// Wraps `func` with stampede protection, using leases of the given duration.
    pub fn with_stampede_protection(
        name: impl Into<Arc<str>>,
        cache: CacheRef,
        func: F,
        lease: Duration,
    ) -> Self {
        Self::new(name, cache, func).with_lease(LeaseConfig::with_lease(lease))
    }

    /// Applies ttl and timeout from `defaults`.
    ///
    /// With stampede protection enabled, the polling settings are taken from `defaults` as well.
    /// The lease duration given to [`with_stampede_protection`](Self::with_stampede_protection)
    /// or [`with_lease`](Self::with_lease) is kept.
    pub fn with_config(mut self, defaults: &CacheDefaults) -> Self {
        self.access.ttl = defaults.ttl;
        self.access.timeout = defaults.timeout;
        self.lease = self.lease.map(|lease| LeaseConfig {
            lease: lease.lease,
            ..defaults.lease
        });
        self
    }

    /// Sets the time-to-live of written values. `None` uses the backend's default.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.access.ttl = ttl;
        self
    }

    /// Bounds every single backend operation.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.access.timeout = timeout;
        self
    }

    /// Enables stampede protection.
    ///
    /// Called after [`with_config`](Self::with_config), all of `lease` is used as given.
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Declares the parameters of the computation.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// Uses `build` to derive cache keys. Its output is used verbatim.
    pub fn with_key_builder(
        mut self,
        build: impl Fn(&str, &CallArgs) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_strategy = KeyStrategy::Custom(Arc::new(build));
        self
    }

    /// Derives cache keys from the resolved parameters instead of the raw arguments.
    pub fn key_by_parameters(mut self) -> Self {
        self.key_strategy = KeyStrategy::Parameters;
        self
    }

    /// Leaves the first positional argument out of the cache key.
    pub fn noself(mut self, noself: bool) -> Self {
        self.noself = noself;
        self
    }

    pub fn name(&self) -> &str {
        &self.access.name
    }

    pub fn cache(&self) -> &CacheRef {
        &self.access.cache
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.access.ttl
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.access.timeout
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    pub fn is_noself(&self) -> bool {
        self.noself
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The lease settings, if stampede protection is enabled.
    pub fn lease(&self) -> Option<&LeaseConfig> {
        self.lease.as_ref()
    }

    /// The key a call with `args` is cached under.
    pub fn cache_key(&self, args: &CallArgs) -> CacheKey {
        self.key_strategy
            .build(&self.access.name, &self.signature, args, self.noself)
    }
}

impl<F, Fut, T, E> Cached<F>
where
    F: Fn(CallArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Serialize + DeserializeOwned + Send,
    E: Send,
{
    /// Returns the cached value for `args`, or computes and caches it.
    pub async fn call(&self, args: CallArgs, options: CallOptions) -> Result<T, E> {
        let key = self.cache_key(&args);
        let name = &*self.access.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        if options.cache_read {
            if let Some(value) = self.access.get(&key).await {
                metric!(counter("caches.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, %key, "cache hit");
                return Ok(value);
            }
            metric!(counter("caches.miss") += 1, "cache" => name);
        }

        match self.lease {
            Some(lease) if options.cache_read => {
                self.call_protected(key, args, options, lease).await
            }
            Some(lease) => self.refresh_protected(key, args, options, lease).await,
            None => self.compute_and_store(key, args, options, None).await,
        }
    }

    fn lease_lock(&self, key: &CacheKey, lease: LeaseConfig) -> LeaseLock {
        LeaseLock::new(
            Arc::clone(&self.access.name),
            Arc::clone(&self.access.cache),
            key.clone(),
            lease,
        )
        .with_timeout(self.access.timeout)
    }

    /// Recomputes without reading, holding the lease if it is free.
    ///
    /// A forced refresh never waits. If the lease is held elsewhere, it computes anyway and
    /// leaves the foreign lock alone.
    async fn refresh_protected(
        &self,
        key: CacheKey,
        args: CallArgs,
        options: CallOptions,
        lease: LeaseConfig,
    ) -> Result<T, E> {
        let guard = match self.lease_lock(&key, lease).try_acquire().await {
            Ok(guard) => Some(guard),
            Err(BackendError::AlreadyExists) => {
                tracing::trace!(cache = &*self.access.name, %key, "refreshing despite held lease");
                None
            }
            Err(err) => {
                CacheError::LockUnavailable(err).absorb(&self.access.name);
                None
            }
        };
        self.compute_and_store(key, args, options, guard).await
    }

    async fn call_protected(
        &self,
        key: CacheKey,
        args: CallArgs,
        options: CallOptions,
        lease: LeaseConfig,
    ) -> Result<T, E> {
        match self.lease_lock(&key, lease).acquire().await {
            Acquisition::Held(guard) => {
                // another holder may have finished between our miss and taking the lease
                if let Some(value) = self.access.get(&key).await {
                    guard.release().await;
                    return Ok(value);
                }
                self.compute_and_store(key, args, options, Some(guard)).await
            }
            Acquisition::Ready(bytes) => match self.access.decode(&bytes) {
                Some(value) => Ok(value),
                None => self.compute_and_store(key, args, options, None).await,
            },
            Acquisition::Unprotected(err) => {
                CacheError::LockUnavailable(err).absorb(&self.access.name);
                self.compute_and_store(key, args, options, None).await
            }
        }
    }

    /// Runs the computation and writes its result back.
    ///
    /// A held lease is released once the write-back is done, or right away if the
    /// computation fails.
    async fn compute_and_store(
        &self,
        key: CacheKey,
        args: CallArgs,
        options: CallOptions,
        guard: Option<LeaseGuard>,
    ) -> Result<T, E> {
        let name = &*self.access.name;
        metric!(counter("caches.computation") += 1, "cache" => name);
        tracing::trace!(cache = name, %key, "computing");

        let start = Instant::now();
        let result = (self.func)(args).await;
        metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => name);

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                if let Some(guard) = guard {
                    guard.release().await;
                }
                return Err(err);
            }
        };

        let mut write = PendingWrite::empty();
        if options.cache_write {
            if let Some(bytes) = self.access.encode(&value) {
                write = self.access.set(&key, bytes);
            }
        }
        if let Some(guard) = guard {
            write = write.and_release(guard);
        }
        write.finish(options.wait_for_write).await;

        Ok(value)
    }
}

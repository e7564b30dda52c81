use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::access::CacheAccess;
use super::args::{CallArgs, CallOptions, Signature};
use super::backend::CacheRef;
use crate::config::CacheDefaults;

/// A caller-supplied function deriving the cache key of a single requested key.
///
/// It receives the requested key, the target name, and the full call arguments.
pub type MultiKeyBuilderFn<K> = Arc<dyn Fn(&K, &str, &CallArgs) -> String + Send + Sync>;

/// The requested keys of a call, located in its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPartition<K> {
    keys: Vec<K>,
    raw_keys: Vec<Value>,
    cache_keys: Vec<String>,
    args: CallArgs,
    index: Option<usize>,
}

impl<K> KeyPartition<K> {
    fn empty(args: CallArgs) -> Self {
        Self {
            keys: Vec::new(),
            raw_keys: Vec::new(),
            cache_keys: Vec::new(),
            args,
            index: None,
        }
    }

    /// The requested keys, in request order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// The cache key of each requested key, in the same order.
    pub fn cache_keys(&self) -> &[String] {
        &self.cache_keys
    }

    /// The arguments the keys were located in.
    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    /// The positional slot carrying the keys.
    ///
    /// `None` if the keys were passed by keyword, or if there are none.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Caches the entries of a computation that maps a collection of keys to values.
///
/// The collection is the argument bound to the parameter called `keys_param`, passed either by
/// keyword or positionally. Each requested key is cached individually. On a call, the wrapper
/// fetches all of them in one round trip, runs the computation only for the missing keys, and
/// returns the merged entries in the requested order.
pub struct MultiCached<F, K> {
    func: F,
    signature: Signature,
    keys_param: String,
    keys_slot: Option<usize>,
    access: CacheAccess,
    key_builder: Option<MultiKeyBuilderFn<K>>,
}

impl<F, K> fmt::Debug for MultiCached<F, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiCached")
            .field("name", &self.access.name)
            .field("cache", &self.access.cache)
            .field("ttl", &self.access.ttl)
            .field("keys_param", &self.keys_param)
            .field("keys_slot", &self.keys_slot)
            .field("key_builder", &self.key_builder.as_ref().map(|_| ".."))
            .finish_non_exhaustive()
    }
}

impl<F, K> MultiCached<F, K> {
    /// Wraps `func`, whose parameter `keys_param` carries the requested keys.
    ///
    /// `signature` locates that parameter when it is passed positionally.
    pub fn new(
        name: impl Into<Arc<str>>,
        cache: CacheRef,
        keys_param: impl Into<String>,
        signature: Signature,
        func: F,
    ) -> Self {
        let keys_param = keys_param.into();
        let keys_slot = signature.positional_index(&keys_param);
        Self {
            func,
            signature,
            keys_param,
            keys_slot,
            access: CacheAccess::new(name.into(), cache),
            key_builder: None,
        }
    }

    /// Applies ttl and timeout from `defaults`.
    pub fn with_config(mut self, defaults: &CacheDefaults) -> Self {
        self.access.ttl = defaults.ttl;
        self.access.timeout = defaults.timeout;
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

    /// Uses `build` to derive the cache key of every requested key.
    pub fn with_key_builder(
        mut self,
        build: impl Fn(&K, &str, &CallArgs) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_builder = Some(Arc::new(build));
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

    pub fn keys_param(&self) -> &str {
        &self.keys_param
    }

    /// The positional slot of the keys parameter, if it has one.
    pub fn keys_slot(&self) -> Option<usize> {
        self.keys_slot
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn key_builder(&self) -> Option<&MultiKeyBuilderFn<K>> {
        self.key_builder.as_ref()
    }
}

impl<F, K> MultiCached<F, K>
where
    K: DeserializeOwned + fmt::Display,
{
    /// The cache key of a single requested key.
    ///
    /// Without a key builder, this is the key's textual form.
    pub fn cache_key(&self, key: &K, args: &CallArgs) -> String {
        match &self.key_builder {
            Some(build) => build(key, &self.access.name, args),
            None => key.to_string(),
        }
    }

    /// Locates the requested keys in `args`.
    ///
    /// A keyword argument wins over the positional slot. Absent, `null` and empty collections
    /// yield an empty partition. So do collections that are not arrays of `K`, after logging.
    pub fn get_keys(&self, args: &CallArgs) -> KeyPartition<K> {
        let located = match args.keyword(&self.keys_param) {
            Some(value) => Some((value, None)),
            None => self
                .keys_slot
                .and_then(|slot| Some((args.get(slot)?, Some(slot)))),
        };
        let Some((value, index)) = located else {
            return KeyPartition::empty(args.clone());
        };

        let raw_keys = match value {
            Value::Array(items) if !items.is_empty() => items.clone(),
            Value::Array(_) | Value::Null => return KeyPartition::empty(args.clone()),
            _ => {
                tracing::warn!(
                    cache = &*self.access.name,
                    param = %self.keys_param,
                    "keys argument is not an array, calling uncached"
                );
                return KeyPartition::empty(args.clone());
            }
        };

        let parsed: Result<Vec<K>, _> = raw_keys.iter().map(K::deserialize).collect();
        let keys = match parsed {
            Ok(keys) => keys,
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(
                    error = dynerr,
                    cache = &*self.access.name,
                    param = %self.keys_param,
                    "invalid keys argument, calling uncached"
                );
                return KeyPartition::empty(args.clone());
            }
        };

        let cache_keys = keys.iter().map(|key| self.cache_key(key, args)).collect();
        KeyPartition {
            keys,
            raw_keys,
            cache_keys,
            args: args.clone(),
            index,
        }
    }
}

impl<F, Fut, M, K, V, E> MultiCached<F, K>
where
    F: Fn(CallArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<M, E>> + Send,
    M: IntoIterator<Item = (K, V)>,
    K: DeserializeOwned + fmt::Display + Eq + Hash + Send,
    V: Serialize + DeserializeOwned + Clone + Send,
{
    /// Returns the entries for all requested keys, computing only the missing ones.
    ///
    /// Entries follow the requested order. Keys the computation did not produce are left out.
    /// Without any requested keys, the computation runs once with the arguments unchanged and
    /// its entries are returned as they are.
    pub async fn call(&self, args: CallArgs, options: CallOptions) -> Result<Vec<(K, V)>, E> {
        let partition = self.get_keys(&args);
        let name = &*self.access.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        if partition.is_empty() {
            let entries = (self.func)(args).await?;
            return Ok(entries.into_iter().collect());
        }
        let KeyPartition {
            keys,
            raw_keys,
            cache_keys,
            args: mut call_args,
            index,
        } = partition;
        metric!(counter("caches.multi.keys") += keys.len() as i64, "cache" => name);

        let cached: Vec<Option<V>> = if options.cache_read {
            self.access.multi_get(&cache_keys).await
        } else {
            keys.iter().map(|_| None).collect()
        };

        let missing: Vec<Value> = cached
            .iter()
            .zip(raw_keys)
            .filter_map(|(hit, raw)| hit.is_none().then_some(raw))
            .collect();
        let hits = (keys.len() - missing.len()) as i64;
        metric!(counter("caches.multi.hit") += hits, "cache" => name);
        metric!(counter("caches.multi.miss") += missing.len() as i64, "cache" => name);
        tracing::trace!(cache = name, hits, misses = missing.len(), "multi-key lookup");

        let mut computed = HashMap::new();
        if !missing.is_empty() {
            let missing = Value::Array(missing);
            match index {
                Some(slot) => {
                    call_args.replace_positional(slot, missing);
                }
                None => call_args.set_keyword(&self.keys_param, missing),
            }

            metric!(counter("caches.computation") += 1, "cache" => name);
            let start = Instant::now();
            let entries = (self.func)(call_args).await?;
            metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => name);
            computed.extend(entries);
        }

        let mut entries = Vec::with_capacity(keys.len());
        let mut to_cache = Vec::new();
        for ((key, cache_key), hit) in keys.into_iter().zip(cache_keys).zip(cached) {
            match hit {
                Some(value) => entries.push((key, value)),
                None => {
                    let Some(value) = computed.get(&key) else {
                        continue;
                    };
                    if options.cache_write {
                        if let Some(bytes) = self.access.encode(value) {
                            to_cache.push((cache_key, bytes));
                        }
                    }
                    let value = value.clone();
                    entries.push((key, value));
                }
            }
        }

        if options.cache_write {
            self.access
                .multi_set(to_cache)
                .finish(options.wait_for_write)
                .await;
        }

        Ok(entries)
    }
}

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use memocache::caching::{CacheRef, CallArgs, MemoryCache};
use memocache::config::Config;
use memocache_test as test;

/// Setup tests and create an in-memory backend.
///
/// The `config` is parsed from YAML, written to a temporary file first, the same way a
/// configuration file would be loaded. An empty string uses the default configuration.
pub fn setup_cache(config: &str) -> (CacheRef, Config) {
    test::setup();

    let config = if config.is_empty() {
        Config::get(None).unwrap()
    } else {
        let dir = test::tempdir();
        let path = test::write_file(&dir, "config.yml", config);
        Config::get(Some(&path)).unwrap()
    };

    let cache = Arc::new(MemoryCache::new(config.memory.clone()));
    (cache, config)
}

/// Counts the invocations of a computation.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Wraps `func`, counting every invocation and delaying it by `delay`.
    pub fn count<T, E, Fut, F>(
        &self,
        delay: Duration,
        func: F,
    ) -> impl Fn(CallArgs) -> futures::future::BoxFuture<'static, Result<T, E>> + Send + Sync + use<T, E, Fut, F>
    where
        F: Fn(CallArgs) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let counter = self.0.clone();
        move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            let computation = func(args);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                computation.await
            })
        }
    }
}

/// Returns the first positional argument as an integer.
#[track_caller]
pub fn first_int(args: &CallArgs) -> i64 {
    args.get(0).and_then(|value| value.as_i64()).unwrap()
}

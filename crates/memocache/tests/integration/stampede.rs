use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use memocache::caching::{CacheBackend, Cached, CallArgs, CallOptions, LOCK_SUFFIX};
use memocache::config::LeaseConfig;

use crate::{Counter, first_int, setup_cache};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_compute_once() {
    let (cache, config) = setup_cache(
        r#"
        defaults:
          lease:
            lease: 2s
            poll_interval: 10ms
        "#,
    );
    let counter = Counter::default();
    let f = Cached::with_stampede_protection(
        "slow",
        cache.clone(),
        counter.count(Duration::from_millis(100), |args| async move {
            Ok::<_, Infallible>(first_int(&args) * 10)
        }),
        Duration::from_secs(1),
    )
    .with_config(&config.defaults);
    assert_eq!(
        f.lease(),
        Some(&LeaseConfig {
            lease: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            max_wait: None,
        })
    );
    let f = Arc::new(f);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let f = Arc::clone(&f);
            let args = CallArgs::new().arg(4);
            tokio::spawn(async move { f.call(args, CallOptions::default()).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(40));
    }
    assert_eq!(counter.get(), 1);

    // the lease is gone once the value is written
    let lock_key = format!("slow(4)[]{LOCK_SUFFIX}");
    assert!(!cache.exists(&lock_key).await.unwrap());
}

#[tokio::test]
async fn test_distinct_keys_do_not_contend() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let f = Cached::with_stampede_protection(
        "distinct",
        cache,
        counter.count(Duration::from_millis(20), |args| async move {
            Ok::<_, Infallible>(first_int(&args))
        }),
        Duration::from_secs(1),
    );

    let calls = (0..5).map(|i| f.call(CallArgs::new().arg(i), CallOptions::default()));
    let results = futures::future::join_all(calls).await;

    assert_eq!(results, (0..5).map(Ok).collect::<Vec<Result<i64, Infallible>>>());
    assert_eq!(counter.get(), 5);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let lease = LeaseConfig {
        lease: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        max_wait: None,
    };
    let f = Cached::new(
        "abandoned",
        cache.clone(),
        counter.count(Duration::ZERO, |_args| async { Ok::<_, Infallible>("done") }),
    )
    .with_lease(lease);

    // a holder that went away without releasing
    cache
        .add("abandoned()[]-lock", "stale".into(), Some(lease.lease))
        .await
        .unwrap();

    let result = f.call(CallArgs::new(), CallOptions::default()).await;
    assert_eq!(result, Ok("done"));
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_forced_refresh_ignores_lease() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let f = Cached::with_stampede_protection(
        "forced",
        cache.clone(),
        counter.count(Duration::ZERO, |_args| async { Ok::<_, Infallible>(1) }),
        Duration::from_secs(10),
    );

    cache
        .add("forced()[]-lock", "other".into(), Some(Duration::from_secs(10)))
        .await
        .unwrap();

    let options = CallOptions::default().without_read();
    let call = f.call(CallArgs::new(), options);
    let result = tokio::time::timeout(Duration::from_secs(1), call).await;
    assert_eq!(result.unwrap(), Ok(1));
    assert_eq!(counter.get(), 1);
    // the foreign lease is left alone
    assert!(cache.exists("forced()[]-lock").await.unwrap());
}

#[tokio::test]
async fn test_misses_wait_for_forced_refresh() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let f = Cached::with_stampede_protection(
        "refreshed",
        cache.clone(),
        counter.count(Duration::from_millis(100), |_args| async {
            Ok::<_, Infallible>(2)
        }),
        Duration::from_secs(10),
    );

    let refresh = f.call(CallArgs::new(), CallOptions::default().without_read());
    let miss = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.call(CallArgs::new(), CallOptions::default()).await
    };
    let (refreshed, waited) = tokio::join!(refresh, miss);

    assert_eq!(refreshed, Ok(2));
    assert_eq!(waited, Ok(2));
    assert_eq!(counter.get(), 1);
    assert!(!cache.exists("refreshed()[]-lock").await.unwrap());
}

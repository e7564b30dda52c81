use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use memocache::caching::{Cached, CallArgs, CallOptions, Signature};
use serde_json::json;

use crate::{Counter, first_int, setup_cache};

#[tokio::test]
async fn test_read_through() {
    let (cache, config) = setup_cache("");
    let counter = Counter::default();
    let f = Cached::new(
        "f",
        cache.clone(),
        counter.count(Duration::ZERO, |args| async move {
            Ok::<_, Infallible>((first_int(&args) * 2 + 1).to_string())
        }),
    )
    .with_config(&config.defaults);

    let args = CallArgs::new().arg(3);
    assert_eq!(f.cache_key(&args).as_str(), "f(3)[]");

    let first = f.call(args.clone(), CallOptions::default()).await;
    let second = f.call(args, CallOptions::default()).await;

    assert_eq!(first, Ok("7".to_owned()));
    assert_eq!(second, Ok("7".to_owned()));
    assert_eq!(counter.get(), 1);
    assert_eq!(
        cache.get("f(3)[]").await,
        Ok(Some(Bytes::from_static(b"\"7\"")))
    );
}

#[tokio::test]
async fn test_forced_refresh() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let f = Cached::new(
        "refresh",
        cache.clone(),
        counter.count(Duration::ZERO, |args| async move {
            Ok::<_, Infallible>(first_int(&args))
        }),
    );

    let args = CallArgs::new().arg(1);
    f.call(args.clone(), CallOptions::default()).await.unwrap();
    f.call(args.clone(), CallOptions::default().without_read())
        .await
        .unwrap();
    f.call(args, CallOptions::default()).await.unwrap();

    assert_eq!(counter.get(), 2);
}

#[tokio::test]
async fn test_configured_ttl() {
    let (cache, config) = setup_cache(
        r#"
        defaults:
          ttl: 50ms
        "#,
    );
    assert_eq!(config.defaults.ttl, Some(Duration::from_millis(50)));

    let counter = Counter::default();
    let f = Cached::new(
        "ttl",
        cache,
        counter.count(Duration::ZERO, |_args| async { Ok::<_, Infallible>(()) }),
    )
    .with_config(&config.defaults);

    f.call(CallArgs::new(), CallOptions::default()).await.unwrap();
    f.call(CallArgs::new(), CallOptions::default()).await.unwrap();
    assert_eq!(counter.get(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    f.call(CallArgs::new(), CallOptions::default()).await.unwrap();
    assert_eq!(counter.get(), 2);
}

#[tokio::test]
async fn test_namespaced_backend() {
    let (cache, _config) = setup_cache(
        r#"
        memory:
          namespace: "tenant-a:"
        "#,
    );
    let f = Cached::new("ns", cache.clone(), |_args: CallArgs| async {
        Ok::<_, Infallible>(1)
    });

    f.call(CallArgs::new(), CallOptions::default()).await.unwrap();

    // the namespace is applied transparently by the backend
    assert!(cache.exists("ns()[]").await.unwrap());
}

#[tokio::test]
async fn test_wrappers_share_entries() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let signature = Signature::new().param("a").param_with_default("b", 2);

    let by_name = Cached::new(
        "shared",
        cache.clone(),
        counter.count(Duration::ZERO, |args| async move {
            Ok::<_, Infallible>(args.positional().len())
        }),
    )
    .with_signature(signature.clone())
    .key_by_parameters();
    let other = Cached::new(
        "shared",
        cache.clone(),
        counter.count(Duration::ZERO, |_args| async { Ok::<_, Infallible>(99) }),
    )
    .with_signature(signature)
    .key_by_parameters();

    let positional = CallArgs::new().arg("x");
    let keyword = CallArgs::new().kwarg("a", "x").kwarg("b", 2);
    assert_eq!(by_name.cache_key(&positional), other.cache_key(&keyword));

    let first = by_name.call(positional, CallOptions::default()).await;
    let second = other.call(keyword, CallOptions::default()).await;

    assert_eq!(first, Ok(1));
    assert_eq!(second, Ok(1));
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_errors_are_not_cached() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let f = Cached::new(
        "fallible",
        cache.clone(),
        counter.count(Duration::ZERO, |args| async move {
            match first_int(&args) {
                0 => Err("division by zero"),
                n => Ok(100 / n),
            }
        }),
    );

    let zero = CallArgs::new().arg(0);
    assert_eq!(f.call(zero.clone(), CallOptions::default()).await, Err("division by zero"));
    assert_eq!(f.call(zero, CallOptions::default()).await, Err("division by zero"));
    assert_eq!(counter.get(), 2);

    let four = CallArgs::new().arg(json!(4));
    assert_eq!(f.call(four, CallOptions::default()).await, Ok(25));
}

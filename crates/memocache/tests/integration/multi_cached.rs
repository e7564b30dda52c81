use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use memocache::caching::{CallArgs, CallOptions, MultiCached, Signature};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{Counter, setup_cache};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct User {
    id: u32,
    name: String,
}

fn lookup(args: CallArgs) -> impl Future<Output = Result<BTreeMap<u32, User>, Infallible>> {
    let ids: Vec<u32> = args
        .keyword("ids")
        .or(args.get(1))
        .and_then(|ids| serde_json::from_value(ids.clone()).ok())
        .unwrap_or_default();
    async move {
        Ok(ids
            .into_iter()
            .map(|id| {
                let name = format!("user-{id}");
                (id, User { id, name })
            })
            .collect())
    }
}

#[tokio::test]
async fn test_only_missing_keys_are_computed() {
    let (cache, config) = setup_cache("");
    let counter = Counter::default();
    let users = MultiCached::new(
        "users",
        cache.clone(),
        "ids",
        Signature::new().param("this").param("ids"),
        counter.count(Duration::ZERO, lookup),
    )
    .with_config(&config.defaults)
    .with_key_builder(|id: &u32, name, _args| format!("{name}:{id}"));

    let first = users
        .call(
            CallArgs::new().arg("service").arg(json!([1, 2])),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert!(cache.exists("users:1").await.unwrap());

    let second = users
        .call(
            CallArgs::new().arg("service").arg(json!([3, 2, 1])),
            CallOptions::default(),
        )
        .await
        .unwrap();
    let ids: Vec<u32> = second.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, [3, 2, 1]);
    assert_eq!(second[0].1.name, "user-3");
    assert_eq!(counter.get(), 2);

    // everything is cached by now
    let third = users
        .call(
            CallArgs::new().kwarg("ids", json!([2, 3])),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(third, vec![second[1].clone(), second[0].clone()]);
    assert_eq!(counter.get(), 2);
}

#[tokio::test]
async fn test_detached_write() {
    let (cache, _config) = setup_cache("");
    let counter = Counter::default();
    let flags = MultiCached::new(
        "flags",
        cache.clone(),
        "names",
        Signature::new().param("names"),
        counter.count(Duration::ZERO, |args| {
            let names: Vec<String> =
                serde_json::from_value(args.get(0).cloned().unwrap_or_default()).unwrap();
            async move { Ok::<_, Infallible>(names.into_iter().map(|name| (name, true))) }
        }),
    );

    let args = CallArgs::new().arg(json!(["a", "b"]));
    let result = flags
        .call(args.clone(), CallOptions::default().detached_write())
        .await;
    let expected = vec![("a".to_owned(), true), ("b".to_owned(), true)];
    assert_eq!(result, Ok(expected.clone()));

    // the write-back finishes in the background
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.exists("b").await.unwrap());

    let result = flags.call(args, CallOptions::default()).await;
    assert_eq!(result, Ok(expected));
    assert_eq!(counter.get(), 1);
}

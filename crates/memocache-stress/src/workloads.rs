use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use memocache::caching::{CacheRef, Cached, CallArgs, CallOptions, MultiCached, Signature};
use memocache::config::CacheDefaults;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Payload {
    /// Single values behind a stampede-protected wrapper.
    Single {
        /// Number of distinct keys that are cycled through.
        keys: usize,
        #[serde(with = "humantime_serde")]
        compute_time: Duration,
    },
    /// Batches of keys behind a multi-key wrapper.
    Multi {
        keys: usize,
        batch: usize,
        #[serde(with = "humantime_serde")]
        compute_time: Duration,
    },
}

type Computation<T> =
    Box<dyn Fn(CallArgs) -> BoxFuture<'static, Result<T, Infallible>> + Send + Sync>;

pub enum ParsedPayload {
    Single(Cached<Computation<u64>>),
    Multi(MultiCached<Computation<Vec<(u64, u64)>>, u64>, usize),
}

/// A workload together with its bookkeeping.
pub struct PreparedWorkload {
    payload: ParsedPayload,
    keys: usize,
    next: AtomicUsize,
    computations: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    /// The number of computations that were actually run.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

pub fn prepare_payload(
    name: String,
    cache: CacheRef,
    defaults: &CacheDefaults,
    payload: Payload,
) -> PreparedWorkload {
    let computations = Arc::new(AtomicUsize::new(0));
    let (payload, keys) = match payload {
        Payload::Single { keys, compute_time } => {
            let counter = Arc::clone(&computations);
            let compute: Computation<u64> = Box::new(move |args: CallArgs| {
                counter.fetch_add(1, Ordering::Relaxed);
                let key = args.get(0).and_then(|key| key.as_u64()).unwrap_or_default();
                Box::pin(async move {
                    tokio::time::sleep(compute_time).await;
                    Ok(key * key)
                })
            });
            let cached = Cached::new(name, cache, compute)
                .with_lease(defaults.lease)
                .with_config(defaults);
            (ParsedPayload::Single(cached), keys)
        }
        Payload::Multi {
            keys,
            batch,
            compute_time,
        } => {
            let counter = Arc::clone(&computations);
            let compute: Computation<Vec<(u64, u64)>> = Box::new(move |args: CallArgs| {
                counter.fetch_add(1, Ordering::Relaxed);
                let ids: Vec<u64> = args
                    .get(0)
                    .and_then(|ids| serde_json::from_value(ids.clone()).ok())
                    .unwrap_or_default();
                Box::pin(async move {
                    tokio::time::sleep(compute_time).await;
                    Ok(ids.into_iter().map(|id| (id, id * id)).collect())
                })
            });
            let signature = Signature::new().param("ids");
            let multi =
                MultiCached::new(name, cache, "ids", signature, compute).with_config(defaults);
            (ParsedPayload::Multi(multi, batch), keys)
        }
    };

    PreparedWorkload {
        payload,
        keys: keys.max(1),
        next: AtomicUsize::new(0),
        computations,
    }
}

pub async fn process_payload(workload: &PreparedWorkload) {
    let start = workload.next.fetch_add(1, Ordering::Relaxed);
    let options = CallOptions::default();

    match &workload.payload {
        ParsedPayload::Single(cached) => {
            let key = (start % workload.keys) as u64;
            let Ok(value) = cached.call(CallArgs::new().arg(key), options).await;
            debug_assert_eq!(value, key * key);
        }
        ParsedPayload::Multi(multi, batch) => {
            let ids: Vec<u64> = (start..start + batch)
                .map(|i| (i % workload.keys) as u64)
                .collect();
            let args = CallArgs::new().arg(json!(ids));
            let Ok(entries) = multi.call(args, options).await;
            debug_assert_eq!(entries.len(), ids.len());
        }
    }
}

//! # Caching wrappers
//!
//! This module wraps asynchronous computations in a read-through / write-through cache. A wrapped
//! computation is looked up in a [`CacheBackend`] first, and only computed on a miss. Freshly
//! computed values are written back so the next caller can reuse them.
//!
//! ## Layers
//!
//! - A [`CacheBackend`] is the storage port. It stores opaque [`Bytes`](bytes::Bytes) under
//!   string keys and offers an atomic `add`, which is the basis for the lease lock. The
//!   [`MemoryCache`] is an in-process implementation backed by `moka`.
//! - A [`LeaseLock`] guards a single key against cache stampedes. Exactly one caller holds the
//!   lease and computes, every other caller waits for the value to show up.
//! - [`Cached`] wraps a computation that produces a single value. It can optionally be stampede
//!   protected, in which case a miss goes through a [`LeaseLock`].
//! - [`MultiCached`] wraps a computation that maps a collection of keys to values. Every key is
//!   cached individually, and only the missing keys are forwarded to the computation.
//!
//! A call goes through the following steps:
//! - The cache key is derived from the call arguments, see [`KeyStrategy`] and [`CacheKey`].
//! - Unless disabled via [`CallOptions`], the value is read from the backend.
//! - On a miss, the computation is run and the result is written back, either awaited or
//!   detached, see [`PendingWrite`].
//!
//! ## Errors
//!
//! The cache is an optimization and never the reason a call fails. Every [`BackendError`] is
//! absorbed as a [`CacheError`] that is logged and counted. Reads degrade to misses and writes
//! are skipped. Errors of the computation itself are returned to the caller as they are, and are
//! never cached.
//!
//! ### Metrics
//!
//! Each of these is tagged with a `cache` field that corresponds to the name of the wrapper:
//!
//! - `caches.access`: All accesses.
//! - `caches.hit` / `caches.miss`: Single-value lookups served or not served by the backend.
//! - `caches.computation`: Actual computations being run.
//! - `caches.computation.duration`: A timer around each computation.
//! - `caches.write`: The number of values written back.
//! - `caches.error`: Absorbed failures, additionally tagged with `kind`.
//! - `caches.lease.acquired`, `caches.lease.contended`, `caches.lease.released`: The lifecycle
//!   of lease locks.
//! - `caches.multi.keys`, `caches.multi.hit`, `caches.multi.miss`: Requested, served and missing
//!   keys of multi-key lookups.

mod access;
mod args;
mod backend;
mod cache_error;
mod cache_key;
mod cached;
mod lease;
mod memory;
mod multi_cached;

pub use access::PendingWrite;
pub use args::{CallArgs, CallOptions, Param, ParamKind, Signature};
pub use backend::{CacheBackend, CacheRef};
pub use cache_error::{BackendError, BackendResult, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder, KeyBuilderFn, KeyStrategy, LOCK_SUFFIX};
pub use cached::Cached;
pub use lease::{Acquisition, LeaseGuard, LeaseLock};
pub use memory::MemoryCache;
pub use multi_cached::{KeyPartition, MultiCached, MultiKeyBuilderFn};

//! Read-through / write-through caching for asynchronous computations.
//!
//! See the [`caching`] module for the wrappers and the storage interface they consume.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;

//! In-memory request coalescing.
//!
//! The [`CoalescingCache`] makes sure that an expensive, idempotent computation runs at most once
//! per key, no matter how many callers ask for that key concurrently, and hands the outcome (value
//! or error) to every one of them. It is built on top of [`Deferred`], a one-shot cell that is
//! settled from the outside and awaited by any number of [`Promise`]s.
//!
//! ```
//! # use coalesce::{CacheConfig, CoalescingCache};
//! # futures::executor::block_on(async {
//! let cache = CoalescingCache::<u32, String, std::io::Error>::new(CacheConfig::named("docs"));
//!
//! let value = cache.get(1, |key| async move { Ok(format!("computed {key}")) }).await;
//! assert_eq!(value.unwrap().as_str(), "computed 1");
//!
//! // The key is already populated, this closure never runs.
//! let value = cache.get(1, |_| async { Ok(String::from("ignored")) }).await;
//! assert_eq!(value.unwrap().as_str(), "computed 1");
//! # });
//! ```

#![warn(missing_docs)]

#[macro_use]
#[allow(missing_docs)]
pub mod metrics;

mod cache;
#[allow(missing_docs)]
pub mod config;
mod deferred;

pub use cache::{CacheResult, CoalescingCache, EntryStatus};
pub use config::CacheConfig;
pub use deferred::{Deferred, DeferredError, Promise};

//! Helpers for testing the coalescing cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use [`Retrievals`] to hand out retrieval functions. It counts how often any of them was
//!    actually invoked, which is what most cache assertions are about.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalesce` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalesce=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The error produced by failing retrievals.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TestError(pub String);

/// The outcome of a retrieval handed out by [`Retrievals`].
pub type Retrieved = BoxFuture<'static, Result<String, TestError>>;

/// A factory of retrieval functions that share one invocation counter.
#[derive(Clone, Debug, Default)]
pub struct Retrievals {
    calls: Arc<AtomicUsize>,
}

impl Retrievals {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many retrievals created by this factory have been invoked so far.
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A retrieval that immediately succeeds with `value`.
    pub fn succeed<K, V>(&self, value: V) -> impl FnOnce(K) -> Retrieved + Clone + use<K, V>
    where
        V: Into<String>,
    {
        self.succeed_after(Duration::ZERO, value)
    }

    /// A retrieval that succeeds with `value` once `delay` has passed.
    pub fn succeed_after<K, V>(
        &self,
        delay: Duration,
        value: V,
    ) -> impl FnOnce(K) -> Retrieved + Clone + use<K, V>
    where
        V: Into<String>,
    {
        self.retrieval(delay, Ok(value.into()))
    }

    /// A retrieval that immediately fails with `message`.
    pub fn fail<K, M>(&self, message: M) -> impl FnOnce(K) -> Retrieved + Clone + use<K, M>
    where
        M: Into<String>,
    {
        self.fail_after(Duration::ZERO, message)
    }

    /// A retrieval that fails with `message` once `delay` has passed.
    pub fn fail_after<K, M>(
        &self,
        delay: Duration,
        message: M,
    ) -> impl FnOnce(K) -> Retrieved + Clone + use<K, M>
    where
        M: Into<String>,
    {
        self.retrieval(delay, Err(TestError(message.into())))
    }

    fn retrieval<K>(
        &self,
        delay: Duration,
        outcome: Result<String, TestError>,
    ) -> impl FnOnce(K) -> Retrieved + Clone + use<K> {
        let calls = Arc::clone(&self.calls);
        move |_key: K| -> Retrieved {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                outcome
            })
        }
    }
}

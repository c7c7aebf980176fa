use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

// `Shared` only hands out clones of its output, so the outcome has to be `Clone` as a whole.
type Settlement<T, E> = Result<T, E>;

/// The error side of awaiting a [`Promise`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeferredError<E> {
    /// The [`Deferred`] was settled through [`Deferred::reject`].
    #[error("deferred was rejected")]
    Rejected(E),
    /// The [`Deferred`] was dropped without ever being settled.
    #[error("deferred was dropped before it was settled")]
    Abandoned,
}

/// A one-shot cell that is settled from the outside and awaited by any number of consumers.
///
/// The producer calls [`resolve`](Self::resolve) or [`reject`](Self::reject) exactly once; every
/// [`Promise`] handed out by [`promise`](Self::promise), before or after settlement, completes with
/// that same outcome. Settling a second time is a no-op.
pub struct Deferred<T, E> {
    sender: Mutex<Option<oneshot::Sender<Settlement<T, E>>>>,
    promise: Promise<T, E>,
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    /// Creates a new, unsettled deferred.
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            promise: Promise {
                inner: receiver.shared(),
            },
        }
    }

    /// Returns a future that completes once this deferred is settled.
    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    /// Settles this deferred with `value`.
    ///
    /// Returns `true` if this call settled it, and `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles this deferred with `error`.
    ///
    /// Returns `true` if this call settled it, and `false` if it was already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Whether [`resolve`](Self::resolve) or [`reject`](Self::reject) has been called.
    pub fn is_settled(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn settle(&self, outcome: Settlement<T, E>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(sender) => {
                // `self.promise` keeps a receiver alive, so the send cannot fail.
                sender.send(outcome).ok();
                true
            }
            None => false,
        }
    }
}

impl<T: Clone, E: Clone> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// The consumer half of a [`Deferred`].
///
/// Promises are cheap to clone, and each clone resumes independently.
#[derive(Clone)]
pub struct Promise<T, E> {
    inner: Shared<oneshot::Receiver<Settlement<T, E>>>,
}

impl<T: Clone, E: Clone> Promise<T, E> {
    /// Returns the outcome without waiting, if the deferred has been settled and this promise (or
    /// one of its clones) has been polled since.
    pub fn peek(&self) -> Option<Result<T, DeferredError<E>>> {
        self.inner.peek().cloned().map(flatten)
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, DeferredError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx).map(flatten)
    }
}

impl<T: Clone, E: Clone> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.inner.peek().is_some())
            .finish()
    }
}

fn flatten<T, E>(
    received: Result<Settlement<T, E>, oneshot::Canceled>,
) -> Result<T, DeferredError<E>> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(DeferredError::Rejected(error)),
        Err(oneshot::Canceled) => Err(DeferredError::Abandoned),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_all_consumers() {
        coalesce_test::setup();

        let deferred = Arc::new(Deferred::<&str, ()>::new());
        let consumers: Vec<_> = (0..3)
            .map(|_| tokio::spawn(deferred.promise()))
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(deferred.resolve("done"));

        for consumer in futures::future::join_all(consumers).await {
            assert_eq!(consumer.unwrap(), Ok("done"));
        }
    }

    #[tokio::test]
    async fn test_settles_only_once() {
        let deferred = Deferred::<u32, &str>::new();
        assert!(!deferred.is_settled());

        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert!(!deferred.reject("too late"));
        assert!(deferred.is_settled());

        assert_eq!(deferred.promise().await, Ok(1));
    }

    #[tokio::test]
    async fn test_reject() {
        let deferred = Deferred::<u32, &str>::new();
        let promise = deferred.promise();

        assert!(deferred.reject("boom"));
        assert!(!deferred.resolve(1));

        assert_eq!(promise.await, Err(DeferredError::Rejected("boom")));
        assert_eq!(
            deferred.promise().await,
            Err(DeferredError::Rejected("boom"))
        );
    }

    #[tokio::test]
    async fn test_abandoned() {
        let deferred = Deferred::<u32, ()>::new();
        let promise = deferred.promise();
        drop(deferred);

        assert_eq!(promise.await, Err(DeferredError::Abandoned));
    }

    #[tokio::test]
    async fn test_peek() {
        let deferred = Deferred::<u32, ()>::new();
        let promise = deferred.promise();
        assert_eq!(promise.peek(), None);

        deferred.resolve(7);
        assert_eq!(promise.clone().await, Ok(7));
        assert_eq!(promise.peek(), Some(Ok(7)));
    }
}

//! Run-once asynchronous initialization with fan-out.
//!
//! A [`Deferred`] wraps an async factory so that it runs at most once per
//! attempt. Every caller that asks for the value while the attempt is in
//! flight is queued and receives a clone of the same outcome once it settles;
//! callers arriving afterwards get the cached outcome.
//!
//! # Failure policy
//!
//! What happens after a failed attempt is chosen explicitly with
//! [`FailurePolicy`]:
//!
//! - [`FailurePolicy::Cache`] (default): the failure is the final outcome.
//!   Every later `get` observes the same error and no new attempt is made.
//! - [`FailurePolicy::Retry`]: the failure is delivered to the callers that
//!   were waiting on that attempt, and the next `get` starts a fresh one.
//!
//! An attempt that ends without producing a value (the factory panicked or
//! the runtime shut down underneath it) is reported to its waiters as
//! [`Abandoned`] and never cached, whatever the policy.
//!
//! # Example
//!
//! ```ignore
//! use deferred::Deferred;
//!
//! let client = Deferred::new(|| async { connect("mongodb://127.0.0.1/test").await });
//!
//! // Both calls share one connect attempt.
//! let (a, b) = tokio::join!(client.get(), client.get());
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// The attempt ended without producing an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned;

impl std::fmt::Display for Abandoned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deferred initialization was abandoned before it completed")
    }
}

impl std::error::Error for Abandoned {}

/// What a failed attempt leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep the failure as the final outcome.
    #[default]
    Cache,
    /// Hand the failure to the current waiters, then allow a new attempt.
    Retry,
}

type Factory<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type Waiter<T, E> = oneshot::Sender<Result<T, E>>;

enum State<T, E> {
    Idle,
    Pending(Vec<Waiter<T, E>>),
    Settled(Result<T, E>),
}

struct Inner<T, E> {
    factory: Factory<T, E>,
    policy: FailurePolicy,
    attempts: AtomicUsize,
    state: Mutex<State<T, E>>,
}

impl<T, E> Inner<T, E> {
    fn lock(&self) -> MutexGuard<'_, State<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lazily computed, shared async value.
///
/// Cloning a `Deferred` yields another handle to the same slot.
pub struct Deferred<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> std::fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.lock() {
            State::Idle => "idle",
            State::Pending(_) => "pending",
            State::Settled(Ok(_)) => "ready",
            State::Settled(Err(_)) => "failed",
        };
        f.debug_struct("Deferred")
            .field("state", &state)
            .field("policy", &self.inner.policy)
            .field("attempts", &self.inner.attempts.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Abandoned> + 'static,
{
    /// Create a deferred value that caches failures.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::with_policy(factory, FailurePolicy::Cache)
    }

    /// Create a deferred value with an explicit failure policy.
    pub fn with_policy<F, Fut>(factory: F, policy: FailurePolicy) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let factory: Factory<T, E> = Arc::new(move || factory().boxed());
        Self {
            inner: Arc::new(Inner {
                factory,
                policy,
                attempts: AtomicUsize::new(0),
                state: Mutex::new(State::Idle),
            }),
        }
    }

    /// Resolve the value, starting the factory if nothing has started yet.
    ///
    /// The attempt runs on its own Tokio task, so dropping the caller that
    /// triggered it does not cancel it for the others.
    ///
    /// # Panics
    ///
    /// Panics if a new attempt has to be started outside a Tokio runtime.
    pub async fn get(&self) -> Result<T, E> {
        let (rx, start) = {
            let mut state = self.inner.lock();
            match &mut *state {
                State::Settled(outcome) => return outcome.clone(),
                State::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    (rx, false)
                }
                State::Idle => {
                    let (tx, rx) = oneshot::channel();
                    *state = State::Pending(vec![tx]);
                    (rx, true)
                }
            }
        };

        if start {
            self.start();
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(E::from(Abandoned)),
        }
    }

    /// The settled outcome, if any, without starting an attempt.
    pub fn peek(&self) -> Option<Result<T, E>> {
        match &*self.inner.lock() {
            State::Settled(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Whether an outcome has been cached.
    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.lock(), State::Settled(_))
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Failure policy this value was built with.
    pub fn policy(&self) -> FailurePolicy {
        self.inner.policy
    }

    fn start(&self) {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!("Starting deferred attempt #{attempt}");

        let work = (self.inner.factory)();
        let mut settle = Settle {
            inner: Some(Arc::clone(&self.inner)),
        };
        tokio::spawn(async move {
            let outcome = work.await;
            settle.complete(outcome);
        });
    }
}

/// Publishes the outcome of one attempt; reports abandonment if dropped
/// before completing.
struct Settle<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    inner: Option<Arc<Inner<T, E>>>,
}

impl<T, E> Settle<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    fn complete(&mut self, outcome: Result<T, E>) {
        let Some(inner) = self.inner.take() else {
            return;
        };

        let next = match (&outcome, inner.policy) {
            (Err(_), FailurePolicy::Retry) => State::Idle,
            _ => State::Settled(outcome.clone()),
        };
        let previous = std::mem::replace(&mut *inner.lock(), next);
        let waiters = match previous {
            State::Pending(waiters) => waiters,
            _ => Vec::new(),
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl<T, E> Drop for Settle<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };

        tracing::warn!("Deferred attempt ended without an outcome");
        let waiters = {
            let mut state = inner.lock();
            match std::mem::replace(&mut *state, State::Idle) {
                State::Pending(waiters) => waiters,
                other => {
                    *state = other;
                    Vec::new()
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(E::from(Abandoned)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Boom(usize),
        Abandoned,
    }

    impl From<Abandoned> for TestError {
        fn from(_: Abandoned) -> Self {
            TestError::Abandoned
        }
    }

    fn counting(
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    ) -> impl Fn() -> BoxFuture<'static, Result<usize, TestError>> + Send + Sync + 'static {
        move || {
            let calls = Arc::clone(&calls);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_first {
                    Err(TestError::Boom(n))
                } else {
                    Ok(n * 10)
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deferred = Deferred::new(counting(Arc::clone(&calls), 0));

        let results =
            futures::future::join_all((0..16).map(|_| deferred.get())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(10)));
        assert_eq!(deferred.attempts(), 1);
    }

    #[tokio::test]
    async fn test_settled_value_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deferred = Deferred::new(counting(Arc::clone(&calls), 0));

        assert!(deferred.peek().is_none());
        assert_eq!(deferred.get().await, Ok(10));
        assert_eq!(deferred.get().await, Ok(10));
        assert!(deferred.is_settled());
        assert_eq!(deferred.peek(), Some(Ok(10)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached_by_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deferred = Deferred::new(counting(Arc::clone(&calls), 1));

        let (a, b) = tokio::join!(deferred.get(), deferred.get());
        assert_eq!(a, Err(TestError::Boom(1)));
        assert_eq!(b, Err(TestError::Boom(1)));

        assert_eq!(deferred.get().await, Err(TestError::Boom(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(deferred.policy(), FailurePolicy::Cache);
    }

    #[tokio::test]
    async fn test_retry_policy_starts_a_new_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deferred =
            Deferred::with_policy(counting(Arc::clone(&calls), 1), FailurePolicy::Retry);

        let (a, b) = tokio::join!(deferred.get(), deferred.get());
        assert_eq!(a, Err(TestError::Boom(1)));
        assert_eq!(b, Err(TestError::Boom(1)));
        assert!(!deferred.is_settled());

        assert_eq!(deferred.get().await, Ok(20));
        assert_eq!(deferred.get().await, Ok(20));
        assert_eq!(deferred.attempts(), 2);
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_abandoned_and_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let deferred: Deferred<usize, TestError> = Deferred::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first attempt blows up");
                }
                Ok(7)
            }
        });

        assert_eq!(deferred.get().await, Err(TestError::Abandoned));
        assert!(!deferred.is_settled());
        assert_eq!(deferred.get().await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deferred = Deferred::new(counting(Arc::clone(&calls), 0));

        let first = deferred.clone();
        let task = tokio::spawn(async move { first.get().await });
        tokio::task::yield_now().await;
        task.abort();

        assert_eq!(deferred.get().await, Ok(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

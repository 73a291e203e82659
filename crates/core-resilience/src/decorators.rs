//! Layered composition of the primitives around a unit of work
//!
//! Each `with_*` call wraps everything added so far, so the last layer added
//! is the outermost one and sees the call first:
//!
//! ```
//! use bulwark_core_resilience::prelude::*;
//! use std::sync::Arc;
//!
//! let breaker = Arc::new(CircuitBreaker::new("backend", CircuitBreakerConfig::default()).unwrap());
//! let retry = Arc::new(Retry::new("backend", RetryConfig::default()).unwrap());
//!
//! // Retry → CircuitBreaker → operation
//! let mut call = Decorators::of(|| Ok::<_, ResilienceError>(42))
//!     .with_circuit_breaker(breaker)
//!     .with_retry(retry)
//!     .decorate();
//!
//! assert_eq!(call().unwrap(), 42);
//! ```
//!
//! Layers never change the call's types. A rejection from an inner layer
//! reaches the outer ones as an ordinary `E`, converted from
//! [`ResilienceError`].

use crate::adaptive_bulkhead::AdaptiveBulkhead;
use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::ResilienceError;
use crate::rate_limiter::RateLimiter;
use crate::retry::Retry;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

type Supplier<'a, T, E> = Box<dyn FnMut() -> Result<T, E> + 'a>;
type FutureSupplier<'a, T, E> = Arc<dyn Fn() -> BoxFuture<'a, Result<T, E>> + Send + Sync + 'a>;

/// Entry point for building decorated calls
pub struct Decorators;

impl Decorators {
    /// Start from a blocking operation
    pub fn of<'a, T, E, F>(operation: F) -> DecorateSupplier<'a, T, E>
    where
        F: FnMut() -> Result<T, E> + 'a,
    {
        DecorateSupplier {
            supplier: Box::new(operation),
        }
    }

    /// Start from an operation that produces a future per call
    pub fn of_future<'a, T, E, F, Fut>(operation: F) -> DecorateFuture<'a, T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
    {
        DecorateFuture {
            supplier: Arc::new(move || operation().boxed()),
        }
    }
}

/// Builder for a decorated blocking call
pub struct DecorateSupplier<'a, T, E> {
    supplier: Supplier<'a, T, E>,
}

impl<'a, T, E> DecorateSupplier<'a, T, E>
where
    T: 'static,
    E: From<ResilienceError> + Error + 'static,
{
    pub fn with_circuit_breaker(self, breaker: Arc<CircuitBreaker>) -> Self {
        self.wrap(move |inner| breaker.execute(inner))
    }

    pub fn with_rate_limiter(self, limiter: Arc<RateLimiter>) -> Self {
        self.wrap(move |inner| limiter.execute(inner))
    }

    pub fn with_bulkhead(self, bulkhead: Arc<Bulkhead>) -> Self {
        self.wrap(move |inner| bulkhead.execute(inner))
    }

    pub fn with_adaptive_bulkhead(self, bulkhead: Arc<AdaptiveBulkhead>) -> Self {
        self.wrap(move |inner| bulkhead.execute(inner))
    }

    pub fn with_retry(self, retry: Arc<Retry>) -> Self {
        self.wrap(move |inner| retry.execute(inner))
    }

    /// The composed call, reusable
    pub fn decorate(self) -> impl FnMut() -> Result<T, E> + 'a {
        self.supplier
    }

    /// Run the composed call once
    pub fn call(mut self) -> Result<T, E> {
        (self.supplier)()
    }

    fn wrap<L>(self, mut layer: L) -> Self
    where
        L: FnMut(&mut Supplier<'a, T, E>) -> Result<T, E> + 'a,
    {
        let mut inner = self.supplier;
        Self {
            supplier: Box::new(move || layer(&mut inner)),
        }
    }
}

/// Builder for a decorated async call
pub struct DecorateFuture<'a, T, E> {
    supplier: FutureSupplier<'a, T, E>,
}

impl<'a, T, E> DecorateFuture<'a, T, E>
where
    T: Send + 'static,
    E: From<ResilienceError> + Error + Send + 'static,
{
    pub fn with_circuit_breaker(self, breaker: Arc<CircuitBreaker>) -> Self {
        let inner = self.supplier;
        Self::layer(move || {
            let breaker = Arc::clone(&breaker);
            let inner = Arc::clone(&inner);
            async move { breaker.execute_async(|| inner()).await }.boxed()
        })
    }

    pub fn with_rate_limiter(self, limiter: Arc<RateLimiter>) -> Self {
        let inner = self.supplier;
        Self::layer(move || {
            let limiter = Arc::clone(&limiter);
            let inner = Arc::clone(&inner);
            async move { limiter.execute_async(|| inner()).await }.boxed()
        })
    }

    pub fn with_bulkhead(self, bulkhead: Arc<Bulkhead>) -> Self {
        let inner = self.supplier;
        Self::layer(move || {
            let bulkhead = Arc::clone(&bulkhead);
            let inner = Arc::clone(&inner);
            async move { bulkhead.execute_async(|| inner()).await }.boxed()
        })
    }

    pub fn with_adaptive_bulkhead(self, bulkhead: Arc<AdaptiveBulkhead>) -> Self {
        let inner = self.supplier;
        Self::layer(move || {
            let bulkhead = Arc::clone(&bulkhead);
            let inner = Arc::clone(&inner);
            async move { bulkhead.execute_async(|| inner()).await }.boxed()
        })
    }

    pub fn with_retry(self, retry: Arc<Retry>) -> Self {
        let inner = self.supplier;
        Self::layer(move || {
            let retry = Arc::clone(&retry);
            let inner = Arc::clone(&inner);
            async move { retry.execute_async(|| inner()).await }.boxed()
        })
    }

    /// The composed call; each invocation yields a fresh future
    pub fn decorate(self) -> impl Fn() -> BoxFuture<'a, Result<T, E>> + Send + Sync + 'a {
        move || (self.supplier)()
    }

    /// Run the composed call once
    pub async fn call(self) -> Result<T, E> {
        (self.supplier)().await
    }

    fn layer<L>(layer: L) -> Self
    where
        L: Fn() -> BoxFuture<'a, Result<T, E>> + Send + Sync + 'a,
    {
        Self {
            supplier: Arc::new(layer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::BulkheadConfig;
    use crate::circuit_breaker::{CircuitBreakerConfig, State};
    use crate::interval::IntervalFunction;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::retry::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn breaker(minimum_number_of_calls: u64) -> Arc<CircuitBreaker> {
        let config = CircuitBreakerConfig {
            sliding_window_size: 10,
            minimum_number_of_calls,
            ..Default::default()
        };
        Arc::new(CircuitBreaker::new("backend", config).unwrap())
    }

    fn retry(max_attempts: u32) -> Arc<Retry> {
        let config = RetryConfig {
            max_attempts,
            interval_function: IntervalFunction::fixed(Duration::from_millis(1)),
            ..Default::default()
        };
        Arc::new(Retry::new("backend", config).unwrap())
    }

    #[test]
    fn test_retry_outside_breaker_records_every_attempt() {
        let breaker = breaker(100);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = Decorators::of(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ResilienceError::InvalidConfig("boom".into()))
        })
        .with_circuit_breaker(Arc::clone(&breaker))
        .with_retry(retry(3))
        .call();

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.metrics().snapshot.failed_calls(), 3, "each attempt passes the breaker");
    }

    #[test]
    fn test_breaker_outside_retry_records_once() {
        let breaker = breaker(100);
        let result = Decorators::of(|| Err::<(), _>(ResilienceError::InvalidConfig("boom".into())))
            .with_retry(retry(3))
            .with_circuit_breaker(Arc::clone(&breaker))
            .call();

        assert!(result.is_err());
        assert_eq!(breaker.metrics().snapshot.failed_calls(), 1);
    }

    #[test]
    fn test_open_breaker_rejection_reaches_retry() {
        let breaker = breaker(1);
        breaker.transition_to_forced_open();
        let retry = retry(2);

        let result = Decorators::of(|| Ok::<_, ResilienceError>(1))
            .with_circuit_breaker(Arc::clone(&breaker))
            .with_retry(Arc::clone(&retry))
            .call();

        assert!(matches!(result, Err(ResilienceError::CallNotPermitted { .. })));
        assert_eq!(breaker.state(), State::ForcedOpen);
        assert_eq!(retry.metrics().failed_calls_with_retry, 1);
    }

    #[test]
    fn test_decorated_call_is_reusable() {
        let bulkhead = Arc::new(Bulkhead::new("pool", BulkheadConfig::default()).unwrap());
        let limiter = Arc::new(RateLimiter::new("api", RateLimiterConfig::per_second(100)).unwrap());

        let mut call = Decorators::of(|| Ok::<_, ResilienceError>("ok"))
            .with_rate_limiter(limiter)
            .with_bulkhead(Arc::clone(&bulkhead))
            .decorate();

        for _ in 0..3 {
            assert_eq!(call().unwrap(), "ok");
        }
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 25);
    }

    #[tokio::test]
    async fn test_async_layers_compose() {
        let breaker = breaker(100);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let call = Decorators::of_future(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ResilienceError::InvalidConfig("first".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .with_circuit_breaker(Arc::clone(&breaker))
        .with_retry(retry(3))
        .decorate();

        assert_eq!(call().await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snapshot = breaker.metrics().snapshot;
        assert_eq!((snapshot.total_calls(), snapshot.failed_calls()), (2, 1));
    }
}

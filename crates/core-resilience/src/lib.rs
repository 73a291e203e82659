//! Bulwark Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides building blocks that decide, per call, whether a unit of
//! work may run, must wait, is rejected, or should be tried again:
//!
//! - **Circuit Breaker**: Fails fast while a dependency is unhealthy, probing it again after a wait
//! - **Rate Limiter**: Fixed number of permissions per refresh cycle, refreshed lazily by callers
//! - **Bulkhead**: Caps concurrent calls, optionally waiting for a free permit
//! - **Adaptive Bulkhead**: Bulkhead whose limit follows observed failure and latency
//! - **Retry**: Repeats failed calls with configurable backoff
//! - **Sliding Window Metrics**: Count- or time-based outcome aggregation shared by the above
//! - **Registry / Events**: Named instances with shared configs, and per-instance event fan-out
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transports (HTTP, gRPC, databases)
//! - Configuration file formats
//! - Metric exporters and framework glue
//!
//! Every primitive is in-process and per-instance. Nothing here spawns a
//! thread or a timer; time only moves forward when a caller asks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ Decorators::of(..)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Bulkhead                          │  ← Concurrency cap
//! │  (Permits, bounded wait)                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Throughput cap
//! │  (Permissions per cycle, CAS refresh)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Sliding window, state machine)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry                             │  ← Transient failures
//! │  (Attempts, interval function)          │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Service
//!
//!  Alongside every instance:
//!   Registry       → name → instance, config inheritance
//!   EventPublisher → subscribers + recent-event replay
//! ```
//!
//! # Usage Example
//!
//! ## Basic Circuit Breaker
//!
//! ```
//! use bulwark_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError, State};
//!
//! let config = CircuitBreakerConfig {
//!     sliding_window_size: 4,
//!     minimum_number_of_calls: 4,
//!     ..Default::default()
//! };
//! let breaker = CircuitBreaker::new("inventory", config).unwrap();
//!
//! for _ in 0..4 {
//!     let _: Result<(), ResilienceError> =
//!         breaker.execute(|| Err(ResilienceError::InvalidConfig("backend down".into())));
//! }
//! assert_eq!(breaker.state(), State::Open);
//! ```
//!
//! ## Shared Registry
//!
//! ```
//! use bulwark_core_resilience::{RateLimiter, RateLimiterConfig};
//!
//! let registry = RateLimiter::registry(RateLimiterConfig::per_second(10));
//! let first = registry.get_or_create("search").unwrap();
//! let second = registry.get_or_create("search").unwrap();
//! assert!(std::sync::Arc::ptr_eq(&first, &second));
//! ```

pub mod adaptive_bulkhead;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod decorators;
pub mod error;
pub mod event;
pub mod interval;
pub mod metrics;
pub mod predicate;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod ring_buffer;

// Re-export main types for convenience
pub use adaptive_bulkhead::{AdaptiveBulkhead, AdaptiveBulkheadConfig, AdaptiveBulkheadEvent};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadEvent, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, State};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use decorators::Decorators;
pub use error::ResilienceError;
pub use event::{Event, EventKind, EventPublisher};
pub use interval::IntervalFunction;
pub use metrics::{Outcome, SlidingWindowMetrics, SlidingWindowType, Snapshot};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterEvent};
pub use registry::{ConfigTemplate, Registry, RegistryEvent, Tags};
pub use retry::{Retry, RetryConfig, RetryEvent};
pub use ring_buffer::ConcurrentRingBuffer;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use bulwark_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::adaptive_bulkhead::{AdaptiveBulkhead, AdaptiveBulkheadConfig};
    pub use super::bulkhead::{Bulkhead, BulkheadConfig};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
    pub use super::decorators::Decorators;
    pub use super::error::ResilienceError;
    pub use super::interval::IntervalFunction;
    pub use super::metrics::SlidingWindowType;
    pub use super::rate_limiter::{RateLimiter, RateLimiterConfig};
    pub use super::registry::Registry;
    pub use super::retry::{Retry, RetryConfig};
}

//! Retry with configurable backoff
//!
//! Each call gets its own [`RetryContext`] that counts attempts and decides,
//! per outcome, whether to try again. Waits come from the configured
//! [`IntervalFunction`]: a thread sleep on the sync path and a tokio timer on
//! the async path.
//!
//! When attempts run out, the last outcome is handed back exactly as the
//! operation produced it, error type included.
//!
//! # Example
//!
//! ```
//! use bulwark_core_resilience::retry::{Retry, RetryConfig};
//! use bulwark_core_resilience::interval::IntervalFunction;
//! use std::time::Duration;
//!
//! let retry = Retry::new("fetch", RetryConfig {
//!     max_attempts: 3,
//!     interval_function: IntervalFunction::fixed(Duration::from_millis(1)),
//!     ..Default::default()
//! }).unwrap();
//!
//! let mut calls = 0;
//! let result: Result<u32, std::io::Error> = retry.execute(|| {
//!     calls += 1;
//!     if calls < 3 {
//!         Err(std::io::Error::new(std::io::ErrorKind::Other, "flaky"))
//!     } else {
//!         Ok(calls)
//!     }
//! });
//! assert_eq!(result.unwrap(), 3);
//! ```

use crate::error::ResilienceError;
use crate::event::{EventKind, EventPublisher};
use crate::interval::IntervalFunction;
use crate::predicate::{ErrorPredicate, ResultPredicate};
use crate::registry::{Registry, Tags};
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Registry of named retries
pub type RetryRegistry = Registry<Retry, RetryConfig>;

/// Configuration for retry behavior
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Wait before attempt `n + 1`, given `n` attempts made
    pub interval_function: IntervalFunction,
    /// Errors worth another attempt; `None` retries every error
    pub retry_on_error: Option<ErrorPredicate>,
    /// Errors returned at once without counting them anywhere
    pub ignore_error: Option<ErrorPredicate>,
    /// Returned values that should be retried
    pub retry_on_result: Option<ResultPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_function: IntervalFunction::default(),
            retry_on_error: None,
            ignore_error: None,
            retry_on_result: None,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("interval_function", &self.interval_function)
            .field("retry_on_error", &self.retry_on_error.is_some())
            .field("ignore_error", &self.ignore_error.is_some())
            .field("retry_on_result", &self.retry_on_result.is_some())
            .finish()
    }
}

/// Events emitted by a retry
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// Another attempt is scheduled after `wait`
    Retry { attempt: u32, wait: Duration, error: String },
    /// Call succeeded after at least one retry
    Success { attempts: u32 },
    /// Call failed for good
    Error { attempts: u32, error: String },
    IgnoredError { error: String },
}

impl EventKind for RetryEvent {
    fn kind(&self) -> &'static str {
        match self {
            RetryEvent::Retry { .. } => "RETRY",
            RetryEvent::Success { .. } => "SUCCESS",
            RetryEvent::Error { .. } => "ERROR",
            RetryEvent::IgnoredError { .. } => "IGNORED_ERROR",
        }
    }
}

/// Call outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    /// Failed with an error that is not retried
    pub failed_calls_without_retry: u64,
    /// Failed after every attempt was used
    pub failed_calls_with_retry: u64,
}

/// What to do after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then call again
    Retry(Duration),
    /// Hand the outcome to the caller
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded_without_retry: AtomicU64,
    succeeded_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

/// Retry policy shared by many calls
pub struct Retry {
    name: String,
    config: RetryConfig,
    counters: Counters,
    tags: Tags,
    events: EventPublisher<RetryEvent>,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        let name = name.into();
        debug!(name = %name, ?config, "retry created");
        Ok(Self {
            name,
            config,
            counters: Counters::default(),
            tags: Tags::new(),
            events: EventPublisher::default(),
        })
    }

    pub fn registry(default_config: RetryConfig) -> RetryRegistry {
        Registry::new(default_config, |name, config, tags| {
            Ok(Self::new(name, config)?.with_tags(tags.clone()))
        })
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<RetryEvent> {
        &self.events
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            successful_calls_without_retry: self.counters.succeeded_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: self.counters.succeeded_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Fresh per-call context
    pub fn context(&self) -> RetryContext<'_> {
        RetryContext {
            retry: self,
            attempts: 0,
        }
    }

    /// Call `operation` until it succeeds, fails with a non-retried error,
    /// or runs out of attempts. Waits block the current thread.
    pub fn execute<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        T: 'static,
        E: Error + 'static,
    {
        let mut context = self.context();
        loop {
            let result = operation();
            match context.on_outcome(&result) {
                RetryDecision::Retry(wait) => std::thread::sleep(wait),
                RetryDecision::Stop => return result,
            }
        }
    }

    /// Async variant of [`execute`](Self::execute); waits on the tokio timer
    pub async fn execute_async<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: 'static,
        E: Error + 'static,
    {
        let mut context = self.context();
        loop {
            let result = operation().await;
            match context.on_outcome(&result) {
                RetryDecision::Retry(wait) => tokio::time::sleep(wait).await,
                RetryDecision::Stop => return result,
            }
        }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// Attempt bookkeeping for one call
#[derive(Debug)]
pub struct RetryContext<'a> {
    retry: &'a Retry,
    attempts: u32,
}

impl RetryContext<'_> {
    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Classify one attempt's outcome
    pub fn on_outcome<T: 'static, E: Error + 'static>(&mut self, result: &Result<T, E>) -> RetryDecision {
        match result {
            Ok(value) => self.on_result(value),
            Err(error) => self.on_error(error),
        }
    }

    /// A value came back; retried only if `retry_on_result` matches
    pub fn on_result(&mut self, value: &dyn Any) -> RetryDecision {
        self.attempts += 1;
        let config = &self.retry.config;
        if config.retry_on_result.as_ref().is_some_and(|p| p(value)) {
            return self.retry_or_give_up("result matched retry_on_result".to_string());
        }
        self.on_success();
        RetryDecision::Stop
    }

    /// An error came back
    pub fn on_error(&mut self, error: &(dyn Error + 'static)) -> RetryDecision {
        self.attempts += 1;
        let config = &self.retry.config;
        if config.ignore_error.as_ref().is_some_and(|p| p(error)) {
            debug!(name = %self.retry.name, %error, "ignored error, not retried");
            self.retry.events.publish(
                &self.retry.name,
                RetryEvent::IgnoredError {
                    error: error.to_string(),
                },
            );
            return RetryDecision::Stop;
        }
        if !config.retry_on_error.as_ref().map_or(true, |p| p(error)) {
            self.retry
                .counters
                .failed_without_retry
                .fetch_add(1, Ordering::Relaxed);
            self.retry.events.publish(
                &self.retry.name,
                RetryEvent::Error {
                    attempts: self.attempts,
                    error: error.to_string(),
                },
            );
            return RetryDecision::Stop;
        }
        self.retry_or_give_up(error.to_string())
    }

    fn on_success(&self) {
        if self.attempts <= 1 {
            self.retry
                .counters
                .succeeded_without_retry
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.retry
                .counters
                .succeeded_with_retry
                .fetch_add(1, Ordering::Relaxed);
            self.retry.events.publish(
                &self.retry.name,
                RetryEvent::Success {
                    attempts: self.attempts,
                },
            );
        }
    }

    fn retry_or_give_up(&self, error: String) -> RetryDecision {
        let retry = self.retry;
        if self.attempts < retry.config.max_attempts {
            let wait = retry.config.interval_function.wait(self.attempts);
            debug!(name = %retry.name, attempt = self.attempts, ?wait, %error, "retrying");
            retry.events.publish(
                &retry.name,
                RetryEvent::Retry {
                    attempt: self.attempts,
                    wait,
                    error,
                },
            );
            RetryDecision::Retry(wait)
        } else {
            warn!(name = %retry.name, attempts = self.attempts, %error, "retries exhausted");
            retry.counters.failed_with_retry.fetch_add(1, Ordering::Relaxed);
            retry.events.publish(
                &retry.name,
                RetryEvent::Error {
                    attempts: self.attempts,
                    error,
                },
            );
            RetryDecision::Stop
        }
    }
}

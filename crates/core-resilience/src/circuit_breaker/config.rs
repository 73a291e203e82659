//! Circuit breaker configuration

use crate::error::ResilienceError;
use crate::interval::IntervalFunction;
use crate::metrics::SlidingWindowType;
use crate::predicate::{ErrorPredicate, ResultPredicate};
use std::fmt;
use std::time::Duration;

/// Configuration for circuit breaker behavior
///
/// # Example
/// ```
/// use bulwark_core_resilience::circuit_breaker::CircuitBreakerConfig;
/// use bulwark_core_resilience::interval::IntervalFunction;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig {
///     failure_rate_threshold: 25.0,
///     sliding_window_size: 20,
///     minimum_number_of_calls: 10,
///     wait_duration_in_open_state: IntervalFunction::fixed(Duration::from_secs(5)),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent) at or above which the breaker opens
    pub failure_rate_threshold: f32,
    /// Slow call rate (percent) at or above which the breaker opens
    pub slow_call_rate_threshold: f32,
    /// Calls taking at least this long are slow
    pub slow_call_duration_threshold: Duration,
    pub sliding_window_type: SlidingWindowType,
    /// Number of calls (count-based) or seconds (time-based)
    pub sliding_window_size: usize,
    /// Calls required before rates are evaluated
    pub minimum_number_of_calls: u64,
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Half-open state reverts to open after this long; zero waits forever
    pub max_wait_duration_in_half_open_state: Duration,
    /// Open wait as a function of consecutive open periods
    pub wait_duration_in_open_state: IntervalFunction,
    /// Errors counted as failures; `None` records every error
    pub record_error: Option<ErrorPredicate>,
    /// Errors counted as neither success nor failure; takes precedence over `record_error`
    pub ignore_error: Option<ErrorPredicate>,
    /// Returned values counted as failures
    pub record_result: Option<ResultPredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            permitted_number_of_calls_in_half_open_state: 10,
            max_wait_duration_in_half_open_state: Duration::ZERO,
            wait_duration_in_open_state: IntervalFunction::fixed(Duration::from_secs(60)),
            record_error: None,
            ignore_error: None,
            record_result: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Check every field, failing on the first invalid one
    pub fn validate(&self) -> Result<(), ResilienceError> {
        check_rate("failure_rate_threshold", self.failure_rate_threshold)?;
        check_rate("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        if self.slow_call_duration_threshold.is_zero() {
            return Err(invalid("slow_call_duration_threshold must be greater than zero"));
        }
        if self.sliding_window_size == 0 {
            return Err(invalid("sliding_window_size must be greater than 0"));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(invalid("minimum_number_of_calls must be greater than 0"));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(invalid(
                "permitted_number_of_calls_in_half_open_state must be greater than 0",
            ));
        }
        if self.wait_duration_in_open_state.wait(1).is_zero() {
            return Err(invalid("wait_duration_in_open_state must be greater than zero"));
        }
        Ok(())
    }

    /// Calls required before the closed window is evaluated.
    ///
    /// A count-based window can never hold more than its size, so the
    /// minimum is capped there.
    pub fn effective_minimum_number_of_calls(&self) -> u64 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => self
                .minimum_number_of_calls
                .min(self.sliding_window_size as u64),
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        }
    }

    /// Whether `error` is ignored
    pub fn is_ignored(&self, error: &(dyn std::error::Error + 'static)) -> bool {
        self.ignore_error.as_ref().is_some_and(|p| p(error))
    }

    /// Whether `error` counts as a failure (ignored errors never do)
    pub fn is_recorded_failure(&self, error: &(dyn std::error::Error + 'static)) -> bool {
        self.record_error.as_ref().map_or(true, |p| p(error))
    }

    /// Whether a returned value counts as a failure
    pub fn is_failed_result(&self, value: &dyn std::any::Any) -> bool {
        self.record_result.as_ref().is_some_and(|p| p(value))
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("slow_call_duration_threshold", &self.slow_call_duration_threshold)
            .field("sliding_window_type", &self.sliding_window_type)
            .field("sliding_window_size", &self.sliding_window_size)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .field(
                "permitted_number_of_calls_in_half_open_state",
                &self.permitted_number_of_calls_in_half_open_state,
            )
            .field(
                "max_wait_duration_in_half_open_state",
                &self.max_wait_duration_in_half_open_state,
            )
            .field("wait_duration_in_open_state", &self.wait_duration_in_open_state)
            .field("record_error", &self.record_error.is_some())
            .field("ignore_error", &self.ignore_error.is_some())
            .field("record_result", &self.record_result.is_some())
            .finish()
    }
}

fn check_rate(field: &str, value: f32) -> Result<(), ResilienceError> {
    if !(value > 0.0 && value <= 100.0) {
        return Err(ResilienceError::InvalidConfig(format!(
            "{} must be in (0, 100], got {}",
            field, value
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> ResilienceError {
    ResilienceError::InvalidConfig(message.to_string())
}

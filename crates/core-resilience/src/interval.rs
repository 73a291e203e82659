//! Backoff interval functions
//!
//! An [`IntervalFunction`] maps a 1-based attempt number to the wait before
//! the next attempt. Retry uses it between attempts; the circuit breaker uses
//! it to grow the OPEN wait with each consecutive re-open.

use crate::error::ResilienceError;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default wait between attempts
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
/// Default exponential multiplier
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
/// Default jitter factor for randomized intervals
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Attempt number → wait duration
///
/// # Example
/// ```
/// use bulwark_core_resilience::interval::IntervalFunction;
/// use std::time::Duration;
///
/// let backoff = IntervalFunction::exponential(Duration::from_millis(100), 2.0).unwrap();
/// assert_eq!(backoff.wait(1), Duration::from_millis(100));
/// assert_eq!(backoff.wait(3), Duration::from_millis(400));
/// ```
#[derive(Clone)]
pub struct IntervalFunction {
    description: String,
    function: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl IntervalFunction {
    /// Custom function. `name` is only used for debug output.
    pub fn custom(
        name: impl Into<String>,
        function: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            description: name.into(),
            function: Arc::new(function),
        }
    }

    /// Same wait for every attempt
    pub fn fixed(interval: Duration) -> Self {
        Self::custom(format!("fixed({:?})", interval), move |_| interval)
    }

    /// `initial * multiplier^(attempt-1)`
    pub fn exponential(initial: Duration, multiplier: f64) -> Result<Self, ResilienceError> {
        Self::exponential_with_max(initial, multiplier, Duration::MAX)
    }

    /// Exponential growth capped at `max`
    pub fn exponential_with_max(
        initial: Duration,
        multiplier: f64,
        max: Duration,
    ) -> Result<Self, ResilienceError> {
        check_interval(initial)?;
        check_multiplier(multiplier)?;
        Ok(Self::custom(
            format!("exponential({:?}, x{}, max {:?})", initial, multiplier, max),
            move |attempt| exponential_wait(initial, multiplier, attempt).min(max),
        ))
    }

    /// Uniformly random wait in `interval * [1 - factor, 1 + factor]`
    pub fn randomized(interval: Duration, randomization_factor: f64) -> Result<Self, ResilienceError> {
        check_interval(interval)?;
        check_randomization(randomization_factor)?;
        Ok(Self::custom(
            format!("randomized({:?}, ±{})", interval, randomization_factor),
            move |_| randomize(interval, randomization_factor),
        ))
    }

    /// Exponential growth with jitter applied to each step, capped at `max`
    pub fn exponential_randomized(
        initial: Duration,
        multiplier: f64,
        randomization_factor: f64,
        max: Duration,
    ) -> Result<Self, ResilienceError> {
        check_interval(initial)?;
        check_multiplier(multiplier)?;
        check_randomization(randomization_factor)?;
        Ok(Self::custom(
            format!(
                "exponential_randomized({:?}, x{}, ±{}, max {:?})",
                initial, multiplier, randomization_factor, max
            ),
            move |attempt| {
                let base = exponential_wait(initial, multiplier, attempt);
                randomize(base, randomization_factor).min(max)
            },
        ))
    }

    /// Wait before the attempt following `attempt` (1-based; 0 is treated as 1)
    pub fn wait(&self, attempt: u32) -> Duration {
        (self.function)(attempt.max(1))
    }
}

impl Default for IntervalFunction {
    fn default() -> Self {
        Self::fixed(DEFAULT_INTERVAL)
    }
}

impl fmt::Debug for IntervalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IntervalFunction")
            .field(&self.description)
            .finish()
    }
}

fn exponential_wait(initial: Duration, multiplier: f64, attempt: u32) -> Duration {
    let factor = multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
    let nanos = initial.as_nanos() as f64 * factor;
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor == 0.0 {
        return interval;
    }
    let nanos = interval.as_nanos() as f64;
    let delta = nanos * factor;
    let jittered = rand::rng().random_range((nanos - delta)..=(nanos + delta));
    Duration::from_nanos(jittered.max(0.0) as u64)
}

fn check_interval(interval: Duration) -> Result<(), ResilienceError> {
    if interval < Duration::from_millis(1) {
        return Err(ResilienceError::InvalidConfig(format!(
            "interval must be at least 1ms, got {:?}",
            interval
        )));
    }
    Ok(())
}

fn check_multiplier(multiplier: f64) -> Result<(), ResilienceError> {
    if !(multiplier.is_finite() && multiplier >= 1.0) {
        return Err(ResilienceError::InvalidConfig(format!(
            "multiplier must be >= 1.0, got {}",
            multiplier
        )));
    }
    Ok(())
}

fn check_randomization(factor: f64) -> Result<(), ResilienceError> {
    if !(0.0..1.0).contains(&factor) {
        return Err(ResilienceError::InvalidConfig(format!(
            "randomization factor must be in [0, 1), got {}",
            factor
        )));
    }
    Ok(())
}

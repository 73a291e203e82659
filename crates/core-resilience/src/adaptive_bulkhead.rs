//! Adaptive bulkhead: a bulkhead whose limit follows observed call quality
//!
//! Completed calls feed a sliding window (failure and slow-call rates) and
//! an exponentially weighted latency estimate. At most once per
//! `adjustment_interval`, and only once the window is meaningful, the
//! controller proposes a new limit:
//!
//! - **Slow start** (initial phase): multiply by `increase_multiplier` while
//!   the thresholds hold
//! - **Congestion avoidance** (after the first breach): add
//!   `increase_augend` while the thresholds hold
//! - Any breach multiplies the limit by `decrease_multiplier`
//!
//! The result is clamped to `[min_concurrent_calls, max_concurrent_calls]`
//! and applied through [`Bulkhead::change_config`], so calls already in
//! flight keep their permits. The window restarts after every adjustment.

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadEvent};
use crate::clock::{duration_nanos, SharedClock, SystemClock};
use crate::error::ResilienceError;
use crate::event::{EventKind, EventPublisher};
use crate::metrics::{Outcome, SlidingWindowMetrics, SlidingWindowType, Snapshot};
use crate::predicate::ErrorPredicate;
use crate::registry::{Registry, Tags};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Registry of named adaptive bulkheads
pub type AdaptiveBulkheadRegistry = Registry<AdaptiveBulkhead, AdaptiveBulkheadConfig>;

/// Configuration for an adaptive bulkhead
#[derive(Clone)]
pub struct AdaptiveBulkheadConfig {
    pub min_concurrent_calls: usize,
    pub initial_concurrent_calls: usize,
    pub max_concurrent_calls: usize,
    pub max_wait_duration: Duration,
    pub failure_rate_threshold: f32,
    pub slow_call_rate_threshold: f32,
    pub slow_call_duration_threshold: Duration,
    pub sliding_window_type: SlidingWindowType,
    pub sliding_window_size: usize,
    pub minimum_number_of_calls: u64,
    /// Additive step in congestion avoidance
    pub increase_augend: usize,
    /// Growth factor during slow start
    pub increase_multiplier: f32,
    /// Shrink factor on breach, in (0, 1)
    pub decrease_multiplier: f32,
    /// Minimum time between two adjustments
    pub adjustment_interval: Duration,
    /// Weight of the newest sample in the latency average, in (0, 1]
    pub latency_smoothing: f64,
    /// Errors counted as failures; `None` records every error
    pub record_error: Option<ErrorPredicate>,
    /// Errors counted as neither success nor failure
    pub ignore_error: Option<ErrorPredicate>,
}

impl Default for AdaptiveBulkheadConfig {
    fn default() -> Self {
        Self {
            min_concurrent_calls: 2,
            initial_concurrent_calls: 2,
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(5),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            increase_augend: 1,
            increase_multiplier: 2.0,
            decrease_multiplier: 0.5,
            adjustment_interval: Duration::from_secs(1),
            latency_smoothing: 0.2,
            record_error: None,
            ignore_error: None,
        }
    }
}

impl AdaptiveBulkheadConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        let invalid = |msg: &str| Err(ResilienceError::InvalidConfig(msg.to_string()));
        if self.min_concurrent_calls == 0 {
            return invalid("min_concurrent_calls must be greater than 0");
        }
        if !(self.min_concurrent_calls <= self.initial_concurrent_calls
            && self.initial_concurrent_calls <= self.max_concurrent_calls)
        {
            return invalid("concurrent calls must satisfy min <= initial <= max");
        }
        for (field, rate) in [
            ("failure_rate_threshold", self.failure_rate_threshold),
            ("slow_call_rate_threshold", self.slow_call_rate_threshold),
        ] {
            if !(rate > 0.0 && rate <= 100.0) {
                return Err(ResilienceError::InvalidConfig(format!(
                    "{} must be in (0, 100], got {}",
                    field, rate
                )));
            }
        }
        if self.sliding_window_size == 0 || self.minimum_number_of_calls == 0 {
            return invalid("sliding window size and minimum number of calls must be greater than 0");
        }
        if self.increase_augend == 0 {
            return invalid("increase_augend must be greater than 0");
        }
        if !(self.increase_multiplier >= 1.0) {
            return invalid("increase_multiplier must be >= 1");
        }
        if !(self.decrease_multiplier > 0.0 && self.decrease_multiplier < 1.0) {
            return invalid("decrease_multiplier must be in (0, 1)");
        }
        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            return invalid("latency_smoothing must be in (0, 1]");
        }
        Ok(())
    }

    fn minimum_calls(&self) -> u64 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => self
                .minimum_number_of_calls
                .min(self.sliding_window_size as u64),
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        }
    }
}

impl fmt::Debug for AdaptiveBulkheadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBulkheadConfig")
            .field("min_concurrent_calls", &self.min_concurrent_calls)
            .field("initial_concurrent_calls", &self.initial_concurrent_calls)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("max_wait_duration", &self.max_wait_duration)
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("slow_call_duration_threshold", &self.slow_call_duration_threshold)
            .field("sliding_window_size", &self.sliding_window_size)
            .field("adjustment_interval", &self.adjustment_interval)
            .finish_non_exhaustive()
    }
}

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoidance,
}

/// Events emitted by an adaptive bulkhead
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptiveBulkheadEvent {
    Success { elapsed: Duration },
    Error { elapsed: Duration, error: String },
    IgnoredError { elapsed: Duration, error: String },
    LimitChanged { old: usize, new: usize },
}

impl EventKind for AdaptiveBulkheadEvent {
    fn kind(&self) -> &'static str {
        match self {
            AdaptiveBulkheadEvent::Success { .. } => "SUCCESS",
            AdaptiveBulkheadEvent::Error { .. } => "ERROR",
            AdaptiveBulkheadEvent::IgnoredError { .. } => "IGNORED_ERROR",
            AdaptiveBulkheadEvent::LimitChanged { .. } => "LIMIT_CHANGED",
        }
    }
}

/// Point-in-time view of an adaptive bulkhead
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveBulkheadMetrics {
    pub phase: Phase,
    pub limit: usize,
    pub available_concurrent_calls: usize,
    /// Smoothed call latency, `None` before the first call completes
    pub smoothed_latency: Option<Duration>,
    pub snapshot: Snapshot,
}

#[derive(Debug)]
struct Controller {
    phase: Phase,
    last_adjustment: u64,
    smoothed_latency_nanos: Option<f64>,
}

impl Controller {
    fn observe(&mut self, elapsed: Duration, smoothing: f64) {
        let sample = elapsed.as_nanos() as f64;
        self.smoothed_latency_nanos = Some(match self.smoothed_latency_nanos {
            Some(previous) => previous + smoothing * (sample - previous),
            None => sample,
        });
    }

    fn propose(&mut self, current: usize, breached: bool, config: &AdaptiveBulkheadConfig) -> usize {
        let proposed = if breached {
            self.phase = Phase::CongestionAvoidance;
            (current as f32 * config.decrease_multiplier).ceil() as usize
        } else {
            match self.phase {
                Phase::SlowStart => (current as f32 * config.increase_multiplier).ceil() as usize,
                Phase::CongestionAvoidance => current.saturating_add(config.increase_augend),
            }
        };
        proposed.clamp(config.min_concurrent_calls, config.max_concurrent_calls)
    }
}

/// Bulkhead that tunes its own concurrency limit
///
/// # Example
/// ```
/// use bulwark_core_resilience::adaptive_bulkhead::{AdaptiveBulkhead, AdaptiveBulkheadConfig};
/// use bulwark_core_resilience::ResilienceError;
///
/// let bulkhead = AdaptiveBulkhead::new("search", AdaptiveBulkheadConfig::default()).unwrap();
/// let hits: Result<u32, ResilienceError> = bulkhead.execute(|| Ok(3));
/// assert_eq!(hits, Ok(3));
/// assert_eq!(bulkhead.metrics().limit, 2);
/// ```
pub struct AdaptiveBulkhead {
    name: String,
    config: AdaptiveBulkheadConfig,
    clock: SharedClock,
    bulkhead: Bulkhead,
    window: SlidingWindowMetrics,
    controller: Mutex<Controller>,
    tags: Tags,
    events: EventPublisher<AdaptiveBulkheadEvent>,
}

impl AdaptiveBulkhead {
    pub fn new(name: impl Into<String>, config: AdaptiveBulkheadConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(name, config, SystemClock::shared())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: AdaptiveBulkheadConfig,
        clock: SharedClock,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let name = name.into();
        let bulkhead = Bulkhead::new(
            name.clone(),
            BulkheadConfig {
                max_concurrent_calls: config.initial_concurrent_calls,
                max_wait_duration: config.max_wait_duration,
            },
        )?;
        let window = SlidingWindowMetrics::of_type(
            config.sliding_window_type,
            config.sliding_window_size,
            config.minimum_calls(),
            Arc::clone(&clock),
        )?;
        debug!(name = %name, ?config, "adaptive bulkhead created");
        Ok(Self {
            controller: Mutex::new(Controller {
                phase: Phase::SlowStart,
                last_adjustment: clock.nanos(),
                smoothed_latency_nanos: None,
            }),
            name,
            config,
            clock,
            bulkhead,
            window,
            tags: Tags::new(),
            events: EventPublisher::default(),
        })
    }

    pub fn registry(default_config: AdaptiveBulkheadConfig) -> AdaptiveBulkheadRegistry {
        Self::registry_with_clock(default_config, SystemClock::shared())
    }

    pub fn registry_with_clock(
        default_config: AdaptiveBulkheadConfig,
        clock: SharedClock,
    ) -> AdaptiveBulkheadRegistry {
        Registry::new(default_config, move |name, config, tags| {
            Ok(Self::with_clock(name, config, Arc::clone(&clock))?.with_tags(tags.clone()))
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

    pub fn config(&self) -> &AdaptiveBulkheadConfig {
        &self.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<AdaptiveBulkheadEvent> {
        &self.events
    }

    /// Permit events of the underlying bulkhead
    pub fn bulkhead_event_publisher(&self) -> &EventPublisher<BulkheadEvent> {
        self.bulkhead.event_publisher()
    }

    /// Current concurrency limit
    pub fn limit(&self) -> usize {
        self.bulkhead.config().max_concurrent_calls
    }

    pub fn metrics(&self) -> AdaptiveBulkheadMetrics {
        let controller = self.controller.lock();
        let inner = self.bulkhead.metrics();
        AdaptiveBulkheadMetrics {
            phase: controller.phase,
            limit: inner.max_allowed_concurrent_calls,
            available_concurrent_calls: inner.available_concurrent_calls,
            smoothed_latency: controller
                .smoothed_latency_nanos
                .map(|nanos| Duration::from_nanos(nanos as u64)),
            snapshot: self.window.snapshot(),
        }
    }

    /// Take a permit, waiting up to `max_wait_duration`. Every `true` must
    /// be followed by exactly one of `on_success`, `on_error` or
    /// `release_permission`.
    pub fn try_acquire_permission(&self) -> bool {
        self.bulkhead.try_acquire_permission()
    }

    pub async fn try_acquire_permission_async(&self) -> bool {
        self.bulkhead.try_acquire_permission_async().await
    }

    /// Return a permit for a call that never ran
    pub fn release_permission(&self) {
        self.bulkhead.release_permission();
    }

    /// Finish a successful call
    pub fn on_success(&self, elapsed: Duration) {
        self.bulkhead.on_complete();
        self.events
            .publish(&self.name, AdaptiveBulkheadEvent::Success { elapsed });
        self.record(elapsed, false);
    }

    /// Finish a failed call
    pub fn on_error(&self, elapsed: Duration, error: &(dyn Error + 'static)) {
        if self.config.ignore_error.as_ref().is_some_and(|p| p(error)) {
            self.bulkhead.on_complete();
            self.events.publish(
                &self.name,
                AdaptiveBulkheadEvent::IgnoredError {
                    elapsed,
                    error: error.to_string(),
                },
            );
        } else if self.config.record_error.as_ref().map_or(true, |p| p(error)) {
            self.bulkhead.on_complete();
            self.events.publish(
                &self.name,
                AdaptiveBulkheadEvent::Error {
                    elapsed,
                    error: error.to_string(),
                },
            );
            self.record(elapsed, true);
        } else {
            self.on_success(elapsed);
        }
    }

    /// Run `operation` under a permit and feed its outcome to the controller
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<ResilienceError> + Error + 'static,
    {
        if !self.try_acquire_permission() {
            return Err(self.full().into());
        }
        let call = InFlight::new(self);
        let result = operation();
        call.finish(&result);
        result
    }

    /// Async variant of [`execute`](Self::execute). A dropped future
    /// returns its permit without recording anything.
    pub async fn execute_async<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Error + 'static,
    {
        if !self.try_acquire_permission_async().await {
            return Err(self.full().into());
        }
        let call = InFlight::new(self);
        let result = operation().await;
        call.finish(&result);
        result
    }

    fn full(&self) -> ResilienceError {
        ResilienceError::BulkheadFull {
            name: self.name.clone(),
            max_concurrent_calls: self.limit(),
        }
    }

    fn record(&self, elapsed: Duration, failed: bool) {
        let slow = elapsed >= self.config.slow_call_duration_threshold;
        let snapshot = self.window.record(elapsed, Outcome::classify(failed, slow));

        let mut controller = self.controller.lock();
        controller.observe(elapsed, self.config.latency_smoothing);

        let now = self.clock.nanos();
        let due = now.saturating_sub(controller.last_adjustment)
            >= duration_nanos(self.config.adjustment_interval);
        if !due || !snapshot.is_meaningful() {
            return;
        }

        let old = self.limit();
        let breached = self.breached(&snapshot, controller.smoothed_latency_nanos);
        let new = controller.propose(old, breached, &self.config);
        controller.last_adjustment = now;
        self.window.reset();
        debug!(
            name = %self.name,
            breached,
            phase = ?controller.phase,
            old,
            new,
            "adaptive bulkhead evaluated"
        );

        if new != old {
            let resized = BulkheadConfig {
                max_concurrent_calls: new,
                max_wait_duration: self.config.max_wait_duration,
            };
            if self.bulkhead.change_config(resized).is_ok() {
                info!(name = %self.name, old, new, "adaptive bulkhead limit changed");
                self.events
                    .publish(&self.name, AdaptiveBulkheadEvent::LimitChanged { old, new });
            }
        }
    }

    fn breached(&self, snapshot: &Snapshot, smoothed_latency_nanos: Option<f64>) -> bool {
        let latency_degraded = smoothed_latency_nanos.is_some_and(|nanos| {
            nanos >= self.config.slow_call_duration_threshold.as_nanos() as f64
        });
        snapshot.failure_rate() >= self.config.failure_rate_threshold
            || snapshot.slow_call_rate() >= self.config.slow_call_rate_threshold
            || latency_degraded
    }
}

impl fmt::Debug for AdaptiveBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBulkhead")
            .field("name", &self.name)
            .field("limit", &self.limit())
            .finish()
    }
}

/// Permit of a running call. Dropped unfinished, it only returns the permit.
struct InFlight<'a> {
    bulkhead: &'a AdaptiveBulkhead,
    started: u64,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn new(bulkhead: &'a AdaptiveBulkhead) -> Self {
        Self {
            bulkhead,
            started: bulkhead.clock.nanos(),
            finished: false,
        }
    }

    fn finish<T, E: Error + 'static>(mut self, result: &Result<T, E>) {
        self.finished = true;
        let elapsed = Duration::from_nanos(self.bulkhead.clock.nanos().saturating_sub(self.started));
        match result {
            Ok(_) => self.bulkhead.on_success(elapsed),
            Err(error) => self.bulkhead.on_error(elapsed, error),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.bulkhead.release_permission();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn adaptive(clock: &Arc<ManualClock>) -> AdaptiveBulkhead {
        let config = AdaptiveBulkheadConfig {
            min_concurrent_calls: 1,
            initial_concurrent_calls: 2,
            max_concurrent_calls: 8,
            sliding_window_size: 4,
            minimum_number_of_calls: 4,
            slow_call_duration_threshold: Duration::from_millis(100),
            ..Default::default()
        };
        AdaptiveBulkhead::with_clock("adaptive", config, clock.clone()).unwrap()
    }

    fn succeed(bulkhead: &AdaptiveBulkhead, times: usize) {
        for _ in 0..times {
            let ok: Result<(), ResilienceError> = bulkhead.execute(|| Ok(()));
            assert!(ok.is_ok());
        }
    }

    fn fail(bulkhead: &AdaptiveBulkhead, times: usize) {
        for _ in 0..times {
            let err: Result<(), ResilienceError> =
                bulkhead.execute(|| Err(ResilienceError::InvalidConfig("down".into())));
            assert!(err.is_err());
        }
    }

    #[test]
    fn test_no_adjustment_before_interval() {
        let clock = Arc::new(ManualClock::new());
        let bulkhead = adaptive(&clock);
        succeed(&bulkhead, 20);
        assert_eq!(bulkhead.limit(), 2);
    }

    #[test]
    fn test_slow_start_then_decrease_then_additive_increase() {
        let clock = Arc::new(ManualClock::new());
        let bulkhead = adaptive(&clock);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        bulkhead.event_publisher().subscribe_kind("LIMIT_CHANGED", move |e| {
            if let AdaptiveBulkheadEvent::LimitChanged { old, new } = e.payload() {
                sink.lock().push((*old, *new));
            }
        });

        clock.advance(Duration::from_secs(1));
        succeed(&bulkhead, 4);
        assert_eq!(bulkhead.limit(), 4);
        assert_eq!(bulkhead.metrics().phase, Phase::SlowStart);

        clock.advance(Duration::from_secs(1));
        fail(&bulkhead, 4);
        assert_eq!(bulkhead.limit(), 2);
        assert_eq!(bulkhead.metrics().phase, Phase::CongestionAvoidance);

        clock.advance(Duration::from_secs(1));
        succeed(&bulkhead, 4);
        assert_eq!(bulkhead.limit(), 3);

        assert_eq!(*changes.lock(), vec![(2, 4), (4, 2), (2, 3)]);
    }

    #[test]
    fn test_limit_is_clamped() {
        let clock = Arc::new(ManualClock::new());
        let bulkhead = adaptive(&clock);
        for _ in 0..5 {
            clock.advance(Duration::from_secs(1));
            succeed(&bulkhead, 4);
        }
        assert_eq!(bulkhead.limit(), 8);

        for _ in 0..5 {
            clock.advance(Duration::from_secs(1));
            fail(&bulkhead, 4);
        }
        assert_eq!(bulkhead.limit(), 1);
    }

    #[test]
    fn test_unchanged_limit_emits_nothing() {
        let clock = Arc::new(ManualClock::new());
        let bulkhead = adaptive(&clock);
        for _ in 0..4 {
            clock.advance(Duration::from_secs(1));
            fail(&bulkhead, 4);
        }
        let changes = bulkhead
            .event_publisher()
            .recent_events()
            .iter()
            .filter(|e| e.kind() == "LIMIT_CHANGED")
            .count();
        assert_eq!(changes, 1, "2 -> 1 once, then clamped at the minimum");
    }

    #[test]
    fn test_permits_balance_after_calls() {
        let clock = Arc::new(ManualClock::new());
        let bulkhead = adaptive(&clock);
        succeed(&bulkhead, 3);
        fail(&bulkhead, 3);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 2);
    }

    #[test]
    fn test_smoothed_latency() {
        let clock = Arc::new(ManualClock::new());
        let bulkhead = adaptive(&clock);
        assert_eq!(bulkhead.metrics().smoothed_latency, None);
        assert!(bulkhead.try_acquire_permission());
        bulkhead.on_success(Duration::from_millis(10));
        assert_eq!(bulkhead.metrics().smoothed_latency, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_invalid_config() {
        let config = AdaptiveBulkheadConfig {
            min_concurrent_calls: 5,
            initial_concurrent_calls: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Circuit breaker driven by sliding-window failure and slow-call rates
//!
//! The breaker's whole mutable state lives in one immutable [`StateCell`]
//! behind an [`ArcSwap`]. A transition builds a new cell (generation + 1)
//! and installs it with a compare-and-swap against the cell the caller
//! observed, so exactly one racing caller drives each transition and nobody
//! ever sees a generation older than one it already saw. Every new cell gets
//! a fresh window except an Open one, which keeps the window that tripped
//! the breaker.
//!
//! States:
//! - Closed: calls pass through; the breaker opens once the window holds at
//!   least `minimum_number_of_calls` and either rate reaches its threshold
//! - Open: calls are rejected until the open wait elapses; the first caller
//!   after that moves the breaker to half-open and becomes its first probe
//! - HalfOpen: `permitted_number_of_calls_in_half_open_state` probes decide
//!   between Closed and Open
//! - Disabled / ForcedOpen / MetricsOnly: administrative states
//!
//! There is no timer thread; deadlines are checked on the next admission.

mod config;
mod state;

pub use config::CircuitBreakerConfig;
pub use state::{transition, State, StateTransition, Trigger};

use crate::clock::{duration_nanos, SharedClock, SystemClock};
use crate::error::ResilienceError;
use crate::event::{EventKind, EventPublisher};
use crate::metrics::{Outcome, SlidingWindowMetrics, Snapshot};
use crate::registry::{Registry, Tags};
use arc_swap::ArcSwap;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry of named circuit breakers
pub type CircuitBreakerRegistry = Registry<CircuitBreaker, CircuitBreakerConfig>;

/// Events emitted by a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEvent {
    Success { elapsed: Duration },
    Error { elapsed: Duration, error: String },
    IgnoredError { elapsed: Duration, error: String },
    CallNotPermitted,
    StateTransition(StateTransition),
    Reset,
    FailureRateExceeded { failure_rate: f32 },
    SlowCallRateExceeded { slow_call_rate: f32 },
}

impl EventKind for CircuitBreakerEvent {
    fn kind(&self) -> &'static str {
        match self {
            CircuitBreakerEvent::Success { .. } => "SUCCESS",
            CircuitBreakerEvent::Error { .. } => "ERROR",
            CircuitBreakerEvent::IgnoredError { .. } => "IGNORED_ERROR",
            CircuitBreakerEvent::CallNotPermitted => "NOT_PERMITTED",
            CircuitBreakerEvent::StateTransition(_) => "STATE_TRANSITION",
            CircuitBreakerEvent::Reset => "RESET",
            CircuitBreakerEvent::FailureRateExceeded { .. } => "FAILURE_RATE_EXCEEDED",
            CircuitBreakerEvent::SlowCallRateExceeded { .. } => "SLOW_CALL_RATE_EXCEEDED",
        }
    }
}

/// Point-in-time view of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: State,
    pub generation: u64,
    /// Aggregates of the window belonging to the current state
    pub snapshot: Snapshot,
    /// Calls rejected since the breaker was created
    pub not_permitted_calls: u64,
    /// Probes still available while half-open, zero otherwise
    pub remaining_half_open_calls: u32,
}

impl CircuitBreakerMetrics {
    pub fn failure_rate(&self) -> f32 {
        self.snapshot.failure_rate()
    }

    pub fn slow_call_rate(&self) -> f32 {
        self.snapshot.slow_call_rate()
    }
}

/// Immutable per-generation state
struct StateCell {
    state: State,
    generation: u64,
    /// Shared with the previous cell when entering OPEN
    metrics: Arc<SlidingWindowMetrics>,
    entered_at: u64,
    open_until: u64,
    /// Consecutive open periods, drives the open wait function
    attempts: u32,
    probes: AtomicI64,
    /// Edge detector for rate-exceeded events in METRICS_ONLY
    rate_exceeded: AtomicBool,
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```
/// use bulwark_core_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
/// use bulwark_core_resilience::ResilienceError;
///
/// let config = CircuitBreakerConfig {
///     sliding_window_size: 2,
///     minimum_number_of_calls: 2,
///     ..Default::default()
/// };
/// let breaker = CircuitBreaker::new("backend", config).unwrap();
///
/// for _ in 0..2 {
///     let _ = breaker.execute(|| Err::<(), _>(ResilienceError::InvalidConfig("down".into())));
/// }
/// assert_eq!(breaker.state(), State::Open);
/// assert!(!breaker.try_acquire_permission());
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    cell: ArcSwap<StateCell>,
    not_permitted_calls: AtomicU64,
    tags: Tags,
    events: EventPublisher<CircuitBreakerEvent>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker on the system clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(name, config, SystemClock::shared())
    }

    /// Create a closed circuit breaker reading time from `clock`
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let name = name.into();
        let initial = build_cell(&config, &clock, State::Closed, 0, 0, false, None)?;
        debug!(name = %name, ?config, "circuit breaker created");
        Ok(Self {
            name,
            config,
            clock,
            cell: ArcSwap::from_pointee(initial),
            not_permitted_calls: AtomicU64::new(0),
            tags: Tags::new(),
            events: EventPublisher::default(),
        })
    }

    /// Registry creating breakers on the system clock
    pub fn registry(default_config: CircuitBreakerConfig) -> CircuitBreakerRegistry {
        Self::registry_with_clock(default_config, SystemClock::shared())
    }

    /// Registry whose breakers all share `clock`
    pub fn registry_with_clock(
        default_config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> CircuitBreakerRegistry {
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

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn state(&self) -> State {
        self.cell.load().state
    }

    /// Monotonic counter bumped by every transition
    pub fn generation(&self) -> u64 {
        self.cell.load().generation
    }

    pub fn event_publisher(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.events
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let cell = self.cell.load();
        let remaining = if cell.state == State::HalfOpen {
            cell.probes.load(Ordering::Acquire).max(0) as u32
        } else {
            0
        };
        CircuitBreakerMetrics {
            state: cell.state,
            generation: cell.generation,
            snapshot: cell.metrics.snapshot(),
            not_permitted_calls: self.not_permitted_calls.load(Ordering::Relaxed),
            remaining_half_open_calls: remaining,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// A `true` answer while half-open consumes a probe; hand it back with
    /// [`release_permission`](Self::release_permission) if the call is
    /// never made.
    pub fn try_acquire_permission(&self) -> bool {
        loop {
            let cell = self.cell.load_full();
            let permitted = match cell.state {
                State::Closed | State::Disabled | State::MetricsOnly => true,
                State::ForcedOpen => false,
                State::Open => {
                    if self.clock.nanos() < cell.open_until {
                        false
                    } else if self.transition(&cell, Trigger::OpenWaitElapsed, None).is_some() {
                        // The winner was handed the first probe when the cell was built.
                        return true;
                    } else if self.is_current(&cell) {
                        false
                    } else {
                        continue;
                    }
                }
                State::HalfOpen => {
                    if self.half_open_expired(&cell) {
                        self.transition(&cell, Trigger::HalfOpenWaitElapsed, None);
                        if !self.is_current(&cell) {
                            continue;
                        }
                    }
                    take_probe(&cell.probes)
                }
            };

            if !permitted {
                self.not_permitted_calls.fetch_add(1, Ordering::Relaxed);
                warn!(name = %self.name, state = %cell.state, "call not permitted");
                self.events.publish(&self.name, CircuitBreakerEvent::CallNotPermitted);
            }
            return permitted;
        }
    }

    /// Like [`try_acquire_permission`](Self::try_acquire_permission) but
    /// reports a rejection as [`ResilienceError::CallNotPermitted`]
    pub fn acquire_permission(&self) -> Result<(), ResilienceError> {
        if self.try_acquire_permission() {
            Ok(())
        } else {
            Err(ResilienceError::CallNotPermitted {
                name: self.name.clone(),
                state: self.state().to_string(),
            })
        }
    }

    /// Give back a half-open probe that was acquired but not used
    pub fn release_permission(&self) {
        let cell = self.cell.load();
        if cell.state == State::HalfOpen {
            let limit = i64::from(self.config.permitted_number_of_calls_in_half_open_state);
            let _ = cell
                .probes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| (p < limit).then_some(p + 1));
        }
    }

    /// Record a successful call
    pub fn on_success(&self, elapsed: Duration) {
        self.record(elapsed, false, CircuitBreakerEvent::Success { elapsed });
    }

    /// Record a failed call, honoring the ignore/record predicates
    pub fn on_error(&self, elapsed: Duration, error: &(dyn Error + 'static)) {
        if self.config.is_ignored(error) {
            debug!(name = %self.name, %error, "ignored error not recorded");
            self.release_permission();
            self.events.publish(
                &self.name,
                CircuitBreakerEvent::IgnoredError {
                    elapsed,
                    error: error.to_string(),
                },
            );
        } else if self.config.is_recorded_failure(error) {
            let event = CircuitBreakerEvent::Error {
                elapsed,
                error: error.to_string(),
            };
            self.record(elapsed, true, event);
        } else {
            self.on_success(elapsed);
        }
    }

    /// Record a call that returned a value, which `record_result` may still
    /// classify as a failure
    pub fn on_result(&self, elapsed: Duration, value: &dyn Any) {
        if self.config.is_failed_result(value) {
            let event = CircuitBreakerEvent::Error {
                elapsed,
                error: "result recorded as failure".to_string(),
            };
            self.record(elapsed, true, event);
        } else {
            self.on_success(elapsed);
        }
    }

    /// Run `operation` if the breaker admits it and record its outcome
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        T: 'static,
        E: From<ResilienceError> + Error + 'static,
    {
        self.acquire_permission()?;
        let permit = PermissionGuard::new(self);
        let start = self.clock.nanos();
        let result = operation();
        permit.disarm();
        self.on_outcome(self.elapsed_since(start), &result);
        result
    }

    /// Async variant of [`execute`](Self::execute). Dropping the future
    /// mid-call gives an acquired half-open probe back.
    pub async fn execute_async<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: 'static,
        E: From<ResilienceError> + Error + 'static,
    {
        self.acquire_permission()?;
        let permit = PermissionGuard::new(self);
        let start = self.clock.nanos();
        let result = operation().await;
        permit.disarm();
        self.on_outcome(self.elapsed_since(start), &result);
        result
    }

    fn on_outcome<T: 'static, E: Error + 'static>(
        &self,
        elapsed: Duration,
        result: &Result<T, E>,
    ) {
        match result {
            Ok(value) => self.on_result(elapsed, value),
            Err(error) => self.on_error(elapsed, error),
        }
    }

    fn elapsed_since(&self, start: u64) -> Duration {
        Duration::from_nanos(self.clock.nanos().saturating_sub(start))
    }

    pub fn transition_to_closed(&self) {
        self.force(Trigger::Force(State::Closed));
    }

    pub fn transition_to_open(&self) {
        self.force(Trigger::Force(State::Open));
    }

    pub fn transition_to_half_open(&self) {
        self.force(Trigger::Force(State::HalfOpen));
    }

    pub fn transition_to_disabled(&self) {
        self.force(Trigger::Force(State::Disabled));
    }

    pub fn transition_to_forced_open(&self) {
        self.force(Trigger::Force(State::ForcedOpen));
    }

    pub fn transition_to_metrics_only(&self) {
        self.force(Trigger::Force(State::MetricsOnly));
    }

    /// Return to a closed state with an empty window
    pub fn reset(&self) {
        self.force(Trigger::Reset);
        info!(name = %self.name, "circuit breaker reset");
        self.events.publish(&self.name, CircuitBreakerEvent::Reset);
    }

    fn force(&self, trigger: Trigger) {
        loop {
            let current = self.cell.load_full();
            if transition(current.state, trigger).is_none() {
                return;
            }
            if self.transition(&current, trigger, None).is_some() || self.is_current(&current) {
                return;
            }
        }
    }

    fn record(&self, elapsed: Duration, failed: bool, event: CircuitBreakerEvent) {
        let cell = self.cell.load_full();
        if !cell.state.records_outcomes() {
            return;
        }
        self.events.publish(&self.name, event);

        let slow = elapsed >= self.config.slow_call_duration_threshold;
        let snapshot = cell.metrics.record(elapsed, Outcome::classify(failed, slow));
        debug!(
            name = %self.name,
            state = %cell.state,
            failed,
            slow,
            total = snapshot.total_calls(),
            "call recorded"
        );

        match cell.state {
            State::Closed => {
                if self.exceeds_thresholds(&snapshot) {
                    self.transition(&cell, Trigger::ThresholdsExceeded, Some(&snapshot));
                }
            }
            State::HalfOpen => {
                if self.half_open_expired(&cell) {
                    self.transition(&cell, Trigger::HalfOpenWaitElapsed, None);
                } else if snapshot.total_calls()
                    >= u64::from(self.config.permitted_number_of_calls_in_half_open_state)
                {
                    if self.exceeds_thresholds(&snapshot) {
                        self.transition(&cell, Trigger::ProbesFailed, Some(&snapshot));
                    } else {
                        self.transition(&cell, Trigger::ProbesPassed, None);
                    }
                }
            }
            State::MetricsOnly => {
                let exceeded = self.exceeds_thresholds(&snapshot);
                if exceeded && !cell.rate_exceeded.swap(true, Ordering::AcqRel) {
                    self.publish_rates_exceeded(&snapshot);
                } else if !exceeded {
                    cell.rate_exceeded.store(false, Ordering::Release);
                }
            }
            State::Open | State::ForcedOpen | State::Disabled => {}
        }
    }

    fn exceeds_thresholds(&self, snapshot: &Snapshot) -> bool {
        snapshot.failure_rate() >= self.config.failure_rate_threshold
            || snapshot.slow_call_rate() >= self.config.slow_call_rate_threshold
    }

    fn publish_rates_exceeded(&self, snapshot: &Snapshot) {
        let failure_rate = snapshot.failure_rate();
        if failure_rate >= self.config.failure_rate_threshold {
            self.events.publish(
                &self.name,
                CircuitBreakerEvent::FailureRateExceeded { failure_rate },
            );
        }
        let slow_call_rate = snapshot.slow_call_rate();
        if slow_call_rate >= self.config.slow_call_rate_threshold {
            self.events.publish(
                &self.name,
                CircuitBreakerEvent::SlowCallRateExceeded { slow_call_rate },
            );
        }
    }

    fn half_open_expired(&self, cell: &StateCell) -> bool {
        let max_wait = self.config.max_wait_duration_in_half_open_state;
        !max_wait.is_zero()
            && self.clock.nanos().saturating_sub(cell.entered_at) >= duration_nanos(max_wait)
    }

    fn is_current(&self, cell: &Arc<StateCell>) -> bool {
        Arc::ptr_eq(&self.cell.load(), cell)
    }

    /// Apply `trigger` to the observed cell. Returns the installed cell if
    /// this caller won the compare-and-swap.
    fn transition(
        &self,
        current: &Arc<StateCell>,
        trigger: Trigger,
        breach: Option<&Snapshot>,
    ) -> Option<Arc<StateCell>> {
        let to = transition(current.state, trigger)?;
        let attempts = match to {
            State::Open => current.attempts.saturating_add(1),
            State::HalfOpen => current.attempts,
            _ => 0,
        };
        let reserve_probe = trigger == Trigger::OpenWaitElapsed;
        let inherited = (to == State::Open).then_some(&current.metrics);
        let next = match build_cell(
            &self.config,
            &self.clock,
            to,
            current.generation + 1,
            attempts,
            reserve_probe,
            inherited,
        ) {
            Ok(cell) => Arc::new(cell),
            Err(err) => {
                warn!(name = %self.name, error = %err, "could not build window for new state");
                return None;
            }
        };

        let previous = self.cell.compare_and_swap(current, Arc::clone(&next));
        if !Arc::ptr_eq(&previous, current) {
            return None;
        }

        if let Some(snapshot) = breach {
            self.publish_rates_exceeded(snapshot);
        }
        let change = StateTransition {
            from: current.state,
            to,
        };
        if change.from != change.to {
            info!(
                name = %self.name,
                from = %change.from,
                to = %change.to,
                generation = next.generation,
                "circuit breaker state transition"
            );
            self.events
                .publish(&self.name, CircuitBreakerEvent::StateTransition(change));
        }
        Some(next)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

fn build_cell(
    config: &CircuitBreakerConfig,
    clock: &SharedClock,
    state: State,
    generation: u64,
    attempts: u32,
    reserve_probe: bool,
    inherited: Option<&Arc<SlidingWindowMetrics>>,
) -> Result<StateCell, ResilienceError> {
    let now = clock.nanos();
    let probes = i64::from(config.permitted_number_of_calls_in_half_open_state);
    let metrics = match inherited {
        Some(metrics) => Arc::clone(metrics),
        None if state == State::HalfOpen => Arc::new(SlidingWindowMetrics::count_based(
            probes as usize,
            probes as u64,
        )?),
        None => Arc::new(SlidingWindowMetrics::of_type(
            config.sliding_window_type,
            config.sliding_window_size,
            config.effective_minimum_number_of_calls(),
            Arc::clone(clock),
        )?),
    };
    let open_until = if state == State::Open {
        now.saturating_add(duration_nanos(config.wait_duration_in_open_state.wait(attempts)))
    } else {
        0
    };
    Ok(StateCell {
        state,
        generation,
        metrics,
        entered_at: now,
        open_until,
        attempts,
        probes: AtomicI64::new(if reserve_probe { probes - 1 } else { probes }),
        rate_exceeded: AtomicBool::new(false),
    })
}

fn take_probe(probes: &AtomicI64) -> bool {
    probes
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| (p > 0).then(|| p - 1))
        .is_ok()
}

/// Releases an acquired permission unless the call ran to completion
struct PermissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> PermissionGuard<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PermissionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_permission();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::interval::IntervalFunction;
    use crate::metrics::NOT_MEANINGFUL;
    use crate::predicate::error_type;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl Error for Boom {}

    fn small_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_size: 5,
            minimum_number_of_calls: 5,
            failure_rate_threshold: 50.0,
            permitted_number_of_calls_in_half_open_state: 3,
            wait_duration_in_open_state: IntervalFunction::fixed(Duration::from_secs(1)),
            ..Default::default()
        }
    }

    fn breaker_with_clock(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::with_clock("test", config, clock.clone()).unwrap();
        (breaker, clock)
    }

    fn open(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            breaker.on_error(Duration::ZERO, &Boom);
        }
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_opens_when_failure_rate_reached() {
        let (breaker, _clock) = breaker_with_clock(small_config());
        for _ in 0..3 {
            breaker.on_error(Duration::ZERO, &Boom);
        }
        breaker.on_success(Duration::ZERO);
        assert_eq!(breaker.state(), State::Closed, "only 4 of 5 minimum calls");
        breaker.on_success(Duration::ZERO);
        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.try_acquire_permission());
        let metrics = breaker.metrics();
        assert_eq!(metrics.not_permitted_calls, 1);
        assert_eq!(metrics.failure_rate(), 60.0, "open keeps the window that tripped it");
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let (breaker, _clock) = breaker_with_clock(small_config());
        breaker.on_error(Duration::ZERO, &Boom);
        breaker.on_error(Duration::ZERO, &Boom);
        for _ in 0..3 {
            breaker.on_success(Duration::ZERO);
        }
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.metrics().failure_rate(), 40.0);
    }

    #[test]
    fn test_slow_calls_open_the_breaker() {
        let config = CircuitBreakerConfig {
            slow_call_rate_threshold: 60.0,
            slow_call_duration_threshold: Duration::from_millis(100),
            ..small_config()
        };
        let (breaker, _clock) = breaker_with_clock(config);
        for _ in 0..3 {
            breaker.on_success(Duration::from_millis(200));
        }
        breaker.on_success(Duration::from_millis(10));
        breaker.on_success(Duration::from_millis(10));
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_open_to_half_open_after_wait() {
        let (breaker, clock) = breaker_with_clock(small_config());
        open(&breaker);

        clock.advance(Duration::from_millis(999));
        assert!(!breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::Open);

        clock.advance(Duration::from_millis(1));
        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::HalfOpen);
        assert_eq!(breaker.metrics().remaining_half_open_calls, 2);
    }

    #[test]
    fn test_half_open_failures_reopen() {
        let (breaker, clock) = breaker_with_clock(small_config());
        open(&breaker);
        clock.advance(Duration::from_secs(1));

        assert!(breaker.try_acquire_permission());
        breaker.on_error(Duration::ZERO, &Boom);
        assert!(breaker.try_acquire_permission());
        breaker.on_error(Duration::ZERO, &Boom);
        assert!(breaker.try_acquire_permission());
        breaker.on_success(Duration::ZERO);

        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_half_open_successes_close_with_fresh_window() {
        let (breaker, clock) = breaker_with_clock(small_config());
        open(&breaker);
        clock.advance(Duration::from_secs(1));

        assert!(breaker.try_acquire_permission());
        breaker.on_error(Duration::ZERO, &Boom);
        breaker.on_success(Duration::ZERO);
        breaker.on_success(Duration::ZERO);

        assert_eq!(breaker.state(), State::Closed);
        let metrics = breaker.metrics();
        assert_eq!(metrics.snapshot.total_calls(), 0);
        assert_eq!(metrics.failure_rate(), NOT_MEANINGFUL);
    }

    #[test]
    fn test_half_open_probes_are_limited() {
        let (breaker, clock) = breaker_with_clock(small_config());
        open(&breaker);
        clock.advance(Duration::from_secs(1));

        assert!(breaker.try_acquire_permission());
        assert!(breaker.try_acquire_permission());
        assert!(breaker.try_acquire_permission());
        assert!(!breaker.try_acquire_permission(), "only 3 probes");

        breaker.release_permission();
        assert!(breaker.try_acquire_permission(), "released probe is reusable");
    }

    #[test]
    fn test_open_wait_grows_with_consecutive_opens() {
        let config = CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 1,
            wait_duration_in_open_state: IntervalFunction::exponential(Duration::from_secs(1), 2.0)
                .unwrap(),
            ..small_config()
        };
        let (breaker, clock) = breaker_with_clock(config);
        open(&breaker);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.try_acquire_permission());
        breaker.on_error(Duration::ZERO, &Boom);
        assert_eq!(breaker.state(), State::Open);

        clock.advance(Duration::from_millis(1500));
        assert!(!breaker.try_acquire_permission(), "second open lasts 2s");
        clock.advance(Duration::from_millis(500));
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn test_half_open_max_wait_reopens() {
        let config = CircuitBreakerConfig {
            max_wait_duration_in_half_open_state: Duration::from_secs(5),
            ..small_config()
        };
        let (breaker, clock) = breaker_with_clock(config);
        open(&breaker);
        clock.advance(Duration::from_secs(1));
        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::HalfOpen);

        clock.advance(Duration::from_secs(5));
        assert!(!breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_ignored_errors_are_not_recorded() {
        let config = CircuitBreakerConfig {
            ignore_error: Some(error_type::<Boom>()),
            ..small_config()
        };
        let (breaker, _clock) = breaker_with_clock(config);
        for _ in 0..10 {
            breaker.on_error(Duration::ZERO, &Boom);
        }
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.metrics().snapshot.total_calls(), 0);
    }

    #[test]
    fn test_record_result_counts_as_failure() {
        let config = CircuitBreakerConfig {
            record_result: Some(crate::predicate::result_matching(|code: &u16| *code >= 500)),
            ..small_config()
        };
        let (breaker, _clock) = breaker_with_clock(config);
        for _ in 0..5 {
            let result: Result<u16, ResilienceError> = breaker.execute(|| Ok(503));
            assert_eq!(result, Ok(503), "value still reaches the caller");
        }
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_administrative_states() {
        let (breaker, _clock) = breaker_with_clock(small_config());

        breaker.transition_to_forced_open();
        assert!(!breaker.try_acquire_permission());

        breaker.transition_to_disabled();
        for _ in 0..10 {
            breaker.on_error(Duration::ZERO, &Boom);
        }
        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.metrics().snapshot.total_calls(), 0, "disabled records nothing");

        breaker.transition_to_metrics_only();
        for _ in 0..10 {
            breaker.on_error(Duration::ZERO, &Boom);
        }
        assert_eq!(breaker.state(), State::MetricsOnly, "never opens");
        assert_eq!(breaker.metrics().failure_rate(), 100.0);
    }

    #[test]
    fn test_administrative_transitions_are_idempotent() {
        let (breaker, _clock) = breaker_with_clock(small_config());
        breaker.transition_to_forced_open();
        let generation = breaker.generation();
        breaker.transition_to_forced_open();
        assert_eq!(breaker.generation(), generation);
    }

    #[test]
    fn test_reset_clears_window() {
        let (breaker, _clock) = breaker_with_clock(small_config());
        open(&breaker);
        breaker.reset();
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.metrics().snapshot.total_calls(), 0);
    }

    #[test]
    fn test_events_in_order() {
        let (breaker, _clock) = breaker_with_clock(small_config());
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        breaker
            .event_publisher()
            .subscribe(move |e| sink.lock().push(e.kind()));

        open(&breaker);
        assert!(!breaker.try_acquire_permission());

        let kinds = kinds.lock();
        assert_eq!(kinds.iter().filter(|k| **k == "ERROR").count(), 5);
        let tail: Vec<_> = kinds.iter().rev().take(3).rev().copied().collect();
        assert_eq!(
            tail,
            vec!["FAILURE_RATE_EXCEEDED", "STATE_TRANSITION", "NOT_PERMITTED"]
        );
    }

    #[test]
    fn test_execute_returns_rejection_through_caller_error() {
        let (breaker, _clock) = breaker_with_clock(small_config());
        breaker.transition_to_forced_open();
        let calls = AtomicU64::new(0);
        let result: Result<(), ResilienceError> = breaker.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(
            result,
            Err(ResilienceError::CallNotPermitted { ref state, .. }) if state == "FORCED_OPEN"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_open_to_half_open_has_single_winner() {
        let config = CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 1,
            ..small_config()
        };
        let (breaker, clock) = breaker_with_clock(config);
        open(&breaker);
        clock.advance(Duration::from_secs(1));

        let breaker = Arc::new(breaker);
        let transitions = Arc::new(AtomicU64::new(0));
        let t = Arc::clone(&transitions);
        breaker.event_publisher().subscribe_kind("STATE_TRANSITION", move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || breaker.try_acquire_permission())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 1, "exactly one probe admitted");
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), State::HalfOpen);
    }

    #[tokio::test]
    async fn test_execute_async_records_outcome() {
        let (breaker, _clock) = breaker_with_clock(small_config());
        let value: Result<u32, ResilienceError> = breaker.execute_async(|| async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
        assert_eq!(breaker.metrics().snapshot.total_calls(), 1);
    }
}

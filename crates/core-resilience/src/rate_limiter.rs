//! Rate limiting for preventing service overload
//!
//! Time is divided into cycles of `limit_refresh_period`. Each cycle starts
//! with `limit_for_period` permissions. All mutable state (cycle, permissions,
//! pending wait, active config) sits in one immutable [`LimiterState`]
//! swapped with compare-and-swap, so a cycle rollover is applied once no
//! matter how many callers race to observe it.
//!
//! A caller that cannot be served in the current cycle reserves permissions
//! from a future cycle, driving the counter negative, as long as the wait
//! until that cycle fits within `timeout_duration`. The wait for `n`
//! permissions with `available` left in the current cycle is:
//!
//! ```text
//! 0                                                          if available >= n
//! nanos_to_next_cycle
//!   + ceil((n - available - limit_for_period) / limit_for_period) * period   otherwise
//! ```

use crate::clock::{duration_nanos, SharedClock, SystemClock};
use crate::error::ResilienceError;
use crate::event::{EventKind, EventPublisher};
use crate::registry::{Registry, Tags};
use arc_swap::ArcSwap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry of named rate limiters
pub type RateLimiterRegistry = Registry<RateLimiter, RateLimiterConfig>;

/// Configuration for a rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Permissions available per refresh period
    pub limit_for_period: u32,
    pub limit_refresh_period: Duration,
    /// Longest a caller may wait for a permission
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_nanos(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// `limit` permissions per second
    pub fn per_second(limit: u32) -> Self {
        Self {
            limit_for_period: limit,
            limit_refresh_period: Duration::from_secs(1),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.limit_for_period == 0 {
            return Err(ResilienceError::InvalidConfig(
                "limit_for_period must be greater than 0".to_string(),
            ));
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "limit_refresh_period must be at least 1ns".to_string(),
            ));
        }
        Ok(())
    }
}

/// Events emitted by a rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimiterEvent {
    SuccessfulAcquire { permits: u32 },
    FailedAcquire { permits: u32 },
    Drained { permits: i64 },
}

impl EventKind for RateLimiterEvent {
    fn kind(&self) -> &'static str {
        match self {
            RateLimiterEvent::SuccessfulAcquire { .. } => "SUCCESSFUL_ACQUIRE",
            RateLimiterEvent::FailedAcquire { .. } => "FAILED_ACQUIRE",
            RateLimiterEvent::Drained { .. } => "DRAINED",
        }
    }
}

/// Point-in-time view of a rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    /// Permissions left in the current cycle; negative when future cycles
    /// are already reserved
    pub available_permissions: i64,
    /// Callers currently sleeping on a reservation
    pub number_of_waiting_threads: usize,
    /// Wait that was required by the most recent acquisition
    pub nanos_to_wait: u64,
    pub cycle: u64,
}

/// Immutable snapshot swapped on every acquisition
#[derive(Debug, Clone)]
struct LimiterState {
    config: Arc<RateLimiterConfig>,
    cycle: u64,
    permissions: i64,
    nanos_to_wait: u64,
}

/// Atomic, lock-free rate limiter
///
/// # Example
/// ```
/// use bulwark_core_resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
/// use std::time::Duration;
///
/// let limiter = RateLimiter::new(
///     "api",
///     RateLimiterConfig {
///         limit_for_period: 2,
///         limit_refresh_period: Duration::from_secs(1),
///         timeout_duration: Duration::ZERO,
///     },
/// )
/// .unwrap();
///
/// assert!(limiter.acquire_permission(1));
/// assert!(limiter.acquire_permission(1));
/// assert!(!limiter.acquire_permission(1));
/// ```
pub struct RateLimiter {
    name: String,
    clock: SharedClock,
    origin: u64,
    state: ArcSwap<LimiterState>,
    waiting_threads: AtomicUsize,
    tags: Tags,
    events: EventPublisher<RateLimiterEvent>,
}

impl RateLimiter {
    /// Create a rate limiter on the system clock
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(name, config, SystemClock::shared())
    }

    /// Create a rate limiter reading time from `clock`
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: SharedClock,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let name = name.into();
        debug!(name = %name, ?config, "rate limiter created");
        let permissions = i64::from(config.limit_for_period);
        Ok(Self {
            name,
            origin: clock.nanos(),
            clock,
            state: ArcSwap::from_pointee(LimiterState {
                config: Arc::new(config),
                cycle: 0,
                permissions,
                nanos_to_wait: 0,
            }),
            waiting_threads: AtomicUsize::new(0),
            tags: Tags::new(),
            events: EventPublisher::default(),
        })
    }

    /// Registry creating limiters on the system clock
    pub fn registry(default_config: RateLimiterConfig) -> RateLimiterRegistry {
        Self::registry_with_clock(default_config, SystemClock::shared())
    }

    /// Registry whose limiters all share `clock`
    pub fn registry_with_clock(default_config: RateLimiterConfig, clock: SharedClock) -> RateLimiterRegistry {
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

    /// Currently active configuration
    pub fn config(&self) -> RateLimiterConfig {
        (*self.state.load().config).clone()
    }

    pub fn event_publisher(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.events
    }

    /// Metrics as of now, with any pending cycle rollover applied
    pub fn metrics(&self) -> RateLimiterMetrics {
        let current = self.state.load_full();
        let estimated = self.next_state(0, 0, &current);
        RateLimiterMetrics {
            available_permissions: estimated.permissions,
            number_of_waiting_threads: self.waiting_threads.load(Ordering::Acquire),
            nanos_to_wait: current.nanos_to_wait,
            cycle: estimated.cycle,
        }
    }

    /// Change the number of permissions per period. The current cycle keeps
    /// what it has; the next refresh uses the new limit.
    pub fn change_limit_for_period(&self, limit_for_period: u32) -> Result<(), ResilienceError> {
        self.change_config(|config| config.limit_for_period = limit_for_period)?;
        info!(name = %self.name, limit_for_period, "rate limit changed");
        Ok(())
    }

    /// Change how long callers may wait for a permission
    pub fn change_timeout_duration(&self, timeout_duration: Duration) -> Result<(), ResilienceError> {
        self.change_config(|config| config.timeout_duration = timeout_duration)?;
        info!(name = %self.name, ?timeout_duration, "rate limiter timeout changed");
        Ok(())
    }

    fn change_config(&self, edit: impl Fn(&mut RateLimiterConfig)) -> Result<(), ResilienceError> {
        loop {
            let current = self.state.load_full();
            let mut config = (*current.config).clone();
            edit(&mut config);
            config.validate()?;
            let next = Arc::new(LimiterState {
                config: Arc::new(config),
                ..(*current).clone()
            });
            if self.swap(&current, next) {
                return Ok(());
            }
        }
    }

    /// Acquire `permits`, sleeping the thread if they are only available
    /// within `timeout_duration`.
    ///
    /// A caller that cannot be served in time sleeps for the full timeout
    /// and is then rejected; no permissions are consumed on that path.
    pub fn acquire_permission(&self, permits: u32) -> bool {
        let timeout = self.state.load().config.timeout_duration;
        let reservation = self.update_state(permits, duration_nanos(timeout));
        match self.settle(permits, timeout, reservation) {
            Wait::Ready => true,
            Wait::Sleep(wait) => {
                self.sleep_blocking(wait);
                true
            }
            Wait::Reject(timeout) => {
                self.sleep_blocking(timeout);
                false
            }
        }
    }

    /// Async variant of [`acquire_permission`](Self::acquire_permission).
    ///
    /// Dropping the future while it waits hands the reserved permissions back.
    pub async fn acquire_permission_async(&self, permits: u32) -> bool {
        let timeout = self.state.load().config.timeout_duration;
        let reservation = self.update_state(permits, duration_nanos(timeout));
        match self.settle(permits, timeout, reservation) {
            Wait::Ready => true,
            Wait::Sleep(wait) => {
                let refund = Refund {
                    limiter: self,
                    permits,
                    armed: true,
                };
                self.sleep_async(wait).await;
                refund.disarm();
                true
            }
            Wait::Reject(timeout) => {
                self.sleep_async(timeout).await;
                false
            }
        }
    }

    /// Reserve `permits` without waiting.
    ///
    /// Returns how long the caller must wait before using them, or `None`
    /// if they cannot be had within `timeout_duration`. Nothing is
    /// reserved in the `None` case.
    pub fn reserve_permission(&self, permits: u32) -> Option<Duration> {
        let timeout = self.state.load().config.timeout_duration;
        let reservation = self.update_state(permits, duration_nanos(timeout));
        match self.settle(permits, timeout, reservation) {
            Wait::Ready => Some(Duration::ZERO),
            Wait::Sleep(wait) => Some(wait),
            Wait::Reject(_) => None,
        }
    }

    /// Acquire one permission or fail with [`ResilienceError::RequestNotPermitted`]
    pub fn acquire(&self) -> Result<(), ResilienceError> {
        if self.acquire_permission(1) {
            Ok(())
        } else {
            Err(self.not_permitted())
        }
    }

    /// Async variant of [`acquire`](Self::acquire)
    pub async fn acquire_async(&self) -> Result<(), ResilienceError> {
        if self.acquire_permission_async(1).await {
            Ok(())
        } else {
            Err(self.not_permitted())
        }
    }

    /// Run `operation` once a permission is granted
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<ResilienceError>,
    {
        self.acquire()?;
        operation()
    }

    /// Async variant of [`execute`](Self::execute)
    pub async fn execute_async<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        self.acquire_async().await?;
        operation().await
    }

    /// Throw away every permission left in the current cycle. Existing
    /// debt is kept.
    pub fn drain_permissions(&self) {
        loop {
            let current = self.state.load_full();
            let refreshed = self.next_state(0, 0, &current);
            let drained = refreshed.permissions.max(0);
            let next = Arc::new(LimiterState {
                permissions: refreshed.permissions.min(0),
                nanos_to_wait: 0,
                ..refreshed
            });
            if self.swap(&current, next) {
                debug!(name = %self.name, drained, "permissions drained");
                self.events
                    .publish(&self.name, RateLimiterEvent::Drained { permits: drained });
                return;
            }
        }
    }

    fn not_permitted(&self) -> ResilienceError {
        ResilienceError::RequestNotPermitted {
            name: self.name.clone(),
        }
    }

    /// CAS loop applying rollover and reservation. Returns the installed state.
    fn update_state(&self, permits: u32, timeout_nanos: u64) -> Arc<LimiterState> {
        loop {
            let current = self.state.load_full();
            let next = Arc::new(self.next_state(permits, timeout_nanos, &current));
            if self.swap(&current, Arc::clone(&next)) {
                return next;
            }
        }
    }

    fn swap(&self, current: &Arc<LimiterState>, next: Arc<LimiterState>) -> bool {
        let previous = self.state.compare_and_swap(current, next);
        Arc::ptr_eq(&previous, current)
    }

    /// Pure successor of `current` for a request of `permits`
    fn next_state(&self, permits: u32, timeout_nanos: u64, current: &LimiterState) -> LimiterState {
        let config = &current.config;
        let period = duration_nanos(config.limit_refresh_period).max(1);
        let limit = i64::from(config.limit_for_period);
        let now = self.clock.nanos().saturating_sub(self.origin);
        let now_cycle = now / period;

        let mut cycle = current.cycle;
        let mut permissions = current.permissions;
        if now_cycle > cycle {
            let elapsed = (now_cycle - cycle).min(i64::MAX as u64) as i64;
            let accumulated = elapsed.saturating_mul(limit);
            cycle = now_cycle;
            permissions = permissions.saturating_add(accumulated).min(limit);
        }

        let wait = nanos_to_wait(i64::from(permits), period, limit, permissions, now, cycle);
        if wait <= timeout_nanos {
            permissions -= i64::from(permits);
        }
        LimiterState {
            config: Arc::clone(config),
            cycle,
            permissions,
            nanos_to_wait: wait,
        }
    }

    fn settle(&self, permits: u32, timeout: Duration, state: Arc<LimiterState>) -> Wait {
        let timeout_nanos = duration_nanos(timeout);
        if state.nanos_to_wait == 0 {
            self.publish_acquired(permits);
            Wait::Ready
        } else if state.nanos_to_wait <= timeout_nanos {
            debug!(name = %self.name, permits, wait_ns = state.nanos_to_wait, "permission reserved");
            self.publish_acquired(permits);
            Wait::Sleep(Duration::from_nanos(state.nanos_to_wait))
        } else {
            warn!(name = %self.name, permits, "request not permitted");
            self.events
                .publish(&self.name, RateLimiterEvent::FailedAcquire { permits });
            Wait::Reject(timeout)
        }
    }

    fn publish_acquired(&self, permits: u32) {
        self.events
            .publish(&self.name, RateLimiterEvent::SuccessfulAcquire { permits });
    }

    fn sleep_blocking(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.waiting_threads.fetch_add(1, Ordering::AcqRel);
        std::thread::sleep(duration);
        self.waiting_threads.fetch_sub(1, Ordering::AcqRel);
    }

    async fn sleep_async(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let _waiting = WaitingGuard::enter(&self.waiting_threads);
        tokio::time::sleep(duration).await;
    }

    /// Give reserved permissions back, capped at one full cycle
    fn refund(&self, permits: u32) {
        loop {
            let current = self.state.load_full();
            let limit = i64::from(current.config.limit_for_period);
            let next = Arc::new(LimiterState {
                permissions: (current.permissions + i64::from(permits)).min(limit),
                ..(*current).clone()
            });
            if self.swap(&current, next) {
                debug!(name = %self.name, permits, "reservation refunded");
                return;
            }
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &state.config)
            .field("permissions", &state.permissions)
            .finish()
    }
}

enum Wait {
    Ready,
    Sleep(Duration),
    Reject(Duration),
}

/// Nanoseconds until `permits` permissions exist, given `available` now
fn nanos_to_wait(permits: i64, period: u64, limit: i64, available: i64, now: u64, cycle: u64) -> u64 {
    if available >= permits {
        return 0;
    }
    let next_cycle_at = cycle.saturating_add(1).saturating_mul(period);
    let to_next_cycle = next_cycle_at.saturating_sub(now);
    let at_next_cycle = available + limit;
    let shortfall = permits - at_next_cycle;
    let full_cycles = if shortfall > 0 {
        ((shortfall + limit - 1) / limit) as u64
    } else {
        0
    };
    full_cycles
        .saturating_mul(period)
        .saturating_add(to_next_cycle)
}

struct Refund<'a> {
    limiter: &'a RateLimiter,
    permits: u32,
    armed: bool,
}

impl Refund<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Refund<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.refund(self.permits);
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(limit: u32, period: Duration, timeout: Duration) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimiterConfig {
            limit_for_period: limit,
            limit_refresh_period: period,
            timeout_duration: timeout,
        };
        let limiter = RateLimiter::with_clock("test", config, clock.clone()).unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_one_per_second() {
        let (limiter, clock) = limiter(1, Duration::from_secs(1), Duration::ZERO);
        assert!(limiter.acquire_permission(1));
        assert!(!limiter.acquire_permission(1), "second call in the same period");

        clock.advance(Duration::from_secs(1));
        assert!(limiter.acquire_permission(1));
    }

    #[test]
    fn test_refill_is_capped_at_limit() {
        let (limiter, clock) = limiter(3, Duration::from_secs(1), Duration::ZERO);
        clock.advance(Duration::from_secs(10));
        assert_eq!(limiter.metrics().available_permissions, 3);
    }

    #[test]
    fn test_reserve_returns_wait_to_next_cycle() {
        let (limiter, clock) = limiter(1, Duration::from_secs(1), Duration::from_secs(5));
        clock.advance(Duration::from_millis(200));

        assert_eq!(limiter.reserve_permission(1), Some(Duration::ZERO));
        assert_eq!(limiter.reserve_permission(1), Some(Duration::from_millis(800)));
        assert_eq!(limiter.reserve_permission(1), Some(Duration::from_millis(1800)));
        assert_eq!(limiter.metrics().available_permissions, -2);
    }

    #[test]
    fn test_reserve_beyond_timeout_takes_nothing() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(1), Duration::from_millis(500));
        assert_eq!(limiter.reserve_permission(1), Some(Duration::ZERO));
        assert_eq!(limiter.reserve_permission(1), None);
        assert_eq!(limiter.metrics().available_permissions, 0);
    }

    #[test]
    fn test_debt_is_repaid_by_next_refresh() {
        let (limiter, clock) = limiter(2, Duration::from_secs(1), Duration::from_secs(10));
        for _ in 0..4 {
            assert!(limiter.reserve_permission(1).is_some());
        }
        assert_eq!(limiter.metrics().available_permissions, -2);
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.metrics().available_permissions, 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.metrics().available_permissions, 2);
    }

    #[test]
    fn test_multi_permit_wait() {
        assert_eq!(nanos_to_wait(5, 100, 2, 0, 30, 0), 70 + 200);
        assert_eq!(nanos_to_wait(1, 100, 2, 1, 30, 0), 0);
        assert_eq!(nanos_to_wait(2, 100, 2, 0, 30, 0), 70);
    }

    #[test]
    fn test_drain() {
        let (limiter, _clock) = limiter(5, Duration::from_secs(1), Duration::ZERO);
        let drained = Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&drained);
        limiter.event_publisher().subscribe(move |e| {
            if let RateLimiterEvent::Drained { permits } = e.payload() {
                *sink.lock() = Some(*permits);
            }
        });
        assert!(limiter.acquire_permission(1));
        limiter.drain_permissions();
        assert_eq!(*drained.lock(), Some(4));
        assert!(!limiter.acquire_permission(1));
    }

    #[test]
    fn test_limit_change_applies_from_next_cycle() {
        let (limiter, clock) = limiter(1, Duration::from_secs(1), Duration::ZERO);
        limiter.change_limit_for_period(3).unwrap();
        assert_eq!(limiter.metrics().available_permissions, 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.metrics().available_permissions, 3);
        assert!(limiter.change_limit_for_period(0).is_err());
        assert_eq!(limiter.config().limit_for_period, 3);
    }

    #[test]
    fn test_events() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(1), Duration::ZERO);
        let kinds = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        limiter
            .event_publisher()
            .subscribe(move |e| sink.lock().push(e.kind()));
        limiter.acquire_permission(1);
        limiter.acquire_permission(1);
        assert_eq!(*kinds.lock(), vec!["SUCCESSFUL_ACQUIRE", "FAILED_ACQUIRE"]);
    }

    #[test]
    fn test_execute_maps_rejection() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(1), Duration::ZERO);
        let first: Result<u8, ResilienceError> = limiter.execute(|| Ok(1));
        assert_eq!(first, Ok(1));
        let second: Result<u8, ResilienceError> = limiter.execute(|| Ok(2));
        assert!(matches!(second, Err(ResilienceError::RequestNotPermitted { .. })));
    }

    #[test]
    fn test_concurrent_acquisitions_never_exceed_limit() {
        let (limiter, _clock) = limiter(50, Duration::from_secs(1), Duration::ZERO);
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| limiter.acquire_permission(1)).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_acquire_waits_for_next_cycle() {
        let limiter = RateLimiter::new(
            "async",
            RateLimiterConfig {
                limit_for_period: 1,
                limit_refresh_period: Duration::from_millis(100),
                timeout_duration: Duration::from_secs(1),
            },
        )
        .unwrap();
        assert!(limiter.acquire_permission_async(1).await);
        assert!(limiter.acquire_permission_async(1).await, "waits into the next cycle");
        assert_eq!(limiter.metrics().number_of_waiting_threads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_refunds_reservation() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(1), Duration::from_secs(5));
        assert!(limiter.acquire_permission_async(1).await);

        let pending = limiter.acquire_permission_async(1);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(limiter.metrics().available_permissions, 0, "reservation handed back");
    }
}

//! Bulkhead: bounded concurrency for a protected resource
//!
//! A bulkhead hands out at most `max_concurrent_calls` permits. A caller
//! without a permit waits up to `max_wait_duration` (zero means fail
//! immediately) and is then rejected with
//! [`ResilienceError::BulkheadFull`].
//!
//! Permits are RAII guards: dropping a [`BulkheadPermit`] returns it, so a
//! permit is released exactly once on every exit path, including panics
//! and cancelled futures.
//!
//! # Example
//!
//! ```
//! use bulwark_core_resilience::bulkhead::{Bulkhead, BulkheadConfig};
//!
//! let bulkhead = Bulkhead::new("db", BulkheadConfig {
//!     max_concurrent_calls: 1,
//!     ..Default::default()
//! }).unwrap();
//!
//! let permit = bulkhead.acquire().unwrap();
//! assert!(bulkhead.acquire().is_err());
//! drop(permit);
//! assert!(bulkhead.acquire().is_ok());
//! ```

use crate::error::ResilienceError;
use crate::event::{EventKind, EventPublisher};
use crate::registry::{Registry, Tags};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Registry of named bulkheads
pub type BulkheadRegistry = Registry<Bulkhead, BulkheadConfig>;

/// Configuration for a bulkhead
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    pub max_concurrent_calls: usize,
    /// How long a caller may wait for a permit
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_concurrent_calls == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_concurrent_calls must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Events emitted by a bulkhead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkheadEvent {
    CallPermitted,
    CallRejected,
    CallFinished,
}

impl EventKind for BulkheadEvent {
    fn kind(&self) -> &'static str {
        match self {
            BulkheadEvent::CallPermitted => "CALL_PERMITTED",
            BulkheadEvent::CallRejected => "CALL_REJECTED",
            BulkheadEvent::CallFinished => "CALL_FINISHED",
        }
    }
}

/// Point-in-time view of a bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub available_concurrent_calls: usize,
    pub max_allowed_concurrent_calls: usize,
}

#[derive(Debug)]
struct Permits {
    /// `max - in_flight`; negative after the limit shrinks below the
    /// number of calls already running
    available: isize,
    config: BulkheadConfig,
}

/// Semaphore-style concurrency limiter usable from threads and tasks
pub struct Bulkhead {
    name: String,
    permits: Mutex<Permits>,
    released: Condvar,
    released_async: Notify,
    tags: Tags,
    events: EventPublisher<BulkheadEvent>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        let name = name.into();
        debug!(name = %name, ?config, "bulkhead created");
        Ok(Self {
            name,
            permits: Mutex::new(Permits {
                available: config.max_concurrent_calls as isize,
                config,
            }),
            released: Condvar::new(),
            released_async: Notify::new(),
            tags: Tags::new(),
            events: EventPublisher::default(),
        })
    }

    /// Registry creating bulkheads from `default_config` unless told otherwise
    pub fn registry(default_config: BulkheadConfig) -> BulkheadRegistry {
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

    pub fn config(&self) -> BulkheadConfig {
        self.permits.lock().config.clone()
    }

    pub fn event_publisher(&self) -> &EventPublisher<BulkheadEvent> {
        &self.events
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        let permits = self.permits.lock();
        BulkheadMetrics {
            available_concurrent_calls: permits.available.max(0) as usize,
            max_allowed_concurrent_calls: permits.config.max_concurrent_calls,
        }
    }

    /// Change the limit and wait budget.
    ///
    /// Running calls keep their permits. Shrinking below the number in
    /// flight simply blocks new calls until enough of them finish.
    pub fn change_config(&self, config: BulkheadConfig) -> Result<(), ResilienceError> {
        config.validate()?;
        let max_concurrent_calls = config.max_concurrent_calls;
        let grew = {
            let mut permits = self.permits.lock();
            let delta = config.max_concurrent_calls as isize
                - permits.config.max_concurrent_calls as isize;
            permits.available += delta;
            permits.config = config;
            delta > 0
        };
        if grew {
            self.released.notify_all();
            self.released_async.notify_waiters();
        }
        info!(name = %self.name, max_concurrent_calls, "bulkhead limit changed");
        Ok(())
    }

    /// Take a permit, blocking the thread up to `max_wait_duration`.
    ///
    /// Every `true` must be paired with exactly one
    /// [`on_complete`](Self::on_complete). Prefer [`acquire`](Self::acquire).
    pub fn try_acquire_permission(&self) -> bool {
        let acquired = {
            let mut permits = self.permits.lock();
            let deadline = Instant::now().checked_add(permits.config.max_wait_duration);
            loop {
                if permits.available > 0 {
                    permits.available -= 1;
                    break true;
                }
                match deadline {
                    Some(deadline) => {
                        if self.released.wait_until(&mut permits, deadline).timed_out() {
                            let last_chance = permits.available > 0;
                            if last_chance {
                                permits.available -= 1;
                            }
                            break last_chance;
                        }
                    }
                    None => self.released.wait(&mut permits),
                }
            }
        };
        self.publish_decision(acquired);
        acquired
    }

    /// Async variant of [`try_acquire_permission`](Self::try_acquire_permission)
    pub async fn try_acquire_permission_async(&self) -> bool {
        let max_wait = self.permits.lock().config.max_wait_duration;
        let deadline = tokio::time::Instant::now().checked_add(max_wait);
        let acquired = loop {
            let notified = self.released_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.take_now() {
                break true;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        break self.take_now();
                    }
                }
                None => notified.await,
            }
        };
        self.publish_decision(acquired);
        acquired
    }

    /// Return a permit without publishing `CallFinished`
    pub fn release_permission(&self) {
        {
            let mut permits = self.permits.lock();
            let max = permits.config.max_concurrent_calls as isize;
            if permits.available >= max {
                warn!(name = %self.name, "permit released more often than acquired");
                return;
            }
            permits.available += 1;
        }
        self.released.notify_one();
        self.released_async.notify_waiters();
    }

    /// Return a permit after a finished call
    pub fn on_complete(&self) {
        self.release_permission();
        self.events.publish(&self.name, BulkheadEvent::CallFinished);
    }

    /// Take a permit or fail with [`ResilienceError::BulkheadFull`]
    pub fn acquire(&self) -> Result<BulkheadPermit<'_>, ResilienceError> {
        if self.try_acquire_permission() {
            Ok(BulkheadPermit { bulkhead: self })
        } else {
            Err(self.full())
        }
    }

    /// Async variant of [`acquire`](Self::acquire)
    pub async fn acquire_async(&self) -> Result<BulkheadPermit<'_>, ResilienceError> {
        if self.try_acquire_permission_async().await {
            Ok(BulkheadPermit { bulkhead: self })
        } else {
            Err(self.full())
        }
    }

    /// Run `operation` while holding a permit
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<ResilienceError>,
    {
        let _permit = self.acquire()?;
        operation()
    }

    /// Async variant of [`execute`](Self::execute)
    pub async fn execute_async<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let _permit = self.acquire_async().await?;
        operation().await
    }

    fn take_now(&self) -> bool {
        let mut permits = self.permits.lock();
        if permits.available > 0 {
            permits.available -= 1;
            true
        } else {
            false
        }
    }

    fn publish_decision(&self, acquired: bool) {
        if acquired {
            self.events.publish(&self.name, BulkheadEvent::CallPermitted);
        } else {
            warn!(name = %self.name, "bulkhead full, call rejected");
            self.events.publish(&self.name, BulkheadEvent::CallRejected);
        }
    }

    fn full(&self) -> ResilienceError {
        ResilienceError::BulkheadFull {
            name: self.name.clone(),
            max_concurrent_calls: self.permits.lock().config.max_concurrent_calls,
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("permits", &*self.permits.lock())
            .finish()
    }
}

/// Held permit; released on drop
#[must_use = "the permit is released as soon as it is dropped"]
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
}

impl fmt::Debug for BulkheadPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BulkheadPermit")
            .field(&self.bulkhead.name)
            .finish()
    }
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        self.bulkhead.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn bulkhead(max: usize, wait: Duration) -> Bulkhead {
        Bulkhead::new(
            "test",
            BulkheadConfig {
                max_concurrent_calls: max,
                max_wait_duration: wait,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_n_plus_one_is_rejected() {
        let bulkhead = bulkhead(3, Duration::ZERO);
        let permits: Vec<_> = (0..3).map(|_| bulkhead.acquire().unwrap()).collect();
        assert!(matches!(
            bulkhead.acquire(),
            Err(ResilienceError::BulkheadFull { max_concurrent_calls: 3, .. })
        ));

        drop(permits);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 3);
    }

    #[test]
    fn test_release_admits_exactly_one() {
        let bulkhead = bulkhead(2, Duration::ZERO);
        let first = bulkhead.acquire().unwrap();
        let _second = bulkhead.acquire().unwrap();
        drop(first);
        let _third = bulkhead.acquire().unwrap();
        assert!(bulkhead.acquire().is_err());
    }

    #[test]
    fn test_permit_returned_when_operation_fails_or_panics() {
        let bulkhead = bulkhead(1, Duration::ZERO);
        let failed: Result<(), ResilienceError> =
            bulkhead.execute(|| Err(ResilienceError::InvalidConfig("x".into())));
        assert!(failed.is_err());

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), ResilienceError> = bulkhead.execute(|| panic!("boom"));
        }));
        assert!(panicked.is_err());
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }

    #[test]
    fn test_blocking_wait_receives_released_permit() {
        let bulkhead = Arc::new(bulkhead(1, Duration::from_secs(5)));
        std::mem::forget(bulkhead.acquire().unwrap());

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            std::thread::spawn(move || bulkhead.try_acquire_permission())
        };
        std::thread::sleep(Duration::from_millis(50));
        bulkhead.on_complete();
        assert!(waiter.join().unwrap());
        bulkhead.on_complete();
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }

    #[test]
    fn test_change_config_keeps_running_calls() {
        let bulkhead = bulkhead(2, Duration::ZERO);
        let a = bulkhead.acquire().unwrap();
        let b = bulkhead.acquire().unwrap();

        bulkhead
            .change_config(BulkheadConfig {
                max_concurrent_calls: 1,
                ..Default::default()
            })
            .unwrap();
        drop(a);
        assert!(bulkhead.acquire().is_err(), "still one call over the new limit");
        drop(b);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);

        bulkhead
            .change_config(BulkheadConfig {
                max_concurrent_calls: 4,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 4);
        assert!(bulkhead.change_config(BulkheadConfig {
            max_concurrent_calls: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_events() {
        let bulkhead = bulkhead(1, Duration::ZERO);
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        bulkhead.event_publisher().subscribe_kind("CALL_FINISHED", move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let permit = bulkhead.acquire().unwrap();
        assert!(bulkhead.acquire().is_err());
        drop(permit);

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        let kinds: Vec<_> = bulkhead
            .event_publisher()
            .recent_events()
            .iter()
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec!["CALL_PERMITTED", "CALL_REJECTED", "CALL_FINISHED"]);
    }

    #[test]
    fn test_concurrency_never_exceeds_limit() {
        let bulkhead = Arc::new(bulkhead(4, Duration::from_secs(10)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let (bulkhead, running, peak) =
                    (Arc::clone(&bulkhead), Arc::clone(&running), Arc::clone(&peak));
                std::thread::spawn(move || {
                    let _permit = bulkhead.acquire().unwrap();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_waiter_is_woken() {
        let bulkhead = Arc::new(bulkhead(1, Duration::from_secs(1)));
        let permit = bulkhead.acquire_async().await.unwrap();

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.try_acquire_permission_async().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(permit);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_waiter_woken_on_release() {
        let bulkhead = bulkhead(1, Duration::from_secs(3600));
        let permit = bulkhead.acquire().unwrap();

        let mut waiter = tokio_test::task::spawn(bulkhead.try_acquire_permission_async());
        tokio_test::assert_pending!(waiter.poll());

        drop(permit);
        assert!(waiter.is_woken());
        assert!(tokio_test::assert_ready!(waiter.poll()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_wait_times_out() {
        let bulkhead = bulkhead(1, Duration::from_millis(200));
        let _permit = bulkhead.acquire_async().await.unwrap();
        let rejected = bulkhead.acquire_async().await;
        assert!(matches!(rejected, Err(ResilienceError::BulkheadFull { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_future_returns_permit() {
        let bulkhead = bulkhead(1, Duration::ZERO);
        let call = bulkhead.execute_async(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ResilienceError>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }
}

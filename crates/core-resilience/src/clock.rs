//! Injectable time source
//!
//! Every time-dependent decision (open-state deadlines, rate limiter cycles,
//! time-bucketed windows) reads the clock through this trait so the state
//! machines stay deterministic under test.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source measured in nanoseconds from an arbitrary origin
pub trait Clock: Send + Sync + Debug {
    /// Nanoseconds elapsed since this clock's origin. Never decreases.
    fn nanos(&self) -> u64;

    /// Whole seconds elapsed since this clock's origin
    fn seconds(&self) -> u64 {
        self.nanos() / 1_000_000_000
    }
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Duration as clock nanoseconds, saturating at `u64::MAX`
pub fn duration_nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convenience constructor for a shared handle
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced clock for tests and simulations
///
/// # Example
/// ```
/// use bulwark_core_resilience::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_secs(2));
/// assert_eq!(clock.seconds(), 2);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(duration_nanos(by), Ordering::SeqCst);
    }

    /// Set the absolute time; ignored if it would move the clock backwards
    pub fn set(&self, at: Duration) {
        self.nanos.fetch_max(duration_nanos(at), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

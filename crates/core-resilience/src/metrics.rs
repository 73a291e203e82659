//! Sliding-window call metrics
//!
//! Tracks the outcome of recent calls and keeps running aggregates so that
//! failure and slow-call rates are O(1) to read. Two window shapes exist:
//!
//! - **Count-based**: the last N calls, stored in a [`ConcurrentRingBuffer`].
//!   Inserting into a full window evicts the oldest measurement, and the
//!   evicted measurement is subtracted from the running totals.
//! - **Time-based**: one partial aggregate per second for the last N seconds.
//!   Buckets are rotated lazily as the clock advances; expired buckets are
//!   subtracted from the totals before being reused.
//!
//! Rates are reported as [`NOT_MEANINGFUL`] until the window has seen at
//! least `minimum_number_of_calls`.

use crate::clock::SharedClock;
use crate::error::ResilienceError;
use crate::ring_buffer::ConcurrentRingBuffer;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// Sentinel rate returned before enough calls have been recorded
pub const NOT_MEANINGFUL: f32 = -1.0;

/// Classified outcome of a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
    SlowSuccess,
    SlowFailure,
}

impl Outcome {
    /// Combine the failure and slowness classifications
    pub fn classify(failed: bool, slow: bool) -> Self {
        match (failed, slow) {
            (false, false) => Outcome::Success,
            (true, false) => Outcome::Failure,
            (false, true) => Outcome::SlowSuccess,
            (true, true) => Outcome::SlowFailure,
        }
    }

    /// Check if this outcome counts as a failure
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::SlowFailure)
    }

    /// Check if this outcome counts as slow
    pub fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowFailure)
    }
}

/// Shape of a sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlidingWindowType {
    /// Window holds the last `size` calls
    CountBased,
    /// Window holds the calls of the last `size` seconds
    TimeBased,
}

/// One recorded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub outcome: Outcome,
    pub duration: Duration,
}

/// Running totals over a set of measurements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub slow_failed_calls: u64,
    pub total_duration_nanos: u128,
}

impl Aggregation {
    fn record(&mut self, m: &Measurement) {
        self.total_calls += 1;
        self.total_duration_nanos += m.duration.as_nanos();
        if m.outcome.is_failure() {
            self.failed_calls += 1;
        }
        if m.outcome.is_slow() {
            self.slow_calls += 1;
        }
        if m.outcome == Outcome::SlowFailure {
            self.slow_failed_calls += 1;
        }
    }

    fn discard(&mut self, m: &Measurement) {
        self.total_calls -= 1;
        self.total_duration_nanos -= m.duration.as_nanos();
        if m.outcome.is_failure() {
            self.failed_calls -= 1;
        }
        if m.outcome.is_slow() {
            self.slow_calls -= 1;
        }
        if m.outcome == Outcome::SlowFailure {
            self.slow_failed_calls -= 1;
        }
    }

    fn discard_all(&mut self, other: &Aggregation) {
        self.total_calls -= other.total_calls;
        self.failed_calls -= other.failed_calls;
        self.slow_calls -= other.slow_calls;
        self.slow_failed_calls -= other.slow_failed_calls;
        self.total_duration_nanos -= other.total_duration_nanos;
    }

    /// Aggregate a list of measurements from scratch
    pub fn from_measurements<'a>(measurements: impl IntoIterator<Item = &'a Measurement>) -> Self {
        let mut agg = Aggregation::default();
        for m in measurements {
            agg.record(m);
        }
        agg
    }
}

/// Point-in-time view of a window's aggregates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    aggregation: Aggregation,
    minimum_number_of_calls: u64,
}

impl Snapshot {
    fn new(aggregation: Aggregation, minimum_number_of_calls: u64) -> Self {
        Self {
            aggregation,
            minimum_number_of_calls,
        }
    }

    pub fn total_calls(&self) -> u64 {
        self.aggregation.total_calls
    }

    pub fn failed_calls(&self) -> u64 {
        self.aggregation.failed_calls
    }

    pub fn successful_calls(&self) -> u64 {
        self.aggregation.total_calls - self.aggregation.failed_calls
    }

    pub fn slow_calls(&self) -> u64 {
        self.aggregation.slow_calls
    }

    pub fn slow_failed_calls(&self) -> u64 {
        self.aggregation.slow_failed_calls
    }

    pub fn slow_successful_calls(&self) -> u64 {
        self.aggregation.slow_calls - self.aggregation.slow_failed_calls
    }

    /// Sum of all recorded durations
    pub fn total_duration(&self) -> Duration {
        duration_from_nanos(self.aggregation.total_duration_nanos)
    }

    /// Mean call duration, zero for an empty window
    pub fn average_duration(&self) -> Duration {
        if self.aggregation.total_calls == 0 {
            return Duration::ZERO;
        }
        duration_from_nanos(
            self.aggregation.total_duration_nanos / self.aggregation.total_calls as u128,
        )
    }

    /// Check if enough calls have been seen for the rates to mean anything
    pub fn is_meaningful(&self) -> bool {
        self.aggregation.total_calls > 0
            && self.aggregation.total_calls >= self.minimum_number_of_calls
    }

    /// Failure percentage, or [`NOT_MEANINGFUL`]
    pub fn failure_rate(&self) -> f32 {
        if !self.is_meaningful() {
            return NOT_MEANINGFUL;
        }
        self.aggregation.failed_calls as f32 * 100.0 / self.aggregation.total_calls as f32
    }

    /// Slow-call percentage, or [`NOT_MEANINGFUL`]
    pub fn slow_call_rate(&self) -> f32 {
        if !self.is_meaningful() {
            return NOT_MEANINGFUL;
        }
        self.aggregation.slow_calls as f32 * 100.0 / self.aggregation.total_calls as f32
    }

    /// Raw aggregates
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

struct CountWindow {
    ring: ConcurrentRingBuffer<Measurement>,
    total: Mutex<Aggregation>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    epoch_second: u64,
    aggregation: Aggregation,
}

struct TimeState {
    buckets: Vec<Bucket>,
    head: usize,
    total: Aggregation,
}

impl TimeState {
    /// Rotate buckets forward to `now`, dropping the seconds that fell out
    fn advance(&mut self, now: u64) -> usize {
        let latest = self.buckets[self.head].epoch_second;
        if now <= latest {
            return self.head;
        }
        let size = self.buckets.len() as u64;
        let mut remaining = (now - latest).min(size);
        while remaining > 0 {
            remaining -= 1;
            self.head = (self.head + 1) % self.buckets.len();
            let expired = self.buckets[self.head].aggregation;
            self.total.discard_all(&expired);
            self.buckets[self.head] = Bucket {
                epoch_second: now - remaining,
                aggregation: Aggregation::default(),
            };
        }
        self.head
    }
}

struct TimeWindow {
    state: Mutex<TimeState>,
    clock: SharedClock,
}

enum Window {
    Count(CountWindow),
    Time(TimeWindow),
}

/// Sliding window of call outcomes with O(1) aggregate reads
pub struct SlidingWindowMetrics {
    window: Window,
    size: usize,
    minimum_number_of_calls: u64,
}

impl SlidingWindowMetrics {
    /// Window over the last `size` calls
    pub fn count_based(size: usize, minimum_number_of_calls: u64) -> Result<Self, ResilienceError> {
        Ok(Self {
            window: Window::Count(CountWindow {
                ring: ConcurrentRingBuffer::new(size)?,
                total: Mutex::new(Aggregation::default()),
            }),
            size,
            minimum_number_of_calls,
        })
    }

    /// Window over the calls of the last `seconds` seconds
    pub fn time_based(
        seconds: usize,
        minimum_number_of_calls: u64,
        clock: SharedClock,
    ) -> Result<Self, ResilienceError> {
        if seconds == 0 {
            return Err(ResilienceError::InvalidConfig(
                "time window size must be greater than 0 seconds".to_string(),
            ));
        }
        let now = clock.seconds();
        let buckets = vec![
            Bucket {
                epoch_second: now,
                aggregation: Aggregation::default(),
            };
            seconds
        ];
        Ok(Self {
            window: Window::Time(TimeWindow {
                state: Mutex::new(TimeState {
                    buckets,
                    head: 0,
                    total: Aggregation::default(),
                }),
                clock,
            }),
            size: seconds,
            minimum_number_of_calls,
        })
    }

    /// Build a window of the given shape
    pub fn of_type(
        window_type: SlidingWindowType,
        size: usize,
        minimum_number_of_calls: u64,
        clock: SharedClock,
    ) -> Result<Self, ResilienceError> {
        match window_type {
            SlidingWindowType::CountBased => Self::count_based(size, minimum_number_of_calls),
            SlidingWindowType::TimeBased => Self::time_based(size, minimum_number_of_calls, clock),
        }
    }

    /// Window size (calls or seconds)
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn window_type(&self) -> SlidingWindowType {
        match self.window {
            Window::Count(_) => SlidingWindowType::CountBased,
            Window::Time(_) => SlidingWindowType::TimeBased,
        }
    }

    /// Record one call and return the updated snapshot
    pub fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let measurement = Measurement { outcome, duration };
        let aggregation = match &self.window {
            Window::Count(w) => {
                let mut total = w.total.lock();
                if let Some(evicted) = w.ring.insert(measurement) {
                    total.discard(&evicted);
                }
                total.record(&measurement);
                *total
            }
            Window::Time(w) => {
                let now = w.clock.seconds();
                let mut state = w.state.lock();
                let head = state.advance(now);
                state.buckets[head].aggregation.record(&measurement);
                state.total.record(&measurement);
                state.total
            }
        };
        Snapshot::new(aggregation, self.minimum_number_of_calls)
    }

    /// Current aggregates without recording anything
    pub fn snapshot(&self) -> Snapshot {
        let aggregation = match &self.window {
            Window::Count(w) => *w.total.lock(),
            Window::Time(w) => {
                let now = w.clock.seconds();
                let mut state = w.state.lock();
                state.advance(now);
                state.total
            }
        };
        Snapshot::new(aggregation, self.minimum_number_of_calls)
    }

    /// Recompute the aggregates by scanning the stored measurements.
    ///
    /// Returns `(cached, recomputed)` captured atomically; the two are equal
    /// whenever the incremental bookkeeping is correct.
    pub fn recompute(&self) -> (Aggregation, Aggregation) {
        match &self.window {
            Window::Count(w) => {
                let total = w.total.lock();
                let measurements = w.ring.snapshot();
                (*total, Aggregation::from_measurements(measurements.iter()))
            }
            Window::Time(w) => {
                let state = w.state.lock();
                let mut recomputed = Aggregation::default();
                for bucket in &state.buckets {
                    recomputed.total_calls += bucket.aggregation.total_calls;
                    recomputed.failed_calls += bucket.aggregation.failed_calls;
                    recomputed.slow_calls += bucket.aggregation.slow_calls;
                    recomputed.slow_failed_calls += bucket.aggregation.slow_failed_calls;
                    recomputed.total_duration_nanos += bucket.aggregation.total_duration_nanos;
                }
                (state.total, recomputed)
            }
        }
    }

    /// Drop every recorded call
    pub fn reset(&self) {
        match &self.window {
            Window::Count(w) => {
                let mut total = w.total.lock();
                w.ring.clear();
                *total = Aggregation::default();
            }
            Window::Time(w) => {
                let now = w.clock.seconds();
                let mut state = w.state.lock();
                for bucket in state.buckets.iter_mut() {
                    *bucket = Bucket {
                        epoch_second: now,
                        aggregation: Aggregation::default(),
                    };
                }
                state.head = 0;
                state.total = Aggregation::default();
            }
        }
    }
}

impl fmt::Debug for SlidingWindowMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowMetrics")
            .field("type", &self.window_type())
            .field("size", &self.size)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_rates_not_meaningful_below_minimum() {
        let window = SlidingWindowMetrics::count_based(10, 5).unwrap();
        for _ in 0..4 {
            window.record(ms(1), Outcome::Failure);
        }
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls(), 4);
        assert_eq!(snapshot.failure_rate(), NOT_MEANINGFUL);
        assert_eq!(snapshot.slow_call_rate(), NOT_MEANINGFUL);

        let snapshot = window.record(ms(1), Outcome::Success);
        assert_eq!(snapshot.failure_rate(), 80.0);
    }

    #[test]
    fn test_count_window_evicts_and_discards() {
        let window = SlidingWindowMetrics::count_based(3, 1).unwrap();
        window.record(ms(10), Outcome::Failure);
        window.record(ms(10), Outcome::SlowFailure);
        window.record(ms(10), Outcome::Success);

        // Evicts the first failure
        let snapshot = window.record(ms(40), Outcome::SlowSuccess);
        assert_eq!(snapshot.total_calls(), 3);
        assert_eq!(snapshot.failed_calls(), 1);
        assert_eq!(snapshot.slow_calls(), 2);
        assert_eq!(snapshot.slow_failed_calls(), 1);
        assert_eq!(snapshot.slow_successful_calls(), 1);
        assert_eq!(snapshot.total_duration(), ms(60));
        assert_eq!(snapshot.average_duration(), ms(20));
    }

    #[test]
    fn test_count_window_cache_matches_recompute_after_many_overwrites() {
        let window = SlidingWindowMetrics::count_based(7, 1).unwrap();
        let outcomes = [
            Outcome::Success,
            Outcome::Failure,
            Outcome::SlowSuccess,
            Outcome::SlowFailure,
        ];
        for i in 0..1_000u64 {
            let outcome = outcomes[((i * 7 + i / 3) % 4) as usize];
            window.record(ms(i % 13), outcome);
            let (cached, recomputed) = window.recompute();
            assert_eq!(cached, recomputed, "cache diverged after insert {}", i);
        }
    }

    #[test]
    fn test_time_window_rotates_buckets() {
        let clock = Arc::new(ManualClock::new());
        let window = SlidingWindowMetrics::time_based(3, 1, clock.clone()).unwrap();

        window.record(ms(5), Outcome::Failure);
        clock.advance(Duration::from_secs(1));
        window.record(ms(5), Outcome::Success);
        assert_eq!(window.snapshot().total_calls(), 2);

        // First bucket is still inside the 3s window
        clock.advance(Duration::from_secs(1));
        assert_eq!(window.snapshot().total_calls(), 2);

        // Now the failure's second has expired
        clock.advance(Duration::from_secs(1));
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls(), 1);
        assert_eq!(snapshot.failed_calls(), 0);

        let (cached, recomputed) = window.recompute();
        assert_eq!(cached, recomputed);
    }

    #[test]
    fn test_time_window_large_gap_clears_everything() {
        let clock = Arc::new(ManualClock::new());
        let window = SlidingWindowMetrics::time_based(5, 1, clock.clone()).unwrap();
        for _ in 0..10 {
            window.record(ms(1), Outcome::Failure);
        }
        clock.advance(Duration::from_secs(60));
        assert_eq!(window.snapshot().total_calls(), 0);
        let (cached, recomputed) = window.recompute();
        assert_eq!(cached, Aggregation::default());
        assert_eq!(recomputed, Aggregation::default());
    }

    #[test]
    fn test_reset_empties_window() {
        let window = SlidingWindowMetrics::count_based(4, 1).unwrap();
        window.record(ms(1), Outcome::Failure);
        window.reset();
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_calls(), 0);
        assert_eq!(snapshot.failure_rate(), NOT_MEANINGFUL);
    }

    #[test]
    fn test_zero_sized_windows_rejected() {
        assert!(SlidingWindowMetrics::count_based(0, 1).is_err());
        let clock = Arc::new(ManualClock::new());
        assert!(SlidingWindowMetrics::time_based(0, 1, clock).is_err());
    }
}

//! Circuit breaker states and the transition table
//!
//! [`transition`] is a pure function of the current state and a trigger.
//! The breaker feeds it every candidate transition and installs the result
//! with a compare-and-swap, so the table below is the whole state machine.

use std::fmt;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Calls pass through, outcomes are recorded
    Closed,
    /// Calls are rejected until the open wait elapses
    Open,
    /// A limited number of probe calls decide between Closed and Open
    HalfOpen,
    /// Calls pass through, nothing is recorded
    Disabled,
    /// Calls are always rejected
    ForcedOpen,
    /// Calls pass through and are recorded, the breaker never opens
    MetricsOnly,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Closed => "CLOSED",
            State::Open => "OPEN",
            State::HalfOpen => "HALF_OPEN",
            State::Disabled => "DISABLED",
            State::ForcedOpen => "FORCED_OPEN",
            State::MetricsOnly => "METRICS_ONLY",
        }
    }

    /// Whether outcomes reported in this state are written to the window
    pub fn records_outcomes(self) -> bool {
        !matches!(self, State::Disabled)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that may move the breaker to another state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Failure or slow-call rate crossed its threshold while closed
    ThresholdsExceeded,
    /// The open deadline has passed
    OpenWaitElapsed,
    /// All half-open probes completed under the thresholds
    ProbesPassed,
    /// All half-open probes completed and a threshold is still breached
    ProbesFailed,
    /// The half-open state lasted longer than its maximum wait
    HalfOpenWaitElapsed,
    /// Explicit reset
    Reset,
    /// Administrative move to the given state
    Force(State),
}

/// Pair of states describing one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: State,
    pub to: State,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Next state for `trigger` in `state`, or `None` if the trigger does not
/// apply there.
///
/// Administrative moves into the current state return `None`, which makes
/// them idempotent. `Reset` always yields `Closed`, even from `Closed`,
/// because it also clears the window.
pub fn transition(state: State, trigger: Trigger) -> Option<State> {
    use State::*;
    match (state, trigger) {
        (Closed, Trigger::ThresholdsExceeded) => Some(Open),
        (Open, Trigger::OpenWaitElapsed) => Some(HalfOpen),
        (HalfOpen, Trigger::ProbesFailed) => Some(Open),
        (HalfOpen, Trigger::HalfOpenWaitElapsed) => Some(Open),
        (HalfOpen, Trigger::ProbesPassed) => Some(Closed),
        (_, Trigger::Reset) => Some(Closed),
        (current, Trigger::Force(target)) if current != target => Some(target),
        _ => None,
    }
}

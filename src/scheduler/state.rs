//! Scheduler state machine as a pure transition table.

use std::fmt;
use std::time::Duration;

use strum::Display;
use thiserror::Error;

/// Phase of the scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next tick.
    Idle,
    /// Feeds are being polled.
    Fetching,
    /// Snapshot is being scanned.
    Detecting,
    /// Opportunities are being sized and reserved.
    Sizing,
    /// Plans are being submitted.
    Dispatching,
    /// Waiting after a failed fetch.
    Backoff {
        /// Consecutive failed fetches before this one, starting at 0.
        attempt: u32,
    },
    /// Stopped after a fatal error; nothing leaves this state.
    Halted,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SchedulerEvent {
    /// Poll timer fired.
    Tick,
    /// At least one feed answered.
    FetchSucceeded,
    /// Every feed failed or timed out.
    FetchFailed {
        /// Consecutive failures before this one.
        attempt: u32,
    },
    /// Detection finished.
    Detected,
    /// Sizing finished.
    Sized,
    /// Dispatch finished.
    Dispatched,
    /// Backoff delay elapsed.
    BackoffElapsed,
    /// Shutdown requested mid-cycle.
    Cancelled,
    /// Unrecoverable error (ledger corruption).
    Fatal,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => f.write_str("Idle"),
            SchedulerState::Fetching => f.write_str("Fetching"),
            SchedulerState::Detecting => f.write_str("Detecting"),
            SchedulerState::Sizing => f.write_str("Sizing"),
            SchedulerState::Dispatching => f.write_str("Dispatching"),
            SchedulerState::Backoff { attempt } => write!(f, "Backoff({attempt})"),
            SchedulerState::Halted => f.write_str("Halted"),
        }
    }
}

/// An event that is not valid in the current state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition: {event} in {state}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub state: SchedulerState,
    /// Rejected event.
    pub event: SchedulerEvent,
}

impl SchedulerState {
    /// Next state after `event`.
    ///
    /// The failure count travels with `FetchFailed` since `Idle` does not
    /// remember it.
    pub fn on(self, event: SchedulerEvent) -> Result<SchedulerState, InvalidTransition> {
        use SchedulerEvent as E;
        use SchedulerState as S;

        let next = match (self, event) {
            (S::Halted, _) => return Err(InvalidTransition { state: self, event }),
            (_, E::Fatal) => S::Halted,
            (S::Idle, E::Tick) => S::Fetching,
            (S::Fetching, E::FetchSucceeded) => S::Detecting,
            (S::Fetching, E::FetchFailed { attempt }) => S::Backoff { attempt },
            (S::Detecting, E::Detected) => S::Sizing,
            (S::Sizing, E::Sized) => S::Dispatching,
            (S::Dispatching, E::Dispatched) => S::Idle,
            (S::Backoff { .. }, E::BackoffElapsed) => S::Idle,
            (s, E::Cancelled) if s.is_busy() || matches!(s, S::Backoff { .. }) => S::Idle,
            _ => return Err(InvalidTransition { state: self, event }),
        };
        Ok(next)
    }

    /// True while a cycle is in progress.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SchedulerState::Fetching
                | SchedulerState::Detecting
                | SchedulerState::Sizing
                | SchedulerState::Dispatching
        )
    }
}

/// Delay before retrying after `attempt` consecutive failures (0-based).
///
/// `base * 2^attempt`, never more than `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use SchedulerEvent as E;
    use SchedulerState as S;

    #[test]
    fn happy_cycle_returns_to_idle() {
        let mut state = S::Idle;
        for event in [E::Tick, E::FetchSucceeded, E::Detected, E::Sized, E::Dispatched] {
            state = state.on(event).unwrap();
        }
        assert_eq!(state, S::Idle);
    }

    #[test]
    fn failed_fetch_backs_off_then_idles() {
        let state = S::Fetching.on(E::FetchFailed { attempt: 2 }).unwrap();
        assert_eq!(state, S::Backoff { attempt: 2 });
        assert_eq!(state.on(E::BackoffElapsed).unwrap(), S::Idle);
    }

    #[test]
    fn invalid_transitions_are_errors() {
        assert!(S::Idle.on(E::Detected).is_err());
        assert!(S::Detecting.on(E::Tick).is_err());
        assert!(S::Dispatching.on(E::Tick).is_err());
        let err = S::Sizing.on(E::BackoffElapsed).unwrap_err();
        assert_eq!(err.to_string(), "invalid transition: BackoffElapsed in Sizing");
    }

    #[test]
    fn cancellation_returns_busy_states_to_idle() {
        for state in [S::Fetching, S::Detecting, S::Sizing, S::Dispatching, S::Backoff { attempt: 1 }] {
            assert_eq!(state.on(E::Cancelled).unwrap(), S::Idle);
        }
        assert!(S::Idle.on(E::Cancelled).is_err());
    }

    #[test]
    fn fatal_halts_from_anywhere() {
        for state in [S::Idle, S::Fetching, S::Sizing, S::Dispatching, S::Backoff { attempt: 3 }] {
            assert_eq!(state.on(E::Fatal).unwrap(), S::Halted);
        }
        assert!(S::Halted.on(E::Tick).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(120);
        assert_eq!(backoff_delay(base, 0, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 7, max), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, 40, max), max);
    }

    #[test]
    fn display_includes_attempt() {
        assert_eq!(S::Backoff { attempt: 2 }.to_string(), "Backoff(2)");
        assert_eq!(S::Dispatching.to_string(), "Dispatching");
    }
}

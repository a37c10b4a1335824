//! Run lifecycle state machine.
//!
//! A run is created `PENDING` by the control plane, moved to `RUNNING`
//! by the agent that claims it, and finishes in exactly one terminal
//! state. Transitions only ever move forward; [`RunState::transition`]
//! rejects anything else.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// State ID type matching the numeric ids used on the wire and in logs.
pub type StateId = i16;

/// Lifecycle state of a single run (work item).
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Created by the control plane, waiting for an agent.
    Pending = 1,
    /// Claimed by an agent and executing.
    Running = 2,
    /// Job exited successfully.
    Completed = 3,
    /// Job failed, timed out, or could not reach a local resource.
    Failed = 4,
    /// Stopped by an operator or by agent shutdown.
    Cancelled = 5,
}

impl RunState {
    /// Every state, in lifecycle order.
    pub const ALL: [RunState; 5] = [
        RunState::Pending,
        RunState::Running,
        RunState::Completed,
        RunState::Failed,
        RunState::Cancelled,
    ];

    /// Return the numeric state ID.
    pub fn id(self) -> StateId {
        self as StateId
    }

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// `true` for states a run can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    ///
    /// A pending run may also be cancelled before any agent picks it up.
    pub fn can_transition_to(self, next: RunState) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Apply a transition, returning the new state or
    /// [`CoreError::InvalidTransition`].
    pub fn transition(self, next: RunState) -> Result<RunState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl From<RunState> for StateId {
    fn from(value: RunState) -> Self {
        value as StateId
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownState(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn state_ids_are_sequential() {
        let ids: Vec<StateId> = RunState::ALL.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn happy_path_is_allowed() {
        let state = RunState::Pending
            .transition(RunState::Running)
            .and_then(|s| s.transition(RunState::Completed))
            .expect("pending -> running -> completed");
        assert_eq!(state, RunState::Completed);
    }

    #[test]
    fn pending_can_be_cancelled_directly() {
        assert!(RunState::Pending.can_transition_to(RunState::Cancelled));
        assert!(!RunState::Pending.can_transition_to(RunState::Completed));
        assert!(!RunState::Pending.can_transition_to(RunState::Failed));
    }

    #[test]
    fn never_returns_to_pending() {
        for state in RunState::ALL {
            assert!(
                !state.can_transition_to(RunState::Pending),
                "{state} must not go back to PENDING"
            );
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in RunState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn invalid_transition_reports_both_ends() {
        let err = RunState::Completed
            .transition(RunState::Running)
            .unwrap_err();
        assert_matches!(
            err,
            CoreError::InvalidTransition {
                from: RunState::Completed,
                to: RunState::Running
            }
        );
        assert_eq!(
            err.to_string(),
            "Invalid run state transition: COMPLETED -> RUNNING"
        );
    }

    #[test]
    fn wire_format_is_uppercase() {
        let json = serde_json::to_string(&RunState::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
        let parsed: RunState = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(parsed, RunState::Running);
    }

    #[test]
    fn from_str_is_case_insensitive() {
        assert_eq!("failed".parse::<RunState>().unwrap(), RunState::Failed);
        assert_matches!(
            "paused".parse::<RunState>(),
            Err(CoreError::UnknownState(s)) if s == "paused"
        );
    }
}

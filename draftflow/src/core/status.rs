//! Run phase and terminal state enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The phase of one orchestration run.
///
/// A run moves `Initializing → Running(pass) → GateCheck(pass)` and then
/// either back to `Running(pass + 1)` or into one of the terminal phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    /// The run is binding capabilities and creating its document.
    Initializing,
    /// Stages of the given pass are being dispatched.
    Running {
        /// The 1-based pass number.
        pass: u32,
    },
    /// The quality gate is evaluating the document after the given pass.
    GateCheck {
        /// The 1-based pass number.
        pass: u32,
    },
    /// The quality threshold was met.
    Complete,
    /// The iteration budget ran out or a fatal defect occurred.
    Failed,
    /// Cancellation was observed.
    Cancelled,
}

impl Default for RunPhase {
    fn default() -> Self {
        Self::Initializing
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running { pass } => write!(f, "running(pass {pass})"),
            Self::GateCheck { pass } => write!(f, "gate_check(pass {pass})"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunPhase {
    /// Returns true if the phase is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Returns the terminal state for terminal phases.
    #[must_use]
    pub fn terminal_state(&self) -> Option<TerminalState> {
        match self {
            Self::Complete => Some(TerminalState::Complete),
            Self::Failed => Some(TerminalState::Failed),
            Self::Cancelled => Some(TerminalState::Cancelled),
            _ => None,
        }
    }
}

/// How a run ended. Every run ends in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// The quality gate passed.
    Complete,
    /// The run gave up; the outcome still carries the best document reached.
    Failed,
    /// The run was cancelled; in-flight stages were allowed to finish.
    Cancelled,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<TerminalState> for RunPhase {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Complete => Self::Complete,
            TerminalState::Failed => Self::Failed,
            TerminalState::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_phase_display() {
        assert_eq!(RunPhase::Initializing.to_string(), "initializing");
        assert_eq!(RunPhase::Running { pass: 2 }.to_string(), "running(pass 2)");
        assert_eq!(RunPhase::GateCheck { pass: 1 }.to_string(), "gate_check(pass 1)");
        assert_eq!(RunPhase::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_run_phase_is_terminal() {
        assert!(RunPhase::Complete.is_terminal());
        assert!(RunPhase::Failed.is_terminal());
        assert!(RunPhase::Cancelled.is_terminal());
        assert!(!RunPhase::Running { pass: 1 }.is_terminal());
        assert!(!RunPhase::GateCheck { pass: 1 }.is_terminal());
        assert_eq!(RunPhase::Failed.terminal_state(), Some(TerminalState::Failed));
        assert_eq!(RunPhase::Initializing.terminal_state(), None);
    }

    #[test]
    fn test_run_phase_serialize() {
        let json = serde_json::to_value(RunPhase::Running { pass: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"phase": "running", "pass": 3}));

        let back: RunPhase = serde_json::from_value(json).unwrap();
        assert_eq!(back, RunPhase::Running { pass: 3 });
    }

    #[test]
    fn test_terminal_state_roundtrip_into_phase() {
        assert_eq!(RunPhase::from(TerminalState::Complete), RunPhase::Complete);
        assert_eq!(TerminalState::Cancelled.to_string(), "cancelled");
    }
}

//! Run and trial state machines.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Experiment execution state.
///
/// Tracks the lifecycle of the RunEngine. A fatal fault moves a running
/// experiment straight to `Error`; there is no pause or resume.
///
/// # State Machine
///
/// ```text
/// Idle ──run──> Running ──last trial──> Complete
///                  │
///                  └──fatal fault──> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    /// No experiment running
    Idle,
    /// Experiment actively executing
    Running,
    /// Experiment completed successfully
    Complete,
    /// Experiment aborted on a fatal fault
    Error,
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Complete => write!(f, "Complete"),
            ExperimentState::Error => write!(f, "Error"),
        }
    }
}

impl ExperimentState {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        matches!(
            self,
            ExperimentState::Idle | ExperimentState::Complete | ExperimentState::Error
        )
    }
}

/// Phase of a single trial.
///
/// ```text
/// PreBaseline ──> StimulusOrBaseline ──> PostBaseline ──> Readback ──> Done
/// ```
///
/// The trigger fires on entry to `PreBaseline`, so sample 0 of the readback
/// window lines up with that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialPhase {
    /// Gray screen, trigger just sent.
    PreBaseline,
    /// Drifting grating, or gray screen for the baseline condition.
    StimulusOrBaseline,
    /// Gray screen again.
    PostBaseline,
    /// Pulling the elapsed window back from the processor.
    Readback,
    /// Persisting and handing off to monitoring.
    Done,
}

impl TrialPhase {
    /// Phase that follows this one, if any.
    pub fn next(&self) -> Option<TrialPhase> {
        match self {
            TrialPhase::PreBaseline => Some(TrialPhase::StimulusOrBaseline),
            TrialPhase::StimulusOrBaseline => Some(TrialPhase::PostBaseline),
            TrialPhase::PostBaseline => Some(TrialPhase::Readback),
            TrialPhase::Readback => Some(TrialPhase::Done),
            TrialPhase::Done => None,
        }
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialPhase::PreBaseline => write!(f, "PRE_BASELINE"),
            TrialPhase::StimulusOrBaseline => write!(f, "STIMULUS_OR_BASELINE"),
            TrialPhase::PostBaseline => write!(f, "POST_BASELINE"),
            TrialPhase::Readback => write!(f, "READBACK"),
            TrialPhase::Done => write!(f, "DONE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order_and_terminate() {
        let mut phase = TrialPhase::PreBaseline;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(
            seen,
            vec![
                TrialPhase::PreBaseline,
                TrialPhase::StimulusOrBaseline,
                TrialPhase::PostBaseline,
                TrialPhase::Readback,
                TrialPhase::Done
            ]
        );
    }

    #[test]
    fn running_blocks_new_run() {
        assert!(ExperimentState::Idle.can_begin());
        assert!(ExperimentState::Error.can_begin());
        assert!(!ExperimentState::Running.can_begin());
    }
}

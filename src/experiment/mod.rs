//! Experiment orchestration: plan, schedule, trial timeline and run engine.
pub mod plan;
pub mod run_engine;
pub mod schedule;
pub mod session;
pub mod state;
pub mod timeline;

pub use plan::{ChannelSet, ConditionLabel, ExperimentPlan, PhaseDurations};
pub use run_engine::{run_experiment, RunEngine, RunEngineStatus, RunOptions, RunSummary};
pub use schedule::{ScheduledTrial, TrialSchedule};
pub use session::AcquisitionSession;
pub use state::{ExperimentState, TrialPhase};
pub use timeline::{Trial, TrialReport, TrialTimeline};

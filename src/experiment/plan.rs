//! Experiment plan: the immutable description of one orientation-tuning run.
//!
//! A plan fixes the condition list, the number of repeated sets, the three
//! phase holds of every trial, and the channels to read back. It is built once,
//! validated, and then shared read-only by the scheduler and the timeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Numeric label under which the zero-contrast control trial is stored.
pub const BASELINE_SENTINEL: f64 = -1.0;

/// Grating phase advance per display frame, in cycles.
pub const DEFAULT_PHASE_STEP: f64 = 0.026;

/// Nominal condition of a trial: a drift direction or the baseline control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub enum ConditionLabel {
    /// Drifting grating at this orientation, in degrees.
    Angle(f64),
    /// Gray screen held for the stimulus period.
    Baseline,
}

impl ConditionLabel {
    /// True for the zero-contrast control condition.
    pub fn is_baseline(&self) -> bool {
        matches!(self, ConditionLabel::Baseline)
    }

    /// Literal numeric value, with the baseline rendered as its sentinel.
    pub fn value(&self) -> f64 {
        match *self {
            ConditionLabel::Angle(degrees) => degrees,
            ConditionLabel::Baseline => BASELINE_SENTINEL,
        }
    }
}

impl From<f64> for ConditionLabel {
    fn from(value: f64) -> Self {
        if value == BASELINE_SENTINEL {
            ConditionLabel::Baseline
        } else {
            ConditionLabel::Angle(value)
        }
    }
}

impl From<ConditionLabel> for f64 {
    fn from(label: ConditionLabel) -> Self {
        label.value()
    }
}

impl fmt::Display for ConditionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Sorted, de-duplicated set of 1-based channel ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet(Vec<u32>);

impl ChannelSet {
    /// Build a channel set. Ids must be positive; duplicates collapse.
    pub fn new(ids: impl IntoIterator<Item = u32>) -> AppResult<Self> {
        let ids: BTreeSet<u32> = ids.into_iter().collect();
        if ids.is_empty() {
            return Err(DaqError::Plan("channel list is empty".to_string()));
        }
        if ids.contains(&0) {
            return Err(DaqError::Plan(
                "channel ids are 1-based; 0 is not a channel".to_string(),
            ));
        }
        Ok(Self(ids.into_iter().collect()))
    }

    /// Channel ids in ascending order.
    pub fn ids(&self) -> &[u32] {
        &self.0
    }

    /// Highest requested id. Buffers are sized by this, not by `len`.
    pub fn max_id(&self) -> u32 {
        self.0.last().copied().unwrap_or(0)
    }

    /// Number of requested channels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `id` was requested.
    pub fn contains(&self, id: u32) -> bool {
        self.0.binary_search(&id).is_ok()
    }
}

/// Hold durations of the three timed phases of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    /// Gray screen before the stimulus.
    pub pre: Duration,
    /// Drifting grating, or continued gray screen for the baseline.
    pub stimulus: Duration,
    /// Gray screen after the stimulus.
    pub post: Duration,
}

impl PhaseDurations {
    /// Symmetric gray holds around a stimulus period.
    pub fn symmetric(gray: Duration, stimulus: Duration) -> Self {
        Self {
            pre: gray,
            stimulus,
            post: gray,
        }
    }

    /// Total elapsed time covered by one recording window.
    pub fn total(&self) -> Duration {
        self.pre + self.stimulus + self.post
    }
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self::symmetric(Duration::from_secs(2), Duration::from_secs(2))
    }
}

/// Immutable description of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    num_sets: usize,
    conditions: Vec<ConditionLabel>,
    durations: PhaseDurations,
    channels: ChannelSet,
    phase_step: f64,
    seed: Option<u64>,
}

impl ExperimentPlan {
    /// Build a plan from drift angles; the baseline condition is appended last.
    ///
    /// # Errors
    ///
    /// Returns `DaqError::Plan` if there are no sets, an angle repeats, an angle
    /// collides with the baseline sentinel, or any hold is zero.
    pub fn new(
        num_sets: usize,
        angles: &[f64],
        durations: PhaseDurations,
        channels: ChannelSet,
    ) -> AppResult<Self> {
        if num_sets == 0 {
            return Err(DaqError::Plan("num_sets must be at least 1".to_string()));
        }
        for (i, &angle) in angles.iter().enumerate() {
            if !angle.is_finite() {
                return Err(DaqError::Plan(format!("angle {angle} is not finite")));
            }
            if angle == BASELINE_SENTINEL {
                return Err(DaqError::Plan(format!(
                    "angle {angle} collides with the baseline label"
                )));
            }
            if angles[..i].contains(&angle) {
                return Err(DaqError::Plan(format!("angle {angle} listed twice")));
            }
        }
        if durations.pre.is_zero() || durations.stimulus.is_zero() || durations.post.is_zero()
        {
            return Err(DaqError::Plan("phase holds must be non-zero".to_string()));
        }

        let mut conditions: Vec<ConditionLabel> =
            angles.iter().copied().map(ConditionLabel::Angle).collect();
        conditions.push(ConditionLabel::Baseline);

        Ok(Self {
            num_sets,
            conditions,
            durations,
            channels,
            phase_step: DEFAULT_PHASE_STEP,
            seed: None,
        })
    }

    /// Fix the shuffling seed so the schedule is reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Override the per-frame phase advance.
    pub fn with_phase_step(mut self, phase_step: f64) -> Self {
        self.phase_step = phase_step;
        self
    }

    /// Number of repeated sets.
    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    /// Conditions in configured order, baseline last.
    pub fn conditions(&self) -> &[ConditionLabel] {
        &self.conditions
    }

    /// Phase holds.
    pub fn durations(&self) -> PhaseDurations {
        self.durations
    }

    /// Channels to read back.
    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Phase advance per frame, in cycles.
    pub fn phase_step(&self) -> f64 {
        self.phase_step
    }

    /// Shuffling seed, if fixed.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Total number of trials in the run.
    pub fn total_trials(&self) -> usize {
        self.num_sets * self.conditions.len()
    }

    /// Samples per channel covering a whole trial at `sampling_rate` Hz.
    pub fn window_length(&self, sampling_rate: f64) -> usize {
        (sampling_rate * self.durations.total().as_secs_f64()).ceil() as usize
    }

    /// Frames needed to cover the stimulus hold at the given refresh period.
    pub fn frame_count(&self, frame_duration: Duration) -> usize {
        let frame = frame_duration.as_nanos();
        if frame == 0 {
            return 0;
        }
        self.durations.stimulus.as_nanos().div_ceil(frame) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> ChannelSet {
        ChannelSet::new(vec![1, 3, 5]).unwrap()
    }

    #[test]
    fn baseline_is_appended_exactly_once() {
        let plan =
            ExperimentPlan::new(2, &[0.0, 90.0], PhaseDurations::default(), channels()).unwrap();
        assert_eq!(
            plan.conditions(),
            &[
                ConditionLabel::Angle(0.0),
                ConditionLabel::Angle(90.0),
                ConditionLabel::Baseline
            ]
        );
        assert_eq!(plan.total_trials(), 6);
    }

    #[test]
    fn rejects_sentinel_and_duplicate_angles() {
        let durations = PhaseDurations::default();
        assert!(ExperimentPlan::new(1, &[30.0, -1.0], durations, channels()).is_err());
        assert!(ExperimentPlan::new(1, &[30.0, 30.0], durations, channels()).is_err());
        assert!(ExperimentPlan::new(0, &[30.0], durations, channels()).is_err());
    }

    #[test]
    fn window_spans_all_three_phases() {
        let plan = ExperimentPlan::new(1, &[0.0], PhaseDurations::default(), channels()).unwrap();
        assert_eq!(plan.window_length(1000.0), 6000);
        assert_eq!(plan.window_length(24414.0625), 146_485);
    }

    #[test]
    fn frame_count_rounds_up() {
        let plan = ExperimentPlan::new(1, &[0.0], PhaseDurations::default(), channels()).unwrap();
        let frame = Duration::from_secs_f64(15.22749 / 1000.0);
        assert_eq!(plan.frame_count(frame), 132);
        assert_eq!(plan.frame_count(Duration::from_millis(20)), 100);
    }

    #[test]
    fn labels_render_as_literal_values() {
        assert_eq!(ConditionLabel::Angle(30.0).to_string(), "30");
        assert_eq!(ConditionLabel::Angle(22.5).to_string(), "22.5");
        assert_eq!(ConditionLabel::Baseline.to_string(), "-1");
        assert_eq!(ConditionLabel::from(-1.0), ConditionLabel::Baseline);
    }

    #[test]
    fn labels_serialize_as_numbers() {
        let json = serde_json::to_string(&[ConditionLabel::Angle(60.0), ConditionLabel::Baseline])
            .unwrap();
        assert_eq!(json, "[60.0,-1.0]");
        let back: Vec<ConditionLabel> = serde_json::from_str(&json).unwrap();
        assert!(back[1].is_baseline());
    }

    #[test]
    fn channel_set_sorts_and_rejects_zero() {
        let set = ChannelSet::new(vec![5, 1, 3, 3]).unwrap();
        assert_eq!(set.ids(), &[1, 3, 5]);
        assert_eq!(set.max_id(), 5);
        assert_eq!(set.len(), 3);
        assert!(set.contains(3));
        assert!(!set.contains(2));
        assert!(ChannelSet::new(vec![0, 1]).is_err());
        assert!(ChannelSet::new(Vec::new()).is_err());
    }
}

//! Trial schedule: sets of independently shuffled conditions.
//!
//! [`TrialSchedule`] is a finite, consuming iterator. Each set begins with a
//! fresh permutation of the plan's condition list, so a condition does not
//! keep the same position from set to set. Every condition, baseline included,
//! appears exactly once per set.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::experiment::plan::{ConditionLabel, ExperimentPlan};

/// One entry of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduledTrial {
    /// 0-based set index.
    pub set_index: usize,
    /// 0-based position within the set.
    pub position: usize,
    /// Condition presented.
    pub label: ConditionLabel,
}

impl ScheduledTrial {
    /// True for the first trial of a set.
    pub fn starts_set(&self) -> bool {
        self.position == 0
    }
}

/// Lazily generated sequence of `num_sets × conditions` trials.
#[derive(Debug)]
pub struct TrialSchedule {
    conditions: Vec<ConditionLabel>,
    num_sets: usize,
    rng: StdRng,
    current: Vec<ConditionLabel>,
    set_index: usize,
    position: usize,
}

impl TrialSchedule {
    /// Schedule for `plan`, seeded from the plan when it carries a seed.
    pub fn new(plan: &ExperimentPlan) -> Self {
        let rng = match plan.seed() {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            conditions: plan.conditions().to_vec(),
            num_sets: plan.num_sets(),
            rng,
            current: Vec::new(),
            set_index: 0,
            position: 0,
        }
    }

    /// Drain the schedule into per-set orderings.
    pub fn into_sets(self) -> Vec<Vec<ConditionLabel>> {
        let mut sets: Vec<Vec<ConditionLabel>> = Vec::new();
        for trial in self {
            if trial.starts_set() {
                sets.push(Vec::new());
            }
            if let Some(set) = sets.last_mut() {
                set.push(trial.label);
            }
        }
        sets
    }

    fn remaining(&self) -> usize {
        if self.set_index >= self.num_sets {
            return 0;
        }
        let per_set = self.conditions.len();
        (self.num_sets - self.set_index) * per_set - self.position
    }
}

impl Iterator for TrialSchedule {
    type Item = ScheduledTrial;

    fn next(&mut self) -> Option<Self::Item> {
        if self.set_index >= self.num_sets || self.conditions.is_empty() {
            return None;
        }
        if self.position == 0 {
            self.current = self.conditions.clone();
            self.current.shuffle(&mut self.rng);
        }

        let trial = ScheduledTrial {
            set_index: self.set_index,
            position: self.position,
            label: self.current[self.position],
        };

        self.position += 1;
        if self.position == self.current.len() {
            self.position = 0;
            self.set_index += 1;
        }
        Some(trial)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TrialSchedule {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::{ChannelSet, PhaseDurations};

    const ANGLES: [f64; 12] = [
        0.0, 30.0, 60.0, 90.0, 120.0, 150.0, 180.0, 210.0, 240.0, 270.0, 300.0, 330.0,
    ];

    fn plan(num_sets: usize) -> ExperimentPlan {
        ExperimentPlan::new(
            num_sets,
            &ANGLES,
            PhaseDurations::default(),
            ChannelSet::new(vec![1]).unwrap(),
        )
        .unwrap()
    }

    fn sorted_values(labels: &[ConditionLabel]) -> Vec<f64> {
        let mut values: Vec<f64> = labels.iter().map(|l| l.value()).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        values
    }

    #[test]
    fn total_trial_count_is_sets_times_conditions() {
        let schedule = TrialSchedule::new(&plan(20));
        assert_eq!(schedule.len(), 20 * 13);
        assert_eq!(schedule.count(), 260);
    }

    #[test]
    fn every_set_is_a_permutation() {
        let plan = plan(8).with_seed(11);
        let expected = sorted_values(plan.conditions());
        let sets = TrialSchedule::new(&plan).into_sets();
        assert_eq!(sets.len(), 8);
        for set in &sets {
            assert_eq!(sorted_values(set), expected);
            assert_eq!(set.iter().filter(|l| l.is_baseline()).count(), 1);
        }
    }

    #[test]
    fn sets_are_shuffled_independently() {
        let sets = TrialSchedule::new(&plan(6).with_seed(3)).into_sets();
        assert!(sets.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn same_seed_same_orderings() {
        let a = TrialSchedule::new(&plan(5).with_seed(1234)).into_sets();
        let b = TrialSchedule::new(&plan(5).with_seed(1234)).into_sets();
        assert_eq!(a, b);
    }

    #[test]
    fn indices_walk_sets_in_order() {
        let trials: Vec<ScheduledTrial> = TrialSchedule::new(&plan(2).with_seed(9)).collect();
        assert_eq!(trials[0].set_index, 0);
        assert!(trials[0].starts_set());
        assert_eq!(trials[12].position, 12);
        assert_eq!(trials[13].set_index, 1);
        assert!(trials[13].starts_set());
    }

    #[test]
    fn size_hint_shrinks_as_consumed() {
        let mut schedule = TrialSchedule::new(&plan(2));
        schedule.next();
        schedule.next();
        assert_eq!(schedule.len(), 24);
    }
}

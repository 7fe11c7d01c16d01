//! Trial timeline: drives one trial from trigger to persisted buffer.
//!
//! ```text
//! guard ─> PRE_BASELINE ─> STIMULUS_OR_BASELINE ─> POST_BASELINE ─> READBACK ─> guard
//!   │        contrast 0       grating drifting        contrast 0      paced read   │
//!   │        flip, trigger    (or gray hold)          flip, hold                   │
//!   └───────────────────────── persist ─> guard ─> monitor ──────────────────────────┘
//! ```
//!
//! Every display or processor call that fails aborts the trial; the caller
//! decides what happens to the run.

use ndarray::Array2;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, Instrument};

use crate::acquisition::{HealthGuard, PacedReader};
use crate::data::monitor::Monitor;
use crate::data::storage::{DatasetAddress, TrialStore};
use crate::error::{AppResult, Checkpoint};
use crate::experiment::plan::{ConditionLabel, ExperimentPlan};
use crate::experiment::schedule::ScheduledTrial;
use crate::experiment::session::AcquisitionSession;
use crate::experiment::state::TrialPhase;
use crate::hardware::{Processor, StimulusDisplay};

/// Trigger code sent at the start of every trial.
pub const DEFAULT_TRIGGER_CODE: u32 = 1;

/// A trial whose window has been read back.
#[derive(Debug, Clone)]
pub struct Trial {
    /// 0-based set index.
    pub set_index: usize,
    /// Condition shown.
    pub label: ConditionLabel,
    /// Samples per channel.
    pub window_length: usize,
    /// `(max channel id, window_length)` samples; row `id - 1` holds channel `id`.
    pub buffer: Array2<f32>,
}

/// Wall time spent in one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTiming {
    /// Phase measured.
    pub phase: TrialPhase,
    /// Time from entering the phase to leaving it.
    pub elapsed: Duration,
}

/// Outcome of a completed trial.
#[derive(Debug, Clone)]
pub struct TrialReport {
    /// Where the buffer was stored.
    pub address: DatasetAddress,
    /// Buffer shape.
    pub shape: (usize, usize),
    /// Frames presented during the stimulus phase (zero for baseline).
    pub frames: usize,
    /// Phases in the order they ran.
    pub phases: Vec<PhaseTiming>,
    /// Whether monitoring published a frame.
    pub monitored: bool,
}

impl TrialReport {
    /// Time spent in `phase`, if it ran.
    pub fn phase(&self, phase: TrialPhase) -> Option<Duration> {
        self.phases
            .iter()
            .find(|timing| timing.phase == phase)
            .map(|timing| timing.elapsed)
    }
}

struct PhaseClock {
    phase: TrialPhase,
    entered: Instant,
    timings: Vec<PhaseTiming>,
}

impl PhaseClock {
    fn start() -> Self {
        let phase = TrialPhase::PreBaseline;
        debug!(%phase, "entering phase");
        Self {
            phase,
            entered: Instant::now(),
            timings: Vec::with_capacity(5),
        }
    }

    fn advance(&mut self) {
        let now = Instant::now();
        self.timings.push(PhaseTiming {
            phase: self.phase,
            elapsed: now - self.entered,
        });
        if let Some(next) = self.phase.next() {
            self.phase = next;
            debug!(phase = %next, "entering phase");
        }
        self.entered = now;
    }

    fn finish(self) -> Vec<PhaseTiming> {
        self.timings
    }
}

/// Runs trials of one plan against an open session.
pub struct TrialTimeline<'a> {
    plan: &'a ExperimentPlan,
    reader: PacedReader,
    guard: HealthGuard,
    sampling_rate: f64,
    window_length: usize,
    frame_count: usize,
    trigger_code: u32,
}

impl<'a> TrialTimeline<'a> {
    /// Derive the window length and stimulus frame count for this plan.
    pub fn new(
        plan: &'a ExperimentPlan,
        reader: PacedReader,
        guard: HealthGuard,
        sampling_rate: f64,
        frame_duration: Duration,
    ) -> Self {
        Self {
            plan,
            reader,
            guard,
            sampling_rate,
            window_length: plan.window_length(sampling_rate),
            frame_count: plan.frame_count(frame_duration),
            trigger_code: DEFAULT_TRIGGER_CODE,
        }
    }

    /// Use a different trigger code.
    pub fn with_trigger_code(mut self, code: u32) -> Self {
        self.trigger_code = code;
        self
    }

    /// Samples read back per channel.
    pub fn window_length(&self) -> usize {
        self.window_length
    }

    /// Frames presented in each stimulus phase.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Run one trial to completion.
    ///
    /// The trial is persisted before monitoring sees it, and monitoring
    /// failures never fail the trial.
    pub async fn run_trial<P, S, D>(
        &mut self,
        session: &mut AcquisitionSession<P, S>,
        display: &D,
        trial: &ScheduledTrial,
        monitor: Option<&Monitor>,
    ) -> AppResult<TrialReport>
    where
        P: Processor,
        S: TrialStore,
        D: StimulusDisplay + ?Sized,
    {
        let span = info_span!("trial", set = trial.set_index + 1, label = %trial.label);
        self.execute(session, display, trial, monitor)
            .instrument(span)
            .await
    }

    async fn execute<P, S, D>(
        &mut self,
        session: &mut AcquisitionSession<P, S>,
        display: &D,
        trial: &ScheduledTrial,
        monitor: Option<&Monitor>,
    ) -> AppResult<TrialReport>
    where
        P: Processor,
        S: TrialStore,
        D: StimulusDisplay + ?Sized,
    {
        let durations = self.plan.durations();
        self.guard
            .check(session.processor(), Checkpoint::BeforeTrial)
            .await?;

        let mut clock = PhaseClock::start();
        display.set_contrast(0.0).await?;
        display.flip().await?;
        session.processor().send_trigger(self.trigger_code).await?;
        debug!(code = self.trigger_code, "trigger sent");
        sleep(durations.pre).await;

        clock.advance();
        let frames = match trial.label {
            ConditionLabel::Baseline => {
                info!("Showing zero contrast control");
                sleep(durations.stimulus).await;
                0
            }
            ConditionLabel::Angle(angle) => {
                info!("Showing orientation {angle}");
                display.set_orientation(angle).await?;
                display.set_contrast(1.0).await?;
                for n in 0..self.frame_count {
                    display.set_phase(self.plan.phase_step() * n as f64).await?;
                    display.flip().await?;
                }
                self.frame_count
            }
        };

        clock.advance();
        display.set_contrast(0.0).await?;
        display.flip().await?;
        sleep(durations.post).await;

        clock.advance();
        let readback = self
            .reader
            .read(session.processor(), self.plan.channels(), self.window_length)
            .await?;
        self.guard
            .check_readback(session.processor(), &readback)
            .await?;

        clock.advance();
        let completed = Trial {
            set_index: trial.set_index,
            label: trial.label,
            window_length: self.window_length,
            buffer: readback.buffer,
        };
        let address = session.persist(&completed)?;
        self.guard
            .check(session.processor(), Checkpoint::AfterPersist)
            .await?;

        let monitored = monitor.is_some_and(|monitor| {
            monitor.observe(
                completed.set_index,
                completed.label,
                completed.buffer.view(),
                self.sampling_rate,
                durations,
            )
        });
        clock.advance();

        debug!(%address, frames, "trial complete");
        Ok(TrialReport {
            address,
            shape: completed.buffer.dim(),
            frames,
            phases: clock.finish(),
            monitored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::Pacing;
    use crate::data::storage::MemoryStore;
    use crate::error::DaqError;
    use crate::experiment::plan::{ChannelSet, PhaseDurations};
    use crate::hardware::mock::{DisplayCall, MockDisplay, MockProcessor};
    use crate::hardware::SampleFormat;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const FRAME: Duration = Duration::from_millis(10);

    fn plan() -> ExperimentPlan {
        ExperimentPlan::new(
            1,
            &[0.0, 90.0],
            PhaseDurations::symmetric(Duration::from_millis(200), Duration::from_millis(300)),
            ChannelSet::new(vec![1, 3]).unwrap(),
        )
        .unwrap()
    }

    async fn open(
        processor: Arc<MockProcessor>,
        store: MemoryStore,
    ) -> (AcquisitionSession<Arc<MockProcessor>, MemoryStore>, NamedTempFile) {
        let circuit = NamedTempFile::new().unwrap();
        let session = AcquisitionSession::open(processor, store, circuit.path(), HealthGuard::strict())
            .await
            .unwrap();
        (session, circuit)
    }

    fn timeline(plan: &ExperimentPlan) -> TrialTimeline<'_> {
        TrialTimeline::new(
            plan,
            PacedReader::with_seed(Pacing::None, SampleFormat::F32, 9),
            HealthGuard::strict(),
            1000.0,
            FRAME,
        )
    }

    fn scheduled(label: ConditionLabel) -> ScheduledTrial {
        ScheduledTrial {
            set_index: 0,
            position: 0,
            label,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stimulus_trial_drifts_grating_and_persists() {
        let plan = plan();
        let processor = Arc::new(MockProcessor::new(1000.0));
        let store = MemoryStore::new();
        let (mut session, _circuit) = open(processor.clone(), store.clone()).await;
        let display = MockDisplay::with_frame_duration(FRAME);
        let mut timeline = timeline(&plan);

        let report = timeline
            .run_trial(&mut session, &display, &scheduled(ConditionLabel::Angle(90.0)), None)
            .await
            .unwrap();

        assert_eq!(report.frames, 30);
        assert_eq!(report.shape, (3, 700));
        assert_eq!(report.address.to_string(), "set_1/90");
        assert_eq!(processor.trigger_count(), 1);

        let calls = display.calls().await;
        assert_eq!(calls[0], DisplayCall::Contrast(0.0));
        assert_eq!(calls[1], DisplayCall::Flip);
        assert_eq!(calls[2], DisplayCall::Orientation(90.0));
        assert_eq!(calls[3], DisplayCall::Contrast(1.0));
        assert_eq!(display.flip_count().await, 32);
        let phases: Vec<f64> = calls
            .iter()
            .filter_map(|call| match call {
                DisplayCall::Phase(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(phases.len(), 30);
        assert_eq!(phases[0], 0.0);
        assert!((phases[29] - 0.026 * 29.0).abs() < 1e-12);

        assert_eq!(
            report.phase(TrialPhase::PreBaseline),
            Some(Duration::from_millis(210))
        );
        assert_eq!(
            report.phase(TrialPhase::StimulusOrBaseline),
            Some(Duration::from_millis(300))
        );
        assert!(store.dataset("set_1", "90").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_trial_holds_gray_without_orienting() {
        let plan = plan();
        let processor = Arc::new(MockProcessor::new(1000.0));
        let (mut session, _circuit) = open(processor, MemoryStore::new()).await;
        let display = MockDisplay::with_frame_duration(FRAME);
        let mut timeline = timeline(&plan);

        let report = timeline
            .run_trial(&mut session, &display, &scheduled(ConditionLabel::Baseline), None)
            .await
            .unwrap();

        assert_eq!(report.frames, 0);
        assert_eq!(report.address.dataset, "-1");
        assert_eq!(
            report.phase(TrialPhase::StimulusOrBaseline),
            Some(Duration::from_millis(300))
        );
        let calls = display.calls().await;
        assert!(!calls
            .iter()
            .any(|call| matches!(call, DisplayCall::Orientation(_))));
        assert!(!calls.contains(&DisplayCall::Contrast(1.0)));
        assert_eq!(display.flip_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn short_read_aborts_before_persisting() {
        let plan = plan();
        let processor = Arc::new(MockProcessor::new(1000.0).with_short_reads_on(3));
        let store = MemoryStore::new();
        let (mut session, _circuit) = open(processor, store.clone()).await;
        let display = MockDisplay::with_frame_duration(FRAME);
        let mut timeline = timeline(&plan);

        let err = timeline
            .run_trial(&mut session, &display, &scheduled(ConditionLabel::Angle(0.0)), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::HardwareDisconnected {
                checkpoint: Checkpoint::AfterReadback,
                ..
            }
        ));
        assert_eq!(store.dataset_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_before_trial_sends_no_trigger() {
        let plan = plan();
        let processor = Arc::new(MockProcessor::new(1000.0));
        let (mut session, _circuit) = open(processor.clone(), MemoryStore::new()).await;
        processor
            .set_status(crate::hardware::ProcessorStatus(3))
            .await;
        let display = MockDisplay::with_frame_duration(FRAME);
        let mut timeline = timeline(&plan);

        let err = timeline
            .run_trial(&mut session, &display, &scheduled(ConditionLabel::Angle(0.0)), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::HardwareDisconnected {
                checkpoint: Checkpoint::BeforeTrial,
                ..
            }
        ));
        assert_eq!(processor.trigger_count(), 0);
        assert!(display.calls().await.is_empty());
    }

    /// Loses the processor connection while the dataset is being written.
    struct UnplugOnWrite {
        inner: MemoryStore,
        processor: Arc<MockProcessor>,
    }

    impl TrialStore for UnplugOnWrite {
        fn create_group(&mut self, group: &str) -> AppResult<()> {
            self.inner.create_group(group)
        }

        fn write_dataset(
            &mut self,
            group: &str,
            name: &str,
            data: ndarray::ArrayView2<'_, f32>,
        ) -> AppResult<()> {
            self.inner.write_dataset(group, name, data)?;
            self.processor.unplug();
            Ok(())
        }

        fn write_metadata(&mut self, metadata: &crate::data::storage::RunMetadata) -> AppResult<()> {
            self.inner.write_metadata(metadata)
        }

        fn close(&mut self) -> AppResult<()> {
            self.inner.close()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_persist_keeps_the_dataset() {
        let plan = plan();
        let processor = Arc::new(MockProcessor::new(1000.0));
        let memory = MemoryStore::new();
        let store = UnplugOnWrite {
            inner: memory.clone(),
            processor: processor.clone(),
        };
        let circuit = NamedTempFile::new().unwrap();
        let mut session =
            AcquisitionSession::open(processor.clone(), store, circuit.path(), HealthGuard::strict())
                .await
                .unwrap();
        let display = MockDisplay::with_frame_duration(FRAME);
        let mut timeline = timeline(&plan);

        let err = timeline
            .run_trial(&mut session, &display, &scheduled(ConditionLabel::Angle(90.0)), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::HardwareDisconnected {
                checkpoint: Checkpoint::AfterPersist,
                ..
            }
        ));
        assert_eq!(processor.trigger_count(), 1);
        assert_eq!(memory.dataset("set_1", "90").unwrap().dim(), (3, 700));
        assert_eq!(memory.dataset_count(), 1);
    }
}

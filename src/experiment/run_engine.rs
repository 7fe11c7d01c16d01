//! RunEngine for executing an experiment plan against the hardware.
//!
//! The RunEngine owns the run lifecycle: it opens the acquisition session,
//! records run metadata, walks the trial schedule through the timeline, and
//! always tears the session down on the way out, whether the run completed or
//! hit a fatal fault.

use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::acquisition::{HealthGuard, PacedReader, Pacing, RetryPolicy};
use crate::config::Settings;
use crate::data::monitor::{LogMonitor, Monitor};
use crate::data::storage::{open_store, RunMetadata, TrialStore};
use crate::error::{AppResult, DaqError};
use crate::experiment::plan::ExperimentPlan;
use crate::experiment::schedule::TrialSchedule;
use crate::experiment::session::AcquisitionSession;
use crate::experiment::state::ExperimentState;
use crate::experiment::timeline::{TrialTimeline, DEFAULT_TRIGGER_CODE};
use crate::hardware::{Processor, SampleFormat, StimulusDisplay};

/// Hardware-facing knobs that are not part of the plan itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOptions {
    /// Pause policy between channel reads.
    pub pacing: Pacing,
    /// Sample encoding requested from the processor.
    pub sample_format: SampleFormat,
    /// Status re-poll budget.
    pub retry: RetryPolicy,
    /// Code sent with every trial trigger.
    pub trigger_code: u32,
    /// Circuit tag that receives the window length.
    pub samples_tag: String,
    /// Grating spatial frequency, recorded in the run metadata.
    pub spatial_freq: f64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            pacing: Pacing::default(),
            sample_format: SampleFormat::default(),
            retry: RetryPolicy::default(),
            trigger_code: DEFAULT_TRIGGER_CODE,
            samples_tag: "samples".to_string(),
            spatial_freq: 0.1,
        }
    }
}

/// RunEngine status information.
#[derive(Debug, Clone)]
pub struct RunEngineStatus {
    /// Current experiment state
    pub state: ExperimentState,
    /// Unique run identifier (None before the first run)
    pub run_id: Option<String>,
    /// Trials persisted in the current run
    pub trials_completed: usize,
    /// Trials the plan calls for
    pub total_trials: usize,
    /// 0-based index of the set in progress
    pub current_set: Option<usize>,
    /// Last error message (if state is Error)
    pub last_error: Option<String>,
}

impl Default for RunEngineStatus {
    fn default() -> Self {
        Self {
            state: ExperimentState::Idle,
            run_id: None,
            trials_completed: 0,
            total_trials: 0,
            current_set: None,
            last_error: None,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run identifier, also recorded in the store metadata.
    pub run_id: String,
    /// Processor rate read at session start, in Hz.
    pub sampling_rate: f64,
    /// Samples per channel per trial.
    pub window_length: usize,
    /// Stimulus frames per non-baseline trial.
    pub frame_count: usize,
    /// Trials acquired and persisted, baselines included.
    pub trials_completed: usize,
    /// Sets in which every condition was persisted.
    pub sets_completed: usize,
    /// Trials for which monitoring published a frame.
    pub monitored_trials: usize,
    /// Wall time from session open to close.
    pub elapsed: Duration,
}

/// Experiment executor.
///
/// # Example
///
/// ```rust,ignore
/// let mut engine = RunEngine::new(plan, RunOptions::default());
/// let summary = engine
///     .run(processor, store, &display, Path::new("tuning.rcx"), None)
///     .await?;
/// println!("{} trials in {:?}", summary.trials_completed, summary.elapsed);
/// ```
pub struct RunEngine {
    plan: ExperimentPlan,
    options: RunOptions,
    status: RunEngineStatus,
}

impl RunEngine {
    /// Create an idle engine for `plan`.
    pub fn new(plan: ExperimentPlan, options: RunOptions) -> Self {
        Self {
            plan,
            options,
            status: RunEngineStatus::default(),
        }
    }

    /// Get the current RunEngine status.
    pub fn status(&self) -> RunEngineStatus {
        self.status.clone()
    }

    /// Plan this engine executes.
    pub fn plan(&self) -> &ExperimentPlan {
        &self.plan
    }

    /// Execute the plan.
    ///
    /// Opens a session on `processor` and `store`, runs every scheduled trial,
    /// and closes the session. A fatal fault stops the run at once; trials
    /// persisted before it stay in the store.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: circuit load failure, a health guard
    /// fault, or a storage failure. Monitoring failures are never returned.
    pub async fn run<P, S, D>(
        &mut self,
        processor: P,
        store: S,
        display: &D,
        circuit: &Path,
        monitor: Option<&Monitor>,
    ) -> AppResult<RunSummary>
    where
        P: Processor,
        S: TrialStore,
        D: StimulusDisplay + ?Sized,
    {
        if !self.status.state.can_begin() {
            return Err(DaqError::Configuration(format!(
                "cannot start a run while {}",
                self.status.state
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        self.status = RunEngineStatus {
            state: ExperimentState::Running,
            run_id: Some(run_id.clone()),
            total_trials: self.plan.total_trials(),
            ..RunEngineStatus::default()
        };
        info!(
            %run_id,
            sets = self.plan.num_sets(),
            conditions = self.plan.conditions().len(),
            channels = self.plan.channels().len(),
            "starting run"
        );

        let started = Instant::now();
        let guard = HealthGuard::with_policy(self.options.retry);
        let mut session = match AcquisitionSession::open(processor, store, circuit, guard).await {
            Ok(session) => session,
            Err(err) => {
                Self::close_display(display).await;
                return Err(self.fail(err));
            }
        };

        let outcome = self
            .drive(&mut session, display, monitor, &run_id)
            .await;
        let closed = session.close().await;
        Self::close_display(display).await;

        match (outcome, closed) {
            (Ok(mut summary), Ok(())) => {
                summary.elapsed = started.elapsed();
                self.status.state = ExperimentState::Complete;
                info!(
                    trials = summary.trials_completed,
                    elapsed_s = summary.elapsed.as_secs_f64(),
                    "Orientation test complete."
                );
                Ok(summary)
            }
            (Ok(_), Err(err)) => Err(self.fail(err)),
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "teardown after fault also failed");
                }
                Err(self.fail(err))
            }
        }
    }

    async fn drive<P, S, D>(
        &mut self,
        session: &mut AcquisitionSession<P, S>,
        display: &D,
        monitor: Option<&Monitor>,
        run_id: &str,
    ) -> AppResult<RunSummary>
    where
        P: Processor,
        S: TrialStore,
        D: StimulusDisplay + ?Sized,
    {
        let sampling_rate = session.sampling_rate();
        let frame_duration = display.frame_duration();
        let reader = match self.plan.seed() {
            Some(seed) => PacedReader::with_seed(
                self.options.pacing,
                self.options.sample_format,
                seed.wrapping_add(1),
            ),
            None => PacedReader::new(self.options.pacing, self.options.sample_format),
        };
        let mut timeline = TrialTimeline::new(
            &self.plan,
            reader,
            *session.guard(),
            sampling_rate,
            frame_duration,
        )
        .with_trigger_code(self.options.trigger_code);
        let window_length = timeline.window_length();
        let frame_count = timeline.frame_count();

        session
            .processor()
            .set_tag(&self.options.samples_tag, window_length as f64)
            .await?;
        let durations = self.plan.durations();
        session.write_metadata(&RunMetadata {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            sampling_rate,
            window_length,
            pre_s: durations.pre.as_secs_f64(),
            stimulus_s: durations.stimulus.as_secs_f64(),
            post_s: durations.post.as_secs_f64(),
            frame_duration_ms: frame_duration.as_secs_f64() * 1000.0,
            frame_count,
            phase_step: self.plan.phase_step(),
            spatial_freq: self.options.spatial_freq,
            channels: self.plan.channels().ids().to_vec(),
            conditions: self.plan.conditions().to_vec(),
            num_sets: self.plan.num_sets(),
            seed: self.plan.seed(),
        })?;
        info!(sampling_rate, window_length, frame_count, "run armed");

        let num_sets = self.plan.num_sets();
        let mut set_span = info_span!("set", set = 1);
        let mut monitored_trials = 0;
        for trial in TrialSchedule::new(&self.plan) {
            if trial.starts_set() {
                info!("Beginning set {} of {}", trial.set_index + 1, num_sets);
                set_span = info_span!("set", set = trial.set_index + 1);
                self.status.current_set = Some(trial.set_index);
            }
            let report = timeline
                .run_trial(session, display, &trial, monitor)
                .instrument(set_span.clone())
                .await?;
            self.status.trials_completed += 1;
            if report.monitored {
                monitored_trials += 1;
            }
        }

        let trials_completed = self.status.trials_completed;
        Ok(RunSummary {
            run_id: run_id.to_string(),
            sampling_rate,
            window_length,
            frame_count,
            trials_completed,
            sets_completed: trials_completed / self.plan.conditions().len(),
            monitored_trials,
            elapsed: Duration::ZERO,
        })
    }

    fn fail(&mut self, err: DaqError) -> DaqError {
        error!(
            error = %err,
            trials_completed = self.status.trials_completed,
            "run aborted"
        );
        self.status.state = ExperimentState::Error;
        self.status.last_error = Some(err.to_string());
        err
    }

    async fn close_display<D: StimulusDisplay + ?Sized>(display: &D) {
        if let Err(err) = display.close().await {
            warn!(error = %err, "display close failed");
        }
    }
}

/// Run a complete orientation-tuning experiment.
///
/// `channel_ids` and `enable_monitoring` replace `acquisition.channels` and
/// `monitoring.enabled` before the settings are validated; everything else
/// (timing, conditions, pacing, storage backend) comes from `settings`.
/// Monitoring output goes to the log.
pub async fn run_experiment<P, D>(
    settings: &Settings,
    output: &Path,
    circuit: &Path,
    channel_ids: &[u32],
    enable_monitoring: bool,
    processor: P,
    display: &D,
) -> AppResult<RunSummary>
where
    P: Processor,
    D: StimulusDisplay + ?Sized,
{
    let settings = settings.with_run_overrides(channel_ids, enable_monitoring);
    settings.validate()?;
    let plan = settings.experiment_plan(settings.channels()?)?;

    let monitor = enable_monitoring
        .then(|| Monitor::new(settings.monitoring.filter(), Box::new(LogMonitor)));

    let store = open_store(settings.storage.backend, output)?;
    let mut engine = RunEngine::new(plan, settings.run_options());
    engine
        .run(processor, store, display, circuit, monitor.as_ref())
        .await
}

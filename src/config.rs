//! Configuration System using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. built-in defaults (the standard 12-direction tuning protocol)
//! 2. a TOML file
//! 3. environment variables prefixed with `TUNING_DAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use tuning_daq::config::Settings;
//!
//! // TUNING_DAQ_EXPERIMENT__NUM_SETS=5 overrides the file
//! let settings = Settings::load_from("config/tuning.toml")?;
//! settings.validate()?;
//! println!("{} sets", settings.experiment.num_sets);
//! # Ok::<(), tuning_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::acquisition::{Pacing, RetryPolicy};
use crate::data::iir_filter::BandSpec;
use crate::data::monitor::MonitoringFilter;
use crate::data::storage::StorageBackend;
use crate::error::{AppResult, DaqError};
use crate::experiment::plan::{ChannelSet, ExperimentPlan, PhaseDurations, BASELINE_SENTINEL};
use crate::experiment::run_engine::RunOptions;
use crate::experiment::timeline::DEFAULT_TRIGGER_CODE;
use crate::hardware::{DisplaySpec, SampleFormat};
use crate::logging::{parse_log_level, OutputFormat};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TUNING_DAQ_";

/// Largest accepted `acquisition.adaptive_factor`.
pub const MAX_ADAPTIVE_FACTOR: f64 = 100.0;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Trial protocol
    #[serde(default)]
    pub experiment: ExperimentConfig,
    /// Processor readback settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Stimulus window settings
    #[serde(default)]
    pub display: DisplayConfig,
    /// Live monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Storage backend settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Simulated hardware settings
    #[serde(default)]
    pub mock: MockConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Log set and trial durations when their spans close
    #[serde(default)]
    pub log_span_timing: bool,
}

/// Trial protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Number of repeated sets
    #[serde(default = "default_num_sets")]
    pub num_sets: usize,
    /// Drift directions in degrees; the baseline condition is added automatically
    #[serde(default = "default_angles")]
    pub angles: Vec<f64>,
    /// Gray hold before and after the stimulus, in seconds
    #[serde(default = "default_gray_time")]
    pub gray_time_s: f64,
    /// Stimulus hold, in seconds
    #[serde(default = "default_drift_time")]
    pub drift_time_s: f64,
    /// Grating spatial frequency in cycles per degree
    #[serde(default = "default_spatial_freq")]
    pub spatial_freq: f64,
    /// Grating phase advance per frame, in cycles
    #[serde(default = "default_phase_step")]
    pub phase_step: f64,
    /// Fixed shuffling seed
    #[serde(default)]
    pub seed: Option<u64>,
}

/// How reads are paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingMode {
    /// Back to back
    None,
    /// Fixed pause of `read_pace_ms`
    Fixed,
    /// `max(read_pace_ms, adaptive_factor * round trip)`
    Adaptive,
}

/// Processor readback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Channel ids to read back
    #[serde(default = "default_channels")]
    pub channels: Vec<u32>,
    /// Pause between reads (fixed) or pause floor (adaptive), in milliseconds
    #[serde(default = "default_read_pace")]
    pub read_pace_ms: u64,
    /// Pacing mode
    #[serde(default = "default_pacing")]
    pub pacing: PacingMode,
    /// Round-trip multiplier for adaptive pacing
    #[serde(default = "default_adaptive_factor")]
    pub adaptive_factor: f64,
    /// Sample format requested from the processor
    #[serde(default)]
    pub sample_format: SampleFormat,
    /// Status re-polls before a non-ready word is fatal
    #[serde(default)]
    pub status_retries: u32,
    /// First re-poll delay in milliseconds; doubles per attempt
    #[serde(default = "default_status_backoff")]
    pub status_backoff_ms: u64,
    /// Circuit tag that receives the window length
    #[serde(default = "default_samples_tag")]
    pub samples_tag: String,
    /// Code sent with every trigger
    #[serde(default = "default_trigger_code")]
    pub trigger_code: u32,
}

/// Stimulus window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Window width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Window height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Monitor calibration profile
    #[serde(default = "default_monitor")]
    pub monitor: String,
    /// Measured refresh period in milliseconds
    #[serde(default = "default_frame_duration")]
    pub frame_duration_ms: f64,
    /// Grating diameter in degrees
    #[serde(default = "default_grating_size")]
    pub grating_size_deg: f64,
}

/// Live monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Whether to monitor at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Channel to decompose
    #[serde(default = "default_reference_channel")]
    pub reference_channel: u32,
    /// LFP band edges in Hz
    #[serde(default = "default_lfp_band")]
    pub lfp_band: [f64; 2],
    /// LFP filter order
    #[serde(default = "default_lfp_order")]
    pub lfp_order: usize,
    /// Spike band edges in Hz
    #[serde(default = "default_spike_band")]
    pub spike_band: [f64; 2],
    /// Spike filter order
    #[serde(default = "default_spike_order")]
    pub spike_order: usize,
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend (csv, hdf5, memory)
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Output location used when none is given on the command line
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

/// Simulated hardware configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockConfig {
    /// Sampling rate reported by the simulated processor, in Hz
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    /// Drop the connection once this many trials have completed
    #[serde(default)]
    pub fail_after_trials: Option<u64>,
    /// Channel that always returns short reads
    #[serde(default)]
    pub short_read_channel: Option<u32>,
}

// Default value functions
fn default_name() -> String {
    "tuning_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_num_sets() -> usize {
    20
}

fn default_angles() -> Vec<f64> {
    (0..12).map(|i| f64::from(i * 30)).collect()
}

fn default_gray_time() -> f64 {
    2.0
}

fn default_drift_time() -> f64 {
    2.0
}

fn default_spatial_freq() -> f64 {
    0.1
}

fn default_phase_step() -> f64 {
    crate::experiment::plan::DEFAULT_PHASE_STEP
}

fn default_channels() -> Vec<u32> {
    (1..=16).collect()
}

fn default_read_pace() -> u64 {
    5
}

fn default_pacing() -> PacingMode {
    PacingMode::Fixed
}

fn default_adaptive_factor() -> f64 {
    1.0
}

fn default_status_backoff() -> u64 {
    50
}

fn default_samples_tag() -> String {
    "samples".to_string()
}

fn default_trigger_code() -> u32 {
    DEFAULT_TRIGGER_CODE
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    480
}

fn default_monitor() -> String {
    "RPi_5in".to_string()
}

fn default_frame_duration() -> f64 {
    15.22749
}

fn default_grating_size() -> f64 {
    40.0
}

fn default_enabled() -> bool {
    true
}

fn default_reference_channel() -> u32 {
    5
}

fn default_lfp_band() -> [f64; 2] {
    [0.5, 300.0]
}

fn default_lfp_order() -> usize {
    1
}

fn default_spike_band() -> [f64; 2] {
    [300.0, 5000.0]
}

fn default_spike_order() -> usize {
    5
}

fn default_backend() -> StorageBackend {
    StorageBackend::Csv
}

fn default_output() -> PathBuf {
    PathBuf::from("data/orientation_tuning")
}

fn default_sampling_rate() -> f64 {
    24414.0625
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_span_timing: false,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            num_sets: default_num_sets(),
            angles: default_angles(),
            gray_time_s: default_gray_time(),
            drift_time_s: default_drift_time(),
            spatial_freq: default_spatial_freq(),
            phase_step: default_phase_step(),
            seed: None,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            read_pace_ms: default_read_pace(),
            pacing: default_pacing(),
            adaptive_factor: default_adaptive_factor(),
            sample_format: SampleFormat::default(),
            status_retries: 0,
            status_backoff_ms: default_status_backoff(),
            samples_tag: default_samples_tag(),
            trigger_code: default_trigger_code(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            monitor: default_monitor(),
            frame_duration_ms: default_frame_duration(),
            grating_size_deg: default_grating_size(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            reference_channel: default_reference_channel(),
            lfp_band: default_lfp_band(),
            lfp_order: default_lfp_order(),
            spike_band: default_spike_band(),
            spike_order: default_spike_order(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            output: default_output(),
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            fail_after_trials: None,
            short_read_channel: None,
        }
    }
}

impl Settings {
    /// Figment with defaults, an optional TOML file, and environment overrides.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load defaults and environment overrides only.
    pub fn load() -> AppResult<Self> {
        Ok(Self::figment(None).extract()?)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(Some(path.as_ref())).extract()?)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot render settings: {e}")))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level).map_err(DaqError::Configuration)?;
        self.application
            .log_format
            .parse::<OutputFormat>()
            .map_err(DaqError::Configuration)?;

        let experiment = &self.experiment;
        if experiment.num_sets == 0 {
            return Err(invalid("experiment.num_sets must be at least 1"));
        }
        let mut seen = HashSet::new();
        for &angle in &experiment.angles {
            if !angle.is_finite() {
                return Err(invalid(format!("angle {angle} is not finite")));
            }
            if angle == BASELINE_SENTINEL {
                return Err(invalid(format!(
                    "angle {angle} is reserved for the baseline condition"
                )));
            }
            if !seen.insert(angle.to_bits()) {
                return Err(invalid(format!("Duplicate angle: {angle}")));
            }
        }
        seconds("experiment.gray_time_s", experiment.gray_time_s)?;
        seconds("experiment.drift_time_s", experiment.drift_time_s)?;
        if !experiment.phase_step.is_finite() {
            return Err(invalid("experiment.phase_step must be finite"));
        }

        let acquisition = &self.acquisition;
        if acquisition.channels.is_empty() {
            return Err(invalid("acquisition.channels must not be empty"));
        }
        if acquisition.channels.contains(&0) {
            return Err(invalid("channel ids start at 1"));
        }
        if !(0.0..=MAX_ADAPTIVE_FACTOR).contains(&acquisition.adaptive_factor) {
            return Err(invalid(format!(
                "acquisition.adaptive_factor must be within 0..={MAX_ADAPTIVE_FACTOR}, got {}",
                acquisition.adaptive_factor
            )));
        }

        seconds("display.frame_duration_ms", self.display.frame_duration_ms / 1000.0)?;

        let monitoring = &self.monitoring;
        for (name, band, order) in [
            ("lfp", monitoring.lfp_band, monitoring.lfp_order),
            ("spike", monitoring.spike_band, monitoring.spike_order),
        ] {
            if !(band[0] > 0.0 && band[0] < band[1]) {
                return Err(invalid(format!(
                    "monitoring.{name}_band must be increasing and positive, got {band:?}"
                )));
            }
            if order == 0 {
                return Err(invalid(format!("monitoring.{name}_order must be at least 1")));
            }
        }
        if !acquisition.channels.contains(&monitoring.reference_channel) {
            if monitoring.enabled {
                return Err(invalid(format!(
                    "monitoring.reference_channel {} is not in acquisition.channels",
                    monitoring.reference_channel
                )));
            }
            warn!(
                channel = monitoring.reference_channel,
                "monitoring reference channel is not recorded"
            );
        }

        if !(self.mock.sampling_rate.is_finite() && self.mock.sampling_rate > 0.0) {
            return Err(invalid("mock.sampling_rate must be positive"));
        }

        Ok(())
    }

    /// Copy of these settings recording `channels` with monitoring switched
    /// to `monitoring`.
    pub fn with_run_overrides(&self, channels: &[u32], monitoring: bool) -> Settings {
        let mut settings = self.clone();
        settings.acquisition.channels = channels.to_vec();
        settings.monitoring.enabled = monitoring;
        settings
    }

    /// Configured channel list.
    pub fn channels(&self) -> AppResult<ChannelSet> {
        ChannelSet::new(self.acquisition.channels.iter().copied())
    }

    /// Phase holds.
    pub fn durations(&self) -> AppResult<PhaseDurations> {
        Ok(PhaseDurations::symmetric(
            seconds("experiment.gray_time_s", self.experiment.gray_time_s)?,
            seconds("experiment.drift_time_s", self.experiment.drift_time_s)?,
        ))
    }

    /// Build the immutable plan for a run over `channels`.
    pub fn experiment_plan(&self, channels: ChannelSet) -> AppResult<ExperimentPlan> {
        let plan = ExperimentPlan::new(
            self.experiment.num_sets,
            &self.experiment.angles,
            self.durations()?,
            channels,
        )?
        .with_phase_step(self.experiment.phase_step);
        Ok(match self.experiment.seed {
            Some(seed) => plan.with_seed(seed),
            None => plan,
        })
    }

    /// Inter-read pacing.
    pub fn pacing(&self) -> Pacing {
        let pace = Duration::from_millis(self.acquisition.read_pace_ms);
        match self.acquisition.pacing {
            PacingMode::None => Pacing::None,
            PacingMode::Fixed => Pacing::Fixed(pace),
            PacingMode::Adaptive => Pacing::Adaptive {
                floor: pace,
                factor: self.acquisition.adaptive_factor,
            },
        }
    }

    /// Status re-poll budget.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.acquisition.status_retries,
            backoff: Duration::from_millis(self.acquisition.status_backoff_ms),
        }
    }

    /// Engine options derived from these settings.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            pacing: self.pacing(),
            sample_format: self.acquisition.sample_format,
            retry: self.retry_policy(),
            trigger_code: self.acquisition.trigger_code,
            samples_tag: self.acquisition.samples_tag.clone(),
            spatial_freq: self.experiment.spatial_freq,
        }
    }

    /// Stimulus window description.
    pub fn display_spec(&self) -> AppResult<DisplaySpec> {
        Ok(DisplaySpec {
            width: self.display.width,
            height: self.display.height,
            monitor: self.display.monitor.clone(),
            grating_size_deg: self.display.grating_size_deg,
            spatial_freq: self.experiment.spatial_freq,
            frame_duration: seconds(
                "display.frame_duration_ms",
                self.display.frame_duration_ms / 1000.0,
            )?,
        })
    }
}

impl MonitoringConfig {
    /// Band decomposition described by this section.
    pub fn filter(&self) -> MonitoringFilter {
        MonitoringFilter::new(
            self.reference_channel,
            BandSpec {
                low_hz: self.lfp_band[0],
                high_hz: self.lfp_band[1],
                order: self.lfp_order,
            },
            BandSpec {
                low_hz: self.spike_band[0],
                high_hz: self.spike_band[1],
                order: self.spike_order,
            },
        )
    }
}

fn invalid(message: impl Into<String>) -> DaqError {
    DaqError::Configuration(message.into())
}

/// Positive, finite seconds as a `Duration`.
fn seconds(key: &str, value: f64) -> AppResult<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(invalid(format!("{key} must be a positive duration, got {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::ConditionLabel;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_reproduce_standard_protocol() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.experiment.num_sets, 20);
        assert_eq!(settings.experiment.angles.len(), 12);
        assert_eq!(settings.experiment.angles[11], 330.0);
        assert_eq!(settings.pacing(), Pacing::Fixed(Duration::from_millis(5)));
        assert_eq!(settings.retry_policy().retries, 0);
        assert_eq!(settings.display_spec().unwrap(), DisplaySpec::default());
        assert_eq!(settings.monitoring.filter(), MonitoringFilter::default());

        let plan = settings.experiment_plan(settings.channels().unwrap()).unwrap();
        assert_eq!(plan.conditions().len(), 13);
        assert_eq!(plan.conditions()[12], ConditionLabel::Baseline);
        assert_eq!(plan.total_trials(), 260);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[experiment]
num_sets = 3
angles = [0.0, 90.0]
seed = 17

[acquisition]
channels = [1, 3, 5]
pacing = "adaptive"
read_pace_ms = 2
adaptive_factor = 1.5
status_retries = 2

[storage]
backend = "memory"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.experiment.num_sets, 3);
        assert_eq!(settings.experiment.gray_time_s, 2.0);
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(
            settings.pacing(),
            Pacing::Adaptive {
                floor: Duration::from_millis(2),
                factor: 1.5
            }
        );
        assert_eq!(settings.retry_policy().retries, 2);
        let plan = settings.experiment_plan(settings.channels().unwrap()).unwrap();
        assert_eq!(plan.seed(), Some(17));
        assert_eq!(plan.channels().max_id(), 5);
    }

    #[test]
    fn unknown_backend_fails_extraction() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\nbackend = \"parquet\"").unwrap();
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_reserved_and_duplicate_angles() {
        let mut settings = Settings::default();
        settings.experiment.angles = vec![0.0, -1.0];
        assert!(settings.validate().is_err());

        settings.experiment.angles = vec![0.0, 90.0, 0.0];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate angle"));
    }

    #[test]
    fn rejects_bad_channels_and_durations() {
        let mut settings = Settings::default();
        settings.acquisition.channels = vec![];
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.acquisition.channels = vec![0, 5];
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.experiment.drift_time_s = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.experiment.gray_time_s = -2.0;
        assert!(settings.durations().is_err());
    }

    #[test]
    fn reference_channel_must_be_recorded_only_when_monitoring() {
        let mut settings = Settings::default();
        settings.acquisition.channels = vec![1, 2, 3];
        assert!(settings.validate().is_err());

        settings.monitoring.enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn adaptive_factor_is_bounded() {
        let mut settings = Settings::default();
        for factor in [-0.5, 1e300, f64::NAN, f64::INFINITY] {
            settings.acquisition.adaptive_factor = factor;
            assert!(settings.validate().is_err(), "factor {factor}");
        }
        settings.acquisition.adaptive_factor = MAX_ADAPTIVE_FACTOR;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn run_overrides_replace_channels_and_monitoring() {
        let settings = Settings::default();
        let run = settings.with_run_overrides(&[1, 2, 3], false);
        assert_eq!(run.acquisition.channels, vec![1, 2, 3]);
        assert!(!run.monitoring.enabled);
        assert!(run.validate().is_ok());
        assert!(settings.with_run_overrides(&[1, 2, 3], true).validate().is_err());
        assert_eq!(settings.acquisition.channels, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    fn rendered_toml_round_trips() {
        let settings = Settings::default();
        let text = settings.to_toml().unwrap();
        assert!(text.contains("[experiment]"));
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}

//! Tracing Infrastructure
//!
//! Structured logging for the acquisition engine, built on `tracing` and
//! `tracing-subscriber`:
//! - one span per set and per trial, so every event carries its set and condition
//! - pretty, compact, or JSON output
//! - `RUST_LOG` overrides the configured level
//!
//! # Example
//! ```no_run
//! use tuning_daq::{config::Settings, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! info!("Application started");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self as subscriber_fmt, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::Settings;
use crate::error::{AppResult, DaqError};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for the bench)
    #[default]
    Pretty,
    /// Compact single-line format without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Pretty => write!(f, "pretty"),
            OutputFormat::Compact => write!(f, "compact"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit an event with busy/idle time when each set and trial span closes
    pub span_timing: bool,
    /// Include source file and line in each event
    pub source_location: bool,
    /// Colored output (pretty format only)
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LogConfig {
    /// Pretty, colored output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Pretty,
            span_timing: false,
            source_location: false,
            ansi: true,
        }
    }

    /// Options from the `application` section.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let app = &settings.application;
        let level = parse_log_level(&app.log_level).map_err(DaqError::Configuration)?;
        let format = app.log_format.parse().map_err(DaqError::Configuration)?;
        Ok(Self::new(level)
            .with_format(format)
            .with_span_timing(app.log_span_timing))
    }

    /// Use a different output format.
    pub fn with_format(self, format: OutputFormat) -> Self {
        Self { format, ..self }
    }

    /// Report set and trial durations as their spans close.
    pub fn with_span_timing(self, span_timing: bool) -> Self {
        Self {
            span_timing,
            ..self
        }
    }

    /// Include source locations.
    pub fn with_source_location(self, source_location: bool) -> Self {
        Self {
            source_location,
            ..self
        }
    }
}

/// Initialize logging from loaded settings
pub fn init_from_settings(settings: &Settings) -> AppResult<()> {
    init(LogConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without changes if one is already installed, so tests and
/// embedding applications can call this freely.
pub fn init(config: LogConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));
    let spans = if config.span_timing {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = subscriber_fmt::layer()
        .with_span_events(spans)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_target(config.source_location);
    let layer = match config.format {
        OutputFormat::Pretty => fmt_layer.pretty().with_ansi(config.ansi).boxed(),
        OutputFormat::Compact => fmt_layer.compact().with_ansi(false).boxed(),
        OutputFormat::Json => fmt_layer.json().with_ansi(false).boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("has already been set") => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

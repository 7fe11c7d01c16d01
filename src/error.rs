//! Custom error types for the acquisition engine.
//!
//! `DaqError` is the single error type returned by every fallible operation in the
//! crate. Built with `thiserror`, it separates the fatal conditions that end a run
//! from the advisory ones that are only logged.
//!
//! ## Error Hierarchy
//!
//! - **`HardwareDisconnected`**: raised by the health guard whenever the processor
//!   status word deviates from ready, or when a channel read came back short. Fatal,
//!   never retried past the configured budget.
//! - **`ReadFault`**: a single channel read returned fewer samples than requested.
//!   The reader records it; the health guard escalates it into `HardwareDisconnected`.
//! - **`CircuitLoad`**: the processor rejected the circuit definition at startup.
//! - **`Storage`** / **`Io`** / **`Csv`** / **`Hdf5`**: persistence failures.
//! - **`Processing`**: a signal-processing step (filter design) was given bad input.
//! - **`Monitoring`**: the live monitoring filter failed. Never aborts a trial.
//! - **`Configuration`** / **`Config`** / **`Plan`**: invalid settings or plans.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Point in the run at which the health guard was consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Right after the circuit was loaded and the session opened.
    SessionStart,
    /// Immediately before a trial enters its pre-stimulus baseline.
    BeforeTrial,
    /// Immediately after the trial buffer was read back.
    AfterReadback,
    /// Immediately after the trial was persisted.
    AfterPersist,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::SessionStart => write!(f, "session start"),
            Checkpoint::BeforeTrial => write!(f, "before trial"),
            Checkpoint::AfterReadback => write!(f, "after readback"),
            Checkpoint::AfterPersist => write!(f, "after persist"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Hardware connection lost ({checkpoint}): {detail}")]
    HardwareDisconnected {
        checkpoint: Checkpoint,
        detail: String,
    },

    #[error("Short read on channel {channel}: expected {expected} samples, got {received}")]
    ReadFault {
        channel: u32,
        expected: usize,
        received: usize,
    },

    #[error("Circuit load failed: {0}")]
    CircuitLoad(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("Data processing error: {0}")]
    Processing(String),

    #[error("Monitoring error: {0}")]
    Monitoring(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid experiment plan: {0}")]
    Plan(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether this error must terminate the run.
    ///
    /// Only monitoring failures are advisory.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DaqError::Monitoring(_))
    }

    /// Whether this error reports a lost or misbehaving hardware connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            DaqError::HardwareDisconnected { .. } | DaqError::ReadFault { .. }
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

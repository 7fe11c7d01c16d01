//! # Tuning DAQ Core Library
//!
//! Trial-synchronized acquisition for drifting-grating orientation tuning. Each
//! trial shows a gray screen, a drifting grating (or a zero-contrast control),
//! and a gray screen again while a signal processor records every channel; the
//! engine then pulls the elapsed window back from the processor and stores it
//! by set and condition.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the connection health guard and the paced multichannel
//!   reader.
//! - **`config`**: figment-based settings (TOML file plus `TUNING_DAQ_`
//!   environment overrides) and their conversion into an experiment plan.
//! - **`data`**: the trial store trait and its CSV, HDF5 and in-memory
//!   backends, the persistence addressor, and the band-pass monitoring filter.
//! - **`error`**: the `DaqError` enum shared by every module.
//! - **`experiment`**: the immutable plan, the per-set shuffled schedule, the
//!   trial timeline state machine, the acquisition session and the run engine.
//! - **`hardware`**: async capability traits for the processor and the stimulus
//!   display, plus mock implementations.
//! - **`logging`**: `tracing-subscriber` initialisation.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{AppResult, DaqError};
pub use experiment::run_engine::run_experiment;

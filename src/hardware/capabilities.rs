//! Hardware Capabilities
//!
//! The acquisition engine talks to two collaborators it does not own the
//! implementation of:
//!
//! - a **signal processor** that runs a recording circuit, buffers every channel
//!   on the device, and hands windows of samples back on request
//! - a **stimulus display** that renders a drifting grating and blocks on each
//!   display refresh
//!
//! Each collaborator is a small async trait so the engine can run against real
//! devices or the mocks in [`crate::hardware::mock`].
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses `AppResult` for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn arm<P: Processor>(processor: &P, samples: usize) -> AppResult<()> {
//!     processor.load_circuit(Path::new("tuning.rcx"), true, true).await?;
//!     processor.set_tag("samples", samples as f64).await?;
//!     processor.send_trigger(1).await
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppResult;

/// Status word reported by the signal processor.
///
/// The word is a bit set: connected, circuit loaded, circuit running. Only the
/// full set (7) counts as ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStatus(pub u32);

impl ProcessorStatus {
    /// Processor is reachable.
    pub const CONNECTED: u32 = 0b001;
    /// A circuit is loaded.
    pub const CIRCUIT_LOADED: u32 = 0b010;
    /// The loaded circuit is running.
    pub const RUNNING: u32 = 0b100;
    /// The only status word the engine accepts.
    pub const READY: ProcessorStatus = ProcessorStatus(
        Self::CONNECTED | Self::CIRCUIT_LOADED | Self::RUNNING,
    );

    /// Check for the ready sentinel.
    pub fn is_ready(&self) -> bool {
        *self == Self::READY
    }
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: u32| if self.0 & bit != 0 { "yes" } else { "no" };
        write!(
            f,
            "status {} (connected: {}, loaded: {}, running: {})",
            self.0,
            flag(Self::CONNECTED),
            flag(Self::CIRCUIT_LOADED),
            flag(Self::RUNNING)
        )
    }
}

/// On-device sample encoding requested for a channel read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SampleFormat {
    /// 32-bit float.
    #[default]
    F32,
    /// 32-bit signed integer.
    I32,
    /// 16-bit signed integer.
    I16,
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::F32 => write!(f, "F32"),
            SampleFormat::I32 => write!(f, "I32"),
            SampleFormat::I16 => write!(f, "I16"),
        }
    }
}

impl std::str::FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "F32" => Ok(SampleFormat::F32),
            "I32" => Ok(SampleFormat::I32),
            "I16" => Ok(SampleFormat::I16),
            other => Err(format!("Unknown sample format '{other}'")),
        }
    }
}

/// Capability: Buffered Signal Processor
///
/// A recording processor that runs a circuit definition and keeps a per-channel
/// sample buffer which can be read back after the fact.
///
/// # Contract
/// - `send_trigger` marks sample index 0 of the next recording window
/// - `read_channel` returns up to `count` samples starting at `offset`; fewer
///   samples than requested means the bus or the device misbehaved
/// - `status` is cheap and may be called between every step
#[async_trait]
pub trait Processor: Send + Sync {
    /// Load a circuit definition, optionally from the local filesystem, and
    /// optionally start it running.
    async fn load_circuit(&self, path: &Path, local: bool, start: bool) -> AppResult<()>;

    /// Sampling rate of the running circuit in Hz.
    async fn sampling_rate(&self) -> AppResult<f64>;

    /// Current status word.
    async fn status(&self) -> AppResult<ProcessorStatus>;

    /// Write a named circuit parameter.
    async fn set_tag(&self, name: &str, value: f64) -> AppResult<()>;

    /// Fire a software trigger.
    async fn send_trigger(&self, code: u32) -> AppResult<()>;

    /// Read `count` samples of buffered data for one channel.
    async fn read_channel(
        &self,
        channel: u32,
        offset: usize,
        count: usize,
        format: SampleFormat,
    ) -> AppResult<Vec<f32>>;

    /// Halt the circuit and release the device.
    async fn stop(&self) -> AppResult<()>;
}

/// Window and grating parameters for the stimulus display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySpec {
    /// Window size in pixels.
    pub width: u32,
    /// Window size in pixels.
    pub height: u32,
    /// Named monitor calibration profile.
    pub monitor: String,
    /// Grating diameter in degrees of visual angle.
    pub grating_size_deg: f64,
    /// Grating spatial frequency in cycles per degree.
    pub spatial_freq: f64,
    /// Pre-measured duration of one display refresh.
    pub frame_duration: Duration,
}

impl Default for DisplaySpec {
    fn default() -> Self {
        Self {
            width: 800,
            height: 480,
            monitor: "RPi_5in".to_string(),
            grating_size_deg: 40.0,
            spatial_freq: 0.1,
            frame_duration: Duration::from_secs_f64(15.22749 / 1000.0),
        }
    }
}

/// Capability: Grating Stimulus Display
///
/// A window holding one drifting grating. Mutators only change the pending
/// state; nothing is visible until `flip` presents it.
#[async_trait]
pub trait StimulusDisplay: Send + Sync {
    /// Grating contrast in `[0, 1]`.
    async fn set_contrast(&self, contrast: f64) -> AppResult<()>;

    /// Grating orientation in degrees.
    async fn set_orientation(&self, degrees: f64) -> AppResult<()>;

    /// Grating phase in cycles.
    async fn set_phase(&self, phase: f64) -> AppResult<()>;

    /// Draw the grating and wait for the next display refresh.
    async fn flip(&self) -> AppResult<()>;

    /// Duration of one refresh, measured before the run.
    fn frame_duration(&self) -> Duration;

    /// Close the window.
    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: Processor + ?Sized> Processor for Arc<T> {
    async fn load_circuit(&self, path: &Path, local: bool, start: bool) -> AppResult<()> {
        (**self).load_circuit(path, local, start).await
    }

    async fn sampling_rate(&self) -> AppResult<f64> {
        (**self).sampling_rate().await
    }

    async fn status(&self) -> AppResult<ProcessorStatus> {
        (**self).status().await
    }

    async fn set_tag(&self, name: &str, value: f64) -> AppResult<()> {
        (**self).set_tag(name, value).await
    }

    async fn send_trigger(&self, code: u32) -> AppResult<()> {
        (**self).send_trigger(code).await
    }

    async fn read_channel(
        &self,
        channel: u32,
        offset: usize,
        count: usize,
        format: SampleFormat,
    ) -> AppResult<Vec<f32>> {
        (**self).read_channel(channel, offset, count, format).await
    }

    async fn stop(&self) -> AppResult<()> {
        (**self).stop().await
    }
}

#[async_trait]
impl<T: StimulusDisplay + ?Sized> StimulusDisplay for Arc<T> {
    async fn set_contrast(&self, contrast: f64) -> AppResult<()> {
        (**self).set_contrast(contrast).await
    }

    async fn set_orientation(&self, degrees: f64) -> AppResult<()> {
        (**self).set_orientation(degrees).await
    }

    async fn set_phase(&self, phase: f64) -> AppResult<()> {
        (**self).set_phase(phase).await
    }

    async fn flip(&self) -> AppResult<()> {
        (**self).flip().await
    }

    fn frame_duration(&self) -> Duration {
        (**self).frame_duration()
    }

    async fn close(&self) -> AppResult<()> {
        (**self).close().await
    }
}

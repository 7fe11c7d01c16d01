//! Mock Hardware Implementations
//!
//! Provides a simulated signal processor and a headless stimulus display for
//! running the engine without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockProcessor` - Simulated recording processor with fault injection
//! - `MockDisplay` - Headless grating display that records every call
//!
//! # Performance Characteristics
//!
//! - MockProcessor: reads complete after a configurable latency (default 0)
//! - MockDisplay: each flip waits one frame duration

use async_trait::async_trait;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    DisplaySpec, Processor, ProcessorStatus, SampleFormat, StimulusDisplay,
};

// =============================================================================
// MockProcessor - Simulated Recording Processor
// =============================================================================

/// Mock recording processor
///
/// Simulates a processor with:
/// - A fixed sampling rate
/// - Synthetic per-channel traces: a DC level equal to the channel id plus a
///   small 8 Hz oscillation, so every populated sample is non-zero
/// - Optional disconnect after a number of triggers
/// - Optional short reads on one channel
///
/// # Example
///
/// ```rust,ignore
/// let processor = MockProcessor::new(1000.0).with_disconnect_after(3);
/// processor.load_circuit(Path::new("tuning.rcx"), false, true).await?;
/// assert!(processor.status().await?.is_ready());
/// ```
pub struct MockProcessor {
    sampling_rate: f64,
    status: RwLock<ProcessorStatus>,
    triggers: AtomicU64,
    disconnect_after_triggers: Option<u64>,
    short_read_channel: Option<u32>,
    read_latency: Duration,
    tags: Mutex<HashMap<String, f64>>,
    read_log: Mutex<Vec<u32>>,
    stopped: RwLock<bool>,
    unplugged: AtomicBool,
}

impl MockProcessor {
    /// Create a connected mock processor with no circuit loaded.
    ///
    /// # Arguments
    /// * `sampling_rate` - Rate reported once a circuit is loaded, in Hz
    pub fn new(sampling_rate: f64) -> Self {
        Self {
            sampling_rate,
            status: RwLock::new(ProcessorStatus(ProcessorStatus::CONNECTED)),
            triggers: AtomicU64::new(0),
            disconnect_after_triggers: None,
            short_read_channel: None,
            read_latency: Duration::ZERO,
            tags: Mutex::new(HashMap::new()),
            read_log: Mutex::new(Vec::new()),
            stopped: RwLock::new(false),
            unplugged: AtomicBool::new(false),
        }
    }

    /// Drop the connection when trigger number `triggers + 1` is sent.
    pub fn with_disconnect_after(mut self, triggers: u64) -> Self {
        self.disconnect_after_triggers = Some(triggers);
        self
    }

    /// Return half-length buffers whenever `channel` is read.
    pub fn with_short_reads_on(mut self, channel: u32) -> Self {
        self.short_read_channel = Some(channel);
        self
    }

    /// Make every channel read take `latency`.
    pub fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    /// Number of triggers received so far.
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }

    /// Channel ids in the order they were read, across all calls.
    pub async fn read_log(&self) -> Vec<u32> {
        self.read_log.lock().await.clone()
    }

    /// Last value written to a circuit tag.
    pub async fn tag(&self, name: &str) -> Option<f64> {
        self.tags.lock().await.get(name).copied()
    }

    /// Whether `stop` has been called.
    pub async fn is_stopped(&self) -> bool {
        *self.stopped.read().await
    }

    /// Drop the connection immediately. Callable from synchronous code such
    /// as a [`TrialStore`](crate::data::TrialStore) implementation.
    pub fn unplug(&self) {
        warn!("MockProcessor: cable pulled");
        self.unplugged.store(true, Ordering::SeqCst);
    }

    /// Force the status word, e.g. to simulate a cable pull.
    pub async fn set_status(&self, status: ProcessorStatus) {
        *self.status.write().await = status;
    }

    fn synthesize(&self, channel: u32, offset: usize, count: usize) -> Vec<f32> {
        (offset..offset + count)
            .map(|i| {
                let t = i as f64 / self.sampling_rate;
                (f64::from(channel) + 0.25 * (2.0 * PI * 8.0 * t).sin()) as f32
            })
            .collect()
    }
}

#[async_trait]
impl Processor for MockProcessor {
    async fn load_circuit(&self, path: &Path, local: bool, start: bool) -> AppResult<()> {
        if local && !path.exists() {
            return Err(DaqError::CircuitLoad(format!(
                "circuit file {} not found",
                path.display()
            )));
        }
        let mut bits = ProcessorStatus::CONNECTED | ProcessorStatus::CIRCUIT_LOADED;
        if start {
            bits |= ProcessorStatus::RUNNING;
        }
        *self.status.write().await = ProcessorStatus(bits);
        debug!(circuit = %path.display(), start, "MockProcessor: circuit loaded");
        Ok(())
    }

    async fn sampling_rate(&self) -> AppResult<f64> {
        let status = *self.status.read().await;
        if status.0 & ProcessorStatus::CIRCUIT_LOADED == 0 {
            return Err(DaqError::CircuitLoad(
                "no circuit loaded, sampling rate unavailable".to_string(),
            ));
        }
        Ok(self.sampling_rate)
    }

    async fn status(&self) -> AppResult<ProcessorStatus> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Ok(ProcessorStatus(0));
        }
        Ok(*self.status.read().await)
    }

    async fn set_tag(&self, name: &str, value: f64) -> AppResult<()> {
        self.tags.lock().await.insert(name.to_string(), value);
        Ok(())
    }

    async fn send_trigger(&self, code: u32) -> AppResult<()> {
        let sent = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(code, sent, "MockProcessor: trigger");
        if let Some(limit) = self.disconnect_after_triggers {
            if sent > limit {
                warn!(sent, "MockProcessor: simulated disconnect");
                *self.status.write().await = ProcessorStatus(0);
            }
        }
        Ok(())
    }

    async fn read_channel(
        &self,
        channel: u32,
        offset: usize,
        count: usize,
        _format: SampleFormat,
    ) -> AppResult<Vec<f32>> {
        if !self.read_latency.is_zero() {
            sleep(self.read_latency).await;
        }
        self.read_log.lock().await.push(channel);

        if !self.status().await?.is_ready() {
            return Ok(Vec::new());
        }
        if self.short_read_channel == Some(channel) {
            return Ok(self.synthesize(channel, offset, count / 2));
        }
        Ok(self.synthesize(channel, offset, count))
    }

    async fn stop(&self) -> AppResult<()> {
        *self.stopped.write().await = true;
        *self.status.write().await = ProcessorStatus(ProcessorStatus::CONNECTED);
        Ok(())
    }
}

// =============================================================================
// MockDisplay - Headless Grating Display
// =============================================================================

/// One recorded interaction with the display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DisplayCall {
    /// `set_contrast`
    Contrast(f64),
    /// `set_orientation`
    Orientation(f64),
    /// `set_phase`
    Phase(f64),
    /// `flip`
    Flip,
}

/// Headless grating display
///
/// Keeps the pending grating state and a log of every call. Each flip sleeps
/// one frame duration, standing in for the vertical refresh wait.
pub struct MockDisplay {
    spec: DisplaySpec,
    calls: Mutex<Vec<DisplayCall>>,
    closed: RwLock<bool>,
}

impl MockDisplay {
    /// Create a display from a window spec.
    pub fn new(spec: DisplaySpec) -> Self {
        debug!(
            width = spec.width,
            height = spec.height,
            monitor = %spec.monitor,
            "MockDisplay: window opened"
        );
        Self {
            spec,
            calls: Mutex::new(Vec::new()),
            closed: RwLock::new(false),
        }
    }

    /// Create a display with the default window and a custom refresh period.
    pub fn with_frame_duration(frame_duration: Duration) -> Self {
        Self::new(DisplaySpec {
            frame_duration,
            ..DisplaySpec::default()
        })
    }

    /// Every call made so far.
    pub async fn calls(&self) -> Vec<DisplayCall> {
        self.calls.lock().await.clone()
    }

    /// Number of flips made so far.
    pub async fn flip_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| matches!(call, DisplayCall::Flip))
            .count()
    }

    /// Forget the call log.
    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// Whether `close` has been called.
    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }
}

impl Default for MockDisplay {
    fn default() -> Self {
        Self::new(DisplaySpec::default())
    }
}

#[async_trait]
impl StimulusDisplay for MockDisplay {
    async fn set_contrast(&self, contrast: f64) -> AppResult<()> {
        self.calls.lock().await.push(DisplayCall::Contrast(contrast));
        Ok(())
    }

    async fn set_orientation(&self, degrees: f64) -> AppResult<()> {
        self.calls.lock().await.push(DisplayCall::Orientation(degrees));
        Ok(())
    }

    async fn set_phase(&self, phase: f64) -> AppResult<()> {
        self.calls.lock().await.push(DisplayCall::Phase(phase));
        Ok(())
    }

    async fn flip(&self) -> AppResult<()> {
        self.calls.lock().await.push(DisplayCall::Flip);
        sleep(self.spec.frame_duration).await;
        Ok(())
    }

    fn frame_duration(&self) -> Duration {
        self.spec.frame_duration
    }

    async fn close(&self) -> AppResult<()> {
        *self.closed.write().await = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn processor_is_ready_after_loading_and_starting() {
        let processor = MockProcessor::new(1000.0);
        assert!(!processor.status().await.unwrap().is_ready());
        assert!(processor.sampling_rate().await.is_err());

        processor
            .load_circuit(Path::new("unused.rcx"), false, true)
            .await
            .unwrap();
        assert!(processor.status().await.unwrap().is_ready());
        assert_eq!(processor.sampling_rate().await.unwrap(), 1000.0);
    }

    #[tokio::test]
    async fn loaded_but_not_started_is_not_ready() {
        let processor = MockProcessor::new(1000.0);
        processor
            .load_circuit(Path::new("unused.rcx"), false, false)
            .await
            .unwrap();
        assert_eq!(processor.status().await.unwrap(), ProcessorStatus(3));
    }

    #[tokio::test]
    async fn missing_local_circuit_is_rejected() {
        let processor = MockProcessor::new(1000.0);
        let err = processor
            .load_circuit(Path::new("/definitely/not/here.rcx"), true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::CircuitLoad(_)));
    }

    #[tokio::test]
    async fn disconnects_on_trigger_past_limit() {
        let processor = MockProcessor::new(1000.0).with_disconnect_after(2);
        processor
            .load_circuit(Path::new("unused.rcx"), false, true)
            .await
            .unwrap();

        processor.send_trigger(1).await.unwrap();
        processor.send_trigger(1).await.unwrap();
        assert!(processor.status().await.unwrap().is_ready());

        processor.send_trigger(1).await.unwrap();
        assert_eq!(processor.status().await.unwrap(), ProcessorStatus(0));
        assert!(processor
            .read_channel(1, 0, 10, SampleFormat::F32)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unplug_drops_status_and_reads() {
        let processor = MockProcessor::new(1000.0);
        processor
            .load_circuit(Path::new("unused.rcx"), false, true)
            .await
            .unwrap();
        processor.unplug();
        assert_eq!(processor.status().await.unwrap(), ProcessorStatus(0));
        assert!(processor
            .read_channel(2, 0, 10, SampleFormat::F32)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn synthetic_trace_sits_on_channel_level() {
        let processor = MockProcessor::new(1000.0);
        processor
            .load_circuit(Path::new("unused.rcx"), false, true)
            .await
            .unwrap();
        let trace = processor
            .read_channel(4, 0, 500, SampleFormat::F32)
            .await
            .unwrap();
        assert_eq!(trace.len(), 500);
        assert!(trace.iter().all(|&v| (3.7..=4.3).contains(&v)));
    }

    #[tokio::test(start_paused = true)]
    async fn flip_waits_one_frame() {
        let display = MockDisplay::with_frame_duration(Duration::from_millis(16));
        let start = tokio::time::Instant::now();
        display.flip().await.unwrap();
        display.flip().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(32));
        assert_eq!(display.flip_count().await, 2);
    }
}

//! Live monitoring of one reference channel.
//!
//! After a trial has been persisted, the reference channel's row is split into
//! an LFP band and a spike band and published to a [`MonitorSink`] for display.
//! Monitoring reads a borrowed view of the stored buffer and is strictly
//! advisory: any failure is logged and the run carries on.

use ndarray::ArrayView2;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::iir_filter::{BandSpec, BandpassFilter};
use crate::error::{AppResult, DaqError};
use crate::experiment::plan::{ConditionLabel, PhaseDurations};

/// Default LFP band: 0.5-300 Hz, first order.
pub const LFP_BAND: BandSpec = BandSpec {
    low_hz: 0.5,
    high_hz: 300.0,
    order: 1,
};

/// Default spike band: 300-5000 Hz, fifth order.
pub const SPIKE_BAND: BandSpec = BandSpec {
    low_hz: 300.0,
    high_hz: 5000.0,
    order: 5,
};

/// One monitoring update.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorFrame {
    /// 0-based set index.
    pub set_index: usize,
    /// Condition of the trial.
    pub label: ConditionLabel,
    /// Reference channel id.
    pub channel: u32,
    /// Sample times in milliseconds from the trigger.
    pub time_ms: Vec<f64>,
    /// Start and end of the stimulus period in milliseconds.
    pub stimulus_window_ms: (f64, f64),
    /// Unfiltered trace.
    pub raw: Vec<f64>,
    /// LFP band.
    pub lfp: Vec<f64>,
    /// Spike band.
    pub spike: Vec<f64>,
}

impl MonitorFrame {
    /// `(min, max)` of a trace, for axis scaling.
    pub fn range(samples: &[f64]) -> (f64, f64) {
        samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }
}

/// Evenly spaced sample times covering `total_ms`, endpoints included.
pub fn time_axis_ms(total_ms: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => {
            let step = total_ms / (n - 1) as f64;
            (0..n).map(|i| i as f64 * step).collect()
        }
    }
}

/// Band decomposition of the reference channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitoringFilter {
    reference_channel: u32,
    lfp: BandSpec,
    spike: BandSpec,
}

impl Default for MonitoringFilter {
    fn default() -> Self {
        Self::new(5, LFP_BAND, SPIKE_BAND)
    }
}

impl MonitoringFilter {
    /// Monitor `reference_channel` with the given bands.
    pub fn new(reference_channel: u32, lfp: BandSpec, spike: BandSpec) -> Self {
        Self {
            reference_channel,
            lfp,
            spike,
        }
    }

    /// Channel being monitored.
    pub fn reference_channel(&self) -> u32 {
        self.reference_channel
    }

    /// Build a frame from a stored trial buffer.
    pub fn analyze(
        &self,
        set_index: usize,
        label: ConditionLabel,
        buffer: ArrayView2<'_, f32>,
        sampling_rate: f64,
        durations: PhaseDurations,
    ) -> AppResult<MonitorFrame> {
        let row = (self.reference_channel as usize)
            .checked_sub(1)
            .filter(|&row| row < buffer.nrows())
            .ok_or_else(|| {
                DaqError::Monitoring(format!(
                    "reference channel {} is outside the {}-row buffer",
                    self.reference_channel,
                    buffer.nrows()
                ))
            })?;

        let raw: Vec<f64> = buffer.row(row).iter().map(|&v| f64::from(v)).collect();
        let lfp = BandpassFilter::new(self.lfp, sampling_rate)
            .map_err(|e| DaqError::Monitoring(format!("LFP band: {e}")))?
            .filter(&raw);
        let spike = BandpassFilter::new(self.spike, sampling_rate)
            .map_err(|e| DaqError::Monitoring(format!("spike band: {e}")))?
            .filter(&raw);

        let pre_ms = durations.pre.as_secs_f64() * 1000.0;
        let stim_ms = durations.stimulus.as_secs_f64() * 1000.0;
        Ok(MonitorFrame {
            set_index,
            label,
            channel: self.reference_channel,
            time_ms: time_axis_ms(durations.total().as_secs_f64() * 1000.0, raw.len()),
            stimulus_window_ms: (pre_ms, pre_ms + stim_ms),
            raw,
            lfp,
            spike,
        })
    }
}

/// Consumer of monitoring frames.
pub trait MonitorSink: Send + Sync {
    /// Deliver one frame. Must not block the trial loop.
    fn publish(&self, frame: MonitorFrame) -> AppResult<()>;
}

/// Sink that logs a one-line summary per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMonitor;

impl MonitorSink for LogMonitor {
    fn publish(&self, frame: MonitorFrame) -> AppResult<()> {
        let (raw_lo, raw_hi) = MonitorFrame::range(&frame.raw);
        let (lfp_lo, lfp_hi) = MonitorFrame::range(&frame.lfp);
        let (spk_lo, spk_hi) = MonitorFrame::range(&frame.spike);
        info!(
            set = frame.set_index + 1,
            label = %frame.label,
            channel = frame.channel,
            raw = %format!("{raw_lo:.3}..{raw_hi:.3}"),
            lfp = %format!("{lfp_lo:.3}..{lfp_hi:.3}"),
            spike = %format!("{spk_lo:.3}..{spk_hi:.3}"),
            "monitor"
        );
        Ok(())
    }
}

/// Sink that forwards frames to a live display task over a bounded channel.
///
/// When the display falls behind, frames are dropped rather than queued.
#[derive(Debug, Clone)]
pub struct ChannelMonitor {
    tx: mpsc::Sender<MonitorFrame>,
}

impl ChannelMonitor {
    /// Create a sink and the receiver for the display task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MonitorFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl MonitorSink for ChannelMonitor {
    fn publish(&self, frame: MonitorFrame) -> AppResult<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("monitor display busy, frame dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(DaqError::Monitoring("monitor display has gone away".to_string()))
            }
        }
    }
}

/// Monitoring filter paired with its sink.
pub struct Monitor {
    filter: MonitoringFilter,
    sink: Box<dyn MonitorSink>,
}

impl Monitor {
    /// Pair a filter with a sink.
    pub fn new(filter: MonitoringFilter, sink: Box<dyn MonitorSink>) -> Self {
        Self { filter, sink }
    }

    /// Analyze and publish, propagating any failure.
    pub fn try_observe(
        &self,
        set_index: usize,
        label: ConditionLabel,
        buffer: ArrayView2<'_, f32>,
        sampling_rate: f64,
        durations: PhaseDurations,
    ) -> AppResult<()> {
        let frame = self
            .filter
            .analyze(set_index, label, buffer, sampling_rate, durations)?;
        self.sink.publish(frame)
    }

    /// Analyze and publish; failures are logged and reported as `false`.
    pub fn observe(
        &self,
        set_index: usize,
        label: ConditionLabel,
        buffer: ArrayView2<'_, f32>,
        sampling_rate: f64,
        durations: PhaseDurations,
    ) -> bool {
        match self.try_observe(set_index, label, buffer, sampling_rate, durations) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, set = set_index + 1, %label, "monitoring failed, continuing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    const FS: f64 = 24414.0625;

    fn buffer(rows: usize, n: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, n), |(r, i)| {
            (r + 1) as f32 + (i as f32 * 0.01).sin()
        })
    }

    #[test]
    fn time_axis_matches_linspace() {
        assert_eq!(time_axis_ms(6000.0, 4), vec![0.0, 2000.0, 4000.0, 6000.0]);
        assert!(time_axis_ms(6000.0, 0).is_empty());
    }

    #[test]
    fn analyze_extracts_reference_row_and_marks_stimulus() {
        let data = buffer(5, 4096);
        let frame = MonitoringFilter::default()
            .analyze(
                2,
                ConditionLabel::Angle(90.0),
                data.view(),
                FS,
                PhaseDurations::default(),
            )
            .unwrap();
        assert_eq!(frame.channel, 5);
        assert_eq!(frame.raw.len(), 4096);
        assert_eq!(frame.lfp.len(), 4096);
        assert_eq!(frame.spike.len(), 4096);
        assert_eq!(frame.raw[0], 5.0);
        assert_eq!(frame.stimulus_window_ms, (2000.0, 4000.0));
        assert!((frame.time_ms[4095] - 6000.0).abs() < 1e-6);
    }

    #[test]
    fn missing_reference_row_is_a_monitoring_error() {
        let data = buffer(3, 16);
        let err = MonitoringFilter::default()
            .analyze(0, ConditionLabel::Baseline, data.view(), FS, PhaseDurations::default())
            .unwrap_err();
        assert!(matches!(err, DaqError::Monitoring(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn spike_band_above_nyquist_is_a_monitoring_error() {
        let data = buffer(5, 16);
        let err = MonitoringFilter::default()
            .analyze(0, ConditionLabel::Baseline, data.view(), 1000.0, PhaseDurations::default())
            .unwrap_err();
        assert!(err.to_string().contains("spike band"));
    }

    #[tokio::test]
    async fn channel_monitor_delivers_and_drops_when_full() {
        let (sink, mut rx) = ChannelMonitor::channel(1);
        let monitor = Monitor::new(MonitoringFilter::default(), Box::new(sink));
        let data = buffer(5, 1024);

        for _ in 0..3 {
            assert!(monitor.observe(
                0,
                ConditionLabel::Angle(0.0),
                data.view(),
                FS,
                PhaseDurations::default()
            ));
        }
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.label, ConditionLabel::Angle(0.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn observe_swallows_failures() {
        let (sink, rx) = ChannelMonitor::channel(4);
        drop(rx);
        let monitor = Monitor::new(MonitoringFilter::default(), Box::new(sink));
        let data = buffer(5, 64);
        assert!(!monitor.observe(
            0,
            ConditionLabel::Angle(0.0),
            data.view(),
            FS,
            PhaseDurations::default()
        ));
    }
}

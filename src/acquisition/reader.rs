//! Paced multichannel readback.
//!
//! After a trial window has elapsed, every requested channel is pulled back from
//! the processor's on-device buffer, one channel at a time. The shared bus cannot
//! sustain back-to-back reads, so the reader pauses between channels, and it
//! visits channels in a fresh random order on every call so that the same
//! sub-processor is not always hit first.
//!
//! The returned buffer is addressed by channel id: row `id - 1` holds channel
//! `id`, and the row count is the highest requested id. Rows for ids that were
//! not requested stay zero.

use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};
use crate::experiment::plan::ChannelSet;
use crate::hardware::{Processor, SampleFormat};

/// Inter-read pause policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Pacing {
    /// Issue reads back to back.
    None,
    /// Wait a fixed duration between reads.
    Fixed(Duration),
    /// Wait `max(floor, factor * last read round trip)` between reads.
    Adaptive {
        /// Minimum pause.
        floor: Duration,
        /// Multiplier applied to the measured round trip.
        factor: f64,
    },
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Fixed(Duration::from_millis(5))
    }
}

impl Pacing {
    /// Pause to apply after a read that took `round_trip`.
    ///
    /// An adaptive pause too large for a [`Duration`] falls back to the floor.
    pub fn pause_after(&self, round_trip: Duration) -> Option<Duration> {
        match *self {
            Pacing::None => None,
            Pacing::Fixed(pause) => Some(pause),
            Pacing::Adaptive { floor, factor } => {
                let scaled =
                    Duration::try_from_secs_f64(round_trip.as_secs_f64() * factor.max(0.0))
                        .unwrap_or(floor);
                Some(floor.max(scaled))
            }
        }
    }
}

/// Result of one readback pass.
#[derive(Debug)]
pub struct Readback {
    /// `(max channel id, window length)` samples.
    pub buffer: Array2<f32>,
    /// Channel ids in the order they were read.
    pub order: Vec<u32>,
    /// Reads that came back short or empty.
    pub faults: Vec<DaqError>,
}

impl Readback {
    /// True when every channel returned a full window.
    pub fn is_complete(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Reads fixed-length windows from a sparse set of channels, one at a time.
pub struct PacedReader {
    pacing: Pacing,
    format: SampleFormat,
    rng: StdRng,
}

impl PacedReader {
    /// Create a reader with an entropy-seeded visiting order.
    pub fn new(pacing: Pacing, format: SampleFormat) -> Self {
        Self {
            pacing,
            format,
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a reader whose visiting order is reproducible.
    pub fn with_seed(pacing: Pacing, format: SampleFormat, seed: u64) -> Self {
        Self {
            pacing,
            format,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Configured pacing.
    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Pull `window_length` samples from every channel in `channels`.
    ///
    /// Short or empty reads do not abort the pass; they are collected in
    /// [`Readback::faults`] for the health guard to escalate.
    pub async fn read<P: Processor + ?Sized>(
        &mut self,
        processor: &P,
        channels: &ChannelSet,
        window_length: usize,
    ) -> AppResult<Readback> {
        let mut buffer = Array2::<f32>::zeros((channels.max_id() as usize, window_length));
        let mut order = channels.ids().to_vec();
        order.shuffle(&mut self.rng);
        let mut faults = Vec::new();

        for (i, &channel) in order.iter().enumerate() {
            debug!(channel, "reading channel");
            let started = Instant::now();
            let samples = processor
                .read_channel(channel, 0, window_length, self.format)
                .await?;
            let round_trip = started.elapsed();

            let row = channel as usize - 1;
            if samples.len() == window_length {
                buffer.row_mut(row).assign(&ArrayView1::from(&samples[..]));
            } else {
                warn!(
                    channel,
                    expected = window_length,
                    received = samples.len(),
                    "short read"
                );
                faults.push(DaqError::ReadFault {
                    channel,
                    expected: window_length,
                    received: samples.len(),
                });
            }

            if i + 1 < order.len() {
                if let Some(pause) = self.pacing.pause_after(round_trip) {
                    sleep(pause).await;
                }
            }
        }

        Ok(Readback {
            buffer,
            order,
            faults,
        })
    }
}

//! Butterworth band-pass filtering for the monitoring path.
//!
//! Each band edge is a cascade of second-order `biquad` sections. The filters
//! run on a copy of the stored trace and never touch acquisition buffers.
use biquad::{Biquad, Coefficients, DirectForm1, ToHertz};
use serde::Deserialize;
use std::f64::consts::PI;

use crate::error::{AppResult, DaqError};

#[derive(Debug, Clone, Copy)]
enum Edge {
    HighPass,
    LowPass,
}

/// One second-order section.
struct Section {
    filter: DirectForm1<f64>,
}

impl Section {
    fn design(edge: Edge, f0: f64, fs: f64, q: f64) -> AppResult<Self> {
        let kind = match edge {
            Edge::HighPass => biquad::Type::HighPass,
            Edge::LowPass => biquad::Type::LowPass,
        };
        let coeffs = Coefficients::<f64>::from_params(kind, fs.hz(), f0.hz(), q).map_err(|_| {
            DaqError::Processing(format!(
                "cannot design {edge:?} section at {f0} Hz for {fs} Hz sampling"
            ))
        })?;
        Ok(Self {
            filter: DirectForm1::<f64>::new(coeffs),
        })
    }
}

/// Pass band of a Butterworth band-pass decomposition.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct BandSpec {
    /// Lower edge in Hz.
    pub low_hz: f64,
    /// Upper edge in Hz.
    pub high_hz: f64,
    /// Butterworth order of each edge. Odd orders round up to the next even order.
    pub order: usize,
}

/// Band-pass built as a cascade of Butterworth high-pass sections at the lower
/// edge followed by low-pass sections at the upper edge.
pub struct BandpassFilter {
    sections: Vec<Section>,
}

impl BandpassFilter {
    /// Design a band-pass for data sampled at `fs` Hz.
    pub fn new(band: BandSpec, fs: f64) -> AppResult<Self> {
        if !(band.low_hz > 0.0 && band.low_hz < band.high_hz) {
            return Err(DaqError::Processing(format!(
                "invalid band {}-{} Hz",
                band.low_hz, band.high_hz
            )));
        }
        if band.high_hz >= fs / 2.0 {
            return Err(DaqError::Processing(format!(
                "upper band edge {} Hz is not below Nyquist ({} Hz)",
                band.high_hz,
                fs / 2.0
            )));
        }

        let qs = butterworth_qs(band.order);
        let mut sections = Vec::with_capacity(qs.len() * 2);
        for (edge, f0) in [(Edge::HighPass, band.low_hz), (Edge::LowPass, band.high_hz)] {
            for &q in &qs {
                sections.push(Section::design(edge, f0, fs, q)?);
            }
        }
        Ok(Self { sections })
    }

    /// Number of second-order sections in the cascade.
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Filter a whole trace from a zeroed state.
    pub fn filter(&mut self, samples: &[f64]) -> Vec<f64> {
        for section in &mut self.sections {
            section.filter.reset_state();
        }
        samples
            .iter()
            .map(|&x| {
                self.sections
                    .iter_mut()
                    .fold(x, |acc, section| section.filter.run(acc))
            })
            .collect()
    }
}

/// Q factors of the second-order sections of an even-order Butterworth response.
fn butterworth_qs(order: usize) -> Vec<f64> {
    let pairs = order.max(1).div_ceil(2);
    let n = (2 * pairs) as f64;
    (0..pairs)
        .map(|k| 1.0 / (2.0 * (PI * (2 * k + 1) as f64 / (2.0 * n)).sin()))
        .collect()
}

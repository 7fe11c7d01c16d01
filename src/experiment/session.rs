//! Acquisition session: exclusive owner of the processor and the trial store
//! for the lifetime of one run.

use std::path::Path;
use tracing::{info, warn};

use crate::acquisition::HealthGuard;
use crate::data::storage::{DatasetAddress, PersistenceAddressor, RunMetadata, TrialStore};
use crate::error::{AppResult, Checkpoint, DaqError};
use crate::experiment::timeline::Trial;
use crate::hardware::Processor;

/// Processor handle, sampling rate and open store for one run.
///
/// Opened once at run start and closed once at run end. The sampling rate is
/// read from the processor when the session opens and never re-read.
pub struct AcquisitionSession<P: Processor, S: TrialStore> {
    processor: P,
    sampling_rate: f64,
    addressor: PersistenceAddressor<S>,
    guard: HealthGuard,
}

impl<P: Processor, S: TrialStore> AcquisitionSession<P, S> {
    /// Load and start `circuit`, read the sampling rate, and verify the
    /// connection. On failure the processor is stopped and the store closed
    /// before the error is returned.
    pub async fn open(
        processor: P,
        store: S,
        circuit: &Path,
        guard: HealthGuard,
    ) -> AppResult<Self> {
        let mut addressor = PersistenceAddressor::new(store);
        match Self::start(&processor, circuit, &guard).await {
            Ok(sampling_rate) => {
                info!(circuit = %circuit.display(), sampling_rate, "acquisition session open");
                Ok(Self {
                    processor,
                    sampling_rate,
                    addressor,
                    guard,
                })
            }
            Err(err) => {
                if let Err(stop_err) = processor.stop().await {
                    warn!(error = %stop_err, "processor stop failed during teardown");
                }
                if let Err(close_err) = addressor.close() {
                    warn!(error = %close_err, "store close failed during teardown");
                }
                Err(err)
            }
        }
    }

    async fn start(processor: &P, circuit: &Path, guard: &HealthGuard) -> AppResult<f64> {
        processor.load_circuit(circuit, true, true).await?;
        let sampling_rate = processor.sampling_rate().await?;
        if !(sampling_rate.is_finite() && sampling_rate > 0.0) {
            return Err(DaqError::CircuitLoad(format!(
                "processor reported sampling rate {sampling_rate}"
            )));
        }
        guard.check(processor, Checkpoint::SessionStart).await?;
        Ok(sampling_rate)
    }

    /// The processor handle.
    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Sampling rate read at session start, in Hz.
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Health guard used by this session.
    pub fn guard(&self) -> &HealthGuard {
        &self.guard
    }

    /// Record run-level attributes in the store.
    pub fn write_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        self.addressor.write_metadata(metadata)
    }

    /// Persist a completed trial.
    pub fn persist(&mut self, trial: &Trial) -> AppResult<DatasetAddress> {
        self.addressor.store(trial)
    }

    /// Stop the processor and close the store. Both are attempted; the first
    /// failure is returned.
    pub async fn close(mut self) -> AppResult<()> {
        let stopped = self.processor.stop().await;
        let closed = self.addressor.close();
        info!("acquisition session closed");
        stopped.and(closed)
    }
}

//! HDF5 trial store.
//!
//! One HDF5 file per run, truncated on open:
//!
//! ```text
//! /                      attrs: sampling_rate, window_length, run_metadata (JSON)
//! /set_1/0               f32 dataset, (max channel id, window length)
//! /set_1/30
//! /set_1/-1
//! /set_2/...
//! ```
//!
//! Readable from Python with `h5py.File(path)["set_3"]["90"][:]`.

use hdf5::types::VarLenUnicode;
use hdf5::File;
use ndarray::ArrayView2;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::storage::{RunMetadata, TrialStore};
use crate::error::{AppResult, DaqError};

/// Trial store backed by a single HDF5 file.
pub struct Hdf5TrialStore {
    path: PathBuf,
    file: Option<File>,
}

impl Hdf5TrialStore {
    /// Create the file, truncating any previous content.
    pub fn create(path: &Path) -> AppResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> AppResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| DaqError::Storage("store is closed".to_string()))
    }
}

impl TrialStore for Hdf5TrialStore {
    fn create_group(&mut self, group: &str) -> AppResult<()> {
        self.file()?.create_group(group)?;
        Ok(())
    }

    fn write_dataset(
        &mut self,
        group: &str,
        name: &str,
        data: ArrayView2<'_, f32>,
    ) -> AppResult<()> {
        let group = self.file()?.group(group)?;
        let dataset = group
            .new_dataset::<f32>()
            .shape(data.dim())
            .create(name)?;
        dataset.write(data)?;
        debug!(dataset = %dataset.name(), "dataset written");
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        let file = self.file()?;
        file.new_attr::<f64>()
            .create("sampling_rate")?
            .write_scalar(&metadata.sampling_rate)?;
        file.new_attr::<u64>()
            .create("window_length")?
            .write_scalar(&(metadata.window_length as u64))?;

        let json = serde_json::to_string(metadata)?;
        let value = json
            .parse::<VarLenUnicode>()
            .map_err(|e| DaqError::Storage(format!("run metadata not storable: {e}")))?;
        file.new_attr::<VarLenUnicode>()
            .create("run_metadata")?
            .write_scalar(&value)?;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if let Some(file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

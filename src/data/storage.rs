//! Hierarchical trial storage.
//!
//! Trials are stored under a two-level hierarchy: one group per set
//! (`set_1`, `set_2`, ...) and one dataset per condition inside it, named by the
//! condition's literal value (`0`, `30`, ..., `-1`). Each dataset is created at
//! its final `(max channel id, window length)` shape and written in one call.
//!
//! The [`TrialStore`] trait abstracts the backing format; the
//! [`PersistenceAddressor`] maps completed trials onto it.

use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::experiment::plan::ConditionLabel;
use crate::experiment::timeline::Trial;

/// Run-level attributes written once at the start of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run identifier.
    pub run_id: String,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
    /// Processor sampling rate in Hz.
    pub sampling_rate: f64,
    /// Samples per channel per trial.
    pub window_length: usize,
    /// Pre-stimulus gray hold in seconds.
    pub pre_s: f64,
    /// Stimulus hold in seconds.
    pub stimulus_s: f64,
    /// Post-stimulus gray hold in seconds.
    pub post_s: f64,
    /// Display refresh period used for frame counts, in milliseconds.
    pub frame_duration_ms: f64,
    /// Frames presented per stimulus trial.
    pub frame_count: usize,
    /// Grating phase advance per frame.
    pub phase_step: f64,
    /// Grating spatial frequency in cycles per degree.
    pub spatial_freq: f64,
    /// Requested channel ids.
    pub channels: Vec<u32>,
    /// Configured condition list, baseline last.
    pub conditions: Vec<ConditionLabel>,
    /// Number of sets.
    pub num_sets: usize,
    /// Shuffling seed, if fixed.
    pub seed: Option<u64>,
}

/// Backing format for trial data.
pub trait TrialStore: Send {
    /// Create a group. Fails if it already exists.
    fn create_group(&mut self, group: &str) -> AppResult<()>;

    /// Create `name` inside `group` at the shape of `data` and write it.
    /// Fails if the group is missing or the dataset already exists.
    fn write_dataset(&mut self, group: &str, name: &str, data: ArrayView2<'_, f32>)
        -> AppResult<()>;

    /// Record run-level attributes.
    fn write_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()>;

    /// Flush and release the store. Data already written stays readable.
    fn close(&mut self) -> AppResult<()>;
}

impl<T: TrialStore + ?Sized> TrialStore for Box<T> {
    fn create_group(&mut self, group: &str) -> AppResult<()> {
        (**self).create_group(group)
    }

    fn write_dataset(
        &mut self,
        group: &str,
        name: &str,
        data: ArrayView2<'_, f32>,
    ) -> AppResult<()> {
        (**self).write_dataset(group, name, data)
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        (**self).write_metadata(metadata)
    }

    fn close(&mut self) -> AppResult<()> {
        (**self).close()
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    groups: BTreeMap<String, BTreeMap<String, Array2<f32>>>,
    metadata: Option<RunMetadata>,
    closed: bool,
}

/// In-memory store. Clones share the same contents, so a caller can keep a
/// handle and inspect what a run wrote after the session has consumed the
/// store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| DaqError::Storage("memory store lock poisoned".to_string()))
    }

    /// Group names in sorted order.
    pub fn groups(&self) -> Vec<String> {
        self.lock()
            .map(|inner| inner.groups.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Dataset names within a group, sorted.
    pub fn datasets(&self, group: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|inner| inner.groups.get(group).map(|g| g.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// Copy of one dataset.
    pub fn dataset(&self, group: &str, name: &str) -> Option<Array2<f32>> {
        self.lock()
            .ok()
            .and_then(|inner| inner.groups.get(group)?.get(name).cloned())
    }

    /// Total number of datasets across all groups.
    pub fn dataset_count(&self) -> usize {
        self.lock()
            .map(|inner| inner.groups.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// Run attributes, if written.
    pub fn metadata(&self) -> Option<RunMetadata> {
        self.lock().ok().and_then(|inner| inner.metadata.clone())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().map(|inner| inner.closed).unwrap_or(false)
    }
}

impl TrialStore for MemoryStore {
    fn create_group(&mut self, group: &str) -> AppResult<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(DaqError::Storage("store is closed".to_string()));
        }
        if inner.groups.contains_key(group) {
            return Err(DaqError::Storage(format!("group '{group}' already exists")));
        }
        inner.groups.insert(group.to_string(), BTreeMap::new());
        Ok(())
    }

    fn write_dataset(
        &mut self,
        group: &str,
        name: &str,
        data: ArrayView2<'_, f32>,
    ) -> AppResult<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(DaqError::Storage("store is closed".to_string()));
        }
        let datasets = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| DaqError::Storage(format!("group '{group}' does not exist")))?;
        if datasets.contains_key(name) {
            return Err(DaqError::Storage(format!(
                "dataset '{group}/{name}' already exists"
            )));
        }
        datasets.insert(name.to_string(), data.to_owned());
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        self.lock()?.metadata = Some(metadata.clone());
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.lock()?.closed = true;
        Ok(())
    }
}

// =============================================================================
// Backend selection
// =============================================================================

/// Available storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Directory per set, one CSV file per condition.
    Csv,
    /// One HDF5 file with a group per set.
    Hdf5,
    /// Kept in memory only.
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Csv => write!(f, "csv"),
            StorageBackend::Hdf5 => write!(f, "hdf5"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(StorageBackend::Csv),
            "hdf5" | "h5" => Ok(StorageBackend::Hdf5),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(DaqError::Configuration(format!(
                "Unknown storage backend '{other}'. Must be one of: csv, hdf5, memory"
            ))),
        }
    }
}

/// Open a fresh store of the given kind at `path`, replacing previous content.
pub fn open_store(backend: StorageBackend, path: &Path) -> AppResult<Box<dyn TrialStore>> {
    info!(%backend, path = %path.display(), "opening trial store");
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryStore::new())),
        #[cfg(feature = "storage_csv")]
        StorageBackend::Csv => Ok(Box::new(super::csv_writer::CsvTrialStore::create(path)?)),
        #[cfg(not(feature = "storage_csv"))]
        StorageBackend::Csv => Err(DaqError::FeatureNotEnabled("storage_csv".to_string())),
        #[cfg(feature = "storage_hdf5")]
        StorageBackend::Hdf5 => Ok(Box::new(super::hdf5_writer::Hdf5TrialStore::create(
            path,
        )?)),
        #[cfg(not(feature = "storage_hdf5"))]
        StorageBackend::Hdf5 => Err(DaqError::FeatureNotEnabled("storage_hdf5".to_string())),
    }
}

// =============================================================================
// PersistenceAddressor
// =============================================================================

/// Location of a stored trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetAddress {
    /// Set group name.
    pub group: String,
    /// Dataset name within the group.
    pub dataset: String,
}

impl fmt::Display for DatasetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.dataset)
    }
}

/// Group name for a 0-based set index.
pub fn group_name(set_index: usize) -> String {
    format!("set_{}", set_index + 1)
}

/// Dataset name for a condition.
pub fn dataset_name(label: ConditionLabel) -> String {
    label.to_string()
}

/// Maps completed trials onto a [`TrialStore`] by set and condition.
pub struct PersistenceAddressor<S: TrialStore> {
    store: S,
    groups: HashSet<usize>,
}

impl<S: TrialStore> PersistenceAddressor<S> {
    /// Wrap a freshly opened store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            groups: HashSet::new(),
        }
    }

    /// Record run-level attributes.
    pub fn write_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        self.store.write_metadata(metadata)
    }

    /// Persist one trial, creating its set group on first use.
    pub fn store(&mut self, trial: &Trial) -> AppResult<DatasetAddress> {
        let address = DatasetAddress {
            group: group_name(trial.set_index),
            dataset: dataset_name(trial.label),
        };
        if self.groups.insert(trial.set_index) {
            debug!(group = %address.group, "creating set group");
            self.store.create_group(&address.group)?;
        }
        self.store
            .write_dataset(&address.group, &address.dataset, trial.buffer.view())?;
        debug!(%address, shape = ?trial.buffer.dim(), "trial persisted");
        Ok(address)
    }

    /// Close the underlying store.
    pub fn close(&mut self) -> AppResult<()> {
        self.store.close()
    }
}

//! Directory-tree trial store.
//!
//! Mirrors the group/dataset hierarchy on the filesystem:
//!
//! ```text
//! <root>/
//!   run.json          run metadata
//!   set_1/
//!     0.csv           one row per channel row, one column per sample
//!     30.csv
//!     -1.csv
//!   set_2/
//!     ...
//! ```
//!
//! Each CSV file is written in one pass when the trial completes.

use csv::WriterBuilder;
use ndarray::ArrayView2;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::storage::{RunMetadata, TrialStore};
use crate::error::{AppResult, DaqError};

const METADATA_FILE: &str = "run.json";

/// Trial store writing one CSV file per dataset under a root directory.
pub struct CsvTrialStore {
    root: PathBuf,
    closed: bool,
}

impl CsvTrialStore {
    /// Create the root directory, clearing any previous run stored in it.
    ///
    /// Only `run.json` and `set_<n>` directories are removed; anything else
    /// under `root` is left alone.
    pub fn create(root: &Path) -> AppResult<Self> {
        if root.exists() {
            if !root.is_dir() {
                return Err(DaqError::Storage(format!(
                    "{} exists and is not a directory",
                    root.display()
                )));
            }
            clear_previous_run(root)?;
        }
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            closed: false,
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            return Err(DaqError::Storage("store is closed".to_string()));
        }
        Ok(())
    }
}

fn clear_previous_run(root: &Path) -> AppResult<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == METADATA_FILE && path.is_file() {
            fs::remove_file(&path)?;
        } else if is_set_group(name) && path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            continue;
        }
        debug!(path = %path.display(), "removed previous run entry");
    }
    Ok(())
}

fn is_set_group(name: &str) -> bool {
    name.strip_prefix("set_")
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

impl TrialStore for CsvTrialStore {
    fn create_group(&mut self, group: &str) -> AppResult<()> {
        self.ensure_open()?;
        let dir = self.root.join(group);
        if dir.exists() {
            return Err(DaqError::Storage(format!("group '{group}' already exists")));
        }
        fs::create_dir(&dir)?;
        Ok(())
    }

    fn write_dataset(
        &mut self,
        group: &str,
        name: &str,
        data: ArrayView2<'_, f32>,
    ) -> AppResult<()> {
        self.ensure_open()?;
        let dir = self.root.join(group);
        if !dir.is_dir() {
            return Err(DaqError::Storage(format!("group '{group}' does not exist")));
        }
        let path = dir.join(format!("{name}.csv"));
        if path.exists() {
            return Err(DaqError::Storage(format!(
                "dataset '{group}/{name}' already exists"
            )));
        }

        let mut writer = WriterBuilder::new().has_headers(false).from_path(&path)?;
        for row in data.rows() {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        debug!(path = %path.display(), "dataset written");
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        self.ensure_open()?;
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(self.root.join(METADATA_FILE), json)?;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Read one dataset back as rows of samples.
pub fn read_dataset(root: &Path, group: &str, name: &str) -> AppResult<Vec<Vec<f32>>> {
    let path = root.join(group).join(format!("{name}.csv"));
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(&path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = record
            .iter()
            .map(|field| {
                field.parse::<f32>().map_err(|e| {
                    DaqError::Storage(format!("{}: bad sample '{field}': {e}", path.display()))
                })
            })
            .collect::<AppResult<Vec<f32>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

//! Trial persistence and monitoring.
#[cfg(feature = "storage_csv")]
pub mod csv_writer;
#[cfg(feature = "storage_hdf5")]
pub mod hdf5_writer;
pub mod iir_filter;
pub mod monitor;
pub mod storage;

pub use monitor::{ChannelMonitor, LogMonitor, Monitor, MonitorFrame, MonitorSink, MonitoringFilter};
pub use storage::{
    open_store, DatasetAddress, MemoryStore, PersistenceAddressor, RunMetadata, StorageBackend,
    TrialStore,
};

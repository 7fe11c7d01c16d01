//! Hardware collaborators: capability traits and mock implementations.

pub mod capabilities;
pub mod mock;

pub use capabilities::{DisplaySpec, Processor, ProcessorStatus, SampleFormat, StimulusDisplay};

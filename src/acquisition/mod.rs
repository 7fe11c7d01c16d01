//! Hardware-facing acquisition primitives: the connection health guard and the
//! paced multichannel reader.

pub mod health;
pub mod reader;

pub use health::{HealthGuard, RetryPolicy};
pub use reader::{PacedReader, Pacing, Readback};

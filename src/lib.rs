//! wxlink: direct weather-station link engine
//!
//! This library dials a weather-station data logger over a raw socket, runs
//! the wake/identify/measure/archive exchange against it, validates the
//! CRC-protected binary frames it returns, and hands normalized observations
//! to a caller-provided sink. Live polls and archive catch-up share one
//! deadline-bounded channel per station.

pub mod channel;
pub mod core;
pub mod protocol;
pub mod time;
pub mod wxmath;

// Re-export commonly used items
pub use crate::core::{Error, Observation, ObservationSink, Result, StationDetails};
pub use crate::protocol::{SessionConfig, StationSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Station protocol implementation
//!
//! This module defines the station wire formats, the CRC-validated frame and
//! archive decoders, and the session state machine that drives the
//! wake/identify/poll/archive exchange.

pub mod archive;
pub mod frame;
pub mod session;

pub use self::archive::{ArchivePage, ArchiveRecord};
pub use self::frame::LiveFrames;
pub use self::session::{SessionConfig, SessionState, StationSession};

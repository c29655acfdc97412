//! Core types and traits for the station protocol engine
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod sink;
pub mod types;

pub use self::error::{Error, Result};
pub use self::sink::{ObservationSink, StationDetails};
pub use self::types::Observation;

/// Single-byte command acknowledgement sent by the station
pub const ACK: u8 = 0x06;

/// Size of one live sub-frame, trailing CRC included
pub const LIVE_FRAME_SIZE: usize = 99;

/// Size of one archive record
pub const ARCHIVE_RECORD_SIZE: usize = 52;

/// Records per archive page
pub const RECORDS_PER_PAGE: usize = 5;

/// Size of one archive page: sequence byte, five records, four unused
/// bytes, 2-byte CRC
pub const ARCHIVE_PAGE_SIZE: usize = 267;

/// Consecutive timeouts or transmission errors tolerated before a session
/// gives up
pub const MAX_RETRIES: u32 = 5;

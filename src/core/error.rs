use std::io;
use std::time::Duration;
use thiserror::Error;

/// Custom error types for the station protocol engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("end of stream")]
    Eof,

    #[error("checksum mismatch")]
    ChecksumInvalid,

    #[error("malformed frame: got {actual} bytes, need {expected}")]
    MalformedLength { expected: usize, actual: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unknown station at lat {latitude:.1} lon {longitude:.1} elevation {elevation}")]
    UnknownStation {
        latitude: f64,
        longitude: f64,
        elevation: i32,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sink error: {0}")]
    Sink(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Error::Sink(msg.into())
    }

    /// Whether a session may retry the failed step, bounded by the retry
    /// budget. Timeouts, bad checksums and protocol violations are
    /// transient; everything else tears the session down.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ChecksumInvalid
                | Error::MalformedLength { .. }
                | Error::Protocol(_)
        )
    }

    /// Whether the error ends the session unconditionally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Eof | Error::Transport(_) | Error::UnknownStation { .. }
        )
    }
}

//! Error taxonomy and process exit codes.
//!
//! Fatal errors terminate the whole process with one of a fixed set of
//! exit codes; recoverable conditions on the real-time path never reach
//! this type (they are skips, drops, or deferred warnings).

use thiserror::Error;

/// Successful termination.
pub const EX_OK: i32 = 0;
/// Command-line usage error.
pub const EX_USAGE: i32 = 64;
/// The MIDI backend is missing or was lost.
pub const EX_UNAVAILABLE: i32 = 69;
/// Operating system error (I/O on pipes, config files).
pub const EX_OSERR: i32 = 71;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or undecodable MIDI document.
    #[error("failed to load MIDI data: {0}")]
    Load(String),

    /// A bar-range operation referenced a bar with no marker.
    #[error("no marker found for bar {0}")]
    BarNotFound(u32),

    /// The remote-control command stream is corrupted.
    #[error("remote control protocol error: {0}")]
    Protocol(String),

    /// MIDI output port registration or connection failed.
    #[error("MIDI output unavailable: {0}")]
    Midi(String),

    /// Bad configuration file or option value.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Exit code reported when this error terminates the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Midi(_) => EX_UNAVAILABLE,
            Error::Io(_) => EX_OSERR,
            Error::Config(_) => EX_USAGE,
            Error::Load(_) | Error::BarNotFound(_) | Error::Protocol(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

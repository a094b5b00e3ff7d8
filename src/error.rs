//! Error types shared by the protocol engine, the flash program engines and the boot loader.

use std::io;

use thiserror::Error;

/// Failures on the serial link
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no data received before the link timed out")]
    Timeout,
    #[error("expected token {expected:?}, received {received:?}")]
    UnexpectedToken {
        expected: &'static str,
        received: String,
    },
    #[error("malformed hex field {0:?}")]
    MalformedHex(String),
    #[error("token {0:?} is not 7 characters long")]
    BadTokenLength(String),
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Rejections produced by the header validator
#[derive(Error, Debug, Eq, PartialEq)]
pub enum ValidationError {
    #[error("byte count {byte_count:#x} outside 1..={max:#x}")]
    BadSize { byte_count: u32, max: u32 },
    #[error("start address {start:#010x} outside {min:#010x}..={max:#010x}")]
    BadAddress { start: u32, min: u32, max: u32 },
    #[error("invalid magic number {0:#010x}")]
    BadMagic(u32),
}

/// Failures reported by (or detected on) a storage device
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device is write-protected")]
    WriteProtected,
    #[error("erase failed at {0:#x}")]
    EraseFailed(u32),
    #[error("write failed at {0:#x}")]
    WriteFailed(u32),
    #[error("verify mismatch at {0:#x}")]
    VerifyMismatch(u32),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("no usable blocks in range {start}..={end}")]
    PlacementExhausted { start: u32, end: u32 },
    #[error("no valid boot image found")]
    StorageNotFound,
    #[error("receive arena exhausted: {requested} bytes requested, {available} available")]
    ArenaExhausted { requested: usize, available: usize },
    #[error("unsupported command {0:#010x}")]
    UnsupportedCommand(u32),
}

impl Error {
    /// Does this error end the session rather than restarting the handshake?
    ///
    /// Only a hard I/O failure of the link itself is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Io(_)))
    }

    /// Numeric code for logging, in the manner of an exit status
    pub fn error_code(&self) -> u32 {
        match self {
            Error::Transport(_) => 1,
            Error::Validation(_) => 2,
            Error::Device(_) => 3,
            Error::PlacementExhausted { .. } => 4,
            Error::StorageNotFound => 5,
            Error::ArenaExhausted { .. } => 6,
            Error::UnsupportedCommand(_) => 7,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Device(DeviceError::Backend(value))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[test]
fn test_only_io_is_fatal() {
    let io = Error::from(TransportError::Io(io::ErrorKind::BrokenPipe.into()));
    assert!(io.is_fatal());
    assert!(!Error::from(TransportError::Timeout).is_fatal());
    assert!(!Error::from(DeviceError::WriteProtected).is_fatal());
    assert!(!Error::StorageNotFound.is_fatal());
}

//! Error types for the stream consumer

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Name error: {0}")]
    Name(#[from] NameError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Name encoding / decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("Name has no components")]
    Empty,

    #[error("Unexpected component marker: expected {expected:#04x}, found {found:#04x}")]
    UnexpectedMarker { expected: u8, found: u8 },

    #[error("Invalid numeric component width: {0} bytes")]
    InvalidWidth(usize),

    #[error("Invalid name URI: {0}")]
    InvalidUri(String),
}

/// ADTS frame parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated frame header at offset {0}")]
    TruncatedHeader(usize),

    #[error("Frame length {length} at offset {offset} is shorter than the header")]
    LengthTooShort { offset: usize, length: usize },

    #[error("Frame length {length} at offset {offset} overruns payload of {available} bytes")]
    Overrun {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("Invalid NACK payload length: {0} bytes")]
    InvalidNack(usize),
}

/// Transport adapter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Event processing failed: {0}")]
    ProcessFailed(String),

    #[error("Transport is closed")]
    Closed,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

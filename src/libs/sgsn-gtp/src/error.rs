//! GTP boundary error types

use thiserror::Error;

/// GTP boundary error type
#[derive(Error, Debug)]
pub enum GtpError {
    /// Buffer too short for operation
    #[error("Buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// Invalid message type
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Invalid GTP version in header flags
    #[error("Invalid GTP version: {0}")]
    InvalidVersion(u8),

    /// Malformed information element
    #[error("Malformed IE: {0}")]
    MalformedIe(&'static str),

    /// Unknown session handle
    #[error("Unknown session handle: {0}")]
    UnknownHandle(u32),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// GTP boundary result type
pub type GtpResult<T> = Result<T, GtpError>;

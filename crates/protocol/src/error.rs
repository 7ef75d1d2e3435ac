//! Protocol error types

use thiserror::Error;

/// Errors raised while encoding, decoding or parsing CDC-ACM values
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Line coding record shorter than the 7 bytes CDC requires
    #[error("Line coding too short: expected {expected} bytes, got {actual}")]
    ShortLineCoding { expected: usize, actual: usize },

    /// Stop-bit code outside 0..=2
    #[error("Invalid stop bits code: {0}")]
    InvalidStopBitsCode(u8),

    /// Parity code outside 0..=4
    #[error("Invalid parity code: {0}")]
    InvalidParityCode(u8),

    /// Data bits value CDC does not define
    #[error("Invalid data bits: {0} (expected 5, 6, 7, 8 or 16)")]
    InvalidDataBits(u8),

    /// Baud rate of zero
    #[error("Invalid baud rate: {0}")]
    InvalidBaudRate(u32),

    /// Unparseable stop bits string
    #[error("Unknown stop bits '{0}', expected 1, 1.5 or 2")]
    UnknownStopBits(String),

    /// Unparseable parity string
    #[error("Unknown parity '{0}', expected one of N, O, E, M, S")]
    UnknownParity(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

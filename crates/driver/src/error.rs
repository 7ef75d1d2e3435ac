//! Driver error types

use protocol::{AcmRequest, ProtocolError};
use thiserror::Error;

/// Errors raised by the endpoint resolver, the transport and the bridge
#[derive(Debug, Error)]
pub enum AcmError {
    /// No enumerated device matched the selector
    #[error("Device not present: {selector}")]
    DeviceNotPresent { selector: String },

    /// The platform refused to open the device (permissions, unplugged, ...)
    #[error("Failed to open device: {0}")]
    ConnectionFailed(#[source] rusb::Error),

    /// The device exposes no interfaces at all
    #[error("No interfaces found on device")]
    EndpointsNotFound,

    #[error("Could not claim interface {interface}: {source}")]
    InterfaceClaimFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Could not establish all endpoints: {0}")]
    InsufficientEndpoints(String),

    #[error("Transport is not open")]
    NotOpen,

    /// No data arrived within the read timeout
    #[error("Read timeout")]
    ReadTimeout,

    #[error("Read failed: {0}")]
    ReadFailed(#[source] rusb::Error),

    /// A write chunk transferred nothing or failed; `written` counts the
    /// bytes of the chunks that completed before it
    #[error("Write failed after {written} bytes: {reason}")]
    WriteFailed { written: usize, reason: String },

    #[error("{} control transfer failed: {source}", .request.name())]
    ControlTransferFailed {
        request: AcmRequest,
        #[source]
        source: rusb::Error,
    },

    /// Worker settings that would leave the stream unable to read
    #[error("Invalid worker settings: {0}")]
    InvalidSettings(String),

    /// The I/O worker hit a fatal error; the stream is closed
    #[error("I/O worker stopped: {0}")]
    WorkerStopped(String),

    #[error("Invalid line coding: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcmError {
    /// Whether the error only means "no data this time"
    pub fn is_timeout(&self) -> bool {
        matches!(self, AcmError::ReadTimeout)
    }
}

pub type Result<T> = std::result::Result<T, AcmError>;

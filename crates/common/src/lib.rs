//! Common utilities for rust-acm-serial
//!
//! This crate provides what the driver and the terminal front-end share:
//! the platform USB boundary (traits and descriptor types), the bounded
//! channel pair between the event-loop bridge and the I/O worker thread,
//! error handling and logging setup. Test mocks live behind the
//! `test-utils` feature.

pub mod channel;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    BridgeChannels, InboundMessage, WorkerChannels, WorkerCommand, create_serial_channels,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    DeviceSelector, DeviceSummary, Direction, EndpointInfo, InterfaceInfo, StreamId,
    TransferType, UsbConnection, UsbPlatform,
};

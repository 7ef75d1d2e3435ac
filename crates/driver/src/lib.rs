//! Userspace CDC-ACM serial driver
//!
//! Layers, bottom up:
//! - [`endpoints`]: find and claim the notification and bulk endpoints
//! - [`transport`]: line configuration and synchronous bulk I/O
//! - [`worker`]: the I/O thread performing one bounded pass per request
//! - [`bridge`]: non-blocking facade for a single-threaded scheduler
//! - [`reactor`]: a tokio scheduler driving the bridge
//! - [`rusb_platform`]: the libusb implementation of the USB boundary
//!
//! # Example
//!
//! ```no_run
//! use driver::{PollDriver, Protocol, RusbPlatform, TransportSettings, WorkerSettings};
//! use common::DeviceSelector;
//! use protocol::{LineCoding, LineState};
//!
//! struct Printer;
//!
//! impl Protocol for Printer {
//!     fn data_received(&mut self, data: &[u8]) {
//!         print!("{}", String::from_utf8_lossy(data));
//!     }
//!     fn connection_lost(&mut self, reason: &str) {
//!         eprintln!("lost: {reason}");
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let platform = RusbPlatform::new()?;
//! let mut driver = PollDriver::new(WorkerSettings::default());
//! driver.bridge_mut().open(
//!     &platform,
//!     &DeviceSelector::First,
//!     TransportSettings::default(),
//!     &LineCoding::default(),
//!     LineState { rts: true, dtr: true },
//! )?;
//!
//! let (_tx, rx) = tokio::sync::mpsc::channel(16);
//! driver.run(&mut Printer, rx).await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod endpoints;
pub mod error;
pub mod reactor;
pub mod rusb_platform;
pub mod transport;
pub mod worker;

pub use bridge::{BridgeState, Protocol, ReadOutcome, Scheduler, SerialBridge, TickOutcome};
pub use endpoints::{EndpointRole, ResolvedEndpoints, resolve};
pub use error::{AcmError, Result};
pub use reactor::{DriverExit, NotifyScheduler, PollDriver};
pub use rusb_platform::{RusbConnection, RusbPlatform};
pub use transport::{CdcAcmTransport, DEFAULT_TIMEOUT, TransportSettings, WRITE_BUFFER_SIZE};
pub use worker::{IoWorker, Liveness, PassReport, WorkerSettings, spawn_io_worker};

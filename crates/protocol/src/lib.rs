//! CDC-ACM wire format
//!
//! This crate defines the class-specific control requests a host sends to a
//! USB CDC-ACM (Abstract Control Model) device, and the payloads they carry:
//! the 7-byte line coding record and the control line state bitfield.
//!
//! # Example
//!
//! ```
//! use protocol::{LineCoding, Parity, StopBits};
//!
//! let coding = LineCoding {
//!     baud_rate: 9600,
//!     stop_bits: StopBits::One,
//!     parity: Parity::None,
//!     data_bits: 8,
//! };
//!
//! let bytes = coding.encode();
//! assert_eq!(bytes, [0x80, 0x25, 0x00, 0x00, 0, 0, 8]);
//! assert_eq!(LineCoding::decode(&bytes).unwrap(), coding);
//! ```

pub mod error;
pub mod line;
pub mod requests;

pub use error::{ProtocolError, Result};
pub use line::{LINE_CODING_LEN, LineCoding, LineState, Parity, StopBits};
pub use requests::{
    AcmRequest, ControlRequest, REQUEST_TYPE_ACM_IN, REQUEST_TYPE_ACM_OUT, USB_DIR_IN,
    USB_RECIP_INTERFACE, USB_TYPE_CLASS,
};

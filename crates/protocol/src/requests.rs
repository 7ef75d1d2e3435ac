//! CDC-ACM class requests
//!
//! Every ACM management request is a class request addressed to the
//! communication interface (USB CDC 1.1 section 6.2).

use crate::line::{LineCoding, LineState};

/// bmRequestType bit 7: device-to-host
pub const USB_DIR_IN: u8 = 0x80;
/// bmRequestType bits 6..5 = 01: class request
pub const USB_TYPE_CLASS: u8 = 0x20;
/// bmRequestType bits 4..0 = 00001: interface recipient
pub const USB_RECIP_INTERFACE: u8 = 0x01;

/// Host-to-device ACM request type (0x21)
pub const REQUEST_TYPE_ACM_OUT: u8 = USB_TYPE_CLASS | USB_RECIP_INTERFACE;
/// Device-to-host ACM request type (0xA1)
pub const REQUEST_TYPE_ACM_IN: u8 = USB_DIR_IN | USB_TYPE_CLASS | USB_RECIP_INTERFACE;

/// bRequest codes used by this driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AcmRequest {
    SetLineCoding = 0x20,
    GetLineCoding = 0x21,
    SetControlLineState = 0x22,
    SendBreak = 0x23,
}

impl AcmRequest {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            AcmRequest::SetLineCoding => "SET_LINE_CODING",
            AcmRequest::GetLineCoding => "GET_LINE_CODING",
            AcmRequest::SetControlLineState => "SET_CONTROL_LINE_STATE",
            AcmRequest::SendBreak => "SEND_BREAK",
        }
    }
}

/// A fully described control transfer
///
/// For OUT requests `data` is the payload; for IN requests its length is the
/// number of bytes to read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request: AcmRequest,
    pub request_type: u8,
    pub value: u16,
    /// Communication interface number
    pub index: u16,
    pub data: Vec<u8>,
}

impl ControlRequest {
    pub fn set_line_coding(interface: u8, coding: &LineCoding) -> Self {
        Self {
            request: AcmRequest::SetLineCoding,
            request_type: REQUEST_TYPE_ACM_OUT,
            value: 0,
            index: interface as u16,
            data: coding.encode().to_vec(),
        }
    }

    pub fn get_line_coding(interface: u8) -> Self {
        Self {
            request: AcmRequest::GetLineCoding,
            request_type: REQUEST_TYPE_ACM_IN,
            value: 0,
            index: interface as u16,
            data: vec![0u8; crate::line::LINE_CODING_LEN],
        }
    }

    pub fn set_control_line_state(interface: u8, state: LineState) -> Self {
        Self {
            request: AcmRequest::SetControlLineState,
            request_type: REQUEST_TYPE_ACM_OUT,
            value: state.value(),
            index: interface as u16,
            data: Vec::new(),
        }
    }

    /// Break for `duration_ms` milliseconds; 0xFFFF holds it until a
    /// subsequent request with duration 0.
    pub fn send_break(interface: u8, duration_ms: u16) -> Self {
        Self {
            request: AcmRequest::SendBreak,
            request_type: REQUEST_TYPE_ACM_OUT,
            value: duration_ms,
            index: interface as u16,
            data: Vec::new(),
        }
    }

    pub fn is_in(&self) -> bool {
        self.request_type & USB_DIR_IN != 0
    }
}

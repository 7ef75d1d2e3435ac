//! Line coding and control line state
//!
//! CDC 1.1 section 6.2.13 defines the line coding record sent with
//! SET_LINE_CODING and returned by GET_LINE_CODING:
//!
//! | Offset | Size | Field        |
//! |--------|------|--------------|
//! | 0      | 4    | dwDTERate    |
//! | 4      | 1    | bCharFormat  |
//! | 5      | 1    | bParityType  |
//! | 6      | 1    | bDataBits    |
//!
//! All multi-byte fields are little-endian.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of the encoded line coding record
pub const LINE_CODING_LEN: usize = 7;

/// Number of stop bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl StopBits {
    /// bCharFormat code
    pub fn code(self) -> u8 {
        match self {
            StopBits::One => 0,
            StopBits::OnePointFive => 1,
            StopBits::Two => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(StopBits::One),
            1 => Ok(StopBits::OnePointFive),
            2 => Ok(StopBits::Two),
            other => Err(ProtocolError::InvalidStopBitsCode(other)),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        f.write_str(s)
    }
}

impl FromStr for StopBits {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            other => Err(ProtocolError::UnknownStopBits(other.to_string())),
        }
    }
}

/// Parity scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "O")]
    Odd,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "M")]
    Mark,
    #[serde(rename = "S")]
    Space,
}

impl Parity {
    /// bParityType code
    pub fn code(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Parity::None),
            1 => Ok(Parity::Odd),
            2 => Ok(Parity::Even),
            3 => Ok(Parity::Mark),
            4 => Ok(Parity::Space),
            other => Err(ProtocolError::InvalidParityCode(other)),
        }
    }

    /// Single-letter form used in configuration files (N, O, E, M, S)
    pub fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Parity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Parity::None),
            "O" | "ODD" => Ok(Parity::Odd),
            "E" | "EVEN" => Ok(Parity::Even),
            "M" | "MARK" => Ok(Parity::Mark),
            "S" | "SPACE" => Ok(Parity::Space),
            _ => Err(ProtocolError::UnknownParity(s.to_string())),
        }
    }
}

/// Serial framing pushed to the device with SET_LINE_CODING
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCoding {
    /// Data terminal rate in bits per second
    pub baud_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Data bits per character (5, 6, 7, 8 or 16)
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            stop_bits: StopBits::One,
            parity: Parity::None,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    /// Encode into the 7-byte little-endian record
    pub fn encode(&self) -> [u8; LINE_CODING_LEN] {
        let mut buf = [0u8; LINE_CODING_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.baud_rate);
        buf[4] = self.stop_bits.code();
        buf[5] = self.parity.code();
        buf[6] = self.data_bits;
        buf
    }

    /// Decode a record returned by GET_LINE_CODING
    ///
    /// Trailing bytes beyond the first seven are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LINE_CODING_LEN {
            return Err(ProtocolError::ShortLineCoding {
                expected: LINE_CODING_LEN,
                actual: buf.len(),
            });
        }

        Ok(Self {
            baud_rate: LittleEndian::read_u32(&buf[0..4]),
            stop_bits: StopBits::from_code(buf[4])?,
            parity: Parity::from_code(buf[5])?,
            data_bits: buf[6],
        })
    }

    /// Check that the values are ones a CDC-ACM device can accept
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::InvalidBaudRate(self.baud_rate));
        }
        if !matches!(self.data_bits, 5..=8 | 16) {
            return Err(ProtocolError::InvalidDataBits(self.data_bits));
        }
        Ok(())
    }
}

impl fmt::Display for LineCoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// RTS/DTR signal levels sent with SET_CONTROL_LINE_STATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineState {
    pub rts: bool,
    pub dtr: bool,
}

impl LineState {
    pub const DTR: u16 = 0x01;
    pub const RTS: u16 = 0x02;

    /// wValue bitfield: bit0 = DTR, bit1 = RTS
    pub fn value(&self) -> u16 {
        let mut value = 0;
        if self.dtr {
            value |= Self::DTR;
        }
        if self.rts {
            value |= Self::RTS;
        }
        value
    }

    pub fn from_value(value: u16) -> Self {
        Self {
            rts: value & Self::RTS != 0,
            dtr: value & Self::DTR != 0,
        }
    }
}

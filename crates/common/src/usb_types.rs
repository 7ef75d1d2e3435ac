//! USB type abstractions and the platform boundary
//!
//! The host's device enumeration, permission and transfer APIs are reached
//! only through [`UsbPlatform`] and [`UsbConnection`]. The driver crate ships
//! an implementation on top of rusb; tests use the mocks in `test_utils`
//! (feature `test-utils`).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use rusb::{Direction, TransferType};

/// Integer handle identifying an open stream, for the caller's bookkeeping
///
/// The rusb platform derives it from the bus number and device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn from_location(bus: u8, address: u8) -> Self {
        Self(((bus as u32) << 8) | address as u32)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}.{:03}", self.0 >> 8, self.0 & 0xff)
    }
}

/// Endpoint descriptor fields the endpoint resolver needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// bEndpointAddress, including the direction bit
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// One interface of the active configuration (first alternate setting)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// Enumerated device, as listed before opening
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Product string, if the device could be opened to read it
    pub product: Option<String>,
    /// Advertises the CDC class at device or interface level
    ///
    /// Vendor-class adapters that still speak CDC-ACM requests report false
    /// and are only opened through an explicit selector.
    pub cdc_capable: bool,
}

impl DeviceSummary {
    pub fn stream_id(&self) -> StreamId {
        StreamId::from_location(self.bus_number, self.address)
    }
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus_number, self.address, self.vendor_id, self.product_id
        )?;
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        Ok(())
    }
}

/// Which device `open` should pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// First enumerated CDC-capable device
    #[default]
    First,
    /// Vendor ID with an optional product ID (`None` matches any)
    VidPid { vendor_id: u16, product_id: Option<u16> },
    /// Bus number and device address
    Location { bus_number: u8, address: u8 },
}

impl DeviceSelector {
    pub fn matches(&self, device: &DeviceSummary) -> bool {
        match *self {
            DeviceSelector::First => device.cdc_capable,
            DeviceSelector::VidPid {
                vendor_id,
                product_id,
            } => {
                device.vendor_id == vendor_id
                    && product_id.is_none_or(|pid| device.product_id == pid)
            }
            DeviceSelector::Location {
                bus_number,
                address,
            } => device.bus_number == bus_number && device.address == address,
        }
    }

    fn parse_hex_id(id: &str, name: &str) -> crate::Result<u16> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name, id
                ))
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(crate::Error::Config(format!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name, id
            )));
        }

        u16::from_str_radix(hex_part, 16).map_err(|_| {
            crate::Error::Config(format!("Invalid {} '{}', not a valid hex number", name, id))
        })
    }
}

impl FromStr for DeviceSelector {
    type Err = crate::Error;

    /// Accepts `first`, `0xVID:0xPID`, `0xVID:*` or `BUS.ADDR`
    fn from_str(s: &str) -> crate::Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("first") {
            return Ok(DeviceSelector::First);
        }

        if let Some((vid, pid)) = s.split_once(':') {
            let vendor_id = Self::parse_hex_id(vid, "VID")?;
            let product_id = if pid == "*" {
                None
            } else {
                Some(Self::parse_hex_id(pid, "PID")?)
            };
            return Ok(DeviceSelector::VidPid {
                vendor_id,
                product_id,
            });
        }

        if let Some((bus, addr)) = s.split_once('.') {
            let bus_number = bus
                .parse()
                .map_err(|_| crate::Error::Config(format!("Invalid bus number '{}'", bus)))?;
            let address = addr
                .parse()
                .map_err(|_| crate::Error::Config(format!("Invalid device address '{}'", addr)))?;
            return Ok(DeviceSelector::Location {
                bus_number,
                address,
            });
        }

        Err(crate::Error::Config(format!(
            "Invalid device selector '{}', expected 'first', VID:PID (e.g., '0x1234:0x5678' or '0x1234:*') or BUS.ADDR",
            s
        )))
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::First => f.write_str("first"),
            DeviceSelector::VidPid {
                vendor_id,
                product_id: Some(pid),
            } => write!(f, "0x{:04x}:0x{:04x}", vendor_id, pid),
            DeviceSelector::VidPid {
                vendor_id,
                product_id: None,
            } => write!(f, "0x{:04x}:*", vendor_id),
            DeviceSelector::Location {
                bus_number,
                address,
            } => write!(f, "{}.{}", bus_number, address),
        }
    }
}

/// An opened device, as handed out by the platform
///
/// Transfer methods return the byte count reported by the host stack.
/// Failure to claim or transfer is always an `Err`, distinct from a
/// successful zero-length result.
pub trait UsbConnection: Send {
    /// Interfaces of the active configuration, in descriptor order
    fn interfaces(&self) -> &[InterfaceInfo];

    fn claim_interface(&mut self, number: u8) -> Result<(), rusb::Error>;

    fn release_interface(&mut self, number: u8) -> Result<(), rusb::Error>;

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;
}

/// Device enumeration and open
pub trait UsbPlatform {
    type Connection: UsbConnection + 'static;

    /// List attached devices in enumeration order, CDC-capable or not
    fn devices(&self) -> Result<Vec<DeviceSummary>, rusb::Error>;

    /// Open a listed device; permission problems surface as `rusb::Error::Access`
    fn open(&self, device: &DeviceSummary) -> Result<Self::Connection, rusb::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(bus_number: u8, address: u8, vendor_id: u16, product_id: u16) -> DeviceSummary {
        DeviceSummary {
            bus_number,
            address,
            vendor_id,
            product_id,
            product: None,
            cdc_capable: true,
        }
    }

    #[test]
    fn test_parse_selector() {
        assert_eq!("first".parse::<DeviceSelector>().unwrap(), DeviceSelector::First);
        assert_eq!("".parse::<DeviceSelector>().unwrap(), DeviceSelector::First);
        assert_eq!(
            "0x2341:0x0043".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::VidPid {
                vendor_id: 0x2341,
                product_id: Some(0x0043)
            }
        );
        assert_eq!(
            "0x2341:*".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::VidPid {
                vendor_id: 0x2341,
                product_id: None
            }
        );
        assert_eq!(
            "1.4".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::Location {
                bus_number: 1,
                address: 4
            }
        );
    }

    #[test]
    fn test_parse_selector_invalid() {
        assert!("2341:0043".parse::<DeviceSelector>().is_err());
        assert!("0xGHIJ:*".parse::<DeviceSelector>().is_err());
        assert!("0x12345:*".parse::<DeviceSelector>().is_err());
        assert!("1.400".parse::<DeviceSelector>().is_err());
        assert!("ttyACM0".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn test_selector_display_roundtrip() {
        for text in ["first", "0x2341:0x0043", "0x2341:*", "3.17"] {
            let selector: DeviceSelector = text.parse().unwrap();
            assert_eq!(selector.to_string(), text);
        }
    }

    #[test]
    fn test_selector_matches() {
        let uno = summary(1, 4, 0x2341, 0x0043);
        let other = summary(2, 7, 0x0483, 0x5740);

        assert!(DeviceSelector::First.matches(&uno));

        let by_vid = DeviceSelector::VidPid {
            vendor_id: 0x2341,
            product_id: None,
        };
        assert!(by_vid.matches(&uno));
        assert!(!by_vid.matches(&other));

        let by_location = DeviceSelector::Location {
            bus_number: 2,
            address: 7,
        };
        assert!(by_location.matches(&other));
        assert!(!by_location.matches(&uno));
    }

    #[test]
    fn test_vendor_class_device_needs_explicit_selector() {
        let adapter = DeviceSummary {
            cdc_capable: false,
            ..summary(1, 9, 0x067b, 0x2303)
        };

        assert!(!DeviceSelector::First.matches(&adapter));
        assert!("0x067b:0x2303".parse::<DeviceSelector>().unwrap().matches(&adapter));
        assert!("0x067b:*".parse::<DeviceSelector>().unwrap().matches(&adapter));
        assert!("1.9".parse::<DeviceSelector>().unwrap().matches(&adapter));
    }

    #[test]
    fn test_stream_id_from_location() {
        let id = StreamId::from_location(1, 4);
        assert_eq!(id, StreamId(0x0104));
        assert_eq!(id.to_string(), "001.004");
    }
}

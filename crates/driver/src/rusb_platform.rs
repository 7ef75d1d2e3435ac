//! libusb-backed platform
//!
//! Enumerates attached devices, flagging the ones that advertise CDC, and
//! opens them through rusb. Kernel
//! drivers (cdc_acm on Linux) are detached when an interface is claimed and
//! reattached when it is released.

use common::{DeviceSummary, EndpointInfo, InterfaceInfo, UsbConnection, UsbPlatform};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Communications device class
const CLASS_CDC: u8 = 0x02;
/// CDC data interface class
const CLASS_CDC_DATA: u8 = 0x0a;
const CLASS_HUB: u8 = 0x09;
/// Linux Foundation, vendor of the virtual root hubs
const ROOT_HUB_VENDOR: u16 = 0x1d6b;

/// Root hubs are VID 0x1d6b with device class 9
fn is_root_hub(vendor_id: u16, class_code: u8) -> bool {
    vendor_id == ROOT_HUB_VENDOR && class_code == CLASS_HUB
}

/// Whether a device advertises CDC at device or interface level
fn is_cdc_candidate(device_class: u8, interface_classes: &[u8]) -> bool {
    device_class == CLASS_CDC
        || interface_classes
            .iter()
            .any(|&c| c == CLASS_CDC || c == CLASS_CDC_DATA)
}

/// Platform backed by a libusb context
pub struct RusbPlatform {
    context: Context,
}

impl RusbPlatform {
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    fn interfaces(device: &Device<Context>) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        let config = device.active_config_descriptor()?;

        Ok(config
            .interfaces()
            .filter_map(|interface| {
                let descriptor = interface.descriptors().next()?;
                Some(InterfaceInfo {
                    number: interface.number(),
                    class_code: descriptor.class_code(),
                    endpoints: descriptor
                        .endpoint_descriptors()
                        .map(|ep| EndpointInfo {
                            address: ep.address(),
                            direction: ep.direction(),
                            transfer_type: ep.transfer_type(),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                })
            })
            .collect())
    }

    fn summarize(device: &Device<Context>) -> Option<DeviceSummary> {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                return None;
            }
        };

        if is_root_hub(descriptor.vendor_id(), descriptor.class_code()) {
            trace!(
                "Skipping root hub at {:03}.{:03}",
                device.bus_number(),
                device.address()
            );
            return None;
        }

        let classes: Vec<u8> = Self::interfaces(device)
            .map(|ifaces| ifaces.iter().map(|i| i.class_code).collect())
            .unwrap_or_default();
        let cdc_capable = is_cdc_candidate(descriptor.class_code(), &classes);

        // Reading strings needs an open handle, which may be denied
        let product = device.open().ok().and_then(|handle| {
            descriptor
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        });

        Some(DeviceSummary {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            product,
            cdc_capable,
        })
    }
}

impl UsbPlatform for RusbPlatform {
    type Connection = RusbConnection;

    fn devices(&self) -> Result<Vec<DeviceSummary>, rusb::Error> {
        let devices = self.context.devices()?;
        let found: Vec<DeviceSummary> = devices.iter().filter_map(|d| Self::summarize(&d)).collect();
        debug!(
            "Enumerated {} devices, {} CDC-capable",
            found.len(),
            found.iter().filter(|d| d.cdc_capable).count()
        );
        Ok(found)
    }

    fn open(&self, summary: &DeviceSummary) -> Result<RusbConnection, rusb::Error> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == summary.bus_number && d.address() == summary.address)
            .ok_or(rusb::Error::NoDevice)?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", summary, e);
            e
        })?;
        let interfaces = Self::interfaces(&device)?;
        debug!(
            "Opened device {} with {} interfaces",
            summary.stream_id(),
            interfaces.len()
        );

        Ok(RusbConnection {
            handle,
            interfaces,
            detached: Vec::new(),
        })
    }
}

/// Open libusb device handle
pub struct RusbConnection {
    handle: DeviceHandle<Context>,
    interfaces: Vec<InterfaceInfo>,
    /// Interfaces whose kernel driver we detached
    detached: Vec<u8>,
}

impl UsbConnection for RusbConnection {
    fn interfaces(&self) -> &[InterfaceInfo] {
        &self.interfaces
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        self.handle.claim_interface(interface)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        let result = self.handle.release_interface(interface);

        if let Some(pos) = self.detached.iter().position(|&i| i == interface) {
            self.detached.remove(pos);
            match self.handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => warn!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }

        result
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.write_bulk(endpoint, data, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_hub_detection() {
        assert!(is_root_hub(0x1d6b, 9));
        assert!(!is_root_hub(0x1d6b, 0));
        assert!(!is_root_hub(0x05e3, 9));
    }

    #[test]
    fn test_cdc_candidate() {
        assert!(is_cdc_candidate(CLASS_CDC, &[]));
        assert!(is_cdc_candidate(0xef, &[0x02, 0x0a]));
        assert!(is_cdc_candidate(0x00, &[0xff, 0x0a]));
        assert!(!is_cdc_candidate(0x00, &[0x03]));
        assert!(!is_cdc_candidate(0x00, &[]));
    }

    #[test]
    fn test_platform_enumeration() {
        // May fail without a USB subsystem (containers, CI)
        match RusbPlatform::new() {
            Ok(platform) => {
                if let Ok(devices) = platform.devices() {
                    for device in devices {
                        assert_ne!(device.vendor_id, ROOT_HUB_VENDOR);
                    }
                }
            }
            Err(e) => {
                eprintln!("libusb unavailable: {}", e);
            }
        }
    }
}

//! Test utilities for rust-acm-serial
//!
//! Provides a scripted mock of the platform USB boundary and helpers shared
//! by the tests of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockConnection, cdc_split_interfaces};
//! use common::UsbConnection;
//! use std::time::Duration;
//!
//! let mut conn = MockConnection::new(cdc_split_interfaces());
//! conn.push_read(b"hello");
//!
//! let mut buf = [0u8; 16];
//! let n = conn.read_bulk(0x81, &mut buf, Duration::from_millis(10)).unwrap();
//! assert_eq!(&buf[..n], b"hello");
//! ```

use crate::usb_types::{
    DeviceSummary, Direction, EndpointInfo, InterfaceInfo, TransferType, UsbConnection,
    UsbPlatform,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// CDC communication interface class
pub const CLASS_CDC: u8 = 0x02;
/// CDC data interface class
pub const CLASS_CDC_DATA: u8 = 0x0A;

/// Build an endpoint descriptor; direction follows bit 7 of the address
pub fn endpoint(address: u8, transfer_type: TransferType) -> EndpointInfo {
    let direction = if address & 0x80 != 0 {
        Direction::In
    } else {
        Direction::Out
    };
    EndpointInfo {
        address,
        direction,
        transfer_type,
        max_packet_size: 64,
    }
}

/// Conventional CDC-ACM layout: interface 0 carries the interrupt
/// notification endpoint, interface 1 the bulk OUT (index 0) and bulk IN
/// (index 1) endpoints.
pub fn cdc_split_interfaces() -> Vec<InterfaceInfo> {
    vec![
        InterfaceInfo {
            number: 0,
            class_code: CLASS_CDC,
            endpoints: vec![endpoint(0x83, TransferType::Interrupt)],
        },
        InterfaceInfo {
            number: 1,
            class_code: CLASS_CDC_DATA,
            endpoints: vec![
                endpoint(0x02, TransferType::Bulk),
                endpoint(0x81, TransferType::Bulk),
            ],
        },
    ]
}

/// Single combined control+data interface, endpoints in arbitrary order
pub fn cdc_single_interface() -> Vec<InterfaceInfo> {
    vec![InterfaceInfo {
        number: 0,
        class_code: CLASS_CDC,
        endpoints: vec![
            endpoint(0x01, TransferType::Bulk),
            endpoint(0x82, TransferType::Interrupt),
            endpoint(0x81, TransferType::Bulk),
        ],
    }]
}

/// Create a mock device summary
pub fn create_mock_summary(
    bus_number: u8,
    address: u8,
    vendor_id: u16,
    product_id: u16,
) -> DeviceSummary {
    DeviceSummary {
        bus_number,
        address,
        vendor_id,
        product_id,
        product: Some(format!("Test Serial {}", address)),
        cdc_capable: true,
    }
}

/// Create a summary for a vendor-class (0xFF) adapter
pub fn create_vendor_summary(
    bus_number: u8,
    address: u8,
    vendor_id: u16,
    product_id: u16,
) -> DeviceSummary {
    DeviceSummary {
        cdc_capable: false,
        ..create_mock_summary(bus_number, address, vendor_id, product_id)
    }
}

/// Create mock bulk data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// A recorded control transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

/// Scripted result of one bulk IN transfer
#[derive(Debug, Clone)]
pub enum MockRead {
    Data(Vec<u8>),
    Error(rusb::Error),
}

/// Observable state behind a [`MockConnection`]
#[derive(Debug, Default)]
pub struct MockState {
    pub claimed: Vec<u8>,
    pub released: Vec<u8>,
    pub claim_failures: Vec<u8>,
    pub controls: Vec<ControlRecord>,
    pub control_error: Option<rusb::Error>,
    /// Bytes returned by IN control transfers
    pub control_in_response: Vec<u8>,
    /// Scripted bulk reads; an empty script reads as a timeout
    pub reads: VecDeque<MockRead>,
    pub read_timeouts: Vec<Duration>,
    /// (endpoint, chunk) for every bulk OUT transfer attempted
    pub writes: Vec<(u8, Vec<u8>)>,
    pub write_timeouts: Vec<Duration>,
    /// Scripted bulk write results; an empty script accepts the whole chunk
    pub write_results: VecDeque<Result<usize, rusb::Error>>,
}

/// Mock device connection
///
/// Clones share state, so a test can keep one clone for inspection while the
/// transport owns another.
#[derive(Debug, Clone)]
pub struct MockConnection {
    interfaces: Vec<InterfaceInfo>,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new(interfaces: Vec<InterfaceInfo>) -> Self {
        Self {
            interfaces,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Lock the shared state (poisoning is ignored)
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_read(&self, data: &[u8]) {
        self.state().reads.push_back(MockRead::Data(data.to_vec()));
    }

    pub fn push_read_error(&self, error: rusb::Error) {
        self.state().reads.push_back(MockRead::Error(error));
    }

    pub fn push_write_result(&self, result: Result<usize, rusb::Error>) {
        self.state().write_results.push_back(result);
    }

    pub fn fail_claim(&self, interface: u8) {
        self.state().claim_failures.push(interface);
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.state().claimed.clone()
    }

    pub fn controls(&self) -> Vec<ControlRecord> {
        self.state().controls.clone()
    }

    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state().writes.clone()
    }

    pub fn pending_reads(&self) -> usize {
        self.state().reads.len()
    }
}

impl UsbConnection for MockConnection {
    fn interfaces(&self) -> &[InterfaceInfo] {
        &self.interfaces
    }

    fn claim_interface(&mut self, number: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        if state.claim_failures.contains(&number) {
            return Err(rusb::Error::Busy);
        }
        state.claimed.push(number);
        Ok(())
    }

    fn release_interface(&mut self, number: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        let Some(pos) = state.claimed.iter().position(|&n| n == number) else {
            return Err(rusb::Error::NotFound);
        };
        state.claimed.remove(pos);
        state.released.push(number);
        Ok(())
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.state();
        state.controls.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        match state.control_error {
            Some(e) => Err(e),
            None => Ok(data.len()),
        }
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.state();
        state.controls.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: Vec::new(),
        });
        if let Some(e) = state.control_error {
            return Err(e);
        }
        let n = buf.len().min(state.control_in_response.len());
        buf[..n].copy_from_slice(&state.control_in_response[..n]);
        Ok(n)
    }

    fn read_bulk(
        &mut self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.state();
        state.read_timeouts.push(timeout);
        match state.reads.pop_front() {
            None => Err(rusb::Error::Timeout),
            Some(MockRead::Error(e)) => Err(e),
            Some(MockRead::Data(data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    state.reads.push_front(MockRead::Data(data[n..].to_vec()));
                }
                Ok(n)
            }
        }
    }

    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.state();
        state.writes.push((endpoint, data.to_vec()));
        state.write_timeouts.push(timeout);
        state.write_results.pop_front().unwrap_or(Ok(data.len()))
    }
}

/// Mock platform serving a fixed device list
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    devices: Vec<(DeviceSummary, MockConnection)>,
    /// Error returned by every `open`, e.g. `rusb::Error::Access`
    pub open_error: Option<rusb::Error>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, summary: DeviceSummary, connection: MockConnection) -> Self {
        self.devices.push((summary, connection));
        self
    }
}

impl UsbPlatform for MockPlatform {
    type Connection = MockConnection;

    fn devices(&self) -> Result<Vec<DeviceSummary>, rusb::Error> {
        Ok(self.devices.iter().map(|(s, _)| s.clone()).collect())
    }

    fn open(&self, device: &DeviceSummary) -> Result<MockConnection, rusb::Error> {
        if let Some(e) = self.open_error {
            return Err(e);
        }
        self.devices
            .iter()
            .find(|(s, _)| s == device)
            .map(|(_, conn)| conn.clone())
            .ok_or(rusb::Error::NoDevice)
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

//! CDC-ACM transport
//!
//! Owns the open USB connection and its resolved endpoints. Every transfer is
//! synchronous with a timeout: the host stack offers no readiness
//! notification for these endpoints, so callers that must not block run the
//! transport on the I/O worker thread.

use crate::endpoints::{self, ResolvedEndpoints};
use crate::error::{AcmError, Result};
use common::{DeviceSelector, DeviceSummary, StreamId, UsbConnection, UsbPlatform};
use protocol::{ControlRequest, LineCoding, LineState};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Timeout used when none is configured (1 second)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Largest payload handed to a single bulk OUT transfer (16 KiB)
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Transfer timeouts; `None` falls back to [`DEFAULT_TIMEOUT`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportSettings {
    pub read_timeout: Option<Duration>,
    /// Also used for control transfers
    pub write_timeout: Option<Duration>,
}

impl TransportSettings {
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

struct OpenDevice<C> {
    conn: C,
    endpoints: ResolvedEndpoints,
    summary: DeviceSummary,
}

/// Serial port over one CDC-ACM device
pub struct CdcAcmTransport<C: UsbConnection> {
    settings: TransportSettings,
    device: Option<OpenDevice<C>>,
    line_coding: Option<LineCoding>,
    line_state: LineState,
}

impl<C: UsbConnection> CdcAcmTransport<C> {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            device: None,
            line_coding: None,
            line_state: LineState::default(),
        }
    }

    /// Open the first enumerated device matching `selector`
    ///
    /// An already open connection is closed first.
    pub fn open<P>(&mut self, platform: &P, selector: &DeviceSelector) -> Result<StreamId>
    where
        P: UsbPlatform<Connection = C>,
    {
        if self.device.is_some() {
            debug!("Closing previous connection before re-opening");
            self.close();
        }

        let devices = platform.devices().map_err(AcmError::ConnectionFailed)?;
        debug!("Enumerated {} USB devices", devices.len());

        let summary = devices
            .into_iter()
            .find(|d| selector.matches(d))
            .ok_or_else(|| AcmError::DeviceNotPresent {
                selector: selector.to_string(),
            })?;
        info!("Found device {}", summary);

        let mut conn = platform.open(&summary).map_err(|e| {
            warn!("Failed to open device {}: {}", summary, e);
            AcmError::ConnectionFailed(e)
        })?;

        let endpoints = endpoints::resolve(&mut conn)?;
        debug!(
            "Endpoints: control={:#04x} read={:#04x} write={:#04x}",
            endpoints.control.address, endpoints.read.address, endpoints.write.address
        );

        let stream = summary.stream_id();
        info!("USB connection made to {} (stream {})", summary, stream);

        self.device = Some(OpenDevice {
            conn,
            endpoints,
            summary,
        });
        self.line_coding = None;
        self.line_state = LineState::default();

        Ok(stream)
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.device.as_ref().map(|d| d.summary.stream_id())
    }

    pub fn device(&self) -> Option<&DeviceSummary> {
        self.device.as_ref().map(|d| &d.summary)
    }

    pub fn endpoints(&self) -> Option<&ResolvedEndpoints> {
        self.device.as_ref().map(|d| &d.endpoints)
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Line coding last pushed with [`configure`](Self::configure)
    pub fn current_line_coding(&self) -> Option<LineCoding> {
        self.line_coding
    }

    pub fn line_state(&self) -> LineState {
        self.line_state
    }

    /// Push line coding (SET_LINE_CODING) then line state (SET_CONTROL_LINE_STATE)
    pub fn configure(&mut self, coding: &LineCoding, state: LineState) -> Result<()> {
        coding.validate()?;

        let interface = self.control_interface()?;
        self.send_control(&ControlRequest::set_line_coding(interface, coding))?;
        self.line_coding = Some(*coding);
        debug!("Line coding set to {}", coding);

        self.push_line_state(state)
    }

    /// Push RTS/DTR if they differ from the current state
    pub fn set_line_state(&mut self, state: LineState) -> Result<()> {
        if state == self.line_state {
            return Ok(());
        }
        self.push_line_state(state)
    }

    pub fn set_dtr(&mut self, dtr: bool) -> Result<()> {
        self.set_line_state(LineState {
            dtr,
            ..self.line_state
        })
    }

    pub fn set_rts(&mut self, rts: bool) -> Result<()> {
        self.set_line_state(LineState {
            rts,
            ..self.line_state
        })
    }

    /// Read back the device's line coding (GET_LINE_CODING)
    pub fn line_coding(&mut self) -> Result<LineCoding> {
        let interface = self.control_interface()?;
        let request = ControlRequest::get_line_coding(interface);
        let timeout = self.settings.write_timeout();
        let device = self.device.as_mut().ok_or(AcmError::NotOpen)?;

        let mut buf = request.data.clone();
        let len = device
            .conn
            .read_control(
                request.request_type,
                request.request.code(),
                request.value,
                request.index,
                &mut buf,
                timeout,
            )
            .map_err(|source| AcmError::ControlTransferFailed {
                request: request.request,
                source,
            })?;

        Ok(LineCoding::decode(&buf[..len])?)
    }

    /// Transmit a break for `duration_ms` milliseconds (SEND_BREAK)
    pub fn send_break(&mut self, duration_ms: u16) -> Result<()> {
        let interface = self.control_interface()?;
        self.send_control(&ControlRequest::send_break(interface, duration_ms))?;
        Ok(())
    }

    /// Read up to `n` bytes using the configured read timeout
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let timeout = self.settings.read_timeout();
        self.read_with_timeout(n, timeout)
    }

    /// Read up to `n` bytes
    ///
    /// A timeout is reported as [`AcmError::ReadTimeout`]; a zero-length
    /// transfer yields an empty vector.
    pub fn read_with_timeout(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let device = self.device.as_mut().ok_or(AcmError::NotOpen)?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; n];
        trace!("Read start n={}, timeout={}ms", n, timeout.as_millis());

        match device
            .conn
            .read_bulk(device.endpoints.read.address, &mut buf, timeout)
        {
            Ok(len) => {
                trace!("Read done num_read={}", len);
                buf.truncate(len);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Err(AcmError::ReadTimeout),
            Err(e) => {
                warn!("Bulk read failed: {}", e);
                Err(AcmError::ReadFailed(e))
            }
        }
    }

    /// Write `data` in chunks of at most [`WRITE_BUFFER_SIZE`] bytes
    ///
    /// Returns the number of bytes the device accepted. The first chunk that
    /// transfers nothing or fails aborts the write.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let timeout = self.settings.write_timeout();
        let device = self.device.as_mut().ok_or(AcmError::NotOpen)?;
        let endpoint = device.endpoints.write.address;

        debug!("Write len={}, timeout={}ms", data.len(), timeout.as_millis());

        let mut written = 0;
        for chunk in data.chunks(WRITE_BUFFER_SIZE) {
            match device.conn.write_bulk(endpoint, chunk, timeout) {
                Ok(0) => {
                    return Err(AcmError::WriteFailed {
                        written,
                        reason: format!("device accepted 0 of {} bytes", chunk.len()),
                    });
                }
                Ok(n) => written += n,
                Err(e) => {
                    warn!("Bulk write failed after {} bytes: {}", written, e);
                    return Err(AcmError::WriteFailed {
                        written,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!("Wrote {}", written);
        Ok(written)
    }

    /// Release the device; closing twice is a no-op
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            endpoints::release_all(&mut device.conn, &device.endpoints.claimed);
            info!("Closed device {}", device.summary);
        }
    }

    fn control_interface(&self) -> Result<u8> {
        self.device
            .as_ref()
            .map(|d| d.endpoints.control_interface)
            .ok_or(AcmError::NotOpen)
    }

    fn push_line_state(&mut self, state: LineState) -> Result<()> {
        let interface = self.control_interface()?;
        self.send_control(&ControlRequest::set_control_line_state(interface, state))?;
        self.line_state = state;
        debug!("Line state set: rts={} dtr={}", state.rts, state.dtr);
        Ok(())
    }

    fn send_control(&mut self, request: &ControlRequest) -> Result<usize> {
        let timeout = self.settings.write_timeout();
        let device = self.device.as_mut().ok_or(AcmError::NotOpen)?;

        device
            .conn
            .write_control(
                request.request_type,
                request.request.code(),
                request.value,
                request.index,
                &request.data,
                timeout,
            )
            .map_err(|source| {
                warn!("{} failed: {}", request.request.name(), source);
                AcmError::ControlTransferFailed {
                    request: request.request,
                    source,
                }
            })
    }
}

impl<C: UsbConnection> Drop for CdcAcmTransport<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        MockConnection, MockPlatform, cdc_single_interface, cdc_split_interfaces,
        create_mock_bulk_data, create_mock_summary, create_vendor_summary,
    };
    use protocol::{Parity, REQUEST_TYPE_ACM_IN, REQUEST_TYPE_ACM_OUT, StopBits};

    fn open_split() -> (CdcAcmTransport<MockConnection>, MockConnection) {
        let conn = MockConnection::new(cdc_split_interfaces());
        let platform =
            MockPlatform::new().with_device(create_mock_summary(1, 4, 0x2341, 0x0043), conn.clone());

        let mut transport = CdcAcmTransport::new(TransportSettings::default());
        transport.open(&platform, &DeviceSelector::First).unwrap();
        (transport, conn)
    }

    #[test]
    fn test_open_returns_stream_id() {
        let (transport, conn) = open_split();
        assert_eq!(transport.stream_id(), Some(StreamId::from_location(1, 4)));
        assert_eq!(conn.claimed(), vec![0, 1]);
    }

    #[test]
    fn test_open_selects_matching_device() {
        let first = MockConnection::new(cdc_split_interfaces());
        let second = MockConnection::new(cdc_single_interface());
        let platform = MockPlatform::new()
            .with_device(create_mock_summary(1, 2, 0x0483, 0x5740), first.clone())
            .with_device(create_mock_summary(1, 3, 0x2341, 0x0043), second.clone());

        let mut transport = CdcAcmTransport::new(TransportSettings::default());
        let selector = "0x2341:*".parse().unwrap();
        let stream = transport.open(&platform, &selector).unwrap();

        assert_eq!(stream, StreamId::from_location(1, 3));
        assert!(first.claimed().is_empty());
        assert_eq!(second.claimed(), vec![0]);
    }

    #[test]
    fn test_explicit_selector_opens_vendor_class_device() {
        let conn = MockConnection::new(cdc_single_interface());
        let platform = MockPlatform::new()
            .with_device(create_vendor_summary(2, 5, 0x067b, 0x2303), conn.clone());

        let mut transport = CdcAcmTransport::new(TransportSettings::default());
        let err = transport
            .open(&platform, &DeviceSelector::First)
            .unwrap_err();
        assert!(matches!(err, AcmError::DeviceNotPresent { .. }));

        for text in ["0x067b:0x2303", "2.5"] {
            let selector: DeviceSelector = text.parse().unwrap();
            let stream = transport.open(&platform, &selector).unwrap();
            assert_eq!(stream, StreamId::from_location(2, 5));
            assert_eq!(conn.claimed(), vec![0]);
            transport.close();
        }
        assert!(conn.claimed().is_empty());
    }

    #[test]
    fn test_first_skips_vendor_class_device() {
        let vendor = MockConnection::new(cdc_single_interface());
        let cdc = MockConnection::new(cdc_split_interfaces());
        let platform = MockPlatform::new()
            .with_device(create_vendor_summary(1, 2, 0x067b, 0x2303), vendor.clone())
            .with_device(create_mock_summary(1, 3, 0x2341, 0x0043), cdc.clone());

        let mut transport = CdcAcmTransport::new(TransportSettings::default());
        let stream = transport.open(&platform, &DeviceSelector::First).unwrap();

        assert_eq!(stream, StreamId::from_location(1, 3));
        assert!(vendor.claimed().is_empty());
    }

    #[test]
    fn test_open_device_not_present() {
        let platform = MockPlatform::new();
        let mut transport = CdcAcmTransport::<MockConnection>::new(TransportSettings::default());

        let err = transport
            .open(&platform, &DeviceSelector::First)
            .unwrap_err();
        assert!(matches!(err, AcmError::DeviceNotPresent { .. }));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_open_connection_failed() {
        let mut platform = MockPlatform::new().with_device(
            create_mock_summary(1, 4, 0x2341, 0x0043),
            MockConnection::new(cdc_split_interfaces()),
        );
        platform.open_error = Some(rusb::Error::Access);

        let mut transport = CdcAcmTransport::new(TransportSettings::default());
        let err = transport
            .open(&platform, &DeviceSelector::First)
            .unwrap_err();
        assert!(matches!(err, AcmError::ConnectionFailed(rusb::Error::Access)));
    }

    #[test]
    fn test_reopen_closes_previous_connection() {
        let (mut transport, conn) = open_split();
        let platform =
            MockPlatform::new().with_device(create_mock_summary(1, 4, 0x2341, 0x0043), conn.clone());

        transport.open(&platform, &DeviceSelector::First).unwrap();

        assert_eq!(conn.state().released, vec![0, 1]);
        assert_eq!(conn.claimed(), vec![0, 1]);
    }

    #[test]
    fn test_configure_sends_line_coding_then_line_state() {
        let (mut transport, conn) = open_split();

        let coding = LineCoding {
            baud_rate: 9600,
            stop_bits: StopBits::One,
            parity: Parity::None,
            data_bits: 8,
        };
        transport
            .configure(&coding, LineState { rts: true, dtr: true })
            .unwrap();

        let controls = conn.controls();
        assert_eq!(controls.len(), 2);

        assert_eq!(controls[0].request_type, REQUEST_TYPE_ACM_OUT);
        assert_eq!(controls[0].request, 0x20);
        assert_eq!(controls[0].data, vec![0x80, 0x25, 0x00, 0x00, 0, 0, 8]);

        assert_eq!(controls[1].request, 0x22);
        assert_eq!(controls[1].value, 3);
        assert!(controls[1].data.is_empty());

        assert_eq!(transport.current_line_coding(), Some(coding));
    }

    #[test]
    fn test_configure_rejects_invalid_coding() {
        let (mut transport, conn) = open_split();
        let coding = LineCoding {
            data_bits: 4,
            ..LineCoding::default()
        };

        assert!(matches!(
            transport.configure(&coding, LineState::default()),
            Err(AcmError::Protocol(_))
        ));
        assert!(conn.controls().is_empty());
    }

    #[test]
    fn test_configure_control_failure() {
        let (mut transport, conn) = open_split();
        conn.state().control_error = Some(rusb::Error::Pipe);

        let err = transport
            .configure(&LineCoding::default(), LineState::default())
            .unwrap_err();
        assert!(matches!(err, AcmError::ControlTransferFailed { .. }));
    }

    #[test]
    fn test_set_line_state_only_when_changed() {
        let (mut transport, conn) = open_split();

        transport.set_dtr(true).unwrap();
        transport.set_dtr(true).unwrap();
        transport.set_rts(true).unwrap();

        let values: Vec<u16> = conn.controls().iter().map(|c| c.value).collect();
        assert_eq!(values, vec![1, 3]);
        assert_eq!(transport.line_state(), LineState { rts: true, dtr: true });
    }

    #[test]
    fn test_get_line_coding() {
        let (mut transport, conn) = open_split();
        conn.state().control_in_response = vec![0x00, 0xC2, 0x01, 0x00, 0, 2, 7];

        let coding = transport.line_coding().unwrap();
        assert_eq!(coding.baud_rate, 115_200);
        assert_eq!(coding.parity, Parity::Even);
        assert_eq!(coding.data_bits, 7);

        let controls = conn.controls();
        assert_eq!(controls[0].request_type, REQUEST_TYPE_ACM_IN);
        assert_eq!(controls[0].request, 0x21);
    }

    #[test]
    fn test_send_break() {
        let (mut transport, conn) = open_split();
        transport.send_break(100).unwrap();

        let controls = conn.controls();
        assert_eq!(controls[0].request, 0x23);
        assert_eq!(controls[0].value, 100);
    }

    #[test]
    fn test_read_results() {
        let (mut transport, conn) = open_split();
        conn.push_read(b"hello");
        conn.push_read(b"");
        conn.push_read_error(rusb::Error::NoDevice);

        assert_eq!(transport.read(64).unwrap(), b"hello");
        assert_eq!(transport.read(64).unwrap(), b"");
        assert!(matches!(
            transport.read(64),
            Err(AcmError::ReadFailed(rusb::Error::NoDevice))
        ));
        assert!(matches!(transport.read(64), Err(AcmError::ReadTimeout)));
    }

    #[test]
    fn test_read_uses_default_timeout() {
        let (mut transport, conn) = open_split();
        let _ = transport.read(8);
        assert_eq!(conn.state().read_timeouts, vec![DEFAULT_TIMEOUT]);
    }

    #[test]
    fn test_write_uses_configured_timeout() {
        let conn = MockConnection::new(cdc_split_interfaces());
        let platform =
            MockPlatform::new().with_device(create_mock_summary(1, 4, 0x2341, 0x0043), conn.clone());
        let mut transport = CdcAcmTransport::new(TransportSettings {
            read_timeout: None,
            write_timeout: Some(Duration::from_millis(250)),
        });
        transport.open(&platform, &DeviceSelector::First).unwrap();

        transport.write(b"hi").unwrap();
        assert_eq!(
            conn.state().write_timeouts,
            vec![Duration::from_millis(250)]
        );
    }

    #[test]
    fn test_write_single_chunk() {
        let (mut transport, conn) = open_split();

        assert_eq!(transport.write(b"hello").unwrap(), 5);
        assert_eq!(conn.writes(), vec![(0x02, b"hello".to_vec())]);
    }

    #[test]
    fn test_write_chunks_large_payload() {
        let (mut transport, conn) = open_split();
        let data = create_mock_bulk_data(2 * WRITE_BUFFER_SIZE + 100);

        assert_eq!(transport.write(&data).unwrap(), data.len());

        let sizes: Vec<usize> = conn.writes().iter().map(|(_, c)| c.len()).collect();
        assert_eq!(sizes, vec![WRITE_BUFFER_SIZE, WRITE_BUFFER_SIZE, 100]);
    }

    #[test]
    fn test_write_aborts_on_failed_chunk() {
        let (mut transport, conn) = open_split();
        conn.push_write_result(Ok(WRITE_BUFFER_SIZE));
        conn.push_write_result(Ok(0));

        let data = create_mock_bulk_data(3 * WRITE_BUFFER_SIZE);
        let err = transport.write(&data).unwrap_err();

        assert!(matches!(
            err,
            AcmError::WriteFailed { written, .. } if written == WRITE_BUFFER_SIZE
        ));
        assert_eq!(conn.writes().len(), 2);
    }

    #[test]
    fn test_operations_require_open() {
        let mut transport = CdcAcmTransport::<MockConnection>::new(TransportSettings::default());

        assert!(matches!(transport.read(1), Err(AcmError::NotOpen)));
        assert!(matches!(transport.write(b"x"), Err(AcmError::NotOpen)));
        assert!(matches!(
            transport.configure(&LineCoding::default(), LineState::default()),
            Err(AcmError::NotOpen)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut transport, conn) = open_split();

        transport.close();
        transport.close();

        assert!(!transport.is_open());
        assert_eq!(conn.state().released, vec![0, 1]);
    }
}

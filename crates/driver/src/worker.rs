//! I/O worker
//!
//! Dedicated thread owning the transport. The event-loop bridge asks it for
//! one bounded I/O pass at a time; each pass drains the device, then writes at
//! most one queued payload.
//!
//! A pass never blocks longer than the sum of its transfer timeouts: reads use
//! the short poll timeout, the single write uses the transport's write timeout.

use crate::error::{AcmError, Result};
use crate::transport::CdcAcmTransport;
use bytes::Bytes;
use common::{InboundMessage, UsbConnection, WorkerChannels, WorkerCommand};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{Span, debug, error, info, trace, warn};

/// Interval between passes (100 ms)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Timeout of each read inside a pass (20 ms)
pub const DEFAULT_POLL_READ_TIMEOUT: Duration = Duration::from_millis(20);
/// Bytes requested per bulk read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;
/// Upper bound on bytes collected by one pass (64 KiB)
pub const DEFAULT_MAX_PASS_BYTES: usize = 64 * 1024;
/// Capacity of the inbound and outbound queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Slots a read phase needs: one data message plus one termination message
const READ_PHASE_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub poll_read_timeout: Duration,
    pub read_chunk_size: usize,
    pub max_pass_bytes: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_read_timeout: DEFAULT_POLL_READ_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_pass_bytes: DEFAULT_MAX_PASS_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl WorkerSettings {
    /// Reject settings under which a pass could never read
    ///
    /// The inbound queue must hold a data message and a termination message,
    /// and a read phase must be allowed to request at least one byte.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity < READ_PHASE_SLOTS {
            return Err(AcmError::InvalidSettings(format!(
                "queue_capacity {} is below {}",
                self.queue_capacity, READ_PHASE_SLOTS
            )));
        }
        if self.read_chunk_size == 0 {
            return Err(AcmError::InvalidSettings(
                "read_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.max_pass_bytes == 0 {
            return Err(AcmError::InvalidSettings(
                "max_pass_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One-shot running -> stopped flag
///
/// Stopped is terminal.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns true if this call performed the transition
    pub fn stop(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one pass, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassReport {
    pub bytes_read: usize,
    pub bytes_written: usize,
    /// The inbound queue had no room, so the device was not read
    pub read_skipped: bool,
    /// This pass stopped the worker
    pub stopped: bool,
}

pub struct IoWorker<C: UsbConnection> {
    transport: CdcAcmTransport<C>,
    channels: WorkerChannels,
    liveness: Liveness,
    settings: WorkerSettings,
}

impl<C: UsbConnection> IoWorker<C> {
    pub fn new(
        transport: CdcAcmTransport<C>,
        channels: WorkerChannels,
        liveness: Liveness,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            transport,
            channels,
            liveness,
            settings,
        }
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn transport_mut(&mut self) -> &mut CdcAcmTransport<C> {
        &mut self.transport
    }

    /// Run one I/O pass
    ///
    /// 1. Read until a timeout, accumulating bytes, and queue them as one
    ///    inbound message.
    /// 2. Pop at most one outbound payload and write it.
    ///
    /// A hard error in either phase stops the worker and queues a
    /// termination message. Once stopped, passes do nothing.
    pub fn pass(&mut self) -> PassReport {
        let mut report = PassReport::default();
        if !self.liveness.is_running() {
            return report;
        }

        if self.channels.inbound_room() >= READ_PHASE_SLOTS {
            let (data, failure) = self.drain_reads();
            report.bytes_read = data.len();

            if !data.is_empty() {
                self.push_inbound(InboundMessage::Data(Bytes::from(data)));
            }

            if let Some(error) = failure {
                self.stop(error);
                report.stopped = true;
                return report;
            }
        } else {
            debug!("Inbound queue full, leaving data on the device this pass");
            report.read_skipped = true;
        }

        if let Some(payload) = self.channels.try_recv_outbound() {
            match self.transport.write(&payload) {
                Ok(written) => report.bytes_written = written,
                Err(error) => {
                    self.stop(error);
                    report.stopped = true;
                }
            }
        }

        trace!(
            "Pass done: read={} written={}",
            report.bytes_read, report.bytes_written
        );
        report
    }

    /// Read until timeout, a zero-length transfer, the pass byte limit, or a
    /// hard error. Bytes read before a hard error are returned with it.
    fn drain_reads(&mut self) -> (Vec<u8>, Option<AcmError>) {
        let mut buf = Vec::new();

        while buf.len() < self.settings.max_pass_bytes {
            match self
                .transport
                .read_with_timeout(self.settings.read_chunk_size, self.settings.poll_read_timeout)
            {
                Ok(data) if data.is_empty() => break,
                Ok(data) => buf.extend_from_slice(&data),
                Err(AcmError::ReadTimeout) => break,
                Err(error) => return (buf, Some(error)),
            }
        }

        (buf, None)
    }

    fn stop(&mut self, error: AcmError) {
        if !self.liveness.stop() {
            return;
        }
        warn!("I/O worker stopping: {}", error);
        self.push_inbound(InboundMessage::Terminated {
            reason: error.to_string(),
        });
    }

    fn push_inbound(&self, msg: InboundMessage) {
        if let Err(e) = self.channels.try_send_inbound(msg) {
            // Only reachable for the termination message after a skipped read;
            // the bridge falls back to the liveness flag.
            debug!("Dropped inbound message: {}", e);
        }
    }

    /// Worker thread loop
    ///
    /// Runs passes on request until a Shutdown command arrives or the bridge
    /// end is dropped, then closes the transport.
    pub fn run<F>(mut self, on_pass_complete: F)
    where
        F: Fn(&PassReport),
    {
        info!("I/O worker thread started");

        loop {
            match self.channels.recv_command() {
                Ok(WorkerCommand::Pass) => {
                    let report = self.guarded_pass();
                    on_pass_complete(&report);
                }
                Ok(WorkerCommand::Shutdown) => {
                    info!("I/O worker shutting down");
                    break;
                }
                Err(e) => {
                    debug!("Command channel closed: {}", e);
                    break;
                }
            }
        }

        self.transport.close();
        info!("I/O worker thread stopped");
    }

    /// Run a pass, turning a panic into a worker stop
    fn guarded_pass(&mut self) -> PassReport {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.pass()));

        match result {
            Ok(report) => report,
            Err(e) => {
                error!("Panic in I/O pass: {:?}", e);
                self.stop(AcmError::WorkerStopped("panic during I/O pass".to_string()));
                PassReport {
                    stopped: true,
                    ..PassReport::default()
                }
            }
        }
    }
}

/// Spawn the I/O worker thread
///
/// `span` is entered for the thread's lifetime so every log line carries the
/// stream's fields. `on_pass_complete` runs on the worker thread after each
/// pass.
pub fn spawn_io_worker<C, F>(
    worker: IoWorker<C>,
    span: Span,
    on_pass_complete: F,
) -> std::io::Result<JoinHandle<()>>
where
    C: UsbConnection + 'static,
    F: Fn(&PassReport) + Send + 'static,
{
    std::thread::Builder::new()
        .name("acm-io-worker".to_string())
        .spawn(move || {
            let _entered = span.enter();
            worker.run(on_pass_complete)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportSettings;
    use common::test_utils::{MockConnection, MockPlatform, cdc_split_interfaces, create_mock_summary};
    use common::{BridgeChannels, DeviceSelector, create_serial_channels};

    fn worker_with(
        settings: WorkerSettings,
    ) -> (IoWorker<MockConnection>, BridgeChannels, MockConnection) {
        let conn = MockConnection::new(cdc_split_interfaces());
        let platform =
            MockPlatform::new().with_device(create_mock_summary(1, 4, 0x2341, 0x0043), conn.clone());
        let mut transport = CdcAcmTransport::new(TransportSettings::default());
        transport.open(&platform, &DeviceSelector::First).unwrap();

        let (bridge, channels) = create_serial_channels(settings.queue_capacity);
        let worker = IoWorker::new(transport, channels, Liveness::new(), settings);
        (worker, bridge, conn)
    }

    fn worker() -> (IoWorker<MockConnection>, BridgeChannels, MockConnection) {
        worker_with(WorkerSettings::default())
    }

    fn data(bytes: &'static [u8]) -> InboundMessage {
        InboundMessage::Data(Bytes::from_static(bytes))
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(WorkerSettings::default().validate().is_ok());
        let smallest = WorkerSettings {
            queue_capacity: 2,
            read_chunk_size: 1,
            max_pass_bytes: 1,
            ..WorkerSettings::default()
        };
        assert!(smallest.validate().is_ok());
    }

    #[test]
    fn test_settings_reject_queue_below_read_slots() {
        for queue_capacity in [0, 1] {
            let settings = WorkerSettings {
                queue_capacity,
                ..WorkerSettings::default()
            };
            assert!(matches!(
                settings.validate(),
                Err(AcmError::InvalidSettings(_))
            ));
        }
    }

    #[test]
    fn test_settings_reject_zero_read_sizes() {
        let no_chunk = WorkerSettings {
            read_chunk_size: 0,
            ..WorkerSettings::default()
        };
        assert!(matches!(
            no_chunk.validate(),
            Err(AcmError::InvalidSettings(_))
        ));

        let no_pass_bytes = WorkerSettings {
            max_pass_bytes: 0,
            ..WorkerSettings::default()
        };
        assert!(matches!(
            no_pass_bytes.validate(),
            Err(AcmError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_idle_passes_change_nothing() {
        let (mut worker, bridge, conn) = worker();

        for _ in 0..5 {
            assert_eq!(worker.pass(), PassReport::default());
        }

        assert_eq!(bridge.try_recv_inbound(), None);
        assert!(conn.writes().is_empty());
        assert!(worker.liveness().is_running());
    }

    #[test]
    fn test_reads_accumulate_into_one_message() {
        let (mut worker, bridge, conn) = worker();
        conn.push_read(b"hel");
        conn.push_read(b"lo");

        let report = worker.pass();
        assert_eq!(report.bytes_read, 5);
        assert_eq!(bridge.try_recv_inbound(), Some(data(b"hello")));
        assert_eq!(bridge.try_recv_inbound(), None);
    }

    #[test]
    fn test_reads_use_poll_timeout_and_chunk_size() {
        let settings = WorkerSettings {
            poll_read_timeout: Duration::from_millis(5),
            read_chunk_size: 4,
            ..WorkerSettings::default()
        };
        let (mut worker, bridge, conn) = worker_with(settings);
        conn.push_read(b"abcdefghij");

        worker.pass();

        assert_eq!(bridge.try_recv_inbound(), Some(data(b"abcdefghij")));
        let timeouts = conn.state().read_timeouts.clone();
        assert_eq!(timeouts.len(), 4);
        assert!(timeouts.iter().all(|t| *t == Duration::from_millis(5)));
    }

    #[test]
    fn test_zero_length_read_ends_read_phase() {
        let (mut worker, bridge, conn) = worker();
        conn.push_read(b"ab");
        conn.push_read(b"");
        conn.push_read(b"cd");

        worker.pass();
        assert_eq!(bridge.try_recv_inbound(), Some(data(b"ab")));

        worker.pass();
        assert_eq!(bridge.try_recv_inbound(), Some(data(b"cd")));
    }

    #[test]
    fn test_pass_byte_limit() {
        let settings = WorkerSettings {
            read_chunk_size: 4,
            max_pass_bytes: 8,
            ..WorkerSettings::default()
        };
        let (mut worker, bridge, conn) = worker_with(settings);
        conn.push_read(b"0123456789ab");

        worker.pass();
        assert_eq!(bridge.try_recv_inbound(), Some(data(b"01234567")));

        worker.pass();
        assert_eq!(bridge.try_recv_inbound(), Some(data(b"89ab")));
    }

    #[test]
    fn test_hard_read_error_stops_worker() {
        let (mut worker, bridge, conn) = worker();
        conn.push_read(b"partial");
        conn.push_read_error(rusb::Error::NoDevice);
        conn.push_read(b"never read");
        bridge
            .try_send_outbound(Bytes::from_static(b"never written"))
            .unwrap();

        let report = worker.pass();
        assert!(report.stopped);
        assert!(!worker.liveness().is_running());

        assert_eq!(bridge.try_recv_inbound(), Some(data(b"partial")));
        assert!(matches!(
            bridge.try_recv_inbound(),
            Some(InboundMessage::Terminated { .. })
        ));
        assert_eq!(bridge.try_recv_inbound(), None);
        assert!(conn.writes().is_empty());

        let reads_before = conn.state().read_timeouts.len();
        for _ in 0..3 {
            assert_eq!(worker.pass(), PassReport::default());
        }
        assert_eq!(conn.state().read_timeouts.len(), reads_before);
        assert_eq!(conn.pending_reads(), 1);
        assert_eq!(bridge.outbound_len(), 1);
        assert_eq!(bridge.try_recv_inbound(), None);
    }

    #[test]
    fn test_one_outbound_message_per_pass() {
        let (mut worker, bridge, conn) = worker();
        bridge.try_send_outbound(Bytes::from_static(b"first")).unwrap();
        bridge.try_send_outbound(Bytes::from_static(b"second")).unwrap();

        assert_eq!(worker.pass().bytes_written, 5);
        assert_eq!(conn.writes().len(), 1);

        assert_eq!(worker.pass().bytes_written, 6);
        assert_eq!(
            conn.writes(),
            vec![(0x02, b"first".to_vec()), (0x02, b"second".to_vec())]
        );
    }

    #[test]
    fn test_write_failure_stops_worker_and_terminates_stream() {
        let (mut worker, bridge, conn) = worker();
        conn.push_write_result(Err(rusb::Error::Pipe));
        bridge.try_send_outbound(Bytes::from_static(b"doomed")).unwrap();

        let report = worker.pass();
        assert!(report.stopped);
        assert!(!worker.liveness().is_running());

        match bridge.try_recv_inbound() {
            Some(InboundMessage::Terminated { reason }) => {
                assert!(reason.contains("Write failed"))
            }
            other => panic!("expected termination, got {:?}", other),
        }
    }

    #[test]
    fn test_full_inbound_queue_skips_read() {
        let settings = WorkerSettings {
            queue_capacity: 2,
            ..WorkerSettings::default()
        };
        let (mut worker, bridge, conn) = worker_with(settings);
        conn.push_read(b"one");
        conn.push_read(b"");
        conn.push_read(b"two");

        worker.pass();
        let report = worker.pass();
        assert!(report.read_skipped);
        assert_eq!(conn.pending_reads(), 1);

        assert_eq!(bridge.try_recv_inbound(), Some(data(b"one")));
        worker.pass();
        assert_eq!(bridge.try_recv_inbound(), Some(data(b"two")));
    }

    #[test]
    fn test_run_loop_handles_commands() {
        let conn = MockConnection::new(cdc_split_interfaces());
        let platform =
            MockPlatform::new().with_device(create_mock_summary(1, 4, 0x2341, 0x0043), conn.clone());
        let mut transport = CdcAcmTransport::new(TransportSettings::default());
        transport.open(&platform, &DeviceSelector::First).unwrap();
        conn.push_read(b"ping");

        let (bridge, channels) = create_serial_channels(8);
        let worker = IoWorker::new(transport, channels, Liveness::new(), WorkerSettings::default());

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let handle = spawn_io_worker(worker, Span::none(), move |report: &PassReport| {
            let _ = done_tx.send(*report);
        })
        .unwrap();

        assert!(bridge.request_pass());
        let report = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(report.bytes_read, 4);
        assert_eq!(bridge.try_recv_inbound(), Some(data(b"ping")));

        bridge.request_shutdown().unwrap();
        handle.join().unwrap();
        assert!(conn.claimed().is_empty());
    }
}

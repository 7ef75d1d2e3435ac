//! Event-loop bridge
//!
//! Adapts the worker's queue-based model to a single-threaded scheduler that
//! expects descriptor readiness. The scheduler calls [`SerialBridge::tick`]
//! from a repeating timer; each tick asks the worker thread for one pass, and
//! the worker calls [`Scheduler::notify_now`] when the pass is done so the
//! scheduler re-evaluates the stream instead of waiting for an OS readiness
//! notification that never comes for this transport.
//!
//! Every method used from the scheduler's thread is non-blocking.

use crate::error::{AcmError, Result};
use crate::transport::{CdcAcmTransport, TransportSettings};
use crate::worker::{IoWorker, Liveness, PassReport, WorkerSettings, spawn_io_worker};
use async_channel::TrySendError;
use bytes::Bytes;
use common::{
    BridgeChannels, DeviceSelector, InboundMessage, StreamId, UsbConnection, UsbPlatform,
    create_serial_channels,
};
use protocol::{LineCoding, LineState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn};

/// The external scheduler, as seen from the bridge
pub trait Scheduler: Send + Sync {
    /// Re-evaluate readiness of `stream` now
    ///
    /// Called from the worker thread after every pass.
    fn notify_now(&self, stream: StreamId);
}

/// Consumer of the byte stream
pub trait Protocol {
    fn data_received(&mut self, data: &[u8]);

    /// Called once when the stream terminates
    fn connection_lost(&mut self, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not opened yet, or closed
    Idle,
    /// Worker running, passes dispatched on tick
    Active,
    /// Worker hit a fatal error; ticks are no-ops until closed
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotOpen,
    /// A pass was handed to the worker
    Dispatched,
    /// The previous pass has not completed yet
    InFlight,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No message waiting
    Nothing,
    /// One message of this many bytes went to the protocol
    Delivered(usize),
    /// The stream has terminated
    ConnectionDone,
}

struct ActiveStream {
    stream: StreamId,
    channels: BridgeChannels,
    liveness: Liveness,
    pass_in_flight: Arc<AtomicBool>,
    termination_reported: AtomicBool,
    handle: Option<JoinHandle<()>>,
}

/// Bridge between a scheduler and one CDC-ACM stream
pub struct SerialBridge {
    scheduler: Arc<dyn Scheduler>,
    settings: WorkerSettings,
    active: Option<ActiveStream>,
}

impl SerialBridge {
    pub fn new(scheduler: Arc<dyn Scheduler>, settings: WorkerSettings) -> Self {
        Self {
            scheduler,
            settings,
            active: None,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Open a device, configure the line, and start the worker
    ///
    /// Open-time errors are returned synchronously.
    pub fn open<P: UsbPlatform>(
        &mut self,
        platform: &P,
        selector: &DeviceSelector,
        transport_settings: TransportSettings,
        coding: &LineCoding,
        state: LineState,
    ) -> Result<StreamId> {
        self.settings.validate()?;

        let mut transport = CdcAcmTransport::new(transport_settings);
        transport.open(platform, selector)?;
        transport.configure(coding, state)?;
        self.start(transport)
    }

    /// Start a worker thread on an already open transport
    ///
    /// A previously active stream is closed first. Invalid worker settings
    /// are rejected before anything is spawned.
    pub fn start<C: UsbConnection + 'static>(
        &mut self,
        transport: CdcAcmTransport<C>,
    ) -> Result<StreamId> {
        self.settings.validate()?;

        if self.active.is_some() {
            self.close();
        }

        let stream = transport.stream_id().ok_or(AcmError::NotOpen)?;
        let (channels, worker_channels) = create_serial_channels(self.settings.queue_capacity);
        let liveness = Liveness::new();
        let pass_in_flight = Arc::new(AtomicBool::new(false));

        let worker = IoWorker::new(transport, worker_channels, liveness.clone(), self.settings);
        let span = info_span!("acm_stream", stream = %stream);

        let scheduler = Arc::clone(&self.scheduler);
        let in_flight = Arc::clone(&pass_in_flight);
        let handle = spawn_io_worker(worker, span, move |report: &PassReport| {
            if report.stopped {
                debug!("Pass stopped the worker");
            }
            in_flight.store(false, Ordering::Release);
            scheduler.notify_now(stream);
        })?;

        info!("Stream {} active", stream);
        self.active = Some(ActiveStream {
            stream,
            channels,
            liveness,
            pass_in_flight,
            termination_reported: AtomicBool::new(false),
            handle: Some(handle),
        });

        Ok(stream)
    }

    pub fn state(&self) -> BridgeState {
        match &self.active {
            None => BridgeState::Idle,
            Some(active) if active.liveness.is_running() => BridgeState::Active,
            Some(_) => BridgeState::Stopped,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.active.as_ref().map(|a| a.stream)
    }

    /// Payloads accepted but not yet taken by the worker
    pub fn outbound_pending(&self) -> usize {
        self.active
            .as_ref()
            .map_or(0, |a| a.channels.outbound_len())
    }

    /// Whether a dispatched pass has not reported completion yet
    ///
    /// Once this reads false, everything that pass queued is visible to
    /// [`SerialBridge::do_read`].
    pub fn pass_in_flight(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.pass_in_flight.load(Ordering::Acquire))
    }

    /// Periodic timer callback: dispatch one worker pass
    ///
    /// At most one pass is in flight; a tick that finds the previous pass
    /// still running does nothing.
    pub fn tick(&self) -> TickOutcome {
        let Some(active) = &self.active else {
            return TickOutcome::NotOpen;
        };

        if !active.liveness.is_running() {
            return TickOutcome::Stopped;
        }

        if active.pass_in_flight.swap(true, Ordering::AcqRel) {
            trace!("Previous pass still in flight");
            return TickOutcome::InFlight;
        }

        if active.channels.request_pass() {
            TickOutcome::Dispatched
        } else {
            warn!("I/O worker is gone, stopping stream {}", active.stream);
            active.pass_in_flight.store(false, Ordering::Release);
            active.liveness.stop();
            TickOutcome::Stopped
        }
    }

    /// Queue `data` for writing
    ///
    /// Returns the full length once queued, or 0 when the outbound queue is
    /// full (retry after the next readiness notification). Transfer failures
    /// surface later as stream termination. Writing to a stopped stream is
    /// an error rather than a silent drop.
    pub fn write_some_data(&self, data: &[u8]) -> Result<usize> {
        let active = self.active.as_ref().ok_or(AcmError::NotOpen)?;

        if !active.liveness.is_running() {
            return Err(AcmError::WorkerStopped(format!(
                "stream {} is closed",
                active.stream
            )));
        }

        if data.is_empty() {
            return Ok(0);
        }

        match active.channels.try_send_outbound(Bytes::copy_from_slice(data)) {
            Ok(()) => Ok(data.len()),
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full, {} bytes not accepted", data.len());
                Ok(0)
            }
            Err(TrySendError::Closed(_)) => Err(AcmError::WorkerStopped(
                "I/O worker thread exited".to_string(),
            )),
        }
    }

    /// Deliver at most one inbound message to `protocol`
    pub fn do_read<P: Protocol + ?Sized>(&self, protocol: &mut P) -> ReadOutcome {
        let Some(active) = &self.active else {
            return ReadOutcome::Nothing;
        };

        match active.channels.try_recv_inbound() {
            Some(InboundMessage::Data(data)) => {
                protocol.data_received(&data);
                ReadOutcome::Delivered(data.len())
            }
            Some(InboundMessage::Terminated { reason }) => {
                Self::report_termination(active, protocol, &reason);
                ReadOutcome::ConnectionDone
            }
            None if !active.liveness.is_running() => {
                Self::report_termination(active, protocol, "I/O worker stopped");
                ReadOutcome::ConnectionDone
            }
            None => ReadOutcome::Nothing,
        }
    }

    fn report_termination<P: Protocol + ?Sized>(
        active: &ActiveStream,
        protocol: &mut P,
        reason: &str,
    ) {
        if !active.termination_reported.swap(true, Ordering::AcqRel) {
            info!("Stream {} terminated: {}", active.stream, reason);
            protocol.connection_lost(reason);
        }
    }

    /// Stop the worker thread and release the device
    ///
    /// Waits for an in-flight pass, which is bounded by the transfer
    /// timeouts. Closing an idle bridge is a no-op.
    pub fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        if let Err(e) = active.channels.request_shutdown() {
            debug!("Shutdown request not delivered: {}", e);
        }

        if let Some(handle) = active.handle.take()
            && handle.join().is_err()
        {
            error!("I/O worker thread for stream {} panicked", active.stream);
        }

        info!("Stream {} closed", active.stream);
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        self.close();
    }
}

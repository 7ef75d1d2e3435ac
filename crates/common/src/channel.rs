//! Bounded channel pair between the event-loop bridge and the I/O worker thread
//!
//! Three channels cross the thread boundary:
//! - commands (bridge -> worker): run one I/O pass, or shut down
//! - inbound bytes (worker -> bridge): data read from the device, then at most
//!   one termination message
//! - outbound bytes (bridge -> worker): payloads queued for writing
//!
//! The bridge end only ever uses non-blocking `try_*` operations.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use bytes::Bytes;

/// Capacity of the command channel; at most one pass is in flight plus a shutdown
const COMMAND_CAPACITY: usize = 4;

/// Commands from the bridge to the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Perform one bounded I/O pass
    Pass,
    /// Exit the worker thread and close the transport
    Shutdown,
}

/// Messages from the worker thread to the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Bytes read from the device during one pass
    Data(Bytes),
    /// The worker stopped after a fatal transport error
    Terminated { reason: String },
}

/// Bridge end (event-loop side, never blocks)
pub struct BridgeChannels {
    cmd_tx: Sender<WorkerCommand>,
    inbound_rx: Receiver<InboundMessage>,
    outbound_tx: Sender<Bytes>,
}

impl BridgeChannels {
    /// Ask the worker for one pass; false if the command could not be queued
    pub fn request_pass(&self) -> bool {
        self.cmd_tx.try_send(WorkerCommand::Pass).is_ok()
    }

    /// Ask the worker to exit
    pub fn request_shutdown(&self) -> crate::Result<()> {
        self.cmd_tx
            .try_send(WorkerCommand::Shutdown)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take the next inbound message, if any
    pub fn try_recv_inbound(&self) -> Option<InboundMessage> {
        match self.inbound_rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Queue a payload for the worker without blocking
    pub fn try_send_outbound(&self, data: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.outbound_tx.try_send(data)
    }

    /// Number of payloads waiting to be written
    pub fn outbound_len(&self) -> usize {
        self.outbound_tx.len()
    }
}

/// Worker end (dedicated thread, may block on commands)
pub struct WorkerChannels {
    cmd_rx: Receiver<WorkerCommand>,
    inbound_tx: Sender<InboundMessage>,
    outbound_rx: Receiver<Bytes>,
}

impl WorkerChannels {
    /// Wait for the next command (blocking)
    pub fn recv_command(&self) -> crate::Result<WorkerCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Pop one outbound payload without blocking
    pub fn try_recv_outbound(&self) -> Option<Bytes> {
        self.outbound_rx.try_recv().ok()
    }

    /// Free slots in the inbound queue
    pub fn inbound_room(&self) -> usize {
        let capacity = self.inbound_tx.capacity().unwrap_or(usize::MAX);
        capacity.saturating_sub(self.inbound_tx.len())
    }

    /// Push an inbound message without blocking
    pub fn try_send_inbound(&self, msg: InboundMessage) -> crate::Result<()> {
        self.inbound_tx
            .try_send(msg)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel pair
///
/// `capacity` bounds both the inbound and the outbound queue.
///
/// Returns (BridgeChannels for the event loop, WorkerChannels for the I/O thread)
pub fn create_serial_channels(capacity: usize) -> (BridgeChannels, WorkerChannels) {
    let (cmd_tx, cmd_rx) = bounded(COMMAND_CAPACITY);
    let (inbound_tx, inbound_rx) = bounded(capacity);
    let (outbound_tx, outbound_rx) = bounded(capacity);

    (
        BridgeChannels {
            cmd_tx,
            inbound_rx,
            outbound_tx,
        },
        WorkerChannels {
            cmd_rx,
            inbound_tx,
            outbound_rx,
        },
    )
}

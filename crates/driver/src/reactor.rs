//! Tokio event loop for a [`SerialBridge`]
//!
//! The loop fires the bridge tick on a fixed interval (first tick
//! immediately) and wakes early when the worker reports a finished pass.
//! After each wakeup it flushes pending outgoing data and delivers every
//! queued inbound message to the protocol.

use crate::bridge::{Protocol, ReadOutcome, Scheduler, SerialBridge};
use crate::error::AcmError;
use crate::worker::WorkerSettings;
use bytes::Bytes;
use common::StreamId;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Scheduler that wakes a tokio task
#[derive(Debug, Default)]
pub struct NotifyScheduler {
    notify: Notify,
}

impl NotifyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next `notify_now`
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Scheduler for NotifyScheduler {
    fn notify_now(&self, stream: StreamId) {
        trace!("Readiness notification for stream {}", stream);
        self.notify.notify_one();
    }
}

/// Why [`PollDriver::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// The stream terminated; the protocol has seen `connection_lost`
    ConnectionDone,
    /// The outgoing sender was dropped, everything queued was written, and
    /// the bytes read by the last pass were delivered
    InputClosed,
}

/// Owns a bridge and drives it from the current tokio task
pub struct PollDriver {
    bridge: SerialBridge,
    scheduler: Arc<NotifyScheduler>,
}

impl PollDriver {
    pub fn new(settings: WorkerSettings) -> Self {
        let scheduler = Arc::new(NotifyScheduler::new());
        let bridge = SerialBridge::new(scheduler.clone(), settings);
        Self { bridge, scheduler }
    }

    pub fn bridge(&self) -> &SerialBridge {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut SerialBridge {
        &mut self.bridge
    }

    /// Run until the stream terminates or `outgoing` closes
    ///
    /// Data from `outgoing` is offered to the bridge one chunk at a time; a
    /// chunk refused by a full queue is retried after the next wakeup.
    pub async fn run<P: Protocol + ?Sized>(
        &mut self,
        protocol: &mut P,
        mut outgoing: mpsc::Receiver<Bytes>,
    ) -> DriverExit {
        let mut ticker = tokio::time::interval(self.bridge.settings().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending: Option<Bytes> = None;
        let mut input_closed = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.bridge.tick();
                }
                _ = self.scheduler.notified() => {}
                data = outgoing.recv(), if pending.is_none() && !input_closed => {
                    match data {
                        Some(data) => pending = Some(data),
                        None => {
                            debug!("Outgoing channel closed");
                            input_closed = true;
                        }
                    }
                }
            }

            if let Some(data) = pending.take() {
                match self.bridge.write_some_data(&data) {
                    Ok(0) => pending = Some(data),
                    Ok(_) => {}
                    Err(AcmError::WorkerStopped(reason)) => {
                        debug!("Dropping {} outgoing bytes: {}", data.len(), reason);
                    }
                    Err(e) => warn!("Write rejected: {}", e),
                }
            }

            // Sampled before draining: a pass seen as finished here has
            // already queued its data, so the drain below delivers it
            let pass_settled = !self.bridge.pass_in_flight();

            loop {
                match self.bridge.do_read(protocol) {
                    ReadOutcome::Delivered(_) => continue,
                    ReadOutcome::Nothing => break,
                    ReadOutcome::ConnectionDone => return DriverExit::ConnectionDone,
                }
            }

            if input_closed
                && pending.is_none()
                && self.bridge.outbound_pending() == 0
                && pass_settled
            {
                return DriverExit::InputClosed;
            }
        }
    }

    /// Close the stream and hand the bridge back
    pub fn into_bridge(mut self) -> SerialBridge {
        self.bridge.close();
        self.bridge
    }
}

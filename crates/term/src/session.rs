//! Interactive session: stdin to the device, device to stdout

use crate::config::TermConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use common::UsbPlatform;
use driver::{DriverExit, PollDriver, Protocol};
use std::io::{Read, Write};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const STDIN_BUFFER_SIZE: usize = 1024;
const STDIN_QUEUE: usize = 16;

/// Protocol copying every received byte to a writer
pub struct EchoProtocol<W: Write> {
    out: W,
    lost: Option<String>,
}

impl<W: Write> EchoProtocol<W> {
    pub fn new(out: W) -> Self {
        Self { out, lost: None }
    }

    pub fn lost_reason(&self) -> Option<&str> {
        self.lost.as_deref()
    }
}

impl<W: Write> Protocol for EchoProtocol<W> {
    fn data_received(&mut self, data: &[u8]) {
        if let Err(e) = self.out.write_all(data).and_then(|_| self.out.flush()) {
            warn!("Failed to write {} bytes to output: {}", data.len(), e);
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        self.lost = Some(reason.to_string());
    }
}

/// Read stdin on a plain thread and forward chunks
///
/// Not a tokio blocking task: a read parked on an interactive stdin would
/// hold up runtime shutdown.
fn spawn_stdin_reader(tx: mpsc::Sender<Bytes>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; STDIN_BUFFER_SIZE];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => {
                        debug!("stdin closed");
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

/// Open the configured device and bridge it to stdin/stdout until the device
/// goes away, stdin closes, or Ctrl+C
pub async fn run<P: UsbPlatform>(config: &TermConfig, platform: &P) -> Result<()> {
    let selector = config.selector()?;
    let coding = config.line_coding();

    let mut driver = PollDriver::new(config.worker_settings());
    let stream = driver
        .bridge_mut()
        .open(
            platform,
            &selector,
            config.transport_settings(),
            &coding,
            config.line_state(),
        )
        .with_context(|| format!("Failed to open device '{}'", selector))?;
    info!("Connected to stream {} at {}", stream, coding);

    let (tx, rx) = mpsc::channel(STDIN_QUEUE);
    spawn_stdin_reader(tx).context("Failed to spawn stdin reader")?;

    let mut protocol = EchoProtocol::new(std::io::stdout());

    tokio::select! {
        exit = driver.run(&mut protocol, rx) => match exit {
            DriverExit::ConnectionDone => {
                warn!(
                    "Connection lost: {}",
                    protocol.lost_reason().unwrap_or("unknown reason")
                );
            }
            DriverExit::InputClosed => info!("Input closed"),
        },
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, closing"),
            Err(e) => warn!("Error waiting for Ctrl+C: {}", e),
        },
    }

    driver.bridge_mut().close();
    Ok(())
}

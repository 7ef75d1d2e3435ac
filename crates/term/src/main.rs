//! acm-term
//!
//! Minimal serial terminal for USB CDC-ACM devices, talking to the device
//! from userspace through libusb instead of the kernel tty driver.

mod config;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeviceSelector, UsbPlatform, setup_logging};
use config::TermConfig;
use driver::RusbPlatform;
use protocol::{Parity, StopBits};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "acm-term")]
#[command(
    author,
    version,
    about = "acm-term - Serial terminal for USB CDC-ACM devices"
)]
#[command(long_about = "
A serial terminal that drives USB CDC-ACM devices (Arduino, STM32 virtual COM
ports, modems) directly over libusb. Bytes typed on stdin go to the device,
bytes from the device go to stdout; logs go to stderr.

EXAMPLES:
    # Open the first CDC device at 9600 8N1
    acm-term

    # Open a specific device at 115200 baud
    acm-term --device 0x2341:0x0043 --baud 115200

    # Open the device at bus 1, address 4 with 7E1
    acm-term --device 1.4 --data-bits 7 --parity E

    # List CDC devices and exit
    acm-term --list-devices

CONFIGURATION:
    acm-term looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/acm-term/term.toml
    3. /etc/acm-term/term.toml
    4. Built-in defaults

Command line flags override the configuration file.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List CDC devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Device to open: first, 0xVID:0xPID, 0xVID:* or BUS.ADDR
    #[arg(short, long, value_name = "SELECTOR")]
    device: Option<DeviceSelector>,

    /// Baud rate
    #[arg(short, long, value_name = "RATE")]
    baud: Option<u32>,

    /// Parity (N, O, E, M, S)
    #[arg(long, value_name = "PARITY")]
    parity: Option<Parity>,

    /// Stop bits (1, 1.5, 2)
    #[arg(long, value_name = "BITS")]
    stop_bits: Option<StopBits>,

    /// Data bits (5-8, 16)
    #[arg(long, value_name = "BITS")]
    data_bits: Option<u8>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Apply command line overrides on top of the loaded configuration
    fn apply(&self, config: &mut TermConfig) {
        if let Some(device) = &self.device {
            config.device.selector = device.to_string();
        }
        if let Some(baud) = self.baud {
            config.line.baud_rate = baud;
        }
        if let Some(parity) = self.parity {
            config.line.parity = parity;
        }
        if let Some(stop_bits) = self.stop_bits {
            config.line.stop_bits = stop_bits;
        }
        if let Some(data_bits) = self.data_bits {
            config.line.data_bits = data_bits;
        }
        if let Some(level) = &self.log_level {
            config.term.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = TermConfig::default();
        let path = TermConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        TermConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        TermConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid settings")?;

    setup_logging(&config.term.log_level).context("Failed to setup logging")?;

    info!("acm-term v{}", env!("CARGO_PKG_VERSION"));

    let platform = RusbPlatform::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&platform);
    }

    session::run(&config, &platform).await
}

/// List CDC devices and exit
fn list_devices_mode<P: UsbPlatform>(platform: &P) -> Result<()> {
    let devices: Vec<_> = platform
        .devices()
        .context("Failed to enumerate USB devices")?
        .into_iter()
        .filter(|d| d.cdc_capable)
        .collect();

    if devices.is_empty() {
        println!("No CDC devices found.");
    } else {
        println!("Found {} CDC device(s):\n", devices.len());
        for device in devices {
            println!(
                "  [{:03}.{:03}] {:04x}:{:04x} - {}",
                device.bus_number,
                device.address,
                device.vendor_id,
                device.product_id,
                device.product.as_deref().unwrap_or("Unknown Product")
            );
        }
    }

    Ok(())
}

//! vendor-usb-probe
//!
//! Finds the vendor USB peripheral, reports its descriptors and endpoint
//! map, claims its interfaces and polls its bulk IN endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use common::{RusbHost, UsbHost, setup_logging};
use probe::config::{self, ProbeConfig};
use probe::report;
use probe::usb::{DeviceMatcher, Readiness, discover, run_read_loop, survey};
use std::io::{self, Write};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "vendor-usb-probe")]
#[command(
    author,
    version,
    about = "Vendor USB probe - find, claim and poll a vendor-specific USB device"
)]
#[command(long_about = "
Locates one vendor-specific USB device by vendor/product ID and by its
manufacturer and product strings, prints its descriptors and endpoint map,
claims its interfaces and polls its bulk IN endpoint.

EXAMPLES:
    # Probe with default identity (03eb:2423)
    vendor-usb-probe

    # Poll five times and exit
    vendor-usb-probe --count 5

    # Show how every attached device compares against the identity
    vendor-usb-probe --list

    # Run with debug logging
    vendor-usb-probe --log-level debug

CONFIGURATION:
    The probe looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/vendor-usb-probe/probe.toml
    3. /etc/vendor-usb-probe/probe.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Report the match verdict of every attached device and exit
    #[arg(long)]
    list: bool,

    /// Stop after this many bulk reads
    #[arg(short = 'n', long, value_name = "N")]
    count: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ProbeConfig::default();
        let path = ProbeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args.log_level.as_deref().unwrap_or(&config.probe.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("vendor-usb-probe v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let host = RusbHost::new().context("Failed to initialise libusb")?;
    let capabilities = host.capabilities();
    info!(
        "Host capabilities: capability API {}, kernel driver detach {}",
        capabilities.has_capability_api, capabilities.kernel_driver_detach
    );

    let matcher = DeviceMatcher::new(config.identity()?);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.list {
        let verdicts = survey(&host, &matcher).context("Failed to enumerate USB devices")?;
        report::write_survey(&verdicts, &mut out)?;
        return Ok(());
    }

    let mut device = discover(&host, &matcher).context("Failed to find the vendor device")?;
    info!("Opened {}", device.label());

    report::write_device_report(&device, &mut out)?;
    report::write_endpoint_table(&device, &mut out)?;

    let policy = config.claim_policy(capabilities);
    let claim_report = device
        .claim(&policy)
        .context("Failed to claim device interfaces")?;
    report::write_claim_failures(claim_report, &mut out)?;

    match device.readiness() {
        Readiness::Ready => info!("All interfaces claimed"),
        Readiness::Degraded { failed_steps } => {
            warn!("{} claim step(s) failed, continuing", failed_steps)
        }
        Readiness::NothingClaimed => warn!("No interface could be claimed, reads will likely fail"),
        other => warn!("Unexpected readiness after claim: {:?}", other),
    }
    out.flush()?;

    let result = run_read_loop(&device, config.read_loop(args.count), &mut out);

    // Release before the host context goes away
    device.release();

    let polls = result.context("Bulk read loop failed")?;
    info!("Completed {} bulk read(s)", polls);
    Ok(())
}

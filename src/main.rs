use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rawgadget::config::{GadgetConfig, UsbSpeed};
use rawgadget::error::Result;
use rawgadget::gadget::{
    Configuration, ControlHeader, EventDispatcher, GadgetDevice, GadgetIo, RawGadgetClient,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// rawgadget command line arguments
#[derive(Parser, Debug)]
#[command(name = "rawgadget")]
#[command(version, about = "Bind to a UDC through raw-gadget and log host control traffic", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Raw gadget driver node (overrides config)
    #[arg(long, value_name = "PATH")]
    raw_gadget: Option<PathBuf>,

    /// UDC driver name (overrides config and UDC_DRIVER)
    #[arg(long, value_name = "NAME")]
    driver: Option<String>,

    /// UDC device name (overrides config and UDC_DEVICE)
    #[arg(long, value_name = "NAME")]
    device: Option<String>,

    /// USB speed: low, full, high, super, superplus or 0-6 (overrides config and RG_SPEED)
    #[arg(short = 's', long, value_name = "SPEED")]
    speed: Option<UsbSpeed>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Logs every control request and stalls it
///
/// Enough to watch a host probe the gadget; it never enumerates.
#[derive(Debug, Default)]
struct MonitorDevice {
    requests: u64,
}

impl GadgetDevice for MonitorDevice {
    type Request = ControlHeader;

    fn create_request(&mut self, raw: &[u8]) -> Result<ControlHeader> {
        ControlHeader::parse(raw)
    }

    fn handle_request(&mut self, request: ControlHeader, io: &mut dyn GadgetIo) -> Result<()> {
        self.requests += 1;
        tracing::info!(
            "Control #{}: bmRequestType={:#04x} bRequest={:#04x} wValue={:#06x} wIndex={:#06x} wLength={}",
            self.requests,
            request.request_type,
            request.request,
            request.value,
            request.index,
            request.length
        );
        io.stall_ep0()
    }

    fn configuration(&self) -> Option<&Configuration> {
        None
    }
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting rawgadget v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    tracing::info!(
        "UDC {} ({}), speed {:?}",
        config.device_name,
        config.driver_name,
        config.speed
    );

    if !RawGadgetClient::is_available(&config.device_path) {
        anyhow::bail!(
            "Raw gadget driver not available at {} (is the raw_gadget module loaded?)",
            config.device_path.display()
        );
    }

    let mut dispatcher =
        EventDispatcher::open(&config).context("Failed to bind the raw gadget to the UDC")?;
    let mut device = MonitorDevice::default();
    dispatcher.connect(&device).context("Failed to start the UDC")?;
    tracing::info!("Gadget running, waiting for host events");

    loop {
        if let Err(e) = dispatcher.service_irqs(&mut device) {
            tracing::error!("Event loop stopped: {}", e);
            dispatcher.disconnect();
            return Err(e).context("Raw gadget event loop failed");
        }
    }
}

/// Defaults, then the config file, then the environment, then CLI flags
fn build_config(args: &CliArgs) -> anyhow::Result<GadgetConfig> {
    let mut config = match &args.config {
        Some(path) => GadgetConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GadgetConfig::default(),
    };
    config.apply_env()?;

    if let Some(path) = &args.raw_gadget {
        config.device_path = path.clone();
    }
    if let Some(driver) = &args.driver {
        config.driver_name = driver.clone();
    }
    if let Some(device) = &args.device {
        config.device_name = device.clone();
    }
    if let Some(speed) = args.speed {
        config.speed = speed;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rawgadget=error",
        LogLevel::Warn => "rawgadget=warn",
        LogLevel::Info => "rawgadget=info",
        LogLevel::Verbose => "rawgadget=info,rawgadget::gadget::dispatcher=debug",
        LogLevel::Debug => "rawgadget=debug",
        LogLevel::Trace => "rawgadget=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

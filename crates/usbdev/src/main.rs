//! usbdev command-line front end
//!
//! Runs the hotplug worker against real hardware and exposes the session
//! layer from the shell: watch devices come and go, read one transfer from a
//! device, or write stdin to it.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};
use usbdev::config::{DriverConfig, load_config};
use usbdev::usb::{WorkerHandle, list_matching_devices, spawn_hotplug_worker};
use usbdev::{ControllerSettings, DriverEvent, EventReceiver, HotplugController, Minor};

/// How long `read`/`write` wait for a device to show up
const DEVICE_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "usbdev")]
#[command(
    author,
    version,
    about = "Hotplug-aware USB bulk character-stream driver"
)]
#[command(long_about = "
Binds USB devices listed in the id table, publishes each under a minor
number, and moves bytes over their bulk endpoints.

EXAMPLES:
    # Watch devices attach and detach
    usbdev monitor

    # Read up to 512 bytes from the first attached device
    usbdev read --count 512

    # Send a file to minor 192
    usbdev write --minor 192 < payload.bin

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbdev/driver.toml
    3. /etc/usbdev/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file (`~` and `$VARS` are expanded)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Save default configuration to the default location and exit
    SaveConfig,

    /// List attached devices that match the id table
    List,

    /// Run the driver and print events until Ctrl-C
    Monitor,

    /// Read once from a device and print what arrived
    Read {
        /// Minor to open (default: first device to attach)
        #[arg(long)]
        minor: Option<u32>,

        /// Maximum number of bytes to read
        #[arg(long, default_value_t = 64)]
        count: usize,

        /// Write the raw bytes to stdout instead of a hex dump
        #[arg(long)]
        raw: bool,
    },

    /// Write stdin to a device
    Write {
        /// Minor to open (default: first device to attach)
        #[arg(long)]
        minor: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        log_level,
        command,
    } = Args::parse();

    match command {
        Command::SaveConfig => save_default_config(),
        Command::List => list_mode(&init(config, log_level)?),
        Command::Monitor => monitor_mode(&init(config, log_level)?).await,
        Command::Read { minor, count, raw } => {
            read_mode(&init(config, log_level)?, minor, count, raw).await
        }
        Command::Write { minor } => write_mode(&init(config, log_level)?, minor).await,
    }
}

fn save_default_config() -> Result<()> {
    let config = DriverConfig::default();
    let path = DriverConfig::default_path();
    config.save(&path).context("Failed to save configuration")?;
    println!("Configuration saved to: {}", path.display());
    Ok(())
}

/// Load configuration, then set up logging from the CLI or config level
fn init(config_path: Option<String>, log_level: Option<String>) -> Result<DriverConfig> {
    let config = match config_path.as_deref() {
        Some(path) => load_config(path).context("Failed to load configuration")?,
        None => DriverConfig::load_or_default(),
    };

    let log_level = log_level.as_deref().unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbdev v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);
    Ok(config)
}

/// A running driver: controller, its event stream, and the hotplug thread
struct Driver {
    controller: Arc<HotplugController>,
    events: EventReceiver,
    worker: WorkerHandle,
    thread: JoinHandle<()>,
}

impl Driver {
    fn start(config: &DriverConfig) -> Result<Self> {
        let (tx, events) = usbdev::create_event_channel();
        let controller = Arc::new(HotplugController::new(
            ControllerSettings::from(config),
            tx,
        ));
        let (worker, thread) = spawn_hotplug_worker(Arc::clone(&controller), config)?;

        Ok(Self {
            controller,
            events,
            worker,
            thread,
        })
    }

    /// Wait until a device is published, under `requested` if given
    async fn wait_for_device(&self, requested: Option<u32>) -> Result<Minor> {
        let pick = |minors: Vec<Minor>| {
            minors
                .into_iter()
                .find(|minor| requested.is_none_or(|wanted| minor.0 == wanted))
        };

        let deadline = Instant::now() + DEVICE_WAIT;
        loop {
            if let Some(minor) = pick(self.controller.minors()) {
                return Ok(minor);
            }
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => bail!("Driver event channel closed"),
                Err(_) => {
                    return Err(match requested {
                        Some(minor) => anyhow!("No device attached as minor {}", minor),
                        None => anyhow!("No matching device attached"),
                    });
                }
            }
        }
    }

    /// Wait for the completion of one write on `minor`
    async fn wait_for_write(&self, minor: Minor) -> Result<usize> {
        let deadline = Instant::now() + DEVICE_WAIT;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(DriverEvent::WriteCompleted {
                    minor: m, status, ..
                })) if m == minor => return status.map_err(Into::into),
                Ok(Some(_)) => continue,
                Ok(None) => bail!("Driver event channel closed"),
                Err(_) => bail!("Timed out waiting for write completion"),
            }
        }
    }

    async fn stop(self) {
        info!("Shutting down hotplug worker...");
        self.worker.shutdown();
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Hotplug worker thread panicked: {:?}", e),
            Err(e) => error!("Failed to join hotplug worker: {}", e),
        }
    }
}

fn list_mode(config: &DriverConfig) -> Result<()> {
    let ids = config.usb.ids()?;
    let devices = list_matching_devices(&ids)?;

    if devices.is_empty() {
        println!("No matching USB devices found.");
        return Ok(());
    }

    println!("\nMatching USB Devices:");
    println!("{:-<50}", "");
    for device in &devices {
        println!("  {}  {}", device.identity, device.location);
    }
    println!("{:-<50}", "");
    println!("Total: {} device(s)", devices.len());
    Ok(())
}

async fn monitor_mode(config: &DriverConfig) -> Result<()> {
    let driver = Driver::start(config)?;
    info!("Monitoring USB devices, press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = driver.events.recv() => match event {
                Some(event) => print_event(&config.driver.name, &event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
        }
    }

    driver.stop().await;
    Ok(())
}

async fn read_mode(
    config: &DriverConfig,
    minor: Option<u32>,
    count: usize,
    raw: bool,
) -> Result<()> {
    let driver = Driver::start(config)?;
    let result = async {
        let minor = driver.wait_for_device(minor).await?;
        let session = driver.controller.open(minor)?;

        let data = tokio::task::spawn_blocking(move || session.read_to_vec(count))
            .await
            .context("Read task failed")??;

        if raw {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        } else {
            println!("{}", hex_dump(&data));
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    driver.stop().await;
    result
}

async fn write_mode(config: &DriverConfig, minor: Option<u32>) -> Result<()> {
    let input = tokio::task::spawn_blocking(|| {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).map(|_| buf)
    })
    .await
    .context("Stdin task failed")?
    .context("Failed to read stdin")?;

    let driver = Driver::start(config)?;
    let result = async {
        let minor = driver.wait_for_device(minor).await?;
        let session = driver.controller.open(minor)?;

        let queued = tokio::task::spawn_blocking(move || session.write_bytes(&input))
            .await
            .context("Write task failed")??;
        if queued == 0 {
            println!("Nothing to write");
            return Ok(());
        }

        let written = driver.wait_for_write(minor).await?;
        println!("Wrote {} bytes to {}-{}", written, config.driver.name, minor);
        Ok::<_, anyhow::Error>(())
    }
    .await;

    driver.stop().await;
    result
}

fn print_event(name: &str, event: &DriverEvent) {
    match event {
        DriverEvent::Attached {
            minor,
            location,
            identity,
            bulk_in,
            bulk_in_size,
            bulk_out,
        } => println!(
            "attached  {}-{}  {} at {}  in {:#04x} ({} bytes)  out {:#04x}",
            name, minor, identity, location, bulk_in, bulk_in_size, bulk_out
        ),
        DriverEvent::Detached { minor, location } => {
            println!("detached  {}-{}  {}", name, minor, location)
        }
        DriverEvent::WriteCompleted {
            minor,
            requested,
            status,
        } => match status {
            Ok(written) => println!(
                "written   {}-{}  {}/{} bytes",
                name, minor, written, requested
            ),
            Err(e) => println!(
                "failed    {}-{}  {} bytes: {}",
                name, minor, requested, e
            ),
        },
    }
}

fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{:08x}  {}", row * 16, bytes.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

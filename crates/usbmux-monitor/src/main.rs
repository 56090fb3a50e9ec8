//! usbmux device monitor.
//!
//! Subscribes to the usbmux daemon and prints one line per device event until
//! interrupted or until the daemon goes away.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use usbmux_core::{Listener, ListenerConfig};
use usbmux_types::{DeviceEntry, DeviceEvent};

/// Watch devices attached through the usbmux daemon
#[derive(Parser, Debug)]
#[command(name = "usbmux-monitor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Daemon socket (defaults to `$USBMUXD_SOCKET_ADDRESS` or `/var/run/usbmuxd`)
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// JSON listener config; command line flags take precedence
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen handshake attempts before giving up
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,

    /// Delay between Listen attempts
    #[arg(long, value_name = "MS")]
    retry_delay_ms: Option<u64>,

    /// Print the current device list and exit
    #[arg(long)]
    list: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn listener_config(&self) -> Result<ListenerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ListenerConfig::default(),
        };

        if let Some(path) = &self.socket_path {
            config.socket_path.clone_from(path);
        }
        if let Some(attempts) = self.max_attempts {
            config.listen_retry.max_attempts = attempts;
        }
        if let Some(ms) = self.retry_delay_ms {
            config.listen_retry.delay = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<ListenerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))
}

fn setup_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("usbmux={default_level}")));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let Some(log_file) = log_file else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = log_file
        .file_name()
        .with_context(|| format!("Invalid log file {}", log_file.display()))?;

    let file_appender = tracing_appender::rolling::never(dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .init();

    Ok(Some(guard))
}

fn describe_device(device: &DeviceEntry) -> String {
    let mut line = format!("id={} via {}", device.id(), device.connection_type);
    if let Some(serial) = &device.serial_number {
        line.push_str(&format!(" serial={serial}"));
    }
    if let Some(product) = device.product_id {
        line.push_str(&format!(" product={product:#06x}"));
    }
    line
}

fn format_event(event: &DeviceEvent, json: bool) -> String {
    let at = chrono::Local::now().to_rfc3339();
    if json {
        let device = event
            .device()
            .and_then(|d| serde_json::to_value(d).ok())
            .unwrap_or(serde_json::Value::Null);
        serde_json::json!({ "at": at, "event": event.name(), "device": device }).to_string()
    } else {
        match event.device() {
            Some(device) => format!("{at} {}: {}", event.name(), describe_device(device)),
            None => format!("{at} {}", event.name()),
        }
    }
}

fn print_devices(devices: &[DeviceEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No devices attached");
    }
    for device in devices {
        println!("{}", describe_device(device));
    }
    Ok(())
}

async fn watch(
    listener: &Listener,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    json: bool,
) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                // AttachFinished duplicates the Attached line
                if matches!(event, DeviceEvent::AttachFinished(_) | DeviceEvent::DetachFinished) {
                    continue;
                }
                println!("{}", format_event(&event, json));
                if event == DeviceEvent::ListenerStopped {
                    warn!("Daemon connection lost");
                    break;
                }
            }
        }
    }
    info!("{} devices known at exit", listener.devices().len());
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = setup_logging(args.log_file.as_deref())?;

    let config = args.listener_config()?;
    info!("Connecting to usbmux daemon at {}", config.socket_path.display());

    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Listener::start(&config, tx)
        .await
        .with_context(|| format!("Failed to listen on {}", config.socket_path.display()))?;

    if args.list {
        let devices = listener.list_devices().await;
        listener.close().await;
        return print_devices(&devices?, args.json);
    }

    watch(&listener, rx, args.json).await;
    listener.close().await;
    Ok(())
}

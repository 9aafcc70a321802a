//! usbipd: USB/IP server
//!
//! Exposes locally attached USB devices over TCP so remote hosts can
//! import them and drive them as if locally attached.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{BackendHandle, create_backend_bridge, setup_logging};
use server::config::ServerConfig;
use server::error::ServerError;
use server::network::Listener;
use server::state::{self, DaemonStatus, ServerCounters, unix_now};
use server::usb::claim::ClaimArbiter;
use server::usb::registry::DeviceRegistry;
use server::usb::spawn_usb_worker;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbipd")]
#[command(author, version, about = "USB/IP server - share local USB devices over TCP")]
#[command(long_about = "
Share locally attached USB devices with remote hosts over the USB/IP
protocol. Remote peers import a bound device and drive it as if it were
plugged in locally.

EXAMPLES:
    # List exportable devices
    usbipd list

    # Allow a device to be exported and start the daemon
    usbipd bind 1-1
    usbipd daemon --foreground

    # Check what the running daemon is doing
    usbipd status --detailed

CONFIGURATION:
    The daemon looks for configuration in the following order:
    1. Path given with 'daemon --config'
    2. ~/.config/usbipd/config.json
    3. /etc/usbipd/config.json
    4. Built-in defaults
")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List exportable USB devices
    List {
        /// List devices attached to this host (default)
        #[arg(short, long)]
        local: bool,
        /// List devices imported from remote hosts
        #[arg(short, long)]
        remote: bool,
    },

    /// Add a device to the export allow-list
    Bind {
        /// Bus id of the device, e.g. 1-1
        busid: String,
    },

    /// Remove a device from the export allow-list
    Unbind {
        /// Bus id of the device, e.g. 1-1
        busid: String,
    },

    /// Run the USB/IP server
    Daemon {
        /// Stay attached to the terminal and log to stderr only
        #[arg(short, long)]
        foreground: bool,
        /// Path to the configuration file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Report daemon status
    Status {
        /// Include claimed devices and uptime
        #[arg(long)]
        detailed: bool,
        /// Exit non-zero unless the daemon is running and fresh
        #[arg(long)]
        health: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::List { local, remote } => {
            init_logging(&cli.log_level)?;
            cmd_list(local, remote).await
        }
        Command::Bind { busid } => {
            init_logging(&cli.log_level)?;
            cmd_bind(&busid).await
        }
        Command::Unbind { busid } => {
            init_logging(&cli.log_level)?;
            cmd_unbind(&busid)
        }
        Command::Daemon { foreground, config } => cmd_daemon(cli.log_level, foreground, config).await,
        Command::Status { detailed, health } => {
            init_logging(&cli.log_level)?;
            cmd_status(detailed, health)
        }
    }
}

/// One-shot commands stay quiet unless asked otherwise
fn init_logging(cli_level: &Option<String>) -> Result<()> {
    let level = cli_level.as_deref().unwrap_or("warn");
    setup_logging(level, None).context("Failed to setup logging")?;
    Ok(())
}

/// Spin up the rusb backend for a one-shot CLI command
fn start_backend() -> Result<(BackendHandle, std::thread::JoinHandle<()>)> {
    let (backend, worker) = create_backend_bridge();
    let join = spawn_usb_worker(worker).context("Failed to spawn USB worker thread")?;
    Ok((backend, join))
}

async fn stop_backend(backend: BackendHandle, join: std::thread::JoinHandle<()>) {
    if let Err(e) = backend.shutdown().await {
        warn!("Error shutting down USB worker: {:#}", e);
    }
    let _ = tokio::task::spawn_blocking(move || join.join()).await;
}

async fn cmd_list(_local: bool, remote: bool) -> Result<()> {
    if remote {
        println!("This host only exports devices; use a USB/IP client to list imports.");
        return Ok(());
    }

    let config = ServerConfig::load_or_default();
    let (backend, join) = start_backend()?;

    let shared_config = Arc::new(RwLock::new(config));
    let registry = DeviceRegistry::new(backend.clone(), shared_config.clone());
    let result = registry.list().await;
    let bound = shared_config.read().await.allowed_devices.clone();

    let outcome = match result {
        Ok(devices) if devices.is_empty() => {
            println!("No exportable USB devices found.");
            Ok(())
        }
        Ok(devices) => {
            println!("Exportable USB devices ({}):\n", devices.len());
            for device in devices {
                let key = device.device_key();
                let marker = if bound.iter().any(|b| *b == device.bus_id || *b == key) {
                    "[bound]"
                } else {
                    ""
                };
                println!(
                    "  {:<10} {:04x}:{:04x} - {} {} {}",
                    device.bus_id,
                    device.vendor_id,
                    device.product_id,
                    device.manufacturer.as_deref().unwrap_or("Unknown"),
                    device.product.as_deref().unwrap_or("Device"),
                    marker
                );
                println!(
                    "             bus {:03} dev {:03} speed {:?}",
                    device.bus_num, device.dev_num, device.speed
                );
                if let Some(serial) = &device.serial {
                    println!("             serial {}", serial);
                }
                println!();
            }
            Ok(())
        }
        Err(e) => Err(anyhow!("Failed to enumerate devices: {}", e)),
    };

    stop_backend(backend, join).await;
    outcome
}

async fn cmd_bind(busid: &str) -> Result<()> {
    if !protocol::is_valid_bus_id(busid) {
        return Err(anyhow!("'{}' is not a valid bus id (expected e.g. 1-1)", busid));
    }

    let (backend, join) = start_backend()?;
    let devices = backend.list_devices().await;
    stop_backend(backend, join).await;

    let devices = devices.map_err(|e| anyhow!("Failed to enumerate devices: {}", e))?;
    if !devices.iter().any(|d| d.bus_id == busid) {
        return Err(anyhow!("Device {} not found", busid));
    }

    let mut config = ServerConfig::load_or_default();
    if config.allowed_devices.iter().any(|b| b == busid) {
        println!("Device {} is already bound.", busid);
        return Ok(());
    }
    config.allowed_devices.push(busid.to_string());
    config.save(&ServerConfig::default_path())?;
    println!("Device {} bound.", busid);
    Ok(())
}

fn cmd_unbind(busid: &str) -> Result<()> {
    let mut config = ServerConfig::load_or_default();
    let before = config.allowed_devices.len();
    config
        .allowed_devices
        .retain(|b| b != busid && !b.starts_with(&format!("{}-", busid)));

    if config.allowed_devices.len() == before {
        // Idempotent: not an error
        println!("Device {} was not bound.", busid);
        return Ok(());
    }

    config.save(&ServerConfig::default_path())?;
    println!("Device {} unbound.", busid);
    Ok(())
}

fn cmd_status(detailed: bool, health: bool) -> Result<()> {
    let status = DaemonStatus::read_from(&ServerConfig::default_status_path());

    let Some(status) = status else {
        println!("usbipd is not running.");
        if health {
            return Err(ServerError::NotRunning.into());
        }
        return Ok(());
    };

    let fresh = status.is_fresh();
    if !status.running || !fresh {
        println!("usbipd is not running.");
        if health {
            return Err(ServerError::NotRunning.into());
        }
        return Ok(());
    }

    println!("usbipd is running (pid {}).", status.pid);
    println!("  port:               {}", status.port);
    println!("  active connections: {}", status.active_connections);
    println!("  claimed devices:    {}", status.claimed_devices.len());
    println!("  in-flight URBs:     {}", status.in_flight_urbs);

    if detailed {
        println!("  started at:         {} (unix)", status.started_at);
        println!(
            "  uptime:             {}s",
            unix_now().saturating_sub(status.started_at)
        );
        for key in &status.claimed_devices {
            println!("    claimed: {}", key);
        }
    }
    if health {
        println!("  health:             ok");
    }
    Ok(())
}

async fn cmd_daemon(
    cli_level: Option<String>,
    foreground: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = if let Some(ref path) = config_path {
        ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    let level = cli_level.as_deref().unwrap_or(&config.log_level);
    let log_file = if foreground {
        None
    } else {
        config.log_file_path.clone()
    };
    setup_logging(level, log_file.as_deref()).context("Failed to setup logging")?;

    info!("usbipd v{}", env!("CARGO_PKG_VERSION"));

    // Refuse to run next to a live daemon
    let status_path = ServerConfig::default_status_path();
    if let Some(status) = DaemonStatus::read_from(&status_path) {
        if status.running && status.is_fresh() && status.pid != std::process::id() {
            return Err(ServerError::AlreadyRunning(status.pid).into());
        }
    }

    let (backend, worker_join) = start_backend()
        .map_err(|e| ServerError::InitializationFailed(e.to_string()))?;

    let claims = Arc::new(ClaimArbiter::new(Some(ServerConfig::default_claims_path())));
    let recovered = claims.recover(&backend).await;
    if recovered > 0 {
        info!(recovered, "recovered persisted claims");
    }

    let mut config = config;
    if config.auto_bind_devices {
        auto_bind(&backend, &mut config).await;
    }

    let shared_config = Arc::new(RwLock::new(config.clone()));
    let registry = Arc::new(DeviceRegistry::new(backend.clone(), shared_config.clone()));
    let counters = ServerCounters::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let status_task = tokio::spawn(state::run_status_writer(
        status_path,
        config.port,
        unix_now(),
        counters.clone(),
        claims.clone(),
        shutdown_rx.clone(),
    ));

    let listener = Listener::new(
        shared_config,
        backend.clone(),
        registry,
        claims.clone(),
        counters,
    );
    let tcp = listener.bind().await?;

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
            let _ = signal_tx.send(true);
        }
    });

    info!("press Ctrl+C to shut down");
    let run_result = listener.run(tcp, shutdown_rx).await;

    // Stop the status writer even when the listener failed on its own
    let _ = shutdown_tx.send(true);
    if let Err(e) = status_task.await {
        error!("status writer task failed: {}", e);
    }

    info!("shutting down USB subsystem");
    stop_backend(backend, worker_join).await;

    run_result
}

/// With auto-bind enabled, record every enumerated device in the allow-list
async fn auto_bind(backend: &BackendHandle, config: &mut ServerConfig) {
    match backend.list_devices().await {
        Ok(devices) => {
            let mut added = 0;
            for device in devices {
                if !config.allowed_devices.iter().any(|b| *b == device.bus_id) {
                    info!(bus_id = %device.bus_id, "auto-binding device");
                    config.allowed_devices.push(device.bus_id.clone());
                    added += 1;
                }
            }
            if added > 0 {
                if let Err(e) = config.save(&ServerConfig::default_path()) {
                    warn!("failed to persist auto-bound devices: {:#}", e);
                }
            }
        }
        Err(e) => warn!("auto-bind enumeration failed: {}", e),
    }
}

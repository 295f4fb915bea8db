//! gc-usb-proxy
//!
//! Opens every connected GameCube adapter, hands it to the virtualization
//! engine and drives each slot with an in-process client thread.

use anyhow::{Context, Result};
use clap::Parser;
use common::{ForeignMapper, setup_logging};
use protocol::{ClientProcess, Direction, ForeignAddr, MAX_ADAPTERS, SlotId, SlotState};
use server::capture::CaptureRecorder;
use server::config::ServerConfig;
use server::service;
#[cfg(target_os = "linux")]
use server::usb::ProcessVmMapper;
use server::usb::{AdapterHandle, Engine, list_adapters, open_adapters};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, trace, warn};

/// Pace of the in-process client's read loop
const CLIENT_POLL_INTERVAL: Duration = Duration::from_millis(8);

#[derive(Parser, Debug)]
#[command(name = "gc-usb-proxy")]
#[command(
    author,
    version,
    about = "GameCube adapter proxy - virtualize up to four USB adapters"
)]
#[command(long_about = "
Virtualizes up to four GameCube controller USB adapters. Each adapter is set
up once, then polled continuously by a dedicated dispatcher thread; clients
read the latest controller packet without ever waiting on the hardware.

EXAMPLES:
    # Run with default config
    gc-usb-proxy

    # Run with custom config
    gc-usb-proxy --config /path/to/server.toml

    # List connected adapters and exit
    gc-usb-proxy --list-adapters

    # Run as systemd service
    gc-usb-proxy --service

    # Run with debug logging
    gc-usb-proxy --log-level debug

CONFIGURATION:
    The service looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/gc-usb-proxy/server.toml
    3. /etc/gc-usb-proxy/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service
    #[arg(long)]
    service: bool,

    /// List connected adapters and exit
    #[arg(long)]
    list_adapters: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("gc-usb-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_adapters {
        return list_adapters_mode(&config);
    }

    if args.service || config.server.service_mode {
        info!("Running in service mode");
    }
    run(config).await
}

fn list_adapters_mode(config: &ServerConfig) -> Result<()> {
    let adapters = list_adapters(config.device.vendor_id, config.device.product_id)
        .context("Failed to enumerate USB devices")?;

    if adapters.is_empty() {
        println!(
            "No adapters ({:04x}:{:04x}) found.",
            config.device.vendor_id, config.device.product_id
        );
    } else {
        println!("Found {} adapter(s):\n", adapters.len());
        for adapter in adapters {
            println!(
                "  {:04x}:{:04x}  Bus {:03} Device {:03}",
                adapter.vendor_id, adapter.product_id, adapter.bus, adapter.address
            );
        }
    }
    Ok(())
}

async fn run(config: ServerConfig) -> Result<()> {
    let capture = if config.capture.enabled {
        let path = config.capture.resolved_path();
        info!("Capturing engine calls to {}", path.display());
        Some(CaptureRecorder::create(&path)?)
    } else {
        None
    };

    let engine = Arc::new(
        Engine::start(
            config.profile(),
            config.engine_settings(),
            client_mapper()?,
            capture,
        )
        .context("Failed to start engine")?,
    );

    let adapters = open_adapters(config.device.vendor_id, config.device.product_id)
        .context("Failed to open adapters")?;
    if adapters.is_empty() {
        warn!(
            "No adapters ({:04x}:{:04x}) connected",
            config.device.vendor_id, config.device.product_id
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let me = ClientProcess(std::process::id() as u64);
    let mut clients = Vec::new();
    for interface in adapters {
        let name = interface.name().to_string();
        let handle = match engine.open_adapter(me, Box::new(interface)) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Adapter {} not served: {}", name, e);
                continue;
            }
        };
        info!("Adapter {} bound to {}", name, handle.slot());
        clients.push(spawn_local_client(
            Arc::clone(&engine),
            handle,
            Arc::clone(&stop),
            config.device.read_size,
            config.device.begin_polling_packet.clone(),
        )?);
    }

    let watchdog = service::spawn_watchdog_task();
    let monitor = config
        .monitor_interval()
        .map(|interval| spawn_monitor(Arc::clone(&engine), interval));

    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status(&format!(
        "Serving {} of {} adapter slots",
        clients.len(),
        MAX_ADAPTERS
    ))
    .context("Failed to send status to systemd")?;

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    service::notify_stopping().context("Failed to notify systemd stopping")?;
    if let Some(handle) = watchdog {
        handle.abort();
    }
    if let Some(handle) = monitor {
        handle.abort();
    }

    stop.store(true, Ordering::SeqCst);
    let result = tokio::task::spawn_blocking(move || {
        for client in clients {
            if client.join().is_err() {
                error!("Client thread panicked");
            }
        }
        engine.shutdown()
    })
    .await
    .context("Shutdown task failed")?;
    result.context("Engine stopped with an error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Foreign-memory access for client packet buffers
#[cfg(target_os = "linux")]
fn client_mapper() -> Result<Box<dyn ForeignMapper>> {
    Ok(Box::new(ProcessVmMapper::new()))
}

#[cfg(not(target_os = "linux"))]
fn client_mapper() -> Result<Box<dyn ForeignMapper>> {
    anyhow::bail!("Client memory access is only supported on Linux")
}

/// Drive one slot the way an emulated client would
fn spawn_local_client(
    engine: Arc<Engine>,
    handle: AdapterHandle,
    stop: Arc<AtomicBool>,
    read_size: usize,
    begin_polling_packet: Vec<u8>,
) -> Result<JoinHandle<()>> {
    let slot = handle.slot();
    std::thread::Builder::new()
        .name(format!("gc-client-{}", slot.0))
        .spawn(move || {
            if let Err(e) = poll_slot(&engine, slot, &stop, read_size, begin_polling_packet) {
                error!("{}: client stopped: {}", slot, e);
            }
            if let Err(e) = engine.close_adapter(slot) {
                debug!("{}: close skipped: {}", slot, e);
            }
            drop(handle);
        })
        .context("Failed to spawn client thread")
}

fn poll_slot(
    engine: &Engine,
    slot: SlotId,
    stop: &AtomicBool,
    read_size: usize,
    begin_polling_packet: Vec<u8>,
) -> server::usb::Result<()> {
    let mut read_buffer = vec![0u8; read_size];
    let mut write_buffer = begin_polling_packet;
    let read_addr = ForeignAddr(read_buffer.as_mut_ptr() as u64);
    let write_addr = ForeignAddr(write_buffer.as_mut_ptr() as u64);

    engine.map_packet_buffer(slot, Direction::Read, read_addr)?;
    engine.map_packet_buffer(slot, Direction::Write, write_addr)?;
    engine.write_packet(slot, write_addr, write_buffer.len())?;

    let mut last_status = None;
    while !stop.load(Ordering::SeqCst) {
        let report = engine.read_packet(slot, read_addr, read_size)?;
        if last_status != Some(report.status) {
            debug!("{}: read status {}", slot, report.status);
            last_status = Some(report.status);
        }
        trace!("{}: {}", slot, hex(&read_buffer));

        if engine.slot_state(slot)? == SlotState::Finalizing {
            info!("{}: adapter disconnected", slot);
            break;
        }
        std::thread::sleep(CLIENT_POLL_INTERVAL);
    }
    Ok(())
}

fn spawn_monitor(engine: Arc<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let state = engine.adapter_packet_state();
            for i in 0..MAX_ADAPTERS {
                let slot = SlotId(i as u32);
                if state.is_in_use(slot) {
                    info!("{}: {}", slot, hex(&state.packets[i]));
                }
            }
        }
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

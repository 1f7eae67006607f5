//! Veil Host: tunnel controller demo host
//!
//! Loads a tunnel configuration, initializes logging and runs a controller
//! against the loopback relay engine and an in-memory tunnel interface.
//!
//! ```text
//! veil-host [config.toml]
//! ```
//!
//! Session history and credentials are kept under `$VEIL_DATA_DIR`
//! (default `./veil-data`).

mod logging;
mod loopback;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use veil_stats::format_bytes;
use veil_tunnel::{
    FileCredentialStore, MemoryInterface, MemoryInterfaceHandle, Packet, ProcessProbe,
    SessionStore, TunnelConfiguration, TunnelController, TunnelEvent,
};

use crate::loopback::LoopbackRelay;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const HANDSHAKE: Duration = Duration::from_millis(300);
const DEMO_PACKET_INTERVAL: Duration = Duration::from_millis(200);

fn load_configuration() -> Result<TunnelConfiguration> {
    match std::env::args_os().nth(1) {
        Some(path) => {
            let path = PathBuf::from(path);
            TunnelConfiguration::from_toml_file(&path)
                .with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(TunnelConfiguration::new("loopback", "127.0.0.1", 8388)),
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os("VEIL_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("veil-data"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let configuration = load_configuration()?;
    logging::init(configuration.log_level);

    info!("Veil host starting...");
    info!("Using mimalloc allocator");

    let data_dir = data_dir();
    let session_log = data_dir.join("sessions.json");
    let store = SessionStore::open(&session_log).context("opening session log")?;
    info!("{} sessions on record", store.len());

    let (interface, packets) = MemoryInterface::new();
    let controller = TunnelController::builder(
        Arc::new(LoopbackRelay::new(HANDSHAKE)),
        Arc::new(interface),
    )
    .with_configuration(configuration)
    .with_session_store(store)
    .with_credentials(Arc::new(FileCredentialStore::new(
        data_dir.join("credentials.json"),
    )))
    .with_performance_probe(Arc::new(ProcessProbe::current()))
    .spawn();

    let printer = tokio::spawn(print_events(controller.subscribe()));
    let traffic = tokio::spawn(generate_traffic(packets));

    if let Err(e) = controller.connect().await {
        error!("Connect failed: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutting down");

    traffic.abort();
    controller.shutdown().await;
    drop(controller);
    let _ = printer.await;

    let history = SessionStore::open(&session_log)
        .context("reloading session log")?
        .statistics();
    info!(
        "{} sessions, {} received, {} sent",
        history.total_sessions,
        format_bytes(history.total_bytes_received),
        format_bytes(history.total_bytes_sent)
    );
    info!("Veil host shut down");
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<TunnelEvent>) {
    loop {
        match events.recv().await {
            Ok(TunnelEvent::StatusChanged { previous, status }) => {
                info!("status: {} -> {}", previous, status);
            }
            Ok(TunnelEvent::Traffic { received, sent }) => {
                info!("traffic: +{} / +{}", format_bytes(received), format_bytes(sent));
            }
            Ok(TunnelEvent::WillReconnect {
                attempt,
                max_attempts,
                delay,
            }) => {
                info!("reconnecting in {:?} ({}/{})", delay, attempt, max_attempts);
            }
            Ok(TunnelEvent::Error(e)) => warn!("{}: {}", e.kind(), e),
            Ok(TunnelEvent::SessionClosed(record)) => {
                info!(
                    "session {} closed: {:?}, {}",
                    record.id,
                    record.duration(),
                    record.traffic()
                );
            }
            Ok(TunnelEvent::NetworkChanged {
                available,
                link_type,
            }) => {
                info!("network: available={} link={}", available, link_type);
            }
            Err(RecvError::Lagged(skipped)) => warn!("{} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Feed the in-memory interface with packets and drain what comes back
async fn generate_traffic(mut packets: MemoryInterfaceHandle) {
    let mut interval = tokio::time::interval(DEMO_PACKET_INTERVAL);
    let mut sequence: u32 = 0;
    loop {
        interval.tick().await;
        sequence = sequence.wrapping_add(1);
        let payload = sequence.to_be_bytes().repeat(64);
        if !packets.inject(Packet::new(payload, 2)) {
            break;
        }
        while packets.try_written().is_some() {}
    }
}

//! Packet Relay Loop
//!
//! Moves packets between the tunnel interface and the relay engine:
//!
//! 1. Read a batch from the interface
//! 2. Hand each packet to [`RelayEngine::process_packet`]
//! 3. Write the produced packets back with the same protocol number
//! 4. Read again
//!
//! The loop only ends when cancelled. Interface faults are reported through a
//! callback and followed by a short back-off; a packet the engine rejects is
//! dropped and counted. An empty batch is followed by a brief pause so an
//! interface that never blocks cannot spin the loop.

use crate::error::TunnelError;
use crate::interface::{Packet, TunnelInterface};
use crate::probe::InterfaceCounters;
use crate::relay::RelayEngine;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use veil_stats::TrafficStats;

/// Pause after a read or write fault
pub const FAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Pause after a read returned no packets
pub const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(10);

/// Packet and byte counters maintained by the relay loop.
///
/// Bytes read from the interface leave the host (sent); bytes written back
/// arrive at the host (received).
#[derive(Debug, Default)]
pub struct PacketCounters {
    packets_read: AtomicU64,
    bytes_read: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`PacketCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketCountersSnapshot {
    pub packets_read: u64,
    pub bytes_read: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub dropped: u64,
}

impl PacketCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PacketCountersSnapshot {
        PacketCountersSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record_read(&self, bytes: usize) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_written(&self, packets: usize, bytes: usize) {
        self.packets_written
            .fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl InterfaceCounters for PacketCounters {
    fn read(&self) -> Result<TrafficStats, TunnelError> {
        Ok(TrafficStats::new(
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
        ))
    }
}

/// Run the relay loop until `cancel` fires
pub async fn run_relay_loop<F>(
    interface: Arc<dyn TunnelInterface>,
    engine: Arc<dyn RelayEngine>,
    counters: Arc<PacketCounters>,
    cancel: CancellationToken,
    on_fault: F,
) where
    F: Fn(TunnelError) + Send,
{
    debug!("Packet relay loop started");

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = interface.read_packets() => read,
        };

        let packets = match read {
            Ok(packets) => packets,
            Err(e) => {
                warn!("Tunnel read failed: {}", e);
                on_fault(e);
                if backoff(&cancel, FAULT_BACKOFF).await {
                    continue;
                }
                break;
            }
        };

        if packets.is_empty() {
            if backoff(&cancel, EMPTY_READ_BACKOFF).await {
                continue;
            }
            break;
        }

        let mut processed = Vec::with_capacity(packets.len());
        for packet in packets {
            counters.record_read(packet.len());
            match engine.process_packet(&packet.data, packet.protocol) {
                Ok(Some(data)) => processed.push(Packet::new(data, packet.protocol)),
                Ok(None) => {}
                Err(e) => {
                    counters.record_dropped();
                    debug!(
                        "Dropped {} byte packet (protocol {}): {}",
                        packet.len(),
                        packet.protocol,
                        e
                    );
                }
            }
        }

        if processed.is_empty() {
            continue;
        }

        let count = processed.len();
        let bytes: usize = processed.iter().map(Packet::len).sum();
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = interface.write_packets(processed) => written,
        };

        match written {
            Ok(()) => counters.record_written(count, bytes),
            Err(e) => {
                warn!("Tunnel write failed: {}", e);
                on_fault(e);
                if !backoff(&cancel, FAULT_BACKOFF).await {
                    break;
                }
            }
        }
    }

    debug!("Packet relay loop stopped");
}

/// Sleep for `pause`. Returns `false` if cancelled meanwhile.
async fn backoff(cancel: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(pause) => true,
    }
}

/// A spawned relay loop. Cancelled on drop.
pub(crate) struct PacketLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PacketLoop {
    pub fn spawn<F>(
        interface: Arc<dyn TunnelInterface>,
        engine: Arc<dyn RelayEngine>,
        counters: Arc<PacketCounters>,
        on_fault: F,
    ) -> Self
    where
        F: Fn(TunnelError) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_relay_loop(
            interface,
            engine,
            counters,
            cancel.clone(),
            on_fault,
        ));
        Self { cancel, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PacketLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! Tunnel interface boundary
//!
//! The host platform owns the virtual network device. The controller only
//! sees batches of raw packets tagged with their protocol number.

use crate::error::TunnelError;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Largest batch [`MemoryInterface`] hands out per read
const MEMORY_BATCH_SIZE: usize = 64;

/// A raw packet with its protocol number (address family)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub protocol: u32,
}

impl Packet {
    pub fn new(data: impl Into<Vec<u8>>, protocol: u32) -> Self {
        Self {
            data: data.into(),
            protocol,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Read/write access to the OS tunnel device
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    /// Wait for the next batch of outbound packets.
    ///
    /// An empty batch is allowed; callers simply read again.
    async fn read_packets(&self) -> Result<Vec<Packet>, TunnelError>;

    /// Deliver processed packets back to the OS.
    async fn write_packets(&self, packets: Vec<Packet>) -> Result<(), TunnelError>;
}

/// In-process tunnel interface backed by channels.
///
/// Packets pushed through the [`MemoryInterfaceHandle`] come out of
/// `read_packets`; packets written to the interface come out of the handle.
pub struct MemoryInterface {
    inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
    outbound: mpsc::UnboundedSender<Packet>,
}

/// Host side of a [`MemoryInterface`]
pub struct MemoryInterfaceHandle {
    inject: mpsc::UnboundedSender<Packet>,
    written: mpsc::UnboundedReceiver<Packet>,
}

impl MemoryInterface {
    pub fn new() -> (Self, MemoryInterfaceHandle) {
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        (
            Self {
                inbound: Mutex::new(inbound),
                outbound,
            },
            MemoryInterfaceHandle { inject, written },
        )
    }
}

#[async_trait]
impl TunnelInterface for MemoryInterface {
    async fn read_packets(&self) -> Result<Vec<Packet>, TunnelError> {
        let mut inbound = self.inbound.lock().await;
        let Some(first) = inbound.recv().await else {
            // Host side is gone: nothing will ever arrive
            drop(inbound);
            std::future::pending::<()>().await;
            return Ok(Vec::new());
        };

        let mut batch = vec![first];
        while batch.len() < MEMORY_BATCH_SIZE {
            match inbound.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn write_packets(&self, packets: Vec<Packet>) -> Result<(), TunnelError> {
        for packet in packets {
            self.outbound
                .send(packet)
                .map_err(|_| TunnelError::Connection("tunnel interface closed".into()))?;
        }
        Ok(())
    }
}

impl MemoryInterfaceHandle {
    /// Queue a packet as if the OS had captured it.
    pub fn inject(&self, packet: Packet) -> bool {
        self.inject.send(packet).is_ok()
    }

    /// Next packet written back by the tunnel.
    pub async fn next_written(&mut self) -> Option<Packet> {
        self.written.recv().await
    }

    /// Written packet if one is already queued.
    pub fn try_written(&mut self) -> Option<Packet> {
        self.written.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_interface_batches() {
        let (interface, mut handle) = MemoryInterface::new();
        handle.inject(Packet::new(vec![1], 2));
        handle.inject(Packet::new(vec![2], 30));

        let batch = interface.read_packets().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].protocol, 30);

        interface
            .write_packets(vec![Packet::new(vec![9, 9], 2)])
            .await
            .unwrap();
        let written = handle.next_written().await.unwrap();
        assert_eq!(written.data, vec![9, 9]);
        assert!(handle.try_written().is_none());
    }
}

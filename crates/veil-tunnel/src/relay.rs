//! Relay engine boundary
//!
//! The relay engine encrypts, obfuscates and forwards tunneled traffic. The
//! controller treats it as an opaque capability: start it, stop it, hand it
//! packets, and listen to its status through a [`RelaySink`].

use crate::config::TunnelConfiguration;
use crate::controller::Command;
use crate::error::TunnelError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything the relay engine needs to start
pub struct StartRequest {
    pub configuration: Arc<TunnelConfiguration>,
    /// Proxy password resolved from the credential store
    pub proxy_password: Option<Vec<u8>>,
    /// Where to report status for this start
    pub sink: RelaySink,
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("configuration", &self.configuration.name)
            .field(
                "proxy_password",
                &self.proxy_password.as_ref().map(|_| "[redacted]"),
            )
            .field("epoch", &self.sink.epoch)
            .finish()
    }
}

/// Local relay engine
pub trait RelayEngine: Send + Sync {
    /// Begin connecting. `Ok` means the engine is ready to process packets;
    /// the tunnel is established once it calls [`RelaySink::connected`].
    fn start(&self, request: StartRequest) -> Result<(), TunnelError>;

    /// Tear down. The engine answers with [`RelaySink::stopped`].
    fn stop(&self);

    /// Transform one packet. `None` means nothing to write back.
    fn process_packet(&self, data: &[u8], protocol: u32) -> Result<Option<Vec<u8>>, TunnelError>;

    /// Average round-trip latency, if the engine measures it
    fn average_latency(&self) -> Option<Duration> {
        None
    }
}

/// Status reported by the relay engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RelayEvent {
    Connected,
    Failed(TunnelError),
    Stopped,
}

/// Status callback handed to the relay engine on every start.
///
/// Each sink is tagged with the epoch of the start that created it; the
/// controller ignores reports from older epochs.
#[derive(Clone)]
pub struct RelaySink {
    epoch: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl RelaySink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { epoch, tx }
    }

    /// Epoch of the start this sink belongs to
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Tunnel established
    pub fn connected(&self) {
        self.send(RelayEvent::Connected);
    }

    /// Tunnel failed to establish or dropped
    pub fn failed(&self, error: TunnelError) {
        self.send(RelayEvent::Failed(error));
    }

    /// Engine finished stopping
    pub fn stopped(&self) {
        self.send(RelayEvent::Stopped);
    }

    fn send(&self, event: RelayEvent) {
        // Controller gone: nothing left to notify
        let _ = self.tx.send(Command::Relay {
            epoch: self.epoch,
            event,
        });
    }
}

impl fmt::Debug for RelaySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySink").field("epoch", &self.epoch).finish()
    }
}

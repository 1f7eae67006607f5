//! Events published by the tunnel controller.

use crate::error::TunnelError;
use crate::monitor::LinkType;
use crate::status::TunnelStatus;
use std::time::Duration;
use veil_stats::SessionRecord;

/// Events sent from the controller to subscribers.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// Status transition
    StatusChanged {
        previous: TunnelStatus,
        status: TunnelStatus,
    },
    /// Bytes moved since the previous sample
    Traffic { received: u64, sent: u64 },
    /// A reconnect has been scheduled
    WillReconnect {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// Something went wrong; lifecycle errors arrive after the transition
    /// to `disconnected`
    Error(TunnelError),
    /// A session was closed and appended to the session log
    SessionClosed(SessionRecord),
    /// Host connectivity changed
    NetworkChanged { available: bool, link_type: LinkType },
}

impl TunnelEvent {
    /// The error carried by this event, if any
    pub fn error(&self) -> Option<&TunnelError> {
        match self {
            TunnelEvent::Error(e) => Some(e),
            _ => None,
        }
    }
}

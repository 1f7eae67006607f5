//! Tunnel status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Platform reported an unrecoverable condition
    Invalid,
    /// Not connected and not attempting to connect
    #[default]
    Disconnected,
    /// Relay engine is starting
    Connecting,
    /// Tunnel is established
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Transient re-negotiation signaled by the platform
    Reasserting,
}

impl TunnelStatus {
    /// Connecting, connected or reasserting
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Connecting | TunnelStatus::Connected | TunnelStatus::Reasserting
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelStatus::Connected)
    }

    /// Disconnected or invalid
    pub fn is_disconnected(&self) -> bool {
        matches!(self, TunnelStatus::Disconnected | TunnelStatus::Invalid)
    }

    /// A session is open in these states.
    pub fn has_session(&self) -> bool {
        matches!(self, TunnelStatus::Connected | TunnelStatus::Reasserting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Invalid => "invalid",
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnecting => "disconnecting",
            TunnelStatus::Reasserting => "reasserting",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        use TunnelStatus::*;

        let active: Vec<_> = [Invalid, Disconnected, Connecting, Connected, Disconnecting, Reasserting]
            .into_iter()
            .filter(TunnelStatus::is_active)
            .collect();
        assert_eq!(active, vec![Connecting, Connected, Reasserting]);

        assert!(Connected.is_connected());
        assert!(!Reasserting.is_connected());
        assert!(Disconnected.is_disconnected());
        assert!(Invalid.is_disconnected());
        assert!(!Disconnecting.is_disconnected());
        assert!(!Disconnecting.is_active());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TunnelStatus::Reasserting).unwrap(),
            "\"reasserting\""
        );
        let parsed: TunnelStatus = serde_json::from_str("\"disconnecting\"").unwrap();
        assert_eq!(parsed, TunnelStatus::Disconnecting);
        assert_eq!(TunnelStatus::Connected.to_string(), "connected");
    }
}

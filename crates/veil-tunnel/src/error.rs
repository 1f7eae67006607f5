//! Tunnel errors

use veil_stats::StoreError;

/// Errors surfaced by the tunnel controller and its collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Obfuscation error: {0}")]
    Obfuscation(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Maximum reconnect attempts reached")]
    MaxReconnectAttemptsReached,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl TunnelError {
    /// Retrying with the same configuration cannot succeed.
    ///
    /// These never count against the reconnect budget.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TunnelError::Configuration(_) | TunnelError::Authentication(_)
        )
    }

    /// Stable identifier for the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::NetworkUnavailable => "networkUnavailable",
            TunnelError::Configuration(_) => "configurationError",
            TunnelError::Connection(_) => "connectionError",
            TunnelError::Authentication(_) => "authenticationError",
            TunnelError::Protocol(_) => "protocolError",
            TunnelError::Encryption(_) => "encryptionError",
            TunnelError::Obfuscation(_) => "obfuscationError",
            TunnelError::Timeout => "timeoutError",
            TunnelError::MaxReconnectAttemptsReached => "maxReconnectAttemptsReached",
            TunnelError::Unknown(_) => "unknownError",
        }
    }

    pub(crate) fn stopped() -> Self {
        TunnelError::Unknown("tunnel controller has shut down".into())
    }
}

impl From<StoreError> for TunnelError {
    fn from(e: StoreError) -> Self {
        TunnelError::Unknown(format!("session log: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors() {
        assert!(TunnelError::Configuration("x".into()).is_terminal());
        assert!(TunnelError::Authentication("x".into()).is_terminal());
        assert!(!TunnelError::Timeout.is_terminal());
        assert!(!TunnelError::Connection("x".into()).is_terminal());
        assert!(!TunnelError::NetworkUnavailable.is_terminal());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(TunnelError::Timeout.kind(), "timeoutError");
        assert_eq!(
            TunnelError::Obfuscation("bad".into()).kind(),
            "obfuscationError"
        );
        assert_eq!(
            TunnelError::Configuration("no server".into()).to_string(),
            "Configuration error: no server"
        );
    }
}

//! Tunnel Configuration
//!
//! Immutable description of one tunnel: server, relay parameters, optional
//! DNS and upstream proxy settings, and the lifecycle policy (timeouts,
//! reconnect budget, sampling cadence, logging).
//!
//! Durations are serialized as integer milliseconds.

use crate::error::TunnelError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LOG_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

const MIN_MTU: u16 = 576;
const MAX_MTU: u16 = 9000;

/// DNS settings pushed into the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSettings {
    /// DNS server addresses
    pub servers: Vec<String>,
    #[serde(default)]
    pub search_domains: Vec<String>,
    /// Only resolve the search domains through the tunnel
    #[serde(default)]
    pub split_dns: bool,
}

impl DnsSettings {
    /// Parsed server addresses
    pub fn server_addrs(&self) -> Result<Vec<IpAddr>, TunnelError> {
        self.servers
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| TunnelError::Configuration(format!("invalid DNS server '{}'", s)))
            })
            .collect()
    }
}

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

/// Proxy username plus the credential-store key holding its password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCredentials {
    pub username: String,
    pub password_key: String,
}

/// Upstream proxy the relay engine dials through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ProxyCredentials>,
}

/// Logging verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing` filters
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfiguration {
    /// Display name
    pub name: String,
    /// Relay server host or IP
    pub server_address: String,
    pub port: u16,
    /// Cipher method identifier passed to the relay engine
    pub cipher: String,
    /// Protocol identifier passed to the relay engine
    pub protocol: String,
    /// Obfuscation identifier ("plain" for none)
    #[serde(default = "default_obfuscation")]
    pub obfuscation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfuscation_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    #[serde(default)]
    pub compression: bool,
    /// Retry automatically after failures and network restores
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(rename = "reconnectDelayMs", with = "millis", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
    #[serde(rename = "connectTimeoutMs", with = "millis", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(rename = "samplingIntervalMs", with = "millis", default = "default_sampling_interval")]
    pub sampling_interval: Duration,
    #[serde(default)]
    pub log_level: LogLevel,
    /// How long closed sessions stay in the session log
    #[serde(rename = "logRetentionMs", with = "millis", default = "default_log_retention")]
    pub log_retention: Duration,
}

fn default_obfuscation() -> String {
    "plain".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_delay() -> Duration {
    DEFAULT_RECONNECT_DELAY
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_sampling_interval() -> Duration {
    DEFAULT_SAMPLING_INTERVAL
}

fn default_log_retention() -> Duration {
    DEFAULT_LOG_RETENTION
}

impl TunnelConfiguration {
    /// Create a configuration with default policy values
    pub fn new(name: impl Into<String>, server_address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            server_address: server_address.into(),
            port,
            cipher: "chacha20-ietf-poly1305".to_string(),
            protocol: "origin".to_string(),
            obfuscation: default_obfuscation(),
            obfuscation_param: None,
            dns: None,
            proxy: None,
            mtu: None,
            compression: false,
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            log_level: LogLevel::default(),
            log_retention: DEFAULT_LOG_RETENTION,
        }
    }

    /// Builder method to set cipher and protocol
    pub fn with_cipher(mut self, cipher: impl Into<String>, protocol: impl Into<String>) -> Self {
        self.cipher = cipher.into();
        self.protocol = protocol.into();
        self
    }

    /// Builder method to set obfuscation
    pub fn with_obfuscation(mut self, id: impl Into<String>, param: Option<String>) -> Self {
        self.obfuscation = id.into();
        self.obfuscation_param = param;
        self
    }

    pub fn with_dns(mut self, dns: DnsSettings) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Builder method to set the reconnect policy
    pub fn with_reconnect(mut self, enabled: bool, max_attempts: u32, delay: Duration) -> Self {
        self.auto_reconnect = enabled;
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    pub fn with_logging(mut self, level: LogLevel, retention: Duration) -> Self {
        self.log_level = level;
        self.log_retention = retention;
        self
    }

    /// `host:port` of the relay server
    pub fn endpoint(&self) -> String {
        if self.server_address.contains(':') && !self.server_address.starts_with('[') {
            format!("[{}]:{}", self.server_address, self.port)
        } else {
            format!("{}:{}", self.server_address, self.port)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TunnelError> {
        fn require(value: &str, field: &str) -> Result<(), TunnelError> {
            if value.trim().is_empty() {
                Err(TunnelError::Configuration(format!("{} is empty", field)))
            } else {
                Ok(())
            }
        }

        require(&self.name, "name")?;
        require(&self.server_address, "server address")?;
        require(&self.cipher, "cipher")?;
        require(&self.protocol, "protocol")?;

        if self.port == 0 {
            return Err(TunnelError::Configuration("server port is 0".into()));
        }
        if let Some(mtu) = self.mtu {
            if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
                return Err(TunnelError::Configuration(format!(
                    "MTU {} outside {}..={}",
                    mtu, MIN_MTU, MAX_MTU
                )));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(TunnelError::Configuration("connect timeout is zero".into()));
        }
        if self.sampling_interval.is_zero() {
            return Err(TunnelError::Configuration("sampling interval is zero".into()));
        }
        if let Some(dns) = &self.dns {
            dns.server_addrs()?;
        }
        if let Some(proxy) = &self.proxy {
            require(&proxy.host, "proxy host")?;
            if proxy.port == 0 {
                return Err(TunnelError::Configuration("proxy port is 0".into()));
            }
            if let Some(credentials) = &proxy.credentials {
                require(&credentials.username, "proxy username")?;
                require(&credentials.password_key, "proxy password key")?;
            }
        }
        Ok(())
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, TunnelError> {
        let content = read_file(path)?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, TunnelError> {
        toml::from_str(content).map_err(|e| TunnelError::Configuration(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, TunnelError> {
        let content = read_file(path)?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(content).map_err(|e| TunnelError::Configuration(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, TunnelError> {
        toml::to_string_pretty(self).map_err(|e| TunnelError::Configuration(e.to_string()))
    }
}

fn read_file(path: &Path) -> Result<String, TunnelError> {
    std::fs::read_to_string(path)
        .map_err(|e| TunnelError::Configuration(format!("{}: {}", path.display(), e)))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TunnelConfiguration {
        TunnelConfiguration::new("home", "vpn.example.com", 8388)
    }

    #[test]
    fn test_defaults_validate() {
        let config = config();
        assert!(config.validate().is_ok());
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.sampling_interval, Duration::from_secs(1));
        assert_eq!(config.endpoint(), "vpn.example.com:8388");
    }

    #[test]
    fn test_ipv6_endpoint() {
        let config = TunnelConfiguration::new("v6", "2001:db8::1", 443);
        assert_eq!(config.endpoint(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = vec![
            TunnelConfiguration::new("x", "", 1),
            TunnelConfiguration::new("x", "host", 0),
            config().with_mtu(100),
            config().with_connect_timeout(Duration::ZERO),
            config().with_sampling_interval(Duration::ZERO),
            config().with_cipher("", "origin"),
            config().with_dns(DnsSettings {
                servers: vec!["not-an-ip".into()],
                ..Default::default()
            }),
            config().with_proxy(ProxySettings {
                host: "proxy".into(),
                port: 0,
                kind: ProxyKind::Socks5,
                credentials: None,
            }),
            config().with_proxy(ProxySettings {
                host: "proxy".into(),
                port: 1080,
                kind: ProxyKind::Http,
                credentials: Some(ProxyCredentials {
                    username: "user".into(),
                    password_key: " ".into(),
                }),
            }),
        ];

        for case in cases {
            let err = case.validate().unwrap_err();
            assert!(matches!(err, TunnelError::Configuration(_)), "{:?}", case);
        }
    }

    #[test]
    fn test_from_toml_with_defaults() {
        let config = TunnelConfiguration::from_toml(
            r#"
            name = "office"
            serverAddress = "10.1.2.3"
            port = 443
            cipher = "aes-256-gcm"
            protocol = "origin"
            maxReconnectAttempts = 5
            reconnectDelayMs = 250
            logLevel = "debug"

            [dns]
            servers = ["1.1.1.1", "9.9.9.9"]
            splitDns = true
            "#,
        )
        .unwrap();

        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.obfuscation, "plain");
        assert_eq!(config.log_level, LogLevel::Debug);
        let dns = config.dns.as_ref().unwrap();
        assert!(dns.split_dns);
        assert_eq!(dns.server_addrs().unwrap().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_millis() {
        let original = config().with_reconnect(false, 0, Duration::from_millis(1500));
        let json = serde_json::to_value(&original).unwrap();
        assert_eq!(json["reconnectDelayMs"], 1500);

        let parsed: TunnelConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_missing_required_field() {
        let err = TunnelConfiguration::from_json(r#"{"name":"x"}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Configuration(_)));
    }

    #[test]
    fn test_log_level_directive() {
        assert_eq!(LogLevel::Warning.as_directive(), "warn");
        assert!(LogLevel::Debug < LogLevel::Error);
    }
}

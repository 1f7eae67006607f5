//! Veil Tunnel - VPN tunnel lifecycle and traffic accounting
//!
//! Owns the connect/disconnect state machine of an encrypted tunnel, reacts
//! to host reachability changes, retries with a bounded budget, meters
//! throughput and relays packets between the OS tunnel interface and a
//! local relay engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  path changes   ┌───────────────────────┐
//! │   Network    │────────────────▶│                       │──▶ events
//! │   Monitor    │                 │   Tunnel Controller   │
//! └──────────────┘                 │     (actor task)      │──▶ Session Store
//!                                  │                       │
//! ┌──────────────┐  status         └──────────┬────────────┘
//! │ Relay Engine │◀───────────────────────────┤ start / stop
//! └──────┬───────┘                            │
//!        │ process_packet          ┌──────────▼────────────┐
//!        └────────────────────────▶│   Packet Relay Loop   │◀──▶ Tunnel Interface
//!                                  └───────────────────────┘
//! ```
//!
//! The relay engine (cipher, obfuscation, wire protocol) and the tunnel
//! interface (OS packet capture) are supplied by the host.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = TunnelController::builder(engine, interface)
//!     .with_configuration(TunnelConfiguration::from_toml_file(path)?)
//!     .with_session_store(SessionStore::open("sessions.json")?)
//!     .spawn();
//!
//! let mut events = controller.subscribe();
//! controller.connect().await?;
//! ```

mod config;
mod controller;
mod credentials;
mod error;
mod event;
mod host;
mod interface;
mod message;
mod monitor;
mod packet_loop;
mod probe;
mod relay;
mod status;
mod timer;

pub use config::{
    DnsSettings, LogLevel, ProxyCredentials, ProxyKind, ProxySettings, TunnelConfiguration,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_LOG_RETENTION, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY, DEFAULT_SAMPLING_INTERVAL,
};
pub use controller::{
    ControllerBuilder, ControllerSnapshot, PlatformEvent, StatisticsReport, TunnelController,
    DEFAULT_STOP_TIMEOUT, PERFORMANCE_SAMPLE_EVERY,
};
pub use credentials::{
    CredentialError, CredentialStore, FileCredentialStore, MemoryCredentialStore,
};
pub use error::TunnelError;
pub use event::TunnelEvent;
pub use host::{
    classify_interface, ProcessProbe, SysinfoCounters, SysinfoPathSource,
    DEFAULT_PATH_POLL_INTERVAL,
};
pub use interface::{MemoryInterface, MemoryInterfaceHandle, Packet, TunnelInterface};
pub use message::{HostRequest, HostResponse};
pub use monitor::{
    LinkType, ManualPathSource, NetworkCallback, NetworkMonitor, NetworkPath, PathSource,
};
pub use packet_loop::{run_relay_loop, PacketCounters, PacketCountersSnapshot, FAULT_BACKOFF};
pub use probe::{InterfaceCounters, PerformanceProbe, ProcessUsage};
pub use relay::{RelayEngine, RelaySink, StartRequest};
pub use status::TunnelStatus;

pub use veil_stats::{SessionRecord, SessionStatistics, SessionStore, TrafficStats};

//! Host probes backed by `sysinfo`
//!
//! - [`SysinfoPathSource`]: polls interfaces and publishes network paths
//! - [`SysinfoCounters`]: cumulative counters of one named interface
//! - [`ProcessProbe`]: CPU and resident memory of this process

use crate::error::TunnelError;
use crate::monitor::{LinkType, NetworkPath, PathSource};
use crate::probe::{InterfaceCounters, PerformanceProbe, ProcessUsage};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Networks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use veil_stats::TrafficStats;

/// How often to poll interfaces
pub const DEFAULT_PATH_POLL_INTERVAL: Duration = Duration::from_secs(2);

// Name prefixes follow Linux and Android conventions. macOS `enN` carries no
// link type in its name and classifies as unknown.

/// Virtual devices that never count as host connectivity
const VIRTUAL_PREFIXES: &[&str] = &[
    "lo", "utun", "tun", "tap", "wg", "veth", "docker", "br-", "virbr", "vmnet", "ipsec", "awdl",
    "llw", "bridge", "gif", "stf", "anpi",
];
const WIFI_PREFIXES: &[&str] = &["wl", "wifi", "ath", "ra"];
const CELLULAR_PREFIXES: &[&str] = &["wwan", "rmnet", "ccmni", "pdp_ip", "usb"];
/// `enp`/`ens`/`eno`/`enx` are systemd predictable names for ethernet
const WIRED_PREFIXES: &[&str] = &["eth", "enp", "ens", "eno", "enx", "em"];

/// Classify an interface by name. `None` for loopback and virtual devices.
pub fn classify_interface(name: &str) -> Option<LinkType> {
    let name = name.to_ascii_lowercase();
    let has_prefix = |prefixes: &[&str]| prefixes.iter().any(|p| name.starts_with(p));

    if has_prefix(VIRTUAL_PREFIXES) {
        None
    } else if has_prefix(WIFI_PREFIXES) {
        Some(LinkType::Wifi)
    } else if has_prefix(CELLULAR_PREFIXES) {
        Some(LinkType::Cellular)
    } else if has_prefix(WIRED_PREFIXES) {
        Some(LinkType::Wired)
    } else {
        Some(LinkType::Unknown)
    }
}

fn read_path(networks: &Networks) -> NetworkPath {
    let mut interfaces: Vec<LinkType> = networks
        .list()
        .iter()
        .filter(|(_, data)| data.ip_networks().iter().any(|ip| !ip.addr.is_loopback()))
        .filter_map(|(name, _)| classify_interface(name))
        .collect();
    interfaces.sort_by_key(|link| link.as_str());
    interfaces.dedup();

    NetworkPath {
        satisfied: !interfaces.is_empty(),
        interfaces,
    }
}

/// Path source that polls host interfaces
pub struct SysinfoPathSource {
    tx: Arc<watch::Sender<NetworkPath>>,
    task: JoinHandle<()>,
}

impl SysinfoPathSource {
    /// Start polling every `poll_interval`. Requires a tokio runtime.
    pub fn spawn(poll_interval: Duration) -> Self {
        let mut networks = Networks::new_with_refreshed_list();
        let (tx, _rx) = watch::channel(read_path(&networks));
        let tx = Arc::new(tx);
        let publisher = tx.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                networks.refresh(true);
                let path = read_path(&networks);
                publisher.send_if_modified(|current| {
                    if *current == path {
                        false
                    } else {
                        debug!("Host path changed: {:?}", path);
                        *current = path;
                        true
                    }
                });
            }
        });

        info!("Polling host interfaces every {:?}", poll_interval);
        Self { tx, task }
    }
}

impl PathSource for SysinfoPathSource {
    fn subscribe(&self) -> watch::Receiver<NetworkPath> {
        self.tx.subscribe()
    }
}

impl Drop for SysinfoPathSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Counters of one OS network interface
pub struct SysinfoCounters {
    interface: String,
    networks: Mutex<Networks>,
}

impl SysinfoCounters {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl InterfaceCounters for SysinfoCounters {
    fn read(&self) -> Result<TrafficStats, TunnelError> {
        let mut networks = self.networks.lock().unwrap_or_else(PoisonError::into_inner);
        networks.refresh(true);
        networks
            .list()
            .get(&self.interface)
            .map(|data| TrafficStats::new(data.total_received(), data.total_transmitted()))
            .ok_or_else(|| {
                TunnelError::Unknown(format!("interface '{}' not found", self.interface))
            })
    }
}

/// CPU and memory of the current process
pub struct ProcessProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl ProcessProbe {
    pub fn current() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(System::new()),
        }
    }
}

impl PerformanceProbe for ProcessProbe {
    fn sample(&self) -> Option<ProcessUsage> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        system.process(self.pid).map(|process| ProcessUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

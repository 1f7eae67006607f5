//! Network Reachability Monitor
//!
//! Watches a [`PathSource`] and classifies every path change into
//! `(available, link type)`. Link types are checked in priority order:
//! wifi, then cellular, then wired.
//!
//! The latest classification is kept in atomics so it can be read
//! synchronously from any thread between events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Kind of network attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Wifi,
    Cellular,
    Wired,
    #[default]
    Unknown,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Wifi => "wifi",
            LinkType::Cellular => "cellular",
            LinkType::Wired => "wired",
            LinkType::Unknown => "unknown",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LinkType::Wifi => 0,
            LinkType::Cellular => 1,
            LinkType::Wired => 2,
            LinkType::Unknown => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkType::Wifi,
            1 => LinkType::Cellular,
            2 => LinkType::Wired,
            _ => LinkType::Unknown,
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of the host network path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPath {
    /// The host can reach the network
    pub satisfied: bool,
    /// Attachments currently in use
    pub interfaces: Vec<LinkType>,
}

impl NetworkPath {
    pub fn unsatisfied() -> Self {
        Self::default()
    }

    pub fn satisfied(interfaces: Vec<LinkType>) -> Self {
        Self {
            satisfied: true,
            interfaces,
        }
    }

    /// `(available, link type)` for this path
    pub fn classify(&self) -> (bool, LinkType) {
        if !self.satisfied {
            return (false, LinkType::Unknown);
        }
        let link = [LinkType::Wifi, LinkType::Cellular, LinkType::Wired]
            .into_iter()
            .find(|kind| self.interfaces.contains(kind))
            .unwrap_or(LinkType::Unknown);
        (true, link)
    }
}

/// Continuous host path observation
pub trait PathSource: Send + Sync {
    /// Receiver holding the current path and yielding every change
    fn subscribe(&self) -> watch::Receiver<NetworkPath>;
}

/// Path source driven by the host through [`ManualPathSource::set`].
///
/// Suited to platforms that push path updates through their own callbacks.
pub struct ManualPathSource {
    tx: watch::Sender<NetworkPath>,
}

impl ManualPathSource {
    pub fn new(initial: NetworkPath) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new path
    pub fn set(&self, path: NetworkPath) {
        self.tx.send_replace(path);
    }

    pub fn current(&self) -> NetworkPath {
        self.tx.borrow().clone()
    }
}

impl PathSource for ManualPathSource {
    fn subscribe(&self) -> watch::Receiver<NetworkPath> {
        self.tx.subscribe()
    }
}

/// Callback for reachability changes
pub type NetworkCallback = Arc<dyn Fn(bool, LinkType) + Send + Sync>;

/// Network reachability monitor
pub struct NetworkMonitor {
    source: Arc<dyn PathSource>,
    available: Arc<AtomicBool>,
    link_type: Arc<AtomicU8>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Create a monitor seeded with the source's current path
    pub fn new(source: Arc<dyn PathSource>) -> Self {
        let (available, link) = source.subscribe().borrow().classify();
        Self {
            source,
            available: Arc::new(AtomicBool::new(available)),
            link_type: Arc::new(AtomicU8::new(link.to_u8())),
            task: Mutex::new(None),
        }
    }

    /// Start observing. Returns `false` if already running.
    ///
    /// The current path refreshes the cached state without invoking
    /// `callback`; every later change invokes it.
    pub fn start<F>(&self, callback: F) -> bool
    where
        F: Fn(bool, LinkType) + Send + Sync + 'static,
    {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Network monitor already running");
            return false;
        }

        let mut rx = self.source.subscribe();
        let (available, link) = rx.borrow_and_update().classify();
        store(&self.available, &self.link_type, available, link);

        let callback: NetworkCallback = Arc::new(callback);
        let available_state = self.available.clone();
        let link_state = self.link_type.clone();

        *task = Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let (available, link) = rx.borrow_and_update().classify();
                store(&available_state, &link_state, available, link);
                debug!("Network path changed: available={} link={}", available, link);
                callback(available, link);
            }
            debug!("Path source closed");
        }));

        info!(
            "Network monitor started (available={}, link={})",
            available, link
        );
        true
    }

    /// Stop observing. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Network monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn is_network_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn current_link_type(&self) -> LinkType {
        LinkType::from_u8(self.link_type.load(Ordering::Acquire))
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn store(available: &AtomicBool, link_type: &AtomicU8, is_available: bool, link: LinkType) {
    link_type.store(link.to_u8(), Ordering::Release);
    available.store(is_available, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_classify_priority() {
        let path = NetworkPath::satisfied(vec![LinkType::Wired, LinkType::Cellular, LinkType::Wifi]);
        assert_eq!(path.classify(), (true, LinkType::Wifi));

        let path = NetworkPath::satisfied(vec![LinkType::Wired, LinkType::Cellular]);
        assert_eq!(path.classify(), (true, LinkType::Cellular));

        let path = NetworkPath::satisfied(vec![LinkType::Wired]);
        assert_eq!(path.classify(), (true, LinkType::Wired));

        let path = NetworkPath::satisfied(vec![]);
        assert_eq!(path.classify(), (true, LinkType::Unknown));

        let path = NetworkPath {
            satisfied: false,
            interfaces: vec![LinkType::Wifi],
        };
        assert_eq!(path.classify(), (false, LinkType::Unknown));
    }

    #[tokio::test]
    async fn test_monitor_reports_changes() {
        let source = Arc::new(ManualPathSource::new(NetworkPath::satisfied(vec![LinkType::Wired])));
        let monitor = NetworkMonitor::new(source.clone());
        assert!(monitor.is_network_available());
        assert_eq!(monitor.current_link_type(), LinkType::Wired);

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(monitor.start(move |available, link| {
            let _ = tx.send((available, link));
        }));

        source.set(NetworkPath::unsatisfied());
        assert_eq!(rx.recv().await, Some((false, LinkType::Unknown)));
        assert!(!monitor.is_network_available());

        source.set(NetworkPath::satisfied(vec![LinkType::Cellular]));
        assert_eq!(rx.recv().await, Some((true, LinkType::Cellular)));
        assert_eq!(monitor.current_link_type(), LinkType::Cellular);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let source = Arc::new(ManualPathSource::new(NetworkPath::unsatisfied()));
        let monitor = NetworkMonitor::new(source);

        assert!(monitor.start(|_, _| {}));
        assert!(!monitor.start(|_, _| {}));
        assert!(monitor.is_running());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());

        assert!(monitor.start(|_, _| {}));
        monitor.stop();
    }

    #[tokio::test]
    async fn test_initial_path_does_not_invoke_callback() {
        let source = Arc::new(ManualPathSource::new(NetworkPath::satisfied(vec![LinkType::Wifi])));
        let monitor = NetworkMonitor::new(source.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.start(move |available, link| {
            let _ = tx.send((available, link));
        });

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        source.set(NetworkPath::satisfied(vec![LinkType::Wired]));
        assert_eq!(rx.recv().await, Some((true, LinkType::Wired)));
    }
}

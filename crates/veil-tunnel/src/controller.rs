//! Tunnel Controller
//!
//! Owns the connection state machine. All state lives in a single actor
//! task; public calls, relay callbacks, network changes, platform signals,
//! packet-loop faults and timer firings all arrive as [`Command`]s on its
//! mailbox and are handled one at a time.
//!
//! ```text
//! disconnected ──connect──▶ connecting ──relay connected──▶ connected
//!      ▲                        │                            │   ▲
//!      │        timeout / relay failure                      │   │ platform
//!      ├────────────────────────┘                            ▼   │
//!      │                                                 reasserting
//!      └──── disconnecting ◀──── disconnect / network loss ──┘
//! ```
//!
//! Failures go through one path: tear down to `disconnected`, report the
//! error, then schedule a reconnect while the retry budget lasts.

use crate::config::TunnelConfiguration;
use crate::credentials::CredentialStore;
use crate::error::TunnelError;
use crate::event::TunnelEvent;
use crate::host::{SysinfoPathSource, DEFAULT_PATH_POLL_INTERVAL};
use crate::interface::TunnelInterface;
use crate::monitor::{LinkType, NetworkMonitor, PathSource};
use crate::packet_loop::{PacketCounters, PacketLoop};
use crate::probe::{InterfaceCounters, PerformanceProbe};
use crate::relay::{RelayEngine, RelayEvent, RelaySink, StartRequest};
use crate::status::TunnelStatus;
use crate::timer::{TimerFired, TimerKind, Timers};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use veil_stats::{
    now_millis, OpenSession, PerformanceSample, SessionStatistics, SessionStore, TrafficSample,
    TrafficStats,
};

/// How long the relay engine gets to confirm a stop
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Sampling ticks between performance samples
pub const PERFORMANCE_SAMPLE_EVERY: u64 = 10;

const EVENT_CAPACITY: usize = 256;

/// Signals from the host platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// The OS is re-negotiating the tunnel
    ReassertingStarted,
    ReassertingFinished,
    /// The tunnel cannot continue until it is reconfigured
    Unrecoverable(String),
}

/// Controller state at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSnapshot {
    pub status: TunnelStatus,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub session_id: Option<String>,
    /// Relay start counter
    pub epoch: u64,
    /// The packet relay loop is running
    pub relaying: bool,
    pub network_available: bool,
    pub link_type: LinkType,
}

/// Answer to `getStatistics`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsReport {
    pub status: TunnelStatus,
    /// Traffic of the open session
    pub current_session: Option<TrafficStats>,
    /// Latest cumulative interface counters
    pub counters: TrafficStats,
    /// Aggregates over the session log
    pub history: SessionStatistics,
}

/// Actor mailbox
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    UpdateConfiguration {
        configuration: Box<TunnelConfiguration>,
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },
    Status {
        reply: oneshot::Sender<TunnelStatus>,
    },
    Snapshot {
        reply: oneshot::Sender<ControllerSnapshot>,
    },
    Statistics {
        reply: oneshot::Sender<StatisticsReport>,
    },
    Relay {
        epoch: u64,
        event: RelayEvent,
    },
    RelayFault {
        epoch: u64,
        error: TunnelError,
    },
    Network {
        available: bool,
        link_type: LinkType,
    },
    Platform(PlatformEvent),
    Timer(TimerFired),
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

impl From<TimerFired> for Command {
    fn from(fired: TimerFired) -> Self {
        Command::Timer(fired)
    }
}

/// Handle to a running tunnel controller.
///
/// Dropping the handle shuts the controller down.
pub struct TunnelController {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TunnelEvent>,
    monitor: Arc<NetworkMonitor>,
}

impl TunnelController {
    pub fn builder(
        relay: Arc<dyn RelayEngine>,
        interface: Arc<dyn TunnelInterface>,
    ) -> ControllerBuilder {
        ControllerBuilder::new(relay, interface)
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Request a connection.
    ///
    /// Returns once the relay engine has been asked to start. Configuration,
    /// credential and reachability problems fail immediately; connection
    /// failures arrive later as events.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { reply })?;
        rx.await.map_err(|_| TunnelError::stopped())?
    }

    /// Request a disconnect. Returns once teardown has begun.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Replace the configuration, restarting the tunnel if it was active.
    ///
    /// Resolves with the first error of the stop, replace, restart sequence.
    pub async fn update_configuration(
        &self,
        configuration: TunnelConfiguration,
    ) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UpdateConfiguration {
            configuration: Box::new(configuration),
            reply,
        })?;
        rx.await.map_err(|_| TunnelError::stopped())?
    }

    pub async fn status(&self) -> TunnelStatus {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Status { reply }).is_err() {
            return TunnelStatus::Disconnected;
        }
        rx.await.unwrap_or(TunnelStatus::Disconnected)
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| TunnelError::stopped())
    }

    pub async fn statistics(&self) -> Result<StatisticsReport, TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Statistics { reply })?;
        rx.await.map_err(|_| TunnelError::stopped())
    }

    /// Forward a platform signal
    pub fn notify_platform(&self, event: PlatformEvent) {
        let _ = self.send(Command::Platform(event));
    }

    pub fn network_monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// Stop the tunnel, close any open session and end the actor
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply: Some(reply) }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), TunnelError> {
        self.tx.send(command).map_err(|_| TunnelError::stopped())
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown { reply: None });
    }
}

/// Assembles a [`TunnelController`]
pub struct ControllerBuilder {
    relay: Arc<dyn RelayEngine>,
    interface: Arc<dyn TunnelInterface>,
    configuration: Option<TunnelConfiguration>,
    path_source: Option<Arc<dyn PathSource>>,
    store: Option<SessionStore>,
    counters: Option<Arc<dyn InterfaceCounters>>,
    performance: Option<Arc<dyn PerformanceProbe>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    stop_timeout: Duration,
}

impl ControllerBuilder {
    fn new(relay: Arc<dyn RelayEngine>, interface: Arc<dyn TunnelInterface>) -> Self {
        Self {
            relay,
            interface,
            configuration: None,
            path_source: None,
            store: None,
            counters: None,
            performance: None,
            credentials: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_configuration(mut self, configuration: TunnelConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Defaults to polling host interfaces with sysinfo
    pub fn with_path_source(mut self, source: Arc<dyn PathSource>) -> Self {
        self.path_source = Some(source);
        self
    }

    /// Defaults to an in-memory log
    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to the packet loop's own counters
    pub fn with_counters(mut self, counters: Arc<dyn InterfaceCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_performance_probe(mut self, probe: Arc<dyn PerformanceProbe>) -> Self {
        self.performance = Some(probe);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Start the controller actor. Must be called inside a tokio runtime.
    pub fn spawn(self) -> TunnelController {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let source: Arc<dyn PathSource> = match self.path_source {
            Some(source) => source,
            None => Arc::new(SysinfoPathSource::spawn(DEFAULT_PATH_POLL_INTERVAL)),
        };
        let monitor = Arc::new(NetworkMonitor::new(source));
        let network_tx = tx.clone();
        monitor.start(move |available, link_type| {
            let _ = network_tx.send(Command::Network {
                available,
                link_type,
            });
        });

        let packet_counters = Arc::new(PacketCounters::new());
        let counters: Arc<dyn InterfaceCounters> = match self.counters {
            Some(counters) => counters,
            None => packet_counters.clone(),
        };

        let mut store = self.store.unwrap_or_else(SessionStore::in_memory);
        let configuration = self.configuration.map(Arc::new);
        if let Some(config) = &configuration {
            store.set_retention(Some(config.log_retention));
        }

        let actor = ControllerActor {
            configuration,
            relay: self.relay,
            interface: self.interface,
            monitor: monitor.clone(),
            store,
            counters,
            packet_counters,
            performance: self.performance,
            credentials: self.credentials,
            stop_timeout: self.stop_timeout,
            tx: tx.clone(),
            events: events.clone(),
            timers: Timers::new(tx.clone()),
            status: TunnelStatus::Disconnected,
            epoch: 0,
            reconnect_attempts: 0,
            session: None,
            last_sample: None,
            latest_counters: TrafficStats::default(),
            sampling_ticks: 0,
            packet_loop: None,
            pending_update: None,
            network_available: monitor.is_network_available(),
            link_type: monitor.current_link_type(),
        };
        tokio::spawn(actor.run(rx));

        TunnelController {
            tx,
            events,
            monitor,
        }
    }
}

/// A configuration update waiting for the relay to stop
struct PendingUpdate {
    configuration: Arc<TunnelConfiguration>,
    reply: oneshot::Sender<Result<(), TunnelError>>,
}

struct ControllerActor {
    configuration: Option<Arc<TunnelConfiguration>>,
    relay: Arc<dyn RelayEngine>,
    interface: Arc<dyn TunnelInterface>,
    monitor: Arc<NetworkMonitor>,
    store: SessionStore,
    counters: Arc<dyn InterfaceCounters>,
    packet_counters: Arc<PacketCounters>,
    performance: Option<Arc<dyn PerformanceProbe>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    stop_timeout: Duration,
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TunnelEvent>,
    timers: Timers<Command>,
    status: TunnelStatus,
    epoch: u64,
    reconnect_attempts: u32,
    session: Option<OpenSession>,
    last_sample: Option<TrafficSample>,
    latest_counters: TrafficStats,
    sampling_ticks: u64,
    packet_loop: Option<PacketLoop>,
    pending_update: Option<PendingUpdate>,
    network_available: bool,
    link_type: LinkType,
}

impl ControllerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("Tunnel controller started");

        while let Some(command) = rx.recv().await {
            if let Command::Shutdown { reply } = command {
                self.shutdown();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return;
            }
            self.handle(command);
        }

        self.shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let _ = reply.send(self.connect(true));
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::UpdateConfiguration {
                configuration,
                reply,
            } => self.update_configuration(Arc::new(*configuration), reply),
            Command::Status { reply } => {
                let _ = reply.send(self.status);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Statistics { reply } => {
                let _ = reply.send(self.statistics());
            }
            Command::Relay { epoch, event } => self.on_relay_event(epoch, event),
            Command::RelayFault { epoch, error } => self.on_relay_fault(epoch, error),
            Command::Network {
                available,
                link_type,
            } => self.on_network_changed(available, link_type),
            Command::Platform(event) => self.on_platform_event(event),
            Command::Timer(fired) => self.on_timer(fired),
            Command::Shutdown { .. } => {}
        }
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: TunnelStatus) {
        if self.status == status {
            return;
        }
        let previous = std::mem::replace(&mut self.status, status);
        info!("Tunnel status: {} -> {}", previous, status);
        self.emit(TunnelEvent::StatusChanged { previous, status });
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            status: self.status,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_pending: self.timers.is_armed(TimerKind::Reconnect),
            session_id: self.session.as_ref().map(|s| s.id().to_string()),
            epoch: self.epoch,
            relaying: self
                .packet_loop
                .as_ref()
                .is_some_and(|packet_loop| !packet_loop.is_finished()),
            network_available: self.network_available,
            link_type: self.link_type,
        }
    }

    fn statistics(&self) -> StatisticsReport {
        StatisticsReport {
            status: self.status,
            current_session: self.session.as_ref().map(OpenSession::traffic),
            counters: self.latest_counters,
            history: self.store.statistics(),
        }
    }

    fn connect(&mut self, external: bool) -> Result<(), TunnelError> {
        if self.status.is_active() || self.status == TunnelStatus::Disconnecting {
            warn!("Connect ignored: tunnel is {}", self.status);
            return Ok(());
        }

        if external {
            self.timers.cancel(TimerKind::Reconnect);
            self.reconnect_attempts = 0;
        }
        if self.status == TunnelStatus::Invalid {
            self.set_status(TunnelStatus::Disconnected);
        }

        let Some(configuration) = self.configuration.clone() else {
            return self.fail_fast(TunnelError::Configuration("no configuration set".into()));
        };
        if let Err(e) = configuration.validate() {
            return self.fail_fast(e);
        }
        let proxy_password = match self.resolve_proxy_password(&configuration) {
            Ok(password) => password,
            Err(e) => return self.fail_fast(e),
        };
        if !self.network_available {
            return self.fail_fast(TunnelError::NetworkUnavailable);
        }

        self.epoch += 1;
        self.set_status(TunnelStatus::Connecting);
        info!(
            "Connecting to {} (attempt {}, epoch {})",
            configuration.endpoint(),
            self.reconnect_attempts,
            self.epoch
        );

        let request = StartRequest {
            configuration: configuration.clone(),
            proxy_password,
            sink: RelaySink::new(self.epoch, self.tx.clone()),
        };
        match self.relay.start(request) {
            Ok(()) => {
                self.timers
                    .once(TimerKind::ConnectTimeout, configuration.connect_timeout);
                self.start_packet_loop();
                Ok(())
            }
            Err(e) => {
                self.on_connection_lost(e.clone());
                Err(e)
            }
        }
    }

    /// Reject a connect before anything was started
    fn fail_fast(&mut self, error: TunnelError) -> Result<(), TunnelError> {
        warn!("Connect rejected: {}", error);
        self.emit(TunnelEvent::Error(error.clone()));
        Err(error)
    }

    fn resolve_proxy_password(
        &self,
        configuration: &TunnelConfiguration,
    ) -> Result<Option<Vec<u8>>, TunnelError> {
        let Some(credentials) = configuration
            .proxy
            .as_ref()
            .and_then(|p| p.credentials.as_ref())
        else {
            return Ok(None);
        };

        let store = self.credentials.as_ref().ok_or_else(|| {
            TunnelError::Authentication(format!(
                "no credential store for proxy user '{}'",
                credentials.username
            ))
        })?;
        match store.load(&credentials.password_key)? {
            Some(password) => Ok(Some(password)),
            None => Err(TunnelError::Authentication(format!(
                "credential '{}' not found",
                credentials.password_key
            ))),
        }
    }

    fn start_packet_loop(&mut self) {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.packet_loop = Some(PacketLoop::spawn(
            self.interface.clone(),
            self.relay.clone(),
            self.packet_counters.clone(),
            move |error| {
                let _ = tx.send(Command::RelayFault { epoch, error });
            },
        ));
    }

    fn disconnect(&mut self) {
        if self.timers.cancel(TimerKind::Reconnect) {
            info!("Pending reconnect cancelled");
        }
        if !self.status.is_active() {
            warn!("Disconnect ignored: tunnel is {}", self.status);
            return;
        }

        self.timers.cancel(TimerKind::ConnectTimeout);
        self.timers.cancel(TimerKind::Sampling);
        self.set_status(TunnelStatus::Disconnecting);
        self.close_session();
        self.packet_loop = None;
        self.relay.stop();
        self.timers.once(TimerKind::StopDeadline, self.stop_timeout);
    }

    fn finish_disconnect(&mut self) {
        self.timers.cancel(TimerKind::StopDeadline);
        self.close_session();
        self.set_status(TunnelStatus::Disconnected);

        if let Some(update) = self.pending_update.take() {
            self.apply_configuration(update.configuration);
            let result = self.connect(true);
            let _ = update.reply.send(result);
        }
    }

    fn on_relay_event(&mut self, epoch: u64, event: RelayEvent) {
        if epoch != self.epoch {
            debug!(
                "Ignoring {:?} from stale relay epoch {} (current {})",
                event, epoch, self.epoch
            );
            return;
        }

        match (event, self.status) {
            (RelayEvent::Connected, TunnelStatus::Connecting) => self.on_connected(),
            (RelayEvent::Failed(e), status) if status.is_active() => self.on_connection_lost(e),
            (RelayEvent::Stopped, TunnelStatus::Disconnecting) => self.finish_disconnect(),
            (RelayEvent::Stopped, status) if status.is_active() => self.on_connection_lost(
                TunnelError::Connection("relay stopped unexpectedly".into()),
            ),
            (event, status) => debug!("Ignoring relay {:?} while {}", event, status),
        }
    }

    fn on_relay_fault(&mut self, epoch: u64, error: TunnelError) {
        if epoch != self.epoch || !self.status.is_active() {
            return;
        }
        warn!("Packet relay fault: {}", error);
        self.emit(TunnelEvent::Error(error));
    }

    fn on_connected(&mut self) {
        let Some(configuration) = self.configuration.clone() else {
            return;
        };

        self.timers.cancel(TimerKind::ConnectTimeout);
        self.reconnect_attempts = 0;
        self.close_session();

        let session = OpenSession::start(
            configuration.server_address.clone(),
            self.link_type.as_str(),
        );
        info!("Session {} opened", session.id());
        self.session = Some(session);
        self.last_sample = match self.counters.read() {
            Ok(stats) => {
                self.latest_counters = stats;
                Some(TrafficSample::now(stats))
            }
            Err(e) => {
                debug!("No traffic baseline: {}", e);
                None
            }
        };
        self.sampling_ticks = 0;
        self.timers
            .repeating(TimerKind::Sampling, configuration.sampling_interval);

        self.set_status(TunnelStatus::Connected);
    }

    /// The single failure path for every lifecycle error
    fn on_connection_lost(&mut self, reason: TunnelError) {
        warn!("Connection lost: {}", reason);
        self.teardown(TunnelStatus::Disconnected);
        self.emit(TunnelEvent::Error(reason.clone()));

        if reason.is_terminal() {
            return;
        }
        let Some(configuration) = self.configuration.clone() else {
            return;
        };
        if !configuration.auto_reconnect {
            return;
        }

        if self.reconnect_attempts < configuration.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                configuration.reconnect_delay,
                self.reconnect_attempts,
                configuration.max_reconnect_attempts
            );
            self.emit(TunnelEvent::WillReconnect {
                attempt: self.reconnect_attempts,
                max_attempts: configuration.max_reconnect_attempts,
                delay: configuration.reconnect_delay,
            });
            self.timers
                .once(TimerKind::Reconnect, configuration.reconnect_delay);
        } else {
            error!(
                "Giving up after {} reconnect attempts",
                self.reconnect_attempts
            );
            self.emit(TunnelEvent::Error(TunnelError::MaxReconnectAttemptsReached));
        }
    }

    /// Stop everything immediately and settle in `target`
    fn teardown(&mut self, target: TunnelStatus) {
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.timers.cancel(TimerKind::Sampling);
        self.timers.cancel(TimerKind::StopDeadline);
        self.packet_loop = None;

        let running = self.status.is_active() || self.status == TunnelStatus::Disconnecting;
        if self.status.has_session() {
            self.set_status(TunnelStatus::Disconnecting);
        }
        if running {
            self.relay.stop();
        }
        self.close_session();
        self.set_status(target);
    }

    fn sample_traffic(&mut self) {
        let stats = match self.counters.read() {
            Ok(stats) => stats,
            Err(e) => {
                debug!("Traffic sample skipped: {}", e);
                return;
            }
        };
        self.latest_counters = stats;

        let sample = TrafficSample::now(stats);
        if let Some(previous) = self.last_sample.replace(sample) {
            let delta = sample.delta_since(&previous);
            if let Some(session) = self.session.as_mut() {
                session.record_traffic(&delta);
            }
            self.emit(TunnelEvent::Traffic {
                received: delta.received,
                sent: delta.sent,
            });
        }
    }

    fn sample_performance(&mut self) {
        let Some(probe) = &self.performance else {
            return;
        };
        let Some(usage) = probe.sample() else {
            debug!("Performance sample unavailable");
            return;
        };
        let sample = PerformanceSample {
            cpu_percent: usage.cpu_percent,
            memory_bytes: usage.memory_bytes,
            latency_ms: self
                .relay
                .average_latency()
                .map(|latency| latency.as_micros() as f64 / 1000.0),
            taken_at: now_millis(),
        };
        if let Some(session) = self.session.as_mut() {
            session.record_performance(sample);
        }
    }

    fn on_sampling_tick(&mut self) {
        self.sample_traffic();
        self.sampling_ticks += 1;
        if self.sampling_ticks % PERFORMANCE_SAMPLE_EVERY == 0 {
            self.sample_performance();
        }
    }

    /// Take a final sample and move the open session into the log
    fn close_session(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.sample_traffic();
        self.last_sample = None;

        let Some(session) = self.session.take() else {
            return;
        };
        let record = session.close();
        info!(
            "Session {} closed after {:?} ({})",
            record.id,
            record.duration(),
            record.traffic()
        );

        if let Err(e) = self.store.append(record.clone()) {
            error!("Failed to persist session {}: {}", record.id, e);
            self.emit(TunnelEvent::Error(e.into()));
        }
        self.emit(TunnelEvent::SessionClosed(record));
    }

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(&fired) {
            debug!("Discarding stale {:?} timer", fired.kind);
            return;
        }

        match fired.kind {
            TimerKind::ConnectTimeout if self.status == TunnelStatus::Connecting => {
                self.on_connection_lost(TunnelError::Timeout);
            }
            TimerKind::Reconnect if self.status == TunnelStatus::Disconnected => {
                if let Err(e) = self.connect(false) {
                    debug!("Scheduled reconnect failed: {}", e);
                }
            }
            TimerKind::Sampling if self.status.has_session() => self.on_sampling_tick(),
            TimerKind::StopDeadline if self.status == TunnelStatus::Disconnecting => {
                warn!(
                    "Relay did not confirm stop within {:?}; forcing disconnect",
                    self.stop_timeout
                );
                self.finish_disconnect();
            }
            kind => debug!("Ignoring {:?} timer while {}", kind, self.status),
        }
    }

    fn on_network_changed(&mut self, available: bool, link_type: LinkType) {
        let was_available = std::mem::replace(&mut self.network_available, available);
        self.link_type = link_type;
        self.emit(TunnelEvent::NetworkChanged {
            available,
            link_type,
        });

        if available == was_available {
            return;
        }

        if !available {
            info!("Network lost");
            self.timers.cancel(TimerKind::Reconnect);
            if self.status.is_active() {
                self.teardown(TunnelStatus::Disconnected);
                self.emit(TunnelEvent::Error(TunnelError::NetworkUnavailable));
            }
            return;
        }

        info!("Network restored ({})", link_type);
        let Some(configuration) = self.configuration.clone() else {
            return;
        };
        if self.status == TunnelStatus::Disconnected && configuration.auto_reconnect {
            self.reconnect_attempts = 0;
            self.timers
                .once(TimerKind::Reconnect, configuration.reconnect_delay);
        }
    }

    fn on_platform_event(&mut self, event: PlatformEvent) {
        match (event, self.status) {
            (PlatformEvent::ReassertingStarted, TunnelStatus::Connected) => {
                self.set_status(TunnelStatus::Reasserting);
            }
            (PlatformEvent::ReassertingFinished, TunnelStatus::Reasserting) => {
                self.set_status(TunnelStatus::Connected);
            }
            (PlatformEvent::Unrecoverable(reason), _) => {
                error!("Platform reported an unrecoverable condition: {}", reason);
                self.timers.cancel_all();
                self.teardown(TunnelStatus::Invalid);
                let error = TunnelError::Unknown(reason);
                if let Some(update) = self.pending_update.take() {
                    let _ = update.reply.send(Err(error.clone()));
                }
                self.emit(TunnelEvent::Error(error));
            }
            (event, status) => debug!("Ignoring {:?} while {}", event, status),
        }
    }

    fn update_configuration(
        &mut self,
        configuration: Arc<TunnelConfiguration>,
        reply: oneshot::Sender<Result<(), TunnelError>>,
    ) {
        if self.pending_update.is_some() {
            let _ = reply.send(Err(TunnelError::Configuration(
                "a configuration update is already in progress".into(),
            )));
            return;
        }

        if self.status.is_active() {
            info!("Restarting tunnel with configuration '{}'", configuration.name);
            self.pending_update = Some(PendingUpdate {
                configuration,
                reply,
            });
            self.disconnect();
            return;
        }

        let result = configuration.validate();
        self.apply_configuration(configuration);
        let _ = reply.send(result);
    }

    fn apply_configuration(&mut self, configuration: Arc<TunnelConfiguration>) {
        info!("Configuration '{}' applied", configuration.name);
        self.store.set_retention(Some(configuration.log_retention));
        self.configuration = Some(configuration);
    }

    fn shutdown(&mut self) {
        self.timers.cancel_all();
        self.packet_loop = None;
        if self.status.is_active() || self.status == TunnelStatus::Disconnecting {
            self.relay.stop();
        }
        self.close_session();
        if let Some(update) = self.pending_update.take() {
            let _ = update.reply.send(Err(TunnelError::stopped()));
        }
        if self.status != TunnelStatus::Invalid {
            self.set_status(TunnelStatus::Disconnected);
        }
        self.monitor.stop();
        info!("Tunnel controller stopped");
    }
}

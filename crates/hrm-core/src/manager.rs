//! Multi-device connection management.
//!
//! [`HeartRateManager`] owns the live [`DeviceConnection`]s, the scanner, the
//! listener registry and the aggregate [`ManagerState`]. Connection reports
//! and scan events are serialised through one hub task, which is the only
//! place that removes connections from the registry.
//!
//! The aggregate state is computed from the states the hub has seen
//! reported, never from the connections' live state, so every
//! `ManagerStateChanged` follows the device events that caused it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use hrm_types::{
    ConnectionState, DeviceIdentity, DiscoveryRecord, ManagerState, ScanFailureReason, ScanState,
};

use crate::config::ManagerConfig;
use crate::connection::{ConnectionReport, DeviceConnection, ReportSender};
use crate::error::{Error, Result};
use crate::events::{
    ChannelListener, ListenerRegistry, ManagerEvent, ManagerListener, spawn_dispatcher,
};
use crate::provider::DeviceProviderFilter;
use crate::traits::{ScanEvent, ScanEventSender, Scanner, Transport};

/// Aggregate state for a set of connection states.
///
/// Any streaming connection wins; otherwise any other live connection means
/// connecting. Scanning only shows when no connection is live.
pub fn aggregate_state(
    states: impl IntoIterator<Item = ConnectionState>,
    scanning: bool,
) -> ManagerState {
    let mut live = false;
    for state in states {
        if state == ConnectionState::Streaming {
            return ManagerState::Connected;
        }
        live |= !state.is_terminal();
    }
    if live {
        ManagerState::Connecting
    } else if scanning {
        ManagerState::Scanning
    } else {
        ManagerState::Disconnected
    }
}

/// A registered connection and the last state the hub saw it report.
struct Entry {
    connection: DeviceConnection,
    reported: ConnectionState,
}

#[derive(Default)]
struct Registry {
    live: HashMap<DeviceIdentity, Entry>,
    // Ids of terminated connections replaced by `connect_to` before the hub
    // saw their termination report.
    retired: HashSet<u64>,
}

impl Registry {
    fn is_live(&self, identity: &DeviceIdentity) -> bool {
        self.live
            .get(identity)
            .is_some_and(|e| !e.connection.state().is_terminal())
    }

    fn is_current(&self, id: u64, identity: &DeviceIdentity) -> bool {
        self.live
            .get(identity)
            .is_some_and(|e| e.connection.id() == id)
    }
}

/// Coordinator for every heart-rate sensor connection in the process.
///
/// Create one with [`HeartRateManager::new`], attach a scanner with
/// [`HeartRateManager::init`], and observe it through listeners.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use hrm_core::{BtleplugScanner, BtleplugTransport, HeartRateManager, ManagerConfig, ManagerEvent};
///
/// # async fn example() -> hrm_core::Result<()> {
/// let transport = Arc::new(BtleplugTransport::new().await?);
/// let manager = HeartRateManager::new(ManagerConfig::default(), transport.clone())?;
/// manager.init(Arc::new(BtleplugScanner::new(transport.adapter().clone()))).await;
///
/// let mut events = manager.subscribe();
/// manager.start_scanning().await?;
/// while let Some(event) = events.recv().await {
///     if let ManagerEvent::DeviceFound { identity, .. } = event {
///         manager.connect_to(identity).await;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct HeartRateManager {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    scanner: RwLock<Option<Arc<dyn Scanner>>>,
    registry: RwLock<Registry>,
    listeners: Arc<ListenerRegistry>,
    filter: DeviceProviderFilter,
    state: watch::Sender<ManagerState>,
    // Serialises recomputation so state events leave in the order they were decided.
    recompute: Mutex<()>,
    events: mpsc::Sender<ManagerEvent>,
    reports: ReportSender,
    scan_events: ScanEventSender,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for HeartRateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartRateManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl HeartRateManager {
    /// Create a manager that opens sessions through `transport`.
    ///
    /// Must be called from within a tokio runtime; the manager runs a hub
    /// task and an event dispatcher task in the background.
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;

        let listeners = Arc::new(ListenerRegistry::new());
        let (events, events_rx) = mpsc::channel(config.event_capacity);
        spawn_dispatcher(Arc::clone(&listeners), events_rx);

        let (reports, reports_rx) = mpsc::unbounded_channel();
        let (scan_events, scan_rx) = mpsc::unbounded_channel();
        let (matched, matched_rx) = mpsc::unbounded_channel();
        let filter = DeviceProviderFilter::with_callback(move |record: &DiscoveryRecord| {
            let _ = matched.send(record.clone());
        });
        let (state, _) = watch::channel(ManagerState::Disconnected);
        let shutdown = CancellationToken::new();

        let manager = Arc::new(Self {
            config,
            transport,
            scanner: RwLock::new(None),
            registry: RwLock::new(Registry::default()),
            listeners,
            filter,
            state,
            recompute: Mutex::new(()),
            events,
            reports,
            scan_events,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_hub(
            Arc::downgrade(&manager),
            reports_rx,
            scan_rx,
            matched_rx,
            shutdown,
        ));
        Ok(manager)
    }

    /// Attach the scanner. Replaces any scanner attached before.
    pub async fn init(&self, scanner: Arc<dyn Scanner>) {
        *self.scanner.write().await = Some(scanner);
        debug!("Scanner attached");
    }

    /// The manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // --- Listeners ---

    /// Register a listener. Returns `false` if it was already registered.
    pub fn add_listener(&self, listener: Arc<dyn ManagerListener>) -> bool {
        self.listeners.add(listener)
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ManagerListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Register a channel listener and return its receiver.
    ///
    /// Dropping the receiver unregisters the listener on the next event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (listener, receiver) = ChannelListener::channel();
        self.listeners.add(listener);
        receiver
    }

    // --- Scanning ---

    async fn scanner(&self) -> Result<Arc<dyn Scanner>> {
        self.scanner.read().await.clone().ok_or(Error::NotInitialized)
    }

    /// Conditions that currently prevent scanning.
    pub async fn can_scan(&self) -> Result<Vec<ScanFailureReason>> {
        Ok(self.scanner().await?.can_scan().await)
    }

    /// Start scanning for heart-rate sensors.
    ///
    /// When scanning is blocked, listeners get one
    /// [`ManagerEvent::UnableToStart`] and the scanner is left untouched.
    pub async fn start_scanning(&self) -> Result<()> {
        let scanner = self.scanner().await?;
        let reasons = scanner.can_scan().await;
        if let Some(reason) = reasons.first() {
            warn!("Cannot start scanning: {}", reason);
            self.emit(ManagerEvent::UnableToStart {
                reason: reason.clone(),
            })
            .await;
            return Err(Error::ScanUnavailable(reasons));
        }

        info!("Starting scan for heart-rate sensors");
        scanner.start(self.scan_events.clone()).await?;
        self.recompute_state().await;
        Ok(())
    }

    /// Stop scanning, leaving connections alone.
    pub async fn stop_scanning(&self) {
        self.halt_scanner().await;
        self.recompute_state().await;
    }

    async fn halt_scanner(&self) {
        let scanner = self.scanner.read().await.clone();
        if let Some(scanner) = scanner {
            if let Err(e) = scanner.stop().await {
                warn!("Failed to stop scanning: {}", e);
            }
        }
    }

    /// Whether the scanner is running.
    pub async fn is_scanning(&self) -> bool {
        match self.scanner.read().await.as_ref() {
            Some(scanner) => scanner.state() == ScanState::Scanning,
            None => false,
        }
    }

    // --- Connections ---

    /// Connect to a sensor.
    ///
    /// Returns `false` if a live connection to `identity` already exists.
    /// Otherwise scanning stops and a new connection starts.
    pub async fn connect_to(&self, identity: impl Into<DeviceIdentity>) -> bool {
        let identity = identity.into();
        if self.has_live_connection(&identity).await {
            debug!("{}: already connected or connecting", identity);
            return false;
        }

        if self.is_scanning().await {
            self.halt_scanner().await;
        }

        {
            let mut registry = self.registry.write().await;
            if registry.is_live(&identity) {
                debug!("{}: connection created concurrently", identity);
                return false;
            }
            let connection = DeviceConnection::new(
                identity.clone(),
                self.config.connection.clone(),
                Arc::clone(&self.transport),
                self.reports.clone(),
            );
            connection.connect();
            let entry = Entry {
                connection,
                reported: ConnectionState::Connecting,
            };
            if let Some(old) = registry.live.insert(identity.clone(), entry) {
                // Its termination report is still queued for the hub.
                debug!("{}: replacing a terminated connection", identity);
                registry.retired.insert(old.connection.id());
            }
        }

        self.recompute_state().await;
        true
    }

    /// Disconnect one sensor. Returns `false` if it has no connection.
    ///
    /// The registry entry goes away once the connection reports termination.
    pub async fn disconnect(&self, identity: &DeviceIdentity) -> bool {
        let connection = self
            .registry
            .read()
            .await
            .live
            .get(identity)
            .map(|e| e.connection.clone());
        match connection {
            Some(connection) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnect every sensor.
    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self
            .registry
            .read()
            .await
            .live
            .values()
            .map(|e| e.connection.clone())
            .collect();
        info!("Disconnecting {} device(s)", connections.len());
        for connection in connections {
            connection.disconnect();
        }
    }

    /// Stop scanning and optionally disconnect every sensor.
    pub async fn stop(&self, with_connections: bool) {
        self.stop_scanning().await;
        if with_connections {
            self.disconnect_all().await;
        }
    }

    /// Shut everything down and forget all state.
    ///
    /// Listeners get no further events. The manager can be reused after a
    /// new [`init`](Self::init).
    pub async fn destroy(&self) {
        self.stop(true).await;
        self.listeners.clear();
        *self.registry.write().await = Registry::default();
        *self.scanner.write().await = None;
        self.state.send_replace(ManagerState::Disconnected);
        info!("Manager destroyed");
    }

    // --- Queries ---

    /// Current aggregate state.
    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    /// Watch the aggregate state.
    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Whether any sensor is connected or being connected.
    pub fn is_connected_or_connecting(&self) -> bool {
        matches!(
            self.state(),
            ManagerState::Connected | ManagerState::Connecting
        )
    }

    /// Sensors the manager has reported as connected.
    pub async fn connected_devices(&self) -> Vec<DeviceIdentity> {
        let mut devices: Vec<_> = self
            .registry
            .read()
            .await
            .live
            .iter()
            .filter(|(_, e)| e.reported == ConnectionState::Streaming)
            .map(|(identity, _)| identity.clone())
            .collect();
        devices.sort();
        devices
    }

    /// State of the connection to `identity`, if one is registered.
    pub async fn connection_state(&self, identity: &DeviceIdentity) -> Option<ConnectionState> {
        self.registry
            .read()
            .await
            .live
            .get(identity)
            .map(|e| e.connection.state())
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.live.len()
    }

    async fn has_live_connection(&self, identity: &DeviceIdentity) -> bool {
        self.registry.read().await.is_live(identity)
    }

    // --- Hub ---

    async fn emit(&self, event: ManagerEvent) {
        trace!("Emitting {:?}", event);
        if self.events.send(event).await.is_err() {
            debug!("Event dispatcher gone, event dropped");
        }
    }

    async fn recompute_state(&self) {
        let _guard = self.recompute.lock().await;
        let scanning = self.is_scanning().await;
        let next = {
            let registry = self.registry.read().await;
            aggregate_state(registry.live.values().map(|e| e.reported), scanning)
        };
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!("Manager state: {}", next);
            self.emit(ManagerEvent::ManagerStateChanged { state: next })
                .await;
        }
    }

    async fn on_report(&self, report: ConnectionReport) {
        match report {
            ConnectionReport::StateChanged {
                id,
                identity,
                state,
            } => {
                {
                    let mut registry = self.registry.write().await;
                    match registry.live.get_mut(&identity) {
                        Some(entry) if entry.connection.id() == id => entry.reported = state,
                        _ => return,
                    }
                }
                if state == ConnectionState::Streaming {
                    info!("{}: connected", identity);
                    self.emit(ManagerEvent::DeviceConnected { identity }).await;
                }
                self.recompute_state().await;
            }
            ConnectionReport::Value { id, reading } => {
                let known = {
                    let registry = self.registry.read().await;
                    registry.is_current(id, &reading.identity) || registry.retired.contains(&id)
                };
                if known {
                    self.emit(ManagerEvent::ValueChanged { reading }).await;
                }
            }
            ConnectionReport::Terminated {
                id,
                identity,
                reason,
            } => {
                let (removed, retired) = {
                    let mut registry = self.registry.write().await;
                    if registry.is_current(id, &identity) {
                        registry.live.remove(&identity);
                        (true, false)
                    } else {
                        (false, registry.retired.remove(&id))
                    }
                };
                if !removed && !retired {
                    debug!("{}: termination of a forgotten connection", identity);
                    return;
                }
                self.emit(ManagerEvent::DeviceDisconnected { identity, reason })
                    .await;
                self.recompute_state().await;
            }
        }
    }

    async fn on_scan_event(&self, event: ScanEvent) {
        match event {
            ScanEvent::DeviceFound(record) => {
                // Matches come back through the filter's callback.
                self.filter.elaborate(&record);
            }
            ScanEvent::Error(reason) => {
                warn!("Scan failed: {}", reason);
                self.emit(ManagerEvent::UnableToStart { reason }).await;
                self.recompute_state().await;
            }
        }
    }

    async fn on_device_matched(&self, record: DiscoveryRecord) {
        if self.has_live_connection(&record.identity).await {
            trace!("{}: already connected, not reported", record.identity);
            return;
        }
        debug!("Found heart-rate sensor {}", record.identity);
        self.emit(ManagerEvent::DeviceFound {
            identity: record.identity,
            name: record.name,
            rssi: record.rssi,
        })
        .await;
    }
}

impl Drop for HeartRateManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_hub(
    manager: Weak<HeartRateManager>,
    mut reports: mpsc::UnboundedReceiver<ConnectionReport>,
    mut scans: mpsc::UnboundedReceiver<ScanEvent>,
    mut matched: mpsc::UnboundedReceiver<DiscoveryRecord>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(report) = reports.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.on_report(report).await;
            }
            Some(record) = matched.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.on_device_matched(record).await;
            }
            Some(event) = scans.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.on_scan_event(event).await;
            }
            else => break,
        }
    }
    debug!("Manager hub stopped");
}

//! Per-device connection state machine.
//!
//! A [`DeviceConnection`] owns the GATT session of one sensor. All work for a
//! connection happens on a single worker task spawned by
//! [`DeviceConnection::connect`]; the handle only publishes state and asks the
//! worker to stop. Transient link faults are absorbed by a bounded recovery
//! cycle, and every run ends with exactly one
//! [`ConnectionReport::Terminated`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hrm_types::{
    ConnectionState, DeviceIdentity, DisconnectReason, GattCharacteristic, GattStatus,
    HeartRateMeasurement, HeartRateReading, LinkState,
};

use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::matcher::find_heart_rate_characteristic_in;
use crate::traits::{SessionHandle, Transport, TransportEvent, TransportEventReceiver};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Message sent by a connection to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionReport {
    /// The connection moved to a new non-terminal state.
    StateChanged {
        /// Connection that changed.
        id: u64,
        /// Device of the connection.
        identity: DeviceIdentity,
        /// New state.
        state: ConnectionState,
    },
    /// A heart-rate value was decoded.
    Value {
        /// Connection that received the value.
        id: u64,
        /// The decoded value.
        reading: HeartRateReading,
    },
    /// The connection terminated. Sent exactly once per run.
    Terminated {
        /// Connection that terminated.
        id: u64,
        /// Device of the connection.
        identity: DeviceIdentity,
        /// Why it terminated.
        reason: DisconnectReason,
    },
}

/// Sender half connections report into.
pub type ReportSender = mpsc::UnboundedSender<ConnectionReport>;

struct Shared {
    id: u64,
    identity: DeviceIdentity,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    reports: ReportSender,
    state: watch::Sender<ConnectionState>,
    // Guards start and stop so a cancel never races a fresh token.
    cancel: Mutex<CancellationToken>,
}

impl Shared {
    fn cancel_slot(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next || state.is_terminal() {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!("{}: {}", self.identity, next);
            let _ = self.reports.send(ConnectionReport::StateChanged {
                id: self.id,
                identity: self.identity.clone(),
                state: next,
            });
        }
    }

    fn finish(&self, reason: DisconnectReason) {
        self.state.send_replace(ConnectionState::Terminated);
        if reason.is_expected() {
            info!("{}: terminated ({})", self.identity, reason);
        } else {
            warn!("{}: terminated ({})", self.identity, reason);
        }
        let _ = self.reports.send(ConnectionReport::Terminated {
            id: self.id,
            identity: self.identity.clone(),
            reason,
        });
    }
}

/// Handle to the connection of one physical device.
///
/// Cloning the handle is cheap; all clones control the same connection.
#[derive(Clone)]
pub struct DeviceConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("id", &self.shared.id)
            .field("identity", &self.shared.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceConnection {
    /// Create an idle connection that reports into `reports`.
    pub fn new(
        identity: DeviceIdentity,
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        reports: ReportSender,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                identity,
                config,
                transport,
                reports,
                state,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The device this connection talks to.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the connection has terminated.
    pub async fn wait_terminated(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Start a connection attempt on a new worker task.
    ///
    /// Must be called from within a tokio runtime. Returns `false` without
    /// doing anything unless the connection is idle or terminated.
    pub fn connect(&self) -> bool {
        let token = {
            let mut slot = self.shared.cancel_slot();
            let started = self.shared.state.send_if_modified(|state| {
                if !state.can_connect() {
                    return false;
                }
                *state = ConnectionState::Connecting;
                true
            });
            if !started {
                debug!(
                    "{}: connect ignored in state {}",
                    self.shared.identity,
                    self.state()
                );
                return false;
            }
            *slot = CancellationToken::new();
            slot.clone()
        };

        info!("{}: connecting", self.shared.identity);
        let _ = self.shared.reports.send(ConnectionReport::StateChanged {
            id: self.shared.id,
            identity: self.shared.identity.clone(),
            state: ConnectionState::Connecting,
        });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let reason = Worker::new(Arc::clone(&shared), token).run().await;
            shared.finish(reason);
        });
        true
    }

    /// Request a graceful teardown.
    ///
    /// From any non-terminal state this eventually produces exactly one
    /// termination report, bounded by the disconnect timeout. A connection
    /// that was never started terminates immediately.
    pub fn disconnect(&self) {
        let slot = self.shared.cancel_slot();
        match self.state() {
            ConnectionState::Terminated => {
                debug!("{}: already terminated", self.shared.identity);
            }
            ConnectionState::Idle => {
                self.shared.finish(DisconnectReason::UserRequested);
            }
            _ => {
                debug!("{}: disconnect requested", self.shared.identity);
                slot.cancel();
            }
        }
    }
}

/// How one session ended.
enum SessionEnd {
    /// Stop without recovery.
    Terminate(DisconnectReason),
    /// A link fault that recovery may fix.
    Fault(GattStatus),
    /// `disconnect()` was requested.
    Cancelled,
}

struct Worker {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    session: Option<SessionHandle>,
    events: Option<TransportEventReceiver>,
    characteristic: Option<GattCharacteristic>,
    faults: u32,
}

impl Worker {
    fn new(shared: Arc<Shared>, cancel: CancellationToken) -> Self {
        Self {
            shared,
            cancel,
            session: None,
            events: None,
            characteristic: None,
            faults: 0,
        }
    }

    fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    async fn run(mut self) -> DisconnectReason {
        loop {
            if let Err(reason) = self.open().await {
                return reason;
            }

            match self.drive_session().await {
                SessionEnd::Terminate(reason) => {
                    self.close_session().await;
                    return reason;
                }
                SessionEnd::Cancelled => return self.shutdown().await,
                SessionEnd::Fault(status) => {
                    if self.faults >= self.config().max_recovery_attempts {
                        self.close_session().await;
                        return DisconnectReason::RecoveryExhausted { status };
                    }
                    self.faults += 1;
                    if let Err(reason) = self.recover(status).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Open a fresh session with its own event channel.
    async fn open(&mut self) -> Result<(), DisconnectReason> {
        self.shared.set_state(ConnectionState::Connecting);
        self.characteristic = None;

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::clone(&self.shared.transport);
        let limit = self.config().connect_timeout;
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DisconnectReason::UserRequested),
            opened = timeout(limit, transport.open(&self.shared.identity, tx)) => {
                opened.unwrap_or_else(|_| Err(Error::timeout("open session", limit)))
            }
        };

        match opened {
            Ok(session) => {
                self.session = Some(session);
                self.events = Some(rx);
                Ok(())
            }
            Err(e) => {
                warn!("{}: failed to open session: {}", self.identity(), e);
                Err(DisconnectReason::ConnectFailed(e.to_string()))
            }
        }
    }

    /// Process transport events until the session ends.
    async fn drive_session(&mut self) -> SessionEnd {
        let mut deadline = Some(Instant::now() + self.config().connect_timeout);
        loop {
            let Some(events) = self.events.as_mut() else {
                return SessionEnd::Terminate(DisconnectReason::TransportClosed);
            };
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                event = events.recv() => event,
                _ = sleep_until_opt(deadline) => {
                    return self.timed_out();
                }
            };
            let Some(event) = event else {
                return SessionEnd::Terminate(DisconnectReason::TransportClosed);
            };
            match self.handle(event).await {
                Step::Continue => {}
                Step::Deadline(next) => deadline = next,
                Step::End(end) => return end,
            }
        }
    }

    fn timed_out(&self) -> SessionEnd {
        let state = self.shared.state();
        warn!("{}: timed out while {}", self.identity(), state);
        if state == ConnectionState::Connecting {
            SessionEnd::Fault(GattStatus::CONNECTION_TIMEOUT)
        } else {
            SessionEnd::Fault(GattStatus::GATT_ERROR)
        }
    }

    async fn handle(&mut self, event: TransportEvent) -> Step {
        match event {
            TransportEvent::StateChanged { status, link } => self.on_link(status, link).await,
            TransportEvent::ServicesDiscovered { status, services } => {
                if self.shared.state() != ConnectionState::ServiceDiscovery {
                    debug!("{}: unexpected service table, ignored", self.identity());
                    return Step::Continue;
                }
                if !status.is_success() {
                    return Step::End(SessionEnd::Terminate(DisconnectReason::ProtocolError(
                        format!("service discovery failed with status {}", status),
                    )));
                }
                let Some(characteristic) = find_heart_rate_characteristic_in(&services).cloned()
                else {
                    return Step::End(SessionEnd::Terminate(DisconnectReason::UnsupportedDevice));
                };
                self.subscribe(characteristic).await
            }
            TransportEvent::DescriptorWritten {
                characteristic,
                status,
            } => {
                if self.shared.state() != ConnectionState::Subscribing
                    || self.characteristic.as_ref() != Some(&characteristic)
                {
                    debug!("{}: stray descriptor write, ignored", self.identity());
                    return Step::Continue;
                }
                if !status.is_success() {
                    return Step::End(SessionEnd::Terminate(DisconnectReason::ProtocolError(
                        format!("enabling notifications failed with status {}", status),
                    )));
                }
                self.faults = 0;
                self.shared.set_state(ConnectionState::Streaming);
                info!("{}: streaming heart rate", self.identity());
                Step::Deadline(None)
            }
            TransportEvent::ValueChanged {
                characteristic,
                value,
            } => {
                self.on_value(&characteristic, &value);
                Step::Continue
            }
        }
    }

    async fn on_link(&mut self, status: GattStatus, link: LinkState) -> Step {
        match (link, status.is_success()) {
            (LinkState::Connected, true) => {
                if self.shared.state() != ConnectionState::Connecting {
                    debug!("{}: duplicate link-up, ignored", self.identity());
                    return Step::Continue;
                }
                self.shared.set_state(ConnectionState::ServiceDiscovery);
                self.discover().await
            }
            (LinkState::Disconnected, true) => {
                info!("{}: device disconnected", self.identity());
                Step::End(SessionEnd::Terminate(DisconnectReason::Clean))
            }
            (_, false) => {
                warn!("{}: link fault (status {})", self.identity(), status);
                Step::End(SessionEnd::Fault(status))
            }
        }
    }

    /// Let the link settle, then enumerate services.
    async fn discover(&mut self) -> Step {
        let settle = self.config().settle_delay;
        if !self.pause(settle).await {
            return Step::End(SessionEnd::Cancelled);
        }
        let Some(session) = self.session.clone() else {
            return Step::End(SessionEnd::Terminate(DisconnectReason::TransportClosed));
        };
        if let Err(e) = session.discover_services().await {
            warn!("{}: service discovery request failed: {}", self.identity(), e);
            return Step::End(SessionEnd::Fault(GattStatus::GATT_ERROR));
        }
        Step::Deadline(Some(Instant::now() + self.config().operation_timeout))
    }

    async fn subscribe(&mut self, characteristic: GattCharacteristic) -> Step {
        self.shared.set_state(ConnectionState::Subscribing);
        let Some(session) = self.session.clone() else {
            return Step::End(SessionEnd::Terminate(DisconnectReason::TransportClosed));
        };
        debug!(
            "{}: enabling notifications on {}",
            self.identity(),
            characteristic.uuid
        );
        if let Err(e) = session.enable_notifications(&characteristic).await {
            warn!("{}: notification request failed: {}", self.identity(), e);
            return Step::End(SessionEnd::Fault(GattStatus::GATT_ERROR));
        }
        self.characteristic = Some(characteristic);
        Step::Deadline(Some(Instant::now() + self.config().operation_timeout))
    }

    fn on_value(&self, characteristic: &GattCharacteristic, value: &[u8]) {
        let state = self.shared.state();
        if !matches!(
            state,
            ConnectionState::Subscribing | ConnectionState::Streaming
        ) || self.characteristic.as_ref() != Some(characteristic)
        {
            return;
        }
        match decode_reading(&self.shared.identity, value) {
            Ok(reading) => {
                let _ = self.shared.reports.send(ConnectionReport::Value {
                    id: self.shared.id,
                    reading,
                });
            }
            Err(e) => warn!("{}: dropping malformed value: {}", self.identity(), e),
        }
    }

    /// Tear the faulted session down so the next loop iteration can reopen.
    async fn recover(&mut self, status: GattStatus) -> Result<(), DisconnectReason> {
        info!(
            "{}: recovering from status {} (attempt {}/{})",
            self.identity(),
            status,
            self.faults,
            self.config().max_recovery_attempts
        );
        self.shared.set_state(ConnectionState::Disconnecting);
        // Events of the old session must not reach the new one.
        self.events = None;
        let Some(session) = self.session.take() else {
            return Err(DisconnectReason::RecoveryExhausted { status });
        };

        if session.refresh_cache().await {
            debug!("{}: service cache refreshed", self.identity());
        }
        if let Err(e) = session.disconnect().await {
            debug!("{}: disconnect during recovery failed: {}", self.identity(), e);
        }
        let pause = self.config().recovery_disconnect_pause;
        let resumed = self.pause(pause).await;
        session.close().await;
        if !resumed {
            return Err(DisconnectReason::UserRequested);
        }
        let pause = self.config().recovery_reopen_pause;
        if !self.pause(pause).await {
            return Err(DisconnectReason::UserRequested);
        }
        Ok(())
    }

    /// Requested teardown: disconnect, wait for the link to drop, close.
    async fn shutdown(&mut self) -> DisconnectReason {
        self.shared.set_state(ConnectionState::Disconnecting);
        let Some(session) = self.session.take() else {
            return DisconnectReason::UserRequested;
        };
        let identity = self.shared.identity.clone();
        let mut events = self.events.take();
        let limit = self.config().disconnect_timeout;

        let confirmed = timeout(limit, async {
            if let Err(e) = session.disconnect().await {
                debug!("{}: disconnect request failed: {}", identity, e);
                return;
            }
            let Some(events) = events.as_mut() else {
                return;
            };
            while let Some(event) = events.recv().await {
                if matches!(
                    event,
                    TransportEvent::StateChanged {
                        link: LinkState::Disconnected,
                        ..
                    }
                ) {
                    return;
                }
            }
        })
        .await;
        if confirmed.is_err() {
            debug!("{}: no disconnect confirmation within {:?}", identity, limit);
        }
        session.close().await;
        DisconnectReason::UserRequested
    }

    async fn close_session(&mut self) {
        self.events = None;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}

/// Decode one heart-rate measurement notification.
fn decode_reading(identity: &DeviceIdentity, value: &[u8]) -> crate::error::Result<HeartRateReading> {
    let measurement = HeartRateMeasurement::from_bytes(value)?;
    Ok(HeartRateReading::from_measurement(
        identity.clone(),
        measurement,
        OffsetDateTime::now_utc(),
    ))
}

/// Outcome of handling one transport event.
enum Step {
    Continue,
    /// Keep going with a new timeout; `None` disables it.
    Deadline(Option<Instant>),
    End(SessionEnd),
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockTransport, SessionCall};
    use hrm_types::GattService;
    use hrm_types::uuid::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    fn setup(
        behavior: MockBehavior,
    ) -> (
        DeviceConnection,
        Arc<MockTransport>,
        mpsc::UnboundedReceiver<ConnectionReport>,
    ) {
        let transport = Arc::new(MockTransport::with_behavior(behavior));
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = DeviceConnection::new(
            DeviceIdentity::new("aa:bb"),
            test_config(),
            transport.clone(),
            tx,
        );
        (connection, transport, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionReport>) -> Vec<ConnectionReport> {
        let mut out = Vec::new();
        while let Ok(report) = rx.try_recv() {
            out.push(report);
        }
        out
    }

    fn terminations(reports: &[ConnectionReport]) -> Vec<DisconnectReason> {
        reports
            .iter()
            .filter_map(|r| match r {
                ConnectionReport::Terminated { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    fn states(reports: &[ConnectionReport]) -> Vec<ConnectionState> {
        reports
            .iter()
            .filter_map(|r| match r {
                ConnectionReport::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_state(connection: &DeviceConnection, state: ConnectionState) {
        let mut rx = connection.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_connection_reaches_streaming() {
        let (connection, transport, mut rx) = setup(MockBehavior::healthy());
        assert!(connection.connect());
        wait_for_state(&connection, ConnectionState::Streaming).await;

        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                ConnectionState::Connecting,
                ConnectionState::ServiceDiscovery,
                ConnectionState::Subscribing,
                ConnectionState::Streaming,
            ]
        );
        let session = transport.last_session(connection.identity()).unwrap();
        assert_eq!(
            session.calls(),
            vec![
                SessionCall::DiscoverServices,
                SessionCall::EnableNotifications(HEART_RATE_MEASUREMENT),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_precedes_discovery() {
        let (connection, transport, _rx) = setup(MockBehavior::healthy());
        let started = Instant::now();
        connection.connect();
        wait_for_state(&connection, ConnectionState::Streaming).await;
        assert!(started.elapsed() >= Duration::from_millis(1600));
        assert_eq!(transport.open_count(connection.identity()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_noop_while_live() {
        let (connection, transport, _rx) = setup(MockBehavior::healthy());
        assert!(connection.connect());
        assert!(!connection.connect());
        wait_for_state(&connection, ConnectionState::Streaming).await;
        assert!(!connection.connect());
        assert_eq!(transport.open_count(connection.identity()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_are_decoded() {
        let (connection, transport, mut rx) = setup(MockBehavior::healthy());
        connection.connect();
        wait_for_state(&connection, ConnectionState::Streaming).await;
        let session = transport.last_session(connection.identity()).unwrap();

        session.notify(&[0x00, 72]);
        session.notify(&[0x01, 0x2C, 0x01]);
        session.notify(&[0x01, 0x2C]);
        sleep(Duration::from_millis(1)).await;

        let values: Vec<u16> = drain(&mut rx)
            .into_iter()
            .filter_map(|r| match r {
                ConnectionReport::Value { reading, .. } => Some(reading.value),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![72, 300]);
        assert_eq!(connection.state(), ConnectionState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_disconnect_never_reconnects() {
        let (connection, transport, mut rx) = setup(MockBehavior::healthy());
        connection.connect();
        wait_for_state(&connection, ConnectionState::Streaming).await;
        let session = transport.last_session(connection.identity()).unwrap();

        session.emit(TransportEvent::StateChanged {
            status: GattStatus::SUCCESS,
            link: LinkState::Disconnected,
        });
        connection.wait_terminated().await;
        sleep(Duration::from_secs(10)).await;

        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::Clean]
        );
        assert_eq!(transport.open_count(connection.identity()), 1);
        assert!(session.calls().contains(&SessionCall::Close));
        assert!(!session.calls().contains(&SessionCall::RefreshCache));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_runs_one_recovery_cycle_then_terminates() {
        let (connection, transport, mut rx) = setup(MockBehavior::healthy());
        connection.connect();
        wait_for_state(&connection, ConnectionState::Streaming).await;

        let first = transport.last_session(connection.identity()).unwrap();
        let faulted_at = Instant::now();
        first.emit(TransportEvent::StateChanged {
            status: GattStatus::GATT_ERROR,
            link: LinkState::Disconnected,
        });

        // Recovery reopens and the healthy mock streams again.
        wait_for_state(&connection, ConnectionState::Disconnecting).await;
        wait_for_state(&connection, ConnectionState::Streaming).await;
        assert!(faulted_at.elapsed() >= Duration::from_millis(1800));
        assert_eq!(
            first.calls()[2..],
            [
                SessionCall::RefreshCache,
                SessionCall::Disconnect,
                SessionCall::Close
            ]
        );
        assert_eq!(transport.open_count(connection.identity()), 2);

        // Reaching Streaming again resets the budget.
        let second = transport.last_session(connection.identity()).unwrap();
        second.emit(TransportEvent::StateChanged {
            status: GattStatus::LINK_LOSS,
            link: LinkState::Disconnected,
        });
        wait_for_state(&connection, ConnectionState::Disconnecting).await;
        wait_for_state(&connection, ConnectionState::Streaming).await;
        assert_eq!(transport.open_count(connection.identity()), 3);
        assert!(terminations(&drain(&mut rx)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_fault_before_streaming_is_terminal() {
        let (connection, transport, mut rx) = setup(MockBehavior::manual());
        connection.connect();
        sleep(Duration::from_millis(1)).await;

        let first = transport.last_session(connection.identity()).unwrap();
        first.emit(TransportEvent::StateChanged {
            status: GattStatus::GATT_ERROR,
            link: LinkState::Connected,
        });
        sleep(Duration::from_millis(1900)).await;
        assert_eq!(transport.open_count(connection.identity()), 2);

        let second = transport.last_session(connection.identity()).unwrap();
        second.emit(TransportEvent::StateChanged {
            status: GattStatus::GATT_ERROR,
            link: LinkState::Disconnected,
        });
        connection.wait_terminated().await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::RecoveryExhausted {
                status: GattStatus::GATT_ERROR
            }]
        );
        assert_eq!(transport.open_count(connection.identity()), 2);
        assert!(second.calls().contains(&SessionCall::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_events_are_ignored() {
        let (connection, transport, _rx) = setup(MockBehavior::manual());
        connection.connect();
        sleep(Duration::from_millis(1)).await;
        let first = transport.last_session(connection.identity()).unwrap();
        first.emit(TransportEvent::StateChanged {
            status: GattStatus::LINK_LOSS,
            link: LinkState::Disconnected,
        });
        sleep(Duration::from_millis(1900)).await;

        // The old session is closed; nothing it sends can move the new one.
        assert!(!first.emit(TransportEvent::StateChanged {
            status: GattStatus::SUCCESS,
            link: LinkState::Connected,
        }));
        assert_eq!(connection.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_unsupported() {
        let behavior = MockBehavior::healthy()
            .services(vec![GattService::new(HEART_RATE_SERVICE, [])]);
        let (connection, transport, mut rx) = setup(behavior);
        connection.connect();
        connection.wait_terminated().await;

        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::UnsupportedDevice]
        );
        assert_eq!(transport.open_count(connection.identity()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_discovery_is_protocol_error() {
        let behavior = MockBehavior::healthy().discovery_status(GattStatus::GATT_ERROR);
        let (connection, _transport, mut rx) = setup(behavior);
        connection.connect();
        connection.wait_terminated().await;
        assert!(matches!(
            terminations(&drain(&mut rx))[..],
            [DisconnectReason::ProtocolError(_)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscription_is_terminal() {
        let behavior = MockBehavior::healthy().subscribe_status(GattStatus(0x03));
        let (connection, transport, mut rx) = setup(behavior);
        connection.connect();
        connection.wait_terminated().await;
        assert!(matches!(
            terminations(&drain(&mut rx))[..],
            [DisconnectReason::ProtocolError(_)]
        ));
        assert_eq!(transport.open_count(connection.identity()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_fault() {
        let (connection, transport, mut rx) = setup(MockBehavior::manual());
        connection.connect();
        connection.wait_terminated().await;

        assert_eq!(transport.open_count(connection.identity()), 2);
        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::RecoveryExhausted {
                status: GattStatus::CONNECTION_TIMEOUT
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_terminal() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_open("adapter gone");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection =
            DeviceConnection::new(DeviceIdentity::new("aa"), test_config(), transport, tx);
        connection.connect();
        connection.wait_terminated().await;
        assert!(matches!(
            terminations(&drain(&mut rx))[..],
            [DisconnectReason::ConnectFailed(_)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_open_times_out() {
        let transport = Arc::new(MockTransport::new());
        transport.stall_open();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection =
            DeviceConnection::new(DeviceIdentity::new("aa"), test_config(), transport, tx);
        connection.connect();
        connection.wait_terminated().await;
        match &terminations(&drain(&mut rx))[..] {
            [DisconnectReason::ConnectFailed(message)] => {
                assert!(message.contains("open session"), "{}", message);
                assert!(message.contains("timed out"), "{}", message);
            }
            other => panic!("unexpected terminations: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_value_is_a_parse_error() {
        let id = DeviceIdentity::new("aa");
        assert!(matches!(decode_reading(&id, &[]), Err(Error::Parse(_))));
        assert!(matches!(decode_reading(&id, &[0x01, 60]), Err(Error::Parse(_))));
        let reading = decode_reading(&id, &[0x00, 60]).unwrap();
        assert_eq!(reading.identity, id);
        assert_eq!(reading.value, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_streaming() {
        let (connection, transport, mut rx) = setup(MockBehavior::healthy());
        connection.connect();
        wait_for_state(&connection, ConnectionState::Streaming).await;
        connection.disconnect();
        connection.wait_terminated().await;

        let session = transport.last_session(connection.identity()).unwrap();
        assert!(session.calls().ends_with(&[SessionCall::Disconnect, SessionCall::Close]));
        sleep(Duration::from_secs(10)).await;
        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::UserRequested]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_transport_reply_is_bounded() {
        let behavior = MockBehavior::healthy().answer_disconnect(false);
        let (connection, _transport, mut rx) = setup(behavior);
        connection.connect();
        wait_for_state(&connection, ConnectionState::Streaming).await;

        let requested = Instant::now();
        connection.disconnect();
        connection.wait_terminated().await;
        assert!(requested.elapsed() >= Duration::from_secs(3));
        assert!(requested.elapsed() < Duration::from_secs(4));
        assert_eq!(terminations(&drain(&mut rx)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cuts_settle_delay_short() {
        let (connection, transport, mut rx) = setup(MockBehavior::healthy());
        connection.connect();
        wait_for_state(&connection, ConnectionState::ServiceDiscovery).await;
        connection.disconnect();
        connection.wait_terminated().await;

        let session = transport.last_session(connection.identity()).unwrap();
        assert!(!session.calls().contains(&SessionCall::DiscoverServices));
        assert_eq!(terminations(&drain(&mut rx)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_recovery_pause() {
        let (connection, transport, mut rx) = setup(MockBehavior::manual());
        connection.connect();
        sleep(Duration::from_millis(1)).await;
        let session = transport.last_session(connection.identity()).unwrap();
        session.emit(TransportEvent::StateChanged {
            status: GattStatus::LINK_LOSS,
            link: LinkState::Disconnected,
        });
        wait_for_state(&connection, ConnectionState::Disconnecting).await;
        connection.disconnect();
        connection.wait_terminated().await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.open_count(connection.identity()), 1);
        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::UserRequested]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_from_idle_reports_directly() {
        let (connection, transport, mut rx) = setup(MockBehavior::healthy());
        connection.disconnect();
        assert_eq!(connection.state(), ConnectionState::Terminated);
        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::UserRequested]
        );
        assert_eq!(transport.open_count(connection.identity()), 0);

        connection.disconnect();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_channel_closed() {
        let (connection, transport, mut rx) = setup(MockBehavior::manual());
        connection.connect();
        sleep(Duration::from_millis(1)).await;
        transport
            .last_session(connection.identity())
            .unwrap()
            .drop_events();
        connection.wait_terminated().await;
        assert_eq!(
            terminations(&drain(&mut rx)),
            vec![DisconnectReason::TransportClosed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_termination() {
        let (connection, transport, _rx) = setup(MockBehavior::healthy());
        connection.connect();
        wait_for_state(&connection, ConnectionState::Streaming).await;
        connection.disconnect();
        connection.wait_terminated().await;

        assert!(connection.connect());
        wait_for_state(&connection, ConnectionState::Streaming).await;
        assert_eq!(transport.open_count(connection.identity()), 2);
    }
}

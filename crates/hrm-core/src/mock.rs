//! Scriptable collaborators for testing.
//!
//! [`MockScanner`] and [`MockTransport`] implement the collaborator traits
//! without any radio. Every call is recorded, and sessions either answer
//! requests on their own ([`MockBehavior::healthy`]) or wait for the test to
//! push [`TransportEvent`]s by hand ([`MockBehavior::manual`]).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hrm_core::{HeartRateManager, ManagerConfig, MockScanner, MockTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(MockTransport::new());
//!     let manager = HeartRateManager::new(ManagerConfig::default(), transport.clone()).unwrap();
//!     manager.init(Arc::new(MockScanner::new())).await;
//!     assert!(manager.connect_to("AA:BB:CC:DD:EE:FF").await);
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use hrm_types::uuid::{BODY_SENSOR_LOCATION, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use hrm_types::{
    DeviceIdentity, DiscoveryRecord, GattCharacteristic, GattService, GattStatus, LinkState,
    ScanFailureReason, ScanState,
};

use crate::error::{Error, Result};
use crate::traits::{
    GattSession, ScanEvent, ScanEventSender, Scanner, SessionHandle, Transport, TransportEvent,
    TransportEventSender,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A mock scanner.
#[derive(Debug, Default)]
pub struct MockScanner {
    state: Mutex<ScanState>,
    failures: Mutex<Vec<ScanFailureReason>>,
    sink: Mutex<Option<ScanEventSender>>,
    start_count: AtomicU32,
    stop_count: AtomicU32,
}

impl MockScanner {
    /// Create a scanner that is allowed to scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scanner blocked by `failures`.
    pub fn with_failures(failures: Vec<ScanFailureReason>) -> Self {
        let scanner = Self::new();
        scanner.set_failures(failures);
        scanner
    }

    /// Replace the conditions reported by `can_scan`.
    pub fn set_failures(&self, failures: Vec<ScanFailureReason>) {
        *lock(&self.failures) = failures;
    }

    /// Number of `start` calls.
    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Deliver an advertising record. Returns `false` if the scanner is not running.
    pub fn discover(&self, record: DiscoveryRecord) -> bool {
        self.push(ScanEvent::DeviceFound(record))
    }

    /// Report a scan failure and stop, as a real scanner would.
    pub fn fail(&self, reason: ScanFailureReason) -> bool {
        let delivered = self.push(ScanEvent::Error(reason));
        *lock(&self.state) = ScanState::Idle;
        *lock(&self.sink) = None;
        delivered
    }

    fn push(&self, event: ScanEvent) -> bool {
        match lock(&self.sink).as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn start(&self, events: ScanEventSender) -> Result<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        *lock(&self.sink) = Some(events);
        *lock(&self.state) = ScanState::Scanning;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        *lock(&self.sink) = None;
        *lock(&self.state) = ScanState::Idle;
        Ok(())
    }

    fn state(&self) -> ScanState {
        *lock(&self.state)
    }

    async fn can_scan(&self) -> Vec<ScanFailureReason> {
        lock(&self.failures).clone()
    }
}

/// How a [`MockSession`] answers requests on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBehavior {
    /// Status of the link-up event sent right after opening; `None` sends nothing.
    pub connect_status: Option<GattStatus>,
    /// Answer to service discovery; `None` sends nothing.
    pub discovery: Option<(GattStatus, Vec<GattService>)>,
    /// Status of the descriptor write answer; `None` sends nothing.
    pub subscribe_status: Option<GattStatus>,
    /// Whether a disconnect request is confirmed with a clean link-down event.
    pub answer_disconnect: bool,
}

impl MockBehavior {
    /// A sensor that connects, exposes the standard service and confirms everything.
    pub fn healthy() -> Self {
        Self {
            connect_status: Some(GattStatus::SUCCESS),
            discovery: Some((
                GattStatus::SUCCESS,
                vec![GattService::new(
                    HEART_RATE_SERVICE,
                    [BODY_SENSOR_LOCATION, HEART_RATE_MEASUREMENT],
                )],
            )),
            subscribe_status: Some(GattStatus::SUCCESS),
            answer_disconnect: true,
        }
    }

    /// A session that never answers on its own.
    pub fn manual() -> Self {
        Self {
            connect_status: None,
            discovery: None,
            subscribe_status: None,
            answer_disconnect: false,
        }
    }

    /// Answer discovery with `services`.
    pub fn services(mut self, services: Vec<GattService>) -> Self {
        let status = self.discovery.as_ref().map_or(GattStatus::SUCCESS, |d| d.0);
        self.discovery = Some((status, services));
        self
    }

    /// Answer discovery with `status` and no services.
    pub fn discovery_status(mut self, status: GattStatus) -> Self {
        self.discovery = Some((status, Vec::new()));
        self
    }

    /// Answer the descriptor write with `status`.
    pub fn subscribe_status(mut self, status: GattStatus) -> Self {
        self.subscribe_status = Some(status);
        self
    }

    /// Whether disconnect requests are confirmed.
    pub fn answer_disconnect(mut self, answer: bool) -> Self {
        self.answer_disconnect = answer;
        self
    }
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self::healthy()
    }
}

/// A request recorded by a [`MockSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    DiscoverServices,
    EnableNotifications(Uuid),
    Disconnect,
    Close,
    RefreshCache,
}

/// A mock GATT session.
#[derive(Debug)]
pub struct MockSession {
    identity: DeviceIdentity,
    behavior: MockBehavior,
    events: Mutex<Option<TransportEventSender>>,
    calls: Mutex<Vec<SessionCall>>,
    subscribed: Mutex<Option<GattCharacteristic>>,
}

impl MockSession {
    fn new(identity: DeviceIdentity, behavior: MockBehavior, events: TransportEventSender) -> Self {
        Self {
            identity,
            behavior,
            events: Mutex::new(Some(events)),
            calls: Mutex::new(Vec::new()),
            subscribed: Mutex::new(None),
        }
    }

    /// Device this session belongs to.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Requests received so far, in order.
    pub fn calls(&self) -> Vec<SessionCall> {
        lock(&self.calls).clone()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.calls).contains(&SessionCall::Close)
    }

    /// Push an event to the connection. Returns `false` once the session is closed.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match lock(&self.events).as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    /// Notify a value on the subscribed characteristic.
    ///
    /// Falls back to the standard measurement characteristic before a
    /// subscription was requested.
    pub fn notify(&self, value: &[u8]) -> bool {
        let characteristic = lock(&self.subscribed).clone().unwrap_or(GattCharacteristic {
            uuid: HEART_RATE_MEASUREMENT,
            service_uuid: HEART_RATE_SERVICE,
        });
        self.emit(TransportEvent::ValueChanged {
            characteristic,
            value: value.to_vec(),
        })
    }

    /// Drop the event sender, as a crashed stack would.
    pub fn drop_events(&self) {
        *lock(&self.events) = None;
    }

    fn record(&self, call: SessionCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl GattSession for MockSession {
    async fn discover_services(&self) -> Result<()> {
        self.record(SessionCall::DiscoverServices);
        if let Some((status, services)) = self.behavior.discovery.clone() {
            self.emit(TransportEvent::ServicesDiscovered { status, services });
        }
        Ok(())
    }

    async fn enable_notifications(&self, characteristic: &GattCharacteristic) -> Result<()> {
        self.record(SessionCall::EnableNotifications(characteristic.uuid));
        *lock(&self.subscribed) = Some(characteristic.clone());
        if let Some(status) = self.behavior.subscribe_status {
            self.emit(TransportEvent::DescriptorWritten {
                characteristic: characteristic.clone(),
                status,
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(SessionCall::Disconnect);
        if lock(&self.events).is_none() {
            return Err(Error::NotConnected);
        }
        if self.behavior.answer_disconnect {
            self.emit(TransportEvent::StateChanged {
                status: GattStatus::SUCCESS,
                link: LinkState::Disconnected,
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(SessionCall::Close);
        *lock(&self.events) = None;
    }

    async fn refresh_cache(&self) -> bool {
        self.record(SessionCall::RefreshCache);
        true
    }
}

/// A mock transport handing out [`MockSession`]s.
#[derive(Debug, Default)]
pub struct MockTransport {
    behavior: Mutex<MockBehavior>,
    overrides: Mutex<HashMap<DeviceIdentity, MockBehavior>>,
    open_error: Mutex<Option<String>>,
    open_stalled: AtomicBool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockTransport {
    /// Create a transport whose sessions behave like healthy sensors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with a default session behavior.
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Self::default()
        }
    }

    /// Use `behavior` for sessions to `identity` opened from now on.
    pub fn set_behavior(&self, identity: impl Into<DeviceIdentity>, behavior: MockBehavior) {
        lock(&self.overrides).insert(identity.into(), behavior);
    }

    /// Make every following `open` fail with `message`.
    pub fn fail_open(&self, message: impl Into<String>) {
        *lock(&self.open_error) = Some(message.into());
    }

    /// Make every following `open` hang until the caller gives up.
    pub fn stall_open(&self) {
        self.open_stalled.store(true, Ordering::SeqCst);
    }

    /// Sessions opened to `identity`, oldest first.
    pub fn sessions(&self, identity: &DeviceIdentity) -> Vec<Arc<MockSession>> {
        lock(&self.sessions)
            .iter()
            .filter(|s| &s.identity == identity)
            .cloned()
            .collect()
    }

    /// Most recent session opened to `identity`.
    pub fn last_session(&self, identity: &DeviceIdentity) -> Option<Arc<MockSession>> {
        self.sessions(identity).pop()
    }

    /// Number of sessions opened to `identity`.
    pub fn open_count(&self, identity: &DeviceIdentity) -> usize {
        self.sessions(identity).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        identity: &DeviceIdentity,
        events: TransportEventSender,
    ) -> Result<SessionHandle> {
        if let Some(message) = lock(&self.open_error).clone() {
            return Err(Error::transport(message));
        }
        if self.open_stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let behavior = lock(&self.overrides)
            .get(identity)
            .cloned()
            .unwrap_or_else(|| lock(&self.behavior).clone());
        let session = Arc::new(MockSession::new(identity.clone(), behavior, events));
        if let Some(status) = session.behavior.connect_status {
            session.emit(TransportEvent::StateChanged {
                status,
                link: LinkState::Connected,
            });
        }
        lock(&self.sessions).push(Arc::clone(&session));
        Ok(session as SessionHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_scanner_records_calls() {
        let scanner = MockScanner::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!scanner.discover(DiscoveryRecord::new("aa", vec![])));

        scanner.start(tx).await.unwrap();
        assert_eq!(scanner.state(), ScanState::Scanning);
        assert!(scanner.discover(DiscoveryRecord::new("aa", vec![HEART_RATE_SERVICE])));
        assert!(matches!(rx.recv().await, Some(ScanEvent::DeviceFound(_))));

        scanner.stop().await.unwrap();
        assert_eq!(scanner.state(), ScanState::Idle);
        assert_eq!((scanner.start_count(), scanner.stop_count()), (1, 1));
    }

    #[tokio::test]
    async fn test_scanner_failures() {
        let scanner = MockScanner::with_failures(vec![ScanFailureReason::BluetoothOff]);
        assert_eq!(scanner.can_scan().await, vec![ScanFailureReason::BluetoothOff]);
        scanner.set_failures(Vec::new());
        assert!(scanner.can_scan().await.is_empty());
    }

    #[tokio::test]
    async fn test_healthy_session_answers() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let identity = DeviceIdentity::new("aa");
        let session = transport.open(&identity, tx).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::StateChanged {
                link: LinkState::Connected,
                ..
            })
        ));
        session.discover_services().await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::ServicesDiscovered { services, .. }) if services.len() == 1
        ));
        assert_eq!(transport.open_count(&identity), 1);
    }

    #[tokio::test]
    async fn test_closed_session_stops_emitting() {
        let transport = MockTransport::with_behavior(MockBehavior::manual());
        let (tx, _rx) = mpsc::unbounded_channel();
        let identity = DeviceIdentity::new("aa");
        transport.open(&identity, tx).await.unwrap();
        let session = transport.last_session(&identity).unwrap();

        assert!(session.notify(&[0, 60]));
        session.close().await;
        assert!(session.is_closed());
        assert!(!session.notify(&[0, 60]));
        assert!(session.disconnect().await.is_err());
    }

    #[tokio::test]
    async fn test_per_device_behavior() {
        let transport = MockTransport::new();
        transport.set_behavior("bb", MockBehavior::manual());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(&DeviceIdentity::new("bb"), tx).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_failure() {
        let transport = MockTransport::new();
        transport.fail_open("no adapter");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport
            .open(&DeviceIdentity::new("aa"), tx)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("no adapter"));
    }
}

//! btleplug backend for desktop BLE stacks.
//!
//! [`BtleplugScanner`] and [`BtleplugTransport`] implement the collaborator
//! traits on top of btleplug (BlueZ, CoreBluetooth, WinRT).
//!
//! # Platform Differences
//!
//! - **macOS**: peripherals report an all-zero address, so the CoreBluetooth
//!   peripheral UUID is used as the [`DeviceIdentity`].
//! - **Linux/Windows**: the Bluetooth MAC address is the identity.
//!
//! btleplug has no service cache to invalidate, so
//! [`GattSession::refresh_cache`] always returns `false` here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

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

/// Get the first available Bluetooth adapter.
pub async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or(Error::NoAdapter)
}

fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Identity of a peripheral: its address, or the peripheral id where the
/// platform hides addresses.
fn identity_of(address: &str, id: &PeripheralId) -> DeviceIdentity {
    if address == "00:00:00:00:00:00" {
        DeviceIdentity::new(format_peripheral_id(id))
    } else {
        DeviceIdentity::new(address)
    }
}

fn scan_failure(error: &btleplug::Error) -> ScanFailureReason {
    match error {
        btleplug::Error::PermissionDenied => ScanFailureReason::MissingPermission,
        btleplug::Error::NotSupported(_) => ScanFailureReason::BluetoothUnsupported,
        other => ScanFailureReason::Unknown(other.to_string()),
    }
}

async fn discovery_record(adapter: &Adapter, id: &PeripheralId) -> Result<Option<DiscoveryRecord>> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    let services = properties.services;
    Ok(Some(DiscoveryRecord {
        identity: identity_of(&properties.address.to_string(), id),
        name: properties.local_name,
        services: (!services.is_empty()).then_some(services),
        rssi: properties.rssi,
    }))
}

/// Scanner backed by a btleplug adapter.
pub struct BtleplugScanner {
    adapter: Adapter,
    scanning: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for BtleplugScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugScanner")
            .field("scanning", &self.scanning.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BtleplugScanner {
    /// Create a scanner on `adapter`.
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            scanning: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
        }
    }

    fn stop_pump(&self) {
        if let Some(cancel) = lock(&self.cancel).take() {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl Scanner for BtleplugScanner {
    async fn start(&self, events: ScanEventSender) -> Result<()> {
        self.stop_pump();
        let mut stream = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.scanning.store(true, Ordering::SeqCst);
        info!("BLE scan started");

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = Some(cancel.clone());
        let adapter = self.adapter.clone();
        let scanning = Arc::clone(&self.scanning);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                        scanning.store(false, Ordering::SeqCst);
                        let _ = events.send(ScanEvent::Error(ScanFailureReason::BluetoothOff));
                        break;
                    }
                    _ => continue,
                };
                match discovery_record(&adapter, &id).await {
                    Ok(Some(record)) => {
                        if events.send(ScanEvent::DeviceFound(record)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Error processing peripheral: {}", e),
                }
            }
            debug!("Scan event pump stopped");
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_pump();
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.adapter.stop_scan().await?;
            info!("BLE scan stopped");
        }
        Ok(())
    }

    fn state(&self) -> ScanState {
        if self.scanning.load(Ordering::SeqCst) {
            ScanState::Scanning
        } else {
            ScanState::Idle
        }
    }

    async fn can_scan(&self) -> Vec<ScanFailureReason> {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOff) => vec![ScanFailureReason::BluetoothOff],
            Ok(_) => Vec::new(),
            Err(e) => vec![scan_failure(&e)],
        }
    }
}

/// Transport opening btleplug peripheral sessions.
#[derive(Debug, Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Create a transport on the first available adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(first_adapter().await?))
    }

    /// Create a transport on `adapter`.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// The adapter sessions are opened on.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_peripheral(&self, identity: &DeviceIdentity) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if &identity_of(&properties.address.to_string(), &peripheral.id()) == identity {
                return Ok(peripheral);
            }
        }
        Err(Error::device_not_found(identity.as_str()))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn open(
        &self,
        identity: &DeviceIdentity,
        events: TransportEventSender,
    ) -> Result<SessionHandle> {
        let peripheral = self.find_peripheral(identity).await?;
        let session = BtleplugSession::new(identity.clone(), self.adapter.clone(), peripheral, events);
        session.spawn_connect();
        Ok(Arc::new(session) as SessionHandle)
    }
}

struct SessionInner {
    identity: DeviceIdentity,
    adapter: Adapter,
    peripheral: Peripheral,
    events: Mutex<Option<TransportEventSender>>,
    subscribed: Mutex<Vec<GattCharacteristic>>,
    disconnect_requested: AtomicBool,
    pumping: AtomicBool,
    cancel: CancellationToken,
}

impl SessionInner {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn find_characteristic(&self, target: &GattCharacteristic) -> Option<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.uuid && c.service_uuid == target.service_uuid)
    }
}

/// One btleplug peripheral session.
pub struct BtleplugSession {
    inner: Arc<SessionInner>,
}

impl BtleplugSession {
    fn new(
        identity: DeviceIdentity,
        adapter: Adapter,
        peripheral: Peripheral,
        events: TransportEventSender,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                identity,
                adapter,
                peripheral,
                events: Mutex::new(Some(events)),
                subscribed: Mutex::new(Vec::new()),
                disconnect_requested: AtomicBool::new(false),
                pumping: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connect in the background and then watch for the link going down.
    fn spawn_connect(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Subscribe before connecting so a quick drop is not missed.
            let mut central = match inner.adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{}: cannot watch adapter events: {}", inner.identity, e);
                    inner.emit(TransportEvent::StateChanged {
                        status: GattStatus::GATT_ERROR,
                        link: LinkState::Disconnected,
                    });
                    return;
                }
            };

            let connected = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                connected = inner.peripheral.connect() => connected,
            };
            if let Err(e) = connected {
                debug!("{}: connect failed: {}", inner.identity, e);
                let status = match e {
                    btleplug::Error::TimedOut(_) => GattStatus::CONNECTION_TIMEOUT,
                    _ => GattStatus::GATT_ERROR,
                };
                inner.emit(TransportEvent::StateChanged {
                    status,
                    link: LinkState::Disconnected,
                });
                return;
            }
            inner.emit(TransportEvent::StateChanged {
                status: GattStatus::SUCCESS,
                link: LinkState::Connected,
            });

            let id = inner.peripheral.id();
            loop {
                let event = tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    event = central.next() => event,
                };
                match event {
                    Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                        let status = if inner.disconnect_requested.load(Ordering::SeqCst) {
                            GattStatus::SUCCESS
                        } else {
                            GattStatus::LINK_LOSS
                        };
                        inner.emit(TransportEvent::StateChanged {
                            status,
                            link: LinkState::Disconnected,
                        });
                        return;
                    }
                    Some(CentralEvent::StateUpdate(CentralState::PoweredOff)) => {
                        inner.emit(TransportEvent::StateChanged {
                            status: GattStatus::LINK_LOSS,
                            link: LinkState::Disconnected,
                        });
                        return;
                    }
                    Some(_) => {}
                    None => return,
                }
            }
        });
    }

    fn spawn_notification_pump(inner: Arc<SessionInner>) {
        tokio::spawn(async move {
            let mut stream = match inner.peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{}: notification stream unavailable: {}", inner.identity, e);
                    return;
                }
            };
            loop {
                let notification = tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    notification = stream.next() => notification,
                };
                let Some(notification) = notification else {
                    return;
                };
                let characteristic = lock(&inner.subscribed)
                    .iter()
                    .find(|c| c.uuid == notification.uuid)
                    .cloned();
                if let Some(characteristic) = characteristic {
                    inner.emit(TransportEvent::ValueChanged {
                        characteristic,
                        value: notification.value,
                    });
                }
            }
        });
    }
}

#[async_trait]
impl GattSession for BtleplugSession {
    async fn discover_services(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let event = match inner.peripheral.discover_services().await {
                Ok(()) => {
                    let services = inner
                        .peripheral
                        .services()
                        .into_iter()
                        .map(|s| GattService::new(s.uuid, s.characteristics.iter().map(|c| c.uuid)))
                        .collect();
                    TransportEvent::ServicesDiscovered {
                        status: GattStatus::SUCCESS,
                        services,
                    }
                }
                Err(e) => {
                    warn!("{}: service discovery failed: {}", inner.identity, e);
                    TransportEvent::ServicesDiscovered {
                        status: GattStatus::GATT_ERROR,
                        services: Vec::new(),
                    }
                }
            };
            inner.emit(event);
        });
        Ok(())
    }

    async fn enable_notifications(&self, characteristic: &GattCharacteristic) -> Result<()> {
        let target = self.inner.find_characteristic(characteristic).ok_or_else(|| {
            Error::InvalidData(format!("characteristic {} not discovered", characteristic.uuid))
        })?;
        lock(&self.inner.subscribed).push(characteristic.clone());
        if !self.inner.pumping.swap(true, Ordering::SeqCst) {
            Self::spawn_notification_pump(Arc::clone(&self.inner));
        }

        let inner = Arc::clone(&self.inner);
        let characteristic = characteristic.clone();
        tokio::spawn(async move {
            let status = match inner.peripheral.subscribe(&target).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("{}: subscribe failed: {}", inner.identity, e);
                    GattStatus::GATT_ERROR
                }
            };
            inner.emit(TransportEvent::DescriptorWritten {
                characteristic,
                status,
            });
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect_requested.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.peripheral.disconnect().await {
                debug!("{}: disconnect failed: {}", inner.identity, e);
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.inner.cancel.cancel();
        *lock(&self.inner.events) = None;
        if self.inner.peripheral.is_connected().await.unwrap_or(false) {
            let _ = self.inner.peripheral.disconnect().await;
        }
    }

    async fn refresh_cache(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires BLE hardware"]
    async fn test_adapter_reports_scan_conditions() {
        let adapter = first_adapter().await.unwrap();
        let scanner = BtleplugScanner::new(adapter);
        let _ = scanner.can_scan().await;
        assert_eq!(scanner.state(), ScanState::Idle);
    }

    #[test]
    fn test_scan_failure_mapping() {
        assert_eq!(
            scan_failure(&btleplug::Error::PermissionDenied),
            ScanFailureReason::MissingPermission
        );
        assert_eq!(
            scan_failure(&btleplug::Error::NotSupported("le".into())),
            ScanFailureReason::BluetoothUnsupported
        );
        assert!(matches!(
            scan_failure(&btleplug::Error::NotConnected),
            ScanFailureReason::Unknown(_)
        ));
    }
}

//! Hardware integration tests for hrm-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```
//! cargo test --package hrm-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Set `HRM_DEVICE` to the address of a sensor that is switched on and worn.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use hrm_core::{
    BtleplugScanner, BtleplugTransport, DeviceIdentity, HeartRateManager, ManagerConfig,
    ManagerEvent, ManagerState, Scanner,
};
use tokio::time::{sleep, timeout};

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

fn get_device() -> Option<DeviceIdentity> {
    env::var("HRM_DEVICE")
        .ok()
        .filter(|s| !s.is_empty())
        .map(DeviceIdentity::new)
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_finds_heart_rate_sensor() {
    let transport = Arc::new(BtleplugTransport::new().await.expect("adapter"));
    let scanner = Arc::new(BtleplugScanner::new(transport.adapter().clone()));
    assert!(scanner.can_scan().await.is_empty(), "Bluetooth unavailable");

    let manager = HeartRateManager::new(ManagerConfig::default(), transport).unwrap();
    manager.init(scanner).await;
    let mut events = manager.subscribe();
    manager.start_scanning().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Scanning);

    let found = timeout(BLE_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let ManagerEvent::DeviceFound { identity, .. } = event {
                return Some(identity);
            }
        }
        None
    })
    .await;
    manager.destroy().await;

    let identity = found.expect("scan timed out").expect("no sensor found");
    println!("Found sensor {}", identity);
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_stream_and_disconnect() {
    let Some(identity) = get_device() else {
        println!("Skipping: HRM_DEVICE not set");
        return;
    };

    let transport = Arc::new(BtleplugTransport::new().await.expect("adapter"));
    let scanner = Arc::new(BtleplugScanner::new(transport.adapter().clone()));
    let manager = HeartRateManager::new(ManagerConfig::default(), transport).unwrap();
    manager.init(scanner).await;
    let mut events = manager.subscribe();

    // The adapter only knows peripherals it has seen advertising.
    manager.start_scanning().await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert!(manager.connect_to(identity.clone()).await);

    let reading = timeout(BLE_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let ManagerEvent::ValueChanged { reading } = event {
                return Some(reading);
            }
        }
        None
    })
    .await
    .expect("no reading within timeout")
    .expect("event stream closed");
    println!("{}: {} bpm", reading.identity, reading.value);
    assert!(reading.value > 0);

    assert!(manager.disconnect(&identity).await);
    timeout(BLE_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if matches!(event, ManagerEvent::DeviceDisconnected { .. }) {
                break;
            }
        }
    })
    .await
    .expect("no disconnect notification");
    assert_eq!(manager.connection_count().await, 0);
}

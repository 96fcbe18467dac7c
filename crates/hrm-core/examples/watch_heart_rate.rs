//! Scan for heart-rate sensors, connect to every one found and print readings

use std::sync::Arc;
use std::time::Duration;

use hrm_core::{BtleplugScanner, BtleplugTransport, HeartRateManager, ManagerConfig, ManagerEvent};
use tokio::time::timeout;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let duration = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60));

    let transport = Arc::new(BtleplugTransport::new().await?);
    let scanner = Arc::new(BtleplugScanner::new(transport.adapter().clone()));
    let manager = HeartRateManager::new(ManagerConfig::default(), transport)?;
    manager.init(scanner).await;

    let mut events = manager.subscribe();
    manager.start_scanning().await?;
    println!("Watching for {:?}...", duration);

    let _ = timeout(duration, async {
        while let Some(event) = events.recv().await {
            match event {
                ManagerEvent::DeviceFound { identity, name, .. } => {
                    println!("Found {} ({})", identity, name.as_deref().unwrap_or("unnamed"));
                    manager.connect_to(identity).await;
                }
                ManagerEvent::DeviceConnected { identity } => println!("Connected to {}", identity),
                ManagerEvent::ValueChanged { reading } => {
                    println!("{}: {} bpm", reading.identity, reading.value);
                }
                ManagerEvent::DeviceDisconnected { identity, reason } => {
                    println!("{} disconnected: {}", identity, reason);
                }
                ManagerEvent::UnableToStart { reason } => {
                    eprintln!("Cannot scan: {}", reason);
                    break;
                }
                _ => {}
            }
        }
    })
    .await;

    manager.destroy().await;
    Ok(())
}

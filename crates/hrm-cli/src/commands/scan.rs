//! Scan command implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use hrm_core::{ManagerConfig, ManagerEvent};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use crate::cli::OutputFormat;
use crate::format::{FoundDevice, format_scan_json, format_scan_text};

pub async fn cmd_scan(
    timeout: u64,
    format: OutputFormat,
    quiet: bool,
    config: ManagerConfig,
) -> Result<()> {
    let manager = super::open_manager(config).await?;
    let mut events = manager.subscribe();

    if !quiet {
        eprintln!("Scanning for heart-rate sensors ({}s)...", timeout);
    }
    manager
        .start_scanning()
        .await
        .context("Failed to start scanning")?;

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let devices = collect_devices(&mut events, deadline).await;

    manager.stop_scanning().await;
    manager.destroy().await;

    let content = match format {
        OutputFormat::Text => format_scan_text(&devices),
        OutputFormat::Json => format_scan_json(&devices)?,
    };
    print!("{}", content);
    Ok(())
}

/// Gather discovered sensors until `deadline`, keeping the latest RSSI and
/// any name seen for each.
async fn collect_devices(
    events: &mut mpsc::UnboundedReceiver<ManagerEvent>,
    deadline: Instant,
) -> Vec<FoundDevice> {
    let mut found = BTreeMap::new();
    while let Ok(Some(event)) = timeout_at(deadline, events.recv()).await {
        match event {
            ManagerEvent::DeviceFound {
                identity,
                name,
                rssi,
            } => {
                let entry = found.entry(identity.clone()).or_insert(FoundDevice {
                    identity,
                    name: None,
                    rssi: None,
                });
                if name.is_some() {
                    entry.name = name;
                }
                if rssi.is_some() {
                    entry.rssi = rssi;
                }
            }
            ManagerEvent::UnableToStart { reason } => {
                tracing::warn!("Scanning interrupted: {}", reason);
                break;
            }
            _ => {}
        }
    }
    found.into_values().collect()
}

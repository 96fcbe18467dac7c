//! Command implementations for the CLI.

mod check;
mod monitor;
mod scan;

use std::sync::Arc;

use anyhow::{Context, Result};
use hrm_core::{BtleplugScanner, BtleplugTransport, HeartRateManager, ManagerConfig};

pub use check::cmd_check;
pub use monitor::{MonitorArgs, cmd_monitor};
pub use scan::cmd_scan;

/// Create a manager on the first Bluetooth adapter with a scanner attached.
async fn open_manager(config: ManagerConfig) -> Result<Arc<HeartRateManager>> {
    let transport = Arc::new(
        BtleplugTransport::new()
            .await
            .context("Failed to open Bluetooth adapter")?,
    );
    let scanner = Arc::new(BtleplugScanner::new(transport.adapter().clone()));
    let manager = HeartRateManager::new(config, transport)?;
    manager.init(scanner).await;
    Ok(manager)
}

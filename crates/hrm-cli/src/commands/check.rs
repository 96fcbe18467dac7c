//! Check command implementation.

use anyhow::Result;
use hrm_core::ManagerConfig;

use crate::format::format_check_text;

/// Print whatever currently blocks scanning. Fails if anything does.
pub async fn cmd_check(config: ManagerConfig) -> Result<()> {
    let manager = super::open_manager(config).await?;
    let reasons = manager.can_scan().await?;
    manager.destroy().await;

    print!("{}", format_check_text(&reasons));
    if !reasons.is_empty() {
        anyhow::bail!("{} condition(s) prevent scanning", reasons.len());
    }
    Ok(())
}

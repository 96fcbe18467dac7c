//! Monitor command implementation.
//!
//! Connects to the given sensors (or the first one a scan finds) and prints
//! every event until interrupted, the duration elapses, or all connections
//! have terminated.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use anyhow::Result;
use hrm_core::{DeviceIdentity, ManagerConfig, ManagerEvent, ManagerState};
use tokio::sync::mpsc;

use crate::cli::OutputFormat;
use crate::format::{format_event_json, format_event_text};

/// Arguments for the monitor command.
pub struct MonitorArgs {
    pub devices: Vec<String>,
    pub duration: Option<u64>,
    pub format: OutputFormat,
    pub quiet: bool,
}

pub async fn cmd_monitor(args: MonitorArgs, config: ManagerConfig) -> Result<()> {
    let manager = super::open_manager(config).await?;
    let mut events = manager.subscribe();

    let discover = args.devices.is_empty();
    if discover {
        if !args.quiet {
            eprintln!("No device given, connecting to the first sensor found...");
        }
        manager.start_scanning().await?;
    } else {
        for device in &args.devices {
            manager.connect_to(DeviceIdentity::new(device)).await;
        }
    }

    let stop = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    let mut out = std::io::stdout();
    let result = pump_events(&mut events, stop, args.format, discover, &mut out, |identity| {
        let manager = manager.clone();
        async move {
            manager.connect_to(identity).await;
            manager.connection_count().await
        }
    })
    .await;

    manager.destroy().await;
    result
}

/// Print events until `stop` completes or no connections remain.
///
/// When `discover` is set, the first sensor found is connected through
/// `connect`, which returns the number of live connections afterwards.
async fn pump_events<W, S, C, F>(
    events: &mut mpsc::UnboundedReceiver<ManagerEvent>,
    stop: S,
    format: OutputFormat,
    discover: bool,
    out: &mut W,
    connect: C,
) -> Result<()>
where
    W: std::io::Write,
    S: Future<Output = ()>,
    C: Fn(DeviceIdentity) -> F,
    F: Future<Output = usize>,
{
    let mut stop = pin!(stop);
    let mut connected = false;
    loop {
        let event = tokio::select! {
            _ = &mut stop => return Ok(()),
            event = events.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        match format {
            OutputFormat::Text => {
                if let Some(line) = format_event_text(&event) {
                    writeln!(out, "{}", line)?;
                }
            }
            OutputFormat::Json => writeln!(out, "{}", format_event_json(&event)?)?,
        }
        out.flush()?;

        match event {
            ManagerEvent::DeviceFound { identity, .. } if discover && !connected => {
                connected = connect(identity).await > 0;
            }
            ManagerEvent::UnableToStart { reason } => {
                anyhow::bail!("Unable to scan: {}", reason);
            }
            ManagerEvent::ManagerStateChanged { state }
                if state == ManagerState::Disconnected && (connected || !discover) =>
            {
                return Ok(());
            }
            _ => {}
        }
    }
}

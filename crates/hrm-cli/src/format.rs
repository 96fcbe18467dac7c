//! Output formatting for scan results and monitor events.

use anyhow::Result;
use hrm_core::{DeviceIdentity, HeartRateReading, ManagerEvent, ScanFailureReason, SensorContact};
use serde::Serialize;

/// A sensor seen during `scan`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundDevice {
    pub identity: DeviceIdentity,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

pub fn format_scan_text(devices: &[FoundDevice]) -> String {
    if devices.is_empty() {
        return "No heart-rate sensors found.\n".to_string();
    }
    let mut out = format!("Found {} heart-rate sensor(s):\n\n", devices.len());
    out.push_str(&format!("{:<40} {:<24} {:>6}\n", "ADDRESS", "NAME", "RSSI"));
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<40} {:<24} {:>6}\n",
            device.identity,
            device.name.as_deref().unwrap_or("(unnamed)"),
            rssi
        ));
    }
    out
}

pub fn format_scan_json(devices: &[FoundDevice]) -> Result<String> {
    Ok(serde_json::to_string_pretty(devices)? + "\n")
}

pub fn format_check_text(reasons: &[ScanFailureReason]) -> String {
    if reasons.is_empty() {
        return "Ready to scan.\n".to_string();
    }
    let mut out = String::from("Scanning is blocked:\n");
    for reason in reasons {
        out.push_str(&format!("  - {}\n", reason));
    }
    out
}

fn contact_label(contact: SensorContact) -> Option<&'static str> {
    match contact {
        SensorContact::NotSupported => None,
        SensorContact::NotDetected => Some("no contact"),
        SensorContact::Detected => Some("contact"),
    }
}

pub fn format_reading_text(reading: &HeartRateReading) -> String {
    let mut line = format!("{}  {:>3} bpm", reading.identity, reading.value);
    if let Some(contact) = contact_label(reading.sensor_contact) {
        line.push_str(&format!("  [{}]", contact));
    }
    if let Some(energy) = reading.energy_expended {
        line.push_str(&format!("  {} kJ", energy));
    }
    if !reading.rr_intervals.is_empty() {
        let rr: Vec<String> = reading
            .rr_intervals
            .iter()
            .map(|rr| format!("{}", u32::from(*rr) * 1000 / 1024))
            .collect();
        line.push_str(&format!("  rr {} ms", rr.join(",")));
    }
    line
}

/// One line of text for a monitor event, or `None` for events not shown.
pub fn format_event_text(event: &ManagerEvent) -> Option<String> {
    match event {
        ManagerEvent::ValueChanged { reading } => Some(format_reading_text(reading)),
        ManagerEvent::DeviceConnected { identity } => Some(format!("{}  connected", identity)),
        ManagerEvent::DeviceDisconnected { identity, reason } => {
            Some(format!("{}  disconnected: {}", identity, reason))
        }
        ManagerEvent::UnableToStart { reason } => Some(format!("unable to scan: {}", reason)),
        ManagerEvent::ManagerStateChanged { state } => Some(format!("state: {}", state)),
        _ => None,
    }
}

/// One JSON object per line.
pub fn format_event_json(event: &ManagerEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

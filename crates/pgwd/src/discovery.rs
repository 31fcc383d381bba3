//! Device discovery.
//!
//! Enumerates candidate serial ports under `/dev` and queries the
//! platform device database for each one's identity. A scan produces a
//! whole [`DeviceInventory`] that replaces the registry's previous one
//! atomically, so a device unplugged between scans simply vanishes.
//!
//! Scans shell out to `udevadm` and run on the blocking pool; the
//! async wrapper never fails, it degrades to an empty inventory so a
//! broken scan cannot take the telemetry loop down with it.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, warn};

use pgw_core::device::{DeviceInventory, DeviceProperties, HardwareId, PortName};

/// Device name prefixes that can host a printer.
const PORT_PREFIXES: &[&str] = &["ttyACM", "ttyUSB"];

/// Platform device database query tool.
const UDEVADM_BIN: &str = "/sbin/udevadm";

/// Errors raised during a discovery scan.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to list device directory {dir}: {source}")]
    ListDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to query properties for {port}: {source}")]
    Query {
        port: String,
        #[source]
        source: std::io::Error,
    },
}

/// Scans attached hardware, replacing errors with an empty inventory.
///
/// This is the form every caller on the async side uses; per-device
/// problems are logged inside the scan and skipped.
pub async fn scan_inventory() -> DeviceInventory {
    match tokio::task::spawn_blocking(scan_devices).await {
        Ok(Ok(inventory)) => inventory,
        Ok(Err(err)) => {
            warn!(error = %err, "Device scan failed");
            DeviceInventory::default()
        }
        Err(err) => {
            warn!(error = %err, "Device scan task failed");
            DeviceInventory::default()
        }
    }
}

/// One blocking discovery pass over `/dev`.
pub fn scan_devices() -> Result<DeviceInventory, DiscoveryError> {
    let ports = candidate_ports(Path::new("/dev"))?;
    let mut devices = Vec::new();

    for port in ports {
        let output = query_udevadm(&port)?;
        match parse_properties(&output) {
            Some(properties) => devices.push((port, properties)),
            None => {
                // No vendor serial: a modem or other non-printer
                // device on a matching port name.
                debug!(port = %port, "Skipping device without serial number");
            }
        }
    }

    Ok(DeviceInventory::from_scan(devices))
}

/// Lists port names under `dir` matching the known printer prefixes.
pub fn candidate_ports(dir: &Path) -> Result<Vec<PortName>, DiscoveryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DiscoveryError::ListDir {
        dir: dir.to_path_buf(),
        source,
    })?;

    let mut ports = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if PORT_PREFIXES.iter().any(|p| name.starts_with(p)) {
            ports.push(PortName::new(name));
        }
    }
    ports.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(ports)
}

fn query_udevadm(port: &PortName) -> Result<String, DiscoveryError> {
    let output = Command::new(UDEVADM_BIN)
        .args(["info", "--query=property", "--name", &port.device_path()])
        .output()
        .map_err(|source| DiscoveryError::Query {
            port: port.to_string(),
            source,
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extracts device identity from `udevadm info --query=property` output.
///
/// Returns `None` when the device carries no `ID_SERIAL_SHORT`; such a
/// device cannot be matched against service-side claims.
pub fn parse_properties(output: &str) -> Option<DeviceProperties> {
    let mut iserial = None;
    let mut vid = None;
    let mut pid = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "ID_SERIAL_SHORT" => iserial = Some(value.to_string()),
            "ID_VENDOR_ID" => vid = Some(value.to_string()),
            "ID_MODEL_ID" => pid = Some(value.to_string()),
            _ => {}
        }
    }

    Some(DeviceProperties {
        iserial: HardwareId::new(iserial?),
        vid: vid.unwrap_or_default(),
        pid: pid.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_parse_full_property_output() {
        let output = "DEVNAME=/dev/ttyACM0\n\
                      ID_SERIAL_SHORT=95238343234351E02191\n\
                      ID_VENDOR_ID=2341\n\
                      ID_MODEL_ID=0042\n\
                      ID_BUS=usb\n";
        let props = parse_properties(output).unwrap();
        assert_eq!(props.iserial, HardwareId::new("95238343234351E02191"));
        assert_eq!(props.vid, "2341");
        assert_eq!(props.pid, "0042");
    }

    #[test]
    fn test_parse_without_serial_is_rejected() {
        let output = "DEVNAME=/dev/ttyACM0\nID_VENDOR_ID=2341\n";
        assert!(parse_properties(output).is_none());
    }

    #[test]
    fn test_parse_tolerates_missing_vendor_ids() {
        let output = "ID_SERIAL_SHORT=ABC123\n";
        let props = parse_properties(output).unwrap();
        assert_eq!(props.iserial, HardwareId::new("ABC123"));
        assert_eq!(props.vid, "");
        assert_eq!(props.pid, "");
    }

    #[test]
    fn test_parse_ignores_junk_lines() {
        let output = "not a property line\nID_SERIAL_SHORT=X\n\n=weird\n";
        let props = parse_properties(output).unwrap();
        assert_eq!(props.iserial, HardwareId::new("X"));
    }

    #[test]
    fn test_candidate_ports_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB1", "ttyACM0", "sda1", "ttyS0", "ttyACM2"] {
            File::create(dir.path().join(name)).unwrap();
        }

        let ports = candidate_ports(dir.path()).unwrap();
        let names: Vec<&str> = ports.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["ttyACM0", "ttyACM2", "ttyUSB1"]);
    }

    #[test]
    fn test_candidate_ports_missing_dir() {
        let err = candidate_ports(Path::new("/nonexistent-dir-for-test")).unwrap_err();
        assert!(matches!(err, DiscoveryError::ListDir { .. }));
    }
}

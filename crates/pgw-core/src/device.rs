//! Device identity and discovery inventory.
//!
//! A physical printer is identified three ways, at different lifetimes:
//! its hardware id (vendor serial, stable across replugs), its port
//! name (final component of the transient OS path, e.g. `ttyACM0`),
//! and the remote identifier assigned by the coordinating service once
//! the device is bound.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Name of a device's OS port, without the `/dev/` prefix.
///
/// Example: `ttyACM0`. Used as the key for live device sessions and to
/// derive the per-device IPC socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortName(String);

impl PortName {
    /// Creates a PortName from an already-trimmed name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derives the port name from a full device path.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidDevicePath`] if the path has no
    /// final component (e.g. `/`).
    pub fn from_path(path: &Path) -> Result<Self, DomainError> {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| Self(n.to_string()))
            .ok_or_else(|| DomainError::InvalidDevicePath {
                path: path.display().to_string(),
            })
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the full OS device path (`/dev/{name}`).
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.0)
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PortName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PortName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PortName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Vendor-assigned serial number identifying a physical device
/// independent of its transient OS path.
///
/// Travels on the wire under the key `iserial`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareId(String);

impl HardwareId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HardwareId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HardwareId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier assigned to a device by the remote coordinating service.
///
/// Present only once the service has bound the device; travels on the
/// wire under the key `uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Device Properties
// ============================================================================

/// Platform properties of a discovered device.
///
/// Queried from the platform device database at discovery time and
/// reported verbatim to the remote service when it is asked to create
/// a machine record (`find_or_create_machine`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Vendor serial number (`ID_SERIAL_SHORT`)
    pub iserial: HardwareId,
    /// USB vendor id (`ID_VENDOR_ID`)
    pub vid: String,
    /// USB product id (`ID_MODEL_ID`)
    pub pid: String,
}

// ============================================================================
// Discovery Inventory
// ============================================================================

/// One discovery pass over the attached hardware.
///
/// Holds both lookup directions produced by a single scan. The whole
/// value is replaced atomically on every re-scan so readers never
/// observe one map updated without the other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInventory {
    /// hardware id → port name, for directed connects
    by_hardware_id: HashMap<HardwareId, PortName>,
    /// port name → platform properties, for machine creation
    properties: HashMap<PortName, DeviceProperties>,
}

impl DeviceInventory {
    /// Builds an inventory from per-device property records.
    pub fn from_scan(devices: impl IntoIterator<Item = (PortName, DeviceProperties)>) -> Self {
        let mut by_hardware_id = HashMap::new();
        let mut properties = HashMap::new();
        for (port, props) in devices {
            by_hardware_id.insert(props.iserial.clone(), port.clone());
            properties.insert(port, props);
        }
        Self {
            by_hardware_id,
            properties,
        }
    }

    /// Resolves a hardware id to its current port name.
    pub fn port_for(&self, hardware_id: &HardwareId) -> Option<&PortName> {
        self.by_hardware_id.get(hardware_id)
    }

    /// Returns the platform properties recorded for a port.
    pub fn properties_for(&self, port: &PortName) -> Option<&DeviceProperties> {
        self.properties.get(port)
    }

    /// Iterates over all discovered ports.
    pub fn ports(&self) -> impl Iterator<Item = &PortName> {
        self.properties.keys()
    }

    /// Returns the hardware id → port name map (wire `iserial_map`).
    pub fn hardware_map(&self) -> &HashMap<HardwareId, PortName> {
        &self.by_hardware_id
    }

    /// Number of devices in this inventory.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

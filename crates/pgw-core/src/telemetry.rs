//! Telemetry snapshot types.
//!
//! The per-second aggregated update sent to the remote service carries
//! one [`MachineUpdate`] per bound device. Field names follow the wire
//! format expected by the coordinating service.

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Last known temperature readings for one device.
///
/// The bed value comes from the driver's `b` key; nozzle values are
/// every reading whose key carries the nozzle marker prefix (`t0`,
/// `t1`, ...), in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    /// Heated-bed temperature, if the driver reported one.
    pub bed: Option<f64>,
    /// One entry per nozzle.
    pub nozzle: Vec<f64>,
}

impl Temperatures {
    /// True once at least one reading (bed or nozzle) has been seen.
    pub fn has_readings(&self) -> bool {
        self.bed.is_some() || !self.nozzle.is_empty()
    }
}

/// Last known job/progress state for one device.
///
/// All fields start unknown and are overwritten by every `info`
/// message from the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    /// Whether the driver is currently executing a print.
    pub printing: Option<bool>,
    /// Line number the driver is currently executing.
    pub current_line: Option<u64>,
    /// Whether the print is paused.
    pub paused: Option<bool>,
    /// Segment phase the driver last reported.
    pub current_segment: Option<String>,
    /// Job currently bound to this device, if any.
    pub job_id: Option<JobId>,
}

/// One device's slice of the aggregated telemetry update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineUpdate {
    pub temperatures: Temperatures,
    pub status: MachineStatus,
}

//! Registry actor commands and snapshot types.
//!
//! This module defines the message types for communicating with the
//! `RegistryActor`. Commands that answer a question carry a oneshot
//! `respond_to` channel; everything else is fire-and-forget, with
//! failures logged inside the actor rather than surfaced to the
//! caller. That split mirrors the remote protocol itself, which never
//! acknowledges individual commands.

use std::path::PathBuf;

use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::oneshot;

use pgw_core::device::{DeviceInventory, PortName, RemoteId};
use pgw_core::job::{JobId, JobState};
use pgw_core::link::LinkState;
use pgw_protocol::{DeviceEvent, MachineClaim, UpdateData};

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Replace the discovery inventory with a fresh scan.
    RefreshInventory { inventory: DeviceInventory },

    /// Build the aggregated telemetry update.
    ///
    /// As a side effect, bindings whose device session has vanished or
    /// gone quiet are pruned and their disconnect notices sent.
    BuildUpdate {
        respond_to: oneshot::Sender<UpdateData>,
    },

    /// Bring up a device session on one port.
    ///
    /// No-op if a session for the port already exists. `baud` and
    /// `protocol` fall back to the configured defaults.
    ConnectMachine {
        port_name: PortName,
        baud: Option<u32>,
        protocol: Option<String>,
    },

    /// Bring up sessions for service-claimed devices.
    ///
    /// Each claim is matched against the inventory by hardware id;
    /// claims for absent devices are skipped. A confirmation check is
    /// scheduled per claim to bind the remote identifier once the
    /// session is up.
    ConnectMachines {
        claims: Vec<MachineClaim>,
        inventory: DeviceInventory,
    },

    /// Bring up a session on the first discovered port that has none,
    /// then ask the service to create a machine record for it.
    ConnectFirstAvailable {
        baud: Option<u32>,
        inventory: DeviceInventory,
    },

    /// A driver IPC socket was connected; adopt the stream.
    Attached {
        port_name: PortName,
        stream: UnixStream,
    },

    /// A decoded event arrived from a device's driver.
    DeviceEvent {
        port_name: PortName,
        event: DeviceEvent,
    },

    /// A device's IPC channel closed (EOF or read error).
    DeviceClosed { port_name: PortName },

    /// Delayed check: bind a claimed device to its remote identifier
    /// if the session came up.
    ConfirmClaim { port_name: PortName, uuid: RemoteId },

    /// Delayed check: ask the service to create a machine record for a
    /// session brought up without a claim.
    ConfirmUnbound { port_name: PortName },

    /// Init watchdog: tear the session down if the device never
    /// produced telemetry.
    InitCheck { port_name: PortName },

    /// Bind a remote identifier to a port on the service's say-so.
    BindMachine {
        uuid: RemoteId,
        port_name: PortName,
    },

    /// Forward raw control commands to a bound device.
    ForwardCommands {
        uuid: RemoteId,
        commands: Vec<Value>,
    },

    /// Replace a bound device's routine set.
    ForwardRoutines { uuid: RemoteId, routines: Value },

    /// Abort the active print on a bound device.
    CancelPrint { uuid: RemoteId },

    /// Resolve which port a remote identifier is bound to.
    PortForUuid {
        uuid: RemoteId,
        respond_to: oneshot::Sender<Option<PortName>>,
    },

    /// A job download is starting.
    JobStarted {
        uuid: RemoteId,
        job_id: JobId,
        path: PathBuf,
    },

    /// A job file is staged locally; report it and start the print.
    JobDownloaded {
        uuid: RemoteId,
        job_id: JobId,
        path: PathBuf,
    },

    /// A job download failed; forget the job.
    JobFailed { uuid: RemoteId, job_id: JobId },

    /// Observe the registry state. Used by tests and the status
    /// surface; never by the hot path.
    GetSnapshot {
        respond_to: oneshot::Sender<GatewaySnapshot>,
    },
}

// ============================================================================
// Snapshot Types
// ============================================================================

/// Point-in-time view of the registry state.
#[derive(Debug, Clone)]
pub struct GatewaySnapshot {
    /// One summary per live device session.
    pub sessions: Vec<SessionSummary>,
    /// Current remote identifier → port bindings.
    pub bindings: Vec<(RemoteId, PortName)>,
    /// Number of devices in the last discovery scan.
    pub inventory_size: usize,
    /// In-flight jobs and their lifecycle stage.
    pub jobs: Vec<(JobId, JobState)>,
}

impl GatewaySnapshot {
    /// Finds the summary for one port.
    pub fn session(&self, port_name: &PortName) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| &s.port_name == port_name)
    }

    /// Resolves a binding by remote identifier.
    pub fn binding(&self, uuid: &RemoteId) -> Option<&PortName> {
        self.bindings
            .iter()
            .find(|(id, _)| id == uuid)
            .map(|(_, port)| port)
    }
}

/// Summary of one device session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub port_name: PortName,
    pub uuid: Option<RemoteId>,
    pub link: LinkState,
    pub job_id: Option<JobId>,
    pub driver_pid: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(port: &str, uuid: Option<&str>) -> SessionSummary {
        SessionSummary {
            port_name: PortName::new(port),
            uuid: uuid.map(RemoteId::new),
            link: LinkState::Connecting,
            job_id: None,
            driver_pid: None,
        }
    }

    #[test]
    fn test_snapshot_lookup_by_port() {
        let snapshot = GatewaySnapshot {
            sessions: vec![summary("ttyACM0", Some("u-1")), summary("ttyUSB0", None)],
            bindings: vec![(RemoteId::new("u-1"), PortName::new("ttyACM0"))],
            inventory_size: 2,
            jobs: vec![],
        };

        assert!(snapshot.session(&PortName::new("ttyUSB0")).is_some());
        assert!(snapshot.session(&PortName::new("ttyACM9")).is_none());
        assert_eq!(
            snapshot.binding(&RemoteId::new("u-1")),
            Some(&PortName::new("ttyACM0"))
        );
        assert!(snapshot.binding(&RemoteId::new("u-9")).is_none());
    }

    #[tokio::test]
    async fn test_command_oneshot_pattern() {
        let (tx, rx) = oneshot::channel::<Option<PortName>>();

        tokio::spawn(async move {
            tx.send(Some(PortName::new("ttyACM0"))).ok();
        });

        let result = rx.await;
        assert_eq!(result.unwrap(), Some(PortName::new("ttyACM0")));
    }
}

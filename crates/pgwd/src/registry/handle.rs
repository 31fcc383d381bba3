//! Cheap-to-clone handle for talking to the registry actor.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use pgw_core::device::{PortName, RemoteId};
use pgw_core::job::JobId;
use pgw_protocol::{MachineClaim, UpdateData};

use crate::discovery::scan_inventory;

use super::commands::{GatewaySnapshot, RegistryCommand};

/// Handle for sending commands to the registry actor.
///
/// Notifications are fire-and-forget: once the actor is gone there is
/// nobody left to act on them, so sends after shutdown vanish without
/// error. Queries return `None` in that case.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Replaces the actor's discovery inventory.
    pub async fn refresh_inventory(&self, inventory: pgw_core::device::DeviceInventory) {
        let _ = self
            .sender
            .send(RegistryCommand::RefreshInventory { inventory })
            .await;
    }

    /// Builds the aggregated telemetry update.
    pub async fn build_update(&self) -> Option<UpdateData> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::BuildUpdate { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Connects one device by port name.
    pub async fn connect_machine(
        &self,
        port_name: PortName,
        baud: Option<u32>,
        protocol: Option<String>,
    ) {
        let _ = self
            .sender
            .send(RegistryCommand::ConnectMachine {
                port_name,
                baud,
                protocol,
            })
            .await;
    }

    /// Connects the devices claimed by the remote service.
    ///
    /// Runs a fresh discovery scan first so claims resolve against
    /// current hardware, not a stale inventory.
    pub async fn connect_machines(&self, claims: Vec<MachineClaim>) {
        let inventory = scan_inventory().await;
        let _ = self
            .sender
            .send(RegistryCommand::ConnectMachines { claims, inventory })
            .await;
    }

    /// Connects the first discovered device without a session.
    pub async fn connect_first_available(&self, baud: Option<u32>) {
        let inventory = scan_inventory().await;
        let _ = self
            .sender
            .send(RegistryCommand::ConnectFirstAvailable { baud, inventory })
            .await;
    }

    /// Records a remote identifier → port binding.
    pub async fn bind_machine(&self, uuid: RemoteId, port_name: PortName) {
        let _ = self
            .sender
            .send(RegistryCommand::BindMachine { uuid, port_name })
            .await;
    }

    /// Forwards a raw command list to the bound device.
    pub async fn forward_commands(&self, uuid: RemoteId, commands: Vec<Value>) {
        let _ = self
            .sender
            .send(RegistryCommand::ForwardCommands { uuid, commands })
            .await;
    }

    /// Replaces the bound device's routine document.
    pub async fn forward_routines(&self, uuid: RemoteId, routines: Value) {
        let _ = self
            .sender
            .send(RegistryCommand::ForwardRoutines { uuid, routines })
            .await;
    }

    /// Stops the running print on the bound device.
    pub async fn cancel_print(&self, uuid: RemoteId) {
        let _ = self
            .sender
            .send(RegistryCommand::CancelPrint { uuid })
            .await;
    }

    /// Resolves a remote identifier to its bound port.
    pub async fn port_for(&self, uuid: RemoteId) -> Option<PortName> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::PortForUuid {
                uuid,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Records that a job download has started.
    pub async fn job_started(&self, uuid: RemoteId, job_id: JobId, path: std::path::PathBuf) {
        let _ = self
            .sender
            .send(RegistryCommand::JobStarted { uuid, job_id, path })
            .await;
    }

    /// Reports a staged job file, triggering the print dispatch.
    pub async fn job_downloaded(&self, uuid: RemoteId, job_id: JobId, path: std::path::PathBuf) {
        let _ = self
            .sender
            .send(RegistryCommand::JobDownloaded { uuid, job_id, path })
            .await;
    }

    /// Abandons a job whose download failed.
    pub async fn job_failed(&self, uuid: RemoteId, job_id: JobId) {
        let _ = self
            .sender
            .send(RegistryCommand::JobFailed { uuid, job_id })
            .await;
    }

    /// Snapshot of sessions, bindings, and jobs for inspection.
    pub async fn snapshot(&self) -> Option<GatewaySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::GetSnapshot { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// True while the actor is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

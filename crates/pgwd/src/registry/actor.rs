//! Registry actor - owns all device state and processes commands.
//!
//! The RegistryActor is the single owner of device sessions, service
//! bindings, the discovery inventory, and in-flight jobs. It receives
//! commands via an mpsc channel and processes them sequentially, so no
//! state here ever needs a lock. Anything slow (driver launches,
//! socket IO, timers) runs in spawned tasks that report back through
//! the same command channel.
//!
//! Failures follow the protocol's own temperament: a command naming an
//! unknown device or binding is logged and dropped, never surfaced,
//! because the remote service works from the periodic update rather
//! than command acknowledgements.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pgw_core::device::{DeviceInventory, PortName, RemoteId};
use pgw_core::job::{Job, JobId, JobState, JobStatusKind};
use pgw_protocol::{DeviceEvent, DeviceMessage, MachineClaim, SegmentPhase, ServerMessage, UpdateData};

use crate::config::GatewayConfig;
use crate::device::{establish_link, spawn_device_io, terminate_driver, DeviceSession, DriverLaunch};
use crate::remote::RemoteHandle;

use super::commands::{GatewaySnapshot, RegistryCommand, SessionSummary};

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all device state.
///
/// # Ownership
///
/// The actor owns:
/// - `machines`: live device sessions keyed by port name
/// - `uuid_map`: remote identifier → port name bindings
/// - `inventory`: the latest discovery scan
/// - `jobs`: in-flight print jobs keyed by job id
///
/// Bindings outlive sessions on purpose: when a session dies, its
/// binding stays until the next telemetry build notices and sends the
/// disconnect notice, so the service always hears about the loss even
/// if it happened between updates.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Clone of the actor's own command sender, handed to IO tasks and
    /// timers so their outcomes come back through the queue.
    self_sender: mpsc::Sender<RegistryCommand>,

    config: Arc<GatewayConfig>,

    /// Outbound path to the remote service.
    remote: RemoteHandle,

    /// Live device sessions keyed by port name.
    machines: HashMap<PortName, DeviceSession>,

    /// Remote identifier → port bindings.
    uuid_map: HashMap<RemoteId, PortName>,

    /// Latest discovery scan.
    inventory: DeviceInventory,

    /// In-flight jobs.
    jobs: HashMap<JobId, Job>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        self_sender: mpsc::Sender<RegistryCommand>,
        config: Arc<GatewayConfig>,
        remote: RemoteHandle,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            config,
            remote,
            machines: HashMap::new(),
            uuid_map: HashMap::new(),
            inventory: DeviceInventory::default(),
            jobs: HashMap::new(),
        }
    }

    /// Runs the actor event loop until cancelled.
    ///
    /// The actor holds a sender to its own channel, so it cannot rely
    /// on channel closure to stop; cancellation is explicit.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Device registry starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
            }
        }

        info!(sessions = self.machines.len(), "Device registry stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::RefreshInventory { inventory } => {
                self.inventory = inventory;
            }
            RegistryCommand::BuildUpdate { respond_to } => {
                let update = self.handle_build_update();
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(update);
            }
            RegistryCommand::ConnectMachine {
                port_name,
                baud,
                protocol,
            } => {
                self.handle_connect_machine(port_name, baud, protocol);
            }
            RegistryCommand::ConnectMachines { claims, inventory } => {
                self.handle_connect_machines(claims, inventory);
            }
            RegistryCommand::ConnectFirstAvailable { baud, inventory } => {
                self.handle_connect_first_available(baud, inventory);
            }
            RegistryCommand::Attached { port_name, stream } => {
                self.handle_attached(port_name, stream);
            }
            RegistryCommand::DeviceEvent { port_name, event } => {
                self.handle_device_event(port_name, event);
            }
            RegistryCommand::DeviceClosed { port_name } => {
                self.handle_device_closed(port_name);
            }
            RegistryCommand::ConfirmClaim { port_name, uuid } => {
                self.handle_confirm_claim(port_name, uuid);
            }
            RegistryCommand::ConfirmUnbound { port_name } => {
                self.handle_confirm_unbound(port_name);
            }
            RegistryCommand::InitCheck { port_name } => {
                self.handle_init_check(port_name);
            }
            RegistryCommand::BindMachine { uuid, port_name } => {
                self.handle_bind_machine(uuid, port_name);
            }
            RegistryCommand::ForwardCommands { uuid, commands } => {
                self.handle_forward_commands(uuid, commands);
            }
            RegistryCommand::ForwardRoutines { uuid, routines } => {
                self.handle_forward_routines(uuid, routines);
            }
            RegistryCommand::CancelPrint { uuid } => {
                self.handle_cancel_print(uuid);
            }
            RegistryCommand::PortForUuid { uuid, respond_to } => {
                let _ = respond_to.send(self.uuid_map.get(&uuid).cloned());
            }
            RegistryCommand::JobStarted { uuid, job_id, path } => {
                self.handle_job_started(uuid, job_id, path);
            }
            RegistryCommand::JobDownloaded { uuid, job_id, path } => {
                self.handle_job_downloaded(uuid, job_id, path);
            }
            RegistryCommand::JobFailed { uuid, job_id } => {
                self.handle_job_failed(uuid, job_id);
            }
            RegistryCommand::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.handle_get_snapshot());
            }
        }
    }

    /// Schedules a command to arrive back at the actor after `delay`.
    fn schedule(&self, delay: Duration, cmd: RegistryCommand) {
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(cmd).await;
        });
    }

    // ========================================================================
    // Connect Flows
    // ========================================================================

    /// Brings up a device session on one port.
    ///
    /// The actual socket work happens in a spawned task; the session
    /// materializes when the task reports `Attached`.
    fn handle_connect_machine(
        &mut self,
        port_name: PortName,
        baud: Option<u32>,
        protocol: Option<String>,
    ) {
        if self.machines.contains_key(&port_name) {
            debug!(port = %port_name, "Session already exists, ignoring connect request");
            return;
        }

        let socket_path = self.config.paths.socket_path(&port_name);
        let launch = DriverLaunch {
            bin: self.config.driver.bin.clone(),
            baud: baud.unwrap_or(self.config.driver.default_baud),
            protocol: protocol.unwrap_or_else(|| self.config.driver.default_protocol.clone()),
            grace: self.config.timing.driver_grace(),
        };

        info!(port = %port_name, baud = launch.baud, protocol = %launch.protocol, "Connecting device");
        tokio::spawn(establish_link(
            port_name,
            socket_path,
            launch,
            self.self_sender.clone(),
        ));
    }

    /// Brings up sessions for service-claimed devices.
    fn handle_connect_machines(&mut self, claims: Vec<MachineClaim>, inventory: DeviceInventory) {
        self.inventory = inventory;

        for claim in claims {
            let Some(port_name) = self.inventory.port_for(&claim.hardware_id).cloned() else {
                debug!(hardware_id = %claim.hardware_id, "Claimed device not attached, skipping");
                continue;
            };

            self.handle_connect_machine(port_name.clone(), claim.baud, claim.protocol.clone());
            self.schedule(
                self.config.timing.confirm_delay(),
                RegistryCommand::ConfirmClaim {
                    port_name,
                    uuid: claim.uuid,
                },
            );
        }
    }

    /// Brings up a session on the first discovered port without one.
    fn handle_connect_first_available(&mut self, baud: Option<u32>, inventory: DeviceInventory) {
        self.inventory = inventory;

        let mut ports: Vec<PortName> = self.inventory.ports().cloned().collect();
        ports.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let Some(port_name) = ports.into_iter().find(|p| !self.machines.contains_key(p)) else {
            debug!("No unclaimed device available");
            return;
        };

        self.handle_connect_machine(port_name.clone(), baud, None);
        self.schedule(
            self.config.timing.confirm_delay(),
            RegistryCommand::ConfirmUnbound { port_name },
        );
    }

    /// Adopts a freshly connected driver socket.
    fn handle_attached(&mut self, port_name: PortName, stream: UnixStream) {
        if self.machines.contains_key(&port_name) {
            debug!(port = %port_name, "Duplicate attach, dropping stream");
            return;
        }

        let properties = self.inventory.properties_for(&port_name).cloned();
        let writer = spawn_device_io(port_name.clone(), stream, self.self_sender.clone());
        let mut session = DeviceSession::new(port_name.clone(), properties, writer);

        session.writer().send(DeviceMessage::subscribe_info());
        session.writer().send(DeviceMessage::subscribe_temperature());
        session.mark_subscribed();

        info!(port = %port_name, "Device session attached");
        self.machines.insert(port_name.clone(), session);

        self.schedule(
            self.config.timing.init_check(),
            RegistryCommand::InitCheck { port_name },
        );
    }

    // ========================================================================
    // Device Events
    // ========================================================================

    fn handle_device_event(&mut self, port_name: PortName, event: DeviceEvent) {
        match event {
            DeviceEvent::Info(report) => self.with_session(&port_name, |s| s.apply_info(report)),
            DeviceEvent::Temperature(report) => {
                self.with_session(&port_name, |s| s.apply_temperature(report));
            }
            DeviceEvent::ServerInfo(report) => self.with_session(&port_name, |s| {
                info!(
                    port = %port_name,
                    version = %report.version,
                    pid = report.pid,
                    "Driver identified itself"
                );
                s.set_driver(report);
            }),
            DeviceEvent::Disconnected => self.with_session(&port_name, |s| {
                warn!(port = %port_name, "Driver reported serial link down");
                s.mark_disconnected();
            }),
            DeviceEvent::SegmentCompleted(phase) => {
                self.handle_segment_completed(port_name, phase);
            }
            DeviceEvent::Unknown { action } => {
                debug!(port = %port_name, action = %action, "Ignoring unknown driver action");
            }
        }
    }

    fn with_session(&mut self, port_name: &PortName, apply: impl FnOnce(&mut DeviceSession)) {
        match self.machines.get_mut(port_name) {
            Some(session) => apply(session),
            None => debug!(port = %port_name, "Event for unknown session, ignoring"),
        }
    }

    /// Reports a segment completion upstream and advances the job.
    fn handle_segment_completed(&mut self, port_name: PortName, phase: SegmentPhase) {
        let Some(session) = self.machines.get_mut(&port_name) else {
            debug!(port = %port_name, "Segment report from unknown session, ignoring");
            return;
        };
        let Some(uuid) = session.uuid().cloned() else {
            debug!(port = %port_name, "Segment report from unbound device, ignoring");
            return;
        };
        let Some(job_id) = session.job_id() else {
            debug!(port = %port_name, "Segment report without an active job, ignoring");
            return;
        };

        if phase.clears_job() {
            session.clear_job();
        }

        info!(port = %port_name, job = %job_id, ?phase, "Segment completed");
        self.remote.send(ServerMessage::JobStatus {
            state: phase.completion_status(),
            job_id,
            uuid,
        });

        if let Some(job) = self.jobs.get_mut(&job_id) {
            let next = if phase.clears_job() {
                JobState::Done
            } else {
                JobState::SegmentComplete
            };
            if let Err(err) = job.advance(next) {
                debug!(job = %job_id, error = %err, "Job state out of step");
            }
        }
        if phase.clears_job() {
            self.jobs.remove(&job_id);
        }
    }

    /// Removes the session for a dead IPC channel.
    ///
    /// The binding is left in place; the next telemetry build prunes
    /// it and sends the disconnect notice.
    fn handle_device_closed(&mut self, port_name: PortName) {
        let Some(session) = self.machines.remove(&port_name) else {
            return;
        };
        warn!(port = %port_name, "Device channel closed, removing session");

        if let Some(job_id) = session.job_id() {
            debug!(port = %port_name, job = %job_id, "Dropping job of closed session");
            self.jobs.remove(&job_id);
        }
    }

    // ========================================================================
    // Confirmation and Watchdogs
    // ========================================================================

    /// Binds a claimed device once its session has come up.
    fn handle_confirm_claim(&mut self, port_name: PortName, uuid: RemoteId) {
        let Some(session) = self.machines.get_mut(&port_name) else {
            debug!(port = %port_name, uuid = %uuid, "Claimed device never came up");
            return;
        };

        match session.uuid() {
            None => {
                session.set_uuid(uuid.clone());
                self.uuid_map.insert(uuid.clone(), port_name.clone());
                info!(port = %port_name, uuid = %uuid, "Device bound");
                self.remote.send(ServerMessage::MachineConnected { uuid });
            }
            Some(current) if *current == uuid => {
                // Telling the service again is harmless.
                self.remote.send(ServerMessage::MachineConnected { uuid });
            }
            Some(current) => {
                debug!(
                    port = %port_name,
                    bound = %current,
                    requested = %uuid,
                    "Ignoring rebind attempt"
                );
            }
        }
    }

    /// Requests a machine record for a session brought up unclaimed.
    fn handle_confirm_unbound(&mut self, port_name: PortName) {
        let Some(session) = self.machines.get(&port_name) else {
            debug!(port = %port_name, "Unclaimed device never came up");
            return;
        };
        if session.uuid().is_some() {
            // Something bound it in the meantime.
            return;
        }

        info!(port = %port_name, "Requesting machine record for unclaimed device");
        self.remote.send(ServerMessage::FindOrCreateMachine {
            port_info: session.properties().cloned(),
            port_name,
        });
    }

    /// Tears down a session whose device never produced telemetry.
    fn handle_init_check(&mut self, port_name: PortName) {
        let Some(session) = self.machines.get(&port_name) else {
            return;
        };
        if session.link().is_live() {
            debug!(port = %port_name, "Init check passed");
            return;
        }

        warn!(port = %port_name, link = %session.link(), "Device never came live, tearing down");
        let driver_pid = session.driver_pid();
        self.machines.remove(&port_name);
        if let Some(pid) = driver_pid {
            terminate_driver(&port_name, pid);
        }
    }

    // ========================================================================
    // Service-Directed Binding and Forwarding
    // ========================================================================

    /// Binds a remote identifier to a port on the service's say-so.
    fn handle_bind_machine(&mut self, uuid: RemoteId, port_name: PortName) {
        if let Some(session) = self.machines.get_mut(&port_name) {
            session.set_uuid(uuid.clone());
        }
        self.uuid_map.insert(uuid.clone(), port_name.clone());
        info!(port = %port_name, uuid = %uuid, "Binding recorded");
        self.remote.send(ServerMessage::MachineConnected { uuid });
    }

    fn session_for_uuid(&mut self, uuid: &RemoteId) -> Option<&mut DeviceSession> {
        let port = self.uuid_map.get(uuid)?;
        self.machines.get_mut(port)
    }

    fn handle_forward_commands(&mut self, uuid: RemoteId, commands: Vec<Value>) {
        match self.session_for_uuid(&uuid) {
            Some(session) => {
                debug!(uuid = %uuid, count = commands.len(), "Forwarding control commands");
                session.writer().send(DeviceMessage::send_commands(commands));
            }
            None => debug!(uuid = %uuid, "Commands for unbound identifier, ignoring"),
        }
    }

    fn handle_forward_routines(&mut self, uuid: RemoteId, routines: Value) {
        match self.session_for_uuid(&uuid) {
            Some(session) => {
                debug!(uuid = %uuid, "Replacing device routines");
                session.writer().send(DeviceMessage::update_routines(routines));
            }
            None => debug!(uuid = %uuid, "Routines for unbound identifier, ignoring"),
        }
    }

    fn handle_cancel_print(&mut self, uuid: RemoteId) {
        let Some(session) = self.session_for_uuid(&uuid) else {
            debug!(uuid = %uuid, "Cancel for unbound identifier, ignoring");
            return;
        };

        let job_id = session.job_id();
        session.clear_job();
        session.writer().send(DeviceMessage::stop_print());
        info!(uuid = %uuid, job = ?job_id, "Print cancelled");

        if let Some(job_id) = job_id {
            if let Some(mut job) = self.jobs.remove(&job_id) {
                if let Err(err) = job.advance(JobState::Cancelled) {
                    debug!(job = %job_id, error = %err, "Job state out of step");
                }
            }
        }
    }

    // ========================================================================
    // Job Flow
    // ========================================================================

    fn handle_job_started(&mut self, uuid: RemoteId, job_id: JobId, path: PathBuf) {
        info!(job = %job_id, uuid = %uuid, "Job download starting");
        let mut job = Job::queued(job_id, uuid, path);
        if let Err(err) = job.advance(JobState::Downloading) {
            debug!(job = %job_id, error = %err, "Job state out of step");
        }
        self.jobs.insert(job_id, job);
    }

    /// Reports a staged job file and dispatches the print.
    ///
    /// The status report goes out before the print-file message so the
    /// service always sees `download_complete` ahead of any progress
    /// the print produces.
    fn handle_job_downloaded(&mut self, uuid: RemoteId, job_id: JobId, path: PathBuf) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            if let Err(err) = job.advance(JobState::Downloaded) {
                debug!(job = %job_id, error = %err, "Job state out of step");
            }
        }

        self.remote.send(ServerMessage::JobStatus {
            state: JobStatusKind::DownloadComplete,
            job_id,
            uuid: uuid.clone(),
        });

        let Some(session) = self.session_for_uuid(&uuid) else {
            warn!(job = %job_id, uuid = %uuid, "Device session gone before print start, dropping job");
            self.jobs.remove(&job_id);
            return;
        };

        session
            .writer()
            .send(DeviceMessage::print_file(path.display().to_string()));
        session.set_job(job_id);
        info!(job = %job_id, uuid = %uuid, "Print dispatched");

        if let Some(job) = self.jobs.get_mut(&job_id) {
            if let Err(err) = job.advance(JobState::Printing) {
                debug!(job = %job_id, error = %err, "Job state out of step");
            }
        }
    }

    fn handle_job_failed(&mut self, uuid: RemoteId, job_id: JobId) {
        warn!(job = %job_id, uuid = %uuid, "Job abandoned");
        if let Some(mut job) = self.jobs.remove(&job_id) {
            if let Err(err) = job.advance(JobState::Cancelled) {
                debug!(job = %job_id, error = %err, "Job state out of step");
            }
        }
    }

    // ========================================================================
    // Telemetry
    // ========================================================================

    /// Builds the aggregated update, pruning dead bindings first.
    ///
    /// A binding is dead when its session is gone or has stopped
    /// producing telemetry; each pruned binding gets an explicit
    /// disconnect notice so the service is told even about losses
    /// that happened between updates.
    fn handle_build_update(&mut self) -> UpdateData {
        let mut machines = HashMap::new();
        let mut dead = Vec::new();

        for (uuid, port) in &self.uuid_map {
            match self.machines.get(port) {
                Some(session) if session.link().is_live() => {
                    machines.insert(uuid.clone(), session.machine_update());
                }
                _ => dead.push(uuid.clone()),
            }
        }

        for uuid in dead {
            warn!(uuid = %uuid, "Pruning dead binding");
            self.uuid_map.remove(&uuid);
            self.remote.send(ServerMessage::MachineDisconnected { uuid });
        }

        UpdateData {
            machines,
            uuid_map: self.uuid_map.clone(),
            iserial_map: self.inventory.hardware_map().clone(),
        }
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    fn handle_get_snapshot(&self) -> GatewaySnapshot {
        let mut sessions: Vec<SessionSummary> = self
            .machines
            .values()
            .map(|session| SessionSummary {
                port_name: session.port_name().clone(),
                uuid: session.uuid().cloned(),
                link: session.link(),
                job_id: session.job_id(),
                driver_pid: session.driver_pid(),
            })
            .collect();
        sessions.sort_by(|a, b| a.port_name.as_str().cmp(b.port_name.as_str()));

        let mut bindings: Vec<(RemoteId, PortName)> = self
            .uuid_map
            .iter()
            .map(|(uuid, port)| (uuid.clone(), port.clone()))
            .collect();
        bindings.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        let mut jobs: Vec<(JobId, JobState)> =
            self.jobs.iter().map(|(id, job)| (*id, job.state)).collect();
        jobs.sort_by_key(|(id, _)| id.as_i64());

        GatewaySnapshot {
            sessions,
            bindings,
            inventory_size: self.inventory.len(),
            jobs,
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.machines.len()
    }
}

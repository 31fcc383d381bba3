//! Device sessions and driver IPC.
//!
//! Each connected printer is represented by a [`DeviceSession`] owned
//! by the registry actor. The session's IPC socket is split into a
//! reader task (decoding the driver's event stream and forwarding it
//! to the actor as commands) and a writer task (encoding outbound
//! driver messages). The actor never touches the socket directly, so
//! a wedged device can never block command processing.
//!
//! Session teardown is just dropping the [`DeviceSession`]: the writer
//! handle closes, the writer task ends, the socket drops, and the
//! reader task observes EOF.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pgw_core::device::{DeviceProperties, PortName, RemoteId};
use pgw_core::job::JobId;
use pgw_core::link::LinkState;
use pgw_core::telemetry::{MachineStatus, MachineUpdate, Temperatures};
use pgw_protocol::{DeviceMessage, FrameDecoder, InfoReport, ServerInfoReport, TemperatureReport};

use crate::registry::RegistryCommand;

/// Read buffer size for the driver IPC socket.
const READ_BUFFER: usize = 4096;

// ============================================================================
// Device Session
// ============================================================================

/// Registry-owned state for one connected printer.
#[derive(Debug)]
pub struct DeviceSession {
    port_name: PortName,
    /// Discovery properties, absent when the device attached through a
    /// pre-existing socket the scanner never saw.
    properties: Option<DeviceProperties>,
    /// Remote identifier, set once the service binds the device.
    uuid: Option<RemoteId>,
    link: LinkState,
    /// First machine description the driver reported. Kept as-is even
    /// if later reports carry a different one.
    machine_info: Option<serde_json::Value>,
    temperatures: Temperatures,
    printing: Option<bool>,
    current_line: Option<u64>,
    paused: Option<bool>,
    current_segment: Option<String>,
    /// Job currently printing on this device.
    job_id: Option<JobId>,
    /// Driver identity from its `server_info` report.
    driver: Option<ServerInfoReport>,
    writer: DeviceWriter,
}

impl DeviceSession {
    pub fn new(port_name: PortName, properties: Option<DeviceProperties>, writer: DeviceWriter) -> Self {
        Self {
            port_name,
            properties,
            uuid: None,
            link: LinkState::default(),
            machine_info: None,
            temperatures: Temperatures::default(),
            printing: None,
            current_line: None,
            paused: None,
            current_segment: None,
            job_id: None,
            driver: None,
            writer,
        }
    }

    pub fn port_name(&self) -> &PortName {
        &self.port_name
    }

    pub fn properties(&self) -> Option<&DeviceProperties> {
        self.properties.as_ref()
    }

    pub fn uuid(&self) -> Option<&RemoteId> {
        self.uuid.as_ref()
    }

    pub fn set_uuid(&mut self, uuid: RemoteId) {
        self.uuid = Some(uuid);
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn set_job(&mut self, job_id: JobId) {
        self.job_id = Some(job_id);
    }

    pub fn clear_job(&mut self) {
        self.job_id = None;
    }

    pub fn driver_pid(&self) -> Option<i32> {
        self.driver.as_ref().map(|d| d.pid)
    }

    pub fn set_driver(&mut self, report: ServerInfoReport) {
        self.driver = Some(report);
    }

    pub fn writer(&self) -> &DeviceWriter {
        &self.writer
    }

    /// Marks the telemetry subscriptions as sent.
    pub fn mark_subscribed(&mut self) {
        self.link = self.link.subscribed();
    }

    /// Records a driver disconnect notice.
    pub fn mark_disconnected(&mut self) {
        self.link = self.link.disconnected();
    }

    /// Applies an `info` report.
    ///
    /// Progress fields are replaced wholesale, absent values included,
    /// so a driver that stops reporting a line number clears it here
    /// too. Only the machine description is keep-first.
    pub fn apply_info(&mut self, report: InfoReport) {
        if self.machine_info.is_none() {
            self.machine_info = report.machine_info;
        }
        self.printing = report.printing;
        self.current_line = report.current_line.and_then(|v| u64::try_from(v).ok());
        self.paused = report.paused;
        self.current_segment = report.current_segment;
    }

    /// Applies a temperature report and lifts the link to live.
    pub fn apply_temperature(&mut self, report: TemperatureReport) {
        self.temperatures = Temperatures {
            bed: report.bed,
            nozzle: report.nozzle,
        };
        self.link = self.link.telemetry_received();
    }

    /// This device's slice of the aggregated telemetry update.
    pub fn machine_update(&self) -> MachineUpdate {
        MachineUpdate {
            temperatures: self.temperatures.clone(),
            status: MachineStatus {
                printing: self.printing,
                current_line: self.current_line,
                paused: self.paused,
                current_segment: self.current_segment.clone(),
                job_id: self.job_id,
            },
        }
    }
}

// ============================================================================
// Writer Handle
// ============================================================================

/// Handle for sending messages to one device's writer task.
///
/// Sends are fire-and-forget; once the writer task has exited (socket
/// gone), sends are dropped with a debug log. The reader side reports
/// the closure to the actor, which removes the session.
#[derive(Debug, Clone)]
pub struct DeviceWriter {
    sender: mpsc::UnboundedSender<DeviceMessage>,
}

impl DeviceWriter {
    pub fn send(&self, message: DeviceMessage) {
        if let Err(err) = self.sender.send(message) {
            debug!(action = err.0.action(), "Dropping message for closed device channel");
        }
    }
}

// ============================================================================
// IO Tasks
// ============================================================================

/// Splits a connected driver socket into reader and writer tasks.
///
/// The reader decodes the driver's event stream and forwards each
/// event to the registry; EOF or a read error sends `DeviceClosed`.
/// The returned writer handle feeds the writer task.
pub fn spawn_device_io(
    port_name: PortName,
    stream: UnixStream,
    commands: mpsc::Sender<RegistryCommand>,
) -> DeviceWriter {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(port_name.clone(), write_half, rx));
    tokio::spawn(read_loop(port_name, read_half, commands));

    DeviceWriter { sender: tx }
}

async fn write_loop(
    port_name: PortName,
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<DeviceMessage>,
) {
    while let Some(message) = rx.recv().await {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(port = %port_name, error = %err, "Failed to encode device message");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&bytes).await {
            warn!(port = %port_name, error = %err, "Device write failed");
            break;
        }
    }
    debug!(port = %port_name, "Device writer stopped");
}

async fn read_loop(
    port_name: PortName,
    mut read_half: tokio::net::unix::OwnedReadHalf,
    commands: mpsc::Sender<RegistryCommand>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!(port = %port_name, "Device channel EOF");
                break;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next_event() {
                        Ok(Some(event)) => {
                            let cmd = RegistryCommand::DeviceEvent {
                                port_name: port_name.clone(),
                                event,
                            };
                            if commands.send(cmd).await.is_err() {
                                // Registry gone; nothing left to notify.
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            // The decoder already dropped the bad data.
                            debug!(port = %port_name, error = %err, "Discarding undecodable driver data");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(port = %port_name, error = %err, "Device read failed");
                break;
            }
        }
    }

    let _ = commands
        .send(RegistryCommand::DeviceClosed { port_name })
        .await;
}

// ============================================================================
// Link Establishment
// ============================================================================

/// How to bring up the driver for one device.
#[derive(Debug, Clone)]
pub struct DriverLaunch {
    /// Driver executable.
    pub bin: String,
    /// Serial baud rate.
    pub baud: u32,
    /// Wire protocol name handed to the driver.
    pub protocol: String,
    /// How long to give a freshly launched driver before attaching.
    pub grace: Duration,
}

/// Attaches to a device's driver socket, launching the driver first if
/// needed.
///
/// If the socket exists, attach to it; an attach failure means a stale
/// socket from a dead driver, so the file is removed and the flow
/// falls through to the launch path. The launch path starts the driver,
/// waits out the grace period, and attaches. Every outcome is reported
/// to the registry: success as `Attached`, failure as a log line and
/// nothing else, since the service re-issues connect requests.
pub async fn establish_link(
    port_name: PortName,
    socket_path: PathBuf,
    launch: DriverLaunch,
    commands: mpsc::Sender<RegistryCommand>,
) {
    if socket_path.exists() {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                info!(port = %port_name, "Attached to existing driver socket");
                let _ = commands
                    .send(RegistryCommand::Attached { port_name, stream })
                    .await;
                return;
            }
            Err(err) => {
                warn!(port = %port_name, error = %err, "Stale driver socket, removing");
                if let Err(err) = tokio::fs::remove_file(&socket_path).await {
                    warn!(port = %port_name, error = %err, "Failed to remove stale socket");
                    return;
                }
            }
        }
    }

    if !launch_driver(&port_name, &socket_path, &launch) {
        return;
    }

    tokio::time::sleep(launch.grace).await;

    match UnixStream::connect(&socket_path).await {
        Ok(stream) => {
            info!(port = %port_name, "Attached to launched driver");
            let _ = commands
                .send(RegistryCommand::Attached { port_name, stream })
                .await;
        }
        Err(err) => {
            warn!(port = %port_name, error = %err, "Driver did not come up, giving up");
        }
    }
}

fn launch_driver(port_name: &PortName, socket_path: &Path, launch: &DriverLaunch) -> bool {
    if let Some(parent) = socket_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            warn!(port = %port_name, error = %err, "Failed to create socket directory");
            return false;
        }
    }

    let spawned = Command::new(&launch.bin)
        .arg("-p")
        .arg(port_name.device_path())
        .arg("-b")
        .arg(launch.baud.to_string())
        .arg("-s")
        .arg(socket_path)
        .arg("-r")
        .arg(&launch.protocol)
        .spawn();

    match spawned {
        Ok(mut child) => {
            info!(
                port = %port_name,
                bin = %launch.bin,
                baud = launch.baud,
                protocol = %launch.protocol,
                "Launched device driver"
            );
            let port = port_name.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!(port = %port, %status, "Device driver exited"),
                    Err(err) => debug!(port = %port, error = %err, "Failed to reap device driver"),
                }
            });
            true
        }
        Err(err) => {
            warn!(port = %port_name, bin = %launch.bin, error = %err, "Failed to launch device driver");
            false
        }
    }
}

/// Sends SIGTERM to a driver process that failed its init check.
pub fn terminate_driver(port_name: &PortName, pid: i32) {
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        info!(port = %port_name, pid, "Terminated unresponsive driver");
    } else {
        warn!(port = %port_name, pid, "Failed to signal unresponsive driver");
    }
}

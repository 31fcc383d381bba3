//! Dispatch of classified remote commands.
//!
//! The router turns each [`RemoteCommand`] into calls on the daemon's
//! components. Most commands are absorbed entirely; the few that need
//! something from the websocket session itself (a pong, channel
//! settings, the authentication outcome) come back as a
//! [`SessionDirective`] for the session to apply.

use std::sync::Arc;

use tracing::{info, warn};

use pgw_protocol::RemoteCommand;

use crate::jobs::JobRunner;
use crate::media::MediaHandle;
use crate::registry::RegistryHandle;
use crate::system::SystemControl;

/// What the websocket session should do after a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionDirective {
    /// Nothing; the command was fully absorbed.
    None,
    /// Answer the liveness probe.
    SendPong,
    /// Store channel settings for scoped sends.
    StoreChannel {
        channel: Option<String>,
        token: Option<String>,
    },
    /// Credential verdict from the service.
    AuthOutcome { accepted: bool, retry: bool },
}

/// Routes remote commands to the daemon's components.
#[derive(Clone)]
pub struct Router {
    registry: RegistryHandle,
    jobs: Arc<JobRunner>,
    media: MediaHandle,
    system: SystemControl,
}

impl Router {
    pub fn new(
        registry: RegistryHandle,
        jobs: Arc<JobRunner>,
        media: MediaHandle,
        system: SystemControl,
    ) -> Self {
        Self {
            registry,
            jobs,
            media,
            system,
        }
    }

    /// Dispatches one command.
    ///
    /// Dispatch never fails: commands naming unknown devices or jobs
    /// are logged and absorbed, matching the service's expectation
    /// that the gateway is told about state it no longer has.
    pub async fn dispatch(&self, command: RemoteCommand) -> SessionDirective {
        match command {
            RemoteCommand::ConnectionAcknowledged => {
                info!("Remote service acknowledged the connection");
                SessionDirective::None
            }
            RemoteCommand::AuthVerdict { accepted, retry } => {
                SessionDirective::AuthOutcome { accepted, retry }
            }
            RemoteCommand::Ping => SessionDirective::SendPong,
            RemoteCommand::ChannelSettings { channel, token } => {
                SessionDirective::StoreChannel { channel, token }
            }
            RemoteCommand::ConnectFirstAvailable { baud } => {
                self.registry.connect_first_available(baud).await;
                SessionDirective::None
            }
            RemoteCommand::ConnectMachines { claims } => {
                self.registry.connect_machines(claims).await;
                SessionDirective::None
            }
            RemoteCommand::MachineInfo { uuid, port_name } => {
                self.registry.bind_machine(uuid, port_name).await;
                SessionDirective::None
            }
            RemoteCommand::SendCommands { uuid, commands } => {
                self.registry.forward_commands(uuid, commands).await;
                SessionDirective::None
            }
            RemoteCommand::UpdateRoutines { uuid, routines } => {
                self.registry.forward_routines(uuid, routines).await;
                SessionDirective::None
            }
            RemoteCommand::CancelPrint { uuid } => {
                self.registry.cancel_print(uuid).await;
                SessionDirective::None
            }
            RemoteCommand::RunJob {
                uuid,
                job_id,
                gcode_url,
            } => {
                // The download must not stall the websocket loop, so
                // it runs as its own task once the binding checks out.
                match self.registry.port_for(uuid.clone()).await {
                    Some(_) => {
                        let jobs = self.jobs.clone();
                        tokio::spawn(async move { jobs.run(uuid, job_id, gcode_url).await });
                    }
                    None => {
                        warn!(uuid = %uuid, job = %job_id, "Run-job for unbound machine, ignoring");
                    }
                }
                SessionDirective::None
            }
            RemoteCommand::RequestLogs => {
                self.system.upload_logs();
                SessionDirective::None
            }
            RemoteCommand::Reboot => {
                self.system.reboot();
                SessionDirective::None
            }
            RemoteCommand::RunShellCommand { command } => {
                self.system.run_shell(&command);
                SessionDirective::None
            }
            RemoteCommand::ReadyForNextFrame => {
                self.media.frame_permitted();
                SessionDirective::None
            }
            // The session logs these before dispatch.
            RemoteCommand::Unrecognized => SessionDirective::None,
        }
    }
}

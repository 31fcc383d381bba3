//! Host maintenance operations.
//!
//! The remote service can ask the gateway to reboot its host, upload
//! its logs, or run an arbitrary shell command. All of them spawn
//! detached processes; the gateway never waits on the result beyond
//! reaping the child.

use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SystemConfig;

/// Grace period before the reboot command runs, so in-flight traffic
/// to the service can drain first.
const REBOOT_DELAY: Duration = Duration::from_secs(5);

/// Runs configured host maintenance commands.
#[derive(Debug, Clone)]
pub struct SystemControl {
    config: SystemConfig,
}

impl SystemControl {
    pub fn new(config: SystemConfig) -> Self {
        Self { config }
    }

    /// Reboots the host after a short delay.
    pub fn reboot(&self) {
        let Some(command) = self.config.reboot_command.clone() else {
            warn!("No reboot command configured, ignoring request");
            return;
        };
        info!(command = %command, delay_secs = REBOOT_DELAY.as_secs(), "Rebooting host");
        tokio::spawn(async move {
            tokio::time::sleep(REBOOT_DELAY).await;
            spawn_shell(&command);
        });
    }

    /// Uploads the gateway logs for support inspection.
    pub fn upload_logs(&self) {
        let Some(command) = self.config.log_upload_command.as_deref() else {
            warn!("No log upload command configured, ignoring request");
            return;
        };
        info!(command = %command, "Uploading logs");
        spawn_shell(command);
    }

    /// Runs an arbitrary shell command on the service's behalf.
    pub fn run_shell(&self, command: &str) {
        warn!(command = %command, "Running remote shell command");
        spawn_shell(command);
    }
}

/// Spawns `sh -c <command>` detached, with a reaper awaiting the exit
/// status so the child never lingers as a zombie.
pub(crate) fn spawn_shell(command: &str) {
    match Command::new("sh").arg("-c").arg(command).spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!(%status, "Shell command exited"),
                    Err(err) => debug!(error = %err, "Failed to reap shell command"),
                }
            });
        }
        Err(err) => warn!(command = %command, error = %err, "Failed to spawn shell command"),
    }
}

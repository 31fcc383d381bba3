//! Print-job file downloads.
//!
//! A run-job command names a URL; the gateway fetches it, stages it at
//! the machine's job path, and tells the registry, which dispatches
//! the print. There is no retry: a failed fetch abandons the job and
//! the remote service decides whether to issue it again.

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use pgw_core::device::RemoteId;
use pgw_core::job::JobId;

use crate::config::GatewayConfig;
use crate::registry::RegistryHandle;

/// Errors fetching and staging one job file.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("staging file failed: {0}")]
    Io(#[from] io::Error),
}

/// Downloads job files and reports lifecycle progress to the registry.
pub struct JobRunner {
    http: reqwest::Client,
    config: Arc<GatewayConfig>,
    registry: RegistryHandle,
}

impl JobRunner {
    pub fn new(config: Arc<GatewayConfig>, registry: RegistryHandle) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            registry,
        }
    }

    /// Runs one job download end to end.
    pub async fn run(&self, uuid: RemoteId, job_id: JobId, gcode_url: String) {
        let path = self.config.paths.job_file_path(&uuid);
        info!(job = %job_id, uuid = %uuid, url = %gcode_url, "Fetching job file");
        self.registry
            .job_started(uuid.clone(), job_id, path.clone())
            .await;

        match self.fetch_and_stage(&gcode_url, &path).await {
            Ok(size) => {
                info!(job = %job_id, bytes = size, path = %path.display(), "Job file staged");
                self.registry.job_downloaded(uuid, job_id, path).await;
            }
            Err(err) => {
                warn!(job = %job_id, error = %err, "Job fetch failed, abandoning");
                self.registry.job_failed(uuid, job_id).await;
            }
        }
    }

    /// Fetches the file and writes it at `path`, replacing any previous
    /// job file for the same machine. The old file is deleted before
    /// the write so a failure never leaves it behind looking current.
    async fn fetch_and_stage(&self, url: &str, path: &Path) -> Result<usize, JobError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len())
    }
}

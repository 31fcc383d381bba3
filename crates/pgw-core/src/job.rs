//! Print-job lifecycle.
//!
//! A job is created when the remote service issues a run-job command
//! and lives until the device reports the terminal segment, the print
//! is cancelled, or the device disconnects. The gateway never
//! interprets print semantics itself; it only tracks which lifecycle
//! stage the job is in and reports stage completions upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::device::RemoteId;
use crate::error::DomainError;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier the remote service assigns to one print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Lifecycle State
// ============================================================================

/// Lifecycle stage of one in-flight print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted from the remote service, download not yet started.
    Queued,
    /// File fetch in progress.
    Downloading,
    /// File written locally, print not yet dispatched.
    Downloaded,
    /// print-file sent to the device session.
    Printing,
    /// Device reported a non-terminal segment completion.
    SegmentComplete,
    /// Device reported the terminal segment.
    Done,
    /// Cancelled by the remote service.
    Cancelled,
}

impl JobState {
    /// True for states no job ever leaves.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Whether a job may move from this state directly to `next`.
    fn allows(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            // Cancellation is valid from any non-terminal state.
            (s, Cancelled) if !s.is_terminal() => true,
            (Queued, Downloading) => true,
            (Downloading, Downloaded) => true,
            (Downloaded, Printing) => true,
            (Printing, SegmentComplete) => true,
            // Segments repeat until the terminal one.
            (SegmentComplete, SegmentComplete) => true,
            (SegmentComplete, Done) => true,
            // The driver may report the end segment without an earlier one.
            (Printing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Printing => "printing",
            Self::SegmentComplete => "segment-complete",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

// ============================================================================
// Job Record
// ============================================================================

/// One in-flight print job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Remote-assigned job identifier.
    pub id: JobId,
    /// Remote identifier of the device this job belongs to.
    pub remote_id: RemoteId,
    /// Local path the fetched file is written to.
    pub file_path: PathBuf,
    /// Current lifecycle stage.
    pub state: JobState,
    /// When the run-job command was accepted.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a freshly queued job.
    pub fn queued(id: JobId, remote_id: RemoteId, file_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            remote_id,
            file_path: file_path.into(),
            state: JobState::Queued,
            created_at: Utc::now(),
        }
    }

    /// Advances the job to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::JobStateTransition`] if the lifecycle
    /// does not permit the move.
    pub fn advance(&mut self, next: JobState) -> Result<(), DomainError> {
        if !self.state.allows(next) {
            return Err(DomainError::JobStateTransition {
                job_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

// ============================================================================
// Wire Status Names
// ============================================================================

/// Job progress states as named on the remote wire.
///
/// These are the values carried in the `state` field of a job-status
/// message; they do not map one-to-one onto [`JobState`] (the wire
/// vocabulary is the remote service's, the lifecycle is ours).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusKind {
    /// File fetched and written locally.
    DownloadComplete,
    /// Device finished the start routine.
    StartRoutineComplete,
    /// Device finished the print segment.
    PrintComplete,
    /// Device finished the end routine; the job is over.
    EndRoutineComplete,
}

impl JobStatusKind {
    /// Wire value for the job-status `state` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadComplete => "download_complete",
            Self::StartRoutineComplete => "start_routine_complete",
            Self::PrintComplete => "print_complete",
            Self::EndRoutineComplete => "end_routine_complete",
        }
    }
}

impl fmt::Display for JobStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Domain-specific error types following panic-free policy.

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// A device path with no usable final component
    #[error("Invalid device path: {path}")]
    InvalidDevicePath { path: String },

    /// A job lifecycle move the state machine does not permit
    #[error("Job {job_id}: cannot move from {from} to {to}")]
    JobStateTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

//! PGW Core - Shared types for the printer gateway
//!
//! This crate provides the domain types shared between the daemon
//! (pgwd) and the wire protocol crate (pgw-protocol): device identity
//! and inventory, telemetry snapshots, the print-job lifecycle, and
//! the per-device link state machine.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod device;
pub mod error;
pub mod job;
pub mod link;
pub mod telemetry;

// Re-exports for convenience
pub use device::{DeviceInventory, DeviceProperties, HardwareId, PortName, RemoteId};
pub use error::{DomainError, DomainResult};
pub use job::{Job, JobId, JobState, JobStatusKind};
pub use link::LinkState;
pub use telemetry::{MachineStatus, MachineUpdate, Temperatures};

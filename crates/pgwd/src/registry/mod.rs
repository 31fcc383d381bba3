//! Device registry: the actor that owns every device session.
//!
//! All device state lives in a single actor task; everything else in
//! the daemon talks to it through a [`RegistryHandle`]. Driver IO
//! tasks, connect flows, and scheduled checks report back through the
//! same command channel, so every state change is serialized through
//! one place.
//!
//! ```text
//!                 ┌──────────────────┐
//!   remote ──────▶│                  │◀────── scheduled checks
//!   session       │  RegistryActor   │        (claim confirm, init)
//!                 │                  │
//!   media/jobs ──▶│  sessions        │◀────── device reader tasks
//!                 │  bindings        │        (events, closures)
//!                 │  inventory/jobs  │
//!                 └────────┬─────────┘
//!                          │ writer handles
//!                          ▼
//!                   device writer tasks
//! ```

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{GatewaySnapshot, RegistryCommand, SessionSummary};
pub use handle::RegistryHandle;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::remote::RemoteHandle;

/// Command channel depth. Device readers block (briefly) when the
/// actor falls behind, which keeps event ordering instead of dropping.
const COMMAND_BUFFER: usize = 64;

/// Spawns the registry actor and returns a handle to it.
pub fn spawn_registry(
    config: Arc<GatewayConfig>,
    remote: RemoteHandle,
    cancel: CancellationToken,
) -> RegistryHandle {
    let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
    let actor = RegistryActor::new(receiver, sender.clone(), config, remote);
    tokio::spawn(actor.run(cancel));
    RegistryHandle::new(sender)
}

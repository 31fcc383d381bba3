//! Remote service connection.
//!
//! The gateway holds exactly one websocket session to the remote
//! service, owned by [`RemoteSession`]. Everything else in the daemon
//! talks to it through a [`RemoteHandle`], a cheap-to-clone sender of
//! [`ServerMessage`] values. The session encodes, envelopes, and
//! transmits them; while no connection is up it drops them, because
//! the service only ever wants current state, never a backlog.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pgw_protocol::ServerMessage;

use crate::config::GatewayConfig;
use crate::registry::RegistryHandle;
use crate::router::Router;

mod session;

pub use session::RemoteSession;

// ============================================================================
// Remote Handle
// ============================================================================

/// Handle for sending messages toward the remote service.
///
/// Sends never block and never fail visibly; if the session task is
/// gone the message is dropped with a debug log.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl RemoteHandle {
    /// Creates a handle and the receiver the session drains.
    pub fn new_pair() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues a message for the remote service.
    pub fn send(&self, message: ServerMessage) {
        if let Err(err) = self.sender.send(message) {
            debug!(action = err.0.action(), "Dropping message, remote session gone");
        }
    }
}

/// Spawns the remote session task.
pub fn spawn_remote(
    config: Arc<GatewayConfig>,
    registry: RegistryHandle,
    router: Router,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let session = RemoteSession::new(config, registry, router, outbound, cancel);
    tokio::spawn(session.run())
}

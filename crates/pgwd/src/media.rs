//! Camera frame relay.
//!
//! An external capture process writes JPEG frames to a spool
//! directory; the relay reads them, base64-encodes them, and sends
//! them upstream on the camera channel. The service paces the stream
//! itself: each frame is only relayed after a `ready_for_next_frame`
//! permission, and never faster than the configured minimum interval.
//! After every relayed (or missed) frame the capture process gets a
//! SIGUSR1 asking for the next one.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pgw_protocol::ServerMessage;

use crate::config::{GatewayConfig, MediaConfig};
use crate::remote::RemoteHandle;
use crate::system::spawn_shell;

/// How long a freshly launched capture process gets before its pid is
/// looked up.
const CAPTURE_STARTUP_WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Handle
// ============================================================================

/// Handle for granting frame permissions to the relay task.
///
/// A gateway without a camera section gets a disabled handle;
/// permissions arriving anyway are dropped with a debug log.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    permit_tx: Option<mpsc::UnboundedSender<()>>,
}

impl MediaHandle {
    /// Handle for a gateway with no camera.
    pub fn disabled() -> Self {
        Self { permit_tx: None }
    }

    /// Grants permission to relay one frame.
    pub fn frame_permitted(&self) {
        match &self.permit_tx {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!("Camera relay disabled, dropping frame permission"),
        }
    }
}

/// Spawns the frame relay task if a camera is configured.
pub fn spawn_media(
    config: Arc<GatewayConfig>,
    remote: RemoteHandle,
    cancel: CancellationToken,
) -> MediaHandle {
    let Some(media) = config.media.clone() else {
        info!("No camera configured, frame relay disabled");
        return MediaHandle::disabled();
    };

    let (permit_tx, permits) = mpsc::unbounded_channel();
    let relay = MediaRelay {
        config: media,
        poll_interval: config.timing.frame_poll(),
        remote,
        permits,
        cancel,
        gate: FrameGate::new(config.timing.min_frame_interval()),
        capture_pid: None,
    };
    tokio::spawn(relay.run());

    MediaHandle {
        permit_tx: Some(permit_tx),
    }
}

// ============================================================================
// Relay Task
// ============================================================================

struct MediaRelay {
    config: MediaConfig,
    poll_interval: Duration,
    remote: RemoteHandle,
    permits: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
    gate: FrameGate,
    /// Capture process pid, for frame-request signals.
    capture_pid: Option<i32>,
}

impl MediaRelay {
    async fn run(mut self) {
        info!(process = %self.config.process_name, "Camera frame relay starting");

        if let Err(err) = tokio::fs::create_dir_all(&self.config.frame_dir).await {
            warn!(error = %err, "Failed to create frame directory");
        }
        self.ensure_capture_running().await;

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.permits.recv() => match permit {
                    Some(()) => self.gate.grant(),
                    None => break,
                },
                _ = poll.tick() => self.poll_frame().await,
            }
        }

        info!("Camera frame relay stopped");
    }

    /// Finds the capture process, launching it first if configured and
    /// not already running.
    async fn ensure_capture_running(&mut self) {
        if let Some(pid) = find_capture_pid(&self.config.process_name).await {
            info!(pid, "Capture process already running");
            self.capture_pid = Some(pid);
            return;
        }

        let Some(command) = self.config.capture_command.clone() else {
            warn!(
                process = %self.config.process_name,
                "Capture process not running and no launch command configured"
            );
            return;
        };

        info!(command = %command, "Launching capture process");
        spawn_shell(&command);
        tokio::time::sleep(CAPTURE_STARTUP_WAIT).await;

        self.capture_pid = find_capture_pid(&self.config.process_name).await;
        if self.capture_pid.is_none() {
            warn!(process = %self.config.process_name, "Capture process did not come up");
        }
    }

    /// Relays the spooled frame if the gate allows, then asks the
    /// capture process for the next one.
    async fn poll_frame(&mut self) {
        if !self.gate.poll(Instant::now()) {
            return;
        }

        let frame_path = self.config.frame_path();
        match tokio::fs::read(&frame_path).await {
            Ok(bytes) => {
                debug!(bytes = bytes.len(), "Relaying camera frame");
                self.remote.send(ServerMessage::CameraFrame {
                    frame: STANDARD.encode(&bytes),
                });
                if let Err(err) = tokio::fs::remove_file(&frame_path).await {
                    debug!(error = %err, "Failed to remove relayed frame");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // The permission is still spent; the service grants a
                // new one when it wants another try.
                debug!("No frame spooled yet");
            }
            Err(err) => warn!(error = %err, "Failed to read camera frame"),
        }

        self.request_next_frame();
    }

    /// SIGUSR1 tells the capture process to write a fresh frame.
    fn request_next_frame(&self) {
        let Some(pid) = self.capture_pid else {
            return;
        };
        let result = unsafe { libc::kill(pid, libc::SIGUSR1) };
        if result != 0 {
            debug!(pid, "Capture process signal failed");
        }
    }
}

/// Looks up the capture process pid by name. The full process table
/// scan is blocking, so it runs off the async runtime.
async fn find_capture_pid(name: &str) -> Option<i32> {
    let name = name.to_string();
    tokio::task::spawn_blocking(move || {
        let system = sysinfo::System::new_all();
        let pid = system
            .processes_by_name(std::ffi::OsStr::new(&name))
            .next()
            .map(|process| process.pid().as_u32() as i32);
        pid
    })
    .await
    .ok()
    .flatten()
}

// ============================================================================
// Frame Gate
// ============================================================================

/// Decides when a frame may be relayed.
///
/// Two conditions, both required: the service has granted permission
/// since the last relay, and at least the minimum interval has passed.
/// A blocked permission stays pending; a passed one is consumed.
#[derive(Debug)]
struct FrameGate {
    permitted: bool,
    last_sent: Option<Instant>,
    min_interval: Duration,
}

impl FrameGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            permitted: false,
            last_sent: None,
            min_interval,
        }
    }

    /// Records a frame permission from the service.
    fn grant(&mut self) {
        self.permitted = true;
    }

    /// Whether a frame may be relayed now. Passing consumes the
    /// permission and starts the next interval.
    fn poll(&mut self, now: Instant) -> bool {
        if !self.permitted {
            return false;
        }
        if let Some(last) = self.last_sent {
            if now.duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.permitted = false;
        self.last_sent = Some(now);
        true
    }
}

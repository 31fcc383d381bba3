//! Robustness tests for the gateway daemon.
//!
//! The daemon's failure policy is to log and carry on: corrupt driver
//! bytes, dead sockets, missing binaries, garbage service traffic, and
//! failed downloads must each leave the rest of the system running.
//! These tests throw each of those at a live registry or remote
//! session and check what survives.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use pgw_core::device::{PortName, RemoteId};
use pgw_core::job::JobId;
use pgw_protocol::ServerMessage;
use pgwd::config::{
    DriverConfig, GatewayConfig, PathsConfig, RemoteConfig, SystemConfig, TimingConfig,
};
use pgwd::jobs::JobRunner;
use pgwd::media::MediaHandle;
use pgwd::registry::{spawn_registry, GatewaySnapshot, RegistryHandle};
use pgwd::remote::{spawn_remote, RemoteHandle};
use pgwd::router::Router;
use pgwd::system::SystemControl;

// ============================================================================
// Constants
// ============================================================================

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const SETTLE_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

fn test_config(root: &Path, driver_bin: &str) -> GatewayConfig {
    GatewayConfig {
        remote: RemoteConfig {
            socket_host: "ws://127.0.0.1:1".to_string(),
        },
        credentials: json!({}),
        paths: PathsConfig {
            socket_dir: root.join("socks"),
            gcode_dir: root.join("gcode"),
        },
        driver: DriverConfig {
            bin: driver_bin.to_string(),
            default_protocol: "mendel".to_string(),
            default_baud: 115_200,
        },
        media: None,
        system: SystemConfig::default(),
        // Scheduled checks pushed far out; each test drives the flows
        // it cares about explicitly.
        timing: TimingConfig {
            confirm_delay_secs: 600,
            init_check_secs: 600,
            driver_grace_secs: 0,
            ..TimingConfig::default()
        },
    }
}

/// A registry with its remote side observed through the message channel.
struct TestGateway {
    handle: RegistryHandle,
    remote_rx: mpsc::UnboundedReceiver<ServerMessage>,
    cancel: CancellationToken,
    config: Arc<GatewayConfig>,
    _root: TempDir,
}

impl TestGateway {
    fn spawn() -> Self {
        Self::spawn_with_driver("/nonexistent/pgw-test-driver")
    }

    fn spawn_with_driver(bin: &str) -> Self {
        let root = tempfile::tempdir().expect("create temp dir");
        let config = Arc::new(test_config(root.path(), bin));
        let cancel = CancellationToken::new();
        let (remote, remote_rx) = RemoteHandle::new_pair();
        let handle = spawn_registry(config.clone(), remote, cancel.clone());
        Self {
            handle,
            remote_rx,
            cancel,
            config,
            _root: root,
        }
    }

    fn listen(&self, port: &PortName) -> UnixListener {
        let path = self.config.paths.socket_path(port);
        std::fs::create_dir_all(path.parent().expect("socket dir")).expect("create socket dir");
        UnixListener::bind(&path).expect("bind driver socket")
    }

    async fn connect(&self, listener: &UnixListener, port: &PortName) -> FakeDriver {
        self.handle.connect_machine(port.clone(), None, None).await;
        FakeDriver::accept(listener).await
    }

    async fn snapshot(&self) -> GatewaySnapshot {
        self.handle.snapshot().await.expect("registry alive")
    }

    async fn wait_for(
        &self,
        what: &str,
        predicate: impl Fn(&GatewaySnapshot) -> bool,
    ) -> GatewaySnapshot {
        let start = tokio::time::Instant::now();
        while start.elapsed() < WAIT_TIMEOUT {
            let snap = self.snapshot().await;
            if predicate(&snap) {
                return snap;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("timed out waiting for {what}");
    }
}

/// The driver end of one accepted IPC connection.
struct FakeDriver {
    stream: UnixStream,
    buffer: Vec<u8>,
}

impl FakeDriver {
    async fn accept(listener: &UnixListener) -> Self {
        let (stream, _addr) = timeout(WAIT_TIMEOUT, listener.accept())
            .await
            .expect("driver connection within timeout")
            .expect("accept driver connection");
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    async fn send(&mut self, action: &str, data: Value) {
        let frame = rmp_serde::to_vec_named(&json!({"action": action, "data": data}))
            .expect("encode driver event");
        self.stream.write_all(&frame).await.expect("driver write");
    }

    /// Writes bytes that are not a valid frame.
    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("driver write");
    }

    async fn recv_frames(&mut self, want: usize) -> Vec<Value> {
        let mut frames = Vec::new();
        let start = tokio::time::Instant::now();
        while frames.len() < want && start.elapsed() < WAIT_TIMEOUT {
            let mut chunk = [0u8; 4096];
            let n = match timeout(SETTLE_DELAY, self.stream.read(&mut chunk)).await {
                Ok(result) => result.expect("driver read"),
                Err(_) => continue,
            };
            assert!(n > 0, "gateway closed the driver socket");
            self.buffer.extend_from_slice(&chunk[..n]);
            frames.append(&mut decode_frames(&mut self.buffer));
        }
        assert!(
            frames.len() >= want,
            "wanted {want} driver frames, got {}",
            frames.len()
        );
        frames
    }
}

/// Drains every complete MessagePack value from the front of `buffer`,
/// leaving any partial tail in place.
fn decode_frames(buffer: &mut Vec<u8>) -> Vec<Value> {
    let mut frames = Vec::new();
    let mut consumed = 0usize;
    loop {
        let mut cursor = std::io::Cursor::new(&buffer[consumed..]);
        let outcome = {
            let mut de = rmp_serde::Deserializer::new(&mut cursor);
            Value::deserialize(&mut de)
        };
        match outcome {
            Ok(value) => {
                consumed += cursor.position() as usize;
                frames.push(value);
            }
            Err(_) => break,
        }
    }
    buffer.drain(..consumed);
    frames
}

/// Serves exactly one HTTP response, then hangs up.
async fn one_shot_http(status_line: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind http");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let mut request = [0u8; 4096];
        let _ = stream.read(&mut request).await;
        let response = format!(
            "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;
    });
    format!("http://{addr}/job.gcode")
}

/// Receives service-bound frames until one carries `action`. Handles
/// both encodings, since inbound binary garbage flips the connection
/// to MessagePack.
async fn recv_ws_action(ws: &mut WebSocketStream<TcpStream>, action: &str) -> Value {
    let start = tokio::time::Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        let message = timeout(WAIT_TIMEOUT, ws.next())
            .await
            .expect("frame within timeout")
            .expect("connection open")
            .expect("websocket read");
        let value: Value = match message {
            Message::Text(text) => serde_json::from_str(&text).expect("valid JSON envelope"),
            Message::Binary(bytes) => {
                rmp_serde::from_slice(&bytes).expect("valid MessagePack envelope")
            }
            _ => continue,
        };
        if value[0].as_str() == Some(action) {
            return value[1].clone();
        }
    }
    panic!("no {action} frame within timeout");
}

// ============================================================================
// Driver Stream Robustness Tests
// ============================================================================

#[tokio::test]
async fn test_corrupt_driver_data_is_discarded() {
    let gateway = TestGateway::spawn();
    let port = PortName::new("ttyACM0");
    let listener = gateway.listen(&port);
    let mut driver = gateway.connect(&listener, &port).await;
    driver.recv_frames(2).await;

    // 0xc1 is the one byte MessagePack reserves; no frame starts with it.
    driver.send_raw(&[0xc1, 0xc1, 0xc1, 0xc1]).await;
    sleep(SETTLE_DELAY).await;
    driver.send("temperature", json!({"b": 60.0, "t0": 210.0})).await;

    // The garbage was dropped and the session keeps decoding.
    let snap = gateway
        .wait_for("telemetry after corrupt bytes", |snap| {
            snap.session(&port).map_or(false, |s| s.link.is_live())
        })
        .await;
    assert_eq!(snap.sessions.len(), 1);
}

#[tokio::test]
async fn test_stale_socket_is_removed() {
    let gateway = TestGateway::spawn_with_driver("/bin/true");
    let port = PortName::new("ttyACM0");
    let socket_path = gateway.config.paths.socket_path(&port);
    std::fs::create_dir_all(socket_path.parent().expect("socket dir"))
        .expect("create socket dir");

    // A socket file nobody answers on, as a crashed driver leaves behind.
    drop(std::os::unix::net::UnixListener::bind(&socket_path).expect("bind stale socket"));
    assert!(socket_path.exists());

    gateway.handle.connect_machine(port, None, None).await;

    let start = tokio::time::Instant::now();
    while socket_path.exists() && start.elapsed() < WAIT_TIMEOUT {
        sleep(POLL_INTERVAL).await;
    }
    assert!(!socket_path.exists(), "stale socket file should be removed");

    // The stand-in driver exits without ever listening, so the launch
    // falls through to nothing and the registry shrugs it off.
    sleep(SETTLE_DELAY).await;
    let snap = gateway.snapshot().await;
    assert!(snap.sessions.is_empty());
}

#[tokio::test]
async fn test_missing_driver_binary_is_survived() {
    let gateway = TestGateway::spawn();

    gateway
        .handle
        .connect_machine(PortName::new("ttyACM0"), None, None)
        .await;

    sleep(SETTLE_DELAY).await;
    let snap = gateway.snapshot().await;
    assert!(snap.sessions.is_empty());
    assert!(gateway.handle.is_connected());
}

#[tokio::test]
async fn test_rapid_attach_detach_cycles() {
    let gateway = TestGateway::spawn();
    let port = PortName::new("ttyACM0");
    let listener = gateway.listen(&port);

    for _ in 0..5 {
        let mut driver = gateway.connect(&listener, &port).await;
        driver.recv_frames(2).await;
        drop(driver);
        gateway
            .wait_for("session removal", |snap| snap.sessions.is_empty())
            .await;
    }

    assert!(gateway.handle.is_connected());
}

// ============================================================================
// Remote Traffic Robustness Tests
// ============================================================================

#[tokio::test]
async fn test_garbage_remote_traffic_is_ignored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind service");
    let host = format!("ws://{}", listener.local_addr().expect("local addr"));

    let root = tempfile::tempdir().expect("create temp dir");
    let config = Arc::new(GatewayConfig {
        remote: RemoteConfig { socket_host: host },
        ..test_config(root.path(), "/nonexistent/pgw-test-driver")
    });
    let cancel = CancellationToken::new();
    let (remote, outbound_rx) = RemoteHandle::new_pair();
    let registry = spawn_registry(config.clone(), remote, cancel.clone());
    let jobs = Arc::new(JobRunner::new(config.clone(), registry.clone()));
    let router = Router::new(
        registry.clone(),
        jobs,
        MediaHandle::disabled(),
        SystemControl::new(SystemConfig::default()),
    );
    spawn_remote(config, registry, router, outbound_rx, cancel.clone());

    let (stream, _addr) = timeout(WAIT_TIMEOUT, listener.accept())
        .await
        .expect("gateway connect within timeout")
        .expect("accept gateway");
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket handshake");
    recv_ws_action(&mut ws, "server.authenticate").await;

    // None of this is a well-formed service event.
    ws.send(Message::Text("not json".to_string()))
        .await
        .expect("send garbage");
    ws.send(Message::Text("[]".to_string()))
        .await
        .expect("send garbage");
    ws.send(Message::Text(
        json!([["no.such.action", {"data": {"x": 1}}]]).to_string(),
    ))
    .await
    .expect("send garbage");
    // A run-job with no job id or URL is refused, not crashed on.
    ws.send(Message::Text(
        json!([["server.run_job", {"data": {"uuid": "u-1"}}]]).to_string(),
    ))
    .await
    .expect("send garbage");
    ws.send(Message::Binary(vec![0xc1, 0xff, 0x00]))
        .await
        .expect("send garbage");

    // Still on the line, still answering.
    ws.send(Message::Text(
        json!([["websocket_rails.ping", {}]]).to_string(),
    ))
    .await
    .expect("send ping");
    recv_ws_action(&mut ws, "websocket_rails.pong").await;

    cancel.cancel();
}

// ============================================================================
// Failure Handling Tests
// ============================================================================

#[tokio::test]
async fn test_failed_download_abandons_quietly() {
    let mut gateway = TestGateway::spawn();
    let url = one_shot_http("HTTP/1.1 404 Not Found", "").await;

    let runner = JobRunner::new(gateway.config.clone(), gateway.handle.clone());
    runner.run(RemoteId::new("u-1"), JobId::new(3), url).await;

    // Both lifecycle reports were queued before this snapshot request,
    // so it observes the settled state.
    let snap = gateway.snapshot().await;
    assert!(snap.jobs.is_empty());
    assert!(
        gateway.remote_rx.try_recv().is_err(),
        "no status report for a job that never staged"
    );
}

#[tokio::test]
async fn test_commands_for_unknown_machine_are_dropped() {
    let gateway = TestGateway::spawn();

    gateway
        .handle
        .forward_commands(RemoteId::new("u-ghost"), vec![json!("G28")])
        .await;
    gateway
        .handle
        .forward_routines(RemoteId::new("u-ghost"), json!({"start": ["G28"]}))
        .await;
    gateway.handle.cancel_print(RemoteId::new("u-ghost")).await;

    // All three were processed before this snapshot came back.
    let snap = gateway.snapshot().await;
    assert!(snap.sessions.is_empty());
    assert!(gateway.handle.is_connected());
}

#[tokio::test]
async fn test_shutdown_turns_queries_into_none() {
    let gateway = TestGateway::spawn();
    assert!(gateway.handle.is_connected());

    gateway.cancel.cancel();
    let start = tokio::time::Instant::now();
    while gateway.handle.is_connected() && start.elapsed() < WAIT_TIMEOUT {
        sleep(POLL_INTERVAL).await;
    }

    assert!(!gateway.handle.is_connected());
    assert!(gateway.handle.snapshot().await.is_none());
    assert!(gateway.handle.build_update().await.is_none());
    assert!(gateway
        .handle
        .port_for(RemoteId::new("u-1"))
        .await
        .is_none());

    // Notifications stay fire-and-forget even now.
    gateway
        .handle
        .job_failed(RemoteId::new("u-1"), JobId::new(1))
        .await;
}

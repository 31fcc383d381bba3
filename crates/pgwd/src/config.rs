//! Gateway configuration.
//!
//! Loaded once at startup from a TOML file and shared read-only across
//! every task. Only the remote host is required; everything else has
//! defaults suitable for a stock gateway image.
//!
//! ```toml
//! [remote]
//! socket_host = "wss://printtopeer.example.com"
//!
//! [credentials]
//! client_key = "abc123"
//!
//! [media]
//! process_name = "framegrab"
//! capture_command = "framegrab --output /tmp/pgw/camera_frames"
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use pgw_core::device::PortName;

/// Errors raised while loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ============================================================================
// Top-Level Configuration
// ============================================================================

/// Complete gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Remote service endpoint.
    pub remote: RemoteConfig,
    /// Credential document forwarded verbatim during authentication.
    #[serde(default = "empty_table")]
    pub credentials: Value,
    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Device driver launch settings.
    #[serde(default)]
    pub driver: DriverConfig,
    /// Camera relay settings. Absent means no camera on this gateway.
    #[serde(default)]
    pub media: Option<MediaConfig>,
    /// Host maintenance commands.
    #[serde(default)]
    pub system: SystemConfig,
    /// Interval and timeout tuning.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl GatewayConfig {
    /// Loads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text)?;
        Ok(config)
    }

    /// The credential document sent in the authenticate message.
    pub fn credentials_document(&self) -> Value {
        self.credentials.clone()
    }
}

fn empty_table() -> Value {
    Value::Object(serde_json::Map::new())
}

// ============================================================================
// Sections
// ============================================================================

/// Remote service endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base websocket host, e.g. `wss://printtopeer.example.com`.
    pub socket_host: String,
}

impl RemoteConfig {
    /// Full websocket endpoint URL.
    pub fn endpoint_url(&self) -> String {
        format!("{}/websocket", self.socket_host.trim_end_matches('/'))
    }
}

/// Filesystem locations the gateway reads and writes.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding per-device driver IPC sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Directory job files are downloaded into.
    #[serde(default = "default_gcode_dir")]
    pub gcode_dir: PathBuf,
}

impl PathsConfig {
    /// IPC socket path for one device port.
    pub fn socket_path(&self, port: &PortName) -> PathBuf {
        self.socket_dir.join(format!("{port}.sock"))
    }

    /// Download target for one machine's job file. Per-machine, so a
    /// new job for the same machine always replaces the old file.
    pub fn job_file_path(&self, remote_id: &pgw_core::device::RemoteId) -> PathBuf {
        self.gcode_dir.join(format!("machine-{remote_id}.gcode"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            gcode_dir: default_gcode_dir(),
        }
    }
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/pgw/socks")
}

fn default_gcode_dir() -> PathBuf {
    PathBuf::from("/var/lib/pgw/gcode")
}

/// How to launch the per-device driver process.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Driver executable.
    #[serde(default = "default_driver_bin")]
    pub bin: String,
    /// Protocol handed to the driver when a connect request names none.
    #[serde(default = "default_protocol")]
    pub default_protocol: String,
    /// Serial baud rate used when a connect request names none.
    #[serde(default = "default_baud")]
    pub default_baud: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bin: default_driver_bin(),
            default_protocol: default_protocol(),
            default_baud: default_baud(),
        }
    }
}

fn default_driver_bin() -> String {
    "burijji".to_string()
}

fn default_protocol() -> String {
    "mendel".to_string()
}

fn default_baud() -> u32 {
    115_200
}

/// Camera frame relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Process name of the capture daemon, for pid lookup.
    pub process_name: String,
    /// Command launching the capture daemon if it is not running.
    #[serde(default)]
    pub capture_command: Option<String>,
    /// Directory the capture daemon drops frames into.
    #[serde(default = "default_frame_dir")]
    pub frame_dir: PathBuf,
}

impl MediaConfig {
    /// Path the capture daemon writes the current frame to.
    pub fn frame_path(&self) -> PathBuf {
        self.frame_dir.join("frame.jpg")
    }
}

fn default_frame_dir() -> PathBuf {
    PathBuf::from("/tmp/pgw/camera_frames")
}

/// Host maintenance commands, each run through `sh -c`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemConfig {
    /// Command that reboots the host.
    #[serde(default)]
    pub reboot_command: Option<String>,
    /// Command that uploads gateway logs for support.
    #[serde(default)]
    pub log_upload_command: Option<String>,
}

/// Interval and timeout tuning.
///
/// Defaults match the remote service's expectations; tests shrink them
/// to keep runs fast.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Aggregated telemetry update period.
    #[serde(default = "default_telemetry_ms")]
    pub telemetry_interval_ms: u64,
    /// Inbound silence tolerated before forcing a reconnect.
    #[serde(default = "default_liveness_secs")]
    pub liveness_timeout_secs: u64,
    /// Pause between reconnect attempts.
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_delay_secs: u64,
    /// Wait before confirming a claimed device came up.
    #[serde(default = "default_confirm_secs")]
    pub confirm_delay_secs: u64,
    /// Wait after launching a driver before attaching to its socket.
    #[serde(default = "default_grace_secs")]
    pub driver_grace_secs: u64,
    /// Wait before the init watchdog checks a session proved live.
    #[serde(default = "default_init_secs")]
    pub init_check_secs: u64,
    /// Camera frame poll period.
    #[serde(default = "default_frame_poll_ms")]
    pub frame_poll_ms: u64,
    /// Minimum spacing between relayed camera frames.
    #[serde(default = "default_min_frame_ms")]
    pub min_frame_interval_ms: u64,
}

impl TimingConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_secs(self.confirm_delay_secs)
    }

    pub fn driver_grace(&self) -> Duration {
        Duration::from_secs(self.driver_grace_secs)
    }

    pub fn init_check(&self) -> Duration {
        Duration::from_secs(self.init_check_secs)
    }

    pub fn frame_poll(&self) -> Duration {
        Duration::from_millis(self.frame_poll_ms)
    }

    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_millis(self.min_frame_interval_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: default_telemetry_ms(),
            liveness_timeout_secs: default_liveness_secs(),
            reconnect_delay_secs: default_reconnect_secs(),
            confirm_delay_secs: default_confirm_secs(),
            driver_grace_secs: default_grace_secs(),
            init_check_secs: default_init_secs(),
            frame_poll_ms: default_frame_poll_ms(),
            min_frame_interval_ms: default_min_frame_ms(),
        }
    }
}

fn default_telemetry_ms() -> u64 {
    1_000
}

fn default_liveness_secs() -> u64 {
    60
}

fn default_reconnect_secs() -> u64 {
    15
}

fn default_confirm_secs() -> u64 {
    15
}

fn default_grace_secs() -> u64 {
    10
}

fn default_init_secs() -> u64 {
    20
}

fn default_frame_poll_ms() -> u64 {
    125
}

fn default_min_frame_ms() -> u64 {
    125
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config() {
        let file = write_config(
            r#"
[remote]
socket_host = "wss://example.com"
"#,
        );
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.remote.endpoint_url(), "wss://example.com/websocket");
        assert_eq!(config.paths.socket_dir, PathBuf::from("/tmp/pgw/socks"));
        assert_eq!(config.driver.default_baud, 115_200);
        assert_eq!(config.timing.telemetry_interval_ms, 1_000);
        assert!(config.media.is_none());
        assert!(config.system.reboot_command.is_none());
    }

    #[test]
    fn test_trailing_slash_trimmed_from_host() {
        let file = write_config(
            r#"
[remote]
socket_host = "ws://example.com/"
"#,
        );
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.remote.endpoint_url(), "ws://example.com/websocket");
    }

    #[test]
    fn test_credentials_forwarded_as_json() {
        let file = write_config(
            r#"
[remote]
socket_host = "wss://example.com"

[credentials]
client_key = "k-123"
client_id = "g-7"
"#,
        );
        let config = GatewayConfig::load(file.path()).unwrap();
        let doc = config.credentials_document();
        assert_eq!(doc["client_key"], "k-123");
        assert_eq!(doc["client_id"], "g-7");
    }

    #[test]
    fn test_credentials_default_to_empty_object() {
        let file = write_config(
            r#"
[remote]
socket_host = "wss://example.com"
"#,
        );
        let config = GatewayConfig::load(file.path()).unwrap();
        assert!(config.credentials_document().as_object().unwrap().is_empty());
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
[remote]
socket_host = "wss://example.com"

[paths]
socket_dir = "/run/gw/socks"
gcode_dir = "/data/gcode"

[driver]
bin = "/usr/local/bin/burijji"
default_protocol = "s3g"
default_baud = 250000

[media]
process_name = "framegrab"
capture_command = "framegrab -o /tmp/frames"
frame_dir = "/tmp/frames"

[system]
reboot_command = "systemctl reboot"

[timing]
telemetry_interval_ms = 50
liveness_timeout_secs = 2
"#,
        );
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(
            config.paths.socket_path(&PortName::new("ttyACM0")),
            PathBuf::from("/run/gw/socks/ttyACM0.sock")
        );
        let media = config.media.unwrap();
        assert_eq!(media.frame_path(), PathBuf::from("/tmp/frames/frame.jpg"));
        assert_eq!(config.driver.default_protocol, "s3g");
        assert_eq!(config.timing.telemetry_interval(), Duration::from_millis(50));
        assert_eq!(config.timing.liveness_timeout(), Duration::from_secs(2));
        // Unspecified timings keep their defaults.
        assert_eq!(config.timing.reconnect_delay(), Duration::from_secs(15));
    }

    #[test]
    fn test_job_file_path_is_per_machine() {
        let paths = PathsConfig::default();
        let path = paths.job_file_path(&pgw_core::device::RemoteId::new("u-42"));
        assert_eq!(path, PathBuf::from("/var/lib/pgw/gcode/machine-u-42.gcode"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = GatewayConfig::load(Path::new("/nonexistent/pgw.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let file = write_config("this is not toml [");
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

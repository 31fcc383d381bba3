//! Driver IPC protocol.
//!
//! Each device driver speaks MessagePack over a Unix socket: a raw
//! byte stream of concatenated `{action, data}` maps with no length
//! prefix or delimiter. [`FrameDecoder`] accumulates stream bytes and
//! yields one classified [`DeviceEvent`] per complete map; a map split
//! across reads stays buffered until the rest arrives. MessagePack
//! carries no resynchronization points, so a corrupt map poisons
//! everything buffered behind it and the decoder discards the lot.
//!
//! Outbound traffic uses the same `{action, data}` shape, built
//! through [`DeviceMessage`] constructors.

use std::io::{self, Read};

use rmp_serde::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use pgw_core::JobStatusKind;

/// Upper bound on buffered stream bytes while waiting for a frame to
/// complete. A legitimate device frame is at most a few kilobytes; a
/// buffer this far past that means the stream is garbage.
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

// ============================================================================
// Outbound Messages
// ============================================================================

/// A message to a device driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMessage {
    action: &'static str,
    data: Value,
}

impl DeviceMessage {
    /// Subscribes to periodic machine info reports.
    pub fn subscribe_info() -> Self {
        Self {
            action: "subscribe",
            data: json!({"type": "info"}),
        }
    }

    /// Subscribes to periodic temperature reports.
    pub fn subscribe_temperature() -> Self {
        Self {
            action: "subscribe",
            data: json!({"type": "temperature"}),
        }
    }

    /// Forwards a raw command list.
    pub fn send_commands(commands: Vec<Value>) -> Self {
        Self {
            action: "send_commands",
            data: Value::Array(commands),
        }
    }

    /// Replaces the driver's routine document.
    pub fn update_routines(routines: Value) -> Self {
        Self {
            action: "update_routines",
            data: routines,
        }
    }

    /// Starts printing the file at the given local path.
    pub fn print_file(path: impl Into<String>) -> Self {
        Self {
            action: "print_file",
            data: Value::String(path.into()),
        }
    }

    /// Aborts the running print.
    pub fn stop_print() -> Self {
        Self {
            action: "stop_print",
            data: Value::String(String::new()),
        }
    }

    /// The wire action identifier.
    pub fn action(&self) -> &str {
        self.action
    }

    /// Encodes the message as one MessagePack map.
    pub fn encode(&self) -> Result<Vec<u8>, DeviceCodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

// ============================================================================
// Inbound Events
// ============================================================================

/// A classified driver report.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Printer state snapshot.
    Info(InfoReport),
    /// Temperature readings. Only produced for non-empty reports;
    /// receipt of one marks the session live.
    Temperature(TemperatureReport),
    /// Driver self-description, reported once after startup.
    ServerInfo(ServerInfoReport),
    /// A print segment finished.
    SegmentCompleted(SegmentPhase),
    /// The driver lost its serial connection to the printer.
    Disconnected,
    /// An action this gateway does not know. Ignored after logging.
    Unknown { action: String },
}

/// Printer state snapshot fields. Every field is optional on the
/// wire; consumers replace their stored values wholesale, so a field
/// the driver stops reporting reads as absent rather than stale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoReport {
    pub machine_info: Option<Value>,
    pub current_line: Option<i64>,
    pub printing: Option<bool>,
    pub paused: Option<bool>,
    pub current_segment: Option<String>,
}

/// Temperature readings: `b` is the bed, `t`-prefixed keys are
/// nozzles in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureReport {
    pub bed: Option<f64>,
    pub nozzle: Vec<f64>,
}

/// Driver self-description. Both fields are mandatory on the wire;
/// the pid is what the watchdog kills when a driver never comes live.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfoReport {
    pub version: String,
    pub pid: i32,
}

/// Which part of a print finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    Start,
    Print,
    End,
}

impl SegmentPhase {
    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "start_segment" => Some(Self::Start),
            "print_segment" => Some(Self::Print),
            "end_segment" => Some(Self::End),
            _ => None,
        }
    }

    /// The job status the remote service expects for this phase.
    pub fn completion_status(&self) -> JobStatusKind {
        match self {
            Self::Start => JobStatusKind::StartRoutineComplete,
            Self::Print => JobStatusKind::PrintComplete,
            Self::End => JobStatusKind::EndRoutineComplete,
        }
    }

    /// The end phase closes out the job.
    pub fn clears_job(&self) -> bool {
        matches!(self, Self::End)
    }
}

impl DeviceEvent {
    /// Classifies one raw frame. Returns `None` for frames with no
    /// effect: malformed reports and empty temperature maps.
    pub fn classify(action: &str, data: &Value) -> Option<Self> {
        match action {
            "info" => Some(Self::Info(InfoReport::parse(data)?)),
            "temperature" => Some(Self::Temperature(TemperatureReport::parse(data)?)),
            "server_info" => Some(Self::ServerInfo(ServerInfoReport::parse(data)?)),
            "segment_completed" => {
                let phase = data.as_str().and_then(SegmentPhase::from_wire)?;
                Some(Self::SegmentCompleted(phase))
            }
            "disconnected" => Some(Self::Disconnected),
            other => Some(Self::Unknown {
                action: other.to_string(),
            }),
        }
    }
}

impl InfoReport {
    fn parse(data: &Value) -> Option<Self> {
        let map = data.as_object()?;
        Some(Self {
            machine_info: map.get("machine_info").filter(|v| !v.is_null()).cloned(),
            current_line: map.get("current_line").and_then(Value::as_i64),
            printing: map.get("printing").and_then(Value::as_bool),
            paused: map.get("paused").and_then(Value::as_bool),
            current_segment: map
                .get("current_segment")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

impl TemperatureReport {
    fn parse(data: &Value) -> Option<Self> {
        let map = data.as_object()?;
        // An empty report carries no information and must not mark
        // the session live.
        if map.is_empty() {
            return None;
        }
        Some(Self {
            bed: map.get("b").and_then(Value::as_f64),
            nozzle: map
                .iter()
                .filter(|(key, _)| key.starts_with('t'))
                .filter_map(|(_, value)| value.as_f64())
                .collect(),
        })
    }
}

impl ServerInfoReport {
    fn parse(data: &Value) -> Option<Self> {
        let map = data.as_object()?;
        // Reports missing either field are unusable and dropped.
        let version = map.get("version")?;
        let version = match version.as_str() {
            Some(s) => s.to_string(),
            None => version.to_string(),
        };
        let pid = map
            .get("pid")
            .and_then(Value::as_i64)
            .and_then(|pid| i32::try_from(pid).ok())?;
        Some(Self { version, pid })
    }
}

// ============================================================================
// Stream Decoding
// ============================================================================

/// Lenient view of one raw stream map before classification.
#[derive(Debug, Deserialize)]
struct RawDeviceFrame {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Incremental decoder for the concatenated-map device stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

/// Tracks how many bytes the deserializer actually consumed, so a
/// complete frame can be drained without disturbing the bytes of the
/// next one.
struct CountingReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read stream bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Yields the next classified event, skipping no-effect frames.
    ///
    /// `Ok(None)` means the buffered bytes end mid-frame; feed more
    /// and call again. On error the buffer has been discarded, since
    /// the stream cannot be re-synchronized past a corrupt map.
    pub fn next_event(&mut self) -> Result<Option<DeviceEvent>, DeviceCodecError> {
        loop {
            if self.buffer.is_empty() {
                return Ok(None);
            }

            let mut reader = CountingReader {
                data: &self.buffer,
                pos: 0,
            };
            let outcome = {
                let mut de = Deserializer::new(&mut reader);
                RawDeviceFrame::deserialize(&mut de)
            };

            match outcome {
                Ok(raw) => {
                    let consumed = reader.pos;
                    self.buffer.drain(..consumed);
                    let Some(action) = raw.action else {
                        continue;
                    };
                    if let Some(event) = DeviceEvent::classify(&action, &raw.data) {
                        return Ok(Some(event));
                    }
                }
                Err(err) if is_incomplete(&err) => {
                    if self.buffer.len() > MAX_BUFFERED_BYTES {
                        self.buffer.clear();
                        return Err(DeviceCodecError::Oversize {
                            max: MAX_BUFFERED_BYTES,
                        });
                    }
                    return Ok(None);
                }
                Err(err) => {
                    let buffered = self.buffer.len();
                    self.buffer.clear();
                    return Err(DeviceCodecError::Corrupt {
                        buffered,
                        source: err,
                    });
                }
            }
        }
    }
}

/// True when the error means the buffer simply ends mid-frame.
fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(io) | Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors on the driver IPC codec.
#[derive(Error, Debug)]
pub enum DeviceCodecError {
    #[error("device stream corrupt after {buffered} buffered bytes: {source}")]
    Corrupt {
        buffered: usize,
        source: rmp_serde::decode::Error,
    },

    #[error("device stream exceeded {max} bytes without completing a frame")]
    Oversize { max: usize },

    #[error("encoding device message failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

//! Outbound message vocabulary.
//!
//! Each variant corresponds to one action the gateway can send to the
//! remote service. The variant holds typed fields; [`ServerMessage::data`]
//! renders them into the wire payload and [`ServerMessage::scope`]
//! says whether the frame is channel-scoped. Frame assembly (ids,
//! channel settings, encoding) lives in [`crate::envelope`].

use std::collections::HashMap;

use pgw_core::{DeviceProperties, HardwareId, JobId, JobStatusKind, MachineUpdate, PortName, RemoteId};
use serde::Serialize;
use serde_json::{json, Value};

use crate::envelope::SendScope;
use crate::version::CLIENT_VERSION;

// ============================================================================
// Message Kinds
// ============================================================================

/// A message to the remote service, prior to frame assembly.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Credential presentation, sent once per connection on open.
    Authenticate { credentials: Value },
    /// The aggregated once-per-second state push.
    UpdateData(UpdateData),
    /// A device session is confirmed live under this remote identifier.
    MachineConnected { uuid: RemoteId },
    /// The device session for this remote identifier is gone.
    MachineDisconnected { uuid: RemoteId },
    /// An unbound device was claimed; ask the service to assign it an
    /// identifier. `port_info` is absent when the device attached
    /// through a pre-existing driver socket that discovery never saw.
    FindOrCreateMachine {
        port_info: Option<DeviceProperties>,
        port_name: PortName,
    },
    /// A job lifecycle transition.
    JobStatus {
        state: JobStatusKind,
        job_id: JobId,
        uuid: RemoteId,
    },
    /// Reply to a liveness probe.
    Pong,
    /// One base64-encoded camera frame. Channel-scoped.
    CameraFrame { frame: String },
}

/// Payload of the periodic `server.update_data` push.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateData {
    /// Per-remote-identifier telemetry and status.
    pub machines: HashMap<RemoteId, MachineUpdate>,
    /// Current remote identifier to port name bindings.
    pub uuid_map: HashMap<RemoteId, PortName>,
    /// Latest hardware id to port name inventory.
    pub iserial_map: HashMap<HardwareId, PortName>,
}

impl ServerMessage {
    /// Builds the authenticate message, merging the protocol version
    /// into the credential document.
    pub fn authenticate(mut credentials: Value) -> Self {
        if let Some(doc) = credentials.as_object_mut() {
            doc.insert("client_version".to_string(), json!(CLIENT_VERSION));
        }
        Self::Authenticate { credentials }
    }

    /// The wire action identifier.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "server.authenticate",
            Self::UpdateData(_) => "server.update_data",
            Self::MachineConnected { .. } => "server.machine_connected",
            Self::MachineDisconnected { .. } => "server.machine_disconnected",
            Self::FindOrCreateMachine { .. } => "server.find_or_create_machine",
            Self::JobStatus { .. } => "server.job_status",
            Self::Pong => "websocket_rails.pong",
            Self::CameraFrame { .. } => "server.camera_frame",
        }
    }

    /// Whether the frame carries the stored channel settings.
    pub fn scope(&self) -> SendScope {
        match self {
            Self::CameraFrame { .. } => SendScope::Channel,
            _ => SendScope::Plain,
        }
    }

    /// Renders the wire payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying serialization error; callers on the
    /// fire-and-forget path log and drop the message.
    pub fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Authenticate { credentials } => Ok(credentials.clone()),
            Self::UpdateData(update) => serde_json::to_value(update),
            Self::MachineConnected { uuid } | Self::MachineDisconnected { uuid } => {
                Ok(json!({ "uuid": uuid }))
            }
            Self::FindOrCreateMachine {
                port_info,
                port_name,
            } => Ok(json!({ "port_info": port_info, "port_name": port_name })),
            Self::JobStatus {
                state,
                job_id,
                uuid,
            } => Ok(json!({ "state": state.as_str(), "job_id": job_id, "uuid": uuid })),
            Self::Pong => Ok(json!({})),
            Self::CameraFrame { frame } => Ok(Value::String(frame.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgw_core::{MachineStatus, Temperatures};

    #[test]
    fn test_authenticate_merges_client_version() {
        let msg = ServerMessage::authenticate(json!({"uuid": "gw-1", "api_key": "k"}));
        let data = msg.data().unwrap();
        assert_eq!(data["uuid"], "gw-1");
        assert_eq!(data["api_key"], "k");
        assert_eq!(data["client_version"], CLIENT_VERSION);
        assert_eq!(msg.action(), "server.authenticate");
    }

    #[test]
    fn test_update_data_shape() {
        let mut update = UpdateData::default();
        update.machines.insert(
            RemoteId::new("u-1"),
            MachineUpdate {
                temperatures: Temperatures {
                    bed: Some(60.0),
                    nozzle: vec![210.5],
                },
                status: MachineStatus {
                    printing: Some(true),
                    current_line: Some(120),
                    paused: Some(false),
                    current_segment: Some("print_segment".to_string()),
                    job_id: Some(JobId::new(7)),
                },
            },
        );
        update
            .uuid_map
            .insert(RemoteId::new("u-1"), PortName::new("ttyACM0"));
        update
            .iserial_map
            .insert(HardwareId::new("SER1"), PortName::new("ttyACM0"));

        let data = ServerMessage::UpdateData(update).data().unwrap();
        assert_eq!(data["machines"]["u-1"]["temperatures"]["bed"], 60.0);
        assert_eq!(data["machines"]["u-1"]["status"]["printing"], true);
        assert_eq!(data["machines"]["u-1"]["status"]["job_id"], 7);
        assert_eq!(data["uuid_map"]["u-1"], "ttyACM0");
        assert_eq!(data["iserial_map"]["SER1"], "ttyACM0");
    }

    #[test]
    fn test_job_status_uses_wire_state_names() {
        let msg = ServerMessage::JobStatus {
            state: JobStatusKind::DownloadComplete,
            job_id: JobId::new(42),
            uuid: RemoteId::new("u-1"),
        };
        let data = msg.data().unwrap();
        assert_eq!(data["state"], "download_complete");
        assert_eq!(data["job_id"], 42);
        assert_eq!(data["uuid"], "u-1");
    }

    #[test]
    fn test_pong_is_plain_and_empty() {
        let msg = ServerMessage::Pong;
        assert_eq!(msg.action(), "websocket_rails.pong");
        assert_eq!(msg.scope(), SendScope::Plain);
        assert_eq!(msg.data().unwrap(), json!({}));
    }

    #[test]
    fn test_camera_frame_is_channel_scoped() {
        let msg = ServerMessage::CameraFrame {
            frame: "aGVsbG8=".to_string(),
        };
        assert_eq!(msg.action(), "server.camera_frame");
        assert_eq!(msg.scope(), SendScope::Channel);
        assert_eq!(msg.data().unwrap(), json!("aGVsbG8="));
    }

    #[test]
    fn test_machine_connected_payload() {
        let msg = ServerMessage::MachineConnected {
            uuid: RemoteId::new("u-3"),
        };
        assert_eq!(msg.data().unwrap(), json!({"uuid": "u-3"}));
    }

    #[test]
    fn test_find_or_create_machine_payload() {
        let msg = ServerMessage::FindOrCreateMachine {
            port_info: Some(DeviceProperties {
                iserial: HardwareId::new("SER1"),
                vid: "2341".to_string(),
                pid: "0042".to_string(),
            }),
            port_name: PortName::new("ttyUSB0"),
        };
        let data = msg.data().unwrap();
        assert_eq!(data["port_info"]["iserial"], "SER1");
        assert_eq!(data["port_info"]["vid"], "2341");
        assert_eq!(data["port_name"], "ttyUSB0");
    }

    #[test]
    fn test_find_or_create_without_properties() {
        let msg = ServerMessage::FindOrCreateMachine {
            port_info: None,
            port_name: PortName::new("ttyACM9"),
        };
        let data = msg.data().unwrap();
        assert!(data["port_info"].is_null());
        assert_eq!(data["port_name"], "ttyACM9");
    }
}

//! Inbound command vocabulary.
//!
//! Decoded frames are classified into [`RemoteCommand`] values by
//! normalizing the action identifier (the first `.` becomes `_`) and
//! matching it against the known set. Payload fields are extracted
//! leniently: the remote service is loose about types (numbers arrive
//! as strings, flags as arbitrary truthy values), so extraction
//! coerces where reasonable and classifies the frame as
//! [`RemoteCommand::Unrecognized`] when a required field is absent or
//! unusable. Unrecognized commands are a silent no-op; a newer remote
//! protocol must never crash the gateway.

use pgw_core::{HardwareId, JobId, PortName, RemoteId};
use serde_json::Value;

use crate::envelope::InboundFrame;

// ============================================================================
// Command Kinds
// ============================================================================

/// A classified inbound command, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    /// Connection acknowledgment from the remote service. Logged only.
    ConnectionAcknowledged,
    /// Authentication verdict. `retry` is only meaningful when
    /// `accepted` is false.
    AuthVerdict { accepted: bool, retry: bool },
    /// Claim the first discovered device without a session.
    ConnectFirstAvailable { baud: Option<u32> },
    /// Attach and bind the listed devices by hardware id.
    ConnectMachines { claims: Vec<MachineClaim> },
    /// Upload the local log file to the remote service.
    RequestLogs,
    /// Out-of-band binding of an already-connected device.
    MachineInfo { uuid: RemoteId, port_name: PortName },
    /// Forward a raw command list to the bound device session.
    SendCommands { uuid: RemoteId, commands: Vec<Value> },
    /// Forward a routine document verbatim to the bound device session.
    UpdateRoutines { uuid: RemoteId, routines: Value },
    /// Stop the running print and clear the job.
    CancelPrint { uuid: RemoteId },
    /// Download a job file and start printing it.
    RunJob {
        uuid: RemoteId,
        job_id: JobId,
        gcode_url: String,
    },
    /// Reboot the host after a short delay.
    Reboot,
    /// Spawn an arbitrary shell command.
    RunShellCommand { command: String },
    /// Permission to capture and send one camera frame.
    ReadyForNextFrame,
    /// Liveness probe; answered with a pong.
    Ping,
    /// Store channel scope settings for scoped sends.
    ChannelSettings {
        channel: Option<String>,
        token: Option<String>,
    },
    /// Anything else. Dispatch treats this as a no-op.
    Unrecognized,
}

/// One entry of a connect-machines request: a device the remote
/// service wants attached and bound.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineClaim {
    pub hardware_id: HardwareId,
    pub uuid: RemoteId,
    pub baud: Option<u32>,
    pub protocol: Option<String>,
}

impl RemoteCommand {
    /// Classifies a decoded frame.
    pub fn parse(frame: &InboundFrame) -> Self {
        let action = normalize_action(&frame.action);
        let data = frame.data();

        match action.as_str() {
            "client_connected" => Self::ConnectionAcknowledged,
            "server_authenticate" => parse_auth_verdict(data),
            "connect_first_available" => Self::ConnectFirstAvailable {
                baud: data.and_then(|d| coerce_u32(d.get("baud"))),
            },
            "connect_machines" => parse_connect_machines(data),
            "request_logs" => Self::RequestLogs,
            "machine_info" => parse_machine_info(data),
            "send_commands" => parse_send_commands(data),
            "update_routines" => parse_update_routines(data),
            "cancel_print" => match data.and_then(extract_uuid) {
                Some(uuid) => Self::CancelPrint { uuid },
                None => Self::Unrecognized,
            },
            "run_job" => parse_run_job(data),
            "reboot" => Self::Reboot,
            "run_shell_command" => match data.and_then(|d| string_field(d, "command")) {
                Some(command) => Self::RunShellCommand { command },
                None => Self::Unrecognized,
            },
            "ready_for_next_frame" => Self::ReadyForNextFrame,
            "ping" | "websocket_rails_ping" => Self::Ping,
            "channel_settings" | "websocket_rails_channel_token" => Self::ChannelSettings {
                channel: frame.channel().map(str::to_string),
                token: data.and_then(|d| string_field(d, "token")),
            },
            _ => Self::Unrecognized,
        }
    }
}

/// Collapses the dotted namespace: only the first `.` becomes `_`.
fn normalize_action(action: &str) -> String {
    action.replacen('.', "_", 1)
}

// ============================================================================
// Field Extraction
// ============================================================================

fn parse_auth_verdict(data: Option<&Value>) -> RemoteCommand {
    let Some(data) = data else {
        return RemoteCommand::Unrecognized;
    };
    RemoteCommand::AuthVerdict {
        accepted: truthy(data.get("authentication")),
        retry: truthy(data.get("do_retry")),
    }
}

fn parse_connect_machines(data: Option<&Value>) -> RemoteCommand {
    // Non-object request bodies are ignored wholesale.
    let Some(map) = data.and_then(Value::as_object) else {
        return RemoteCommand::Unrecognized;
    };

    let mut claims = Vec::with_capacity(map.len());
    for (iserial, entry) in map {
        // Entries without a remote identifier cannot be bound; skip them.
        let Some(uuid) = entry.get("uuid").and_then(Value::as_str) else {
            continue;
        };
        claims.push(MachineClaim {
            hardware_id: HardwareId::new(iserial.clone()),
            uuid: RemoteId::new(uuid),
            baud: coerce_u32(entry.get("baud")),
            protocol: string_field(entry, "protocol"),
        });
    }
    RemoteCommand::ConnectMachines { claims }
}

fn parse_machine_info(data: Option<&Value>) -> RemoteCommand {
    let Some(data) = data else {
        return RemoteCommand::Unrecognized;
    };
    match (extract_uuid(data), string_field(data, "port_name")) {
        (Some(uuid), Some(name)) => RemoteCommand::MachineInfo {
            uuid,
            port_name: PortName::new(name),
        },
        _ => RemoteCommand::Unrecognized,
    }
}

fn parse_send_commands(data: Option<&Value>) -> RemoteCommand {
    let Some(data) = data else {
        return RemoteCommand::Unrecognized;
    };
    // The command payload must be a list; anything else is rejected.
    match (extract_uuid(data), data.get("commands").and_then(Value::as_array)) {
        (Some(uuid), Some(commands)) => RemoteCommand::SendCommands {
            uuid,
            commands: commands.clone(),
        },
        _ => RemoteCommand::Unrecognized,
    }
}

fn parse_update_routines(data: Option<&Value>) -> RemoteCommand {
    let Some(data) = data else {
        return RemoteCommand::Unrecognized;
    };
    match (extract_uuid(data), data.get("routines")) {
        (Some(uuid), Some(routines)) => RemoteCommand::UpdateRoutines {
            uuid,
            routines: routines.clone(),
        },
        _ => RemoteCommand::Unrecognized,
    }
}

fn parse_run_job(data: Option<&Value>) -> RemoteCommand {
    let Some(data) = data else {
        return RemoteCommand::Unrecognized;
    };
    let uuid = extract_uuid(data);
    let job_id = coerce_i64(data.get("job_id")).map(JobId::new);
    let gcode_url = string_field(data, "gcode_url");
    match (uuid, job_id, gcode_url) {
        (Some(uuid), Some(job_id), Some(gcode_url)) => RemoteCommand::RunJob {
            uuid,
            job_id,
            gcode_url,
        },
        _ => RemoteCommand::Unrecognized,
    }
}

fn extract_uuid(data: &Value) -> Option<RemoteId> {
    data.get("uuid").and_then(Value::as_str).map(RemoteId::new)
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Accepts a JSON number or a numeric string.
fn coerce_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts a JSON number or a numeric string.
fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Remote-service truthiness: everything except absent, null, and
/// `false` counts as true.
fn truthy(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null) | Some(Value::Bool(false)))
}

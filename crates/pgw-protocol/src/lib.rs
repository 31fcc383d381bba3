//! PGW Protocol - Wire protocols for the printer gateway
//!
//! This crate provides both wire formats the gateway speaks: the
//! remote-service envelope (JSON or MessagePack, negotiated per
//! connection) with its typed inbound command set, and the
//! MessagePack `{action, data}` codec used on the per-device IPC
//! sockets.

pub mod command;
pub mod device;
pub mod envelope;
pub mod message;
pub mod version;

pub use command::{MachineClaim, RemoteCommand};
pub use device::{
    DeviceCodecError, DeviceEvent, DeviceMessage, FrameDecoder, InfoReport, SegmentPhase,
    ServerInfoReport, TemperatureReport,
};
pub use envelope::{EncodedFrame, Encoding, EnvelopeError, InboundFrame, OutboundFrame, SendScope};
pub use message::{ServerMessage, UpdateData};
pub use version::CLIENT_VERSION;

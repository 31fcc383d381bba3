//! Remote wire envelope.
//!
//! Every message exchanged with the coordinating service is a
//! two-element structure: an action identifier string and a payload
//! object `{id, channel, data, token}`. Outbound frames are sent as a
//! single such pair; inbound traffic arrives wrapped in an event batch
//! (an outer array of pairs) of which only the first event is
//! processed.
//!
//! The wire encoding is negotiated implicitly, once per physical
//! connection: the connection starts in JSON, and the first binary
//! frame observed from the remote side switches it to MessagePack for
//! the remainder of that connection. Reconnects start over in JSON.

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Encoding Negotiation
// ============================================================================

/// Wire encoding in effect for one physical connection.
///
/// Selected once per connection by [`Encoding::observe_inbound`];
/// senders consult the value instead of re-deriving it per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Text frames carrying JSON. Every connection starts here.
    #[default]
    Json,
    /// Binary frames carrying MessagePack. Entered when the remote
    /// side sends a binary frame; never left until reconnect.
    MsgPack,
}

impl Encoding {
    /// Folds an observed inbound frame kind into the negotiation.
    ///
    /// A binary frame upgrades the connection to MessagePack; text
    /// frames never downgrade it back.
    #[must_use]
    pub fn observe_inbound(self, binary: bool) -> Self {
        if binary {
            Self::MsgPack
        } else {
            self
        }
    }

    /// True once the connection has switched to MessagePack.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::MsgPack)
    }
}

// ============================================================================
// Outbound Frames
// ============================================================================

/// Whether a send is scoped to the stored channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendScope {
    /// `channel` and `token` are sent as null.
    #[default]
    Plain,
    /// `channel` and `token` are filled from the session's stored
    /// channel settings.
    Channel,
}

/// Payload object of an outbound frame.
#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeBody {
    /// Random correlation integer, fresh per frame.
    pub id: u32,
    /// Channel scope name, null for plain sends.
    pub channel: Option<String>,
    /// Message payload.
    pub data: Value,
    /// Channel scope token, null for plain sends.
    pub token: Option<String>,
}

/// A single outbound frame: `[action, {id, channel, data, token}]`.
///
/// Serializes as a two-element array in both encodings.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame(String, EnvelopeBody);

/// An outbound frame after encoding, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl OutboundFrame {
    /// Creates a plain (unscoped) frame.
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self(
            action.into(),
            EnvelopeBody {
                id: correlation_id(),
                channel: None,
                data,
                token: None,
            },
        )
    }

    /// Creates a channel-scoped frame using the stored settings.
    pub fn scoped(
        action: impl Into<String>,
        data: Value,
        channel: Option<String>,
        token: Option<String>,
    ) -> Self {
        Self(
            action.into(),
            EnvelopeBody {
                id: correlation_id(),
                channel,
                data,
                token,
            },
        )
    }

    /// Returns the action identifier.
    pub fn action(&self) -> &str {
        &self.0
    }

    /// Returns the payload body.
    pub fn body(&self) -> &EnvelopeBody {
        &self.1
    }

    /// Encodes the frame for the given connection encoding.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if serialization fails; callers on
    /// the fire-and-forget path log and drop the frame.
    pub fn encode(&self, encoding: Encoding) -> Result<EncodedFrame, EnvelopeError> {
        match encoding {
            Encoding::Json => Ok(EncodedFrame::Text(serde_json::to_string(self)?)),
            Encoding::MsgPack => Ok(EncodedFrame::Binary(rmp_serde::to_vec_named(self)?)),
        }
    }
}

/// Fresh random correlation id in the range the service expects.
fn correlation_id() -> u32 {
    rand::thread_rng().gen_range(1..=100_000)
}

// ============================================================================
// Inbound Frames
// ============================================================================

/// A decoded inbound frame: the action identifier plus its payload
/// object, extracted from the first event of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub action: String,
    pub payload: Value,
}

impl InboundFrame {
    /// Decodes a text (JSON) frame. Returns `None` for anything that
    /// is not an event batch; malformed traffic is dropped silently.
    pub fn decode_text(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        Self::from_batch(value)
    }

    /// Decodes a binary (MessagePack) frame.
    pub fn decode_binary(bytes: &[u8]) -> Option<Self> {
        let value: Value = rmp_serde::from_slice(bytes).ok()?;
        Self::from_batch(value)
    }

    /// Unwraps the outer event batch and takes the first event.
    fn from_batch(value: Value) -> Option<Self> {
        let batch = value.as_array()?;
        let event = batch.first()?.as_array()?;
        let action = event.first()?.as_str()?.to_string();
        let payload = event.get(1).cloned().unwrap_or(Value::Null);
        Some(Self { action, payload })
    }

    /// The `data` field of the payload, if present.
    pub fn data(&self) -> Option<&Value> {
        self.payload.get("data")
    }

    /// The `channel` field of the payload, if present.
    pub fn channel(&self) -> Option<&str> {
        self.payload.get("channel").and_then(Value::as_str)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors producing an outbound frame.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encoding failed: {0}")]
    MsgPack(#[from] rmp_serde::encode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_json_shape() {
        let frame = OutboundFrame::new("server.machine_connected", json!({"uuid": "u1"}));
        let encoded = frame.encode(Encoding::Json).unwrap();

        let EncodedFrame::Text(text) = encoded else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[0], "server.machine_connected");
        assert_eq!(value[1]["data"]["uuid"], "u1");
        assert!(value[1]["channel"].is_null());
        assert!(value[1]["token"].is_null());
        let id = value[1]["id"].as_u64().unwrap();
        assert!((1..=100_000).contains(&id));
    }

    #[test]
    fn test_outbound_msgpack_roundtrip() {
        let frame = OutboundFrame::new("server.update_data", json!({"machines": {}}));
        let encoded = frame.encode(Encoding::MsgPack).unwrap();

        let EncodedFrame::Binary(bytes) = encoded else {
            panic!("expected binary frame");
        };
        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value[0], "server.update_data");
        assert!(value[1]["data"]["machines"].is_object());
    }

    #[test]
    fn test_scoped_frame_carries_channel_settings() {
        let frame = OutboundFrame::scoped(
            "server.camera_frame",
            json!("abcd"),
            Some("printers".to_string()),
            Some("tok-1".to_string()),
        );
        let EncodedFrame::Text(text) = frame.encode(Encoding::Json).unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[1]["channel"], "printers");
        assert_eq!(value[1]["token"], "tok-1");
    }

    #[test]
    fn test_encoding_negotiation_upgrades_once() {
        let enc = Encoding::default();
        assert_eq!(enc, Encoding::Json);

        let enc = enc.observe_inbound(false);
        assert_eq!(enc, Encoding::Json);

        let enc = enc.observe_inbound(true);
        assert_eq!(enc, Encoding::MsgPack);

        // A later text frame does not downgrade the connection.
        let enc = enc.observe_inbound(false);
        assert_eq!(enc, Encoding::MsgPack);
    }

    #[test]
    fn test_inbound_takes_first_event_of_batch() {
        let text = r#"[["ping", {"id": 5, "data": {}}], ["ignored", {}]]"#;
        let frame = InboundFrame::decode_text(text).unwrap();
        assert_eq!(frame.action, "ping");
    }

    #[test]
    fn test_inbound_payload_access() {
        let text = r#"[["channel_settings", {"channel": "c1", "data": {"token": "t"}}]]"#;
        let frame = InboundFrame::decode_text(text).unwrap();
        assert_eq!(frame.channel(), Some("c1"));
        assert_eq!(frame.data().and_then(|d| d["token"].as_str()), Some("t"));
    }

    #[test]
    fn test_inbound_event_without_payload() {
        let frame = InboundFrame::decode_text(r#"[["ping"]]"#).unwrap();
        assert_eq!(frame.action, "ping");
        assert!(frame.payload.is_null());
        assert!(frame.data().is_none());
    }

    #[test]
    fn test_inbound_malformed_is_dropped() {
        assert!(InboundFrame::decode_text("not json").is_none());
        assert!(InboundFrame::decode_text("{}").is_none());
        assert!(InboundFrame::decode_text("[]").is_none());
        assert!(InboundFrame::decode_text(r#"[[42, {}]]"#).is_none());
        assert!(InboundFrame::decode_binary(b"\xc1\xff\xff").is_none());
    }

    #[test]
    fn test_inbound_binary_batch() {
        let batch = json!([["server.authenticate", {"data": {"authentication": true}}]]);
        let bytes = rmp_serde::to_vec(&batch).unwrap();
        let frame = InboundFrame::decode_binary(&bytes).unwrap();
        assert_eq!(frame.action, "server.authenticate");
        assert_eq!(
            frame.data().and_then(|d| d["authentication"].as_bool()),
            Some(true)
        );
    }
}

//! Per-device link state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of one device session's IPC link.
///
/// Progression: Connecting → Subscribed (telemetry feeds requested) →
/// TelemetryReceived (first valid temperature sample). A `disconnected`
/// notice from the driver drops the link to Disconnected; a later
/// valid sample lifts it back, mirroring driver behavior across
/// serial re-negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// IPC channel opened, subscriptions not yet sent.
    #[default]
    Connecting,
    /// Telemetry subscriptions sent, nothing received yet.
    Subscribed,
    /// At least one valid telemetry sample received.
    TelemetryReceived,
    /// Driver reported the serial link down.
    Disconnected,
}

impl LinkState {
    /// Records that the telemetry subscriptions were sent.
    ///
    /// Only meaningful straight after connecting; later states are
    /// left untouched.
    #[must_use]
    pub fn subscribed(self) -> Self {
        match self {
            Self::Connecting => Self::Subscribed,
            other => other,
        }
    }

    /// Records a valid telemetry sample.
    #[must_use]
    pub fn telemetry_received(self) -> Self {
        Self::TelemetryReceived
    }

    /// Records a driver disconnect notice.
    #[must_use]
    pub fn disconnected(self) -> Self {
        Self::Disconnected
    }

    /// True once the device has proven itself with real telemetry.
    ///
    /// This is the state the 20-second init watchdog waits for, and
    /// the liveness criterion for inclusion in telemetry updates.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::TelemetryReceived)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::TelemetryReceived => "telemetry-received",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{label}")
    }
}

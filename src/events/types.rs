//! Call event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::call::{CallState, Role};
use crate::webrtc::{ConnectionState, RemoteTrack};

/// Call events for UI consumers
///
/// JSON structure like:
/// ```json
/// {
///   "event": "call.state_changed",
///   "data": { "call_id": "abc123", "role": "initiator", "state": "awaiting_answer" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CallEvent {
    /// Signaling state machine moved
    #[serde(rename = "call.state_changed")]
    StateChanged {
        call_id: Option<String>,
        role: Role,
        state: CallState,
    },

    /// Local camera/microphone became active or inactive
    #[serde(rename = "call.webcam_active")]
    WebcamActive { active: bool },

    /// Peer connection aggregate state reported by the engine
    #[serde(rename = "webrtc.connection_state")]
    ConnectionState {
        call_id: String,
        state: ConnectionState,
    },

    /// Remote peer added a track
    #[serde(rename = "webrtc.remote_track")]
    RemoteTrack { call_id: String, track: RemoteTrack },

    /// A background signaling step failed
    #[serde(rename = "call.signaling_error")]
    SignalingError { call_id: String, message: String },

    /// Call torn down
    #[serde(rename = "call.hung_up")]
    HungUp {
        call_id: String,
        /// Number of store deletions that failed during cleanup
        cleanup_failures: usize,
    },
}

impl CallEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "call.state_changed",
            Self::WebcamActive { .. } => "call.webcam_active",
            Self::ConnectionState { .. } => "webrtc.connection_state",
            Self::RemoteTrack { .. } => "webrtc.remote_track",
            Self::SignalingError { .. } => "call.signaling_error",
            Self::HungUp { .. } => "call.hung_up",
        }
    }
}

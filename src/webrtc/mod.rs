//! WebRTC plumbing for two-party calls
//!
//! ```text
//! MediaSource ──> LocalMedia ──┐
//!                              v
//!            PeerEngine ──> PeerConnection <── SessionDescription / IceCandidate
//!                              │                         ^
//!                              v                         │
//!                   state / candidate / track      SessionStore (signaling relay)
//!                         handlers
//! ```

pub mod config;
pub mod engine;
pub mod media;
pub mod peer;
pub mod signaling;

pub use config::{TurnServer, WebRtcConfig};
pub use engine::{CandidateHandler, PeerConnection, PeerEngine, StateHandler, TrackHandler};
pub use media::{
    LocalMedia, LocalTrack, MediaConstraints, MediaSource, RemoteTrack, StaticMediaSource,
    TrackKind,
};
pub use peer::RtcEngine;
pub use signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};

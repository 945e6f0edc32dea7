//! Peer connection engine abstraction
//!
//! The coordinator drives negotiation exclusively through these traits so it
//! can run against the `webrtc` crate (`RtcEngine`) or a scripted engine in
//! tests.

use std::sync::Arc;

use async_trait::async_trait;

use super::config::WebRtcConfig;
use super::media::{LocalTrack, RemoteTrack};
use super::signaling::{ConnectionState, IceCandidate, SessionDescription};
use crate::error::Result;

/// Called for each locally gathered ICE candidate
pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
/// Called on every aggregate connection state change
pub type StateHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;
/// Called when the remote peer adds a track
pub type TrackHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;

/// Factory for peer connections
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Create a new peer connection
    async fn create_connection(
        &self,
        config: &WebRtcConfig,
        session_id: &str,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// One peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add a local track belonging to `stream_id`
    async fn add_local_track(&self, track: &LocalTrack, stream_id: &str) -> Result<()>;

    fn on_remote_track(&self, handler: TrackHandler);

    fn on_local_candidate(&self, handler: CandidateHandler);

    fn on_connection_state_change(&self, handler: StateHandler);

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection and release its resources
    async fn close(&self) -> Result<()>;
}

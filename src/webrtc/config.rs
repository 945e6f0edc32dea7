//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// Public STUN server used when nothing is configured
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// WebRTC configuration
///
/// Static ICE server settings handed to the engine. NAT traversal policy is
/// the engine's concern; nothing here is interpreted by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// ICE candidate pool size
    pub ice_candidate_pool_size: u8,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: vec![],
            ice_candidate_pool_size: 10,
        }
    }
}

impl WebRtcConfig {
    /// Check if any TURN relay is configured
    pub fn has_turn(&self) -> bool {
        self.turn_servers.iter().any(|t| !t.urls.is_empty())
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

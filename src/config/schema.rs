use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::webrtc::{MediaConstraints, WebRtcConfig};

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// ICE server settings handed to the peer connection engine
    pub webrtc: WebRtcConfig,
    /// Local tracks to request
    pub media: MediaConstraints,
    /// Session store settings
    pub store: StoreConfig,
    /// Invitation link settings
    pub invite: InviteConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            webrtc: WebRtcConfig::default(),
            media: MediaConstraints::default(),
            store: StoreConfig::default(),
            invite: InviteConfig::default(),
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Subscription poll interval for polling backends (ms)
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Invitation link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteConfig {
    /// Origin prefixed to `/join/<call id>`
    pub origin: String,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:5173".to_string(),
        }
    }
}

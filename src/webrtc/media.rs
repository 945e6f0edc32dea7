//! Local media acquisition
//!
//! Capturing camera and microphone frames happens outside this crate. A
//! `MediaSource` only decides whether local tracks are available and hands
//! out their descriptors; the engine turns descriptors into RTP tracks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Requested local media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A local track descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Local media stream handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

/// Track announced by the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Source of local audio/video tracks
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local tracks, failing with `AppError::MediaAcquisition` when
    /// the devices are unavailable or permission is denied
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia>;

    /// Release previously acquired tracks
    fn release(&self, _media: &LocalMedia) {}
}

/// Media source exposing a fixed set of device kinds
#[derive(Debug, Clone)]
pub struct StaticMediaSource {
    audio_available: bool,
    video_available: bool,
}

impl StaticMediaSource {
    pub fn new(audio_available: bool, video_available: bool) -> Self {
        Self {
            audio_available,
            video_available,
        }
    }
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia> {
        if constraints.audio && !self.audio_available {
            return Err(AppError::MediaAcquisition(
                "Microphone not available".to_string(),
            ));
        }
        if constraints.video && !self.video_available {
            return Err(AppError::MediaAcquisition("Camera not available".to_string()));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack {
                id: format!("audio-{}", stream_id),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                id: format!("video-{}", stream_id),
                kind: TrackKind::Video,
            });
        }

        if tracks.is_empty() {
            return Err(AppError::MediaAcquisition(
                "No audio or video requested".to_string(),
            ));
        }

        debug!("Acquired local stream {} ({} tracks)", stream_id, tracks.len());
        Ok(LocalMedia { stream_id, tracks })
    }
}

//! Local capture and inbound stream sinks.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub mod ivf;
pub mod mock;
pub mod sink;

pub use ivf::IvfFileCamera;
pub use sink::{InboundStream, PacketCounter, StreamSink};

const TRACK_ID: &str = "video";
const STREAM_ID: &str = "drink-cam";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub facing: Option<FacingMode>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub max_frame_rate: Option<u32>,
    pub audio: bool,
}

impl CaptureConstraints {
    /// Back camera, up to 1920x1080 at 30 fps, video only.
    pub fn preferred() -> Self {
        Self {
            facing: Some(FacingMode::Environment),
            max_width: Some(1920),
            max_height: Some(1080),
            max_frame_rate: Some(30),
            audio: false,
        }
    }

    /// Any video device, any resolution.
    pub fn unconstrained() -> Self {
        Self {
            facing: None,
            max_width: None,
            max_height: None,
            max_frame_rate: None,
            audio: false,
        }
    }

    /// Returns the first constraint `settings` violates.
    pub fn violation(&self, settings: &TrackSettings) -> Option<&'static str> {
        if self.max_width.is_some_and(|max| settings.width > max) {
            return Some("width");
        }
        if self.max_height.is_some_and(|max| settings.height > max) {
            return Some("height");
        }
        if self.max_frame_rate.is_some_and(|max| settings.frame_rate > max) {
            return Some("frameRate");
        }
        None
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::preferred()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("no camera support on this device")]
    Unsupported,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera cannot satisfy the {constraint} constraint")]
    OverConstrained { constraint: &'static str },
    #[error("camera access denied: {0}")]
    Denied(String),
}

/// A running local capture. Dropping it stops the capture.
pub struct LocalMedia {
    label: String,
    settings: TrackSettings,
    track: Arc<TrackLocalStaticSample>,
    pump: Option<JoinHandle<()>>,
}

impl LocalMedia {
    pub fn new(
        label: impl Into<String>,
        settings: TrackSettings,
        track: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            label: label.into(),
            settings,
            track,
            pump: None,
        }
    }

    /// VP8 track with the ids every drink-cam stream uses.
    pub fn vp8_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            TRACK_ID.to_owned(),
            STREAM_ID.to_owned(),
        ))
    }

    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn settings(&self) -> TrackSettings {
        self.settings
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_live(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            tracing::debug!(
                target = "drink_cam::media",
                label = %self.label,
                "local capture stopped",
            );
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("label", &self.label)
            .field("settings", &self.settings)
            .field("live", &self.is_live())
            .finish()
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CameraError>;
}

/// Tries `preferred` first and falls back to unconstrained video-only capture.
pub async fn acquire_with_fallback(
    source: &dyn MediaSource,
    preferred: &CaptureConstraints,
) -> Result<LocalMedia, CameraError> {
    match source.acquire(preferred).await {
        Ok(media) => Ok(media),
        Err(CameraError::Unsupported) => Err(CameraError::Unsupported),
        Err(err) => {
            tracing::info!(
                target = "drink_cam::media",
                error = %err,
                "preferred capture profile rejected; retrying unconstrained"
            );
            source.acquire(&CaptureConstraints::unconstrained()).await
        }
    }
}

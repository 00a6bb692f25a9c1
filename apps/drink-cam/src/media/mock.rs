//! Scriptable camera used by tests and the `--source test` CLI option.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CameraError, CaptureConstraints, LocalMedia, MediaSource, TrackSettings};

/// A camera with a fixed native mode. Constraints below the native mode are rejected
/// the same way a real device rejects an over-constrained request.
#[derive(Debug)]
pub struct MockCamera {
    native: TrackSettings,
    denied: Option<String>,
    attempts: Mutex<Vec<CaptureConstraints>>,
}

impl MockCamera {
    pub fn new(native: TrackSettings) -> Self {
        Self {
            native,
            denied: None,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn hd() -> Self {
        Self::new(TrackSettings {
            width: 1280,
            height: 720,
            frame_rate: 30,
        })
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            denied: Some(reason.into()),
            ..Self::hd()
        }
    }

    pub fn attempts(&self) -> Vec<CaptureConstraints> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl MediaSource for MockCamera {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CameraError> {
        self.attempts.lock().push(constraints.clone());
        if let Some(reason) = &self.denied {
            return Err(CameraError::Denied(reason.clone()));
        }
        if let Some(constraint) = constraints.violation(&self.native) {
            return Err(CameraError::OverConstrained { constraint });
        }
        let pump = tokio::spawn(std::future::pending::<()>());
        Ok(LocalMedia::new("mock camera", self.native, LocalMedia::vp8_track()).with_pump(pump))
    }
}

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::media::io::ivf_reader::{IVFFileHeader, IVFReader};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{CameraError, CaptureConstraints, LocalMedia, MediaSource, TrackSettings};

const VP8_FOURCC: &[u8; 4] = b"VP80";
const FALLBACK_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Replays a VP8 IVF recording in a loop as if it were a live camera.
#[derive(Debug, Clone)]
pub struct IvfFileCamera {
    path: PathBuf,
}

impl IvfFileCamera {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MediaSource for IvfFileCamera {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalMedia, CameraError> {
        let header = read_header(&self.path)?;
        if &header.four_cc != VP8_FOURCC {
            return Err(CameraError::Unavailable(format!(
                "{} is not a VP8 recording",
                self.path.display()
            )));
        }

        let frame_duration = frame_duration(&header);
        let settings = TrackSettings {
            width: u32::from(header.width),
            height: u32::from(header.height),
            frame_rate: (1.0 / frame_duration.as_secs_f64()).round() as u32,
        };
        if let Some(constraint) = constraints.violation(&settings) {
            return Err(CameraError::OverConstrained { constraint });
        }

        let track = LocalMedia::vp8_track();
        let pump = tokio::spawn(replay(self.path.clone(), Arc::clone(&track), frame_duration));
        info!(
            target = "drink_cam::media",
            path = %self.path.display(),
            width = settings.width,
            height = settings.height,
            fps = settings.frame_rate,
            "ivf capture started"
        );
        Ok(LocalMedia::new(self.path.display().to_string(), settings, track).with_pump(pump))
    }
}

fn open(path: &Path) -> Result<(IVFReader<BufReader<File>>, IVFFileHeader), CameraError> {
    let file = File::open(path)
        .map_err(|err| CameraError::Unavailable(format!("{}: {err}", path.display())))?;
    IVFReader::new(BufReader::new(file))
        .map_err(|err| CameraError::Unavailable(format!("{}: {err}", path.display())))
}

fn read_header(path: &Path) -> Result<IVFFileHeader, CameraError> {
    open(path).map(|(_, header)| header)
}

fn frame_duration(header: &IVFFileHeader) -> Duration {
    if header.timebase_denominator == 0 || header.timebase_numerator == 0 {
        return FALLBACK_FRAME_DURATION;
    }
    Duration::from_secs_f64(
        f64::from(header.timebase_numerator) / f64::from(header.timebase_denominator),
    )
}

async fn replay(path: PathBuf, track: Arc<TrackLocalStaticSample>, frame_duration: Duration) {
    let mut ticker = tokio::time::interval(frame_duration);
    loop {
        let mut reader = match open(&path) {
            Ok((reader, _)) => reader,
            Err(err) => {
                warn!(target = "drink_cam::media", error = %err, "ivf capture ended");
                return;
            }
        };

        let mut frames = 0usize;
        while let Ok((frame, _)) = reader.parse_next_frame() {
            frames += 1;
            ticker.tick().await;
            let sample = Sample {
                data: frame.freeze(),
                duration: frame_duration,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                debug!(target = "drink_cam::media", error = %err, "dropping ivf frame");
            }
        }

        if frames == 0 {
            warn!(target = "drink_cam::media", path = %path.display(), "ivf file has no frames");
            return;
        }
        debug!(target = "drink_cam::media", frames, "ivf capture looping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_timeout::tokio_timeout_test;

    fn ivf_header(width: u16, height: u16, fps: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(b"DKIF");
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&32u16.to_le_bytes());
        bytes.extend_from_slice(VP8_FOURCC);
        bytes.extend_from_slice(&width.to_le_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes.extend_from_slice(&fps.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes
    }

    fn write_recording(width: u16, height: u16) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&ivf_header(width, height, 30)).expect("header");
        let frame = [0x10u8, 0x02, 0x00, 0x9d, 0x01, 0x2a];
        file.write_all(&(frame.len() as u32).to_le_bytes()).expect("frame size");
        file.write_all(&0u64.to_le_bytes()).expect("timestamp");
        file.write_all(&frame).expect("frame");
        file.flush().expect("flush");
        file
    }

    #[tokio_timeout_test(5)]
    async fn reports_recording_dimensions() {
        let recording = write_recording(1280, 720);
        let camera = IvfFileCamera::new(recording.path());
        let mut media = camera
            .acquire(&CaptureConstraints::preferred())
            .await
            .expect("capture");
        assert_eq!(
            media.settings(),
            TrackSettings {
                width: 1280,
                height: 720,
                frame_rate: 30
            }
        );
        assert!(media.is_live());
        media.stop();
    }

    #[tokio_timeout_test(5)]
    async fn oversized_recording_needs_fallback() {
        let recording = write_recording(3840, 2160);
        let camera = IvfFileCamera::new(recording.path());
        let err = camera
            .acquire(&CaptureConstraints::preferred())
            .await
            .unwrap_err();
        assert_eq!(err, CameraError::OverConstrained { constraint: "width" });

        let media = super::super::acquire_with_fallback(&camera, &CaptureConstraints::preferred())
            .await
            .expect("unconstrained capture");
        assert_eq!(media.settings().width, 3840);
    }

    #[tokio_timeout_test(5)]
    async fn missing_file_is_unavailable() {
        let camera = IvfFileCamera::new("/nonexistent/drink-cam.ivf");
        assert!(matches!(
            camera.acquire(&CaptureConstraints::unconstrained()).await,
            Err(CameraError::Unavailable(_))
        ));
    }
}

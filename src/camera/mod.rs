//! Capture device abstraction.
//!
//! The acquisition engine only ever sees the [`CameraDriver`] trait:
//! `start → next_frame(timeout) → stop`, with every delivered frame carrying
//! a microsecond timestamp and a monotonically increasing frame index.
//! Dropped frames appear as gaps in the index; the driver does not retry.
//!
//! The only built-in device is the [`mock::MockCamera`] development source,
//! which paces itself off the shared monotonic clock and emits
//! software-stamped frames (explicitly marked non-publication-grade). Real
//! SDK backends slot in behind the same trait.

pub mod mock;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{AppResult, IsiError};
use crate::params::CameraParams;

/// Blocking read timeout used by the capture thread.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Where a frame's timestamp came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Stamped by the camera hardware.
    Hardware,
    /// Stamped by the host when the frame arrived. Not publication-grade
    /// timing; good enough for preview and development.
    Software,
}

/// A capture device as reported by enumeration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: String,
    pub model: String,
    pub max_fps: f64,
    pub widths: Vec<u32>,
    pub heights: Vec<u32>,
    pub timestamp_source: TimestampSource,
}

/// Open-time capture configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraConfig {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraConfig {
    /// Derive from the `camera` parameter group.
    pub fn from_params(params: &CameraParams) -> AppResult<Self> {
        if params.camera_fps <= 0.0 || params.width_px <= 0 || params.height_px <= 0 {
            return Err(IsiError::Validation {
                field: "camera".into(),
                reason: "camera group is not configured".into(),
            });
        }
        Ok(Self {
            fps: params.camera_fps,
            width: params.width_px as u32,
            height: params.height_px as u32,
        })
    }
}

/// One delivered camera frame.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub timestamp_us: u64,
    /// Monotonically increasing; gaps mean dropped frames.
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    /// 1 for grayscale, 3 for BGR color.
    pub channels: u32,
    /// Row-major pixels, `height * width * channels` bytes.
    pub pixels: Vec<u8>,
    pub timestamp_source: TimestampSource,
}

/// Abstract capture device.
pub trait CameraDriver: Send {
    fn info(&self) -> &CameraInfo;

    /// Begin streaming.
    fn start(&mut self) -> AppResult<()>;

    /// Block up to `timeout` for the next frame. `Ok(None)` on timeout.
    fn next_frame(&mut self, timeout: Duration) -> AppResult<Option<CapturedFrame>>;

    /// Stop streaming. Idempotent.
    fn stop(&mut self) -> AppResult<()>;
}

/// Enumerate every attached capture device.
pub fn enumerate() -> Vec<CameraInfo> {
    // Development builds expose the mock source; SDK-backed drivers append
    // their devices here.
    vec![mock::mock_camera_info()]
}

/// Capability record for one device id.
pub fn capabilities(id: &str) -> AppResult<CameraInfo> {
    enumerate()
        .into_iter()
        .find(|info| info.id == id)
        .ok_or_else(|| IsiError::UnknownCamera(id.to_string()))
}

/// Open a device by id.
pub fn open(id: &str, config: CameraConfig, clock: Clock) -> AppResult<Box<dyn CameraDriver>> {
    let info = capabilities(id)?;
    if config.fps > info.max_fps {
        return Err(IsiError::Validation {
            field: "camera.camera_fps".into(),
            reason: format!("{} exceeds device maximum {}", config.fps, info.max_fps),
        });
    }
    Ok(Box::new(mock::MockCamera::new(info, config, clock)))
}

/// Hardware-detected values for the volatile `camera` parameter group, from
/// the first enumerated device.
pub fn detect_camera_params() -> Option<CameraParams> {
    let info = enumerate().into_iter().next()?;
    Some(CameraParams {
        device_id: info.id,
        camera_fps: 30.0_f64.min(info.max_fps),
        width_px: i64::from(*info.widths.first()?),
        height_px: i64::from(*info.heights.first()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_exposes_mock() {
        let devices = enumerate();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].timestamp_source, TimestampSource::Software);
        assert!(capabilities(&devices[0].id).is_ok());
        assert!(capabilities("missing").is_err());
    }

    #[test]
    fn test_open_rejects_fps_beyond_capability() {
        let id = enumerate()[0].id.clone();
        let config = CameraConfig {
            fps: 100_000.0,
            width: 64,
            height: 48,
        };
        assert!(open(&id, config, Clock::monotonic()).is_err());
    }

    #[test]
    fn test_config_from_unconfigured_params_fails() {
        let sentinel = CameraParams::sentinel();
        assert!(CameraConfig::from_params(&sentinel).is_err());
        assert!(CameraConfig::from_params(&CameraParams::default()).is_ok());
    }

    #[test]
    fn test_detection_populates_volatile_group() {
        let params = detect_camera_params().unwrap();
        assert!(!params.device_id.is_empty());
        assert!(params.camera_fps > 0.0);
    }
}

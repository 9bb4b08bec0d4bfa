//! A mock capture device that generates synthetic frames.
//!
//! The mock paces itself to the configured frame rate on the shared
//! monotonic clock and produces a drifting gradient pattern with a little
//! photon noise, which is enough to exercise the full acquisition path
//! (preview, recording, sync tracking) without hardware. Timestamps are
//! software-stamped and marked as such.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::camera::{CameraConfig, CameraDriver, CameraInfo, CapturedFrame, TimestampSource};
use crate::clock::Clock;
use crate::error::{AppResult, IsiError};

/// Device id of the built-in mock source.
pub const MOCK_CAMERA_ID: &str = "mock-0";

/// Enumeration record for the mock source.
pub fn mock_camera_info() -> CameraInfo {
    CameraInfo {
        id: MOCK_CAMERA_ID.to_string(),
        model: "Synthetic development source".to_string(),
        max_fps: 240.0,
        widths: vec![320, 640, 1024],
        heights: vec![240, 480, 1024],
        timestamp_source: TimestampSource::Software,
    }
}

pub struct MockCamera {
    info: CameraInfo,
    config: CameraConfig,
    clock: Clock,
    running: bool,
    next_frame_index: u64,
    next_due_us: u64,
    last_timestamp_us: u64,
    rng: StdRng,
    /// Skip one frame index every N frames, to exercise gap handling.
    drop_every: Option<u64>,
}

impl MockCamera {
    pub fn new(info: CameraInfo, config: CameraConfig, clock: Clock) -> Self {
        Self {
            info,
            config,
            clock,
            running: false,
            next_frame_index: 0,
            next_due_us: 0,
            last_timestamp_us: 0,
            rng: StdRng::seed_from_u64(0x1515),
            drop_every: None,
        }
    }

    /// Drop (skip the index of) every `n`-th frame.
    pub fn with_frame_drops(mut self, n: u64) -> Self {
        self.drop_every = Some(n.max(2));
        self
    }

    fn frame_interval_us(&self) -> u64 {
        (1e6 / self.config.fps) as u64
    }

    fn synthesize(&mut self, frame_index: u64) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = vec![0u8; width * height];
        // A gradient that crawls with the frame index, plus noise. Content
        // is irrelevant to the pipeline; variation keeps previews honest.
        let shift = (frame_index % 251) as usize;
        for y in 0..height {
            let row_base = (y * 255 / height.max(1)) as i32;
            for x in 0..width {
                let v = row_base + ((x + shift) % 64) as i32 + self.rng.gen_range(-3..=3);
                pixels[y * width + x] = v.clamp(0, 255) as u8;
            }
        }
        pixels
    }
}

impl CameraDriver for MockCamera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn start(&mut self) -> AppResult<()> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        self.next_frame_index = 0;
        self.next_due_us = self.clock.now_us();
        tracing::info!(
            id = %self.info.id,
            fps = self.config.fps,
            width = self.config.width,
            height = self.config.height,
            "mock camera started"
        );
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> AppResult<Option<CapturedFrame>> {
        if !self.running {
            return Err(IsiError::Internal("mock camera not started".into()));
        }

        let now = self.clock.now_us();
        if self.next_due_us > now {
            let wait_us = self.next_due_us - now;
            if wait_us > timeout.as_micros() as u64 {
                // Manual clocks are advanced by the test, not by sleeping.
                if let Clock::Mono(_) = self.clock {
                    std::thread::sleep(timeout);
                }
                return Ok(None);
            }
            if let Clock::Mono(_) = self.clock {
                std::thread::sleep(Duration::from_micros(wait_us));
            }
        }

        // Timestamps are strictly monotonic even when frames are delivered
        // back-to-back after the loop fell behind schedule.
        let timestamp_us = self
            .clock
            .now_us()
            .max(self.next_due_us)
            .max(self.last_timestamp_us + 1);
        self.last_timestamp_us = timestamp_us;
        let frame_index = self.next_frame_index;
        self.next_frame_index += 1;
        if let Some(n) = self.drop_every {
            if self.next_frame_index % n == 0 {
                // Simulated transport loss: this index is never delivered.
                self.next_frame_index += 1;
            }
        }
        self.next_due_us += self.frame_interval_us();

        let pixels = self.synthesize(frame_index);
        Ok(Some(CapturedFrame {
            timestamp_us,
            frame_index,
            width: self.config.width,
            height: self.config.height,
            channels: 1,
            pixels,
            timestamp_source: TimestampSource::Software,
        }))
    }

    fn stop(&mut self) -> AppResult<()> {
        if self.running {
            self.running = false;
            tracing::info!(id = %self.info.id, "mock camera stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn camera(clock: Clock) -> MockCamera {
        MockCamera::new(
            mock_camera_info(),
            CameraConfig {
                fps: 100.0,
                width: 32,
                height: 24,
            },
            clock,
        )
    }

    #[test]
    fn test_frames_are_paced_and_indexed() {
        let manual = ManualClock::new(0);
        let mut cam = camera(Clock::Manual(manual.clone()));
        cam.start().unwrap();

        let f0 = cam.next_frame(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(f0.frame_index, 0);
        assert_eq!(f0.pixels.len(), 32 * 24);
        assert_eq!(f0.channels, 1);
        assert_eq!(f0.timestamp_source, TimestampSource::Software);

        manual.advance_us(10_000);
        let f1 = cam.next_frame(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(f1.frame_index, 1);
        assert!(f1.timestamp_us > f0.timestamp_us);
    }

    #[test]
    fn test_not_started_is_an_error() {
        let mut cam = camera(Clock::manual(0));
        assert!(cam.next_frame(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_timeout_when_no_frame_due() {
        let manual = ManualClock::new(0);
        let mut cam = camera(Clock::Manual(manual.clone()));
        cam.start().unwrap();
        let _ = cam.next_frame(Duration::from_millis(500)).unwrap().unwrap();
        // Next frame is due 10 ms out; a 1 ms wait returns empty-handed.
        let got = cam.next_frame(Duration::from_millis(1)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_drop_injection_leaves_index_gaps() {
        let manual = ManualClock::new(0);
        let mut cam = camera(Clock::Manual(manual.clone())).with_frame_drops(3);
        cam.start().unwrap();
        let mut indices = Vec::new();
        for _ in 0..6 {
            manual.advance_us(10_000);
            let frame = cam.next_frame(Duration::from_millis(500)).unwrap().unwrap();
            indices.push(frame.frame_index);
        }
        // Some index is skipped; order stays strictly increasing.
        assert!(indices.windows(2).all(|w| w[1] > w[0]));
        assert!(indices.windows(2).any(|w| w[1] - w[0] > 1));
    }

    #[test]
    fn test_real_clock_paces_wall_time() {
        let mut cam = MockCamera::new(
            mock_camera_info(),
            CameraConfig {
                fps: 200.0,
                width: 16,
                height: 16,
            },
            Clock::monotonic(),
        );
        cam.start().unwrap();
        let t0 = std::time::Instant::now();
        for _ in 0..5 {
            let frame = cam.next_frame(Duration::from_millis(500)).unwrap();
            assert!(frame.is_some());
        }
        // 5 frames at 200 fps take at least ~20 ms of pacing.
        assert!(t0.elapsed() >= Duration::from_millis(15));
    }
}

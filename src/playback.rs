//! Session playback: replay a recorded session through the preview path.
//!
//! Playback opens a finalized (or partial) session directory, walks the
//! recorded directions in order, and republishes camera frames and their
//! paired stimulus headers on the [`SharedFrameBus`] at the session's camera
//! rate. Nothing is recorded and the sync tracker is left alone; consumers
//! downstream of the bus cannot tell playback from a live preview.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ndarray::s;

use crate::bus::{CameraFrameMeta, SharedFrameBus};
use crate::clock::Clock;
use crate::error::{AppResult, IsiError};
use crate::recorder::{FrameEvent, SessionMetadata};
use crate::stimulus::{Direction, StimulusHeader};

/// A recorded session opened for replay.
pub struct PlaybackSource {
    dir: PathBuf,
    metadata: SessionMetadata,
}

impl PlaybackSource {
    /// Open `dir` and parse its `metadata.json`.
    pub fn open(dir: &Path) -> AppResult<Self> {
        let metadata_path = dir.join("metadata.json");
        let text = std::fs::read_to_string(&metadata_path)?;
        let metadata: SessionMetadata =
            serde_json::from_str(&text).map_err(|e| IsiError::CorruptArchive {
                path: metadata_path,
                detail: e.to_string(),
            })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
        })
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Directions with a camera archive present on disk.
    pub fn directions(&self) -> Vec<Direction> {
        self.metadata
            .directions_recorded
            .iter()
            .copied()
            .filter(|d| self.dir.join(format!("{d}_camera.h5")).exists())
            .collect()
    }

    /// Replay every direction, pacing at the session's camera rate.
    ///
    /// `on_direction` is invoked before each direction starts so the caller
    /// can update its state machine. Cancellation is honored at every frame
    /// boundary.
    pub fn play(
        &self,
        bus: &SharedFrameBus,
        clock: &Clock,
        cancel: &AtomicBool,
        mut on_direction: impl FnMut(Direction),
    ) -> AppResult<()> {
        let fps = self.metadata.parameters.camera.camera_fps;
        let frame_interval = Duration::from_secs_f64(1.0 / fps.max(1.0));

        for direction in self.directions() {
            on_direction(direction);
            self.play_direction(direction, bus, clock, cancel, frame_interval)?;
            if cancel.load(Ordering::Relaxed) {
                return Err(IsiError::Cancelled);
            }
        }
        Ok(())
    }

    fn play_direction(
        &self,
        direction: Direction,
        bus: &SharedFrameBus,
        clock: &Clock,
        cancel: &AtomicBool,
        frame_interval: Duration,
    ) -> AppResult<()> {
        let h5_path = self.dir.join(format!("{direction}_camera.h5"));
        let file = hdf5::File::open(&h5_path)?;
        let dataset = file.dataset("frames")?;
        let shape = dataset.shape();
        let (n, height, width, channels) = match shape.as_slice() {
            [n, h, w] => (*n, *h, *w, 1usize),
            [n, h, w, c] if *c == 3 || *c == 4 => (*n, *h, *w, *c),
            other => {
                return Err(IsiError::ShapeMismatch {
                    got: other.to_vec(),
                    expected: "(n, H, W) or (n, H, W, 3|4)".into(),
                })
            }
        };

        let events = read_events(&self.dir.join(format!("{direction}_events.json")))?;

        tracing::info!(%direction, frames = n, "replaying direction");
        for i in 0..n {
            if cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            let pixels: Vec<u8> = if shape.len() == 3 {
                dataset
                    .read_slice::<u8, _, ndarray::Ix3>(s![i..i + 1, .., ..])?
                    .into_iter()
                    .collect()
            } else {
                dataset
                    .read_slice::<u8, _, ndarray::Ix4>(s![i..i + 1, .., .., ..])?
                    .into_iter()
                    .collect()
            };

            let now_us = clock.now_us();
            bus.publish_camera(
                CameraFrameMeta {
                    timestamp_us: now_us,
                    frame_index: i as u64,
                    width: width as u32,
                    height: height as u32,
                    channels: channels as u32,
                },
                &pixels,
            )?;
            let header = events.get(i).map(|event| StimulusHeader {
                direction,
                frame_index: event.frame_index,
                bar_angle_deg: event.bar_angle_deg,
                timestamp_us: now_us,
            });
            bus.publish_stimulus(header)?;

            std::thread::sleep(frame_interval);
        }
        Ok(())
    }
}

fn read_events(path: &Path) -> AppResult<Vec<FrameEvent>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut events = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: FrameEvent =
            serde_json::from_str(line).map_err(|e| IsiError::CorruptArchive {
                path: path.to_path_buf(),
                detail: format!("line {}: {e}", line_no + 1),
            })?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;
    use crate::recorder::{RecordedFrame, RecorderHandle};
    use std::sync::Arc;

    fn record_session(root: &Path, name: &str, frames: u64) -> PathBuf {
        let mut parameters = Parameters::default();
        parameters.session.session_name = name.to_string();
        parameters.camera.camera_fps = 500.0; // keep the replay test fast
        let recorder = RecorderHandle::start(root, parameters, None, 64).unwrap();
        recorder.start_direction(Direction::LR).unwrap();
        for i in 0..frames {
            recorder
                .write_frame(RecordedFrame {
                    direction: Direction::LR,
                    width: 8,
                    height: 6,
                    channels: 1,
                    pixels: Arc::new(vec![i as u8; 48]),
                    event: FrameEvent {
                        timestamp_us: (i + 1) * 2_000,
                        camera_frame_index: i,
                        frame_index: i,
                        bar_angle_deg: i as f64,
                    },
                })
                .unwrap();
        }
        recorder.end_direction(Direction::LR).unwrap();
        recorder.finalize(false).unwrap()
    }

    #[test]
    fn test_replay_republishes_recorded_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let session = record_session(tmp.path(), "replay", 6);

        let source = PlaybackSource::open(&session).unwrap();
        assert_eq!(source.directions(), vec![Direction::LR]);

        let bus = SharedFrameBus::create(&tmp.path().join("shm"), 16, 64).unwrap();
        let mut cam_rx = bus.subscribe_camera();
        let mut stim_rx = bus.subscribe_stimulus();
        let cancel = AtomicBool::new(false);
        let mut seen_directions = Vec::new();

        source
            .play(&bus, &Clock::monotonic(), &cancel, |d| {
                seen_directions.push(d)
            })
            .unwrap();

        assert_eq!(seen_directions, vec![Direction::LR]);
        let mut cam_frames = 0;
        while let Some((meta, pixels)) = cam_rx.poll() {
            assert_eq!(pixels.len(), 48);
            assert_eq!(pixels[0], meta.frame_index as u8);
            cam_frames += 1;
        }
        assert_eq!(cam_frames, 6); // 16-slot ring holds all 6
        let mut angles = Vec::new();
        while let Some(Some(header)) = stim_rx.poll() {
            angles.push(header.bar_angle_deg);
        }
        assert_eq!(angles, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_cancel_stops_replay() {
        let tmp = tempfile::tempdir().unwrap();
        let session = record_session(tmp.path(), "replay-cancel", 4);
        let source = PlaybackSource::open(&session).unwrap();
        let bus = SharedFrameBus::create(&tmp.path().join("shm"), 8, 64).unwrap();
        let cancel = AtomicBool::new(true);
        let err = source
            .play(&bus, &Clock::monotonic(), &cancel, |_| {})
            .unwrap_err();
        assert!(matches!(err, IsiError::Cancelled));
    }

    #[test]
    fn test_missing_metadata_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(PlaybackSource::open(tmp.path()).is_err());
    }
}

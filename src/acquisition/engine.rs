//! Camera-triggered acquisition engine.
//!
//! The camera is the limiting, non-shiftable clock of the rig. Instead of
//! running display and capture as two free-running loops that drift apart,
//! every camera frame *derives* the stimulus frame index from the camera
//! timestamp: `i_stim = floor((t_cam - t_phase_start) * monitor_fps)`,
//! clamped to the sweep length. What the brain saw and what we know it saw
//! can then never disagree, and the per-frame pairing recorded to disk is
//! exact rather than reconstructed.
//!
//! Per camera frame the engine:
//!
//! 1. reads `(t_cam, image, i_cam)` from the driver,
//! 2. looks up the stimulus frame for the current phase,
//! 3. publishes both to the [`SharedFrameBus`] (never blocking on readers),
//! 4. records a [`SyncTracker`] sample (`stimulus_ts = t_cam` here),
//! 5. in record mode, routes the frame to the recorder queue with a bounded
//!    wait; sustained backpressure faults the run.
//!
//! The loop runs on the dedicated `capture-thread`; the orchestrator flips
//! the shared [`Phase`] at phase boundaries and raises `stop` to halt it at
//! the next frame boundary.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::{CameraFrameMeta, SharedFrameBus};
use crate::camera::{CameraDriver, CapturedFrame, READ_TIMEOUT};
use crate::error::IsiError;
use crate::recorder::{FrameEvent, FrameSink, RecordedFrame};
use crate::stimulus::library::StimulusLibrary;
use crate::stimulus::{Direction, StimulusHeader};
use crate::sync::SyncTracker;

/// What the capture thread should do with the current frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Phase {
    /// Baseline / between-trial: blank stimulus, nothing recorded.
    Blank,
    /// One sweep of `direction`.
    Stimulus {
        direction: Direction,
        cycle: u32,
        /// Phase origin on the shared monotonic clock.
        t_phase_start_us: u64,
        /// Route frames to the recorder.
        record: bool,
    },
}

/// Most recent camera frame, kept for preview-independent consumers
/// (anatomical capture).
#[derive(Clone)]
pub struct LatestFrame {
    pub timestamp_us: u64,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub pixels: Arc<Vec<u8>>,
}

/// State shared between the orchestrator and the capture thread.
pub struct EngineShared {
    pub phase: RwLock<Phase>,
    /// Halt at the next frame boundary.
    pub stop: AtomicBool,
    pub latest: Mutex<Option<LatestFrame>>,
}

impl EngineShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: RwLock::new(Phase::Blank),
            stop: AtomicBool::new(false),
            latest: Mutex::new(None),
        })
    }
}

/// Out-of-band messages from the capture thread to the orchestrator.
#[derive(Debug)]
pub enum EngineNote {
    Progress {
        direction: Direction,
        cycle: u32,
        frame: u64,
    },
    Fault(IsiError),
}

/// Everything the per-frame step needs, owned by the capture thread.
pub struct Engine {
    pub shared: Arc<EngineShared>,
    pub bus: Arc<SharedFrameBus>,
    pub sync: Arc<SyncTracker>,
    pub library: Arc<StimulusLibrary>,
    pub sink: Option<FrameSink>,
    pub monitor_fps: f64,
}

impl Engine {
    /// Handle one delivered camera frame. Returns a progress note, or the
    /// fault that must end the run.
    pub fn process_frame(&self, frame: CapturedFrame) -> Result<Option<EngineNote>, IsiError> {
        let t_cam = frame.timestamp_us;
        let i_cam = frame.frame_index;
        let pixels = Arc::new(frame.pixels);

        *self.shared.latest.lock() = Some(LatestFrame {
            timestamp_us: t_cam,
            frame_index: i_cam,
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
            pixels: Arc::clone(&pixels),
        });

        self.bus.publish_camera(
            CameraFrameMeta {
                timestamp_us: t_cam,
                frame_index: i_cam,
                width: frame.width,
                height: frame.height,
                channels: frame.channels,
            },
            &pixels,
        )?;

        let phase = *self.shared.phase.read();
        match phase {
            Phase::Blank => {
                self.bus.publish_stimulus(None)?;
                self.sync.record(t_cam, t_cam, 0);
                Ok(None)
            }
            Phase::Stimulus {
                direction,
                cycle,
                t_phase_start_us,
                record,
            } => {
                let frames_per_cycle =
                    self.library.frames_per_cycle(direction).ok_or_else(|| {
                        IsiError::StimulusIndexOutOfRange {
                            direction,
                            index: 0,
                            available: 0,
                        }
                    })?;

                let phase_s = t_cam.saturating_sub(t_phase_start_us) as f64 / 1e6;
                let i_raw = (phase_s * self.monitor_fps).floor() as usize;
                let i_stim = i_raw.min(frames_per_cycle - 1);
                let angle = self.library.angle(direction, i_stim).ok_or({
                    IsiError::StimulusIndexOutOfRange {
                        direction,
                        index: i_stim,
                        available: frames_per_cycle,
                    }
                })?;

                // Camera-triggered design: the stimulus presentation
                // timestamp is the camera timestamp itself.
                let header = StimulusHeader {
                    direction,
                    frame_index: i_stim as u64,
                    bar_angle_deg: angle,
                    timestamp_us: t_cam,
                };
                self.bus.publish_stimulus(Some(header))?;
                self.sync.record(t_cam, t_cam, i_stim as u64);

                if record {
                    if let Some(sink) = &self.sink {
                        sink.write_frame(RecordedFrame {
                            direction,
                            width: frame.width,
                            height: frame.height,
                            channels: frame.channels,
                            pixels,
                            event: FrameEvent {
                                timestamp_us: t_cam,
                                camera_frame_index: i_cam,
                                frame_index: i_stim as u64,
                                bar_angle_deg: angle,
                            },
                        })?;
                    }
                }

                Ok(Some(EngineNote::Progress {
                    direction,
                    cycle,
                    frame: i_stim as u64,
                }))
            }
        }
    }
}

/// Capture-thread body: drain the camera until `stop`, pushing notes to the
/// orchestrator. The camera is stopped on the way out regardless of how the
/// loop ends.
pub fn run_capture_loop(
    mut camera: Box<dyn CameraDriver>,
    engine: Engine,
    notes: crossbeam_channel::Sender<EngineNote>,
) {
    tracing::debug!("capture loop running");
    while !engine.shared.stop.load(Ordering::Relaxed) {
        match camera.next_frame(READ_TIMEOUT) {
            Ok(Some(frame)) => match engine.process_frame(frame) {
                Ok(Some(note)) => {
                    let _ = notes.send(note);
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = notes.send(EngineNote::Fault(err));
                    break;
                }
            },
            Ok(None) => {
                // Read timeout; check stop and wait again.
            }
            Err(err) => {
                let _ = notes.send(EngineNote::Fault(err));
                break;
            }
        }
    }
    if let Err(err) = camera.stop() {
        tracing::warn!(error = %err, "camera stop failed");
    }
    tracing::debug!("capture loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::TimestampSource;
    use crate::clock::Clock;
    use crate::params::{MonitorParams, StimulusParams};
    use crate::stimulus::generator::StimulusGenerator;

    fn small_library() -> Arc<StimulusLibrary> {
        let monitor = MonitorParams {
            width_px: 16,
            height_px: 12,
            width_cm: 52.0,
            height_cm: 29.3,
            distance_cm: 10.0,
            lateral_angle_deg: 0.0,
            tilt_angle_deg: 0.0,
            monitor_fps: 10.0,
        };
        let stimulus = StimulusParams {
            drift_speed_deg_per_sec: 60.0,
            ..StimulusParams::default()
        };
        let generator = StimulusGenerator::new(monitor, stimulus).unwrap();
        Arc::new(
            StimulusLibrary::generate(
                &generator,
                &[Direction::LR],
                serde_json::json!({}),
                "fp".into(),
                None,
                None,
            )
            .unwrap(),
        )
    }

    fn engine(tmp: &std::path::Path, sink: Option<FrameSink>) -> Engine {
        let bus = Arc::new(SharedFrameBus::create(tmp, 4, 16 * 12).unwrap());
        let sync = Arc::new(SyncTracker::new(Clock::manual(0)));
        sync.start();
        Engine {
            shared: EngineShared::new(),
            bus,
            sync,
            library: small_library(),
            sink,
            monitor_fps: 10.0,
        }
    }

    fn frame(timestamp_us: u64, frame_index: u64) -> CapturedFrame {
        CapturedFrame {
            timestamp_us,
            frame_index,
            width: 16,
            height: 12,
            channels: 1,
            pixels: vec![7u8; 16 * 12],
            timestamp_source: TimestampSource::Software,
        }
    }

    #[test]
    fn test_blank_phase_publishes_blank_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), None);
        let mut stim_rx = engine.bus.subscribe_stimulus();
        let mut cam_rx = engine.bus.subscribe_camera();

        let note = engine.process_frame(frame(1_000, 0)).unwrap();
        assert!(note.is_none());
        assert_eq!(stim_rx.poll().unwrap(), None);
        let (meta, pixels) = cam_rx.poll().unwrap();
        assert_eq!(meta.frame_index, 0);
        assert_eq!(pixels.len(), 16 * 12);
        // Latest-frame slot follows the camera.
        assert_eq!(
            engine.shared.latest.lock().as_ref().unwrap().timestamp_us,
            1_000
        );
    }

    #[test]
    fn test_stimulus_phase_maps_time_to_index() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path(), None);
        let n = engine.library.frames_per_cycle(Direction::LR).unwrap();
        *engine.shared.phase.write() = Phase::Stimulus {
            direction: Direction::LR,
            cycle: 0,
            t_phase_start_us: 1_000_000,
            record: false,
        };
        let mut stim_rx = engine.bus.subscribe_stimulus();

        // 0.25 s into the phase at 10 fps -> stimulus frame 2.
        let note = engine.process_frame(frame(1_250_000, 5)).unwrap();
        match note {
            Some(EngineNote::Progress {
                direction, frame, ..
            }) => {
                assert_eq!(direction, Direction::LR);
                assert_eq!(frame, 2);
            }
            other => panic!("unexpected note {other:?}"),
        }
        let header = stim_rx.poll().unwrap().unwrap();
        assert_eq!(header.frame_index, 2);
        assert_eq!(header.timestamp_us, 1_250_000);
        assert_eq!(
            header.bar_angle_deg,
            engine.library.angle(Direction::LR, 2).unwrap()
        );

        // Far past the sweep end clamps to the last frame.
        let note = engine.process_frame(frame(60_000_000, 6)).unwrap();
        match note {
            Some(EngineNote::Progress { frame, .. }) => assert_eq!(frame, (n - 1) as u64),
            other => panic!("unexpected note {other:?}"),
        }
    }

    #[test]
    fn test_record_phase_routes_to_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = tmp.path().join("sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        let mut parameters = crate::params::Parameters::default();
        parameters.session.session_name = "engine-test".into();
        let recorder =
            crate::recorder::RecorderHandle::start(&sessions, parameters, None, 64).unwrap();
        recorder.start_direction(Direction::LR).unwrap();

        let engine = engine(&tmp.path().join("shm"), Some(recorder.frame_sink()));
        *engine.shared.phase.write() = Phase::Stimulus {
            direction: Direction::LR,
            cycle: 0,
            t_phase_start_us: 0,
            record: true,
        };
        for i in 0..4u64 {
            engine.process_frame(frame(i * 100_000, i)).unwrap();
        }
        recorder.end_direction(Direction::LR).unwrap();
        let final_dir = recorder.finalize(false).unwrap();

        let file = hdf5::File::open(final_dir.join("LR_camera.h5")).unwrap();
        assert_eq!(file.dataset("frames").unwrap().shape()[0], 4);
        let events = std::fs::read_to_string(final_dir.join("LR_events.json")).unwrap();
        assert_eq!(events.lines().count(), 4);
    }
}

//! Acquisition sequence controller.
//!
//! The orchestrator owns the outer state machine
//! `Idle → Preparing → Baseline → StimulusCycle(direction, cycle) → Between
//! → … → Finalizing → Idle`, the run mode (preview / record / playback),
//! and cancellation. It runs on its own `orchestrator-thread`: `start()`
//! only hands the request over, and every long wait inside a run polls the
//! cancel flag, the capture thread's fault channel, and the phase timer.
//!
//! In `Preparing` the orchestrator guarantees a stimulus library that covers
//! the requested directions: the in-memory slot is reused when its
//! fingerprint still matches, otherwise a fingerprint-gated load from the
//! library cache directory is attempted, and only then are frames
//! regenerated (forwarding progress events). After regeneration the library
//! is saved back to the cache, best effort.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use ndarray::Array2;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::acquisition::engine::{run_capture_loop, Engine, EngineNote, EngineShared, Phase};
use crate::acquisition::{AcqState, AcquisitionMode, SystemState};
use crate::bus::SharedFrameBus;
use crate::camera::{self, CameraConfig};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{AppResult, IsiError};
use crate::messages::{Event, EventBus};
use crate::params::{ParameterStore, Parameters};
use crate::playback::PlaybackSource;
use crate::recorder::RecorderHandle;
use crate::stimulus::generator::StimulusGenerator;
use crate::stimulus::library::{LibrarySlot, StimulusLibrary};
use crate::stimulus::Direction;
use crate::sync::SyncTracker;

/// Poll interval of the in-run wait loops.
const TICK: Duration = Duration::from_millis(25);
/// Cadence of `sync_sample_histogram` events during a run.
const SYNC_EVENT_INTERVAL: Duration = Duration::from_secs(1);

/// Shared services the orchestrator drives. Everything is passed in
/// explicitly at construction; the orchestrator holds no globals.
pub struct OrchestratorDeps {
    pub settings: Settings,
    pub store: Arc<ParameterStore>,
    pub library: Arc<LibrarySlot>,
    pub bus: Arc<SharedFrameBus>,
    pub sync: Arc<SyncTracker>,
    pub clock: Clock,
    pub events: EventBus,
}

struct RunRequest {
    mode: AcquisitionMode,
    reply: Sender<AppResult<()>>,
}

/// Handle to the orchestrator thread.
pub struct Orchestrator {
    cmd_tx: Option<Sender<RunRequest>>,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    state: Arc<RwLock<SystemState>>,
    current_shared: Arc<Mutex<Option<Arc<EngineShared>>>>,
    pending_anatomical: Arc<Mutex<Option<Array2<u8>>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Orchestrator {
    /// Spawn the orchestrator thread.
    pub fn new(deps: OrchestratorDeps) -> AppResult<Self> {
        let (cmd_tx, cmd_rx) = unbounded::<RunRequest>();
        let cancel = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(false));
        let state = Arc::new(RwLock::new(SystemState::default()));
        let current_shared: Arc<Mutex<Option<Arc<EngineShared>>>> = Arc::new(Mutex::new(None));
        let pending_anatomical = Arc::new(Mutex::new(None));

        let worker = Worker {
            deps,
            cancel: Arc::clone(&cancel),
            running: Arc::clone(&running),
            state: Arc::clone(&state),
            current_shared: Arc::clone(&current_shared),
            pending_anatomical: Arc::clone(&pending_anatomical),
        };
        let thread = std::thread::Builder::new()
            .name("orchestrator-thread".into())
            .spawn(move || worker.run(cmd_rx))
            .map_err(IsiError::Io)?;

        Ok(Self {
            cmd_tx: Some(cmd_tx),
            cancel,
            running,
            state,
            current_shared,
            pending_anatomical,
            thread: Some(thread),
        })
    }

    /// Request a run. Returns once the orchestrator has accepted it; the
    /// run itself proceeds asynchronously, reporting through the event bus.
    pub fn start(&self, mode: AcquisitionMode) -> AppResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IsiError::AcquisitionRunning);
        }
        self.cancel.store(false, Ordering::Release);

        let (reply_tx, reply_rx) = bounded(1);
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| IsiError::Internal("orchestrator stopped".into()))?;
        tx.send(RunRequest {
            mode,
            reply: reply_tx,
        })
        .map_err(|_| IsiError::Internal("orchestrator thread terminated".into()))?;
        reply_rx
            .recv()
            .map_err(|_| IsiError::Internal("orchestrator thread terminated".into()))?
    }

    /// Cancel the active run. The capture thread drains one more frame, the
    /// recorder finalizes what completed, and the state machine returns to
    /// `Idle`.
    pub fn stop(&self) -> AppResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(IsiError::AcquisitionIdle);
        }
        self.cancel.store(true, Ordering::Release);
        Ok(())
    }

    /// Current state snapshot.
    pub fn system_state(&self) -> SystemState {
        self.state.read().clone()
    }

    /// Grab the most recent camera frame as the anatomical reference for the
    /// next recorded session.
    pub fn capture_anatomical(&self) -> AppResult<()> {
        let latest = {
            let shared = self.current_shared.lock();
            shared
                .as_ref()
                .and_then(|s| s.latest.lock().clone())
                .ok_or(IsiError::AcquisitionIdle)?
        };
        let gray = frame_to_gray(
            latest.height as usize,
            latest.width as usize,
            latest.channels as usize,
            &latest.pixels,
        )?;
        *self.pending_anatomical.lock() = Some(gray);
        tracing::info!("anatomical reference captured");
        Ok(())
    }

    /// Block until the state machine is back in `Idle` (tests, shutdown).
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.running.load(Ordering::Acquire) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        !self.running.load(Ordering::Acquire)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.cmd_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Grayscale reduction used for the anatomical snapshot (BGR luminance for
/// color sources, pass-through for mono).
fn frame_to_gray(
    height: usize,
    width: usize,
    channels: usize,
    pixels: &[u8],
) -> AppResult<Array2<u8>> {
    if pixels.len() != height * width * channels.max(1) {
        return Err(IsiError::ShapeMismatch {
            got: vec![pixels.len()],
            expected: format!("{height}*{width}*{channels} bytes"),
        });
    }
    let mut gray = Array2::<u8>::zeros((height, width));
    match channels {
        0 | 1 => {
            for y in 0..height {
                for x in 0..width {
                    gray[(y, x)] = pixels[y * width + x];
                }
            }
        }
        3 | 4 => {
            for y in 0..height {
                for x in 0..width {
                    let base = (y * width + x) * channels;
                    let b = pixels[base] as f64;
                    let g = pixels[base + 1] as f64;
                    let r = pixels[base + 2] as f64;
                    gray[(y, x)] = (0.114 * b + 0.587 * g + 0.299 * r).round() as u8;
                }
            }
        }
        other => {
            return Err(IsiError::ShapeMismatch {
                got: vec![height, width, other],
                expected: "1, 3 or 4 channels".into(),
            })
        }
    }
    Ok(gray)
}

/// Ensure the slot holds a library covering `directions` for the current
/// parameters: reuse, fingerprint-gated load from the cache, or regenerate
/// (with progress forwarded to the event bus and a best-effort save back).
pub fn ensure_library(
    store: &ParameterStore,
    slot: &LibrarySlot,
    events: &EventBus,
    library_dir: &std::path::Path,
    directions: &[Direction],
    cancel: &AtomicBool,
) -> AppResult<Arc<StimulusLibrary>> {
    let fingerprint = store.fingerprint();
    if let Some(library) = slot.get() {
        if library.fingerprint() == fingerprint && library.covers(directions) {
            return Ok(library);
        }
    }

    let snapshot = store.generation_snapshot();
    if library_dir.join("library_metadata.json").exists() {
        match StimulusLibrary::load(library_dir, &snapshot, &fingerprint, false) {
            Ok(library) if library.covers(directions) => {
                let library = Arc::new(library);
                slot.install(Arc::clone(&library));
                events.emit(Event::LibraryReady {
                    directions: library.materialized_directions(),
                    total_frames: library.total_frames(),
                    fingerprint: fingerprint.clone(),
                });
                return Ok(library);
            }
            Ok(_) => tracing::info!("cached library does not cover requested directions"),
            Err(err) => tracing::info!(error = %err, "cached library unusable, regenerating"),
        }
    }

    let params = store.snapshot();
    let generator = StimulusGenerator::new(params.monitor.clone(), params.stimulus.clone())?;

    let (progress_tx, progress_rx) = bounded(64);
    let forward_events = events.clone();
    let forwarder = std::thread::Builder::new()
        .name("library-progress".into())
        .spawn(move || {
            for progress in progress_rx {
                forward_events.emit(Event::LibraryProgress(progress));
            }
        })
        .map_err(IsiError::Io)?;

    let generated = StimulusLibrary::generate(
        &generator,
        directions,
        snapshot,
        fingerprint.clone(),
        Some(&progress_tx),
        Some(cancel),
    );
    drop(progress_tx);
    let _ = forwarder.join();
    let library = Arc::new(generated?);

    if let Err(err) = library.save(library_dir) {
        tracing::warn!(error = %err, "could not cache stimulus library");
    }
    slot.install(Arc::clone(&library));
    events.emit(Event::LibraryReady {
        directions: library.materialized_directions(),
        total_frames: library.total_frames(),
        fingerprint,
    });
    Ok(library)
}

struct Worker {
    deps: OrchestratorDeps,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    state: Arc<RwLock<SystemState>>,
    current_shared: Arc<Mutex<Option<Arc<EngineShared>>>>,
    pending_anatomical: Arc<Mutex<Option<Array2<u8>>>>,
}

/// Why a wait loop ended early.
enum WaitOutcome {
    Elapsed,
    Cancelled,
}

impl Worker {
    fn run(self, cmd_rx: Receiver<RunRequest>) {
        while let Ok(request) = cmd_rx.recv() {
            let mode = request.mode;
            let _ = request.reply.send(Ok(()));

            self.set_state(AcqState::Preparing, Some(mode), None);
            let result = self.run_acquisition(mode);

            match result {
                Ok(()) => self.set_state(AcqState::Idle, None, None),
                Err(IsiError::Cancelled) => {
                    tracing::info!("acquisition cancelled");
                    self.set_state(AcqState::Idle, None, None);
                }
                Err(err) => {
                    tracing::error!(error = %err, "acquisition run failed");
                    self.deps.events.emit(Event::from_error(&err));
                    self.set_state(AcqState::Idle, None, Some(err.to_string()));
                }
            }
            self.running.store(false, Ordering::Release);
        }
    }

    fn set_state(&self, state: AcqState, mode: Option<AcquisitionMode>, fault: Option<String>) {
        {
            let mut current = self.state.write();
            current.state = state;
            if state.is_idle() {
                current.mode = None;
            } else if mode.is_some() {
                current.mode = mode;
            }
            if let Some(fault) = fault {
                current.last_fault = Some(fault);
            }
            self.deps.events.emit(Event::SystemState {
                state: current.state,
                mode: current.mode,
                last_fault: current.last_fault.clone(),
            });
        }
    }

    fn run_acquisition(&self, mode: AcquisitionMode) -> AppResult<()> {
        let params = self.deps.store.snapshot();

        if mode == AcquisitionMode::Playback {
            return self.run_playback(&params);
        }

        if camera::enumerate().is_empty() {
            return Err(IsiError::HardwareUnavailable);
        }

        let directions = params.acquisition.directions.clone();
        let library = ensure_library(
            &self.deps.store,
            &self.deps.library,
            &self.deps.events,
            &self.deps.settings.library_dir,
            &directions,
            &self.cancel,
        )?;

        let config = CameraConfig::from_params(&params.camera)?;
        let device_id = if params.camera.device_id.is_empty() {
            camera::enumerate()
                .into_iter()
                .next()
                .ok_or(IsiError::HardwareUnavailable)?
                .id
        } else {
            params.camera.device_id.clone()
        };
        let mut driver = camera::open(&device_id, config, self.deps.clock.clone())?;
        driver.start()?;

        self.deps.sync.start();

        let record = mode == AcquisitionMode::Record;
        let recorder = if record {
            let queue_capacity =
                (params.camera.camera_fps * self.deps.settings.recorder_queue_secs) as usize;
            Some(RecorderHandle::start(
                &self.deps.settings.sessions_dir(),
                params.clone(),
                self.pending_anatomical.lock().take(),
                queue_capacity,
            )?)
        } else {
            None
        };

        let shared = EngineShared::new();
        *self.current_shared.lock() = Some(Arc::clone(&shared));
        let (notes_tx, notes_rx) = unbounded();
        let engine = Engine {
            shared: Arc::clone(&shared),
            bus: Arc::clone(&self.deps.bus),
            sync: Arc::clone(&self.deps.sync),
            library: Arc::clone(&library),
            sink: recorder.as_ref().map(|r| r.frame_sink()),
            monitor_fps: params.monitor.monitor_fps,
        };
        let capture = std::thread::Builder::new()
            .name("capture-thread".into())
            .spawn(move || run_capture_loop(driver, engine, notes_tx))
            .map_err(IsiError::Io)?;

        let sequence_result =
            self.run_sequence(&params, &directions, &library, &shared, &notes_rx, record,
                recorder.as_ref());

        // Teardown happens regardless of how the sequence ended.
        let cancelled = matches!(sequence_result, Err(IsiError::Cancelled));
        if cancelled {
            self.set_state(AcqState::Cancelling, None, None);
        } else {
            self.set_state(AcqState::Finalizing, None, None);
        }
        shared.stop.store(true, Ordering::Release);
        let _ = capture.join();
        self.deps.sync.stop();
        *self.current_shared.lock() = None;

        if let Some(recorder) = recorder {
            let partial = cancelled || sequence_result.is_err();
            match recorder.finalize(partial) {
                Ok(path) => self.deps.events.emit(Event::SessionComplete { path, partial }),
                Err(err) => {
                    tracing::error!(error = %err, "recorder finalize failed");
                    if sequence_result.is_ok() {
                        return Err(err);
                    }
                }
            }
        }
        sequence_result
    }

    /// The baseline → stimulus → between … → baseline phase sequence.
    #[allow(clippy::too_many_arguments)]
    fn run_sequence(
        &self,
        params: &Parameters,
        directions: &[Direction],
        library: &Arc<StimulusLibrary>,
        shared: &Arc<EngineShared>,
        notes_rx: &Receiver<EngineNote>,
        record: bool,
        recorder: Option<&RecorderHandle>,
    ) -> AppResult<()> {
        let monitor_fps = params.monitor.monitor_fps;
        let cycles = params.acquisition.cycles.max(1);

        self.set_state(AcqState::Baseline, None, None);
        if let WaitOutcome::Cancelled =
            self.wait_phase(params.acquisition.baseline_sec, notes_rx)?
        {
            return Err(IsiError::Cancelled);
        }

        for (index, &direction) in directions.iter().enumerate() {
            let frames_per_cycle = library
                .frames_per_cycle(direction)
                .ok_or(IsiError::LibraryNotLoaded)?;
            let sweep_secs = frames_per_cycle as f64 / monitor_fps;

            if let Some(recorder) = recorder {
                recorder.start_direction(direction)?;
            }

            for cycle in 0..cycles {
                self.set_state(AcqState::StimulusCycle { direction, cycle }, None, None);
                *shared.phase.write() = Phase::Stimulus {
                    direction,
                    cycle,
                    t_phase_start_us: self.deps.clock.now_us(),
                    record,
                };
                let outcome = self.wait_phase(sweep_secs, notes_rx);
                *shared.phase.write() = Phase::Blank;
                if let Some(recorder) = recorder {
                    recorder.end_cycle(direction)?;
                }
                if let WaitOutcome::Cancelled = outcome? {
                    if let Some(recorder) = recorder {
                        recorder.end_direction(direction)?;
                    }
                    return Err(IsiError::Cancelled);
                }
            }

            if let Some(recorder) = recorder {
                recorder.end_direction(direction)?;
            }

            if index + 1 < directions.len() && params.acquisition.between_sec > 0.0 {
                self.set_state(AcqState::Between, None, None);
                if let WaitOutcome::Cancelled =
                    self.wait_phase(params.acquisition.between_sec, notes_rx)?
                {
                    return Err(IsiError::Cancelled);
                }
            }
        }

        // Closing baseline.
        self.set_state(AcqState::Baseline, None, None);
        if let WaitOutcome::Cancelled =
            self.wait_phase(params.acquisition.baseline_sec, notes_rx)?
        {
            return Err(IsiError::Cancelled);
        }
        Ok(())
    }

    /// Sleep out one phase, draining engine notes, forwarding progress,
    /// publishing sync histograms, and honoring cancellation and faults.
    fn wait_phase(
        &self,
        duration_secs: f64,
        notes_rx: &Receiver<EngineNote>,
    ) -> AppResult<WaitOutcome> {
        let deadline = Instant::now() + Duration::from_secs_f64(duration_secs.max(0.0));
        let mut next_sync_event = Instant::now() + SYNC_EVENT_INTERVAL;

        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Ok(WaitOutcome::Cancelled);
            }
            for note in notes_rx.try_iter() {
                match note {
                    EngineNote::Progress {
                        direction,
                        cycle,
                        frame,
                    } => self.deps.events.emit(Event::AcquisitionProgress {
                        direction,
                        cycle,
                        frame,
                    }),
                    EngineNote::Fault(err) => return Err(err),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::Elapsed);
            }
            if now >= next_sync_event {
                self.deps.events.emit(Event::SyncSampleHistogram {
                    snapshot: self.deps.sync.snapshot(None),
                });
                next_sync_event = now + SYNC_EVENT_INTERVAL;
            }
            std::thread::sleep(TICK.min(deadline - now));
        }
    }

    fn run_playback(&self, params: &Parameters) -> AppResult<()> {
        let dir = self.resolve_playback_dir(params)?;
        let source = PlaybackSource::open(&dir)?;
        if source.directions().is_empty() {
            return Err(IsiError::Validation {
                field: "session".into(),
                reason: format!("{} has no recorded directions", dir.display()),
            });
        }

        tracing::info!(session = %dir.display(), "playback starting");
        let result = source.play(
            &self.deps.bus,
            &self.deps.clock,
            &self.cancel,
            |direction| {
                self.set_state(AcqState::StimulusCycle { direction, cycle: 0 }, None, None);
            },
        );
        self.set_state(AcqState::Finalizing, None, None);
        result
    }

    /// Playback target: the configured session name if it exists on disk,
    /// otherwise the most recently modified session.
    fn resolve_playback_dir(&self, params: &Parameters) -> AppResult<PathBuf> {
        let sessions = self.deps.settings.sessions_dir();
        let named = sessions.join(params.session.session_name.trim());
        if !params.session.session_name.trim().is_empty() && named.join("metadata.json").exists() {
            return Ok(named);
        }

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        if sessions.is_dir() {
            for entry in std::fs::read_dir(&sessions)? {
                let entry = entry?;
                let path = entry.path();
                if !path.join("metadata.json").exists() {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                    newest = Some((modified, path));
                }
            }
        }
        newest.map(|(_, path)| path).ok_or_else(|| IsiError::Validation {
            field: "session".into(),
            reason: "no recorded session available for playback".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_gray_identity_on_mono() {
        let pixels = vec![10u8, 20, 30, 40, 50, 60];
        let gray = frame_to_gray(2, 3, 1, &pixels).unwrap();
        assert_eq!(gray[(0, 0)], 10);
        assert_eq!(gray[(1, 2)], 60);
    }

    #[test]
    fn test_frame_to_gray_equal_channels_round_trip() {
        // All channels equal must reproduce the channel value.
        let mut pixels = Vec::new();
        for v in [0u8, 7, 128, 255] {
            pixels.extend_from_slice(&[v, v, v]);
        }
        let gray = frame_to_gray(1, 4, 3, &pixels).unwrap();
        assert_eq!(gray[(0, 0)], 0);
        assert_eq!(gray[(0, 1)], 7);
        assert_eq!(gray[(0, 2)], 128);
        assert_eq!(gray[(0, 3)], 255);
    }

    #[test]
    fn test_frame_to_gray_rejects_bad_shapes() {
        assert!(frame_to_gray(2, 2, 1, &[0u8; 3]).is_err());
        assert!(frame_to_gray(1, 1, 2, &[0u8; 2]).is_err());
    }
}

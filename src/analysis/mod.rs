//! Post-acquisition Fourier retinotopy pipeline.
//!
//! Stages, in order: load & normalize → correlate frames to bar angles →
//! hemodynamic delay compensation → per-pixel FFT at the stimulus frequency
//! → retinotopic maps → visual field sign → segmentation → persistence.
//! Deterministic given identical inputs; running twice on the same session
//! produces bit-identical sign and area maps.
//!
//! One analysis runs per process ([`AnalysisHandle`] refuses a second start
//! while one is active) on a single `analysis-worker` thread. Cancellation
//! is cooperative at stage boundaries only; the FFT stage is not
//! interruptible.
//!
//! The hemodynamic compensation is a whole-frame shift of the
//! frame-to-angle correspondence derived from `analysis.hemodynamic_delay_ms`
//! (an approximation of HRF deconvolution, not a model fit). With both sweep
//! directions of an axis available the combination step cancels the delay
//! anyway and the parameter only matters for single-direction fallbacks.

pub mod fourier;
pub mod load;
pub mod render;
pub mod results;
pub mod retinotopy;
pub mod segmentation;
pub mod vfs;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{AppResult, IsiError};
use crate::messages::{Event, EventBus};
use crate::params::AnalysisParams;
use crate::stimulus::Direction;

use fourier::{direction_spectrum, DirectionSpectrum};
use load::{load_session, SessionData};
use results::AnalysisResults;
use retinotopy::{combine_pair, combine_single, gaussian_smooth, SweepRange};

/// Fewest frames per direction we will attempt to analyze.
const MIN_FRAMES: usize = 8;

/// Progress/stage snapshot for `get_analysis_status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    pub running: bool,
    pub stage: String,
    pub fraction: f64,
}

impl Default for AnalysisStatus {
    fn default() -> Self {
        Self {
            running: false,
            stage: "idle".into(),
            fraction: 0.0,
        }
    }
}

/// Outcome summary of one pipeline run.
#[derive(Debug)]
pub struct AnalysisReport {
    pub output_dir: PathBuf,
    pub num_areas: usize,
    /// Directions absent, unreadable, or without one complete cycle.
    pub missing: Vec<Direction>,
}

/// Handle to the single background analysis worker.
pub struct AnalysisHandle {
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    status: Arc<Mutex<AnalysisStatus>>,
    events: EventBus,
}

impl AnalysisHandle {
    pub fn new(events: EventBus) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(AnalysisStatus::default())),
            events,
        }
    }

    /// Launch the pipeline on `session_dir`. Fails with `AnalysisRunning`
    /// while a previous run is still active.
    pub fn start(&self, session_dir: PathBuf, params: AnalysisParams) -> AppResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IsiError::AnalysisRunning);
        }
        self.cancel.store(false, Ordering::Release);

        let running = Arc::clone(&self.running);
        let cancel = Arc::clone(&self.cancel);
        let status = Arc::clone(&self.status);
        let events = self.events.clone();

        std::thread::Builder::new()
            .name("analysis-worker".into())
            .spawn(move || {
                let mut progress = |stage: &str, fraction: f64| {
                    *status.lock() = AnalysisStatus {
                        running: true,
                        stage: stage.to_string(),
                        fraction,
                    };
                    events.emit(Event::AnalysisProgress {
                        stage: stage.to_string(),
                        fraction,
                    });
                };

                match run_pipeline(&session_dir, &params, &mut progress, &cancel) {
                    Ok(report) => {
                        for direction in &report.missing {
                            events.emit(Event::Error {
                                code: "missing_direction".into(),
                                message: format!(
                                    "direction {direction} missing or incomplete; axis computed without it"
                                ),
                            });
                        }
                        events.emit(Event::AnalysisComplete {
                            output_path: report.output_dir,
                            num_areas: report.num_areas,
                        });
                    }
                    Err(IsiError::Cancelled) => {
                        tracing::info!("analysis cancelled");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "analysis failed");
                        events.emit(Event::AnalysisError {
                            message: err.to_string(),
                        });
                    }
                }
                *status.lock() = AnalysisStatus::default();
                running.store(false, Ordering::Release);
            })
            .map_err(IsiError::Io)?;
        Ok(())
    }

    pub fn status(&self) -> AnalysisStatus {
        self.status.lock().clone()
    }

    /// Request cooperative cancellation at the next stage boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Block until the worker finishes (tests, shutdown).
    pub fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if !self.running.load(Ordering::Acquire) {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        !self.running.load(Ordering::Acquire)
    }
}

fn check_cancel(cancel: &AtomicBool) -> AppResult<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(IsiError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run the full pipeline synchronously.
pub fn run_pipeline(
    session_dir: &Path,
    params: &AnalysisParams,
    progress: &mut dyn FnMut(&str, f64),
    cancel: &AtomicBool,
) -> AppResult<AnalysisReport> {
    progress("loading session", 0.05);
    let session = load_session(session_dir)?;
    check_cancel(cancel)?;

    progress("correlating frames", 0.15);
    let (usable, mut missing) = partition_usable(&session);
    if usable.is_empty() {
        let culprit = missing
            .first()
            .copied()
            .or_else(|| session.metadata.directions_recorded.first().copied())
            .unwrap_or(Direction::LR);
        return Err(IsiError::MissingDirection(culprit));
    }
    check_cancel(cancel)?;

    progress("fourier analysis", 0.3);
    let mut spectra: BTreeMap<Direction, DirectionSpectrum> = BTreeMap::new();
    let mut delay_phases: BTreeMap<Direction, f64> = BTreeMap::new();
    for &direction in &usable {
        let data = &session.directions[&direction];
        let cycles = count_cycles(&data.events);
        spectra.insert(direction, direction_spectrum(&data.frames, cycles));
        delay_phases.insert(
            direction,
            delay_phase_rad(
                &data.events,
                cycles,
                data.frames.dim().0,
                params.hemodynamic_delay_ms,
            ),
        );
        check_cancel(cancel)?;
    }

    progress("retinotopic maps", 0.6);
    let azimuth = axis_map(
        &session,
        &spectra,
        &delay_phases,
        Direction::LR,
        params.smoothing_sigma,
    );
    let elevation = axis_map(
        &session,
        &spectra,
        &delay_phases,
        Direction::TB,
        params.smoothing_sigma,
    );
    check_cancel(cancel)?;

    progress("visual field sign", 0.75);
    let shape = spectra
        .values()
        .next()
        .map(|s| s.magnitude.raw_dim())
        .unwrap_or_else(|| ndarray::Array2::<f32>::zeros((0, 0)).raw_dim());
    let mask = magnitude_mask(&spectra, params.magnitude_threshold);
    let (sign, thresholded) = match (&azimuth, &elevation) {
        (Some(az), Some(el)) => {
            let raw = vfs::field_sign(az, el, params.gradient_window.max(1) as usize);
            let mut smoothed = gaussian_smooth(&raw, params.phase_filter_sigma);
            ndarray::Zip::from(&mut smoothed)
                .and(&mask)
                .for_each(|s, &keep| {
                    if !keep {
                        *s = 0.0;
                    }
                });
            let thresholded = vfs::threshold_sign(&smoothed, params.vfs_threshold_sd);
            (smoothed, thresholded)
        }
        // One axis absent: sign is undefined, leave both maps empty.
        _ => (
            ndarray::Array2::<f32>::zeros(shape.clone()),
            ndarray::Array2::<i8>::zeros(shape.clone()),
        ),
    };
    check_cancel(cancel)?;

    progress("segmentation", 0.85);
    let min_area_px =
        (params.area_min_size_mm2 * params.pixels_per_mm * params.pixels_per_mm).round() as usize;
    let (areas, num_areas) = segmentation::label_areas(&thresholded, min_area_px.max(1));
    check_cancel(cancel)?;

    progress("writing results", 0.95);
    let results = AnalysisResults {
        azimuth,
        elevation,
        magnitude: spectra
            .iter()
            .map(|(d, s)| (*d, s.magnitude.clone()))
            .collect(),
        phase: spectra.iter().map(|(d, s)| (*d, s.phase.clone())).collect(),
        sign,
        areas,
        num_areas,
    };
    let output_dir = results::persist(session_dir, &results)?;

    missing.sort();
    missing.dedup();
    progress("done", 1.0);
    Ok(AnalysisReport {
        output_dir,
        num_areas,
        missing,
    })
}

/// Split loaded directions into analyzable and missing/incomplete.
///
/// A direction is analyzable when it has at least [`MIN_FRAMES`] frames and
/// at least one full sweep (expected sweep length recomputed from the
/// session's own parameter snapshot).
fn partition_usable(session: &SessionData) -> (Vec<Direction>, Vec<Direction>) {
    let expected_per_sweep = |direction: Direction| -> Option<usize> {
        let generator = crate::stimulus::generator::StimulusGenerator::new(
            session.metadata.parameters.monitor.clone(),
            session.metadata.parameters.stimulus.clone(),
        )
        .ok()?;
        Some(generator.dataset_info(direction, 1).frames_per_cycle)
    };

    let mut usable = Vec::new();
    let mut missing: Vec<Direction> = session.missing.clone();
    for (&direction, data) in &session.directions {
        let n = data.frames.dim().0;
        if n < MIN_FRAMES {
            tracing::warn!(%direction, frames = n, "too few frames, skipping");
            missing.push(direction);
            continue;
        }
        // Partial directions (cancelled mid-sweep) cannot contribute a
        // meaningful phase.
        if let Some(expected) = expected_per_sweep(direction) {
            // Derive the expected frame count at the *camera* rate from the
            // stimulus sweep duration.
            let monitor_fps = session.metadata.parameters.monitor.monitor_fps;
            let camera_fps = session.metadata.parameters.camera.camera_fps;
            let expected_camera = if monitor_fps > 0.0 && camera_fps > 0.0 {
                (expected as f64 / monitor_fps * camera_fps * 0.9) as usize
            } else {
                0
            };
            if n < expected_camera.max(MIN_FRAMES) {
                tracing::warn!(
                    %direction,
                    frames = n,
                    expected = expected_camera,
                    "incomplete sweep, skipping"
                );
                missing.push(direction);
                continue;
            }
        }
        usable.push(direction);
    }
    (usable, missing)
}

/// Number of completed sweeps in a recorded direction, from the stimulus
/// frame indices in its event stream (the index resets at each cycle start).
fn count_cycles(events: &[crate::recorder::FrameEvent]) -> usize {
    let mut cycles = 1usize;
    for pair in events.windows(2) {
        if pair[1].frame_index < pair[0].frame_index {
            cycles += 1;
        }
    }
    cycles
}

/// Hemodynamic delay expressed as phase at the stimulus frequency.
fn delay_phase_rad(
    events: &[crate::recorder::FrameEvent],
    cycles: usize,
    n_frames: usize,
    delay_ms: f64,
) -> f64 {
    if events.len() < 2 || n_frames == 0 {
        return 0.0;
    }
    let span_s = events[events.len() - 1]
        .timestamp_us
        .saturating_sub(events[0].timestamp_us) as f64
        / 1e6;
    if span_s <= 0.0 {
        return 0.0;
    }
    let camera_fps = (events.len() - 1) as f64 / span_s;
    let delay_frames = delay_ms / 1000.0 * camera_fps;
    std::f64::consts::TAU * cycles as f64 * delay_frames / n_frames as f64
}

/// Build one axis map (azimuth for `forward = LR`, elevation for `TB`) from
/// whatever directions of that axis are usable.
fn axis_map(
    session: &SessionData,
    spectra: &BTreeMap<Direction, DirectionSpectrum>,
    delay_phases: &BTreeMap<Direction, f64>,
    forward: Direction,
    smoothing_sigma: f64,
) -> Option<ndarray::Array2<f32>> {
    let reverse = forward.opposite();
    let range = sweep_range(session, forward)?;

    let map = match (spectra.get(&forward), spectra.get(&reverse)) {
        (Some(f), Some(r)) => combine_pair(&f.phase, &r.phase, range),
        (Some(f), None) => combine_single(&f.phase, false, delay_phases[&forward], range),
        (None, Some(r)) => combine_single(&r.phase, true, delay_phases[&reverse], range),
        (None, None) => return None,
    };
    Some(gaussian_smooth(&map, smoothing_sigma))
}

/// Forward-sweep angle range of an axis, reconstructed from the recorded bar
/// angles. Both directions of the axis are inspected and the widest span
/// wins, so a direction cut short mid-sweep cannot shrink the range.
fn sweep_range(session: &SessionData, forward: Direction) -> Option<SweepRange> {
    let mut best: Option<(f64, f64)> = None;
    for direction in [forward, forward.opposite()] {
        if let Some(data) = session.directions.get(&direction) {
            if data.events.is_empty() {
                continue;
            }
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for event in &data.events {
                lo = lo.min(event.bar_angle_deg);
                hi = hi.max(event.bar_angle_deg);
            }
            if best.map_or(true, |(blo, bhi)| hi - lo > bhi - blo) {
                best = Some((lo, hi));
            }
        }
    }
    let (lo, hi) = best?;
    // LR sweeps toward positive azimuth; TB sweeps downward from positive
    // elevation.
    Some(if forward == Direction::LR {
        SweepRange {
            start_deg: lo,
            end_deg: hi,
        }
    } else {
        SweepRange {
            start_deg: hi,
            end_deg: lo,
        }
    })
}

/// Pixels whose normalized response magnitude (averaged across usable
/// directions) clears the configured threshold.
fn magnitude_mask(
    spectra: &BTreeMap<Direction, DirectionSpectrum>,
    threshold: f64,
) -> ndarray::Array2<bool> {
    let mut iter = spectra.values();
    let Some(first) = iter.next() else {
        return ndarray::Array2::from_elem((0, 0), false);
    };
    let mut combined = ndarray::Array2::<f64>::zeros(first.magnitude.raw_dim());
    let mut count = 0usize;
    for spectrum in spectra.values() {
        let max = spectrum
            .magnitude
            .iter()
            .fold(0.0f64, |m, &v| m.max(v as f64))
            .max(1e-12);
        ndarray::Zip::from(&mut combined)
            .and(&spectrum.magnitude)
            .for_each(|c, &v| *c += v as f64 / max);
        count += 1;
    }
    combined.mapv(|v| v / count as f64 >= threshold)
}

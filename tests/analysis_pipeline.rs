//! Analysis pipeline integration on synthetic sessions with known ground
//! truth: phase recovery, retinotopic map construction from opposing
//! sweeps, visual field sign and segmentation, and bit-identical re-runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use isi_rig::analysis::{run_pipeline, AnalysisReport};
use isi_rig::error::IsiError;
use isi_rig::params::{AnalysisParams, ParamGroupId, Parameters, ParameterStore};
use isi_rig::recorder::{FrameEvent, RecordedFrame, RecorderHandle};
use isi_rig::stimulus::Direction;

const WIDTH: usize = 16;
const HEIGHT: usize = 16;
const FRAMES_PER_SWEEP: usize = 64;
const CYCLES: usize = 2;

/// Session parameters consistent with a ~64-frame sweep so the completeness
/// check accepts the synthetic recordings.
fn session_parameters(name: &str) -> Parameters {
    let dir = tempfile::tempdir().unwrap();
    let store = ParameterStore::open_in(dir.path()).unwrap();
    store
        .update(
            ParamGroupId::Monitor,
            serde_json::json!({
                "width_px": WIDTH as i64, "height_px": HEIGHT as i64,
                "width_cm": 10.0, "height_cm": 10.0,
                "distance_cm": 20.0, "monitor_fps": 30.0
            }),
        )
        .unwrap();
    store
        .update(
            ParamGroupId::Stimulus,
            serde_json::json!({ "drift_speed_deg_per_sec": 22.5 }),
        )
        .unwrap();
    store
        .update(
            ParamGroupId::Camera,
            serde_json::json!({ "camera_fps": 30.0, "width_px": WIDTH as i64, "height_px": HEIGHT as i64 }),
        )
        .unwrap();
    store
        .update(
            ParamGroupId::Session,
            serde_json::json!({ "session_name": name }),
        )
        .unwrap();
    store.snapshot()
}

fn analysis_params() -> AnalysisParams {
    AnalysisParams {
        smoothing_sigma: 0.0,
        phase_filter_sigma: 0.0,
        magnitude_threshold: 0.1,
        gradient_window: 2,
        area_min_size_mm2: 0.001,
        pixels_per_mm: 10.0,
        vfs_threshold_sd: 0.5,
        hemodynamic_delay_ms: 0.0,
    }
}

/// Forward-sweep fraction at which the bar crosses pixel `(y, x)`; kept in
/// the central, alias-free half of the sweep.
fn pixel_fraction(coord: usize, len: usize) -> f64 {
    0.3 + 0.4 * coord as f64 / (len - 1) as f64
}

/// Write one synthetic direction whose pixel time series are cosine
/// responses peaking when the (virtual) bar crosses the pixel.
fn write_direction(recorder: &RecorderHandle, direction: Direction) {
    recorder.start_direction(direction).unwrap();
    let n_total = FRAMES_PER_SWEEP * CYCLES;
    let (angle_start, angle_end) = match direction {
        Direction::LR => (-24.0, 24.0),
        Direction::RL => (24.0, -24.0),
        Direction::TB => (14.0, -14.0),
        Direction::BT => (-14.0, 14.0),
    };

    for j in 0..n_total {
        let sweep_pos = (j % FRAMES_PER_SWEEP) as f64 / FRAMES_PER_SWEEP as f64;
        let mut pixels = vec![0u8; WIDTH * HEIGHT];
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                // Forward fraction of this pixel on the swept axis.
                let f_forward = if direction.is_azimuth() {
                    pixel_fraction(x, WIDTH)
                } else {
                    pixel_fraction(y, HEIGHT)
                };
                let f = if direction.is_reversed() {
                    1.0 - f_forward
                } else {
                    f_forward
                };
                let response =
                    (std::f64::consts::TAU * (sweep_pos - f)).cos();
                pixels[y * WIDTH + x] = (128.0 + 100.0 * response).round() as u8;
            }
        }
        let frame_in_sweep = (j % FRAMES_PER_SWEEP) as u64;
        let t = frame_in_sweep as f64 / (FRAMES_PER_SWEEP - 1) as f64;
        recorder
            .write_frame(RecordedFrame {
                direction,
                width: WIDTH as u32,
                height: HEIGHT as u32,
                channels: 1,
                pixels: Arc::new(pixels),
                event: FrameEvent {
                    timestamp_us: (j as u64 + 1) * 33_333,
                    camera_frame_index: j as u64,
                    frame_index: frame_in_sweep,
                    bar_angle_deg: angle_start + (angle_end - angle_start) * t,
                },
            })
            .unwrap();
        if frame_in_sweep as usize == FRAMES_PER_SWEEP - 1 {
            recorder.end_cycle(direction).unwrap();
        }
    }
    recorder.end_direction(direction).unwrap();
}

fn build_session(root: &Path, name: &str, directions: &[Direction]) -> PathBuf {
    let recorder = RecorderHandle::start(root, session_parameters(name), None, 256).unwrap();
    for &direction in directions {
        write_direction(&recorder, direction);
    }
    recorder.finalize(false).unwrap()
}

fn analyze(session: &Path) -> AnalysisReport {
    let cancel = AtomicBool::new(false);
    run_pipeline(session, &analysis_params(), &mut |_s, _f| {}, &cancel).unwrap()
}

/// For frames encoding `sin(2*pi*j/N + phi)` at every pixel, the
/// persisted phase map equals `phi` at (here: all) pixels.
#[test]
fn phase_map_recovers_known_phase() {
    let tmp = tempfile::tempdir().unwrap();
    let phi = 0.8f64;

    let recorder =
        RecorderHandle::start(tmp.path(), session_parameters("phase"), None, 256).unwrap();
    recorder.start_direction(Direction::LR).unwrap();
    let n = FRAMES_PER_SWEEP;
    for j in 0..n {
        let v = (std::f64::consts::TAU * j as f64 / n as f64 + phi).sin();
        let pixels = vec![(128.0 + 100.0 * v).round() as u8; WIDTH * HEIGHT];
        recorder
            .write_frame(RecordedFrame {
                direction: Direction::LR,
                width: WIDTH as u32,
                height: HEIGHT as u32,
                channels: 1,
                pixels: Arc::new(pixels),
                event: FrameEvent {
                    timestamp_us: (j as u64 + 1) * 33_333,
                    camera_frame_index: j as u64,
                    frame_index: j as u64,
                    bar_angle_deg: -24.0 + 48.0 * j as f64 / (n - 1) as f64,
                },
            })
            .unwrap();
    }
    recorder.end_direction(Direction::LR).unwrap();
    let session = recorder.finalize(false).unwrap();

    let report = analyze(&session);
    let file = hdf5::File::open(report.output_dir.join("analysis_results.h5")).unwrap();
    let phase = file.dataset("phase_LR").unwrap().read_2d::<f32>().unwrap();

    let mut within = 0usize;
    for &p in phase.iter() {
        let mut err = (p as f64 - phi).rem_euclid(std::f64::consts::TAU);
        if err > std::f64::consts::PI {
            err = std::f64::consts::TAU - err;
        }
        if err < 0.05 {
            within += 1;
        }
    }
    let fraction = within as f64 / phase.len() as f64;
    assert!(fraction >= 0.95, "only {fraction:.2} of pixels within 0.05 rad");
}

/// Full four-direction pipeline: the azimuth map rises with x, the elevation
/// map falls with y (top-down sweep convention), the sign map is uniform and
/// segmentation finds a single area.
#[test]
fn full_pipeline_recovers_retinotopy() {
    let tmp = tempfile::tempdir().unwrap();
    let session = build_session(tmp.path(), "full", &Direction::ALL);
    let report = analyze(&session);
    assert!(report.missing.is_empty(), "missing: {:?}", report.missing);
    assert!(report.num_areas >= 1);

    let file = hdf5::File::open(report.output_dir.join("analysis_results.h5")).unwrap();
    let azimuth = file.dataset("azimuth_map").unwrap().read_2d::<f32>().unwrap();
    let elevation = file
        .dataset("elevation_map")
        .unwrap()
        .read_2d::<f32>()
        .unwrap();

    // Azimuth increases left to right on every row.
    for y in 0..HEIGHT {
        assert!(
            azimuth[(y, WIDTH - 1)] > azimuth[(y, 0)] + 5.0,
            "row {y}: {} vs {}",
            azimuth[(y, 0)],
            azimuth[(y, WIDTH - 1)]
        );
    }
    // Elevation decreases top to bottom on every column.
    for x in 0..WIDTH {
        assert!(
            elevation[(0, x)] > elevation[(HEIGHT - 1, x)] + 3.0,
            "column {x}"
        );
    }

    // The azimuth map is quantitatively right in the screen interior.
    let expected = |x: usize| -24.0 + pixel_fraction(x, WIDTH) * 48.0;
    for x in [2, 8, 13] {
        let got = azimuth[(HEIGHT / 2, x)] as f64;
        assert!(
            (got - expected(x)).abs() < 3.0,
            "x {x}: got {got}, expected {}",
            expected(x)
        );
    }

    // Uniform mapping orientation: one connected area, consistent sign.
    let area = file.dataset("area_map").unwrap().read_2d::<i32>().unwrap();
    let labeled = area.iter().filter(|&&v| v > 0).count();
    assert!(labeled > (WIDTH * HEIGHT) / 2, "most pixels belong to the area");

    // PNG previews exist.
    assert!(report.output_dir.join("azimuth_map.png").exists());
    assert!(report.output_dir.join("elevation_map.png").exists());
    assert!(report.output_dir.join("sign_map.png").exists());
    assert!(report.output_dir.join("area_map.png").exists());
}

/// Two runs over the same session produce bit-identical sign and area maps.
#[test]
fn analysis_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let session = build_session(tmp.path(), "idem", &Direction::ALL);

    let first = analyze(&session);
    let sign_a: Vec<f32> = hdf5::File::open(first.output_dir.join("analysis_results.h5"))
        .unwrap()
        .dataset("sign_map")
        .unwrap()
        .read_raw()
        .unwrap();
    let area_a: Vec<i32> = hdf5::File::open(first.output_dir.join("analysis_results.h5"))
        .unwrap()
        .dataset("area_map")
        .unwrap()
        .read_raw()
        .unwrap();

    let second = analyze(&session);
    let sign_b: Vec<f32> = hdf5::File::open(second.output_dir.join("analysis_results.h5"))
        .unwrap()
        .dataset("sign_map")
        .unwrap()
        .read_raw()
        .unwrap();
    let area_b: Vec<i32> = hdf5::File::open(second.output_dir.join("analysis_results.h5"))
        .unwrap()
        .dataset("area_map")
        .unwrap()
        .read_raw()
        .unwrap();

    assert!(sign_a
        .iter()
        .zip(&sign_b)
        .all(|(a, b)| a.to_bits() == b.to_bits()));
    assert_eq!(area_a, area_b);
}

/// A single-axis session still yields its axis map; the other axis is
/// absent and VFS/segmentation degrade to empty rather than failing.
#[test]
fn single_axis_session_analyzes_without_vfs() {
    let tmp = tempfile::tempdir().unwrap();
    let session = build_session(tmp.path(), "lronly", &[Direction::LR, Direction::RL]);
    let report = analyze(&session);
    assert_eq!(report.num_areas, 0);

    let file = hdf5::File::open(report.output_dir.join("analysis_results.h5")).unwrap();
    assert!(file.dataset("azimuth_map").is_ok());
    assert!(file.dataset("elevation_map").is_err());
}

/// A session whose event stream is not frame-aligned (decoupled camera and
/// stimulus clocks) correlates by nearest timestamp: orphaned frames are
/// flagged, the pairing for everything else survives, and the full pipeline
/// still runs to completion.
#[test]
fn decoupled_clock_session_correlates_by_timestamp() {
    let tmp = tempfile::tempdir().unwrap();
    let session = build_session(tmp.path(), "decoupled", &[Direction::LR, Direction::RL]);

    // Rework LR into a decoupled-clock recording: give the camera archive
    // its own (slightly offset) clock, and thin the event stream so the
    // counts no longer match.
    let events_path = session.join("LR_events.json");
    let original: Vec<FrameEvent> = std::fs::read_to_string(&events_path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let dropped: Vec<usize> = vec![10, 40, 70];
    {
        let file = hdf5::File::open_rw(session.join("LR_camera.h5")).unwrap();
        let timestamps: Vec<u64> = original.iter().map(|e| e.timestamp_us + 2_000).collect();
        file.new_dataset_builder()
            .with_data(&ndarray::aview1(&timestamps))
            .create("timestamps")
            .unwrap();
    }
    let mut thinned = String::new();
    for (j, event) in original.iter().enumerate() {
        if dropped.contains(&j) {
            continue;
        }
        thinned.push_str(&serde_json::to_string(event).unwrap());
        thinned.push('\n');
    }
    std::fs::write(&events_path, thinned).unwrap();

    // The loader falls back to timestamp pairing and flags the orphans.
    let loaded = isi_rig::analysis::load::load_session(&session).unwrap();
    let lr = &loaded.directions[&Direction::LR];
    assert_eq!(lr.events.len(), original.len(), "one pairing per frame");
    assert_eq!(lr.unmatched, dropped, "orphaned frames are flagged");
    // Matched frames keep their original pairing despite the clock offset.
    assert_eq!(lr.events[0].bar_angle_deg, original[0].bar_angle_deg);
    assert_eq!(lr.events[50].bar_angle_deg, original[50].bar_angle_deg);
    // RL stayed camera-triggered.
    assert!(loaded.directions[&Direction::RL].unmatched.is_empty());

    // The pipeline completes on the repaired pairing.
    let report = analyze(&session);
    assert!(report.missing.is_empty());
    let file = hdf5::File::open(report.output_dir.join("analysis_results.h5")).unwrap();
    assert!(file.dataset("azimuth_map").is_ok());
}

/// A session with no usable direction aborts with a structured error.
#[test]
fn empty_session_aborts_with_missing_direction() {
    let tmp = tempfile::tempdir().unwrap();
    let recorder =
        RecorderHandle::start(tmp.path(), session_parameters("empty"), None, 64).unwrap();
    let session = recorder.finalize(false).unwrap();

    let cancel = AtomicBool::new(false);
    let err = run_pipeline(&session, &analysis_params(), &mut |_s, _f| {}, &cancel).unwrap_err();
    assert!(matches!(err, IsiError::MissingDirection(_)));
}

/// Cooperative cancellation between stages.
#[test]
fn cancellation_stops_between_stages() {
    let tmp = tempfile::tempdir().unwrap();
    let session = build_session(tmp.path(), "cancel", &[Direction::LR, Direction::RL]);
    let cancel = AtomicBool::new(true);
    let err = run_pipeline(&session, &analysis_params(), &mut |_s, _f| {}, &cancel).unwrap_err();
    assert!(matches!(err, IsiError::Cancelled));
}

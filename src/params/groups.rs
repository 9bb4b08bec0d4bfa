//! Typed parameter groups and their validation bounds.
//!
//! The source of truth for every tunable the rig exposes. Each group is a
//! plain struct whose serde field names are the wire names used by
//! `update_parameters` patches and by the persisted parameter file. The
//! `monitor` and `camera` groups are *volatile*: their live values come from
//! hardware detection at startup and are never persisted (the on-disk file
//! always carries sentinel values for them).

use serde::{Deserialize, Serialize};

use crate::stimulus::Direction;

/// Identifies one parameter group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroupId {
    Monitor,
    Stimulus,
    Camera,
    Acquisition,
    Analysis,
    Session,
}

impl ParamGroupId {
    pub const ALL: [ParamGroupId; 6] = [
        ParamGroupId::Monitor,
        ParamGroupId::Stimulus,
        ParamGroupId::Camera,
        ParamGroupId::Acquisition,
        ParamGroupId::Analysis,
        ParamGroupId::Session,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamGroupId::Monitor => "monitor",
            ParamGroupId::Stimulus => "stimulus",
            ParamGroupId::Camera => "camera",
            ParamGroupId::Acquisition => "acquisition",
            ParamGroupId::Analysis => "analysis",
            ParamGroupId::Session => "session",
        }
    }

    /// Volatile groups are re-detected at startup and never persisted.
    pub fn is_volatile(self) -> bool {
        matches!(self, ParamGroupId::Monitor | ParamGroupId::Camera)
    }

    /// Groups whose values feed the stimulus generation fingerprint.
    pub fn affects_stimulus(self) -> bool {
        matches!(self, ParamGroupId::Monitor | ParamGroupId::Stimulus)
    }
}

impl std::str::FromStr for ParamGroupId {
    type Err = crate::error::IsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParamGroupId::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| crate::error::IsiError::Validation {
                field: "group".into(),
                reason: format!("unknown parameter group '{s}'"),
            })
    }
}

impl std::fmt::Display for ParamGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display geometry and timing. Volatile: detected at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorParams {
    pub width_px: i64,
    pub height_px: i64,
    pub width_cm: f64,
    pub height_cm: f64,
    /// Eye-to-screen-center viewing distance.
    pub distance_cm: f64,
    /// Rotation of the monitor around the vertical axis, degrees.
    pub lateral_angle_deg: f64,
    /// Rotation of the monitor around the horizontal axis, degrees.
    pub tilt_angle_deg: f64,
    /// Refresh rate; stimulus frames are generated at this rate.
    pub monitor_fps: f64,
}

impl Default for MonitorParams {
    fn default() -> Self {
        Self {
            width_px: 1920,
            height_px: 1080,
            width_cm: 52.0,
            height_cm: 29.3,
            distance_cm: 10.0,
            lateral_angle_deg: 0.0,
            tilt_angle_deg: 0.0,
            monitor_fps: 60.0,
        }
    }
}

impl MonitorParams {
    /// On-disk placeholder for the volatile group.
    pub fn sentinel() -> Self {
        Self {
            width_px: -1,
            height_px: -1,
            width_cm: -1.0,
            height_cm: -1.0,
            distance_cm: -1.0,
            lateral_angle_deg: -1.0,
            tilt_angle_deg: -1.0,
            monitor_fps: -1.0,
        }
    }
}

/// Bar and checkerboard appearance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StimulusParams {
    pub bar_width_deg: f64,
    pub checker_size_deg: f64,
    pub drift_speed_deg_per_sec: f64,
    /// Counter-phase flip rate of the checkerboard.
    pub strobe_rate_hz: f64,
    /// Michelson contrast of the checker around the background, 0..=1.
    pub contrast: f64,
    /// Background luminance, 0..=1.
    pub background_luminance: f64,
}

impl Default for StimulusParams {
    fn default() -> Self {
        Self {
            bar_width_deg: 20.0,
            checker_size_deg: 25.0,
            drift_speed_deg_per_sec: 9.0,
            strobe_rate_hz: 6.0,
            contrast: 1.0,
            background_luminance: 0.5,
        }
    }
}

/// Capture device selection. Volatile: detected at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraParams {
    pub device_id: String,
    pub camera_fps: f64,
    pub width_px: i64,
    pub height_px: i64,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            camera_fps: 30.0,
            width_px: 640,
            height_px: 480,
        }
    }
}

impl CameraParams {
    /// On-disk placeholder for the volatile group.
    pub fn sentinel() -> Self {
        Self {
            device_id: String::new(),
            camera_fps: -1.0,
            width_px: -1,
            height_px: -1,
        }
    }
}

/// Run structure: phases, repetitions, directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionParams {
    pub baseline_sec: f64,
    pub between_sec: f64,
    pub cycles: u32,
    pub directions: Vec<Direction>,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            baseline_sec: 5.0,
            between_sec: 5.0,
            cycles: 10,
            directions: Direction::ALL.to_vec(),
        }
    }
}

/// Post-acquisition analysis tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisParams {
    /// Gaussian sigma (pixels) applied to the retinotopic maps.
    pub smoothing_sigma: f64,
    /// Response-magnitude floor below which pixels are masked.
    pub magnitude_threshold: f64,
    /// Gaussian sigma (pixels) applied to the visual field sign map.
    pub phase_filter_sigma: f64,
    /// Half-window (pixels) of the central-difference gradient.
    pub gradient_window: i64,
    /// Minimum visual-area patch size in cortical mm^2.
    pub area_min_size_mm2: f64,
    /// Sign threshold in standard deviations of the smoothed VFS map.
    pub vfs_threshold_sd: f64,
    /// Hemodynamic delay compensation, milliseconds. Applied as a whole-frame
    /// shift of the frame-to-angle correspondence; an approximation of HRF
    /// deconvolution, not a model fit.
    pub hemodynamic_delay_ms: f64,
    /// Camera spatial calibration used to convert mm^2 to pixels.
    pub pixels_per_mm: f64,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            smoothing_sigma: 2.0,
            magnitude_threshold: 0.1,
            phase_filter_sigma: 2.0,
            gradient_window: 3,
            area_min_size_mm2: 0.1,
            vfs_threshold_sd: 1.5,
            hemodynamic_delay_ms: 300.0,
            pixels_per_mm: 50.0,
        }
    }
}

/// Operator-facing labels for the next recorded session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SessionParams {
    pub session_name: String,
    pub subject_id: String,
    pub notes: String,
}

/// Snapshot of every group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct Parameters {
    pub monitor: MonitorParams,
    pub stimulus: StimulusParams,
    pub camera: CameraParams,
    pub acquisition: AcquisitionParams,
    pub analysis: AnalysisParams,
    pub session: SessionParams,
}

impl Parameters {
    /// The group as a JSON object.
    pub fn group_json(&self, id: ParamGroupId) -> serde_json::Value {
        match id {
            ParamGroupId::Monitor => serde_json::to_value(&self.monitor),
            ParamGroupId::Stimulus => serde_json::to_value(&self.stimulus),
            ParamGroupId::Camera => serde_json::to_value(&self.camera),
            ParamGroupId::Acquisition => serde_json::to_value(&self.acquisition),
            ParamGroupId::Analysis => serde_json::to_value(&self.analysis),
            ParamGroupId::Session => serde_json::to_value(&self.session),
        }
        .unwrap_or(serde_json::Value::Null)
    }

    /// The volatile-group sentinel used in place of `self` when persisting.
    pub fn sentinel_group_json(id: ParamGroupId) -> Option<serde_json::Value> {
        match id {
            ParamGroupId::Monitor => serde_json::to_value(MonitorParams::sentinel()).ok(),
            ParamGroupId::Camera => serde_json::to_value(CameraParams::sentinel()).ok(),
            _ => None,
        }
    }
}

/// Hard and recommended limits for one numeric field, for validation and for
/// UI reflection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FieldBounds {
    pub min: f64,
    pub max: f64,
    pub recommended_min: Option<f64>,
    pub recommended_max: Option<f64>,
}

const fn bounds(min: f64, max: f64) -> FieldBounds {
    FieldBounds {
        min,
        max,
        recommended_min: None,
        recommended_max: None,
    }
}

const fn bounds_rec(min: f64, max: f64, rmin: f64, rmax: f64) -> FieldBounds {
    FieldBounds {
        min,
        max,
        recommended_min: Some(rmin),
        recommended_max: Some(rmax),
    }
}

/// Validation bounds for every numeric field, keyed by group + field name.
///
/// The sentinel value -1 is deliberately outside every range here; volatile
/// sentinels never pass validation and only appear in the persisted file.
pub static VALIDATION_BOUNDS: &[(ParamGroupId, &str, FieldBounds)] = &[
    (ParamGroupId::Monitor, "width_px", bounds(1.0, 16384.0)),
    (ParamGroupId::Monitor, "height_px", bounds(1.0, 16384.0)),
    (ParamGroupId::Monitor, "width_cm", bounds(1.0, 500.0)),
    (ParamGroupId::Monitor, "height_cm", bounds(1.0, 500.0)),
    (
        ParamGroupId::Monitor,
        "distance_cm",
        bounds_rec(1.0, 200.0, 5.0, 30.0),
    ),
    (
        ParamGroupId::Monitor,
        "lateral_angle_deg",
        bounds(-90.0, 90.0),
    ),
    (ParamGroupId::Monitor, "tilt_angle_deg", bounds(-90.0, 90.0)),
    (
        ParamGroupId::Monitor,
        "monitor_fps",
        bounds_rec(1.0, 480.0, 30.0, 144.0),
    ),
    (
        ParamGroupId::Stimulus,
        "bar_width_deg",
        bounds_rec(1.0, 90.0, 10.0, 30.0),
    ),
    (
        ParamGroupId::Stimulus,
        "checker_size_deg",
        bounds_rec(1.0, 90.0, 10.0, 30.0),
    ),
    (
        ParamGroupId::Stimulus,
        "drift_speed_deg_per_sec",
        bounds_rec(0.1, 180.0, 5.0, 15.0),
    ),
    (
        ParamGroupId::Stimulus,
        "strobe_rate_hz",
        bounds_rec(0.1, 60.0, 2.0, 10.0),
    ),
    (ParamGroupId::Stimulus, "contrast", bounds(0.0, 1.0)),
    (
        ParamGroupId::Stimulus,
        "background_luminance",
        bounds(0.0, 1.0),
    ),
    (ParamGroupId::Camera, "camera_fps", bounds(1.0, 1000.0)),
    (ParamGroupId::Camera, "width_px", bounds(1.0, 8192.0)),
    (ParamGroupId::Camera, "height_px", bounds(1.0, 8192.0)),
    (
        ParamGroupId::Acquisition,
        "baseline_sec",
        bounds(0.0, 600.0),
    ),
    (ParamGroupId::Acquisition, "between_sec", bounds(0.0, 600.0)),
    (
        ParamGroupId::Acquisition,
        "cycles",
        bounds_rec(1.0, 100.0, 5.0, 20.0),
    ),
    (ParamGroupId::Analysis, "smoothing_sigma", bounds(0.0, 50.0)),
    (
        ParamGroupId::Analysis,
        "magnitude_threshold",
        bounds(0.0, 1e6),
    ),
    (
        ParamGroupId::Analysis,
        "phase_filter_sigma",
        bounds(0.0, 50.0),
    ),
    (ParamGroupId::Analysis, "gradient_window", bounds(1.0, 64.0)),
    (
        ParamGroupId::Analysis,
        "area_min_size_mm2",
        bounds(0.0, 1000.0),
    ),
    (
        ParamGroupId::Analysis,
        "vfs_threshold_sd",
        bounds(0.0, 10.0),
    ),
    (
        ParamGroupId::Analysis,
        "hemodynamic_delay_ms",
        bounds_rec(0.0, 5000.0, 100.0, 1000.0),
    ),
    (ParamGroupId::Analysis, "pixels_per_mm", bounds(0.1, 10000.0)),
];

/// Bounds for one field, if it has any.
pub fn field_bounds(group: ParamGroupId, field: &str) -> Option<&'static FieldBounds> {
    VALIDATION_BOUNDS
        .iter()
        .find(|(g, f, _)| *g == group && *f == field)
        .map(|(_, _, b)| b)
}

/// The bounds table for one group, for UI reflection.
pub fn group_bounds(group: ParamGroupId) -> Vec<(&'static str, FieldBounds)> {
    VALIDATION_BOUNDS
        .iter()
        .filter(|(g, _, _)| *g == group)
        .map(|(_, f, b)| (*f, *b))
        .collect()
}

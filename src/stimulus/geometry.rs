//! Spherical back-projection of the display surface.
//!
//! The monitor is a flat plane in front of the animal's eye. For retinotopic
//! mapping the stimulus must be defined in the *spherical* coordinates of the
//! visual field, so every display pixel is back-projected once into
//! `(azimuth, altitude)` given the monitor geometry: physical size, viewing
//! distance, and the lateral/tilt mounting angles. Renderers then evaluate
//! the bar mask and checkerboard directly in those tables.
//!
//! Coordinate convention: the eye sits at the origin looking along +Y toward
//! the screen center; +X is to the animal's right, +Z is up. Azimuth is
//! positive rightward, altitude positive upward, both in degrees.

use ndarray::Array2;

use crate::error::{AppResult, IsiError};
use crate::params::MonitorParams;
use crate::stimulus::Direction;

/// Precomputed per-pixel spherical coordinates of the display.
pub struct SphericalScreen {
    pub width_px: usize,
    pub height_px: usize,
    /// Per-pixel azimuth in degrees, `height x width`.
    pub azimuth_deg: Array2<f64>,
    /// Per-pixel altitude in degrees, `height x width`.
    pub altitude_deg: Array2<f64>,
    azimuth_extent: (f64, f64),
    altitude_extent: (f64, f64),
}

impl SphericalScreen {
    /// Build the projection tables for the given monitor geometry.
    pub fn new(monitor: &MonitorParams) -> AppResult<Self> {
        if monitor.width_px <= 0 || monitor.height_px <= 0 {
            return Err(IsiError::Validation {
                field: "monitor".into(),
                reason: "monitor resolution not configured".into(),
            });
        }
        if monitor.width_cm <= 0.0 || monitor.height_cm <= 0.0 || monitor.distance_cm <= 0.0 {
            return Err(IsiError::Validation {
                field: "monitor".into(),
                reason: "monitor physical geometry not configured".into(),
            });
        }

        let width_px = monitor.width_px as usize;
        let height_px = monitor.height_px as usize;
        let px_w = monitor.width_cm / width_px as f64;
        let px_h = monitor.height_cm / height_px as f64;

        let lat = monitor.lateral_angle_deg.to_radians();
        let tilt = monitor.tilt_angle_deg.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_tilt, cos_tilt) = tilt.sin_cos();

        let mut azimuth_deg = Array2::<f64>::zeros((height_px, width_px));
        let mut altitude_deg = Array2::<f64>::zeros((height_px, width_px));

        for y in 0..height_px {
            // Row 0 is the top of the screen; +Z is up.
            let z0 = (height_px as f64 / 2.0 - y as f64 - 0.5) * px_h;
            for x in 0..width_px {
                let x0 = (x as f64 + 0.5 - width_px as f64 / 2.0) * px_w;
                let y0 = monitor.distance_cm;

                // Lateral mounting rotation about the vertical (Z) axis.
                let x1 = x0 * cos_lat - y0 * sin_lat;
                let y1 = x0 * sin_lat + y0 * cos_lat;
                let z1 = z0;

                // Tilt about the horizontal (X) axis.
                let y2 = y1 * cos_tilt - z1 * sin_tilt;
                let z2 = y1 * sin_tilt + z1 * cos_tilt;
                let x2 = x1;

                azimuth_deg[(y, x)] = x2.atan2(y2).to_degrees();
                altitude_deg[(y, x)] = z2.atan2(x2.hypot(y2)).to_degrees();
            }
        }

        let extent = |table: &Array2<f64>| {
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for &v in table.iter() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
            (lo, hi)
        };

        let azimuth_extent = extent(&azimuth_deg);
        let altitude_extent = extent(&altitude_deg);

        Ok(Self {
            width_px,
            height_px,
            azimuth_deg,
            altitude_deg,
            azimuth_extent,
            altitude_extent,
        })
    }

    /// `(min, max)` azimuth covered by the screen, degrees.
    pub fn azimuth_extent(&self) -> (f64, f64) {
        self.azimuth_extent
    }

    /// `(min, max)` altitude covered by the screen, degrees.
    pub fn altitude_extent(&self) -> (f64, f64) {
        self.altitude_extent
    }

    /// Start and end bar-center angles for one sweep of `direction`. The bar
    /// starts and ends fully off-screen (center a half bar-width beyond the
    /// screen edge).
    ///
    /// `LR` runs left→right (increasing azimuth), `TB` top→bottom
    /// (decreasing altitude); the reversed directions swap start and end.
    pub fn sweep_range(&self, direction: Direction, bar_width_deg: f64) -> (f64, f64) {
        let half = bar_width_deg / 2.0;
        let (forward_start, forward_end) = if direction.is_azimuth() {
            let (lo, hi) = self.azimuth_extent;
            (lo - half, hi + half)
        } else {
            let (lo, hi) = self.altitude_extent;
            (hi + half, lo - half)
        };
        if direction.is_reversed() {
            (forward_end, forward_start)
        } else {
            (forward_start, forward_end)
        }
    }
}

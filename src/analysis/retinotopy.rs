//! Retinotopic map construction from per-direction phase maps.
//!
//! When both sweep directions of an axis are available, opposing phases are
//! combined with the classic periodic-stimulus trick
//! `wrap(phase_forward - phase_reverse) / 2`, which cancels the common
//! hemodynamic delay. When only one direction survived (partial session),
//! the single phase is used after subtracting the configured hemodynamic
//! delay; an approximation, flagged by the caller.
//!
//! The resulting position phase is scaled from radians to degrees using the
//! sweep's `{start_angle, end_angle}` range, then Gaussian-smoothed.

use ndarray::Array2;

use crate::analysis::fourier::wrap_angle;

/// Forward-sweep angle range of one axis, degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepRange {
    pub start_deg: f64,
    pub end_deg: f64,
}

impl SweepRange {
    pub fn mid(&self) -> f64 {
        (self.start_deg + self.end_deg) / 2.0
    }

    pub fn span(&self) -> f64 {
        self.end_deg - self.start_deg
    }
}

/// Combine opposing-direction phase maps into an angle map (degrees).
///
/// The wrapped half-difference lies in `(-pi/2, pi/2]` and spans the central
/// half of the sweep; since sweeps start and end a half bar-width off
/// screen, on-screen positions live in exactly that central region.
pub fn combine_pair(
    phase_forward: &Array2<f32>,
    phase_reverse: &Array2<f32>,
    range: SweepRange,
) -> Array2<f32> {
    let mid = range.mid();
    let span = range.span();
    let mut out = Array2::<f32>::zeros(phase_forward.raw_dim());
    ndarray::Zip::from(&mut out)
        .and(phase_forward)
        .and(phase_reverse)
        .for_each(|o, &pf, &pr| {
            let pos = wrap_angle(pf as f64 - pr as f64) / 2.0;
            // pos in (-pi/2, pi/2] maps onto the central half of the sweep;
            // increasing response phase means a later bar crossing.
            *o = (mid - pos / std::f64::consts::PI * span / 2.0) as f32;
        });
    out
}

/// Angle map from a single direction, compensating the hemodynamic delay by
/// `delay_phase_rad` (the phase the response lags the stimulus at the cycle
/// frequency).
pub fn combine_single(
    phase: &Array2<f32>,
    reversed: bool,
    delay_phase_rad: f64,
    range: SweepRange,
) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(phase.raw_dim());
    ndarray::Zip::from(&mut out).and(phase).for_each(|o, &p| {
        // Position of the bar crossing as a fraction of the forward sweep.
        // Sine-referenced phase: a response peaking at sweep fraction f has
        // phase pi/2 - 2*pi*f - delay.
        let raw = (std::f64::consts::FRAC_PI_2 - delay_phase_rad - p as f64)
            / std::f64::consts::TAU;
        let mut fraction = raw.rem_euclid(1.0);
        if reversed {
            fraction = 1.0 - fraction;
        }
        *o = (range.start_deg + fraction * range.span()) as f32;
    });
    out
}

/// Separable Gaussian smoothing with reflecting boundaries. A sigma of zero
/// returns the input unchanged.
pub fn gaussian_smooth(map: &Array2<f32>, sigma: f64) -> Array2<f32> {
    if sigma <= 0.0 {
        return map.clone();
    }
    let radius = (3.0 * sigma).ceil() as isize;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let mut sum = 0.0f64;
    for i in -radius..=radius {
        let w = (-(i as f64).powi(2) / (2.0 * sigma * sigma)).exp();
        kernel.push(w);
        sum += w;
    }
    for w in &mut kernel {
        *w /= sum;
    }

    let (height, width) = map.dim();
    let reflect = |i: isize, len: usize| -> usize {
        let len = len as isize;
        let mut i = i;
        if i < 0 {
            i = -i - 1;
        }
        if i >= len {
            i = 2 * len - 1 - i;
        }
        i.clamp(0, len - 1) as usize
    };

    // Horizontal pass.
    let mut tmp = Array2::<f32>::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f64;
            for (ki, w) in kernel.iter().enumerate() {
                let xi = reflect(x as isize + ki as isize - radius, width);
                acc += w * map[(y, xi)] as f64;
            }
            tmp[(y, x)] = acc as f32;
        }
    }
    // Vertical pass.
    let mut out = Array2::<f32>::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f64;
            for (ki, w) in kernel.iter().enumerate() {
                let yi = reflect(y as isize + ki as isize - radius, height);
                acc += w * tmp[(yi, x)] as f64;
            }
            out[(y, x)] = acc as f32;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: SweepRange = SweepRange {
        start_deg: -60.0,
        end_deg: 60.0,
    };

    /// Sine-referenced phase of a response at forward-sweep fraction `f`
    /// with delay `d` radians.
    fn phase_at(f: f64, d: f64) -> f32 {
        wrap_angle(std::f64::consts::FRAC_PI_2 - std::f64::consts::TAU * f - d) as f32
    }

    #[test]
    fn test_pair_cancels_delay() {
        // Pixels across the central half of the sweep, with a sizable
        // common delay that the pair combination must cancel.
        let delay = 0.6;
        for &f in &[0.3, 0.45, 0.5, 0.62, 0.7] {
            let pf = Array2::from_elem((1, 1), phase_at(f, delay));
            let pr = Array2::from_elem((1, 1), phase_at(1.0 - f, delay));
            let map = combine_pair(&pf, &pr, RANGE);
            let expected = RANGE.start_deg + f * RANGE.span();
            assert!(
                (map[(0, 0)] as f64 - expected).abs() < 1e-3,
                "f {f}: got {} expected {expected}",
                map[(0, 0)]
            );
        }
    }

    #[test]
    fn test_single_direction_uses_delay_estimate() {
        let delay = 0.4;
        for &f in &[0.2, 0.5, 0.8] {
            let pf = Array2::from_elem((1, 1), phase_at(f, delay));
            let map = combine_single(&pf, false, delay, RANGE);
            let expected = RANGE.start_deg + f * RANGE.span();
            assert!(
                (map[(0, 0)] as f64 - expected).abs() < 1e-3,
                "f {f}: got {}",
                map[(0, 0)]
            );
            // The reversed direction sees the bar at fraction 1-f.
            let map = combine_single(&pf, true, delay, RANGE);
            let expected = RANGE.start_deg + (1.0 - f) * RANGE.span();
            assert!((map[(0, 0)] as f64 - expected).abs() < 1e-3);
        }
    }

    #[test]
    fn test_smoothing_preserves_constants() {
        let map = Array2::from_elem((8, 9), 5.0f32);
        let smoothed = gaussian_smooth(&map, 1.5);
        for &v in smoothed.iter() {
            assert!((v - 5.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_smoothing_reduces_peak() {
        let mut map = Array2::<f32>::zeros((9, 9));
        map[(4, 4)] = 1.0;
        let smoothed = gaussian_smooth(&map, 1.0);
        assert!(smoothed[(4, 4)] < 0.3);
        // Mass is conserved with reflecting boundaries.
        let total: f32 = smoothed.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let mut map = Array2::<f32>::zeros((3, 3));
        map[(1, 1)] = 2.0;
        assert_eq!(gaussian_smooth(&map, 0.0), map);
    }
}

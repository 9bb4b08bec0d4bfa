//! Visual field sign computation.
//!
//! At every cortical pixel the local mapping from cortex to visual field is
//! characterized by the gradients of the azimuth and elevation maps. The
//! sine of the angle between the two gradients tells whether the mapping
//! preserves orientation (mirror vs non-mirror representation); its sign
//! flips at visual area boundaries.

use ndarray::Array2;

/// Central-difference gradient with half-window `w` pixels, clamped at the
/// image border. Returns `(d/dx, d/dy)`.
pub fn gradient(map: &Array2<f32>, w: usize) -> (Array2<f32>, Array2<f32>) {
    let (height, width) = map.dim();
    let w = w.max(1);
    let mut gx = Array2::<f32>::zeros((height, width));
    let mut gy = Array2::<f32>::zeros((height, width));

    for y in 0..height {
        for x in 0..width {
            let x_lo = x.saturating_sub(w);
            let x_hi = (x + w).min(width - 1);
            if x_hi > x_lo {
                gx[(y, x)] = (map[(y, x_hi)] - map[(y, x_lo)]) / (x_hi - x_lo) as f32;
            }
            let y_lo = y.saturating_sub(w);
            let y_hi = (y + w).min(height - 1);
            if y_hi > y_lo {
                gy[(y, x)] = (map[(y_hi, x)] - map[(y_lo, x)]) / (y_hi - y_lo) as f32;
            }
        }
    }
    (gx, gy)
}

/// Graded visual field sign: `sin(angle_between(grad az, grad el))` per
/// pixel, zero where either gradient vanishes.
pub fn field_sign(azimuth: &Array2<f32>, elevation: &Array2<f32>, w: usize) -> Array2<f32> {
    let (az_dx, az_dy) = gradient(azimuth, w);
    let (el_dx, el_dy) = gradient(elevation, w);

    let mut sign = Array2::<f32>::zeros(azimuth.raw_dim());
    ndarray::Zip::from(&mut sign)
        .and(&az_dx)
        .and(&az_dy)
        .and(&el_dx)
        .and(&el_dy)
        .for_each(|s, &ax, &ay, &ex, &ey| {
            let cross = (ax as f64) * (ey as f64) - (ay as f64) * (ex as f64);
            let norm = (ax as f64).hypot(ay as f64) * (ex as f64).hypot(ey as f64);
            *s = if norm > 1e-12 {
                (cross / norm) as f32
            } else {
                0.0
            };
        });
    sign
}

/// Threshold a smoothed sign map at `threshold_sd` standard deviations:
/// `+1`, `-1`, or `0` for below-threshold pixels.
pub fn threshold_sign(sign: &Array2<f32>, threshold_sd: f64) -> Array2<i8> {
    let n = sign.len().max(1) as f64;
    let mean = sign.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = sign
        .iter()
        .map(|&v| (v as f64 - mean) * (v as f64 - mean))
        .sum::<f64>()
        / n;
    let cutoff = threshold_sd * variance.sqrt();

    sign.mapv(|v| {
        if (v as f64) > cutoff {
            1i8
        } else if (v as f64) < -cutoff {
            -1i8
        } else {
            0i8
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A mirror pair: azimuth increasing with x, elevation increasing with y
    /// gives +1 sign; flipping the elevation gradient flips the sign.
    fn linear_maps(flip: bool) -> (Array2<f32>, Array2<f32>) {
        let mut az = Array2::<f32>::zeros((16, 16));
        let mut el = Array2::<f32>::zeros((16, 16));
        for y in 0..16 {
            for x in 0..16 {
                az[(y, x)] = x as f32;
                el[(y, x)] = if flip { -(y as f32) } else { y as f32 };
            }
        }
        (az, el)
    }

    #[test]
    fn test_gradient_of_ramp() {
        let (az, _) = linear_maps(false);
        let (gx, gy) = gradient(&az, 2);
        assert!((gx[(8, 8)] - 1.0).abs() < 1e-5);
        assert!(gy[(8, 8)].abs() < 1e-5);
    }

    #[test]
    fn test_field_sign_orientation() {
        let (az, el) = linear_maps(false);
        let sign = field_sign(&az, &el, 2);
        assert!((sign[(8, 8)] - 1.0).abs() < 1e-4);

        let (az, el) = linear_maps(true);
        let sign = field_sign(&az, &el, 2);
        assert!((sign[(8, 8)] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_threshold_splits_signs() {
        let mut sign = Array2::<f32>::zeros((4, 4));
        sign[(0, 0)] = 1.0;
        sign[(3, 3)] = -1.0;
        let thresholded = threshold_sign(&sign, 1.0);
        assert_eq!(thresholded[(0, 0)], 1);
        assert_eq!(thresholded[(3, 3)], -1);
        assert_eq!(thresholded[(1, 1)], 0);
    }

    #[test]
    fn test_zero_gradients_give_zero_sign() {
        let flat = Array2::<f32>::zeros((8, 8));
        let sign = field_sign(&flat, &flat, 3);
        assert!(sign.iter().all(|&v| v == 0.0));
    }
}

//! Per-pixel Fourier extraction at the stimulus frequency.
//!
//! The periodic bar sweep modulates every responsive pixel at exactly one
//! temporal frequency: `n_cycles` periods over the recorded series. For each
//! pixel the complex FFT coefficient at that frequency gives the response
//! magnitude and, critically, the response *phase*, which encodes when in
//! the sweep the bar crossed that pixel's receptive field.
//!
//! Phase convention: referenced to a sine at the cycle frequency, so a pixel
//! whose series is `sin(2*pi*k*j/n + phi)` reports phase `phi`. Results are
//! deterministic given identical inputs.

use ndarray::{Array2, Array3};
use num_complex::Complex;
use rustfft::FftPlanner;

/// Per-direction spectral maps at the stimulus frequency.
pub struct DirectionSpectrum {
    /// `2*|X_k|/n` per pixel.
    pub magnitude: Array2<f32>,
    /// Phase in `(-pi, pi]`, sine-referenced.
    pub phase: Array2<f32>,
}

/// Wrap an angle into `(-pi, pi]`.
pub fn wrap_angle(x: f64) -> f64 {
    let tau = std::f64::consts::TAU;
    let mut wrapped = x % tau;
    if wrapped <= -std::f64::consts::PI {
        wrapped += tau;
    } else if wrapped > std::f64::consts::PI {
        wrapped -= tau;
    }
    wrapped
}

/// Compute magnitude and phase at the `n_cycles`-th harmonic for every
/// pixel of `frames` (shape `(n, H, W)`).
pub fn direction_spectrum(frames: &Array3<f32>, n_cycles: usize) -> DirectionSpectrum {
    let (n, height, width) = frames.dim();
    let bin = n_cycles.clamp(1, (n / 2).max(1));
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);

    let mut magnitude = Array2::<f32>::zeros((height, width));
    let mut phase = Array2::<f32>::zeros((height, width));
    let mut buffer: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); n];
    let mut scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

    for y in 0..height {
        for x in 0..width {
            for (j, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(frames[(j, y, x)] as f64, 0.0);
            }
            fft.process_with_scratch(&mut buffer, &mut scratch);
            let coeff = buffer[bin];
            magnitude[(y, x)] = (2.0 * coeff.norm() / n as f64) as f32;
            // Shift from the FFT's cosine reference to the sine reference.
            phase[(y, x)] =
                wrap_angle(coeff.arg() + std::f64::consts::FRAC_PI_2) as f32;
        }
    }

    DirectionSpectrum { magnitude, phase }
}

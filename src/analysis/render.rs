//! Map rendering: luminance-accurate colormaps and PNG previews.
//!
//! The pipeline owns its colormaps rather than deferring to a UI: the same
//! PNG must come out of a headless batch run as out of an interactive one.
//! Retinotopy/phase maps use a jet-like rainbow, the sign map a bipolar
//! blue-white-red ramp, and the area map categorical colors spaced by the
//! golden angle.

use image::{Rgb, RgbImage};
use ndarray::Array2;
use std::path::Path;

use crate::error::{AppResult, IsiError};

/// Jet-like rainbow over `t` in 0..=1.
pub fn jet(t: f64) -> [u8; 3] {
    let t = t.clamp(0.0, 1.0);
    let channel = |c: f64| -> u8 {
        let v = 1.5 - (4.0 * t - c).abs();
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Bipolar blue-white-red ramp over `t` in -1..=1.
pub fn bipolar(t: f64) -> [u8; 3] {
    let t = t.clamp(-1.0, 1.0);
    if t < 0.0 {
        let f = 1.0 + t; // 0 at -1, 1 at 0
        [
            (f * 255.0).round() as u8,
            (f * 255.0).round() as u8,
            255,
        ]
    } else {
        let f = 1.0 - t;
        [
            255,
            (f * 255.0).round() as u8,
            (f * 255.0).round() as u8,
        ]
    }
}

/// Categorical color for label `i` (1-based); label 0 renders black.
pub fn categorical(label: i32) -> [u8; 3] {
    if label <= 0 {
        return [0, 0, 0];
    }
    // Golden-angle hue stepping keeps neighboring labels far apart in hue.
    let hue = (label as f64 * 137.508) % 360.0;
    hsv_to_rgb(hue, 0.75, 0.95)
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [u8; 3] {
    let c = v * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    [
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    ]
}

/// Render a scalar map through `colormap` after normalizing `lo..hi` to
/// 0..1, and write it as PNG.
pub fn save_scalar_png(
    path: &Path,
    map: &Array2<f32>,
    lo: f64,
    hi: f64,
    colormap: fn(f64) -> [u8; 3],
) -> AppResult<()> {
    let (height, width) = map.dim();
    let span = (hi - lo).abs().max(1e-12);
    let mut img = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let t = (map[(y, x)] as f64 - lo) / span;
            img.put_pixel(x as u32, y as u32, Rgb(colormap(t)));
        }
    }
    img.save(path)
        .map_err(|e| IsiError::Internal(format!("{}: {e}", path.display())))
}

/// Render the signed map (-1..1) through the bipolar ramp.
pub fn save_sign_png(path: &Path, map: &Array2<f32>) -> AppResult<()> {
    let (height, width) = map.dim();
    let mut img = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            img.put_pixel(x as u32, y as u32, Rgb(bipolar(map[(y, x)] as f64)));
        }
    }
    img.save(path)
        .map_err(|e| IsiError::Internal(format!("{}: {e}", path.display())))
}

/// Render the labeled area map with categorical colors.
pub fn save_area_png(path: &Path, labels: &Array2<i32>) -> AppResult<()> {
    let (height, width) = labels.dim();
    let mut img = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            img.put_pixel(x as u32, y as u32, Rgb(categorical(labels[(y, x)])));
        }
    }
    img.save(path)
        .map_err(|e| IsiError::Internal(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), [0, 0, 128]); // deep blue
        assert_eq!(jet(1.0), [128, 0, 0]); // deep red
        let mid = jet(0.5);
        assert!(mid[1] > 200, "center is green-ish: {mid:?}");
    }

    #[test]
    fn test_bipolar_is_white_at_zero() {
        assert_eq!(bipolar(0.0), [255, 255, 255]);
        assert_eq!(bipolar(-1.0), [0, 0, 255]);
        assert_eq!(bipolar(1.0), [255, 0, 0]);
    }

    #[test]
    fn test_categorical_labels_distinct() {
        let colors: Vec<[u8; 3]> = (1..=8).map(categorical).collect();
        for i in 0..colors.len() {
            for j in (i + 1)..colors.len() {
                assert_ne!(colors[i], colors[j], "labels {} and {}", i + 1, j + 1);
            }
        }
        assert_eq!(categorical(0), [0, 0, 0]);
    }

    #[test]
    fn test_png_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.png");
        let map = Array2::from_shape_fn((4, 6), |(y, x)| (y * 6 + x) as f32);
        save_scalar_png(&path, &map, 0.0, 23.0, jet).unwrap();
        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (6, 4));
        assert_eq!(*img.get_pixel(0, 0), Rgb(jet(0.0)));
    }
}

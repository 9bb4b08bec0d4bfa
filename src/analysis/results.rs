//! Persistence of the analysis result set.
//!
//! Everything lands under `analysis_results/` inside the session directory:
//! one HDF5 archive with the float32 maps (`area_map` int32), plus rendered
//! PNG previews. Re-running analysis overwrites the previous result set.

use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::analysis::render;
use crate::error::AppResult;
use crate::stimulus::Direction;

/// Complete result set of one analysis run.
pub struct AnalysisResults {
    /// Degrees azimuth per pixel; absent when no horizontal sweep was usable.
    pub azimuth: Option<Array2<f32>>,
    /// Degrees elevation per pixel; absent when no vertical sweep was usable.
    pub elevation: Option<Array2<f32>>,
    pub magnitude: BTreeMap<Direction, Array2<f32>>,
    pub phase: BTreeMap<Direction, Array2<f32>>,
    /// Smoothed graded visual field sign.
    pub sign: Array2<f32>,
    /// Labeled visual areas, 0 = background.
    pub areas: Array2<i32>,
    pub num_areas: usize,
}

/// Write the archive and previews; returns the output directory.
pub fn persist(session_dir: &Path, results: &AnalysisResults) -> AppResult<PathBuf> {
    let out_dir = session_dir.join("analysis_results");
    std::fs::create_dir_all(&out_dir)?;

    let h5_path = out_dir.join("analysis_results.h5");
    let file = hdf5::File::create(&h5_path)?;

    if let Some(map) = &results.azimuth {
        file.new_dataset_builder()
            .with_data(&map.view())
            .create("azimuth_map")?;
    }
    if let Some(map) = &results.elevation {
        file.new_dataset_builder()
            .with_data(&map.view())
            .create("elevation_map")?;
    }
    for (direction, map) in &results.magnitude {
        file.new_dataset_builder()
            .with_data(&map.view())
            .create(format!("magnitude_{direction}").as_str())?;
    }
    for (direction, map) in &results.phase {
        file.new_dataset_builder()
            .with_data(&map.view())
            .create(format!("phase_{direction}").as_str())?;
    }
    file.new_dataset_builder()
        .with_data(&results.sign.view())
        .create("sign_map")?;
    file.new_dataset_builder()
        .with_data(&results.areas.view())
        .create("area_map")?;

    if let Some(map) = &results.azimuth {
        let (lo, hi) = value_range(map);
        render::save_scalar_png(&out_dir.join("azimuth_map.png"), map, lo, hi, render::jet)?;
    }
    if let Some(map) = &results.elevation {
        let (lo, hi) = value_range(map);
        render::save_scalar_png(&out_dir.join("elevation_map.png"), map, lo, hi, render::jet)?;
    }
    render::save_sign_png(&out_dir.join("sign_map.png"), &results.sign)?;
    render::save_area_png(&out_dir.join("area_map.png"), &results.areas)?;

    tracing::info!(dir = %out_dir.display(), areas = results.num_areas, "analysis results written");
    Ok(out_dir)
}

fn value_range(map: &Array2<f32>) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in map.iter() {
        lo = lo.min(v as f64);
        hi = hi.max(v as f64);
    }
    if !lo.is_finite() || !hi.is_finite() {
        (0.0, 1.0)
    } else {
        (lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_writes_datasets_and_previews() {
        let dir = tempfile::tempdir().unwrap();
        let results = AnalysisResults {
            azimuth: Some(Array2::from_shape_fn((4, 5), |(y, x)| (y + x) as f32)),
            elevation: None,
            magnitude: BTreeMap::from([(
                Direction::LR,
                Array2::from_elem((4, 5), 1.0f32),
            )]),
            phase: BTreeMap::from([(Direction::LR, Array2::from_elem((4, 5), 0.5f32))]),
            sign: Array2::zeros((4, 5)),
            areas: Array2::zeros((4, 5)),
            num_areas: 0,
        };
        let out = persist(dir.path(), &results).unwrap();
        assert_eq!(out, dir.path().join("analysis_results"));

        let file = hdf5::File::open(out.join("analysis_results.h5")).unwrap();
        assert_eq!(file.dataset("azimuth_map").unwrap().shape(), vec![4, 5]);
        assert!(file.dataset("elevation_map").is_err());
        assert_eq!(file.dataset("magnitude_LR").unwrap().shape(), vec![4, 5]);
        let area = file.dataset("area_map").unwrap().read_2d::<i32>().unwrap();
        assert_eq!(area.dim(), (4, 5));

        assert!(out.join("azimuth_map.png").exists());
        assert!(!out.join("elevation_map.png").exists());
        assert!(out.join("sign_map.png").exists());
        assert!(out.join("area_map.png").exists());
    }

    #[test]
    fn test_persist_overwrites_previous_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut results = AnalysisResults {
            azimuth: None,
            elevation: None,
            magnitude: BTreeMap::new(),
            phase: BTreeMap::new(),
            sign: Array2::zeros((2, 2)),
            areas: Array2::zeros((2, 2)),
            num_areas: 0,
        };
        persist(dir.path(), &results).unwrap();
        results.num_areas = 1;
        results.areas[(0, 0)] = 1;
        let out = persist(dir.path(), &results).unwrap();
        let file = hdf5::File::open(out.join("analysis_results.h5")).unwrap();
        let area = file.dataset("area_map").unwrap().read_2d::<i32>().unwrap();
        assert_eq!(area[(0, 0)], 1);
    }
}

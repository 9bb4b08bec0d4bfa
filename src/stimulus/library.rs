//! Pre-generated stimulus frame library.
//!
//! Rendering every frame of a sweep takes long enough that it must happen
//! before acquisition starts, not during it. The library materializes the
//! forward sweeps (`LR`, `TB`) as `(n, height, width)` u8 stacks and serves
//! the reversed directions (`RL`, `BT`) as index-reversed views, so
//! `library[RL][i]` is byte-identical to `library[LR][n-1-i]` by
//! construction.
//!
//! A library is only valid for the exact parameter values it was generated
//! from. Both the in-memory library and the on-disk archives carry the
//! SHA-256 `generation_fingerprint` of the `monitor` + `stimulus` groups;
//! [`StimulusLibrary::load`] refuses an archive whose fingerprint differs
//! from the live parameters and reports every differing key.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use ndarray::{Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{AppResult, IsiError};
use crate::params::fingerprint::diff_snapshots;
use crate::storage::write_str_attr;
use crate::stimulus::generator::StimulusGenerator;
use crate::stimulus::{Direction, StimulusFrame, StimulusHeader};

/// Progress of one direction's pre-generation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LibraryProgress {
    pub direction: Direction,
    pub frames_done: usize,
    pub frames_total: usize,
}

/// Manifest written next to the per-direction archives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryManifest {
    pub fingerprint: String,
    pub generation_params: Value,
    pub directions: Vec<Direction>,
    pub timestamp: DateTime<Utc>,
    pub total_frames: usize,
}

#[derive(Debug)]
struct MaterializedSequence {
    /// `(n, height, width)` grayscale frames in forward sweep order.
    frames: Array3<u8>,
    /// Bar-center angle per frame, forward order.
    angles: Vec<f64>,
}

/// Indexed per-direction stimulus frame sequences.
#[derive(Debug)]
pub struct StimulusLibrary {
    fingerprint: String,
    generation_params: Value,
    created_at: DateTime<Utc>,
    sequences: BTreeMap<Direction, MaterializedSequence>,
}

impl StimulusLibrary {
    /// Materialize the sequences backing `directions`.
    ///
    /// Only the forward direction of each requested axis is rendered.
    /// Progress events are emitted best-effort (a slow consumer drops
    /// updates rather than stalling generation). `cancel` is checked at
    /// every frame boundary.
    pub fn generate(
        generator: &StimulusGenerator,
        directions: &[Direction],
        generation_params: Value,
        fingerprint: String,
        progress: Option<&Sender<LibraryProgress>>,
        cancel: Option<&AtomicBool>,
    ) -> AppResult<Self> {
        let mut targets: Vec<Direction> = directions.iter().map(|d| d.materialized()).collect();
        targets.sort();
        targets.dedup();

        let mut sequences = BTreeMap::new();
        for direction in targets {
            let info = generator.dataset_info(direction, 1);
            let n = info.frames_per_cycle;
            let (height, width) = {
                let screen = generator.screen();
                (screen.height_px, screen.width_px)
            };
            let mut frames = Array3::<u8>::zeros((n, height, width));
            let mut angles = Vec::with_capacity(n);

            for i in 0..n {
                if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    return Err(IsiError::Cancelled);
                }
                let angle = generator.frame_angle(direction, i, n);
                let frame = generator.render_frame(direction, angle, true, i);
                frames.index_axis_mut(ndarray::Axis(0), i).assign(&frame.image);
                angles.push(angle);
                if let Some(tx) = progress {
                    let _ = tx.try_send(LibraryProgress {
                        direction,
                        frames_done: i + 1,
                        frames_total: n,
                    });
                }
            }
            tracing::info!(%direction, frames = n, "stimulus sequence materialized");
            sequences.insert(direction, MaterializedSequence { frames, angles });
        }

        Ok(Self {
            fingerprint,
            generation_params,
            created_at: Utc::now(),
            sequences,
        })
    }

    /// Fingerprint of the parameters this library was generated from.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Exact parameter snapshot the fingerprint covers.
    pub fn generation_params(&self) -> &Value {
        &self.generation_params
    }

    /// Forward directions with materialized frames.
    pub fn materialized_directions(&self) -> Vec<Direction> {
        self.sequences.keys().copied().collect()
    }

    /// True if every direction in `directions` can be served.
    pub fn covers(&self, directions: &[Direction]) -> bool {
        directions
            .iter()
            .all(|d| self.sequences.contains_key(&d.materialized()))
    }

    /// Frames in one sweep of `direction`.
    pub fn frames_per_cycle(&self, direction: Direction) -> Option<usize> {
        self.sequences
            .get(&direction.materialized())
            .map(|s| s.frames.shape()[0])
    }

    /// Sum of materialized frame counts.
    pub fn total_frames(&self) -> usize {
        self.sequences.values().map(|s| s.frames.shape()[0]).sum()
    }

    fn backing_index(&self, direction: Direction, index: usize) -> Option<usize> {
        let n = self.frames_per_cycle(direction)?;
        if index >= n {
            return None;
        }
        Some(if direction.is_reversed() {
            n - 1 - index
        } else {
            index
        })
    }

    /// Bar-center angle of frame `index` of `direction`.
    pub fn angle(&self, direction: Direction, index: usize) -> Option<f64> {
        let backing = self.backing_index(direction, index)?;
        self.sequences
            .get(&direction.materialized())
            .map(|s| s.angles[backing])
    }

    /// Borrowed pixels of frame `index` of `direction`.
    pub fn image(&self, direction: Direction, index: usize) -> Option<ArrayView2<'_, u8>> {
        let backing = self.backing_index(direction, index)?;
        self.sequences
            .get(&direction.materialized())
            .map(|s| s.frames.index_axis(ndarray::Axis(0), backing))
    }

    /// Owned frame `index` of `direction` with a filled header.
    pub fn frame(&self, direction: Direction, index: usize) -> Option<StimulusFrame> {
        let image = self.image(direction, index)?.to_owned();
        let angle = self.angle(direction, index)?;
        Some(StimulusFrame {
            header: StimulusHeader {
                direction,
                frame_index: index as u64,
                bar_angle_deg: angle,
                timestamp_us: 0,
            },
            image,
        })
    }

    /// Persist every materialized sequence plus the manifest under `dir`.
    pub fn save(&self, dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(dir)?;
        for (direction, seq) in &self.sequences {
            let path = dir.join(format!("{direction}_frames.h5"));
            let file = hdf5::File::create(&path)?;
            let (n, height, width) = seq.frames.dim();
            let chunk_frames = n.min(8).max(1);
            let ds = file
                .new_dataset::<u8>()
                .chunk((chunk_frames, height, width))
                .shape((n, height, width))
                .deflate(4)
                .create("frames")?;
            ds.write(&seq.frames.view())?;

            let angles_f32: Vec<f32> = seq.angles.iter().map(|&a| a as f32).collect();
            file.new_dataset_builder()
                .with_data(&ndarray::aview1(&angles_f32))
                .create("angles")?;

            write_str_attr(&ds, "direction", direction.as_str())?;
            ds.new_attr::<u64>()
                .create("num_frames")?
                .write_scalar(&(n as u64))?;
            write_str_attr(
                &ds,
                "generation_params",
                &self.generation_params.to_string(),
            )?;
            tracing::debug!(path = %path.display(), frames = n, "library archive written");
        }

        let manifest = LibraryManifest {
            fingerprint: self.fingerprint.clone(),
            generation_params: self.generation_params.clone(),
            directions: self.materialized_directions(),
            timestamp: self.created_at,
            total_frames: self.total_frames(),
        };
        let text = serde_json::to_string_pretty(&manifest)
            .map_err(|e| IsiError::Internal(e.to_string()))?;
        std::fs::write(dir.join("library_metadata.json"), text)?;
        Ok(())
    }

    /// Load a saved library, gated on the generation fingerprint.
    ///
    /// Unless `force` is set, a fingerprint mismatch fails with
    /// [`IsiError::LibraryMismatch`] listing every key that differs between
    /// the archived parameter snapshot and `current_params`.
    pub fn load(
        dir: &Path,
        current_params: &Value,
        current_fingerprint: &str,
        force: bool,
    ) -> AppResult<Self> {
        let manifest_path = dir.join("library_metadata.json");
        let manifest_text = std::fs::read_to_string(&manifest_path)?;
        let manifest: LibraryManifest =
            serde_json::from_str(&manifest_text).map_err(|e| IsiError::CorruptArchive {
                path: manifest_path.clone(),
                detail: e.to_string(),
            })?;

        if manifest.fingerprint != current_fingerprint {
            let differences = diff_snapshots(&manifest.generation_params, current_params);
            if !force {
                return Err(IsiError::LibraryMismatch { differences });
            }
            tracing::warn!(
                differing_keys = differences.len(),
                "loading stimulus library despite parameter mismatch (forced)"
            );
        }

        let mut sequences = BTreeMap::new();
        for direction in &manifest.directions {
            let path = dir.join(format!("{direction}_frames.h5"));
            let file = hdf5::File::open(&path)?;
            let frames = file
                .dataset("frames")?
                .read_dyn::<u8>()?
                .into_dimensionality::<ndarray::Ix3>()
                .map_err(|e| IsiError::CorruptArchive {
                    path: path.clone(),
                    detail: format!("frames dataset is not 3-dimensional: {e}"),
                })?;
            let angles_f32 = file.dataset("angles")?.read_1d::<f32>()?;
            if angles_f32.len() != frames.shape()[0] {
                return Err(IsiError::CorruptArchive {
                    path,
                    detail: format!(
                        "{} frames but {} angles",
                        frames.shape()[0],
                        angles_f32.len()
                    ),
                });
            }
            sequences.insert(
                *direction,
                MaterializedSequence {
                    frames,
                    angles: angles_f32.iter().map(|&a| a as f64).collect(),
                },
            );
        }

        tracing::info!(
            directions = manifest.directions.len(),
            total_frames = manifest.total_frames,
            "stimulus library loaded from disk"
        );
        Ok(Self {
            fingerprint: manifest.fingerprint,
            generation_params: manifest.generation_params,
            created_at: manifest.timestamp,
            sequences,
        })
    }
}

/// Process-wide slot holding the current library.
///
/// Readers clone the `Arc` and keep using the library they started a frame
/// with; invalidation is a pointer swap, so an in-flight frame finishes on
/// the old library while new frames see the new one (or none).
#[derive(Default)]
pub struct LibrarySlot {
    inner: parking_lot::RwLock<Option<Arc<StimulusLibrary>>>,
}

impl LibrarySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current library, if one is installed.
    pub fn get(&self) -> Option<Arc<StimulusLibrary>> {
        self.inner.read().clone()
    }

    /// Install a freshly generated or loaded library.
    pub fn install(&self, library: Arc<StimulusLibrary>) {
        *self.inner.write() = Some(library);
    }

    /// Drop the current library (generating parameters changed).
    pub fn clear(&self) {
        if self.inner.write().take().is_some() {
            tracing::info!("stimulus library invalidated");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().is_some()
    }
}

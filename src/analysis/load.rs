//! Session loading and normalization for analysis.
//!
//! Opens a recorded session directory, reads each direction's camera archive
//! and event file, and normalizes frames to grayscale `f32`. Color frames
//! are assumed BGR (the prevalent webcam capture order) and converted with
//! ITU-R BT.601 luminance weights; a capture layer delivering RGB must
//! invert [`BGR_WEIGHTS`].
//!
//! Camera-triggered sessions pair camera frame `k` with event line `k`
//! directly. Sessions produced with decoupled camera/stimulus clocks carry a
//! per-frame `timestamps` dataset (microseconds, u64) in the camera archive
//! instead; when the event count does not match the frame count, frames are
//! paired to the nearest event within half the median event interval, and
//! frames with no event inside that window are flagged in
//! [`DirectionData::unmatched`].

use ndarray::{Array3, ArrayD};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{AppResult, IsiError};
use crate::recorder::{FrameEvent, SessionMetadata};
use crate::stimulus::Direction;

/// BT.601 luminance weights in B, G, R order.
pub const BGR_WEIGHTS: [f64; 3] = [0.114, 0.587, 0.299];

/// One direction's recorded data, normalized.
#[derive(Debug)]
pub struct DirectionData {
    /// `(n, H, W)` grayscale frames.
    pub frames: Array3<f32>,
    /// One event per frame, in capture order.
    pub events: Vec<FrameEvent>,
    /// Frame indices whose pairing came from nearest-neighbor timestamp
    /// matching but had no event within the tolerance window (these carry
    /// the last matched event). Empty for camera-triggered sessions.
    pub unmatched: Vec<usize>,
}

/// A loaded session.
pub struct SessionData {
    pub dir: PathBuf,
    pub metadata: SessionMetadata,
    pub directions: BTreeMap<Direction, DirectionData>,
    /// Directions listed in the metadata whose archives were unreadable or
    /// absent; reported, not fatal.
    pub missing: Vec<Direction>,
}

/// Load every readable direction of the session at `dir`.
pub fn load_session(dir: &Path) -> AppResult<SessionData> {
    let metadata_path = dir.join("metadata.json");
    let metadata: SessionMetadata = serde_json::from_str(
        &std::fs::read_to_string(&metadata_path)?,
    )
    .map_err(|e| IsiError::CorruptArchive {
        path: metadata_path,
        detail: e.to_string(),
    })?;

    let mut directions = BTreeMap::new();
    let mut missing = Vec::new();
    for &direction in &metadata.directions_recorded {
        match load_direction(dir, direction) {
            Ok(data) => {
                directions.insert(direction, data);
            }
            Err(err) => {
                tracing::warn!(%direction, error = %err, "direction unreadable, skipping");
                missing.push(direction);
            }
        }
    }

    Ok(SessionData {
        dir: dir.to_path_buf(),
        metadata,
        directions,
        missing,
    })
}

fn load_direction(dir: &Path, direction: Direction) -> AppResult<DirectionData> {
    let h5_path = dir.join(format!("{direction}_camera.h5"));
    let file = hdf5::File::open(&h5_path).map_err(|e| IsiError::CorruptCamera {
        path: h5_path.clone(),
        detail: e.to_string(),
    })?;
    let raw = file
        .dataset("frames")
        .and_then(|ds| ds.read_dyn::<u8>())
        .map_err(|e| IsiError::CorruptCamera {
            path: h5_path.clone(),
            detail: e.to_string(),
        })?;
    let frames = to_grayscale(&raw)?;

    let events = read_events(&dir.join(format!("{direction}_events.json")))?;
    let n = frames.dim().0;
    if events.len() == n {
        // Camera-triggered session: line k pairs with frame k by design.
        return Ok(DirectionData {
            frames,
            events,
            unmatched: Vec::new(),
        });
    }

    // Decoupled-clock session: pair each frame with the nearest event by
    // timestamp. The camera archive must then carry its own clock.
    if events.is_empty() {
        return Err(IsiError::CorruptCamera {
            path: h5_path,
            detail: format!("{n} frames but no event lines"),
        });
    }
    let camera_ts = read_frame_timestamps(&file, n, &h5_path)?;
    let tolerance_us = pairing_tolerance_us(&events);
    let matched = correlate_by_timestamp(&camera_ts, &events, tolerance_us);

    let mut paired = Vec::with_capacity(n);
    let mut unmatched = Vec::new();
    let mut last = events[0];
    for (index, entry) in matched.into_iter().enumerate() {
        match entry {
            Some(event) => {
                last = event;
                paired.push(event);
            }
            None => {
                // Keep the series contiguous; the flag tells downstream the
                // pairing here is a carry-over.
                unmatched.push(index);
                paired.push(last);
            }
        }
    }
    if unmatched.len() == n {
        return Err(IsiError::CorruptCamera {
            path: h5_path,
            detail: format!(
                "no camera timestamp within {tolerance_us} us of any event"
            ),
        });
    }
    if !unmatched.is_empty() {
        tracing::warn!(
            %direction,
            unmatched = unmatched.len(),
            frames = n,
            "frames without a stimulus event inside the tolerance window"
        );
    }

    Ok(DirectionData {
        frames,
        events: paired,
        unmatched,
    })
}

/// Per-frame capture timestamps for decoupled-clock sessions.
fn read_frame_timestamps(
    file: &hdf5::File,
    n_frames: usize,
    h5_path: &Path,
) -> AppResult<Vec<u64>> {
    let dataset = file.dataset("timestamps").map_err(|_| IsiError::CorruptCamera {
        path: h5_path.to_path_buf(),
        detail: "event/frame counts differ and the archive has no \
                 'timestamps' dataset to correlate by"
            .into(),
    })?;
    let timestamps = dataset.read_1d::<u64>()?;
    if timestamps.len() != n_frames {
        return Err(IsiError::CorruptCamera {
            path: h5_path.to_path_buf(),
            detail: format!(
                "{} timestamps for {} frames",
                timestamps.len(),
                n_frames
            ),
        });
    }
    Ok(timestamps.to_vec())
}

/// Tolerance window for nearest-neighbor pairing: half the median interval
/// between consecutive events.
fn pairing_tolerance_us(events: &[FrameEvent]) -> u64 {
    let mut intervals: Vec<u64> = events
        .windows(2)
        .map(|w| w[1].timestamp_us.saturating_sub(w[0].timestamp_us))
        .filter(|&dt| dt > 0)
        .collect();
    if intervals.is_empty() {
        return 100_000;
    }
    intervals.sort_unstable();
    (intervals[intervals.len() / 2] / 2).max(1)
}

/// Normalize a raw frame stack to `(n, H, W)` grayscale `f32`.
///
/// Accepts `(n, H, W)` mono and `(n, H, W, 3|4)` color (BGR[A]); anything
/// else is a structured shape error.
pub fn to_grayscale(raw: &ArrayD<u8>) -> AppResult<Array3<f32>> {
    match raw.shape() {
        [n, h, w] => {
            let (n, h, w) = (*n, *h, *w);
            let mut out = Array3::<f32>::zeros((n, h, w));
            for j in 0..n {
                for y in 0..h {
                    for x in 0..w {
                        out[(j, y, x)] = raw[[j, y, x]] as f32;
                    }
                }
            }
            Ok(out)
        }
        [n, h, w, c] if *c == 3 || *c == 4 => {
            let (n, h, w, _c) = (*n, *h, *w, *c);
            let mut out = Array3::<f32>::zeros((n, h, w));
            for j in 0..n {
                for y in 0..h {
                    for x in 0..w {
                        let b = raw[[j, y, x, 0]] as f64;
                        let g = raw[[j, y, x, 1]] as f64;
                        let r = raw[[j, y, x, 2]] as f64;
                        out[(j, y, x)] =
                            (BGR_WEIGHTS[0] * b + BGR_WEIGHTS[1] * g + BGR_WEIGHTS[2] * r) as f32;
                    }
                }
            }
            Ok(out)
        }
        other => Err(IsiError::ShapeMismatch {
            got: other.to_vec(),
            expected: "(n, H, W) or (n, H, W, 3|4)".into(),
        }),
    }
}

fn read_events(path: &Path) -> AppResult<Vec<FrameEvent>> {
    let text = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: FrameEvent =
            serde_json::from_str(line).map_err(|e| IsiError::CorruptArchive {
                path: path.to_path_buf(),
                detail: format!("line {}: {e}", line_no + 1),
            })?;
        events.push(event);
    }
    Ok(events)
}

/// Nearest-neighbor correlation for sessions recorded with decoupled
/// camera/stimulus clocks: pair each camera timestamp with the closest event
/// within `tolerance_us`. Returns one `Option` per camera frame; unmatched
/// frames are `None` and flagged by the caller.
pub fn correlate_by_timestamp(
    camera_ts_us: &[u64],
    events: &[FrameEvent],
    tolerance_us: u64,
) -> Vec<Option<FrameEvent>> {
    let mut out = Vec::with_capacity(camera_ts_us.len());
    let mut cursor = 0usize;
    for &ts in camera_ts_us {
        while cursor + 1 < events.len()
            && events[cursor + 1].timestamp_us.abs_diff(ts)
                <= events[cursor].timestamp_us.abs_diff(ts)
        {
            cursor += 1;
        }
        let best = events.get(cursor);
        out.push(match best {
            Some(event) if event.timestamp_us.abs_diff(ts) <= tolerance_us => Some(*event),
            _ => None,
        });
    }
    out
}

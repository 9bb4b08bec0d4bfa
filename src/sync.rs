//! Camera/stimulus synchronization tracker.
//!
//! Keeps a rolling time window of `(camera_ts, stimulus_ts, frame_id, delta)`
//! samples recorded by the capture thread, and produces snapshots with
//! summary statistics and a fixed-bin histogram for the UI's timing display.
//!
//! Writes are cheap (one bounded-deque push under a mutex) and happen once
//! per camera frame; snapshots walk the window and are taken at UI rate.
//!
//! In camera-triggered mode the engine stamps `stimulus_ts = camera_ts`, so
//! delta degenerates to zero; the tracker is retained unchanged for a future
//! decoupled-clock mode.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Default rolling window, seconds.
pub const DEFAULT_WINDOW_SECS: f64 = 5.0;
/// Samples older than this at write time are rejected.
pub const DEFAULT_STALENESS_US: u64 = 100_000;
/// Absolute camera/stimulus offsets beyond this are rejected.
pub const MAX_DELTA_US: i64 = 100_000;
/// Fixed histogram bin count over `[-MAX_DELTA_US, +MAX_DELTA_US]`.
const HISTOGRAM_BINS: usize = 41;

/// One accepted synchronization sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncSample {
    pub camera_ts_us: u64,
    pub stimulus_ts_us: u64,
    pub frame_id: u64,
    /// `stimulus_ts - camera_ts`.
    pub delta_us: i64,
}

/// Summary statistics over a snapshot window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Samples in the window.
    pub count: usize,
    /// Samples whose |delta| is within half a stimulus frame at 60 Hz.
    pub matched: usize,
    pub mean_ms: f64,
    pub std_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Per-bin sample counts; sums to `count`.
    pub histogram: Vec<u64>,
    /// Bin edges in milliseconds, `histogram.len() + 1` entries.
    pub bin_edges: Vec<f64>,
}

/// Snapshot of the tracker state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub samples: Vec<SyncSample>,
    pub stats: SyncStats,
}

struct TrackerState {
    samples: std::collections::VecDeque<SyncSample>,
    enabled: bool,
}

/// Rolling window of camera/stimulus timing samples.
pub struct SyncTracker {
    state: Mutex<TrackerState>,
    clock: Clock,
    window_us: u64,
    staleness_us: u64,
}

impl SyncTracker {
    pub fn new(clock: Clock) -> Self {
        Self::with_window(clock, DEFAULT_WINDOW_SECS, DEFAULT_STALENESS_US)
    }

    pub fn with_window(clock: Clock, window_secs: f64, staleness_us: u64) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                samples: std::collections::VecDeque::new(),
                enabled: false,
            }),
            clock,
            window_us: (window_secs.max(0.1) * 1e6) as u64,
            staleness_us,
        }
    }

    /// Enable recording and drop any samples from a previous run.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.enabled = true;
    }

    /// Stop recording; the window remains snapshotable.
    pub fn stop(&self) {
        self.state.lock().enabled = false;
    }

    /// Record one sample. Returns `false` when rejected: tracker disabled,
    /// either timestamp older than the staleness limit, or |delta| beyond
    /// [`MAX_DELTA_US`].
    pub fn record(&self, camera_ts_us: u64, stimulus_ts_us: u64, frame_id: u64) -> bool {
        let delta_us = stimulus_ts_us as i64 - camera_ts_us as i64;
        if delta_us.abs() > MAX_DELTA_US {
            return false;
        }
        let now = self.clock.now_us();
        let stale_before = now.saturating_sub(self.staleness_us);
        if camera_ts_us < stale_before || stimulus_ts_us < stale_before {
            return false;
        }

        let mut state = self.state.lock();
        if !state.enabled {
            return false;
        }
        state.samples.push_back(SyncSample {
            camera_ts_us,
            stimulus_ts_us,
            frame_id,
            delta_us,
        });
        // Evict outside the rolling window.
        let horizon = now.saturating_sub(self.window_us);
        while state
            .samples
            .front()
            .is_some_and(|s| s.camera_ts_us < horizon)
        {
            state.samples.pop_front();
        }
        true
    }

    /// Snapshot the samples of the last `window_secs` (clamped to the
    /// tracker's own window) with statistics and histogram.
    pub fn snapshot(&self, window_secs: Option<f64>) -> SyncSnapshot {
        let now = self.clock.now_us();
        let window_us = window_secs
            .map(|s| (s.max(0.0) * 1e6) as u64)
            .unwrap_or(self.window_us)
            .min(self.window_us);
        let horizon = now.saturating_sub(window_us);

        let samples: Vec<SyncSample> = {
            let state = self.state.lock();
            state
                .samples
                .iter()
                .filter(|s| s.camera_ts_us >= horizon)
                .copied()
                .collect()
        };

        SyncSnapshot {
            stats: compute_stats(&samples),
            samples,
        }
    }
}

fn compute_stats(samples: &[SyncSample]) -> SyncStats {
    let bin_width_ms = 2.0 * (MAX_DELTA_US as f64 / 1000.0) / HISTOGRAM_BINS as f64;
    let edge0 = -(MAX_DELTA_US as f64) / 1000.0;
    let bin_edges: Vec<f64> = (0..=HISTOGRAM_BINS)
        .map(|i| edge0 + i as f64 * bin_width_ms)
        .collect();
    let mut histogram = vec![0u64; HISTOGRAM_BINS];

    if samples.is_empty() {
        return SyncStats {
            count: 0,
            matched: 0,
            mean_ms: 0.0,
            std_ms: 0.0,
            min_ms: 0.0,
            max_ms: 0.0,
            histogram,
            bin_edges,
        };
    }

    // "Matched" means within half a frame at a 60 Hz display.
    let matched_limit_ms = 1000.0 / 60.0 / 2.0;
    let mut sum = 0.0;
    let mut min_ms = f64::INFINITY;
    let mut max_ms = f64::NEG_INFINITY;
    let mut matched = 0usize;

    let deltas_ms: Vec<f64> = samples.iter().map(|s| s.delta_us as f64 / 1000.0).collect();
    for &d in &deltas_ms {
        sum += d;
        min_ms = min_ms.min(d);
        max_ms = max_ms.max(d);
        if d.abs() <= matched_limit_ms {
            matched += 1;
        }
        let bin = (((d - edge0) / bin_width_ms) as usize).min(HISTOGRAM_BINS - 1);
        histogram[bin] += 1;
    }

    let mean_ms = sum / deltas_ms.len() as f64;
    let variance = deltas_ms
        .iter()
        .map(|d| (d - mean_ms) * (d - mean_ms))
        .sum::<f64>()
        / deltas_ms.len() as f64;

    SyncStats {
        count: samples.len(),
        matched,
        mean_ms,
        std_ms: variance.sqrt(),
        min_ms,
        max_ms,
        histogram,
        bin_edges,
    }
}

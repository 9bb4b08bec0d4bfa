//! Custom error types for the application.
//!
//! This module defines the primary error type, `IsiError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the rig can
//! produce, from parameter validation through hardware faults to analysis
//! shape errors.
//!
//! ## Error Hierarchy
//!
//! `IsiError` is an enum that consolidates various error sources:
//!
//! - **`Validation`**: a parameter write outside its declared bounds, or a
//!   patch naming an unknown field. Local, recoverable, surfaced to the
//!   command sender.
//! - **`HardwareUnavailable`**: no capture device present; acquisition
//!   refuses to start.
//! - **`LibraryMismatch`** / **`CorruptArchive`**: a saved stimulus library
//!   whose generation fingerprint does not match the current parameters, or
//!   whose archive is damaged. The mismatch variant enumerates every
//!   differing key.
//! - **`Io`**: wraps `std::io::Error` for file and directory operations.
//! - **`Storage`**: HDF5-level failures while reading or writing archives.
//! - **`RecorderBackpressure`**: the recorder queue stayed full beyond its
//!   grace window; fatal to the current run, recoverable by restarting it.
//! - **`ShapeMismatch`** / **`MissingDirection`** / **`InsufficientFrames`**:
//!   structured analysis-input failures, scoped to one session.
//! - **`Cancelled`**: cooperative cancellation. A terminal state, never
//!   logged as an error.
//!
//! Recoverable errors are returned to the command sender; fatal errors during
//! a run trigger graceful finalization and are retained as `last_fault` in
//! the system state. The core never aborts the process on a data error.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, IsiError>;

/// One differing key in a fingerprint-gated library load.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParameterDifference {
    /// Dotted key, e.g. `monitor.monitor_fps`.
    pub key: String,
    /// Value recorded in the saved archive.
    pub saved: serde_json::Value,
    /// Value in the live parameter store.
    pub current: serde_json::Value,
}

#[derive(Error, Debug)]
pub enum IsiError {
    #[error("Validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] hdf5::Error),

    #[error("Failed to persist parameters: {0}")]
    PersistFailed(String),

    #[error("No capture device available")]
    HardwareUnavailable,

    #[error("Unknown camera '{0}'")]
    UnknownCamera(String),

    #[error("Stimulus library is not loaded")]
    LibraryNotLoaded,

    #[error("Stimulus library parameter mismatch ({} differing keys)", differences.len())]
    LibraryMismatch { differences: Vec<ParameterDifference> },

    #[error("Corrupt archive at {path}: {detail}")]
    CorruptArchive { path: PathBuf, detail: String },

    #[error("Acquisition is already running")]
    AcquisitionRunning,

    #[error("Acquisition is not running")]
    AcquisitionIdle,

    #[error("Recorder queue backed up beyond the grace window")]
    RecorderBackpressure,

    #[error("Stimulus index {index} outside library of {available} frames for {direction}")]
    StimulusIndexOutOfRange {
        direction: crate::stimulus::Direction,
        index: usize,
        available: usize,
    },

    #[error("Analysis is already running")]
    AnalysisRunning,

    #[error("Session is missing direction {0}")]
    MissingDirection(crate::stimulus::Direction),

    #[error("Not enough frames for analysis: got {got}, need at least {need}")]
    InsufficientFrames { got: usize, need: usize },

    #[error("Corrupt camera archive at {path}: {detail}")]
    CorruptCamera { path: PathBuf, detail: String },

    #[error("Unexpected array shape {got:?} ({expected})")]
    ShapeMismatch { got: Vec<usize>, expected: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl IsiError {
    /// Stable machine-readable code for the event channel.
    pub fn code(&self) -> &'static str {
        match self {
            IsiError::Validation { .. } => "validation_failed",
            IsiError::Configuration(_) => "configuration",
            IsiError::Io(_) => "io",
            IsiError::Storage(_) => "storage",
            IsiError::PersistFailed(_) => "persist_failed",
            IsiError::HardwareUnavailable => "hardware_unavailable",
            IsiError::UnknownCamera(_) => "unknown_camera",
            IsiError::LibraryNotLoaded => "library_not_loaded",
            IsiError::LibraryMismatch { .. } => "library_mismatch",
            IsiError::CorruptArchive { .. } => "corrupt_archive",
            IsiError::AcquisitionRunning => "acquisition_running",
            IsiError::AcquisitionIdle => "acquisition_idle",
            IsiError::RecorderBackpressure => "recorder_backpressure",
            IsiError::StimulusIndexOutOfRange { .. } => "stimulus_index_out_of_range",
            IsiError::AnalysisRunning => "analysis_running",
            IsiError::MissingDirection(_) => "missing_direction",
            IsiError::InsufficientFrames { .. } => "insufficient_frames",
            IsiError::CorruptCamera { .. } => "corrupt_camera",
            IsiError::ShapeMismatch { .. } => "shape_mismatch",
            IsiError::Cancelled => "cancelled",
            IsiError::Internal(_) => "internal",
        }
    }

    /// True for errors that end the current run but leave the process healthy.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            IsiError::RecorderBackpressure
                | IsiError::StimulusIndexOutOfRange { .. }
                | IsiError::HardwareUnavailable
                | IsiError::Storage(_)
                | IsiError::Io(_)
        )
    }
}

impl From<anyhow::Error> for IsiError {
    fn from(err: anyhow::Error) -> Self {
        IsiError::Internal(format!("{err:#}"))
    }
}

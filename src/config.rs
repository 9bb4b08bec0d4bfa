//! Process-level settings.
//!
//! These are the few values that belong to the *process*, not to the
//! experiment: where session data lives, where the pre-generated stimulus
//! library is cached, where the shared-memory ring files are mapped, and
//! where the scientific parameter file is persisted. Scientific parameters
//! themselves live in [`crate::params::ParameterStore`].
//!
//! Settings are resolved by layering, lowest priority first:
//!
//! 1. built-in defaults (under the user data directory),
//! 2. an optional `isi-rig.toml`,
//! 3. `ISI_*` environment variables (e.g. `ISI_DATA_ROOT=/scratch/isi`).

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, IsiError};

/// Resolved process settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory for recorded sessions (`<data_root>/sessions/<name>/`).
    pub data_root: PathBuf,
    /// Directory holding the persisted stimulus library archives.
    pub library_dir: PathBuf,
    /// Directory for the shared-memory ring files (ideally tmpfs).
    pub shm_dir: PathBuf,
    /// Path of the persisted parameter file.
    pub parameter_file: PathBuf,
    /// Slot count of each shared-memory ring.
    pub bus_slots: usize,
    /// Recorder queue depth in seconds of frames at the camera rate.
    pub recorder_queue_secs: f64,
}

impl Default for Settings {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("isi-rig");
        Self {
            data_root: base.join("data"),
            library_dir: base.join("data").join("stimulus_library"),
            shm_dir: std::env::temp_dir().join("isi-rig"),
            parameter_file: base.join("parameters.json"),
            bus_slots: 4,
            recorder_queue_secs: 2.0,
        }
    }
}

impl Settings {
    /// Load settings, layering `isi-rig.toml` (if present) and `ISI_*`
    /// environment overrides on top of the defaults.
    pub fn load(config_file: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("isi-rig.toml"));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("ISI_"))
            .extract()
            .map_err(|e| IsiError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.bus_slots < 3 {
            return Err(IsiError::Configuration(
                "bus_slots must be at least 3".into(),
            ));
        }
        if !(self.recorder_queue_secs > 0.0) {
            return Err(IsiError::Configuration(
                "recorder_queue_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Directory for recorded sessions.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_root.join("sessions")
    }
}

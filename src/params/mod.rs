//! Process-wide typed parameter registry.
//!
//! [`ParameterStore`] owns the live values of every parameter group, applies
//! validated patches, persists to a JSON file, and notifies subscribers on
//! every successful write. Reads take a cheap snapshot under a read-mostly
//! lock; writers serialize.
//!
//! # Volatile groups
//!
//! The `monitor` and `camera` groups describe hardware and are re-detected at
//! every startup. They are *never* persisted: each save writes sentinel
//! values (`-1` for numbers, empty strings) in their place, and
//! [`ParameterStore::repopulate_volatile`] installs the detected values after
//! construction.
//!
//! # Fingerprint
//!
//! [`ParameterStore::fingerprint`] hashes the canonical serialization of the
//! `monitor` + `stimulus` groups (see [`fingerprint`]); the stimulus library
//! uses it to gate reuse of pre-generated frames.

pub mod fingerprint;
mod groups;

pub use groups::{
    field_bounds, group_bounds, AcquisitionParams, AnalysisParams, CameraParams, FieldBounds,
    MonitorParams, ParamGroupId, Parameters, SessionParams, StimulusParams, VALIDATION_BOUNDS,
};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AppResult, IsiError};

/// Called after every successful write with the new snapshot and the group
/// that changed.
pub type ParameterListener = Arc<dyn Fn(&Parameters, ParamGroupId) + Send + Sync>;

/// Process-wide typed parameter registry with validated updates, volatile
/// groups, snapshots and persistence.
pub struct ParameterStore {
    inner: RwLock<Parameters>,
    path: PathBuf,
    listeners: Mutex<Vec<ParameterListener>>,
}

impl ParameterStore {
    /// Open the store backed by `path`, loading previously persisted values
    /// for the non-volatile groups. A missing file yields defaults; a
    /// malformed file is a structured error, never a panic.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let params = match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse_file(&text)
                .map_err(|e| IsiError::Configuration(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Parameters::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            inner: RwLock::new(params),
            path,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// In-memory store for tests; persists into the given directory.
    pub fn open_in(dir: &Path) -> AppResult<Self> {
        Self::open(dir.join("parameters.json"))
    }

    fn parse_file(text: &str) -> Result<Parameters, String> {
        let doc: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let current = doc
            .get("current")
            .ok_or_else(|| "missing 'current' object".to_string())?;
        let mut params = Parameters::default();
        for group in ParamGroupId::ALL {
            // Volatile groups carry sentinels on disk; their live values come
            // from hardware detection, not from the file.
            if group.is_volatile() {
                continue;
            }
            if let Some(value) = current.get(group.as_str()) {
                apply_group(&mut params, group, value.clone()).map_err(|e| e.to_string())?;
            }
        }
        Ok(params)
    }

    /// Register a subscriber for post-write snapshots.
    pub fn subscribe(&self, listener: impl Fn(&Parameters, ParamGroupId) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Current snapshot of every group.
    pub fn snapshot(&self) -> Parameters {
        self.inner.read().clone()
    }

    /// One group as JSON.
    pub fn get(&self, group: ParamGroupId) -> Value {
        self.inner.read().group_json(group)
    }

    /// Apply a partial update to one group.
    ///
    /// The patch is a JSON object of field-name → value. Every patched value
    /// is validated against the bounds table; unknown fields fail with
    /// `Validation`. On success the new values are persisted (volatile
    /// groups as sentinels) and every subscriber is notified.
    pub fn update(&self, group: ParamGroupId, patch: Value) -> AppResult<Parameters> {
        let patch_obj = match patch {
            Value::Object(map) => map,
            other => {
                return Err(IsiError::Validation {
                    field: group.as_str().into(),
                    reason: format!("patch must be an object, got {other}"),
                })
            }
        };

        let snapshot = {
            let mut inner = self.inner.write();
            let mut merged = match inner.group_json(group) {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            for (field, value) in patch_obj {
                validate_field(group, &field, &value)?;
                merged.insert(field, value);
            }
            let mut updated = inner.clone();
            apply_group(&mut updated, group, Value::Object(merged))?;
            validate_group(&updated, group)?;
            *inner = updated;
            inner.clone()
        };

        self.persist(&snapshot)?;
        self.notify(&snapshot, group);
        Ok(snapshot)
    }

    /// Install hardware-detected values for the volatile groups. Subscribers
    /// are notified; nothing volatile reaches the disk file.
    pub fn repopulate_volatile(
        &self,
        monitor: Option<MonitorParams>,
        camera: Option<CameraParams>,
    ) {
        let snapshot = {
            let mut inner = self.inner.write();
            if let Some(m) = monitor {
                inner.monitor = m;
            }
            if let Some(c) = camera {
                inner.camera = c;
            }
            inner.clone()
        };
        self.notify(&snapshot, ParamGroupId::Monitor);
        self.notify(&snapshot, ParamGroupId::Camera);
    }

    /// SHA-256 hex fingerprint of the stimulus-generating key set.
    pub fn fingerprint(&self) -> String {
        fingerprint::fingerprint(&self.generation_snapshot())
    }

    /// The exact `{monitor, stimulus}` snapshot the fingerprint covers.
    pub fn generation_snapshot(&self) -> Value {
        let inner = self.inner.read();
        json!({
            "monitor": inner.group_json(ParamGroupId::Monitor),
            "stimulus": inner.group_json(ParamGroupId::Stimulus),
        })
    }

    /// The bounds table for UI reflection, keyed `group.field`.
    pub fn bounds_json(&self) -> Value {
        bounds_json()
    }

    fn persist(&self, params: &Parameters) -> AppResult<()> {
        let mut current = serde_json::Map::new();
        let mut defaults = serde_json::Map::new();
        let default_params = Parameters::default();
        for group in ParamGroupId::ALL {
            let (cur, def) = if let Some(sentinel) = Parameters::sentinel_group_json(group) {
                (sentinel.clone(), sentinel)
            } else {
                (params.group_json(group), default_params.group_json(group))
            };
            current.insert(group.as_str().to_string(), cur);
            defaults.insert(group.as_str().to_string(), def);
        }
        let doc = json!({ "current": current, "default": defaults });

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IsiError::PersistFailed(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| IsiError::PersistFailed(e.to_string()))?;
        std::fs::write(&tmp, text).map_err(|e| IsiError::PersistFailed(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| IsiError::PersistFailed(e.to_string()))?;
        Ok(())
    }

    fn notify(&self, snapshot: &Parameters, group: ParamGroupId) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(snapshot, group);
        }
    }
}

/// The static validation-bounds table as JSON, keyed `group -> field`.
pub fn bounds_json() -> Value {
    let mut out = serde_json::Map::new();
    for group in ParamGroupId::ALL {
        let mut fields = serde_json::Map::new();
        for (field, bounds) in group_bounds(group) {
            fields.insert(
                field.to_string(),
                serde_json::to_value(bounds).unwrap_or(Value::Null),
            );
        }
        if !fields.is_empty() {
            out.insert(group.as_str().to_string(), Value::Object(fields));
        }
    }
    Value::Object(out)
}

fn apply_group(params: &mut Parameters, group: ParamGroupId, value: Value) -> AppResult<()> {
    let invalid = |e: serde_json::Error| IsiError::Validation {
        field: group.as_str().into(),
        reason: e.to_string(),
    };
    match group {
        ParamGroupId::Monitor => params.monitor = serde_json::from_value(value).map_err(invalid)?,
        ParamGroupId::Stimulus => {
            params.stimulus = serde_json::from_value(value).map_err(invalid)?
        }
        ParamGroupId::Camera => params.camera = serde_json::from_value(value).map_err(invalid)?,
        ParamGroupId::Acquisition => {
            params.acquisition = serde_json::from_value(value).map_err(invalid)?
        }
        ParamGroupId::Analysis => {
            params.analysis = serde_json::from_value(value).map_err(invalid)?
        }
        ParamGroupId::Session => params.session = serde_json::from_value(value).map_err(invalid)?,
    }
    Ok(())
}

fn validate_field(group: ParamGroupId, field: &str, value: &Value) -> AppResult<()> {
    if let Some(bounds) = field_bounds(group, field) {
        let v = value.as_f64().ok_or_else(|| IsiError::Validation {
            field: format!("{group}.{field}"),
            reason: format!("expected a number, got {value}"),
        })?;
        if !v.is_finite() || v < bounds.min || v > bounds.max {
            return Err(IsiError::Validation {
                field: format!("{group}.{field}"),
                reason: format!("{v} outside [{}, {}]", bounds.min, bounds.max),
            });
        }
    }
    Ok(())
}

/// Cross-field checks that a per-field bounds table cannot express.
fn validate_group(params: &Parameters, group: ParamGroupId) -> AppResult<()> {
    if group == ParamGroupId::Acquisition {
        if params.acquisition.directions.is_empty() {
            return Err(IsiError::Validation {
                field: "acquisition.directions".into(),
                reason: "at least one direction is required".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for d in &params.acquisition.directions {
            if !seen.insert(*d) {
                return Err(IsiError::Validation {
                    field: "acquisition.directions".into(),
                    reason: format!("direction {d} listed twice"),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> (tempfile::TempDir, ParameterStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ParameterStore::open_in(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_update_and_snapshot() {
        let (_dir, store) = store();
        store
            .update(ParamGroupId::Stimulus, json!({ "bar_width_deg": 15.0 }))
            .unwrap();
        assert_eq!(store.snapshot().stimulus.bar_width_deg, 15.0);
    }

    #[test]
    fn test_out_of_bounds_write_fails() {
        let (_dir, store) = store();
        let err = store
            .update(ParamGroupId::Stimulus, json!({ "contrast": 1.5 }))
            .unwrap_err();
        assert_eq!(err.code(), "validation_failed");
        // Value unchanged after a failed write.
        assert_eq!(store.snapshot().stimulus.contrast, 1.0);
    }

    #[test]
    fn test_unknown_field_fails() {
        let (_dir, store) = store();
        assert!(store
            .update(ParamGroupId::Stimulus, json!({ "sparkle": 1.0 }))
            .is_err());
    }

    #[test]
    fn test_duplicate_directions_fail() {
        let (_dir, store) = store();
        assert!(store
            .update(
                ParamGroupId::Acquisition,
                json!({ "directions": ["LR", "LR"] })
            )
            .is_err());
    }

    #[test]
    fn test_every_write_notifies_subscribers() {
        let (_dir, store) = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        store.subscribe(move |_, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        store
            .update(ParamGroupId::Session, json!({ "session_name": "t1" }))
            .unwrap();
        store
            .update(ParamGroupId::Acquisition, json!({ "cycles": 3 }))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_volatile_groups_persist_as_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParameterStore::open_in(dir.path()).unwrap();
        store.repopulate_volatile(
            Some(MonitorParams::default()),
            Some(CameraParams {
                device_id: "mock-0".into(),
                ..CameraParams::default()
            }),
        );
        // Any write persists the whole document.
        store
            .update(ParamGroupId::Session, json!({ "session_name": "x" }))
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("parameters.json")).unwrap();
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["current"]["camera"]["camera_fps"], json!(-1.0));
        assert_eq!(doc["current"]["camera"]["device_id"], json!(""));
        assert_eq!(doc["current"]["monitor"]["monitor_fps"], json!(-1.0));
        // Live values are untouched by persistence.
        assert_eq!(store.snapshot().camera.device_id, "mock-0");
    }

    #[test]
    fn test_reload_restores_non_volatile_groups() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ParameterStore::open_in(dir.path()).unwrap();
            store
                .update(ParamGroupId::Acquisition, json!({ "cycles": 7 }))
                .unwrap();
        }
        let store = ParameterStore::open_in(dir.path()).unwrap();
        assert_eq!(store.snapshot().acquisition.cycles, 7);
        // Volatile groups came back as defaults, not sentinels.
        assert!(store.snapshot().monitor.monitor_fps > 0.0);
    }

    #[test]
    fn test_malformed_file_is_a_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ParameterStore::open(&path).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_generating_keys_only() {
        let (_dir, store) = store();
        let before = store.fingerprint();
        store
            .update(ParamGroupId::Session, json!({ "notes": "irrelevant" }))
            .unwrap();
        assert_eq!(store.fingerprint(), before);
        store
            .update(ParamGroupId::Stimulus, json!({ "bar_width_deg": 12.0 }))
            .unwrap();
        assert_ne!(store.fingerprint(), before);
    }
}

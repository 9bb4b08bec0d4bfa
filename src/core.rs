//! Application assembly and command dispatch.
//!
//! [`App`] constructs every component at startup and hands explicit
//! references into the orchestrator, engine, and analysis constructors;
//! there is no service registry and no ambient global state. It also owns
//! the single command dispatcher: every external command goes through
//! [`App::handle_command`], which returns the direct reply event (errors
//! included) while broadcast events flow through the shared [`EventBus`].

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::acquisition::orchestrator::{ensure_library, Orchestrator, OrchestratorDeps};
use crate::analysis::AnalysisHandle;
use crate::bus::SharedFrameBus;
use crate::camera;
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{AppResult, IsiError};
use crate::messages::{Command, Event, EventBus};
use crate::params::{MonitorParams, ParamGroupId, ParameterStore};
use crate::stimulus::library::{LibrarySlot, StimulusLibrary};

/// The assembled application.
pub struct App {
    settings: Settings,
    store: Arc<ParameterStore>,
    library: Arc<LibrarySlot>,
    bus: Arc<SharedFrameBus>,
    sync: Arc<crate::sync::SyncTracker>,
    events: EventBus,
    orchestrator: Orchestrator,
    analysis: AnalysisHandle,
}

/// Display detection for the volatile `monitor` group.
///
/// There is no portable display-probing API in scope here; the development
/// fallback reports the defaults and a deployment substitutes its own
/// detection at this one seam.
fn detect_monitor_params() -> MonitorParams {
    MonitorParams::default()
}

impl App {
    /// Build every component, detect hardware, and wire the subscriptions.
    pub fn new(settings: Settings) -> AppResult<Self> {
        std::fs::create_dir_all(settings.sessions_dir())?;
        std::fs::create_dir_all(&settings.library_dir)?;
        std::fs::create_dir_all(&settings.shm_dir)?;

        let events = EventBus::new();
        let clock = Clock::monotonic();

        let store = Arc::new(ParameterStore::open(&settings.parameter_file)?);
        store.repopulate_volatile(Some(detect_monitor_params()), camera::detect_camera_params());

        // The camera ring must fit the largest frame any enumerated device
        // can deliver.
        let max_frame_bytes = camera::enumerate()
            .iter()
            .map(|info| {
                let w = info.widths.iter().copied().max().unwrap_or(640) as usize;
                let h = info.heights.iter().copied().max().unwrap_or(480) as usize;
                w * h * 4
            })
            .max()
            .unwrap_or(640 * 480 * 4);
        let bus = Arc::new(SharedFrameBus::create(
            &settings.shm_dir,
            settings.bus_slots,
            max_frame_bytes,
        )?);

        let sync = Arc::new(crate::sync::SyncTracker::new(clock.clone()));
        let library = Arc::new(LibrarySlot::new());

        // Any write to a stimulus-generating group invalidates the library;
        // every successful write broadcasts the new snapshot.
        {
            let library = Arc::clone(&library);
            let events_for_store = events.clone();
            store.subscribe(move |snapshot, group| {
                if group.affects_stimulus() {
                    library.clear();
                }
                events_for_store.emit(Event::ParametersSnapshot {
                    parameters: snapshot.clone(),
                    bounds: crate::params::bounds_json(),
                });
            });
        }

        let orchestrator = Orchestrator::new(OrchestratorDeps {
            settings: settings.clone(),
            store: Arc::clone(&store),
            library: Arc::clone(&library),
            bus: Arc::clone(&bus),
            sync: Arc::clone(&sync),
            clock,
            events: events.clone(),
        })?;

        let analysis = AnalysisHandle::new(events.clone());

        tracing::info!("application assembled");
        Ok(Self {
            settings,
            store,
            library,
            bus,
            sync,
            events,
            orchestrator,
            analysis,
        })
    }

    /// The broadcast event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The parameter store (tests and embedding shells).
    pub fn store(&self) -> &Arc<ParameterStore> {
        &self.store
    }

    /// The shared frame bus (preview readers).
    pub fn bus(&self) -> &Arc<SharedFrameBus> {
        &self.bus
    }

    /// The acquisition orchestrator.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The analysis worker handle.
    pub fn analysis(&self) -> &AnalysisHandle {
        &self.analysis
    }

    /// Execute one command, returning its direct reply. Failures come back
    /// as [`Event::Error`]; the process is never taken down by a command.
    pub fn handle_command(&self, command: Command) -> Event {
        match self.dispatch(command) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(code = err.code(), error = %err, "command failed");
                Event::from_error(&err)
            }
        }
    }

    fn dispatch(&self, command: Command) -> AppResult<Event> {
        match command {
            Command::UpdateParameters { group, patch } => {
                let id: ParamGroupId = group.parse()?;
                let snapshot = self.store.update(id, patch)?;
                Ok(Event::ParametersSnapshot {
                    parameters: snapshot,
                    bounds: self.store.bounds_json(),
                })
            }
            Command::GetParameters { group: _ } => Ok(Event::ParametersSnapshot {
                parameters: self.store.snapshot(),
                bounds: self.store.bounds_json(),
            }),
            Command::PreGenerateStimulus { directions } => {
                let directions = directions
                    .unwrap_or_else(|| self.store.snapshot().acquisition.directions);
                let cancel = AtomicBool::new(false);
                let library = ensure_library(
                    &self.store,
                    &self.library,
                    &self.events,
                    &self.settings.library_dir,
                    &directions,
                    &cancel,
                )?;
                Ok(Event::LibraryReady {
                    directions: library.materialized_directions(),
                    total_frames: library.total_frames(),
                    fingerprint: library.fingerprint().to_string(),
                })
            }
            Command::SaveStimulusLibrary { path } => {
                let library = self.library.get().ok_or(IsiError::LibraryNotLoaded)?;
                let target = path.unwrap_or_else(|| self.settings.library_dir.clone());
                library.save(&target)?;
                Ok(Event::Ack)
            }
            Command::LoadStimulusLibrary { path, force } => {
                let source = path.unwrap_or_else(|| self.settings.library_dir.clone());
                let library = StimulusLibrary::load(
                    &source,
                    &self.store.generation_snapshot(),
                    &self.store.fingerprint(),
                    force.unwrap_or(false),
                )?;
                let library = Arc::new(library);
                self.library.install(Arc::clone(&library));
                Ok(Event::LibraryReady {
                    directions: library.materialized_directions(),
                    total_frames: library.total_frames(),
                    fingerprint: library.fingerprint().to_string(),
                })
            }
            Command::StartAcquisition { mode } => {
                self.orchestrator.start(mode)?;
                Ok(Event::Ack)
            }
            Command::StopAcquisition => {
                self.orchestrator.stop()?;
                Ok(Event::Ack)
            }
            Command::CaptureAnatomical => {
                self.orchestrator.capture_anatomical()?;
                Ok(Event::Ack)
            }
            Command::StartAnalysis { session_path } => {
                let params = self.store.snapshot().analysis;
                self.analysis.start(session_path, params)?;
                Ok(Event::Ack)
            }
            Command::GetAnalysisStatus => {
                let status = self.analysis.status();
                Ok(Event::AnalysisProgress {
                    stage: status.stage,
                    fraction: status.fraction,
                })
            }
            Command::GetSyncData { window_s } => Ok(Event::SyncSampleHistogram {
                snapshot: self.sync.snapshot(window_s),
            }),
            Command::GetSystemState => {
                let state = self.orchestrator.system_state();
                Ok(Event::SystemState {
                    state: state.state,
                    mode: state.mode,
                    last_fault: state.last_fault,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app() -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_root: dir.path().join("data"),
            library_dir: dir.path().join("data/stimulus_library"),
            shm_dir: dir.path().join("shm"),
            parameter_file: dir.path().join("parameters.json"),
            bus_slots: 4,
            recorder_queue_secs: 2.0,
        };
        let app = App::new(settings).unwrap();
        (dir, app)
    }

    #[test]
    fn test_update_parameters_round_trip() {
        let (_dir, app) = app();
        let reply = app.handle_command(Command::UpdateParameters {
            group: "stimulus".into(),
            patch: json!({ "bar_width_deg": 12.0 }),
        });
        match reply {
            Event::ParametersSnapshot { parameters, bounds } => {
                assert_eq!(parameters.stimulus.bar_width_deg, 12.0);
                assert!(bounds["stimulus"]["bar_width_deg"]["min"].is_number());
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_invalid_command_returns_error_event() {
        let (_dir, app) = app();
        let reply = app.handle_command(Command::UpdateParameters {
            group: "stimulus".into(),
            patch: json!({ "contrast": 99.0 }),
        });
        match reply {
            Event::Error { code, .. } => assert_eq!(code, "validation_failed"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_parameter_change_invalidates_library() {
        let (_dir, app) = app();
        // Shrink generation so the test stays fast.
        app.handle_command(Command::UpdateParameters {
            group: "monitor".into(),
            patch: json!({ "width_px": 24, "height_px": 16, "monitor_fps": 5.0 }),
        });
        app.handle_command(Command::UpdateParameters {
            group: "stimulus".into(),
            patch: json!({ "drift_speed_deg_per_sec": 60.0 }),
        });
        let reply = app.handle_command(Command::PreGenerateStimulus {
            directions: Some(vec![crate::stimulus::Direction::LR]),
        });
        assert!(matches!(reply, Event::LibraryReady { .. }));
        assert!(app.library.is_loaded());

        // A generating-parameter write clears the slot...
        app.handle_command(Command::UpdateParameters {
            group: "stimulus".into(),
            patch: json!({ "bar_width_deg": 18.0 }),
        });
        assert!(!app.library.is_loaded());

        // ...but a non-generating write does not.
        let reply = app.handle_command(Command::PreGenerateStimulus {
            directions: Some(vec![crate::stimulus::Direction::LR]),
        });
        assert!(matches!(reply, Event::LibraryReady { .. }));
        app.handle_command(Command::UpdateParameters {
            group: "session".into(),
            patch: json!({ "notes": "n" }),
        });
        assert!(app.library.is_loaded());
    }

    #[test]
    fn test_system_state_and_sync_queries() {
        let (_dir, app) = app();
        match app.handle_command(Command::GetSystemState) {
            Event::SystemState { state, .. } => assert!(state.is_idle()),
            other => panic!("unexpected reply {other:?}"),
        }
        match app.handle_command(Command::GetSyncData { window_s: None }) {
            Event::SyncSampleHistogram { snapshot } => assert_eq!(snapshot.stats.count, 0),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_stop_when_idle_is_an_error() {
        let (_dir, app) = app();
        match app.handle_command(Command::StopAcquisition) {
            Event::Error { code, .. } => assert_eq!(code, "acquisition_idle"),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}

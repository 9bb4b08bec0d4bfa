//! Command and event schema of the external interface.
//!
//! The rig is driven by typed commands and answers with typed events; both
//! serialize as single JSON objects tagged by `type`. The transport framing
//! (stdin/stdout lines in the bundled binary, sockets in a deployment) is
//! deliberately not part of this schema.
//!
//! Events flow through the [`EventBus`]: any number of subscribers, each
//! with a bounded queue. A subscriber that stops draining loses events
//! rather than stalling the producer.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::acquisition::{AcqState, AcquisitionMode};
use crate::params::Parameters;
use crate::stimulus::library::LibraryProgress;
use crate::stimulus::Direction;
use crate::sync::SyncSnapshot;

/// Queue depth per event subscriber.
const SUBSCRIBER_QUEUE: usize = 256;

/// Commands accepted by the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    UpdateParameters {
        group: String,
        patch: Value,
    },
    GetParameters {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    PreGenerateStimulus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directions: Option<Vec<Direction>>,
    },
    SaveStimulusLibrary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    LoadStimulusLibrary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        force: Option<bool>,
    },
    StartAcquisition {
        mode: AcquisitionMode,
    },
    StopAcquisition,
    CaptureAnatomical,
    StartAnalysis {
        session_path: PathBuf,
    },
    GetAnalysisStatus,
    GetSyncData {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_s: Option<f64>,
    },
    GetSystemState,
}

/// Events emitted by the core: both broadcasts and direct command replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Acknowledges a command with no payload to return.
    Ack,
    ParametersSnapshot {
        parameters: Parameters,
        /// Validation bounds table for UI reflection.
        bounds: Value,
    },
    LibraryProgress(LibraryProgress),
    LibraryReady {
        directions: Vec<Direction>,
        total_frames: usize,
        fingerprint: String,
    },
    SystemState {
        state: AcqState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<AcquisitionMode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_fault: Option<String>,
    },
    AcquisitionProgress {
        direction: Direction,
        cycle: u32,
        frame: u64,
    },
    SyncSampleHistogram {
        snapshot: SyncSnapshot,
    },
    SessionComplete {
        path: PathBuf,
        partial: bool,
    },
    AnalysisProgress {
        stage: String,
        fraction: f64,
    },
    AnalysisComplete {
        output_path: PathBuf,
        num_areas: usize,
    },
    AnalysisError {
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Event {
    /// Build the error event for a failed command.
    pub fn from_error(err: &crate::error::IsiError) -> Self {
        Event::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Multi-subscriber event fan-out with per-subscriber bounded queues.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Broadcast an event. Full subscriber queues drop this event for that
    /// subscriber; disconnected subscribers are removed.
    pub fn emit(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                tracing::debug!("event dropped for slow subscriber");
                true
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }
}

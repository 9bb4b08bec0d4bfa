//! Acquisition control: modes, states, engine and orchestrator.

pub mod engine;
pub mod orchestrator;

use serde::{Deserialize, Serialize};

use crate::stimulus::Direction;

/// How a run uses the captured frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Live view only; nothing touches disk.
    Preview,
    /// Full session recording.
    Record,
    /// Replay a recorded session through the preview path.
    Playback,
}

/// Orchestrator state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AcqState {
    Idle,
    Preparing,
    Baseline,
    StimulusCycle { direction: Direction, cycle: u32 },
    Between,
    Finalizing,
    Cancelling,
}

impl AcqState {
    pub fn is_idle(self) -> bool {
        matches!(self, AcqState::Idle)
    }
}

/// Snapshot returned by `get_system_state`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub state: AcqState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AcquisitionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<String>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            state: AcqState::Idle,
            mode: None,
            last_fault: None,
        }
    }
}

//! Stimulus generation and the pre-generated frame library.
//!
//! The visual stimulus is a bar of counter-phase checkerboard swept across
//! the animal's visual field in one of four directions. Frames are rendered
//! ahead of an acquisition run by [`generator`] (CPU reference renderer, with
//! an optional GPU compute backend behind the `gpu` feature), collected into
//! a [`library::StimulusLibrary`], and served to the acquisition engine by
//! index during the run.

pub mod generator;
pub mod geometry;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod library;

use serde::{Deserialize, Serialize};

/// Sweep direction of the stimulus bar across the visual field.
///
/// `RL` and `BT` are defined as exact time-reversals of `LR` and `TB`; the
/// library only materializes the forward sweeps and serves the reversed ones
/// as index-reversed views.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Left-to-right azimuth sweep.
    LR,
    /// Right-to-left azimuth sweep (reverse of `LR`).
    RL,
    /// Top-to-bottom elevation sweep.
    TB,
    /// Bottom-to-top elevation sweep (reverse of `TB`).
    BT,
}

impl Direction {
    /// All four directions in the rig's stable iteration order.
    pub const ALL: [Direction; 4] = [Direction::LR, Direction::RL, Direction::TB, Direction::BT];

    /// The direction sweeping the same axis the opposite way.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::LR => Direction::RL,
            Direction::RL => Direction::LR,
            Direction::TB => Direction::BT,
            Direction::BT => Direction::TB,
        }
    }

    /// The forward direction whose frames back this one.
    pub fn materialized(self) -> Direction {
        match self {
            Direction::LR | Direction::RL => Direction::LR,
            Direction::TB | Direction::BT => Direction::TB,
        }
    }

    /// True for the time-reversed view directions.
    pub fn is_reversed(self) -> bool {
        matches!(self, Direction::RL | Direction::BT)
    }

    /// True for azimuth (horizontal) sweeps.
    pub fn is_azimuth(self) -> bool {
        matches!(self, Direction::LR | Direction::RL)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::LR => "LR",
            Direction::RL => "RL",
            Direction::TB => "TB",
            Direction::BT => "BT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = crate::error::IsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LR" => Ok(Direction::LR),
            "RL" => Ok(Direction::RL),
            "TB" => Ok(Direction::TB),
            "BT" => Ok(Direction::BT),
            other => Err(crate::error::IsiError::Validation {
                field: "direction".into(),
                reason: format!("unknown direction '{other}'"),
            }),
        }
    }
}

/// Header carried with every stimulus frame through the shared bus and into
/// the per-session event files.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StimulusHeader {
    pub direction: Direction,
    /// Index into the direction's frame sequence.
    pub frame_index: u64,
    /// Instantaneous azimuth (LR/RL) or elevation (TB/BT) of the bar center.
    pub bar_angle_deg: f64,
    /// Presentation timestamp; equal to the camera timestamp in
    /// camera-triggered mode.
    pub timestamp_us: u64,
}

/// One rendered stimulus frame: grayscale pixels plus its header.
#[derive(Clone, Debug)]
pub struct StimulusFrame {
    pub header: StimulusHeader,
    /// `height x width` grayscale pixels.
    pub image: ndarray::Array2<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_round_trip() {
        for d in Direction::ALL {
            let s = d.to_string();
            assert_eq!(s.parse::<Direction>().unwrap(), d);
            assert_eq!(d.opposite().opposite(), d);
        }
    }

    #[test]
    fn test_materialized_directions() {
        assert_eq!(Direction::RL.materialized(), Direction::LR);
        assert_eq!(Direction::BT.materialized(), Direction::TB);
        assert!(Direction::RL.is_reversed());
        assert!(!Direction::TB.is_reversed());
        assert!(Direction::LR.is_azimuth());
        assert!(!Direction::BT.is_azimuth());
    }

    #[test]
    fn test_direction_serde_uses_bare_names() {
        let json = serde_json::to_string(&Direction::TB).unwrap();
        assert_eq!(json, "\"TB\"");
        let parsed: Direction = serde_json::from_str("\"BT\"").unwrap();
        assert_eq!(parsed, Direction::BT);
    }
}

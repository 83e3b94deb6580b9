//! Controller state

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating mode of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PidMode {
    #[default]
    Off,
    Manual,
    RampSoak,
    BackgroundFollow,
    Autotune,
}

impl PidMode {
    /// Mode selected by `pidmode(n)`
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(PidMode::Manual),
            1 => Some(PidMode::RampSoak),
            2 => Some(PidMode::BackgroundFollow),
            _ => None,
        }
    }

    /// Modes a controller can be switched on into
    pub fn is_on_mode(&self) -> bool {
        matches!(
            self,
            PidMode::Manual | PidMode::RampSoak | PidMode::BackgroundFollow
        )
    }
}

impl fmt::Display for PidMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PidMode::Off => "OFF",
            PidMode::Manual => "MANUAL",
            PidMode::RampSoak => "RAMP_SOAK",
            PidMode::BackgroundFollow => "BACKGROUND_FOLLOW",
            PidMode::Autotune => "AUTOTUNE",
        })
    }
}

/// Last known controller state; only changed after the device accepted a write
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PidState {
    pub sv: f64,
    pub pv: Option<f64>,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    /// Active ramp/soak segment
    pub segment: Option<usize>,
    pub mode: PidMode,
    pub on: bool,
    pub standby: bool,
    /// Active SV slot, 1-based
    pub sv_slot: u8,
}

impl PidState {
    pub fn new() -> Self {
        Self {
            sv_slot: 1,
            ..Self::default()
        }
    }
}

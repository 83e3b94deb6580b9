//! PID controllers
//!
//! Families, ramp/soak sequencing and the controller state machine.

pub mod controller;
pub mod family;
pub mod ramp_soak;
pub mod state;

pub use crate::error::PidError;
pub use controller::{PidConfig, PidController};
pub use family::{PidFamily, RegisterMap, TimeFormat};
pub use ramp_soak::{BackgroundProfile, EndMode, RampSoakProgram, RampSoakSegment, RampSoakStep};
pub use state::{PidMode, PidState};

//! Roast Alarms
//!
//! Alarm table evaluation and the command language shared by alarms, event
//! buttons and sliders.
//!
//! - **Events**: samples and the roast-phase event times (CHARGE, FCs, ...)
//!   that alarms are anchored to, including the development time ratio
//! - **Rules**: the persisted alarm table (JSON or CSV)
//! - **Engine**: top-to-bottom, one-shot evaluation per sample
//! - **Command**: parser and placeholder substitution for command strings
//!
//! Nothing in this crate performs I/O on devices; triggers and parsed
//! commands are handed to the dispatcher of the service.

pub mod command;
pub mod engine;
mod error;
pub mod events;
pub mod rules;

pub use command::{parse_commands, parse_with, substitute, Bindings, Command};
pub use engine::{AlarmEngine, AlarmTrigger, RorTracker, DEFAULT_ROR_WINDOW};
pub use error::{AlarmError, Result};
pub use events::{RoastEvent, RoastEvents, Sample};
pub use rules::{
    ActionKind, AlarmAnchor, AlarmRow, AlarmRule, AlarmSource, AlarmTable, Condition,
};

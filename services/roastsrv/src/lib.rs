//! Roast device service
//!
//! Talks to roaster hardware over Modbus (RTU, ASCII, binary, TCP and UDP),
//! Siemens S7 and line-based serial meters, samples every configured
//! channel on a fixed interval, drives PID controllers and ramp/soak
//! programs, and evaluates the alarm table against each sample.
//!
//! ```text
//! ┌────────────┐   ┌────────────────┐   ┌──────────────┐
//! │  Sampler   │──►│ DeviceRegistry │──►│ LinkManager  │── serial / TCP / UDP
//! └────────────┘   └────────────────┘   └──────────────┘
//!       │                   ▲
//!       ▼                   │
//! ┌────────────┐   ┌────────────────┐   ┌──────────────┐
//! │AlarmEngine │──►│   Dispatcher   │──►│PidController │
//! └────────────┘   └────────────────┘   └──────────────┘
//! ```
//!
//! [`RoastSession`] owns all of it and runs the loop.

pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod pid;
pub mod sampling;
pub mod session;

pub use config::RoastConfig;
pub use devices::{DeviceChannel, DeviceRegistry, LinkOptions, TemperatureUnit};
pub use dispatcher::{Context, Dispatcher, UiEvent};
pub use error::{DispatchError, PidError, RegistryError, Result, RoastError};
pub use pid::{PidConfig, PidController, PidFamily, PidMode};
pub use sampling::{ChannelSink, JsonLinesSink, SampleSink, Sampler};
pub use session::{RoastSession, SessionCommand, SessionHandle};

//! Roast Communication Link Library
//!
//! Byte-level channels to roasting hardware.
//!
//! # Architecture
//!
//! - **Transport**: `Transport` trait with serial, TCP and UDP implementations
//!   plus a scriptable `MockTransport` for tests
//! - **Config**: `TransportConfig`, the immutable port settings a link is built from
//! - **Clock**: `Clock` trait so retry delays and scheduling can run on virtual time

pub mod clock;
pub mod config;
pub mod error;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Parity, TransportConfig, TransportKind};
pub use error::{Result, TransportError};
pub use transport::{
    create_transport, ConnectionState, MockHandle, MockTransport, Transport, TransportStats,
};

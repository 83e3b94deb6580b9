//! Roast Protocols
//!
//! Wire formats spoken by roasting hardware and the link manager that owns
//! one transport per physical channel.
//!
//! - **Frame codecs**: Modbus RTU/ASCII/Binary/TCP/UDP, Siemens S7 over
//!   ISO-on-TCP, and command/reply meter families (TC4, Center 30x).
//!   Encoders and decoders are pure functions over byte slices.
//! - **Value decoding**: register/byte layouts to engineering values
//!   (int/uint 16/32, float32, BCD, bit) with byte and word order.
//! - **Link manager**: one request in flight per link, bounded retries on an
//!   injected clock, and one-shot "communication error/resumed" reporting.

pub mod codec;
pub mod error;
pub mod link;
pub mod modbus;
pub mod s7;
pub mod serial_cmd;
pub mod value;

pub use codec::{Codec, FrameStatus, Protocol, Request, Response};
pub use error::{FrameError, LinkError};
pub use link::{with_retries, LinkEvent, LinkManager, LinkState, RetryError};
pub use modbus::slave::ModbusSlave;
pub use modbus::{ModbusAddress, ModbusOp, ModbusRequest, ModbusResponse, RegisterTable};
pub use s7::{S7Area, S7Request, S7Response, S7Type};
pub use serial_cmd::{SerialCommand, SerialCommandFamily, SerialReply};
pub use value::{ByteOrder, DecodeKind, WordOrder};

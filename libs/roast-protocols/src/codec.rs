//! Protocol dispatch for a link
//!
//! A `Codec` is the per-link framing state (transaction counter, S7 PDU
//! reference) in front of the pure encode/decode functions of each family.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FrameError, LinkError};
use crate::modbus::{ascii, binary, rtu, tcp, ModbusRequest, ModbusResponse};
use crate::s7::{self, S7Request, S7Response};
use crate::serial_cmd::{SerialCommand, SerialCommandFamily, SerialReply};

/// Result of scanning the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Keep reading
    Incomplete,
    /// A frame of this many bytes sits at the start of the buffer
    Complete(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Modbus(ModbusRequest),
    S7(S7Request),
    Serial(SerialCommand),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Modbus(_) => "Modbus request",
            Request::S7(_) => "S7 request",
            Request::Serial(_) => "serial command",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Modbus(ModbusResponse),
    S7(S7Response),
    Serial(SerialReply),
}

/// Wire protocol of a link, as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    ModbusRtu,
    ModbusAscii,
    ModbusBinary,
    ModbusTcp,
    ModbusUdp,
    S7,
    Tc4,
    Center30x,
}

impl Protocol {
    /// Fresh codec; `rack`/`slot` only matter for S7
    pub fn codec(&self, rack: u8, slot: u8) -> Codec {
        match self {
            Protocol::ModbusRtu => Codec::ModbusRtu,
            Protocol::ModbusAscii => Codec::ModbusAscii,
            Protocol::ModbusBinary => Codec::ModbusBinary,
            Protocol::ModbusTcp => Codec::ModbusTcp { transaction: 0 },
            Protocol::ModbusUdp => Codec::ModbusUdp { transaction: 0 },
            Protocol::S7 => Codec::S7(S7Session::new(rack, slot)),
            Protocol::Tc4 => Codec::Serial(SerialCommandFamily::Tc4),
            Protocol::Center30x => Codec::Serial(SerialCommandFamily::Center30x),
        }
    }
}

/// S7 connection parameters and counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Session {
    pub rack: u8,
    pub slot: u8,
    pub pdu_ref: u16,
    /// Negotiated PDU length, 0 until setup communication succeeded
    pub pdu_len: u16,
}

impl S7Session {
    pub fn new(rack: u8, slot: u8) -> Self {
        Self {
            rack,
            slot,
            pdu_ref: 0,
            pdu_len: 0,
        }
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1).max(1);
        self.pdu_ref
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    ModbusRtu,
    ModbusAscii,
    ModbusBinary,
    /// `transaction` is the id of the last request sent
    ModbusTcp { transaction: u16 },
    ModbusUdp { transaction: u16 },
    S7(S7Session),
    Serial(SerialCommandFamily),
}

impl Codec {
    /// Family name used in health log lines
    pub fn family(&self) -> &'static str {
        match self {
            Codec::ModbusRtu
            | Codec::ModbusAscii
            | Codec::ModbusBinary
            | Codec::ModbusTcp { .. }
            | Codec::ModbusUdp { .. } => "Modbus",
            Codec::S7(_) => "S7",
            Codec::Serial(family) => family.name(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::ModbusRtu => "Modbus RTU",
            Codec::ModbusAscii => "Modbus ASCII",
            Codec::ModbusBinary => "Modbus Binary",
            Codec::ModbusTcp { .. } => "Modbus TCP",
            Codec::ModbusUdp { .. } => "Modbus UDP",
            Codec::S7(_) => "S7",
            Codec::Serial(family) => family.name(),
        }
    }

    fn unsupported(&self, request: &Request) -> LinkError {
        LinkError::UnsupportedRequest {
            codec: self.name(),
            request: request.kind(),
        }
    }

    /// Encode `request`, advancing transaction/PDU counters
    pub fn encode(&mut self, request: &Request) -> Result<Vec<u8>, LinkError> {
        let unsupported = self.unsupported(request);
        let frame = match (&mut *self, request) {
            (Codec::ModbusRtu, Request::Modbus(req)) => rtu::encode_request(req)?,
            (Codec::ModbusAscii, Request::Modbus(req)) => ascii::encode_request(req)?,
            (Codec::ModbusBinary, Request::Modbus(req)) => binary::encode_request(req)?,
            (Codec::ModbusTcp { transaction }, Request::Modbus(req))
            | (Codec::ModbusUdp { transaction }, Request::Modbus(req)) => {
                *transaction = transaction.wrapping_add(1);
                tcp::encode_request(*transaction, req)?
            },
            (Codec::S7(session), Request::S7(req)) => {
                let pdu_ref = session.next_ref();
                req.encode(pdu_ref)?
            },
            (Codec::Serial(family), Request::Serial(command)) => family.encode(command)?,
            _ => return Err(unsupported),
        };
        Ok(frame)
    }

    pub fn expects_reply(&self, request: &Request) -> bool {
        match (self, request) {
            (Codec::Serial(family), Request::Serial(command)) => family.expects_reply(command),
            _ => true,
        }
    }

    pub fn frame_status(&self, request: &Request, buffer: &[u8]) -> FrameStatus {
        match (self, request) {
            (Codec::ModbusRtu, Request::Modbus(req)) => rtu::frame_status(req, buffer),
            (Codec::ModbusAscii, _) => ascii::frame_status(buffer),
            (Codec::ModbusBinary, Request::Modbus(req)) => binary::frame_status(req, buffer),
            (Codec::ModbusTcp { .. } | Codec::ModbusUdp { .. }, _) => tcp::frame_status(buffer),
            (Codec::S7(_), _) => s7::frame_status(buffer),
            (Codec::Serial(family), _) => family.frame_status(buffer),
            // Mismatched requests never get past encode
            _ => FrameStatus::Complete(buffer.len()),
        }
    }

    /// Decode the reply to the request last encoded
    pub fn decode(&self, request: &Request, frame: &[u8]) -> Result<Response, FrameError> {
        match (self, request) {
            (Codec::ModbusRtu, Request::Modbus(req)) => {
                rtu::decode_response(req, frame).map(Response::Modbus)
            },
            (Codec::ModbusAscii, Request::Modbus(req)) => {
                ascii::decode_response(req, frame).map(Response::Modbus)
            },
            (Codec::ModbusBinary, Request::Modbus(req)) => {
                binary::decode_response(req, frame).map(Response::Modbus)
            },
            (Codec::ModbusTcp { transaction }, Request::Modbus(req))
            | (Codec::ModbusUdp { transaction }, Request::Modbus(req)) => {
                tcp::decode_response(*transaction, req, frame).map(Response::Modbus)
            },
            (Codec::S7(session), Request::S7(req)) => {
                if let Some(reference) = frame.get(11..13) {
                    let actual = u16::from_be_bytes([reference[0], reference[1]]);
                    if actual != session.pdu_ref {
                        return Err(FrameError::TransactionMismatch {
                            expected: session.pdu_ref,
                            actual,
                        });
                    }
                }
                req.decode_response(frame).map(Response::S7)
            },
            (Codec::Serial(family), Request::Serial(_)) => {
                family.decode(frame).map(Response::Serial)
            },
            _ => Err(FrameError::malformed(format!(
                "{} cannot decode a reply to a {}",
                self.name(),
                request.kind()
            ))),
        }
    }

    /// Frames to exchange right after the transport opens
    pub fn handshake(&mut self) -> Vec<Vec<u8>> {
        match self {
            Codec::S7(session) => {
                session.pdu_len = 0;
                let setup = s7::setup_communication(session.next_ref());
                vec![s7::connection_request(session.rack, session.slot), setup]
            },
            _ => Vec::new(),
        }
    }

    /// Framing of handshake replies
    pub fn handshake_status(&self, buffer: &[u8]) -> FrameStatus {
        s7::frame_status(buffer)
    }

    /// Check the reply to handshake frame `step`
    pub fn accept_handshake(&mut self, step: usize, reply: &[u8]) -> Result<(), FrameError> {
        match (self, step) {
            (Codec::S7(_), 0) => s7::check_connection_confirm(reply),
            (Codec::S7(session), _) => {
                session.pdu_len = s7::parse_setup_ack(reply)?;
                debug!("S7 PDU length negotiated: {}", session.pdu_len);
                Ok(())
            },
            _ => Ok(()),
        }
    }
}

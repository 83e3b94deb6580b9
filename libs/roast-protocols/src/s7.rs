//! Siemens S7 over ISO-on-TCP
//!
//! Every frame is `TPKT(4) | COTP(3) | S7 header | parameters | data`.
//! Connecting takes two exchanges: a COTP connection request carrying the
//! rack/slot TSAP, then an S7 "setup communication" that negotiates the PDU
//! size. Read/write var jobs address one item: area + DB + start byte + bit.
//! Payloads are big-endian.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::codec::FrameStatus;
use crate::error::FrameError;

const TPKT_VERSION: u8 = 0x03;
const TPKT_LEN: usize = 4;
const COTP_DT: [u8; 3] = [0x02, 0xF0, 0x80];
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FUNC_READ_VAR: u8 = 0x04;
const FUNC_WRITE_VAR: u8 = 0x05;
const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;

/// Transport size in the request item
const TS_BIT: u8 = 0x01;
const TS_BYTE: u8 = 0x02;
/// Transport size in the data section
const DATA_TS_BIT: u8 = 0x03;
const DATA_TS_BYTE: u8 = 0x04;

const RETURN_OK: u8 = 0xFF;

/// Start of the parameter block in an ack-data frame
const ACK_PARAMS: usize = TPKT_LEN + 3 + 12;
/// Start of the first data item in an ack-data frame
const ACK_DATA: usize = ACK_PARAMS + 2;

/// Largest payload one item may carry with the default 240 byte PDU
pub const MAX_ITEM_BYTES: u16 = 222;

/// Memory area addressed by a read/write item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum S7Area {
    /// Process inputs (I / PE)
    #[serde(alias = "pe", alias = "i")]
    Inputs,
    /// Process outputs (Q / PA)
    #[serde(alias = "pa", alias = "q")]
    Outputs,
    /// Merker / flags (M / MK)
    #[serde(alias = "mk", alias = "m")]
    Flags,
    /// Data block
    #[serde(alias = "db")]
    DataBlock,
}

impl S7Area {
    pub fn code(&self) -> u8 {
        match self {
            S7Area::Inputs => 0x81,
            S7Area::Outputs => 0x82,
            S7Area::Flags => 0x83,
            S7Area::DataBlock => 0x84,
        }
    }
}

/// One read or write var job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S7Request {
    Read {
        area: S7Area,
        db: u16,
        start: u32,
        size: u16,
    },
    ReadBit {
        area: S7Area,
        db: u16,
        start: u32,
        bit: u8,
    },
    Write {
        area: S7Area,
        db: u16,
        start: u32,
        data: Vec<u8>,
    },
    WriteBit {
        area: S7Area,
        db: u16,
        start: u32,
        bit: u8,
        value: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S7Response {
    /// Payload of a read; one byte holding 0/1 for a bit read
    Data(Vec<u8>),
    WriteAck,
}

impl S7Response {
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            S7Response::Data(data) => Some(data),
            S7Response::WriteAck => None,
        }
    }
}

/// Value types of the S7 data model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum S7Type {
    Bool,
    Byte,
    #[default]
    Int,
    Word,
    DInt,
    DWord,
    Real,
}

impl S7Type {
    /// Bytes read for one value
    pub fn size(&self) -> u16 {
        match self {
            S7Type::Bool | S7Type::Byte => 1,
            S7Type::Int | S7Type::Word => 2,
            S7Type::DInt | S7Type::DWord | S7Type::Real => 4,
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<f64, FrameError> {
        let needed = self.size() as usize;
        if data.len() < needed {
            return Err(FrameError::short(needed, data.len()));
        }
        let d = data;
        Ok(match self {
            S7Type::Bool => {
                if d[0] & 0x01 != 0 {
                    1.0
                } else {
                    0.0
                }
            },
            S7Type::Byte => f64::from(d[0]),
            S7Type::Int => f64::from(i16::from_be_bytes([d[0], d[1]])),
            S7Type::Word => f64::from(u16::from_be_bytes([d[0], d[1]])),
            S7Type::DInt => f64::from(i32::from_be_bytes([d[0], d[1], d[2], d[3]])),
            S7Type::DWord => f64::from(u32::from_be_bytes([d[0], d[1], d[2], d[3]])),
            S7Type::Real => {
                let value = f32::from_be_bytes([d[0], d[1], d[2], d[3]]);
                if !value.is_finite() {
                    return Err(FrameError::s7(format!("non-finite REAL {value}")));
                }
                f64::from(value)
            },
        })
    }

    /// Big-endian encoding for a write; integers are rounded
    pub fn encode(&self, value: f64) -> Result<Vec<u8>, FrameError> {
        let out_of_range = |kind| FrameError::OutOfRange { value, kind };
        if !value.is_finite() {
            return Err(out_of_range("S7 value"));
        }
        let rounded = value.round();
        let check = |min: f64, max: f64, kind| {
            if rounded < min || rounded > max {
                Err(out_of_range(kind))
            } else {
                Ok(rounded)
            }
        };
        Ok(match self {
            S7Type::Bool => vec![u8::from(value != 0.0)],
            S7Type::Byte => vec![check(0.0, 255.0, "BYTE")? as u8],
            S7Type::Int => (check(f64::from(i16::MIN), f64::from(i16::MAX), "INT")? as i16)
                .to_be_bytes()
                .to_vec(),
            S7Type::Word => {
                (check(0.0, f64::from(u16::MAX), "WORD")? as u16).to_be_bytes().to_vec()
            },
            S7Type::DInt => (check(f64::from(i32::MIN), f64::from(i32::MAX), "DINT")? as i32)
                .to_be_bytes()
                .to_vec(),
            S7Type::DWord => {
                (check(0.0, f64::from(u32::MAX), "DWORD")? as u32).to_be_bytes().to_vec()
            },
            S7Type::Real => {
                if value.abs() > f64::from(f32::MAX) {
                    return Err(out_of_range("REAL"));
                }
                (value as f32).to_be_bytes().to_vec()
            },
        })
    }
}

fn tpkt(payload_len: usize) -> Vec<u8> {
    let total = TPKT_LEN + payload_len;
    let mut frame = Vec::with_capacity(total);
    frame.put_u8(TPKT_VERSION);
    frame.put_u8(0);
    frame.put_u16(total as u16);
    frame
}

/// COTP connection request for a CPU at `rack`/`slot`
pub fn connection_request(rack: u8, slot: u8) -> Vec<u8> {
    let cotp: [u8; 18] = [
        0x11, // length indicator
        0xE0, // CR
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // calling TSAP
        0xC2, 0x02, 0x01, rack.wrapping_mul(32).wrapping_add(slot), // called TSAP
    ];
    let mut frame = tpkt(cotp.len());
    frame.put_slice(&cotp);
    frame
}

pub fn check_connection_confirm(frame: &[u8]) -> Result<(), FrameError> {
    match frame.get(5) {
        Some(&COTP_CONNECT_CONFIRM) => Ok(()),
        Some(other) => Err(FrameError::s7(format!(
            "COTP connection refused (PDU type {other:#04X})"
        ))),
        None => Err(FrameError::short(6, frame.len())),
    }
}

fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = tpkt(COTP_DT.len() + 10 + params.len() + data.len());
    frame.put_slice(&COTP_DT);
    frame.put_u8(S7_PROTOCOL_ID);
    frame.put_u8(ROSCTR_JOB);
    frame.put_u16(0);
    frame.put_u16(pdu_ref);
    frame.put_u16(params.len() as u16);
    frame.put_u16(data.len() as u16);
    frame.put_slice(params);
    frame.put_slice(data);
    frame
}

/// Setup communication job asking for a 480 byte PDU
pub fn setup_communication(pdu_ref: u16) -> Vec<u8> {
    let params = [
        FUNC_SETUP_COMMUNICATION,
        0x00,
        0x00, 0x01, // max AMQ calling
        0x00, 0x01, // max AMQ called
        0x01, 0xE0, // PDU length
    ];
    job(pdu_ref, &params, &[])
}

/// Validate an ack-data header
fn open_ack(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < ACK_PARAMS {
        return Err(FrameError::short(ACK_PARAMS, frame.len()));
    }
    if frame[7] != S7_PROTOCOL_ID {
        return Err(FrameError::s7(format!("protocol id {:#04X} is not S7", frame[7])));
    }
    if frame[8] != ROSCTR_ACK_DATA {
        return Err(FrameError::s7(format!("unexpected ROSCTR {:#04X}", frame[8])));
    }
    let (class, code) = (frame[17], frame[18]);
    if class != 0 || code != 0 {
        return Err(FrameError::s7(format!(
            "header error class {class:#04X} code {code:#04X}"
        )));
    }
    Ok(())
}

/// Negotiated PDU length from the setup communication ack
pub fn parse_setup_ack(frame: &[u8]) -> Result<u16, FrameError> {
    open_ack(frame)?;
    let pdu = frame
        .get(25..27)
        .ok_or_else(|| FrameError::short(27, frame.len()))?;
    Ok(u16::from_be_bytes([pdu[0], pdu[1]]))
}

fn item(ts: u8, count: u16, db: u16, area: S7Area, start: u32, bit: u8) -> [u8; 12] {
    let address = (start << 3) | u32::from(bit & 0x07);
    let [_, a0, a1, a2] = address.to_be_bytes();
    let [c0, c1] = count.to_be_bytes();
    let [d0, d1] = db.to_be_bytes();
    [0x12, 0x0A, 0x10, ts, c0, c1, d0, d1, area.code(), a0, a1, a2]
}

impl S7Request {
    pub fn encode(&self, pdu_ref: u16) -> Result<Vec<u8>, FrameError> {
        let mut params = Vec::with_capacity(14);
        match self {
            S7Request::Read {
                area,
                db,
                start,
                size,
            } => {
                if *size == 0 || *size > MAX_ITEM_BYTES {
                    return Err(FrameError::OutOfRange {
                        value: f64::from(*size),
                        kind: "S7 read size",
                    });
                }
                params.put_slice(&[FUNC_READ_VAR, 0x01]);
                params.put_slice(&item(TS_BYTE, *size, *db, *area, *start, 0));
                Ok(job(pdu_ref, &params, &[]))
            },
            S7Request::ReadBit {
                area,
                db,
                start,
                bit,
            } => {
                params.put_slice(&[FUNC_READ_VAR, 0x01]);
                params.put_slice(&item(TS_BIT, 1, *db, *area, *start, *bit));
                Ok(job(pdu_ref, &params, &[]))
            },
            S7Request::Write {
                area,
                db,
                start,
                data,
            } => {
                if data.is_empty() || data.len() > MAX_ITEM_BYTES as usize {
                    return Err(FrameError::OutOfRange {
                        value: data.len() as f64,
                        kind: "S7 write size",
                    });
                }
                params.put_slice(&[FUNC_WRITE_VAR, 0x01]);
                params.put_slice(&item(TS_BYTE, data.len() as u16, *db, *area, *start, 0));
                let mut payload = Vec::with_capacity(4 + data.len());
                payload.put_u8(0x00);
                payload.put_u8(DATA_TS_BYTE);
                payload.put_u16((data.len() * 8) as u16);
                payload.put_slice(data);
                Ok(job(pdu_ref, &params, &payload))
            },
            S7Request::WriteBit {
                area,
                db,
                start,
                bit,
                value,
            } => {
                params.put_slice(&[FUNC_WRITE_VAR, 0x01]);
                params.put_slice(&item(TS_BIT, 1, *db, *area, *start, *bit));
                let payload = [0x00, DATA_TS_BIT, 0x00, 0x01, u8::from(*value)];
                Ok(job(pdu_ref, &params, &payload))
            },
        }
    }

    /// Decode the ack-data reply to this request
    pub fn decode_response(&self, frame: &[u8]) -> Result<S7Response, FrameError> {
        open_ack(frame)?;
        let function = *frame
            .get(ACK_PARAMS)
            .ok_or_else(|| FrameError::short(ACK_PARAMS + 1, frame.len()))?;
        let expected = match self {
            S7Request::Read { .. } | S7Request::ReadBit { .. } => FUNC_READ_VAR,
            S7Request::Write { .. } | S7Request::WriteBit { .. } => FUNC_WRITE_VAR,
        };
        if function != expected {
            return Err(FrameError::s7(format!(
                "reply function {function:#04X} does not match request {expected:#04X}"
            )));
        }

        let return_code = *frame
            .get(ACK_DATA)
            .ok_or_else(|| FrameError::short(ACK_DATA + 1, frame.len()))?;
        if return_code != RETURN_OK {
            return Err(FrameError::s7(format!(
                "item error {return_code:#04X} ({})",
                return_code_name(return_code)
            )));
        }

        match self {
            S7Request::Write { .. } | S7Request::WriteBit { .. } => Ok(S7Response::WriteAck),
            S7Request::Read { .. } | S7Request::ReadBit { .. } => {
                let header = frame
                    .get(ACK_DATA + 1..ACK_DATA + 4)
                    .ok_or_else(|| FrameError::short(ACK_DATA + 4, frame.len()))?;
                let ts = header[0];
                let length = u16::from_be_bytes([header[1], header[2]]) as usize;
                // Length is in bits for bit/byte/int transport sizes
                let bytes = match ts {
                    0x03..=0x05 => length.div_ceil(8),
                    _ => length,
                };
                let start = ACK_DATA + 4;
                let data = frame
                    .get(start..start + bytes)
                    .ok_or_else(|| FrameError::short(start + bytes, frame.len()))?;
                Ok(S7Response::Data(data.to_vec()))
            },
        }
    }
}

fn return_code_name(code: u8) -> &'static str {
    match code {
        0x01 => "hardware fault",
        0x03 => "access denied",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown",
    }
}

/// Complete when the TPKT announced length has arrived
pub fn frame_status(buffer: &[u8]) -> FrameStatus {
    if buffer.len() < TPKT_LEN {
        return FrameStatus::Incomplete;
    }
    let total = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    if total < TPKT_LEN {
        // Broken header; hand it over so decode reports it
        return FrameStatus::Complete(buffer.len());
    }
    if buffer.len() >= total {
        FrameStatus::Complete(total)
    } else {
        FrameStatus::Incomplete
    }
}

/// Test-side helpers building PLC replies
pub mod reply {
    use super::*;

    fn ack(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut frame = tpkt(COTP_DT.len() + 12 + params.len() + data.len());
        frame.put_slice(&COTP_DT);
        frame.put_u8(S7_PROTOCOL_ID);
        frame.put_u8(ROSCTR_ACK_DATA);
        frame.put_u16(0);
        frame.put_u16(pdu_ref);
        frame.put_u16(params.len() as u16);
        frame.put_u16(data.len() as u16);
        frame.put_u16(0);
        frame.put_slice(params);
        frame.put_slice(data);
        frame
    }

    pub fn connection_confirm() -> Vec<u8> {
        let cotp = [0x09, COTP_CONNECT_CONFIRM, 0x00, 0x01, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A];
        let mut frame = tpkt(cotp.len());
        frame.put_slice(&cotp);
        frame
    }

    pub fn setup_ack(pdu_ref: u16, pdu_len: u16) -> Vec<u8> {
        let [p0, p1] = pdu_len.to_be_bytes();
        ack(
            pdu_ref,
            &[FUNC_SETUP_COMMUNICATION, 0x00, 0x00, 0x01, 0x00, 0x01, p0, p1],
            &[],
        )
    }

    pub fn read_ack(pdu_ref: u16, data: &[u8]) -> Vec<u8> {
        let mut item = vec![RETURN_OK, DATA_TS_BYTE];
        item.put_u16((data.len() * 8) as u16);
        item.put_slice(data);
        ack(pdu_ref, &[FUNC_READ_VAR, 0x01], &item)
    }

    pub fn write_ack(pdu_ref: u16) -> Vec<u8> {
        ack(pdu_ref, &[FUNC_WRITE_VAR, 0x01], &[RETURN_OK])
    }

    pub fn item_error(pdu_ref: u16, function: u8, code: u8) -> Vec<u8> {
        ack(pdu_ref, &[function, 0x01], &[code, 0x00, 0x00, 0x00])
    }
}

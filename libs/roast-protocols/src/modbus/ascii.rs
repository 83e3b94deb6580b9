//! Modbus ASCII framing
//!
//! `':' hex(unit | PDU | LRC) CR LF`, uppercase hex, LRC is the two's
//! complement of the byte sum.

use super::pdu::{ModbusOp, ModbusRequest, ModbusResponse};
use crate::codec::FrameStatus;
use crate::error::FrameError;

const START: u8 = b':';
const END: &[u8] = b"\r\n";

pub fn lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
        .wrapping_neg()
}

fn seal(slave: u8, pdu: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(pdu.len() + 2);
    body.push(slave);
    body.extend_from_slice(pdu);
    body.push(lrc(&body));

    let mut frame = Vec::with_capacity(body.len() * 2 + 3);
    frame.push(START);
    for byte in &body {
        frame.extend_from_slice(format!("{byte:02X}").as_bytes());
    }
    frame.extend_from_slice(END);
    frame
}

fn hex_value(digit: u8) -> Result<u8, FrameError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        other => Err(FrameError::malformed(format!(
            "invalid hex digit {:?} in ASCII frame",
            other as char
        ))),
    }
}

/// Strip framing, check the LRC and return `(unit, pdu)`
fn open(frame: &[u8]) -> Result<(u8, Vec<u8>), FrameError> {
    let inner = frame
        .strip_prefix(&[START])
        .ok_or_else(|| FrameError::malformed("ASCII frame does not start with ':'"))?;
    let hex = inner
        .strip_suffix(END)
        .ok_or_else(|| FrameError::malformed("ASCII frame is not CR LF terminated"))?;
    if hex.len() % 2 != 0 {
        return Err(FrameError::malformed("odd number of hex digits"));
    }

    let bytes = hex
        .chunks(2)
        .map(|pair| Ok(hex_value(pair[0])? << 4 | hex_value(pair[1])?))
        .collect::<Result<Vec<u8>, FrameError>>()?;
    if bytes.len() < 3 {
        return Err(FrameError::short(3, bytes.len()));
    }

    let (body, tail) = bytes.split_at(bytes.len() - 1);
    let computed = lrc(body);
    if computed != tail[0] {
        return Err(FrameError::LrcMismatch {
            computed,
            received: tail[0],
        });
    }
    Ok((body[0], body[1..].to_vec()))
}

pub fn encode_request(request: &ModbusRequest) -> Result<Vec<u8>, FrameError> {
    Ok(seal(request.slave, &request.op.encode_pdu()?))
}

pub fn frame_status(buffer: &[u8]) -> FrameStatus {
    match buffer.windows(END.len()).position(|w| w == END) {
        Some(index) => FrameStatus::Complete(index + END.len()),
        None => FrameStatus::Incomplete,
    }
}

pub fn decode_response(
    request: &ModbusRequest,
    frame: &[u8],
) -> Result<ModbusResponse, FrameError> {
    let (slave, pdu) = open(frame)?;
    if slave != request.slave {
        return Err(FrameError::malformed(format!(
            "reply from slave {slave}, expected {}",
            request.slave
        )));
    }
    ModbusResponse::decode_pdu(&request.op, &pdu)
}

/// Parse a request frame (slave side)
pub fn decode_request(frame: &[u8]) -> Result<ModbusRequest, FrameError> {
    let (slave, pdu) = open(frame)?;
    Ok(ModbusRequest::new(slave, ModbusOp::decode_pdu(&pdu)?))
}

/// Encode a reply frame (slave side)
pub fn encode_response(slave: u8, function: u8, response: &ModbusResponse) -> Vec<u8> {
    seal(slave, &response.encode_pdu(function))
}

/// Encode an exception reply frame (slave side)
pub fn encode_exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    seal(slave, &super::pdu::exception_pdu(function, code))
}

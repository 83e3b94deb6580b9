//! Modbus Binary framing
//!
//! `'{' unit | PDU | CRC16 '}'`; brace bytes inside the frame are sent twice.

use super::pdu::{ModbusRequest, ModbusResponse};
use super::rtu;
use crate::codec::FrameStatus;
use crate::error::FrameError;

const START: u8 = b'{';
const END: u8 = b'}';

fn escape(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(START);
    for byte in body {
        frame.push(*byte);
        if *byte == START || *byte == END {
            frame.push(*byte);
        }
    }
    frame.push(END);
    frame
}

/// Unescape from just after '{'; returns the body and the frame length
/// consumed, or `None` while the closing brace has not arrived
fn unescape(buffer: &[u8]) -> Result<Option<(Vec<u8>, usize)>, FrameError> {
    if buffer.first() != Some(&START) {
        return match buffer.first() {
            None => Ok(None),
            Some(_) => Err(FrameError::malformed("binary frame does not start with '{'")),
        };
    }

    let mut body = Vec::with_capacity(buffer.len());
    let mut index = 1;
    while index < buffer.len() {
        let byte = buffer[index];
        if byte == START || byte == END {
            match buffer.get(index + 1) {
                Some(next) if *next == byte => {
                    body.push(byte);
                    index += 2;
                    continue;
                },
                _ if byte == END => return Ok(Some((body, index + 1))),
                // First half of an escaped '{'
                None => return Ok(None),
                Some(_) => return Err(FrameError::malformed("unescaped '{' inside binary frame")),
            }
        }
        body.push(byte);
        index += 1;
    }
    Ok(None)
}

pub fn encode_request(request: &ModbusRequest) -> Result<Vec<u8>, FrameError> {
    Ok(escape(&rtu::seal(request.slave, &request.op.encode_pdu()?)))
}

pub fn frame_status(request: &ModbusRequest, buffer: &[u8]) -> FrameStatus {
    match unescape(buffer) {
        Ok(Some((body, consumed))) => {
            // A trailing '}' before the body is full may be half of a doubled data byte
            if consumed == buffer.len() && body.len() < rtu::expected_reply_len(request, &body) {
                FrameStatus::Incomplete
            } else {
                FrameStatus::Complete(consumed)
            }
        },
        Ok(None) => FrameStatus::Incomplete,
        Err(_) => FrameStatus::Complete(buffer.len()),
    }
}

pub fn decode_response(
    request: &ModbusRequest,
    frame: &[u8],
) -> Result<ModbusResponse, FrameError> {
    let (body, _) = unescape(frame)?
        .ok_or_else(|| FrameError::malformed("binary frame is not '}' terminated"))?;
    rtu::decode_response(request, &body)
}

/// Parse a request frame (slave side)
pub fn decode_request(frame: &[u8]) -> Result<ModbusRequest, FrameError> {
    let (body, _) = unescape(frame)?
        .ok_or_else(|| FrameError::malformed("binary frame is not '}' terminated"))?;
    rtu::decode_request(&body)
}

/// Encode a reply frame (slave side)
pub fn encode_response(slave: u8, function: u8, response: &ModbusResponse) -> Vec<u8> {
    escape(&rtu::encode_response(slave, function, response))
}

/// Encode an exception reply frame (slave side)
pub fn encode_exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    escape(&rtu::encode_exception(slave, function, code))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::ModbusOp;

    fn read_one() -> ModbusRequest {
        ModbusRequest::new(
            1,
            ModbusOp::ReadHoldingRegisters {
                address: 0,
                count: 1,
            },
        )
    }

    #[test]
    fn test_encode_request() {
        let frame = encode_request(&read_one()).unwrap();
        assert_eq!(
            frame,
            vec![b'{', 0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A, b'}']
        );
    }

    #[test]
    fn test_braces_are_doubled() {
        // Register value 0x7B7D is "{}" on the wire
        let reply = encode_response(1, 0x03, &ModbusResponse::Registers(vec![0x7B7D]));
        assert_eq!(&reply[..4], &[b'{', 0x01, 0x03, 0x02]);
        assert_eq!(&reply[4..8], &[b'{', b'{', b'}', b'}']);

        assert_eq!(
            frame_status(&read_one(), &reply),
            FrameStatus::Complete(reply.len())
        );
        assert_eq!(
            decode_response(&read_one(), &reply).unwrap(),
            ModbusResponse::Registers(vec![0x7B7D])
        );
    }

    #[test]
    fn test_incomplete_until_closing_brace() {
        let reply = encode_response(1, 0x03, &ModbusResponse::Registers(vec![1452]));
        assert_eq!(
            frame_status(&read_one(), &reply[..reply.len() - 1]),
            FrameStatus::Incomplete
        );
    }

    #[test]
    fn test_crc_checked() {
        let mut reply = encode_response(1, 0x03, &ModbusResponse::Registers(vec![1452]));
        reply[4] ^= 0x01;
        assert!(matches!(
            decode_response(&read_one(), &reply),
            Err(FrameError::CrcMismatch { .. })
        ));
    }
}

//! Modbus RTU framing
//!
//! `unit | PDU | CRC16` with the CRC sent low byte first.

use super::constants::{EXCEPTION_FLAG, RTU_EXCEPTION_LEN};
use super::pdu::{check_exception, ModbusOp, ModbusRequest, ModbusResponse};
use crate::codec::FrameStatus;
use crate::error::FrameError;

/// CRC16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC to `unit | pdu`
pub(crate) fn seal(slave: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(slave);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Verify the trailing CRC and return `(unit, pdu)`
pub(crate) fn open(frame: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::short(4, frame.len()));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if computed != received {
        return Err(FrameError::CrcMismatch { computed, received });
    }
    Ok((body[0], &body[1..]))
}

pub fn encode_request(request: &ModbusRequest) -> Result<Vec<u8>, FrameError> {
    Ok(seal(request.slave, &request.op.encode_pdu()?))
}

/// Frame length the reply to `request` must have, given its first bytes
pub fn expected_reply_len(request: &ModbusRequest, received: &[u8]) -> usize {
    match received.get(1) {
        Some(function) if function & EXCEPTION_FLAG != 0 => RTU_EXCEPTION_LEN,
        _ => 1 + request.op.response_pdu_len() + 2,
    }
}

pub fn frame_status(request: &ModbusRequest, buffer: &[u8]) -> FrameStatus {
    if buffer.len() < 2 {
        return FrameStatus::Incomplete;
    }
    let expected = expected_reply_len(request, buffer);
    if buffer.len() >= expected {
        FrameStatus::Complete(expected)
    } else {
        FrameStatus::Incomplete
    }
}

/// Decode the reply to `request`
///
/// Length is checked first (`ShortFrame`), then the CRC over the expected
/// span (`CrcMismatch`), then the PDU contents.
pub fn decode_response(
    request: &ModbusRequest,
    frame: &[u8],
) -> Result<ModbusResponse, FrameError> {
    let expected = expected_reply_len(request, frame);
    if frame.len() < expected {
        return Err(FrameError::short(expected, frame.len()));
    }

    let (slave, pdu) = open(&frame[..expected])?;
    if slave != request.slave {
        return Err(FrameError::malformed(format!(
            "reply from slave {slave}, expected {}",
            request.slave
        )));
    }
    ModbusResponse::decode_pdu(&request.op, pdu)
}

/// Parse a request frame (slave side)
pub fn decode_request(frame: &[u8]) -> Result<ModbusRequest, FrameError> {
    let (slave, pdu) = open(frame)?;
    check_exception(pdu)?;
    Ok(ModbusRequest::new(slave, ModbusOp::decode_pdu(pdu)?))
}

/// Encode a reply frame (slave side)
pub fn encode_response(slave: u8, function: u8, response: &ModbusResponse) -> Vec<u8> {
    seal(slave, &response.encode_pdu(function))
}

/// Encode an exception reply frame (slave side)
pub fn encode_exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    seal(slave, &super::pdu::exception_pdu(function, code))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn read_one(slave: u8) -> ModbusRequest {
        ModbusRequest::new(
            slave,
            ModbusOp::ReadHoldingRegisters {
                address: 0,
                count: 1,
            },
        )
    }

    #[test]
    fn test_crc16_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]), 0x8776);
    }

    #[test]
    fn test_encode_read_request() {
        let frame = encode_request(&read_one(1)).unwrap();
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_decode_register_reply() {
        let reply = [0x01, 0x03, 0x02, 0x05, 0xAC, 0xBB, 0x69];
        assert_eq!(
            decode_response(&read_one(1), &reply).unwrap(),
            ModbusResponse::Registers(vec![1452])
        );
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        let reply = [0x01u8, 0x03, 0x02, 0x05, 0xAC, 0xBB, 0x69];
        for byte in 0..reply.len() {
            for bit in 0..8 {
                // Setting the exception flag changes the expected length instead
                if byte == 1 && bit == 7 {
                    continue;
                }
                let mut corrupted = reply;
                corrupted[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        decode_response(&read_one(1), &corrupted),
                        Err(FrameError::CrcMismatch { .. })
                    ),
                    "flip of byte {byte} bit {bit} not detected"
                );
            }
        }
    }

    #[test]
    fn test_short_reply() {
        let truncated = [0x01, 0x03, 0x02, 0x05, 0xAC, 0xBB];
        assert_eq!(
            decode_response(&read_one(1), &truncated),
            Err(FrameError::ShortFrame {
                expected: 7,
                actual: 6
            })
        );
    }

    #[test]
    fn test_exception_reply() {
        let frame = encode_exception(1, 0x03, 0x02);
        assert_eq!(frame, vec![0x01, 0x83, 0x02, 0xC0, 0xF1]);
        assert_eq!(frame_status(&read_one(1), &frame), FrameStatus::Complete(5));
        assert_eq!(
            decode_response(&read_one(1), &frame),
            Err(FrameError::Exception {
                function: 0x03,
                code: 0x02
            })
        );
    }

    #[test]
    fn test_wrong_slave_rejected() {
        let frame = encode_response(2, 0x03, &ModbusResponse::Registers(vec![7]));
        assert!(matches!(
            decode_response(&read_one(1), &frame),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_frame_status_progression() {
        let request = read_one(1);
        let reply = [0x01, 0x03, 0x02, 0x05, 0xAC, 0xBB, 0x69, 0xFF];
        assert_eq!(frame_status(&request, &reply[..1]), FrameStatus::Incomplete);
        assert_eq!(frame_status(&request, &reply[..6]), FrameStatus::Incomplete);
        assert_eq!(frame_status(&request, &reply[..7]), FrameStatus::Complete(7));
        assert_eq!(frame_status(&request, &reply), FrameStatus::Complete(7));
    }

    #[test]
    fn test_request_roundtrip_slave_side() {
        let request = ModbusRequest::new(
            7,
            ModbusOp::WriteMultipleRegisters {
                address: 0x10,
                values: vec![0x0102, 0xFFFF],
            },
        );
        let frame = encode_request(&request).unwrap();
        assert_eq!(decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn test_every_function_round_trips() {
        let bits = vec![true, false, true, true, false, false, true, false, true, true];
        let cases = vec![
            (
                ModbusOp::ReadCoils { address: 4, count: 10 },
                ModbusResponse::Bits(bits.clone()),
            ),
            (
                ModbusOp::ReadDiscreteInputs { address: 0, count: 10 },
                ModbusResponse::Bits(bits.clone()),
            ),
            (
                ModbusOp::ReadHoldingRegisters { address: 10, count: 3 },
                ModbusResponse::Registers(vec![1452, 0, 0xFFFF]),
            ),
            (
                ModbusOp::ReadInputRegisters { address: 1, count: 2 },
                ModbusResponse::Registers(vec![0x4357, 0x8000]),
            ),
            (
                ModbusOp::WriteSingleCoil { address: 5, value: true },
                ModbusResponse::WriteSingle { address: 5, value: 0xFF00 },
            ),
            (
                ModbusOp::WriteSingleRegister { address: 1, value: 2200 },
                ModbusResponse::WriteSingle { address: 1, value: 2200 },
            ),
            (
                ModbusOp::WriteMultipleCoils {
                    address: 8,
                    values: bits,
                },
                ModbusResponse::WriteMultiple {
                    address: 8,
                    quantity: 10,
                },
            ),
            (
                ModbusOp::WriteMultipleRegisters {
                    address: 100,
                    values: vec![1, 2, 3, 4],
                },
                ModbusResponse::WriteMultiple {
                    address: 100,
                    quantity: 4,
                },
            ),
            (
                ModbusOp::MaskWriteRegister {
                    address: 2,
                    and_mask: 0xFF0F,
                    or_mask: 0x0030,
                },
                ModbusResponse::MaskWrite {
                    address: 2,
                    and_mask: 0xFF0F,
                    or_mask: 0x0030,
                },
            ),
        ];

        for (op, response) in cases {
            let request = ModbusRequest::new(3, op);
            let frame = encode_request(&request).unwrap();
            assert_eq!(decode_request(&frame).unwrap(), request);

            let reply = encode_response(3, request.function_code(), &response);
            assert_eq!(
                frame_status(&request, &reply),
                FrameStatus::Complete(reply.len()),
                "{:?}",
                request.op
            );
            assert_eq!(decode_response(&request, &reply).unwrap(), response);
        }
    }
}

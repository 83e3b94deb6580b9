//! Modbus TCP / UDP framing
//!
//! MBAP header `transaction(2) | protocol(2) = 0 | length(2) | unit(1)`
//! followed by the PDU. No checksum; the transport is trusted.

use bytes::BufMut;

use super::constants::MBAP_HEADER_LEN;
use super::pdu::{ModbusOp, ModbusRequest, ModbusResponse};
use crate::codec::FrameStatus;
use crate::error::FrameError;

fn seal(transaction: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit);
    frame.put_slice(pdu);
    frame
}

/// Parsed MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction: u16,
    pub protocol: u16,
    pub length: u16,
    pub unit: u8,
}

impl MbapHeader {
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < MBAP_HEADER_LEN {
            return Err(FrameError::short(MBAP_HEADER_LEN, frame.len()));
        }
        Ok(Self {
            transaction: u16::from_be_bytes([frame[0], frame[1]]),
            protocol: u16::from_be_bytes([frame[2], frame[3]]),
            length: u16::from_be_bytes([frame[4], frame[5]]),
            unit: frame[6],
        })
    }

    /// Whole frame size announced by the header
    pub fn frame_len(&self) -> usize {
        6 + self.length as usize
    }
}

/// Split a complete frame into header and PDU
fn open(frame: &[u8]) -> Result<(MbapHeader, &[u8]), FrameError> {
    let header = MbapHeader::parse(frame)?;
    if header.protocol != 0 {
        return Err(FrameError::malformed(format!(
            "MBAP protocol id {} is not Modbus",
            header.protocol
        )));
    }
    if header.length < 2 {
        return Err(FrameError::malformed("MBAP length leaves no room for a PDU"));
    }
    let total = header.frame_len();
    if frame.len() < total {
        return Err(FrameError::short(total, frame.len()));
    }
    Ok((header, &frame[MBAP_HEADER_LEN..total]))
}

pub fn encode_request(transaction: u16, request: &ModbusRequest) -> Result<Vec<u8>, FrameError> {
    Ok(seal(transaction, request.slave, &request.op.encode_pdu()?))
}

pub fn frame_status(buffer: &[u8]) -> FrameStatus {
    match MbapHeader::parse(buffer) {
        Ok(header) if buffer.len() >= header.frame_len() => {
            FrameStatus::Complete(header.frame_len())
        },
        _ => FrameStatus::Incomplete,
    }
}

/// Decode the reply to `request` sent under `transaction`
pub fn decode_response(
    transaction: u16,
    request: &ModbusRequest,
    frame: &[u8],
) -> Result<ModbusResponse, FrameError> {
    let (header, pdu) = open(frame)?;
    if header.transaction != transaction {
        return Err(FrameError::TransactionMismatch {
            expected: transaction,
            actual: header.transaction,
        });
    }
    if header.unit != request.slave {
        return Err(FrameError::malformed(format!(
            "reply from unit {}, expected {}",
            header.unit, request.slave
        )));
    }
    ModbusResponse::decode_pdu(&request.op, pdu)
}

/// Parse a request frame (slave side); returns the transaction id too
pub fn decode_request(frame: &[u8]) -> Result<(u16, ModbusRequest), FrameError> {
    let (header, pdu) = open(frame)?;
    Ok((
        header.transaction,
        ModbusRequest::new(header.unit, ModbusOp::decode_pdu(pdu)?),
    ))
}

/// Encode a reply frame (slave side)
pub fn encode_response(
    transaction: u16,
    unit: u8,
    function: u8,
    response: &ModbusResponse,
) -> Vec<u8> {
    seal(transaction, unit, &response.encode_pdu(function))
}

/// Encode an exception reply frame (slave side)
pub fn encode_exception(transaction: u16, unit: u8, function: u8, code: u8) -> Vec<u8> {
    seal(transaction, unit, &super::pdu::exception_pdu(function, code))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn read_two() -> ModbusRequest {
        ModbusRequest::new(
            0x11,
            ModbusOp::ReadHoldingRegisters {
                address: 0x006B,
                count: 2,
            },
        )
    }

    #[test]
    fn test_encode_request_header() {
        let frame = encode_request(0x0001, &read_two()).unwrap();
        assert_eq!(
            frame,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x02]
        );
    }

    #[test]
    fn test_decode_reply() {
        let reply = encode_response(7, 0x11, 0x03, &ModbusResponse::Registers(vec![1452, 3]));
        assert_eq!(frame_status(&reply), FrameStatus::Complete(reply.len()));
        assert_eq!(
            decode_response(7, &read_two(), &reply).unwrap(),
            ModbusResponse::Registers(vec![1452, 3])
        );
    }

    #[test]
    fn test_transaction_mismatch() {
        let reply = encode_response(8, 0x11, 0x03, &ModbusResponse::Registers(vec![1, 2]));
        assert_eq!(
            decode_response(7, &read_two(), &reply),
            Err(FrameError::TransactionMismatch {
                expected: 7,
                actual: 8
            })
        );
    }

    #[test]
    fn test_frame_status_waits_for_announced_length() {
        let reply = encode_response(1, 0x11, 0x03, &ModbusResponse::Registers(vec![1, 2]));
        assert_eq!(frame_status(&reply[..5]), FrameStatus::Incomplete);
        assert_eq!(frame_status(&reply[..reply.len() - 1]), FrameStatus::Incomplete);

        let mut two = reply.clone();
        two.extend_from_slice(&reply);
        assert_eq!(frame_status(&two), FrameStatus::Complete(reply.len()));
    }

    #[test]
    fn test_short_and_foreign_frames() {
        let reply = encode_response(1, 0x11, 0x03, &ModbusResponse::Registers(vec![1, 2]));
        assert!(matches!(
            decode_response(1, &read_two(), &reply[..9]),
            Err(FrameError::ShortFrame { .. })
        ));

        let mut foreign = reply.clone();
        foreign[3] = 1;
        assert!(matches!(
            decode_response(1, &read_two(), &foreign),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_exception_reply() {
        let frame = encode_exception(3, 0x11, 0x03, 0x02);
        assert_eq!(
            decode_response(3, &read_two(), &frame),
            Err(FrameError::Exception {
                function: 0x03,
                code: 0x02
            })
        );
    }

    #[test]
    fn test_request_roundtrip_slave_side() {
        let frame = encode_request(42, &read_two()).unwrap();
        assert_eq!(decode_request(&frame).unwrap(), (42, read_two()));
    }
}

//! Modbus PDU model
//!
//! Requests and replies for function codes 1, 2, 3, 4, 5, 6, 15, 16 and 22.
//! Both directions are encoded and decoded so the same code can play the
//! master and, in tests, the slave.

use bytes::BufMut;

use super::constants::*;
use super::RegisterTable;
use crate::error::FrameError;

/// Function-specific request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusOp {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    MaskWriteRegister { address: u16, and_mask: u16, or_mask: u16 },
}

/// Request addressed to one slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave: u8,
    pub op: ModbusOp,
}

/// Decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    /// FC1 / FC2
    Bits(Vec<bool>),
    /// FC3 / FC4
    Registers(Vec<u16>),
    /// FC5 / FC6 echo; coil values are 0xFF00 or 0x0000
    WriteSingle { address: u16, value: u16 },
    /// FC15 / FC16 echo
    WriteMultiple { address: u16, quantity: u16 },
    /// FC22 echo
    MaskWrite {
        address: u16,
        and_mask: u16,
        or_mask: u16,
    },
}

impl ModbusRequest {
    pub fn new(slave: u8, op: ModbusOp) -> Self {
        Self { slave, op }
    }

    pub fn function_code(&self) -> u8 {
        self.op.function_code()
    }
}

impl ModbusOp {
    /// Read request for a register table
    pub fn read(table: RegisterTable, address: u16, count: u16) -> Self {
        match table {
            RegisterTable::Coils => ModbusOp::ReadCoils { address, count },
            RegisterTable::DiscreteInputs => ModbusOp::ReadDiscreteInputs { address, count },
            RegisterTable::InputRegisters => ModbusOp::ReadInputRegisters { address, count },
            RegisterTable::HoldingRegisters => ModbusOp::ReadHoldingRegisters { address, count },
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            ModbusOp::ReadCoils { .. } => FC_READ_COILS,
            ModbusOp::ReadDiscreteInputs { .. } => FC_READ_DISCRETE_INPUTS,
            ModbusOp::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            ModbusOp::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            ModbusOp::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            ModbusOp::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            ModbusOp::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            ModbusOp::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
            ModbusOp::MaskWriteRegister { .. } => FC_MASK_WRITE_REGISTER,
        }
    }

    /// Fixed reply PDU size for a successful reply
    pub fn response_pdu_len(&self) -> usize {
        match self {
            ModbusOp::ReadCoils { count, .. } | ModbusOp::ReadDiscreteInputs { count, .. } => {
                2 + bit_bytes(*count as usize)
            },
            ModbusOp::ReadHoldingRegisters { count, .. }
            | ModbusOp::ReadInputRegisters { count, .. } => 2 + 2 * *count as usize,
            ModbusOp::WriteSingleCoil { .. }
            | ModbusOp::WriteSingleRegister { .. }
            | ModbusOp::WriteMultipleCoils { .. }
            | ModbusOp::WriteMultipleRegisters { .. } => 5,
            ModbusOp::MaskWriteRegister { .. } => 7,
        }
    }

    pub fn encode_pdu(&self) -> Result<Vec<u8>, FrameError> {
        let mut pdu = Vec::with_capacity(8);
        pdu.put_u8(self.function_code());

        match self {
            ModbusOp::ReadCoils { address, count }
            | ModbusOp::ReadDiscreteInputs { address, count } => {
                check_quantity(*count, MAX_READ_BITS, "bit read quantity")?;
                pdu.put_u16(*address);
                pdu.put_u16(*count);
            },
            ModbusOp::ReadHoldingRegisters { address, count }
            | ModbusOp::ReadInputRegisters { address, count } => {
                check_quantity(*count, MAX_READ_REGISTERS, "register read quantity")?;
                pdu.put_u16(*address);
                pdu.put_u16(*count);
            },
            ModbusOp::WriteSingleCoil { address, value } => {
                pdu.put_u16(*address);
                pdu.put_u16(if *value { COIL_ON } else { COIL_OFF });
            },
            ModbusOp::WriteSingleRegister { address, value } => {
                pdu.put_u16(*address);
                pdu.put_u16(*value);
            },
            ModbusOp::WriteMultipleCoils { address, values } => {
                check_quantity(values.len() as u16, MAX_WRITE_COILS, "coil write quantity")?;
                let packed = pack_bits(values);
                pdu.put_u16(*address);
                pdu.put_u16(values.len() as u16);
                pdu.put_u8(packed.len() as u8);
                pdu.put_slice(&packed);
            },
            ModbusOp::WriteMultipleRegisters { address, values } => {
                check_quantity(
                    values.len() as u16,
                    MAX_WRITE_REGISTERS,
                    "register write quantity",
                )?;
                pdu.put_u16(*address);
                pdu.put_u16(values.len() as u16);
                pdu.put_u8((values.len() * 2) as u8);
                for value in values {
                    pdu.put_u16(*value);
                }
            },
            ModbusOp::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => {
                pdu.put_u16(*address);
                pdu.put_u16(*and_mask);
                pdu.put_u16(*or_mask);
            },
        }

        Ok(pdu)
    }

    /// Parse a request PDU (slave side)
    pub fn decode_pdu(pdu: &[u8]) -> Result<Self, FrameError> {
        let function = *pdu.first().ok_or_else(|| FrameError::short(1, 0))?;
        let word = |offset: usize| -> Result<u16, FrameError> {
            pdu.get(offset..offset + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| FrameError::short(offset + 2, pdu.len()))
        };

        match function {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS => {
                let address = word(1)?;
                let count = word(3)?;
                let table = RegisterTable::from_read_function(function)?;
                Ok(ModbusOp::read(table, address, count))
            },
            FC_WRITE_SINGLE_COIL => {
                let address = word(1)?;
                let value = match word(3)? {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(FrameError::malformed(format!(
                            "coil value {other:#06X} is neither 0xFF00 nor 0x0000"
                        )))
                    },
                };
                Ok(ModbusOp::WriteSingleCoil { address, value })
            },
            FC_WRITE_SINGLE_REGISTER => Ok(ModbusOp::WriteSingleRegister {
                address: word(1)?,
                value: word(3)?,
            }),
            FC_WRITE_MULTIPLE_COILS => {
                let address = word(1)?;
                let quantity = word(3)? as usize;
                let byte_count =
                    *pdu.get(5).ok_or_else(|| FrameError::short(6, pdu.len()))? as usize;
                let data = pdu
                    .get(6..6 + byte_count)
                    .ok_or_else(|| FrameError::short(6 + byte_count, pdu.len()))?;
                if byte_count != bit_bytes(quantity) {
                    return Err(FrameError::malformed("coil byte count does not match quantity"));
                }
                Ok(ModbusOp::WriteMultipleCoils {
                    address,
                    values: unpack_bits(data, quantity),
                })
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let address = word(1)?;
                let quantity = word(3)? as usize;
                let byte_count =
                    *pdu.get(5).ok_or_else(|| FrameError::short(6, pdu.len()))? as usize;
                if byte_count != quantity * 2 {
                    return Err(FrameError::malformed(
                        "register byte count does not match quantity",
                    ));
                }
                let values = (0..quantity)
                    .map(|i| word(6 + 2 * i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ModbusOp::WriteMultipleRegisters { address, values })
            },
            FC_MASK_WRITE_REGISTER => Ok(ModbusOp::MaskWriteRegister {
                address: word(1)?,
                and_mask: word(3)?,
                or_mask: word(5)?,
            }),
            other => Err(FrameError::UnsupportedFunction(other)),
        }
    }
}

impl ModbusResponse {
    pub fn registers(&self) -> Option<&[u16]> {
        match self {
            ModbusResponse::Registers(regs) => Some(regs),
            _ => None,
        }
    }

    pub fn bits(&self) -> Option<&[bool]> {
        match self {
            ModbusResponse::Bits(bits) => Some(bits),
            _ => None,
        }
    }

    /// Encode as the reply for `function` (slave side)
    pub fn encode_pdu(&self, function: u8) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(8);
        pdu.put_u8(function);
        match self {
            ModbusResponse::Bits(bits) => {
                let packed = pack_bits(bits);
                pdu.put_u8(packed.len() as u8);
                pdu.put_slice(&packed);
            },
            ModbusResponse::Registers(regs) => {
                pdu.put_u8((regs.len() * 2) as u8);
                for reg in regs {
                    pdu.put_u16(*reg);
                }
            },
            ModbusResponse::WriteSingle { address, value } => {
                pdu.put_u16(*address);
                pdu.put_u16(*value);
            },
            ModbusResponse::WriteMultiple { address, quantity } => {
                pdu.put_u16(*address);
                pdu.put_u16(*quantity);
            },
            ModbusResponse::MaskWrite {
                address,
                and_mask,
                or_mask,
            } => {
                pdu.put_u16(*address);
                pdu.put_u16(*and_mask);
                pdu.put_u16(*or_mask);
            },
        }
        pdu
    }

    /// Decode the reply PDU to `op`
    ///
    /// Exception replies surface as `FrameError::Exception`.
    pub fn decode_pdu(op: &ModbusOp, pdu: &[u8]) -> Result<Self, FrameError> {
        check_exception(pdu)?;

        let function = op.function_code();
        if pdu[0] != function {
            return Err(FrameError::malformed(format!(
                "reply function {:#04X} does not match request {function:#04X}",
                pdu[0]
            )));
        }

        let expected = op.response_pdu_len();
        if pdu.len() < expected {
            return Err(FrameError::short(expected, pdu.len()));
        }

        let word = |offset: usize| u16::from_be_bytes([pdu[offset], pdu[offset + 1]]);

        match op {
            ModbusOp::ReadCoils { count, .. } | ModbusOp::ReadDiscreteInputs { count, .. } => {
                let byte_count = pdu[1] as usize;
                if byte_count != bit_bytes(*count as usize) {
                    return Err(FrameError::malformed(format!(
                        "byte count {byte_count} does not match {count} bits"
                    )));
                }
                Ok(ModbusResponse::Bits(unpack_bits(
                    &pdu[2..2 + byte_count],
                    *count as usize,
                )))
            },
            ModbusOp::ReadHoldingRegisters { count, .. }
            | ModbusOp::ReadInputRegisters { count, .. } => {
                let byte_count = pdu[1] as usize;
                if byte_count != 2 * *count as usize {
                    return Err(FrameError::malformed(format!(
                        "byte count {byte_count} does not match {count} registers"
                    )));
                }
                Ok(ModbusResponse::Registers(
                    (0..*count as usize).map(|i| word(2 + 2 * i)).collect(),
                ))
            },
            ModbusOp::WriteSingleCoil { address, .. }
            | ModbusOp::WriteSingleRegister { address, .. } => {
                let echoed = word(1);
                if echoed != *address {
                    return Err(FrameError::malformed(format!(
                        "write echo address {echoed} does not match {address}"
                    )));
                }
                Ok(ModbusResponse::WriteSingle {
                    address: echoed,
                    value: word(3),
                })
            },
            ModbusOp::WriteMultipleCoils { address, .. }
            | ModbusOp::WriteMultipleRegisters { address, .. } => {
                let echoed = word(1);
                if echoed != *address {
                    return Err(FrameError::malformed(format!(
                        "write echo address {echoed} does not match {address}"
                    )));
                }
                Ok(ModbusResponse::WriteMultiple {
                    address: echoed,
                    quantity: word(3),
                })
            },
            ModbusOp::MaskWriteRegister { address, .. } => {
                let echoed = word(1);
                if echoed != *address {
                    return Err(FrameError::malformed(format!(
                        "mask write echo address {echoed} does not match {address}"
                    )));
                }
                Ok(ModbusResponse::MaskWrite {
                    address: echoed,
                    and_mask: word(3),
                    or_mask: word(5),
                })
            },
        }
    }
}

/// Exception reply PDU
pub fn exception_pdu(function: u8, code: u8) -> Vec<u8> {
    vec![function | EXCEPTION_FLAG, code]
}

/// Map an exception reply onto `FrameError::Exception`
pub(crate) fn check_exception(pdu: &[u8]) -> Result<(), FrameError> {
    match pdu {
        [] => Err(FrameError::short(1, 0)),
        [function, rest @ ..] if function & EXCEPTION_FLAG != 0 => match rest.first() {
            Some(code) => Err(FrameError::Exception {
                function: function & !EXCEPTION_FLAG,
                code: *code,
            }),
            None => Err(FrameError::short(2, 1)),
        },
        _ => Ok(()),
    }
}

/// Bytes needed to carry `bits` packed bits
pub(crate) fn bit_bytes(bits: usize) -> usize {
    bits.div_ceil(8)
}

fn check_quantity(count: u16, max: u16, kind: &'static str) -> Result<(), FrameError> {
    if count == 0 || count > max {
        return Err(FrameError::OutOfRange {
            value: f64::from(count),
            kind,
        });
    }
    Ok(())
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bit_bytes(bits.len())];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| data.get(i / 8).is_some_and(|byte| byte & (1 << (i % 8)) != 0))
        .collect()
}

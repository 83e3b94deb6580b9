//! Modbus framing
//!
//! One PDU model (`pdu`) wrapped by five framings:
//! - RTU: unit + PDU + CRC16 (poly 0xA001, low byte first)
//! - ASCII: ':' + hex(unit + PDU + LRC) + CR LF
//! - Binary: '{' + unit + PDU + CRC16 + '}' with brace bytes doubled
//! - TCP/UDP: 7-byte MBAP header + PDU, no checksum

pub mod ascii;
pub mod binary;
pub mod constants;
pub mod pdu;
pub mod rtu;
pub mod slave;
pub mod tcp;

use serde::{Deserialize, Serialize};

use crate::error::FrameError;
pub use pdu::{ModbusOp, ModbusRequest, ModbusResponse};

/// Human readable name of a Modbus exception code
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

/// Register table selected by a conventional six-digit reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterTable {
    /// 000001-065536, FC1 / FC5 / FC15
    Coils,
    /// 100001-165536, FC2
    DiscreteInputs,
    /// 300001-365536, FC4
    InputRegisters,
    /// 400001-465536, FC3 / FC6 / FC16 / FC22
    HoldingRegisters,
}

impl RegisterTable {
    /// Read function code for this table
    pub fn read_function(&self) -> u8 {
        match self {
            RegisterTable::Coils => constants::FC_READ_COILS,
            RegisterTable::DiscreteInputs => constants::FC_READ_DISCRETE_INPUTS,
            RegisterTable::InputRegisters => constants::FC_READ_INPUT_REGISTERS,
            RegisterTable::HoldingRegisters => constants::FC_READ_HOLDING_REGISTERS,
        }
    }

    /// Table read by a given function code
    pub fn from_read_function(function: u8) -> Result<Self, FrameError> {
        match function {
            constants::FC_READ_COILS => Ok(RegisterTable::Coils),
            constants::FC_READ_DISCRETE_INPUTS => Ok(RegisterTable::DiscreteInputs),
            constants::FC_READ_HOLDING_REGISTERS => Ok(RegisterTable::HoldingRegisters),
            constants::FC_READ_INPUT_REGISTERS => Ok(RegisterTable::InputRegisters),
            other => Err(FrameError::UnsupportedFunction(other)),
        }
    }

    pub fn is_bit_table(&self) -> bool {
        matches!(self, RegisterTable::Coils | RegisterTable::DiscreteInputs)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterTable::Coils | RegisterTable::HoldingRegisters)
    }
}

/// Table plus zero-based PDU address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModbusAddress {
    pub table: RegisterTable,
    pub address: u16,
}

impl ModbusAddress {
    /// Map a six-digit reference (e.g. 400001) onto table and PDU address
    pub fn from_reference(reference: u32) -> Result<Self, FrameError> {
        let (table, base) = match reference {
            1..=65_536 => (RegisterTable::Coils, 1),
            100_001..=165_536 => (RegisterTable::DiscreteInputs, 100_001),
            300_001..=365_536 => (RegisterTable::InputRegisters, 300_001),
            400_001..=465_536 => (RegisterTable::HoldingRegisters, 400_001),
            other => {
                return Err(FrameError::malformed(format!(
                    "register reference {other} outside the Modbus data model"
                )))
            },
        };
        Ok(Self {
            table,
            address: (reference - base) as u16,
        })
    }

    pub fn from_function(function: u8, address: u16) -> Result<Self, FrameError> {
        Ok(Self {
            table: RegisterTable::from_read_function(function)?,
            address,
        })
    }

    /// Six-digit reference for this address
    pub fn reference(&self) -> u32 {
        let base = match self.table {
            RegisterTable::Coils => 1,
            RegisterTable::DiscreteInputs => 100_001,
            RegisterTable::InputRegisters => 300_001,
            RegisterTable::HoldingRegisters => 400_001,
        };
        base + u32::from(self.address)
    }
}

//! Modbus protocol constants

// Function codes
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;

/// Set on the function code of an exception reply
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Coil ON value in FC5 requests
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Quantity limits per request
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// MBAP header length
pub const MBAP_HEADER_LEN: usize = 7;

/// Exception reply length in an RTU frame (unit, function, code, CRC)
pub const RTU_EXCEPTION_LEN: usize = 5;

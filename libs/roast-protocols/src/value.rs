//! Register and byte layouts to engineering values
//!
//! Multi-register values are normalized to a big-endian byte string first:
//! word order picks which register carries the high word, byte order picks
//! the byte order inside each register. The combined pattern is then read as
//! int/uint/float/BCD.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// How a raw value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeKind {
    Int16,
    #[default]
    Uint16,
    Int32,
    Uint32,
    Float32,
    Bcd16,
    Bcd32,
    Bit,
}

impl DecodeKind {
    /// Registers occupied by one value
    pub fn register_count(&self) -> u16 {
        match self {
            DecodeKind::Int32 | DecodeKind::Uint32 | DecodeKind::Float32 | DecodeKind::Bcd32 => 2,
            _ => 1,
        }
    }

    /// Bytes occupied by one value
    pub fn byte_len(&self) -> usize {
        match self {
            DecodeKind::Bit => 1,
            other => 2 * other.register_count() as usize,
        }
    }

    pub fn is_bcd(&self) -> bool {
        matches!(self, DecodeKind::Bcd16 | DecodeKind::Bcd32)
    }
}

/// Byte order inside one 16-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Register order of 32-bit values; `Big` sends the high word first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    #[default]
    Big,
    Little,
}

/// Parse the usual `ABCD` style layout names
pub fn layout_from_pattern(pattern: &str) -> Option<(ByteOrder, WordOrder)> {
    match pattern.to_ascii_uppercase().as_str() {
        "ABCD" | "AB" => Some((ByteOrder::Big, WordOrder::Big)),
        "CDAB" => Some((ByteOrder::Big, WordOrder::Little)),
        "BADC" | "BA" => Some((ByteOrder::Little, WordOrder::Big)),
        "DCBA" => Some((ByteOrder::Little, WordOrder::Little)),
        _ => None,
    }
}

/// Registers to a big-endian byte string
pub fn registers_to_bytes(
    registers: &[u16],
    byte_order: ByteOrder,
    word_order: WordOrder,
) -> Vec<u8> {
    let mut words = registers.to_vec();
    if word_order == WordOrder::Little {
        words.reverse();
    }
    words
        .iter()
        .flat_map(|word| match byte_order {
            ByteOrder::Big => word.to_be_bytes(),
            ByteOrder::Little => word.to_le_bytes(),
        })
        .collect()
}

/// Inverse of [`registers_to_bytes`]
pub fn bytes_to_registers(bytes: &[u8], byte_order: ByteOrder, word_order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks(2)
        .map(|pair| {
            let pair = [pair[0], pair.get(1).copied().unwrap_or(0)];
            match byte_order {
                ByteOrder::Big => u16::from_be_bytes(pair),
                ByteOrder::Little => u16::from_le_bytes(pair),
            }
        })
        .collect();
    if word_order == WordOrder::Little {
        words.reverse();
    }
    words
}

/// Decode the leading registers of a read reply
pub fn decode_registers(
    registers: &[u16],
    kind: DecodeKind,
    byte_order: ByteOrder,
    word_order: WordOrder,
) -> Result<f64, FrameError> {
    let needed = kind.register_count() as usize;
    if registers.len() < needed {
        return Err(FrameError::short(needed * 2, registers.len() * 2));
    }
    let bytes = registers_to_bytes(&registers[..needed], byte_order, word_order);
    match kind {
        // Any set bit in the register counts
        DecodeKind::Bit => Ok(if registers[0] != 0 { 1.0 } else { 0.0 }),
        other => decode_bytes(&bytes, other),
    }
}

/// Decode a big-endian byte string
pub fn decode_bytes(bytes: &[u8], kind: DecodeKind) -> Result<f64, FrameError> {
    let needed = kind.byte_len();
    if bytes.len() < needed {
        return Err(FrameError::short(needed, bytes.len()));
    }
    let b = bytes;
    let value = match kind {
        DecodeKind::Int16 => f64::from(i16::from_be_bytes([b[0], b[1]])),
        DecodeKind::Uint16 => f64::from(u16::from_be_bytes([b[0], b[1]])),
        DecodeKind::Int32 => f64::from(i32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        DecodeKind::Uint32 => f64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        DecodeKind::Float32 => {
            let value = f32::from_be_bytes([b[0], b[1], b[2], b[3]]);
            if !value.is_finite() {
                return Err(FrameError::OutOfRange {
                    value: f64::from(value),
                    kind: "float32",
                });
            }
            f64::from(value)
        },
        DecodeKind::Bcd16 => f64::from(decode_bcd(u32::from(u16::from_be_bytes([b[0], b[1]])), 4)?),
        DecodeKind::Bcd32 => {
            f64::from(decode_bcd(u32::from_be_bytes([b[0], b[1], b[2], b[3]]), 8)?)
        },
        DecodeKind::Bit => {
            if b[0] != 0 {
                1.0
            } else {
                0.0
            }
        },
    };
    Ok(value)
}

/// Encode an engineering value into registers for a write
///
/// Integer kinds round to the nearest integer and reject values outside the
/// target type.
pub fn encode_value(
    value: f64,
    kind: DecodeKind,
    byte_order: ByteOrder,
    word_order: WordOrder,
) -> Result<Vec<u16>, FrameError> {
    if !value.is_finite() {
        return Err(FrameError::OutOfRange {
            value,
            kind: "finite value",
        });
    }

    let in_range = |min: f64, max: f64, kind: &'static str| -> Result<f64, FrameError> {
        let rounded = value.round();
        if rounded < min || rounded > max {
            return Err(FrameError::OutOfRange { value, kind });
        }
        Ok(rounded)
    };

    let bytes: Vec<u8> = match kind {
        DecodeKind::Int16 => {
            let value = in_range(f64::from(i16::MIN), f64::from(i16::MAX), "int16")? as i16;
            value.to_be_bytes().to_vec()
        },
        DecodeKind::Uint16 => {
            let value = in_range(0.0, f64::from(u16::MAX), "uint16")? as u16;
            value.to_be_bytes().to_vec()
        },
        DecodeKind::Int32 => {
            let value = in_range(f64::from(i32::MIN), f64::from(i32::MAX), "int32")? as i32;
            value.to_be_bytes().to_vec()
        },
        DecodeKind::Uint32 => {
            let value = in_range(0.0, f64::from(u32::MAX), "uint32")? as u32;
            value.to_be_bytes().to_vec()
        },
        DecodeKind::Float32 => {
            if value.abs() > f64::from(f32::MAX) {
                return Err(FrameError::OutOfRange {
                    value,
                    kind: "float32",
                });
            }
            (value as f32).to_be_bytes().to_vec()
        },
        DecodeKind::Bcd16 => {
            let digits = in_range(0.0, 9_999.0, "bcd16")? as u32;
            (encode_bcd(digits, 4)? as u16).to_be_bytes().to_vec()
        },
        DecodeKind::Bcd32 => {
            let digits = in_range(0.0, 99_999_999.0, "bcd32")? as u32;
            encode_bcd(digits, 8)?.to_be_bytes().to_vec()
        },
        DecodeKind::Bit => {
            return Ok(vec![u16::from(value != 0.0)]);
        },
    };
    Ok(bytes_to_registers(&bytes, byte_order, word_order))
}

/// Packed BCD with `digits` nibbles to its decimal value
pub fn decode_bcd(raw: u32, digits: u32) -> Result<u32, FrameError> {
    let mut value = 0u32;
    for position in (0..digits).rev() {
        let nibble = (raw >> (4 * position)) & 0x0F;
        if nibble > 9 {
            return Err(FrameError::InvalidBcd(raw));
        }
        value = value * 10 + nibble;
    }
    Ok(value)
}

/// Decimal value to packed BCD with `digits` nibbles
pub fn encode_bcd(value: u32, digits: u32) -> Result<u32, FrameError> {
    let limit = 10u64.pow(digits);
    if u64::from(value) >= limit {
        return Err(FrameError::OutOfRange {
            value: f64::from(value),
            kind: "bcd",
        });
    }
    let mut remaining = value;
    let mut raw = 0u32;
    for position in 0..digits {
        raw |= (remaining % 10) << (4 * position);
        remaining /= 10;
    }
    Ok(raw)
}

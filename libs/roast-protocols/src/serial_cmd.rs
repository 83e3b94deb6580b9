//! Command/reply meter protocols
//!
//! Meters in this family answer one poll with every channel at once, so a
//! reply is a list of fields and channels pick theirs by index.
//!
//! - `Tc4`: text. `READ\n` is answered by `ambient,t1,t2,t3,t4\r\n`;
//!   `OT1;<duty>\n` sets heater output 1 and gets no reply.
//! - `Center30x`: binary. `0x41` is answered by a 45-byte frame
//!   `STX | flags | ... | T1 BCD(7..9) | T2 BCD(9..11) | ... | ETX(44)`.
//!   Temperatures are in tenths; flag bits 0/1 mark T1/T2 negative and bits
//!   2/3 an open probe.

use serde::{Deserialize, Serialize};

use crate::codec::FrameStatus;
use crate::error::FrameError;
use crate::value::decode_bcd;

const CENTER_POLL: u8 = 0x41;
const CENTER_FRAME_LEN: usize = 45;
const STX: u8 = 0x02;
const ETX: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialCommandFamily {
    Tc4,
    Center30x,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialCommand {
    /// Poll every channel
    ReadAll,
    /// Set an output channel (heater/fan duty in percent)
    SetOutput { channel: u8, value: u16 },
    /// Send a line as-is and read a line back
    Raw(String),
}

/// Fields of one reply, in device order; `None` marks an unreadable field
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SerialReply {
    pub fields: Vec<Option<f64>>,
}

impl SerialReply {
    pub fn field(&self, index: usize) -> Option<f64> {
        self.fields.get(index).copied().flatten()
    }
}

impl SerialCommandFamily {
    pub fn name(&self) -> &'static str {
        match self {
            SerialCommandFamily::Tc4 => "TC4",
            SerialCommandFamily::Center30x => "Center 30x",
        }
    }

    pub fn encode(&self, command: &SerialCommand) -> Result<Vec<u8>, FrameError> {
        match (self, command) {
            (SerialCommandFamily::Tc4, SerialCommand::ReadAll) => Ok(b"READ\n".to_vec()),
            (SerialCommandFamily::Tc4, SerialCommand::SetOutput { channel, value }) => {
                if *value > 100 {
                    return Err(FrameError::OutOfRange {
                        value: f64::from(*value),
                        kind: "TC4 output duty",
                    });
                }
                Ok(format!("OT{channel};{value}\n").into_bytes())
            },
            (SerialCommandFamily::Tc4, SerialCommand::Raw(line)) => {
                Ok(format!("{}\n", line.trim_end()).into_bytes())
            },
            (SerialCommandFamily::Center30x, SerialCommand::ReadAll) => Ok(vec![CENTER_POLL]),
            (SerialCommandFamily::Center30x, SerialCommand::SetOutput { .. }) => Err(
                FrameError::malformed("Center 30x meters have no output channels"),
            ),
            (SerialCommandFamily::Center30x, SerialCommand::Raw(line)) => {
                Ok(line.as_bytes().to_vec())
            },
        }
    }

    /// Output commands are fire-and-forget
    pub fn expects_reply(&self, command: &SerialCommand) -> bool {
        !matches!(command, SerialCommand::SetOutput { .. })
    }

    pub fn frame_status(&self, buffer: &[u8]) -> FrameStatus {
        match self {
            SerialCommandFamily::Tc4 => match buffer.iter().position(|b| *b == b'\n') {
                Some(index) => FrameStatus::Complete(index + 1),
                None => FrameStatus::Incomplete,
            },
            SerialCommandFamily::Center30x => {
                if buffer.len() >= CENTER_FRAME_LEN {
                    FrameStatus::Complete(CENTER_FRAME_LEN)
                } else {
                    FrameStatus::Incomplete
                }
            },
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<SerialReply, FrameError> {
        match self {
            SerialCommandFamily::Tc4 => decode_tc4(frame),
            SerialCommandFamily::Center30x => decode_center(frame),
        }
    }
}

fn decode_tc4(frame: &[u8]) -> Result<SerialReply, FrameError> {
    let line = std::str::from_utf8(frame)
        .map_err(|_| FrameError::malformed("TC4 reply is not text"))?
        .trim();
    if line.is_empty() {
        return Err(FrameError::short(1, 0));
    }
    let fields = line
        .split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
        })
        .collect();
    Ok(SerialReply { fields })
}

fn decode_center(frame: &[u8]) -> Result<SerialReply, FrameError> {
    if frame.len() < CENTER_FRAME_LEN {
        return Err(FrameError::short(CENTER_FRAME_LEN, frame.len()));
    }
    if frame[0] != STX || frame[CENTER_FRAME_LEN - 1] != ETX {
        return Err(FrameError::malformed("Center 30x frame lacks STX/ETX"));
    }
    let flags = frame[1];
    let probe = |offset: usize, negative_bit: u8, open_bit: u8| -> Result<Option<f64>, FrameError> {
        if flags & (1 << open_bit) != 0 {
            return Ok(None);
        }
        let raw = u32::from(u16::from_be_bytes([frame[offset], frame[offset + 1]]));
        let tenths = f64::from(decode_bcd(raw, 4)?) / 10.0;
        Ok(Some(if flags & (1 << negative_bit) != 0 {
            -tenths
        } else {
            tenths
        }))
    };
    Ok(SerialReply {
        fields: vec![probe(7, 0, 2)?, probe(9, 1, 3)?],
    })
}

/// Build a Center 30x reply frame
pub fn center_frame(t1: Option<f64>, t2: Option<f64>) -> Vec<u8> {
    let mut frame = vec![0u8; CENTER_FRAME_LEN];
    frame[0] = STX;
    frame[CENTER_FRAME_LEN - 1] = ETX;
    for (index, value) in [t1, t2].into_iter().enumerate() {
        let offset = 7 + 2 * index;
        match value {
            None => frame[1] |= 1 << (2 + index),
            Some(value) => {
                if value < 0.0 {
                    frame[1] |= 1 << index;
                }
                let tenths = (value.abs() * 10.0).round().min(9_999.0) as u32;
                let bcd = crate::value::encode_bcd(tenths, 4).unwrap_or(0) as u16;
                frame[offset..offset + 2].copy_from_slice(&bcd.to_be_bytes());
            },
        }
    }
    frame
}

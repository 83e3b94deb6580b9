//! Device channel definitions
//!
//! A channel names one value on one link and carries everything needed to
//! turn the raw reply into a display value: decode kind, byte/word order,
//! divider, scale/offset and the temperature unit of the device.

use serde::{Deserialize, Serialize};

use roast_protocols::value::{decode_registers, encode_value};
use roast_protocols::{
    ByteOrder, DecodeKind, ModbusAddress, ModbusOp, ModbusRequest, ModbusResponse, RegisterTable,
    Request, Response, S7Area, S7Request, S7Response, S7Type, SerialCommand, WordOrder,
};

use crate::error::RegistryError;

/// Temperature unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[default]
    #[serde(rename = "C", alias = "c", alias = "celsius")]
    Celsius,
    #[serde(rename = "F", alias = "f", alias = "fahrenheit")]
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert `value` from this unit into `target`
    pub fn convert(self, value: f64, target: TemperatureUnit) -> f64 {
        match (self, target) {
            (TemperatureUnit::Celsius, TemperatureUnit::Fahrenheit) => value * 9.0 / 5.0 + 32.0,
            (TemperatureUnit::Fahrenheit, TemperatureUnit::Celsius) => (value - 32.0) * 5.0 / 9.0,
            _ => value,
        }
    }
}

/// Where a channel's value lives on its link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelAddress {
    /// Read function code (1-4) plus zero-based register
    Modbus { function: u8, register: u16 },
    /// Six-digit reference such as 400001
    ModbusRef { reference: u32 },
    S7 {
        area: S7Area,
        #[serde(default)]
        db: u16,
        start: u32,
        #[serde(default)]
        bit: Option<u8>,
        #[serde(default)]
        s7_type: S7Type,
    },
    /// Field of a serial meter reply
    Field { index: usize },
}

fn default_slave() -> u8 {
    1
}

fn default_one() -> f64 {
    1.0
}

/// One named value on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceChannel {
    pub name: String,
    /// Name of the link the device sits on
    pub link: String,
    #[serde(default = "default_slave")]
    pub slave: u8,
    pub address: ChannelAddress,
    #[serde(default)]
    pub decode: DecodeKind,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Raw values are divided by this (1, 10, 100)
    #[serde(default = "default_one")]
    pub divider: f64,
    #[serde(default = "default_one")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Unit the device reports in; `None` for non-temperature channels
    #[serde(default)]
    pub unit: Option<TemperatureUnit>,
    #[serde(default)]
    pub writable: bool,
}

impl DeviceChannel {
    /// Holding register channel with default layout
    pub fn modbus(
        name: impl Into<String>,
        link: impl Into<String>,
        slave: u8,
        reference: u32,
    ) -> Self {
        Self {
            name: name.into(),
            link: link.into(),
            slave,
            address: ChannelAddress::ModbusRef { reference },
            decode: DecodeKind::default(),
            byte_order: ByteOrder::default(),
            word_order: WordOrder::default(),
            divider: 1.0,
            scale: 1.0,
            offset: 0.0,
            unit: None,
            writable: false,
        }
    }

    /// Field `index` of a serial meter reply
    pub fn field(name: impl Into<String>, link: impl Into<String>, index: usize) -> Self {
        Self {
            address: ChannelAddress::Field { index },
            ..Self::modbus(name, link, 0, 400_001)
        }
    }

    pub fn with_decode(mut self, decode: DecodeKind) -> Self {
        self.decode = decode;
        self
    }

    pub fn with_divider(mut self, divider: f64) -> Self {
        self.divider = divider;
        self
    }

    pub fn with_unit(mut self, unit: TemperatureUnit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Modbus table and PDU address, for Modbus channels
    pub fn modbus_address(&self) -> Result<Option<ModbusAddress>, RegistryError> {
        let invalid = |e: roast_protocols::FrameError| {
            RegistryError::invalid_address(&self.name, e.to_string())
        };
        match &self.address {
            ChannelAddress::Modbus { function, register } => {
                ModbusAddress::from_function(*function, *register).map(Some).map_err(invalid)
            },
            ChannelAddress::ModbusRef { reference } => {
                ModbusAddress::from_reference(*reference).map(Some).map_err(invalid)
            },
            _ => Ok(None),
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self.address, ChannelAddress::Field { .. })
    }

    /// Request that reads this channel
    pub fn read_request(&self) -> Result<Request, RegistryError> {
        if let Some(address) = self.modbus_address()? {
            let count = if address.table.is_bit_table() {
                1
            } else {
                self.decode.register_count()
            };
            return Ok(Request::Modbus(ModbusRequest::new(
                self.slave,
                ModbusOp::read(address.table, address.address, count),
            )));
        }
        match &self.address {
            ChannelAddress::S7 {
                area,
                db,
                start,
                bit: Some(bit),
                ..
            } => Ok(Request::S7(S7Request::ReadBit {
                area: *area,
                db: *db,
                start: *start,
                bit: *bit,
            })),
            ChannelAddress::S7 {
                area,
                db,
                start,
                s7_type,
                ..
            } => Ok(Request::S7(S7Request::Read {
                area: *area,
                db: *db,
                start: *start,
                size: s7_type.size(),
            })),
            _ => Ok(Request::Serial(SerialCommand::ReadAll)),
        }
    }

    /// Raw device value from a reply, before divider and scaling
    pub fn decode_raw(&self, response: &Response) -> Result<f64, RegistryError> {
        let unexpected = |reason: &str| RegistryError::unexpected(&self.link, reason);
        match (&self.address, response) {
            (_, Response::Modbus(ModbusResponse::Bits(bits))) => bits
                .first()
                .map(|bit| if *bit { 1.0 } else { 0.0 })
                .ok_or_else(|| unexpected("empty bit reply")),
            (_, Response::Modbus(ModbusResponse::Registers(registers))) => Ok(decode_registers(
                registers,
                self.decode,
                self.byte_order,
                self.word_order,
            )?),
            (ChannelAddress::S7 { bit: Some(_), .. }, Response::S7(S7Response::Data(data))) => {
                Ok(S7Type::Bool.decode(data)?)
            },
            (ChannelAddress::S7 { s7_type, .. }, Response::S7(S7Response::Data(data))) => {
                Ok(s7_type.decode(data)?)
            },
            (ChannelAddress::Field { index }, Response::Serial(reply)) => reply
                .field(*index)
                .ok_or(RegistryError::MissingField { index: *index }),
            _ => Err(unexpected("reply does not match the channel address")),
        }
    }

    /// Divider, scale/offset and unit conversion
    pub fn to_display(&self, raw: f64, display: TemperatureUnit) -> Result<f64, RegistryError> {
        if self.divider == 0.0 {
            return Err(RegistryError::DividerZero(self.name.clone()));
        }
        let value = raw / self.divider * self.scale + self.offset;
        Ok(match self.unit {
            Some(unit) => unit.convert(value, display),
            None => value,
        })
    }

    /// Inverse of [`to_display`](Self::to_display), for writes
    pub fn to_raw(&self, value: f64, display: TemperatureUnit) -> Result<f64, RegistryError> {
        if self.divider == 0.0 {
            return Err(RegistryError::DividerZero(self.name.clone()));
        }
        if self.scale == 0.0 {
            return Err(RegistryError::invalid_address(&self.name, "scale is zero"));
        }
        let value = match self.unit {
            Some(unit) => display.convert(value, unit),
            None => value,
        };
        Ok((value - self.offset) / self.scale * self.divider)
    }

    /// Request that writes the raw value `raw`
    ///
    /// Coils use FC5 and registers FC6 for one-register kinds. FC15/FC16 are
    /// used when `multiple_write` is set or the value spans two registers.
    pub fn write_request(&self, raw: f64, multiple_write: bool) -> Result<Request, RegistryError> {
        if let Some(address) = self.modbus_address()? {
            let op = match address.table {
                RegisterTable::Coils => {
                    let value = raw != 0.0;
                    if multiple_write {
                        ModbusOp::WriteMultipleCoils {
                            address: address.address,
                            values: vec![value],
                        }
                    } else {
                        ModbusOp::WriteSingleCoil {
                            address: address.address,
                            value,
                        }
                    }
                },
                RegisterTable::HoldingRegisters => {
                    let mut values =
                        encode_value(raw, self.decode, self.byte_order, self.word_order)?;
                    if values.len() == 1 && !multiple_write {
                        ModbusOp::WriteSingleRegister {
                            address: address.address,
                            value: values.remove(0),
                        }
                    } else {
                        ModbusOp::WriteMultipleRegisters {
                            address: address.address,
                            values,
                        }
                    }
                },
                RegisterTable::DiscreteInputs | RegisterTable::InputRegisters => {
                    return Err(RegistryError::NotWritable(self.name.clone()))
                },
            };
            return Ok(Request::Modbus(ModbusRequest::new(self.slave, op)));
        }
        match &self.address {
            ChannelAddress::S7 {
                area,
                db,
                start,
                bit: Some(bit),
                ..
            } => Ok(Request::S7(S7Request::WriteBit {
                area: *area,
                db: *db,
                start: *start,
                bit: *bit,
                value: raw != 0.0,
            })),
            ChannelAddress::S7 {
                area,
                db,
                start,
                s7_type,
                ..
            } => Ok(Request::S7(S7Request::Write {
                area: *area,
                db: *db,
                start: *start,
                data: s7_type.encode(raw)?,
            })),
            ChannelAddress::Field { index } => {
                let channel = u8::try_from(*index)
                    .map_err(|_| {
                        RegistryError::invalid_address(&self.name, "output index above 255")
                    })?;
                if !(0.0..=f64::from(u16::MAX)).contains(&raw.round()) {
                    return Err(RegistryError::invalid_address(
                        &self.name,
                        format!("output value {raw} out of range"),
                    ));
                }
                Ok(Request::Serial(SerialCommand::SetOutput {
                    channel,
                    value: raw.round() as u16,
                }))
            },
            // Modbus variants were handled above
            ChannelAddress::Modbus { .. } | ChannelAddress::ModbusRef { .. } => {
                Err(RegistryError::NotWritable(self.name.clone()))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use roast_protocols::SerialReply;

    #[test]
    fn test_divider_reconstructs_decimals() {
        let raw = 1452.0;
        for (divider, expected) in [(1.0, 1452.0), (10.0, 145.2), (100.0, 14.52)] {
            let channel = DeviceChannel::modbus("BT", "meter", 1, 400_001).with_divider(divider);
            let value = channel.to_display(raw, TemperatureUnit::Celsius).unwrap();
            assert!((value - expected).abs() < 1e-9, "divider {divider}: {value}");
        }
    }

    #[test]
    fn test_zero_divider_is_an_error() {
        let channel = DeviceChannel::modbus("BT", "meter", 1, 400_001).with_divider(0.0);
        assert!(matches!(
            channel.to_display(1452.0, TemperatureUnit::Celsius),
            Err(RegistryError::DividerZero(_))
        ));
    }

    #[test]
    fn test_unit_conversion_both_ways() {
        let channel = DeviceChannel::modbus("ET", "meter", 1, 400_002)
            .with_divider(10.0)
            .with_unit(TemperatureUnit::Fahrenheit);
        let value = channel.to_display(4010.0, TemperatureUnit::Celsius).unwrap();
        assert!((value - 205.0).abs() < 1e-9);
        let raw = channel.to_raw(205.0, TemperatureUnit::Celsius).unwrap();
        assert!((raw - 4010.0).abs() < 1e-6);
    }

    #[test]
    fn test_read_request_for_reference() {
        let channel =
            DeviceChannel::modbus("BT", "meter", 3, 300_010).with_decode(DecodeKind::Float32);
        assert_eq!(
            channel.read_request().unwrap(),
            Request::Modbus(ModbusRequest::new(
                3,
                ModbusOp::ReadInputRegisters {
                    address: 9,
                    count: 2
                }
            ))
        );
    }

    #[test]
    fn test_write_request_picks_function() {
        let register = DeviceChannel::modbus("SV", "pid", 1, 400_005);
        assert!(matches!(
            register.write_request(200.0, false).unwrap(),
            Request::Modbus(ModbusRequest {
                op: ModbusOp::WriteSingleRegister { address: 4, value: 200 },
                ..
            })
        ));
        assert!(matches!(
            register.write_request(200.0, true).unwrap(),
            Request::Modbus(ModbusRequest {
                op: ModbusOp::WriteMultipleRegisters { .. },
                ..
            })
        ));

        let wide = register.clone().with_decode(DecodeKind::Int32);
        assert!(matches!(
            wide.write_request(70_000.0, false).unwrap(),
            Request::Modbus(ModbusRequest {
                op: ModbusOp::WriteMultipleRegisters { ref values, .. },
                ..
            }) if values == &vec![1, 4464]
        ));

        let coil = DeviceChannel::modbus("Heater", "io", 1, 17);
        assert!(matches!(
            coil.write_request(1.0, false).unwrap(),
            Request::Modbus(ModbusRequest {
                op: ModbusOp::WriteSingleCoil { address: 16, value: true },
                ..
            })
        ));

        let input = DeviceChannel::modbus("BT", "meter", 1, 300_001);
        assert!(matches!(
            input.write_request(1.0, false),
            Err(RegistryError::NotWritable(_))
        ));
    }

    #[test]
    fn test_s7_channel_round_trip() {
        let channel = DeviceChannel {
            address: ChannelAddress::S7 {
                area: S7Area::DataBlock,
                db: 2,
                start: 4,
                bit: None,
                s7_type: S7Type::Int,
            },
            ..DeviceChannel::modbus("BT", "plc", 0, 400_001)
        };
        assert_eq!(
            channel.read_request().unwrap(),
            Request::S7(S7Request::Read {
                area: S7Area::DataBlock,
                db: 2,
                start: 4,
                size: 2
            })
        );
        let raw = channel
            .decode_raw(&Response::S7(S7Response::Data(vec![0x05, 0xAC])))
            .unwrap();
        assert_eq!(raw, 1452.0);
    }

    #[test]
    fn test_field_channel_missing_field() {
        let channel = DeviceChannel::field("T3", "tc4", 3);
        let reply = Response::Serial(SerialReply {
            fields: vec![Some(21.0), Some(150.0), None, None],
        });
        assert!(matches!(
            channel.decode_raw(&reply),
            Err(RegistryError::MissingField { index: 3 })
        ));
        assert_eq!(
            channel.write_request(40.0, false).unwrap(),
            Request::Serial(SerialCommand::SetOutput { channel: 3, value: 40 })
        );
    }

    #[test]
    fn test_channel_from_yaml() {
        let yaml = r#"
name: BT
link: meter
slave: 2
address: { type: modbus_ref, reference: 400003 }
decode: int16
divider: 10
unit: F
"#;
        let channel: DeviceChannel = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(channel.slave, 2);
        assert_eq!(channel.decode, DecodeKind::Int16);
        assert_eq!(channel.unit, Some(TemperatureUnit::Fahrenheit));
        assert!(!channel.writable);
    }
}

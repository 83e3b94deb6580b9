//! Device Registry
//!
//! Maps channel names onto link requests and decodes the replies into
//! display values. The registry holds shared references to the link
//! managers; the links own their transports.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use roast_protocols::value::encode_bcd;
use roast_protocols::{
    FrameError, LinkManager, ModbusOp, ModbusRequest, ModbusResponse, RegisterTable, Request,
    Response,
    SerialCommand,
};

use super::channel::{DeviceChannel, TemperatureUnit};
use crate::error::RegistryError;

fn default_true() -> bool {
    true
}

/// Per-link write capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    /// Device implements FC22; otherwise mask writes are read + FC6
    #[serde(default = "default_true")]
    pub mask_write: bool,
    /// Use FC15/FC16 even for single coils/registers
    #[serde(default)]
    pub multiple_write: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            mask_write: true,
            multiple_write: false,
        }
    }
}

/// `(current & and) | (or & !and)`, the FC22 result
pub fn masked_value(current: u16, and_mask: u16, or_mask: u16) -> u16 {
    (current & and_mask) | (or_mask & !and_mask)
}

#[derive(Debug)]
struct RegisteredLink {
    manager: Arc<LinkManager>,
    options: LinkOptions,
}

/// Named channels over shared links
#[derive(Debug)]
pub struct DeviceRegistry {
    display_unit: TemperatureUnit,
    links: BTreeMap<String, RegisteredLink>,
    channels: Vec<DeviceChannel>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new(display_unit: TemperatureUnit) -> Self {
        Self {
            display_unit,
            links: BTreeMap::new(),
            channels: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn display_unit(&self) -> TemperatureUnit {
        self.display_unit
    }

    pub fn add_link(&mut self, manager: Arc<LinkManager>, options: LinkOptions) {
        let name = manager.name().to_string();
        debug!("Registering link {} ({})", name, manager.family());
        self.links.insert(name, RegisteredLink { manager, options });
    }

    /// Register a channel on a known link
    pub fn add_channel(&mut self, channel: DeviceChannel) -> Result<(), RegistryError> {
        if !self.links.contains_key(&channel.link) {
            return Err(RegistryError::UnknownLink(channel.link.clone()));
        }
        if channel.divider == 0.0 {
            return Err(RegistryError::DividerZero(channel.name.clone()));
        }
        if self.index.contains_key(&channel.name) {
            return Err(RegistryError::invalid_address(&channel.name, "duplicate channel name"));
        }
        channel.modbus_address()?;
        self.index.insert(channel.name.clone(), self.channels.len());
        self.channels.push(channel);
        Ok(())
    }

    pub fn channel(&self, name: &str) -> Option<&DeviceChannel> {
        self.index.get(name).map(|i| &self.channels[*i])
    }

    /// Channels in registration order
    pub fn channels(&self) -> &[DeviceChannel] {
        &self.channels
    }

    pub fn link(&self, name: &str) -> Option<&Arc<LinkManager>> {
        self.links.get(name).map(|entry| &entry.manager)
    }

    pub fn link_options(&self, name: &str) -> Option<LinkOptions> {
        self.links.get(name).map(|entry| entry.options)
    }

    pub fn link_names(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    /// Links that carry at least one channel, in name order
    pub fn polled_links(&self) -> Vec<String> {
        self.links
            .keys()
            .filter(|name| self.channels.iter().any(|c| &c.link == *name))
            .cloned()
            .collect()
    }

    fn entry(&self, link: &str) -> Result<&RegisteredLink, RegistryError> {
        self.links
            .get(link)
            .ok_or_else(|| RegistryError::UnknownLink(link.to_string()))
    }

    fn lookup(&self, name: &str) -> Result<&DeviceChannel, RegistryError> {
        self.channel(name)
            .ok_or_else(|| RegistryError::UnknownChannel(name.to_string()))
    }

    /// Send one request over a named link
    pub async fn request(&self, link: &str, request: &Request) -> Result<Response, RegistryError> {
        Ok(self.entry(link)?.manager.request(request).await?)
    }

    /// Modbus request over a named link
    pub async fn modbus(
        &self,
        link: &str,
        request: ModbusRequest,
    ) -> Result<ModbusResponse, RegistryError> {
        match self.request(link, &Request::Modbus(request)).await? {
            Response::Modbus(response) => Ok(response),
            _ => Err(RegistryError::unexpected(link, "expected a Modbus reply")),
        }
    }

    /// Display value of a channel, `None` when the read failed
    pub async fn read(&self, name: &str) -> Option<f64> {
        match self.lookup(name) {
            Ok(channel) => self.read_channel(channel).await,
            Err(e) => {
                warn!("{}", e);
                None
            },
        }
    }

    pub async fn read_channel(&self, channel: &DeviceChannel) -> Option<f64> {
        let result = self.try_read_channel(channel).await;
        settle(channel, result)
    }

    pub async fn try_read_channel(&self, channel: &DeviceChannel) -> Result<f64, RegistryError> {
        let request = channel.read_request()?;
        let response = self.request(&channel.link, &request).await?;
        self.finish(channel, &response)
    }

    fn finish(&self, channel: &DeviceChannel, response: &Response) -> Result<f64, RegistryError> {
        let raw = channel.decode_raw(response)?;
        channel.to_display(raw, self.display_unit)
    }

    /// Read every channel on `link`, sequentially
    ///
    /// Serial meter fields share one poll per call.
    pub async fn poll_link(&self, link: &str) -> Vec<(String, Option<f64>)> {
        let mut readings = Vec::new();
        let mut meter_reply: Option<Result<Response, RegistryError>> = None;

        for channel in self.channels.iter().filter(|c| c.link == link) {
            let result = if channel.is_field() {
                let reply = match &meter_reply {
                    Some(reply) => reply.clone(),
                    None => {
                        let reply = self
                            .request(link, &Request::Serial(SerialCommand::ReadAll))
                            .await;
                        meter_reply = Some(reply.clone());
                        reply
                    },
                };
                reply.and_then(|response| self.finish(channel, &response))
            } else {
                self.try_read_channel(channel).await
            };
            readings.push((channel.name.clone(), settle(channel, result)));
        }
        readings
    }

    /// Write a display value to a writable channel
    pub async fn write(&self, name: &str, value: f64) -> Result<(), RegistryError> {
        let channel = self.lookup(name)?;
        if !channel.writable {
            return Err(RegistryError::NotWritable(name.to_string()));
        }
        let entry = self.entry(&channel.link)?;
        let raw = channel.to_raw(value, self.display_unit)?;
        let request = channel.write_request(raw, entry.options.multiple_write)?;
        debug!("Writing {} = {} (raw {})", name, value, raw);
        entry.manager.request(&request).await?;
        Ok(())
    }

    /// Mask write on a holding register channel
    pub async fn write_masked(
        &self,
        name: &str,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), RegistryError> {
        let channel = self.lookup(name)?;
        if !channel.writable {
            return Err(RegistryError::NotWritable(name.to_string()));
        }
        match channel.modbus_address()? {
            Some(address) if address.table == RegisterTable::HoldingRegisters => {
                self.mask_write(&channel.link, channel.slave, address.address, and_mask, or_mask)
                    .await
            },
            _ => Err(RegistryError::NotWritable(name.to_string())),
        }
    }

    /// Write `value` as BCD through the bits of `and_mask` that are clear
    pub async fn write_bcd_masked(
        &self,
        name: &str,
        value: f64,
        and_mask: u16,
    ) -> Result<(), RegistryError> {
        let digits = value.round();
        if !(0.0..=9_999.0).contains(&digits) {
            return Err(FrameError::OutOfRange { value, kind: "bcd16" }.into());
        }
        let bcd = encode_bcd(digits as u32, 4)? as u16;
        self.write_masked(name, and_mask, bcd).await
    }

    /// FC22, or read + FC6 with the combined value when the link lacks FC22
    pub async fn mask_write(
        &self,
        link: &str,
        slave: u8,
        register: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(link)?;
        if entry.options.mask_write {
            self.modbus(
                link,
                ModbusRequest::new(
                    slave,
                    ModbusOp::MaskWriteRegister {
                        address: register,
                        and_mask,
                        or_mask,
                    },
                ),
            )
            .await?;
            return Ok(());
        }

        let current = match self
            .modbus(
                link,
                ModbusRequest::new(
                    slave,
                    ModbusOp::ReadHoldingRegisters {
                        address: register,
                        count: 1,
                    },
                ),
            )
            .await?
        {
            ModbusResponse::Registers(registers) => registers
                .first()
                .copied()
                .ok_or_else(|| RegistryError::unexpected(link, "empty register reply"))?,
            _ => return Err(RegistryError::unexpected(link, "expected registers")),
        };
        let value = masked_value(current, and_mask, or_mask);
        debug!(
            "Simulated mask write on {} slave {} register {}: {:#06X} -> {:#06X}",
            link, slave, register, current, value
        );
        self.modbus(
            link,
            ModbusRequest::new(slave, ModbusOp::WriteSingleRegister { address: register, value }),
        )
        .await?;
        Ok(())
    }
}

/// Failed reads become gaps
fn settle(channel: &DeviceChannel, result: Result<f64, RegistryError>) -> Option<f64> {
    match result {
        Ok(value) => Some(value),
        Err(RegistryError::Link(e)) => {
            debug!("Read of {} failed: {}", channel.name, e);
            None
        },
        Err(e) => {
            warn!("Read of {} failed: {}", channel.name, e);
            None
        },
    }
}

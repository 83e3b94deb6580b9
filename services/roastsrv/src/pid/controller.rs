//! PID controller over a Modbus link
//!
//! Every operation is a short sequence of register reads and writes on the
//! controller's own link. State is only updated once the device accepted
//! the write (and, with `readback_after_write`, reported the same value back).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use roast_protocols::{
    LinkManager, ModbusAddress, ModbusOp, ModbusRequest, ModbusResponse, RegisterTable, Request,
    Response,
};

use super::family::{decode_signed, encode_signed, PidFamily, RegisterMap, Switch};
use super::ramp_soak::{BackgroundProfile, EndMode, RampSoakProgram, RampSoakSegment, RampSoakStep};
use super::state::{PidMode, PidState};
use crate::error::PidError;

fn default_slave() -> u8 {
    1
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub name: String,
    pub link: String,
    #[serde(default = "default_slave")]
    pub slave: u8,
    #[serde(default)]
    pub family: PidFamily,
    /// Overrides the family's SV divider
    #[serde(default)]
    pub sv_divider: Option<f64>,
    /// Read every SV/PID write back and compare
    #[serde(default)]
    pub readback_after_write: bool,
    #[serde(default)]
    pub end_mode: EndMode,
    #[serde(default)]
    pub segments: Vec<RampSoakSegment>,
    /// SV curve followed in background-follow mode
    #[serde(default)]
    pub background: BackgroundProfile,
    /// Seconds ahead of now the background SV is taken from
    #[serde(default)]
    pub lookahead: f64,
}

impl PidConfig {
    pub fn new(name: impl Into<String>, link: impl Into<String>, family: PidFamily) -> Self {
        Self {
            name: name.into(),
            link: link.into(),
            slave: default_slave(),
            family,
            sv_divider: None,
            readback_after_write: false,
            end_mode: EndMode::default(),
            segments: Vec::new(),
            background: BackgroundProfile::default(),
            lookahead: 0.0,
        }
    }

    pub fn sv_divider(&self) -> f64 {
        self.sv_divider
            .unwrap_or_else(|| self.family.default_sv_divider())
    }

    pub fn validate(&self) -> Result<(), String> {
        let divider = self.sv_divider();
        if !divider.is_finite() || divider <= 0.0 {
            return Err(format!("PID {}: sv_divider must be positive", self.name));
        }
        let max = self.family.max_segments();
        if self.segments.len() > max {
            return Err(format!(
                "PID {}: {} ramp/soak segments, {} supports {}",
                self.name,
                self.segments.len(),
                self.family.name(),
                max
            ));
        }
        if self
            .segments
            .iter()
            .any(|s| !(s.ramp >= 0.0 && s.soak >= 0.0 && s.sv.is_finite()))
        {
            return Err(format!("PID {}: invalid ramp/soak segment", self.name));
        }
        if self.lookahead < 0.0 {
            return Err(format!("PID {}: lookahead cannot be negative", self.name));
        }
        Ok(())
    }
}

/// One temperature controller
#[derive(Debug)]
pub struct PidController {
    config: PidConfig,
    link: Arc<LinkManager>,
    state: PidState,
    program: RampSoakProgram,
    /// Mode `PID ON` switches into
    on_mode: PidMode,
}

impl PidController {
    pub fn new(config: PidConfig, link: Arc<LinkManager>) -> Self {
        let program = RampSoakProgram::new(config.segments.clone(), config.end_mode);
        Self {
            config,
            link,
            state: PidState::new(),
            program,
            on_mode: PidMode::Manual,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn family(&self) -> PidFamily {
        self.config.family
    }

    pub fn state(&self) -> &PidState {
        &self.state
    }

    pub fn program(&self) -> &RampSoakProgram {
        &self.program
    }

    fn registers(&self) -> &'static RegisterMap {
        self.config.family.registers()
    }

    fn sv_reference(&self) -> u32 {
        self.registers().sv + u32::from(self.state.sv_slot.saturating_sub(1))
    }

    async fn exchange(&self, op: ModbusOp) -> Result<ModbusResponse, PidError> {
        let request = Request::Modbus(ModbusRequest::new(self.config.slave, op));
        match self.link.request(&request).await? {
            Response::Modbus(response) => Ok(response),
            other => Err(PidError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn read_block(&self, reference: u32, count: u16) -> Result<Vec<u16>, PidError> {
        let address = ModbusAddress::from_reference(reference)?;
        let wanted = usize::from(count);
        match self
            .exchange(ModbusOp::read(address.table, address.address, count))
            .await?
        {
            ModbusResponse::Registers(values) if values.len() >= wanted => {
                Ok(values.into_iter().take(wanted).collect())
            },
            ModbusResponse::Bits(bits) if bits.len() >= wanted => {
                Ok(bits.into_iter().take(wanted).map(u16::from).collect())
            },
            other => Err(PidError::UnexpectedResponse(format!(
                "{other:?} for {count} values at {reference}"
            ))),
        }
    }

    async fn read_reference(&self, reference: u32) -> Result<u16, PidError> {
        let values = self.read_block(reference, 1).await?;
        values
            .first()
            .copied()
            .ok_or_else(|| PidError::UnexpectedResponse(format!("empty reply for {reference}")))
    }

    async fn write_reference(&self, reference: u32, value: u16) -> Result<(), PidError> {
        let address = ModbusAddress::from_reference(reference)?;
        let op = match address.table {
            RegisterTable::Coils => ModbusOp::WriteSingleCoil {
                address: address.address,
                value: value != 0,
            },
            RegisterTable::HoldingRegisters => ModbusOp::WriteSingleRegister {
                address: address.address,
                value,
            },
            _ => {
                return Err(PidError::InvalidValue(format!(
                    "reference {reference} is read-only"
                )))
            },
        };
        self.exchange(op).await?;
        Ok(())
    }

    /// Write, then read back when configured
    async fn write_checked(
        &self,
        what: &'static str,
        reference: u32,
        raw: u16,
        divider: f64,
    ) -> Result<(), PidError> {
        self.write_reference(reference, raw).await?;
        if self.config.readback_after_write {
            let read = self.read_reference(reference).await?;
            if read != raw {
                warn!(
                    "PID {}: {} write of {} read back as {}",
                    self.config.name, what, raw, read
                );
                return Err(PidError::NotAcknowledged {
                    what,
                    written: decode_signed(raw, divider),
                    read: decode_signed(read, divider),
                });
            }
        }
        Ok(())
    }

    async fn switch(&self, switch: Switch, on: bool) -> Result<(), PidError> {
        self.write_reference(switch.reference, switch.value(on)).await
    }

    /// Current PV; `None` when the read failed
    pub async fn read_pv(&mut self) -> Option<f64> {
        let divider = self.config.sv_divider();
        let pv = match self.read_reference(self.registers().pv).await {
            Ok(raw) => Some(decode_signed(raw, divider)),
            Err(e) => {
                debug!("PID {}: PV read failed: {}", self.config.name, e);
                None
            },
        };
        self.state.pv = pv;
        pv
    }

    pub async fn read_sv(&mut self) -> Result<f64, PidError> {
        let raw = self.read_reference(self.sv_reference()).await?;
        self.state.sv = decode_signed(raw, self.config.sv_divider());
        Ok(self.state.sv)
    }

    /// Write the SV of the active slot
    pub async fn set_sv(&mut self, value: f64) -> Result<(), PidError> {
        let divider = self.config.sv_divider();
        let raw = encode_signed(value, divider)?;
        self.write_checked("SV", self.sv_reference(), raw, divider)
            .await?;
        self.state.sv = decode_signed(raw, divider);
        debug!("PID {}: SV set to {}", self.config.name, self.state.sv);
        Ok(())
    }

    /// Make SV slot `slot` (1-based) the active one
    pub async fn select_sv(&mut self, slot: u8) -> Result<(), PidError> {
        let map = self.registers();
        let Some(selector) = map.select_sv else {
            return Err(PidError::Unsupported {
                family: self.config.family.name(),
                feature: "SV slot selection",
            });
        };
        if slot == 0 || slot > map.sv_slots {
            return Err(PidError::InvalidValue(format!(
                "SV slot {slot} outside 1..={}",
                map.sv_slots
            )));
        }
        self.write_reference(selector, u16::from(slot)).await?;
        self.state.sv_slot = slot;
        info!("PID {}: SV slot {} selected", self.config.name, slot);
        Ok(())
    }

    pub async fn read_pid(&mut self) -> Result<(f64, f64, f64), PidError> {
        let map = self.registers();
        let divider = map.pid_divider;
        let p = decode_signed(self.read_reference(map.p).await?, divider);
        let i = decode_signed(self.read_reference(map.i).await?, divider);
        let d = decode_signed(self.read_reference(map.d).await?, divider);
        self.state.p = p;
        self.state.i = i;
        self.state.d = d;
        Ok((p, i, d))
    }

    pub async fn set_pid(&mut self, p: f64, i: f64, d: f64) -> Result<(), PidError> {
        let map = self.registers();
        let divider = map.pid_divider;
        let raw = [
            encode_signed(p, divider)?,
            encode_signed(i, divider)?,
            encode_signed(d, divider)?,
        ];
        self.write_checked("P", map.p, raw[0], divider).await?;
        self.write_checked("I", map.i, raw[1], divider).await?;
        self.write_checked("D", map.d, raw[2], divider).await?;
        self.state.p = decode_signed(raw[0], divider);
        self.state.i = decode_signed(raw[1], divider);
        self.state.d = decode_signed(raw[2], divider);
        info!(
            "PID {}: p={} i={} d={}",
            self.config.name, self.state.p, self.state.i, self.state.d
        );
        Ok(())
    }

    /// Put the output in standby or back to run without changing the mode
    pub async fn set_standby(&mut self, standby: bool) -> Result<(), PidError> {
        let Some(run) = self.registers().run else {
            return Err(PidError::Unsupported {
                family: self.config.family.name(),
                feature: "run/standby switch",
            });
        };
        self.switch(run, !standby).await?;
        self.state.standby = standby;
        Ok(())
    }

    /// Switch on into `mode`, or change between the on modes
    pub async fn pid_on(&mut self, mode: PidMode, now: f64) -> Result<(), PidError> {
        let from = self.state.mode;
        if !mode.is_on_mode() || from == PidMode::Autotune {
            return Err(PidError::InvalidTransition { from, to: mode });
        }
        if from == mode {
            return Ok(());
        }
        match mode {
            PidMode::RampSoak if self.program.segments().is_empty() => {
                return Err(PidError::InvalidValue("no ramp/soak segments loaded".into()))
            },
            PidMode::BackgroundFollow if self.config.background.is_empty() => {
                return Err(PidError::InvalidValue("no background profile loaded".into()))
            },
            _ => {},
        }

        let map = self.registers();
        if from == PidMode::RampSoak {
            if let Some(ramp_soak) = map.ramp_soak {
                self.switch(ramp_soak, false).await?;
            }
            self.program.stop();
        }
        if !self.state.on || self.state.standby {
            if let Some(run) = map.run {
                self.switch(run, true).await?;
            }
        }
        if mode == PidMode::RampSoak {
            if let Some(ramp_soak) = map.ramp_soak {
                self.switch(ramp_soak, true).await?;
            }
            self.program.start(now, self.state.sv);
        }

        self.state.mode = mode;
        self.state.on = true;
        self.state.standby = false;
        self.state.segment = (mode == PidMode::RampSoak).then_some(0);
        self.on_mode = mode;
        info!("PID {} ON ({})", self.config.name, mode);
        Ok(())
    }

    pub async fn pid_off(&mut self) -> Result<(), PidError> {
        let map = self.registers();
        match self.state.mode {
            PidMode::Off => return Ok(()),
            PidMode::RampSoak => {
                if let Some(ramp_soak) = map.ramp_soak {
                    self.switch(ramp_soak, false).await?;
                }
            },
            PidMode::Autotune => {
                if let Some(autotune) = map.autotune {
                    self.switch(autotune, false).await?;
                }
            },
            PidMode::Manual | PidMode::BackgroundFollow => {},
        }
        if let Some(run) = map.run {
            self.switch(run, false).await?;
        }
        self.program.stop();
        self.state.mode = PidMode::Off;
        self.state.on = false;
        self.state.standby = map.run.is_some();
        self.state.segment = None;
        info!("PID {} OFF", self.config.name);
        Ok(())
    }

    /// `PID ON` into the last used on mode; no-op when already on
    pub async fn turn_on(&mut self, now: f64) -> Result<(), PidError> {
        if self.state.on {
            return Ok(());
        }
        self.pid_on(self.on_mode, now).await
    }

    /// `PID ON` into the last used on mode, or `PID OFF`
    pub async fn toggle(&mut self, now: f64) -> Result<(), PidError> {
        if self.state.on {
            self.pid_off().await
        } else {
            self.pid_on(self.on_mode, now).await
        }
    }

    /// Mode for the next `PID ON`; applied right away when already on
    pub async fn set_mode(&mut self, mode: PidMode, now: f64) -> Result<(), PidError> {
        if !mode.is_on_mode() {
            return Err(PidError::InvalidTransition {
                from: self.state.mode,
                to: mode,
            });
        }
        if self.state.on {
            self.pid_on(mode, now).await
        } else {
            self.on_mode = mode;
            Ok(())
        }
    }

    /// Only permitted from MANUAL
    pub async fn start_autotune(&mut self) -> Result<(), PidError> {
        if self.state.mode != PidMode::Manual {
            return Err(PidError::InvalidTransition {
                from: self.state.mode,
                to: PidMode::Autotune,
            });
        }
        let Some(autotune) = self.registers().autotune else {
            return Err(PidError::Unsupported {
                family: self.config.family.name(),
                feature: "autotune",
            });
        };
        self.switch(autotune, true).await?;
        self.state.mode = PidMode::Autotune;
        info!("PID {} autotune on", self.config.name);
        Ok(())
    }

    /// Check for autotune completion; returns true once back in MANUAL
    pub async fn poll_autotune(&mut self) -> Result<bool, PidError> {
        if self.state.mode != PidMode::Autotune {
            return Ok(false);
        }
        let Some(autotune) = self.registers().autotune else {
            return Ok(false);
        };
        if self.read_reference(autotune.reference).await? == autotune.on {
            return Ok(false);
        }
        let (p, i, d) = self.read_pid().await?;
        self.state.mode = PidMode::Manual;
        info!(
            "PID {} autotune finished: p={} i={} d={}",
            self.config.name, p, i, d
        );
        Ok(true)
    }

    /// Validate and write a ramp/soak program
    ///
    /// Segment times may be in any order; only the count is checked.
    pub async fn upload_ramp_soak(&mut self, segments: &[RampSoakSegment]) -> Result<(), PidError> {
        if self.state.mode == PidMode::RampSoak {
            return Err(PidError::InvalidValue(
                "cannot replace a running ramp/soak program".into(),
            ));
        }
        let registers = self
            .config
            .family
            .encode_ramp_soak(segments, self.config.sv_divider())?;
        if let Some(base) = self.registers().segments {
            let address = ModbusAddress::from_reference(base)?;
            self.exchange(ModbusOp::WriteMultipleRegisters {
                address: address.address,
                values: registers,
            })
            .await?;
        }
        self.program.set_segments(segments.to_vec());
        info!(
            "PID {}: {} ramp/soak segments uploaded",
            self.config.name,
            segments.len()
        );
        Ok(())
    }

    /// Ramp/soak program stored in the device
    pub async fn read_ramp_soak(&mut self) -> Result<Vec<RampSoakSegment>, PidError> {
        let Some(base) = self.registers().segments else {
            return Ok(self.program.segments().to_vec());
        };
        let count = (self.config.family.max_segments() * 3) as u16;
        let registers = self.read_block(base, count).await?;
        self.config
            .family
            .decode_ramp_soak(&registers, self.config.sv_divider())
    }

    /// Move ramp/soak or background follow on to `now`
    ///
    /// Returns the active ramp/soak segment.
    pub async fn advance(&mut self, now: f64) -> Result<Option<usize>, PidError> {
        match self.state.mode {
            PidMode::RampSoak => self.advance_ramp_soak(now).await?,
            PidMode::BackgroundFollow => {
                let target = self.config.background.sv_at(now + self.config.lookahead);
                self.follow(target).await?;
            },
            _ => {},
        }
        Ok(self.state.segment)
    }

    async fn advance_ramp_soak(&mut self, now: f64) -> Result<(), PidError> {
        let map = self.registers();
        let device_done = match (map.ramp_soak, map.ramp_soak_status) {
            (Some(_), Some(status)) => match self.read_reference(status).await {
                Ok(value) => value != 0,
                Err(e) => {
                    debug!("PID {}: ramp/soak status read failed: {}", self.config.name, e);
                    false
                },
            },
            _ => false,
        };

        match self.program.advance(now, device_done) {
            RampSoakStep::Idle => self.state.segment = None,
            RampSoakStep::Active(index) => {
                if self.state.segment != Some(index) {
                    info!("PID {}: ramp/soak segment {}", self.config.name, index + 1);
                }
                self.state.segment = Some(index);
                if map.ramp_soak.is_none() {
                    self.follow(self.program.setpoint(now)).await?;
                }
            },
            RampSoakStep::Finished => match self.program.end_mode() {
                EndMode::Off => {
                    info!("PID {}: ramp/soak finished", self.config.name);
                    self.pid_off().await?;
                },
                _ => {
                    if map.ramp_soak.is_none() {
                        self.follow(self.program.setpoint(now)).await?;
                    }
                    self.state.segment = self.program.segments().len().checked_sub(1);
                },
            },
        }
        Ok(())
    }

    /// Write `target` when it moved by at least the SV resolution
    async fn follow(&mut self, target: Option<f64>) -> Result<(), PidError> {
        let Some(target) = target else {
            return Ok(());
        };
        let resolution = 1.0 / self.config.sv_divider();
        if (target - self.state.sv).abs() + 1e-9 >= resolution {
            self.set_sv(target).await?;
        }
        Ok(())
    }

    /// Forget ramp/soak progress (RESET); the device is left as it is
    pub fn reset(&mut self) {
        self.program.stop();
        if self.state.mode == PidMode::RampSoak {
            self.program.start(0.0, self.state.sv);
            self.state.segment = Some(0);
        } else {
            self.state.segment = None;
        }
    }
}

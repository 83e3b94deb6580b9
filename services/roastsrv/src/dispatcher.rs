//! Command Dispatcher
//!
//! Executes alarm triggers and command strings against the links, the PID
//! controllers and the roast events. Anything meant for a user interface
//! (pop-ups, colours, programs to launch, slider positions) is published as
//! a [`UiEvent`]; consuming those is left to external collaborators.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use roast_alarms::{
    parse_with, ActionKind, AlarmEngine, AlarmTrigger, Bindings, Command, RoastEvent, RoastEvents,
    Sample,
};
use roast_comlink::Clock;
use roast_protocols::value::{encode_bcd, encode_value};
use roast_protocols::{
    ByteOrder, DecodeKind, FrameError, ModbusOp, ModbusRequest, Request, S7Area, S7Request, S7Type,
    WordOrder,
};

use crate::config::DispatcherConfig;
use crate::devices::{DeviceRegistry, RegistryError};
use crate::error::{DispatchError, PidError};
use crate::pid::{PidController, PidMode};

const UI_EVENT_CAPACITY: usize = 64;

/// Button and slider commands may reference further buttons and sliders;
/// expansion stops after this many
const MAX_EXPANSIONS: usize = 16;

/// Notification for external consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    PopUp { text: String },
    CallProgram { program: String },
    Color { name: String },
    Button { number: u32 },
    Slider { slider: u8, value: f64 },
    EventMarked { event: String, time: f64 },
    Reset,
}

/// State commands act on, borrowed from the session for one dispatch
pub struct Context<'a> {
    pub registry: &'a DeviceRegistry,
    pub pids: &'a mut [PidController],
    pub alarms: &'a mut AlarmEngine,
    pub events: &'a mut RoastEvents,
    /// Latest sample, for `{ET}`, `{BT}` and `{time}`
    pub latest: Option<&'a Sample>,
    /// Seconds since recording start
    pub now: f64,
}

impl Context<'_> {
    /// RESET: fired flags, roast events and ramp/soak progress
    pub fn reset(&mut self) {
        self.alarms.reset();
        self.events.reset();
        for pid in self.pids.iter_mut() {
            pid.reset();
        }
    }

    pub fn bindings(&self) -> Bindings {
        Bindings {
            et: self.latest.and_then(|s| s.get("ET")),
            bt: self.latest.and_then(|s| s.get("BT")),
            time: Some(self.latest.map_or(self.now, |s| s.time)),
            ..Bindings::default()
        }
    }
}

fn register_value(value: f64) -> Result<u16, RegistryError> {
    let rounded = value.round();
    if !(-32768.0..=65535.0).contains(&rounded) {
        return Err(FrameError::OutOfRange {
            value,
            kind: "register",
        }
        .into());
    }
    if rounded < 0.0 {
        Ok(rounded as i16 as u16)
    } else {
        Ok(rounded as u16)
    }
}

fn bcd_register(value: f64) -> Result<u16, RegistryError> {
    let rounded = value.round();
    if !(0.0..=9999.0).contains(&rounded) {
        return Err(FrameError::OutOfRange { value, kind: "bcd" }.into());
    }
    Ok(encode_bcd(rounded as u32, 4)? as u16)
}

/// Routes commands to their targets
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    ui: broadcast::Sender<UiEvent>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        let (ui, _) = broadcast::channel(UI_EVENT_CAPACITY);
        Self { config, clock, ui }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    fn publish(&self, event: UiEvent) {
        // No subscribers is fine
        let _ = self.ui.send(event);
    }

    fn modbus_link(&self) -> Result<&str, DispatchError> {
        self.config
            .modbus_link
            .as_deref()
            .ok_or(DispatchError::NoLink("Modbus"))
    }

    fn s7_link(&self) -> Result<&str, DispatchError> {
        self.config
            .s7_link
            .as_deref()
            .ok_or(DispatchError::NoLink("S7"))
    }

    fn pid<'p>(
        &self,
        pids: &'p mut [PidController],
    ) -> Result<&'p mut PidController, DispatchError> {
        match &self.config.pid {
            Some(name) => pids.iter_mut().find(|pid| pid.name() == name.as_str()),
            None => pids.first_mut(),
        }
        .ok_or(DispatchError::NoPid)
    }

    /// Carry out the action of a triggered alarm
    pub async fn handle_trigger(
        &self,
        trigger: &AlarmTrigger,
        ctx: &mut Context<'_>,
    ) -> Result<(), DispatchError> {
        info!(
            "Alarm {} triggered at {:.1}s ({:?}: {})",
            trigger.nr, trigger.time, trigger.action, trigger.payload
        );
        let payload = trigger.payload.trim();
        match trigger.action {
            ActionKind::PopUp => self.publish(UiEvent::PopUp {
                text: payload.to_string(),
            }),
            ActionKind::CallProgram => self.publish(UiEvent::CallProgram {
                program: payload.to_string(),
            }),
            ActionKind::CanvasColor => self.publish(UiEvent::Color {
                name: payload.to_string(),
            }),
            ActionKind::EventButton => {
                let number: u8 = payload.parse().map_err(|_| DispatchError::InvalidPayload {
                    what: "button number",
                    value: payload.to_string(),
                })?;
                self.press_button(number, ctx).await?;
            },
            ActionKind::PidOn => self.pid(ctx.pids)?.turn_on(trigger.time).await?,
            ActionKind::PidOff => self.pid(ctx.pids)?.pid_off().await?,
            ActionKind::RampSoakOn => {
                self.pid(ctx.pids)?
                    .pid_on(PidMode::RampSoak, trigger.time)
                    .await?
            },
            ActionKind::RampSoakOff => {
                let pid = self.pid(ctx.pids)?;
                if pid.state().mode == PidMode::RampSoak {
                    pid.pid_on(PidMode::Manual, trigger.time).await?;
                }
            },
            ActionKind::PidSv => {
                let sv: f64 = payload.parse().map_err(|_| DispatchError::InvalidPayload {
                    what: "SV",
                    value: payload.to_string(),
                })?;
                self.pid(ctx.pids)?.set_sv(sv).await?;
            },
            ActionKind::Command => {
                let mut bindings = ctx.bindings();
                bindings.value = Some(trigger.value);
                bindings.factor = 1.0;
                self.run(payload, &bindings, ctx).await?;
            },
            action => {
                if let Some(slider) = action.slider() {
                    let value: f64 = payload.parse().map_err(|_| DispatchError::InvalidPayload {
                        what: "slider value",
                        value: payload.to_string(),
                    })?;
                    self.move_slider(slider, value, ctx).await?;
                } else if let Some(event) = action.event() {
                    self.mark(event, trigger.time, ctx);
                }
            },
        }
        Ok(())
    }

    /// Run the command string of event button `number`
    pub async fn press_button(
        &self,
        number: u8,
        ctx: &mut Context<'_>,
    ) -> Result<usize, DispatchError> {
        self.run(&format!("button({number})"), &Bindings::default(), ctx)
            .await
    }

    /// Move slider `number` to `value` and run its command
    pub async fn move_slider(
        &self,
        number: u8,
        value: f64,
        ctx: &mut Context<'_>,
    ) -> Result<usize, DispatchError> {
        self.run(&format!("slider({number},{value})"), &Bindings::default(), ctx)
            .await
    }

    /// Substitute, parse and execute a command string
    ///
    /// Commands run in order and the sequence stops at the first failure.
    /// Returns the number of commands executed.
    pub async fn run(
        &self,
        template: &str,
        bindings: &Bindings,
        ctx: &mut Context<'_>,
    ) -> Result<usize, DispatchError> {
        let mut queue: VecDeque<Command> = parse_with(template, bindings)?.into();
        let mut expansions = 0;
        let mut executed = 0;

        while let Some(command) = queue.pop_front() {
            let expansion = match &command {
                Command::Button(number) => u8::try_from(*number)
                    .ok()
                    .and_then(|n| self.config.button(n))
                    .map(|cmd| (cmd.to_string(), ctx.bindings())),
                Command::Slider { slider, value } => self.config.slider(*slider).map(|s| {
                    let mut bindings = ctx.bindings();
                    bindings.value = Some(*value);
                    bindings.factor = s.factor;
                    bindings.offset = s.offset;
                    (s.command.clone(), bindings)
                }),
                _ => None,
            };
            if let Some((nested, bindings)) = expansion {
                expansions += 1;
                if expansions > MAX_EXPANSIONS {
                    return Err(DispatchError::ExpansionLimit(template.to_string()));
                }
                for cmd in parse_with(&nested, &bindings)?.into_iter().rev() {
                    queue.push_front(cmd);
                }
            }

            self.execute(command, ctx).await?;
            executed += 1;
        }
        Ok(executed)
    }

    fn mark(&self, event: RoastEvent, time: f64, ctx: &mut Context<'_>) {
        if ctx.events.mark(event, time) {
            info!("{} at {:.1}s", event.keyword(), time);
            self.publish(UiEvent::EventMarked {
                event: event.keyword().to_string(),
                time,
            });
        } else {
            debug!("{} already marked", event.keyword());
        }
    }

    async fn write_registers(
        &self,
        ctx: &Context<'_>,
        slave: u8,
        register: u16,
        values: Vec<u16>,
    ) -> Result<(), DispatchError> {
        let link = self.modbus_link()?;
        let multiple = ctx
            .registry
            .link_options(link)
            .is_some_and(|options| options.multiple_write);
        let op = match values.as_slice() {
            [value] if !multiple => ModbusOp::WriteSingleRegister {
                address: register,
                value: *value,
            },
            _ => ModbusOp::WriteMultipleRegisters {
                address: register,
                values,
            },
        };
        ctx.registry
            .modbus(link, ModbusRequest::new(slave, op))
            .await?;
        Ok(())
    }

    async fn write_coils(
        &self,
        ctx: &Context<'_>,
        slave: u8,
        register: u16,
        values: Vec<bool>,
    ) -> Result<(), DispatchError> {
        let link = self.modbus_link()?;
        let multiple = ctx
            .registry
            .link_options(link)
            .is_some_and(|options| options.multiple_write);
        let op = match values.as_slice() {
            [value] if !multiple => ModbusOp::WriteSingleCoil {
                address: register,
                value: *value,
            },
            _ => ModbusOp::WriteMultipleCoils {
                address: register,
                values,
            },
        };
        ctx.registry
            .modbus(link, ModbusRequest::new(slave, op))
            .await?;
        Ok(())
    }

    async fn write_db(&self, ctx: &Context<'_>, request: S7Request) -> Result<(), DispatchError> {
        let link = self.s7_link()?;
        ctx.registry.request(link, &Request::S7(request)).await?;
        Ok(())
    }

    async fn execute(&self, command: Command, ctx: &mut Context<'_>) -> Result<(), DispatchError> {
        debug!("Executing {:?}", command);
        match command {
            Command::Event(event) => self.mark(event, ctx.now, ctx),
            Command::PidOn => self.pid(ctx.pids)?.turn_on(ctx.now).await?,
            Command::PidOff => self.pid(ctx.pids)?.pid_off().await?,
            Command::PidToggle => self.pid(ctx.pids)?.toggle(ctx.now).await?,
            Command::Reset => {
                ctx.reset();
                info!("Session reset");
                self.publish(UiEvent::Reset);
            },
            Command::Write {
                slave,
                register,
                value,
            } => {
                let raw = register_value(value)?;
                self.write_registers(ctx, slave, register, vec![raw]).await?;
            },
            Command::WriteMultiple {
                slave,
                register,
                values,
            } => {
                let raw = values
                    .into_iter()
                    .map(register_value)
                    .collect::<Result<Vec<_>, _>>()?;
                self.write_registers(ctx, slave, register, raw).await?;
            },
            Command::WriteWord {
                slave,
                register,
                value,
            } => {
                let raw = encode_value(
                    value,
                    DecodeKind::Float32,
                    ByteOrder::default(),
                    WordOrder::default(),
                )
                .map_err(RegistryError::from)?;
                self.write_registers(ctx, slave, register, raw).await?;
            },
            Command::WriteBcd {
                slave,
                register,
                value,
            } => {
                let raw = bcd_register(value)?;
                self.write_registers(ctx, slave, register, vec![raw]).await?;
            },
            Command::WriteCoil {
                slave,
                register,
                value,
            } => self.write_coils(ctx, slave, register, vec![value]).await?,
            Command::WriteCoils {
                slave,
                register,
                values,
            } => self.write_coils(ctx, slave, register, values).await?,
            Command::MaskWrite {
                slave,
                register,
                and_mask,
                or_mask,
            } => {
                let link = self.modbus_link()?;
                ctx.registry
                    .mask_write(link, slave, register, and_mask, or_mask)
                    .await?;
            },
            Command::SetDbInt { db, start, value } => {
                let data = S7Type::Int
                    .encode(value as f64)
                    .map_err(RegistryError::from)?;
                self.write_db(
                    ctx,
                    S7Request::Write {
                        area: S7Area::DataBlock,
                        db,
                        start,
                        data,
                    },
                )
                .await?;
            },
            Command::SetDbFloat { db, start, value } => {
                let data = S7Type::Real.encode(value).map_err(RegistryError::from)?;
                self.write_db(
                    ctx,
                    S7Request::Write {
                        area: S7Area::DataBlock,
                        db,
                        start,
                        data,
                    },
                )
                .await?;
            },
            Command::SetDbBool {
                db,
                start,
                bit,
                value,
            } => {
                self.write_db(
                    ctx,
                    S7Request::WriteBit {
                        area: S7Area::DataBlock,
                        db,
                        start,
                        bit,
                        value,
                    },
                )
                .await?;
            },
            Command::SetSv(sv) => self.pid(ctx.pids)?.set_sv(sv).await?,
            Command::PidMode(index) => {
                let mode = PidMode::from_index(index)
                    .ok_or_else(|| PidError::InvalidValue(format!("pidmode({index})")))?;
                self.pid(ctx.pids)?.set_mode(mode, ctx.now).await?;
            },
            Command::Sleep(secs) => {
                let pause = Duration::try_from_secs_f64(secs).map_err(|_| {
                    DispatchError::InvalidPayload {
                        what: "sleep duration",
                        value: secs.to_string(),
                    }
                })?;
                self.clock.sleep(pause).await;
                ctx.now += secs;
            },
            Command::Button(number) => {
                if u8::try_from(number)
                    .ok()
                    .and_then(|n| self.config.button(n))
                    .is_none()
                {
                    warn!("Button {} has no command", number);
                }
                self.publish(UiEvent::Button { number });
            },
            Command::Slider { slider, value } => self.publish(UiEvent::Slider { slider, value }),
            Command::PopUp(text) => self.publish(UiEvent::PopUp { text }),
            Command::Color(name) => self.publish(UiEvent::Color { name }),
        }
        Ok(())
    }
}

//! Roast session
//!
//! Owns the registry, the PID controllers, the alarm engine and the roast
//! events, and drives them from one loop: sample, advance the controllers,
//! evaluate alarms, dispatch their actions, hand the sample to the sinks.
//! Commands from outside arrive over a channel and run between ticks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use roast_alarms::{AlarmEngine, AlarmTable, RoastEvents, Sample};
use roast_comlink::Clock;
use roast_protocols::LinkManager;

use crate::config::RoastConfig;
use crate::devices::{DeviceRegistry, RegistryError};
use crate::dispatcher::{Context, Dispatcher, UiEvent};
use crate::error::{DispatchError, Result, RoastError};
use crate::pid::{PidController, PidMode, RampSoakSegment};
use crate::sampling::{SampleSink, Sampler};

const COMMAND_CAPACITY: usize = 32;

/// Requests handled between ticks
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Command string, as typed or sent by a UI
    Run(String),
    Button(u8),
    Slider { slider: u8, value: f64 },
    Reset,
    LoadAlarms(AlarmTable),
    /// Upload a ramp/soak program to a controller (the first when `None`)
    UploadRampSoak {
        pid: Option<String>,
        segments: Vec<RampSoakSegment>,
    },
    Stop,
}

/// Cloneable access to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RoastError::SessionClosed)
    }

    /// Stop without waiting for queued commands
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct RoastSession {
    registry: DeviceRegistry,
    pids: Vec<PidController>,
    alarms: AlarmEngine,
    events: RoastEvents,
    dispatcher: Dispatcher,
    sampler: Sampler,
    sinks: Vec<Box<dyn SampleSink>>,
    latest: Option<Sample>,
    clock: Arc<dyn Clock>,
    commands: mpsc::Receiver<SessionCommand>,
    command_tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
}

impl RoastSession {
    pub fn new(
        registry: DeviceRegistry,
        pids: Vec<PidController>,
        alarms: AlarmEngine,
        dispatcher: Dispatcher,
        sampler: Sampler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        Self {
            registry,
            pids,
            alarms,
            events: RoastEvents::new(),
            dispatcher,
            sampler,
            sinks: Vec::new(),
            latest: None,
            clock,
            commands,
            command_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Build links, registry, controllers and alarms from a validated config
    pub fn from_config(config: &RoastConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut registry = DeviceRegistry::new(config.session.display_unit);
        let mut links = HashMap::new();
        for link in &config.links {
            let manager = Arc::new(LinkManager::new(
                link.name.clone(),
                link.transport.clone(),
                link.protocol.codec(link.rack, link.slot),
                clock.clone(),
            ));
            registry.add_link(manager.clone(), link.options);
            links.insert(link.name.as_str(), manager);
        }
        for channel in &config.channels {
            registry.add_channel(channel.clone())?;
        }

        let pids = config
            .pids
            .iter()
            .map(|pid| {
                let link = links
                    .get(pid.link.as_str())
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownLink(pid.link.clone()))?;
                Ok(PidController::new(pid.clone(), link))
            })
            .collect::<Result<Vec<_>>>()?;

        let alarms = AlarmEngine::with_ror_window(config.alarm_table()?, config.session.ror_window);
        let dispatcher = Dispatcher::new(config.dispatcher.clone(), clock.clone());
        let sampler = Sampler::new(config.session.interval(), clock.clone());

        info!(
            "Session: {} links, {} channels, {} PIDs, {} alarms",
            config.links.len(),
            registry.channels().len(),
            pids.len(),
            alarms.table().len()
        );
        Ok(Self::new(registry, pids, alarms, dispatcher, sampler, clock))
    }

    pub fn add_sink(&mut self, sink: Box<dyn SampleSink>) {
        self.sinks.push(sink);
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.command_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.dispatcher.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn pids(&self) -> &[PidController] {
        &self.pids
    }

    pub fn pids_mut(&mut self) -> &mut [PidController] {
        &mut self.pids
    }

    pub fn events(&self) -> &RoastEvents {
        &self.events
    }

    pub fn alarms(&self) -> &AlarmEngine {
        &self.alarms
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.latest.as_ref()
    }

    /// Seconds since recording start, as of the latest sample
    fn now(&self) -> f64 {
        self.latest.as_ref().map_or(0.0, |s| s.time)
    }

    /// One complete sampling cycle
    pub async fn tick(&mut self) -> Sample {
        let sample = self.sampler.poll(&self.registry).await;

        for pid in self.pids.iter_mut() {
            let result = match pid.state().mode {
                PidMode::Autotune => pid.poll_autotune().await.map(|_| ()),
                _ => pid.advance(sample.time).await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!("PID {}: {}", pid.name(), e);
            }
        }

        let triggers = self.alarms.evaluate(&sample, &self.events);
        if !triggers.is_empty() {
            let mut ctx = Context {
                registry: &self.registry,
                pids: &mut self.pids,
                alarms: &mut self.alarms,
                events: &mut self.events,
                latest: Some(&sample),
                now: sample.time,
            };
            for trigger in &triggers {
                if let Err(e) = self.dispatcher.handle_trigger(trigger, &mut ctx).await {
                    warn!("Alarm {} action failed: {}", trigger.nr, e);
                }
            }
        }

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.record(&sample) {
                warn!("Sample sink failed: {}", e);
            }
        }

        self.latest = Some(sample.clone());
        sample
    }

    /// Handle one external command; returns false on `Stop`
    pub async fn execute(&mut self, command: SessionCommand) -> bool {
        debug!("Session command {:?}", command);
        let now = self.now();
        let mut ctx = Context {
            registry: &self.registry,
            pids: &mut self.pids,
            alarms: &mut self.alarms,
            events: &mut self.events,
            latest: self.latest.as_ref(),
            now,
        };
        let bindings = ctx.bindings();

        let result = match command {
            SessionCommand::Run(text) => self
                .dispatcher
                .run(&text, &bindings, &mut ctx)
                .await
                .map(|_| ()),
            SessionCommand::Button(number) => self
                .dispatcher
                .press_button(number, &mut ctx)
                .await
                .map(|_| ()),
            SessionCommand::Slider { slider, value } => self
                .dispatcher
                .move_slider(slider, value, &mut ctx)
                .await
                .map(|_| ()),
            SessionCommand::Reset => self
                .dispatcher
                .run("RESET", &bindings, &mut ctx)
                .await
                .map(|_| ()),
            SessionCommand::LoadAlarms(table) => {
                info!("Loaded {} alarms", table.len());
                ctx.alarms.load(table);
                Ok(())
            },
            SessionCommand::UploadRampSoak { pid, segments } => {
                let target = match &pid {
                    Some(name) => ctx.pids.iter_mut().find(|p| p.name() == name.as_str()),
                    None => ctx.pids.first_mut(),
                };
                match target {
                    Some(controller) => controller
                        .upload_ramp_soak(&segments)
                        .await
                        .map_err(Into::into),
                    None => Err(DispatchError::NoPid),
                }
            },
            SessionCommand::Stop => return false,
        };
        if let Err(e) = result {
            warn!("Command failed: {}", e);
        }
        true
    }

    /// Sample until cancelled or stopped
    pub async fn run(mut self) -> Result<()> {
        self.sampler.start();
        let cancel = self.cancel.clone();
        info!("Sampling every {:?}", self.sampler.interval());

        'session: loop {
            if cancel.is_cancelled() {
                break;
            }
            self.tick().await;

            let delay = self.sampler.until_next();
            let clock = self.clock.clone();
            let next_tick = async move { clock.sleep(delay).await };
            tokio::pin!(next_tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    _ = &mut next_tick => break,
                    Some(command) = self.commands.recv() => {
                        if !self.execute(command).await {
                            break 'session;
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Close every link
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.registry.link_names().map(str::to_string).collect();
        for name in names {
            if let Some(link) = self.registry.link(&name) {
                link.shutdown().await;
            }
        }
        if self.pids.iter().any(|pid| pid.state().on) {
            error!("Session stopped with a PID still on");
        }
        info!("Session stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::devices::{DeviceChannel, LinkOptions, TemperatureUnit};
    use crate::pid::{PidConfig, PidFamily};
    use crate::sampling::ChannelSink;
    use roast_alarms::{ActionKind, AlarmAnchor, AlarmRow, AlarmSource, Condition, RoastEvent};
    use roast_comlink::{ManualClock, MockTransport, TransportConfig};
    use roast_protocols::{ModbusSlave, Protocol};
    use std::time::Duration;

    fn session() -> (RoastSession, ModbusSlave) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let slave = ModbusSlave::new(1);
        for register in 0..8 {
            slave.set_holding(register, 0);
        }
        slave.set_holding(10, 2000);

        let mock = MockTransport::new("COM4");
        let responder = slave.clone();
        mock.handle()
            .set_responder(move |frame| responder.respond_rtu(frame));
        let link = Arc::new(LinkManager::with_transport(
            "roaster",
            TransportConfig::serial("COM4", 9600).with_retries(0),
            Protocol::ModbusRtu.codec(0, 0),
            Box::new(mock),
            clock.clone(),
        ));

        let mut registry = DeviceRegistry::new(TemperatureUnit::Celsius);
        registry.add_link(link.clone(), LinkOptions::default());
        registry
            .add_channel(DeviceChannel::modbus("BT", "roaster", 1, 400_011).with_divider(10.0))
            .unwrap();

        let table = AlarmTable::from_rows(vec![AlarmRow {
            nr: 1,
            status: true,
            if_alarm: 0,
            but_not: 0,
            from_event: AlarmAnchor::Start,
            time_offset: 0.0,
            source: AlarmSource::Channel("BT".into()),
            condition: Condition::Above,
            temperature: 150.0,
            action: ActionKind::Charge,
            description: String::new(),
        }])
        .unwrap();

        let pid = PidController::new(PidConfig::new("pid", "roaster", PidFamily::Generic), link);
        let dispatcher = Dispatcher::new(
            crate::config::DispatcherConfig {
                modbus_link: Some("roaster".into()),
                ..Default::default()
            },
            clock.clone(),
        );
        let sampler = Sampler::new(Duration::from_secs(3), clock.clone());
        let session = RoastSession::new(
            registry,
            vec![pid],
            AlarmEngine::new(table),
            dispatcher,
            sampler,
            clock,
        );
        (session, slave)
    }

    #[tokio::test]
    async fn test_tick_runs_alarms_then_sinks() {
        let (mut session, _slave) = session();
        let (sink, mut samples) = ChannelSink::new();
        session.add_sink(Box::new(sink));

        let sample = session.tick().await;
        assert_eq!(sample.get("BT"), Some(200.0));
        assert!(session.events().has(RoastEvent::Charge));
        assert_eq!(samples.recv().await.unwrap(), sample);
        assert_eq!(session.latest(), Some(&sample));
    }

    #[tokio::test]
    async fn test_reset_clears_events_and_alarms() {
        let (mut session, _slave) = session();
        session.tick().await;
        assert!(session.alarms().table().fired(1));

        assert!(session.execute(SessionCommand::Reset).await);
        assert!(!session.events().has(RoastEvent::Charge));
        assert!(!session.alarms().table().fired(1));
    }

    #[tokio::test]
    async fn test_commands_between_ticks() {
        let (mut session, slave) = session();
        session.tick().await;
        assert!(session.execute(SessionCommand::Run("write(1,3,77)".into())).await);
        assert_eq!(slave.holding(3), Some(77));

        assert!(
            session
                .execute(SessionCommand::UploadRampSoak {
                    pid: Some("missing".into()),
                    segments: vec![],
                })
                .await
        );
        assert!(!session.execute(SessionCommand::Stop).await);
    }

    #[tokio::test]
    async fn test_run_stops_on_command() {
        let (session, _slave) = session();
        let handle = session.handle();
        handle.send(SessionCommand::Stop).await.unwrap();
        session.run().await.unwrap();
        assert!(handle.send(SessionCommand::Reset).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (session, _slave) = session();
        let handle = session.handle();
        handle.cancel();
        session.run().await.unwrap();
    }
}

//! Service configuration
//!
//! Loaded once at start-up from a YAML, TOML or JSON file with `ROAST_`
//! environment overrides (`ROAST_SESSION__INTERVAL_MS=2000`). Everything is
//! validated here so that later construction cannot fail on bad input.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use roast_alarms::{AlarmRow, AlarmTable, DEFAULT_ROR_WINDOW};
use roast_comlink::TransportConfig;
use roast_protocols::Protocol;

use crate::devices::{DeviceChannel, LinkOptions, TemperatureUnit};
use crate::error::{Result, RoastError};
use crate::logging::LoggingConfig;
use crate::pid::PidConfig;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "ROAST_";

fn default_interval_ms() -> u64 {
    3000
}

fn default_ror_window() -> f64 {
    DEFAULT_ROR_WINDOW
}

fn default_slot() -> u8 {
    2
}

fn default_factor() -> f64 {
    1.0
}

/// Sampling session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub display_unit: TemperatureUnit,
    /// Rate-of-rise window in seconds
    #[serde(default = "default_ror_window")]
    pub ror_window: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            display_unit: TemperatureUnit::default(),
            ror_window: default_ror_window(),
        }
    }
}

impl SessionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One physical link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    pub protocol: Protocol,
    pub transport: TransportConfig,
    /// S7 rack
    #[serde(default)]
    pub rack: u8,
    /// S7 slot
    #[serde(default = "default_slot")]
    pub slot: u8,
    #[serde(default)]
    pub options: LinkOptions,
}

impl LinkConfig {
    pub fn is_modbus(&self) -> bool {
        matches!(
            self.protocol,
            Protocol::ModbusRtu
                | Protocol::ModbusAscii
                | Protocol::ModbusBinary
                | Protocol::ModbusTcp
                | Protocol::ModbusUdp
        )
    }

    /// Serial Modbus framings address slaves 1..=247
    fn is_serial_modbus(&self) -> bool {
        matches!(
            self.protocol,
            Protocol::ModbusRtu | Protocol::ModbusAscii | Protocol::ModbusBinary
        )
    }
}

/// Alarm table source: a `.json`/`.csv` file or inline rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmsConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub rows: Vec<AlarmRow>,
}

/// Command bound to a slider: `{}` receives `value * factor + offset`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliderConfig {
    pub command: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
}

/// Where dispatched commands go
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Link for `write`, `wcoil`, `mwrite` and friends
    #[serde(default)]
    pub modbus_link: Option<String>,
    /// Link for `setDBint`, `setDBfloat`, `setDBbool`
    #[serde(default)]
    pub s7_link: Option<String>,
    /// Controller for PID commands; the first configured one when unset
    #[serde(default)]
    pub pid: Option<String>,
    /// Command strings of the event buttons; `button(n)` runs entry `n - 1`
    #[serde(default)]
    pub buttons: Vec<String>,
    /// `slider(n, v)` runs entry `n - 1`
    #[serde(default)]
    pub sliders: Vec<SliderConfig>,
}

impl DispatcherConfig {
    pub fn button(&self, number: u8) -> Option<&str> {
        usize::from(number)
            .checked_sub(1)
            .and_then(|i| self.buttons.get(i))
            .map(String::as_str)
    }

    pub fn slider(&self, number: u8) -> Option<&SliderConfig> {
        usize::from(number)
            .checked_sub(1)
            .and_then(|i| self.sliders.get(i))
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoastConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub channels: Vec<DeviceChannel>,
    #[serde(default)]
    pub pids: Vec<PidConfig>,
    #[serde(default)]
    pub alarms: AlarmsConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl RoastConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RoastError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RoastError::config("Invalid file extension"))?;

        let figment = Figment::new();
        let figment = match extension {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(RoastError::config(format!(
                    "Unsupported config format: {extension}"
                )))
            },
        };

        let mut config: RoastConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        config.validate()?;

        info!(
            "Loaded {} ({} links, {} channels, {} PIDs)",
            path.display(),
            config.links.len(),
            config.channels.len(),
            config.pids.len()
        );
        Ok(config)
    }

    pub fn link(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|link| link.name == name)
    }

    /// Alarm table from the configured file, or the inline rows
    pub fn alarm_table(&self) -> Result<AlarmTable> {
        match &self.alarms.file {
            Some(file) => {
                let path = self.resolve(file);
                debug!("Alarm table file {}", path.display());
                Ok(AlarmTable::load(&path)?)
            },
            None => Ok(AlarmTable::from_rows(self.alarms.rows.clone())?),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Cross-check every reference in the configuration
    pub fn validate(&self) -> Result<()> {
        if self.session.interval_ms == 0 {
            return Err(RoastError::config("session.interval_ms must be positive"));
        }
        if !self.session.ror_window.is_finite() || self.session.ror_window <= 0.0 {
            return Err(RoastError::config("session.ror_window must be positive"));
        }

        let mut names = HashSet::new();
        for link in &self.links {
            if link.name.is_empty() {
                return Err(RoastError::config("Link with an empty name"));
            }
            if !names.insert(link.name.as_str()) {
                return Err(RoastError::config(format!("Duplicate link: {}", link.name)));
            }
            link.transport
                .validate()
                .map_err(|e| RoastError::config(format!("Link {}: {}", link.name, e)))?;
        }

        let mut channels = HashSet::new();
        for channel in &self.channels {
            if !channels.insert(channel.name.as_str()) {
                return Err(RoastError::config(format!(
                    "Duplicate channel: {}",
                    channel.name
                )));
            }
            let link = self.link(&channel.link).ok_or_else(|| {
                RoastError::config(format!(
                    "Channel {} refers to unknown link {}",
                    channel.name, channel.link
                ))
            })?;
            if channel.divider == 0.0 {
                return Err(RoastError::config(format!(
                    "Channel {} has a zero divider",
                    channel.name
                )));
            }
            if link.is_serial_modbus() && !(1..=247).contains(&channel.slave) {
                return Err(RoastError::config(format!(
                    "Channel {}: slave id {} outside 1..=247",
                    channel.name, channel.slave
                )));
            }
            channel
                .modbus_address()
                .map_err(|e| RoastError::config(e.to_string()))?;
        }

        let mut pids = HashSet::new();
        for pid in &self.pids {
            if !pids.insert(pid.name.as_str()) {
                return Err(RoastError::config(format!("Duplicate PID: {}", pid.name)));
            }
            let link = self.link(&pid.link).ok_or_else(|| {
                RoastError::config(format!(
                    "PID {} refers to unknown link {}",
                    pid.name, pid.link
                ))
            })?;
            if !link.is_modbus() {
                return Err(RoastError::config(format!(
                    "PID {} needs a Modbus link, {} is {:?}",
                    pid.name, link.name, link.protocol
                )));
            }
            pid.validate().map_err(RoastError::Config)?;
        }

        let dispatcher = &self.dispatcher;
        if let Some(name) = &dispatcher.modbus_link {
            match self.link(name) {
                Some(link) if link.is_modbus() => {},
                _ => {
                    return Err(RoastError::config(format!(
                        "dispatcher.modbus_link {name} is not a Modbus link"
                    )))
                },
            }
        }
        if let Some(name) = &dispatcher.s7_link {
            match self.link(name) {
                Some(link) if link.protocol == Protocol::S7 => {},
                _ => {
                    return Err(RoastError::config(format!(
                        "dispatcher.s7_link {name} is not an S7 link"
                    )))
                },
            }
        }
        if let Some(name) = &dispatcher.pid {
            if !pids.contains(name.as_str()) {
                return Err(RoastError::config(format!("dispatcher.pid {name} is not configured")));
            }
        }

        if self.alarms.file.is_none() {
            AlarmTable::from_rows(self.alarms.rows.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::pid::{PidFamily, RampSoakSegment};
    use std::io::Write;
    use tempfile::Builder;

    const YAML: &str = r#"
session:
  interval_ms: 2000
  display_unit: F
links:
  - name: roaster
    protocol: modbus_rtu
    transport:
      kind: serial
      address: /dev/ttyUSB0
      baud_rate: 19200
      retry_count: 2
channels:
  - name: BT
    link: roaster
    slave: 1
    address: { type: modbus_ref, reference: 400001 }
    divider: 10
pids:
  - name: heater
    link: roaster
    family: fuji_pxg
dispatcher:
  modbus_link: roaster
  buttons:
    - "write(1,100,{})"
  sliders:
    - command: "setSV({})"
      factor: 0.5
"#;

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml() {
        let file = write_config(".yaml", YAML);
        let config = RoastConfig::load(file.path()).unwrap();
        assert_eq!(config.session.interval(), Duration::from_millis(2000));
        assert_eq!(config.session.display_unit, TemperatureUnit::Fahrenheit);
        assert_eq!(config.links[0].transport.retry_count, 2);
        assert_eq!(config.links[0].slot, 2);
        assert_eq!(config.channels[0].divider, 10.0);
        assert_eq!(config.pids[0].family, PidFamily::FujiPxg);
        assert_eq!(config.pids[0].sv_divider(), 10.0);
        assert_eq!(config.dispatcher.button(1), Some("write(1,100,{})"));
        assert_eq!(config.dispatcher.button(0), None);
        assert_eq!(config.dispatcher.slider(1).map(|s| s.factor), Some(0.5));
        assert_eq!(config.base_dir, file.path().parent().unwrap());
    }

    #[test]
    fn test_load_toml() {
        let file = write_config(
            ".toml",
            r#"
[session]
interval_ms = 1000

[[links]]
name = "plc"
protocol = "s7"
transport = { kind = "tcp", address = "192.168.0.1:102" }
"#,
        );
        let config = RoastConfig::load(file.path()).unwrap();
        assert_eq!(config.links[0].protocol, Protocol::S7);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_config(".ini", "x=1");
        assert!(matches!(
            RoastConfig::load(file.path()),
            Err(RoastError::Config(_))
        ));
        assert!(RoastConfig::load("/nonexistent/roast.yaml").is_err());
    }

    fn loaded() -> RoastConfig {
        let file = write_config(".yaml", YAML);
        RoastConfig::load(file.path()).unwrap()
    }

    #[test]
    fn test_channel_link_must_exist() {
        let mut config = loaded();
        config.channels[0].link = "missing".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown link missing"));
    }

    #[test]
    fn test_zero_divider_and_slave_rejected() {
        let mut config = loaded();
        config.channels[0].divider = 0.0;
        assert!(config.validate().is_err());

        let mut config = loaded();
        config.channels[0].slave = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = loaded();
        config.session.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pid_segment_bound() {
        let mut config = loaded();
        config.pids[0].segments = vec![RampSoakSegment::new(60.0, 60.0, 150.0); 17];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("supports 16"));
    }

    #[test]
    fn test_dispatcher_links_checked() {
        let mut config = loaded();
        config.dispatcher.s7_link = Some("roaster".into());
        assert!(config.validate().is_err());

        let mut config = loaded();
        config.dispatcher.pid = Some("other".into());
        assert!(config.validate().is_err());
    }
}

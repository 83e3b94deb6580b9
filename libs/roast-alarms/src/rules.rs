//! Alarm table
//!
//! The persisted form is an ordered list of [`AlarmRow`]s with exactly the
//! fields `nr, status, if_alarm, but_not, from_event, time_offset, source,
//! condition, temperature, action, description`, stored as JSON or CSV.
//! Rows are numbered from 1; guard references use the same numbers and 0
//! means "no guard".

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AlarmError, Result};
use crate::events::RoastEvent;

/// Event an alarm's time offset is measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AlarmAnchor {
    /// Start of recording; always present
    #[default]
    Start,
    Event(RoastEvent),
}

impl fmt::Display for AlarmAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmAnchor::Start => f.write_str("START"),
            AlarmAnchor::Event(event) => write!(f, "{event}"),
        }
    }
}

impl FromStr for AlarmAnchor {
    type Err = AlarmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" | "START" | "ON" => Ok(AlarmAnchor::Start),
            other => other.parse().map(AlarmAnchor::Event),
        }
    }
}

impl TryFrom<String> for AlarmAnchor {
    type Error = AlarmError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AlarmAnchor> for String {
    fn from(anchor: AlarmAnchor) -> Self {
        anchor.to_string()
    }
}

/// Quantity an alarm compares against its threshold
///
/// Text forms: a channel name (`BT`), `RoR(BT)` for the rate of rise of a
/// channel in degrees per minute, `dCHARGE`/`dFCs`/... for seconds since an
/// event, and `DTR`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AlarmSource {
    Channel(String),
    RateOfRise(String),
    TimeSince(RoastEvent),
    Dtr,
}

impl fmt::Display for AlarmSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmSource::Channel(name) => f.write_str(name),
            AlarmSource::RateOfRise(name) => write!(f, "RoR({name})"),
            AlarmSource::TimeSince(event) => write!(f, "d{}", event.keyword()),
            AlarmSource::Dtr => f.write_str("DTR"),
        }
    }
}

impl FromStr for AlarmSource {
    type Err = AlarmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AlarmError::UnknownSource(s.to_string()));
        }
        if s == "DTR" {
            return Ok(AlarmSource::Dtr);
        }
        if let Some(inner) = s.strip_prefix("RoR(").and_then(|rest| rest.strip_suffix(')')) {
            let channel = inner.trim();
            if channel.is_empty() {
                return Err(AlarmError::UnknownSource(s.to_string()));
            }
            return Ok(AlarmSource::RateOfRise(channel.to_string()));
        }
        if let Some(event) = s.strip_prefix('d').and_then(|rest| rest.parse::<RoastEvent>().ok()) {
            return Ok(AlarmSource::TimeSince(event));
        }
        Ok(AlarmSource::Channel(s.to_string()))
    }
}

impl TryFrom<String> for AlarmSource {
    type Error = AlarmError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AlarmSource> for String {
    fn from(source: AlarmSource) -> Self {
        source.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Above,
    Below,
}

impl Condition {
    /// Strict comparison; equal values never trigger
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::Above => value > threshold,
            Condition::Below => value < threshold,
        }
    }
}

/// What a triggered alarm asks the dispatcher to do
///
/// The row's `description` carries the payload: pop-up text, program path,
/// button number, slider value, SV, colour or command string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PopUp,
    CallProgram,
    EventButton,
    Slider1,
    Slider2,
    Slider3,
    Slider4,
    Charge,
    DryEnd,
    FcStart,
    FcEnd,
    ScStart,
    ScEnd,
    Drop,
    CoolEnd,
    RampSoakOn,
    RampSoakOff,
    PidOn,
    PidOff,
    PidSv,
    CanvasColor,
    Command,
}

impl ActionKind {
    /// Roast event marked by this action
    pub fn event(&self) -> Option<RoastEvent> {
        match self {
            ActionKind::Charge => Some(RoastEvent::Charge),
            ActionKind::DryEnd => Some(RoastEvent::DryEnd),
            ActionKind::FcStart => Some(RoastEvent::FcStart),
            ActionKind::FcEnd => Some(RoastEvent::FcEnd),
            ActionKind::ScStart => Some(RoastEvent::ScStart),
            ActionKind::ScEnd => Some(RoastEvent::ScEnd),
            ActionKind::Drop => Some(RoastEvent::Drop),
            ActionKind::CoolEnd => Some(RoastEvent::CoolEnd),
            _ => None,
        }
    }

    /// Slider number (1-based) moved by this action
    pub fn slider(&self) -> Option<u8> {
        match self {
            ActionKind::Slider1 => Some(1),
            ActionKind::Slider2 => Some(2),
            ActionKind::Slider3 => Some(3),
            ActionKind::Slider4 => Some(4),
            _ => None,
        }
    }
}

/// Persisted alarm row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRow {
    pub nr: usize,
    /// Enabled flag
    pub status: bool,
    pub if_alarm: usize,
    pub but_not: usize,
    pub from_event: AlarmAnchor,
    /// Seconds that must have passed since `from_event`
    pub time_offset: f64,
    pub source: AlarmSource,
    pub condition: Condition,
    /// Threshold, in the unit of the source
    pub temperature: f64,
    pub action: ActionKind,
    pub description: String,
}

/// Alarm rule with its per-roast fired flag
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRule {
    pub row: AlarmRow,
    pub fired: bool,
}

impl AlarmRule {
    pub fn nr(&self) -> usize {
        self.row.nr
    }
}

/// Ordered alarm rules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmTable {
    rules: Vec<AlarmRule>,
}

impl AlarmTable {
    /// Build from rows, checking numbering and references
    pub fn from_rows(rows: Vec<AlarmRow>) -> Result<Self> {
        let count = rows.len();
        for (index, row) in rows.iter().enumerate() {
            let position = index + 1;
            if row.nr != position {
                return Err(AlarmError::invalid_row(
                    position,
                    format!("numbered {} but stored at position {}", row.nr, position),
                ));
            }
            if row.if_alarm > count {
                return Err(AlarmError::invalid_row(
                    position,
                    format!("if-alarm guard {} does not exist", row.if_alarm),
                ));
            }
            if row.but_not > count {
                return Err(AlarmError::invalid_row(
                    position,
                    format!("but-not guard {} does not exist", row.but_not),
                ));
            }
            if !row.time_offset.is_finite() || row.time_offset < 0.0 {
                return Err(AlarmError::invalid_row(
                    position,
                    format!("time offset {} must be a non-negative number", row.time_offset),
                ));
            }
            if !row.temperature.is_finite() {
                return Err(AlarmError::invalid_row(position, "threshold is not a number"));
            }
        }
        Ok(Self {
            rules: rows
                .into_iter()
                .map(|row| AlarmRule { row, fired: false })
                .collect(),
        })
    }

    pub fn rows(&self) -> Vec<AlarmRow> {
        self.rules.iter().map(|rule| rule.row.clone()).collect()
    }

    pub fn rules(&self) -> &[AlarmRule] {
        &self.rules
    }

    pub(crate) fn rules_mut(&mut self) -> &mut [AlarmRule] {
        &mut self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, nr: usize) -> Option<&AlarmRule> {
        nr.checked_sub(1).and_then(|index| self.rules.get(index))
    }

    pub fn fired(&self, nr: usize) -> bool {
        self.get(nr).is_some_and(|rule| rule.fired)
    }

    /// Enable or disable rule `nr`; false if there is no such rule
    pub fn set_enabled(&mut self, nr: usize, enabled: bool) -> bool {
        match nr.checked_sub(1).and_then(|index| self.rules.get_mut(index)) {
            Some(rule) => {
                rule.row.status = enabled;
                true
            },
            None => false,
        }
    }

    /// Clear every fired flag
    pub fn reset(&mut self) {
        for rule in &mut self.rules {
            rule.fired = false;
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_rows(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.rows())?)
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::Reader::from_reader(reader);
        let rows = csv
            .deserialize::<AlarmRow>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_rows(rows)
    }

    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        for rule in &self.rules {
            csv.serialize(&rule.row)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Load a `.csv` or `.json` table
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading alarm table from {}", path.display());
        if is_csv(path) {
            Self::from_csv_reader(File::open(path)?)
        } else {
            Self::from_json_str(&std::fs::read_to_string(path)?)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if is_csv(path) {
            self.to_csv_writer(File::create(path)?)
        } else {
            std::fs::write(path, self.to_json_string()?)?;
            Ok(())
        }
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

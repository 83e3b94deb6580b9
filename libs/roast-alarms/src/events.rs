//! Samples and roast-phase events

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AlarmError;

/// One timestamped reading of every channel
///
/// `time` is seconds since recording start. A `None` value marks a failed
/// read: a gap in the series, never a zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    pub values: BTreeMap<String, Option<f64>>,
}

impl Sample {
    pub fn new(time: f64) -> Self {
        Self {
            time,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, channel: impl Into<String>, value: Option<f64>) -> Self {
        self.values.insert(channel.into(), value);
        self
    }

    pub fn get(&self, channel: &str) -> Option<f64> {
        self.values.get(channel).copied().flatten()
    }
}

/// Named roast phases used as time anchors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoastEvent {
    Charge,
    DryEnd,
    FcStart,
    FcEnd,
    ScStart,
    ScEnd,
    Drop,
    CoolEnd,
}

impl RoastEvent {
    pub const ALL: [RoastEvent; 8] = [
        RoastEvent::Charge,
        RoastEvent::DryEnd,
        RoastEvent::FcStart,
        RoastEvent::FcEnd,
        RoastEvent::ScStart,
        RoastEvent::ScEnd,
        RoastEvent::Drop,
        RoastEvent::CoolEnd,
    ];

    /// Keyword used in command strings and alarm tables
    pub fn keyword(&self) -> &'static str {
        match self {
            RoastEvent::Charge => "CHARGE",
            RoastEvent::DryEnd => "DRY",
            RoastEvent::FcStart => "FCs",
            RoastEvent::FcEnd => "FCe",
            RoastEvent::ScStart => "SCs",
            RoastEvent::ScEnd => "SCe",
            RoastEvent::Drop => "DROP",
            RoastEvent::CoolEnd => "COOL",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for RoastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for RoastEvent {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        RoastEvent::ALL
            .into_iter()
            .find(|event| event.keyword() == s)
            .or(match s {
                "DRY END" => Some(RoastEvent::DryEnd),
                "COOL END" => Some(RoastEvent::CoolEnd),
                _ => None,
            })
            .ok_or_else(|| AlarmError::UnknownEvent(s.to_string()))
    }
}

/// Times at which the roast events of the current roast happened
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoastEvents {
    times: [Option<f64>; 8],
}

impl RoastEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` at `time`; an event is only marked once per roast
    pub fn mark(&mut self, event: RoastEvent, time: f64) -> bool {
        let slot = &mut self.times[event.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(time);
        true
    }

    pub fn time(&self, event: RoastEvent) -> Option<f64> {
        self.times[event.index()]
    }

    pub fn has(&self, event: RoastEvent) -> bool {
        self.time(event).is_some()
    }

    pub fn reset(&mut self) {
        self.times = [None; 8];
    }

    /// Seconds since `event`, if it happened
    pub fn since(&self, event: RoastEvent, now: f64) -> Option<f64> {
        self.time(event).map(|t| now - t)
    }

    /// Development time ratio in percent
    ///
    /// `100 * (now - FCs) / (FCs - CHARGE)`. Zero before first crack, when
    /// CHARGE is unknown, or when FCs does not come after CHARGE.
    pub fn dtr(&self, now: f64) -> f64 {
        let (Some(charge), Some(fcs)) =
            (self.time(RoastEvent::Charge), self.time(RoastEvent::FcStart))
        else {
            return 0.0;
        };
        let development = fcs - charge;
        if now < fcs || development <= 0.0 {
            return 0.0;
        }
        100.0 * (now - fcs) / development
    }
}

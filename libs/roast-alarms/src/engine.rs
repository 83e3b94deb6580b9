//! Alarm Engine
//!
//! Evaluates the alarm table against each new sample, top to bottom. Every
//! rule fires at most once per roast; the engine only reports triggers and
//! never performs the action itself.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::info;

use crate::events::{RoastEvents, Sample};
use crate::rules::{ActionKind, AlarmAnchor, AlarmRule, AlarmSource, AlarmTable};

/// Default rate-of-rise window in seconds
pub const DEFAULT_ROR_WINDOW: f64 = 10.0;

/// A rule that fired on the current sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmTrigger {
    pub nr: usize,
    pub action: ActionKind,
    /// Action payload from the row's description
    pub payload: String,
    /// Sample time the rule fired at
    pub time: f64,
    /// Source value that satisfied the condition
    pub value: f64,
}

/// Rate of rise per channel, in degrees per minute over a sliding window
#[derive(Debug, Clone)]
pub struct RorTracker {
    window: f64,
    history: BTreeMap<String, VecDeque<(f64, f64)>>,
}

impl RorTracker {
    pub fn new(window: f64) -> Self {
        Self {
            window,
            history: BTreeMap::new(),
        }
    }

    /// Start tracking `channel`
    pub fn track(&mut self, channel: &str) {
        self.history.entry(channel.to_string()).or_default();
    }

    pub fn update(&mut self, sample: &Sample) {
        let window = self.window;
        for (channel, points) in &mut self.history {
            if let Some(value) = sample.get(channel) {
                points.push_back((sample.time, value));
            }
            while points
                .front()
                .is_some_and(|(time, _)| sample.time - time > window)
            {
                points.pop_front();
            }
        }
    }

    pub fn ror(&self, channel: &str) -> Option<f64> {
        let points = self.history.get(channel)?;
        let (t0, v0) = points.front()?;
        let (t1, v1) = points.back()?;
        let span = t1 - t0;
        if span <= 0.0 {
            return None;
        }
        Some((v1 - v0) / span * 60.0)
    }

    pub fn clear(&mut self) {
        for points in self.history.values_mut() {
            points.clear();
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlarmEngine {
    table: AlarmTable,
    ror: RorTracker,
}

impl AlarmEngine {
    pub fn new(table: AlarmTable) -> Self {
        Self::with_ror_window(table, DEFAULT_ROR_WINDOW)
    }

    pub fn with_ror_window(table: AlarmTable, window: f64) -> Self {
        let mut ror = RorTracker::new(window);
        for rule in table.rules() {
            if let AlarmSource::RateOfRise(channel) = &rule.row.source {
                ror.track(channel);
            }
        }
        Self { table, ror }
    }

    pub fn table(&self) -> &AlarmTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut AlarmTable {
        &mut self.table
    }

    /// Replace the table; all rules start unfired
    pub fn load(&mut self, table: AlarmTable) {
        let window = self.ror.window;
        *self = Self::with_ror_window(table, window);
    }

    /// Clear fired flags and rate-of-rise history (RESET / new roast)
    pub fn reset(&mut self) {
        self.table.reset();
        self.ror.clear();
    }

    pub fn ror(&self, channel: &str) -> Option<f64> {
        self.ror.ror(channel)
    }

    /// Evaluate every rule against `sample`
    pub fn evaluate(&mut self, sample: &Sample, events: &RoastEvents) -> Vec<AlarmTrigger> {
        self.ror.update(sample);

        let mut triggers = Vec::new();
        for index in 0..self.table.len() {
            let value = {
                let rules = self.table.rules();
                let rule = &rules[index];
                if !Self::guards_pass(rules, rule) {
                    continue;
                }
                match self.armed_value(rule, sample, events) {
                    Some(value) => value,
                    None => continue,
                }
            };

            let rule = &mut self.table.rules_mut()[index];
            rule.fired = true;
            info!(
                "Alarm {} triggered: {} {:?} {} ({:.1}), action {:?}",
                rule.row.nr,
                rule.row.source,
                rule.row.condition,
                rule.row.temperature,
                value,
                rule.row.action
            );
            triggers.push(AlarmTrigger {
                nr: rule.row.nr,
                action: rule.row.action,
                payload: rule.row.description.clone(),
                time: sample.time,
                value,
            });
        }
        triggers
    }

    /// Fired, enabled and guard checks
    ///
    /// Only earlier rules are consulted: an if-alarm guard on the same or a
    /// later rule never passes and a but-not guard on one is ignored.
    fn guards_pass(rules: &[AlarmRule], rule: &AlarmRule) -> bool {
        if rule.fired || !rule.row.status {
            return false;
        }
        let nr = rule.nr();
        let fired = |guard: usize| rules.get(guard - 1).is_some_and(|r| r.fired);

        let if_alarm = rule.row.if_alarm;
        if if_alarm != 0 && (if_alarm >= nr || !fired(if_alarm)) {
            return false;
        }
        let but_not = rule.row.but_not;
        if but_not != 0 && but_not < nr && fired(but_not) {
            return false;
        }
        true
    }

    /// Source value if the rule's anchor, offset and condition are met
    fn armed_value(&self, rule: &AlarmRule, sample: &Sample, events: &RoastEvents) -> Option<f64> {
        let anchor = match rule.row.from_event {
            AlarmAnchor::Start => 0.0,
            AlarmAnchor::Event(event) => events.time(event)?,
        };
        if sample.time - anchor < rule.row.time_offset {
            return None;
        }

        let value = match &rule.row.source {
            AlarmSource::Channel(channel) => sample.get(channel)?,
            AlarmSource::RateOfRise(channel) => self.ror.ror(channel)?,
            AlarmSource::TimeSince(event) => events.since(*event, sample.time)?,
            AlarmSource::Dtr => events.dtr(sample.time),
        };
        rule.row
            .condition
            .holds(value, rule.row.temperature)
            .then_some(value)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::events::RoastEvent;
    use crate::rules::{AlarmRow, Condition};

    fn row(nr: usize, source: &str, condition: Condition, threshold: f64) -> AlarmRow {
        AlarmRow {
            nr,
            status: true,
            if_alarm: 0,
            but_not: 0,
            from_event: AlarmAnchor::Start,
            time_offset: 0.0,
            source: source.parse().unwrap(),
            condition,
            temperature: threshold,
            action: ActionKind::PopUp,
            description: format!("alarm {nr}"),
        }
    }

    fn engine(rows: Vec<AlarmRow>) -> AlarmEngine {
        AlarmEngine::new(AlarmTable::from_rows(rows).unwrap())
    }

    fn bt(time: f64, value: f64) -> Sample {
        Sample::new(time).with("BT", Some(value))
    }

    fn fired(triggers: &[AlarmTrigger]) -> Vec<usize> {
        triggers.iter().map(|t| t.nr).collect()
    }

    #[test]
    fn test_rule_fires_once_per_roast() {
        let mut engine = engine(vec![row(1, "BT", Condition::Above, 200.0)]);
        let events = RoastEvents::new();

        assert!(engine.evaluate(&bt(1.0, 200.0), &events).is_empty());
        let triggers = engine.evaluate(&bt(2.0, 201.0), &events);
        assert_eq!(fired(&triggers), vec![1]);
        assert_eq!(triggers[0].payload, "alarm 1");
        assert!(engine.evaluate(&bt(3.0, 205.0), &events).is_empty());

        engine.reset();
        assert_eq!(fired(&engine.evaluate(&bt(4.0, 205.0), &events)), vec![1]);
    }

    #[test]
    fn test_missing_value_never_fires() {
        let mut engine = engine(vec![row(1, "BT", Condition::Below, 50.0)]);
        let sample = Sample::new(1.0).with("BT", None);
        assert!(engine.evaluate(&sample, &RoastEvents::new()).is_empty());
    }

    #[test]
    fn test_if_alarm_guard() {
        let mut second = row(2, "BT", Condition::Above, 100.0);
        second.if_alarm = 1;
        let mut engine = engine(vec![row(1, "BT", Condition::Above, 150.0), second]);
        let events = RoastEvents::new();

        assert!(engine.evaluate(&bt(1.0, 120.0), &events).is_empty());
        // Rule 1 fires first in the same pass, which arms rule 2
        assert_eq!(fired(&engine.evaluate(&bt(2.0, 160.0), &events)), vec![1, 2]);
    }

    #[test]
    fn test_but_not_guard() {
        let mut second = row(2, "BT", Condition::Above, 100.0);
        second.but_not = 1;
        let mut engine = engine(vec![row(1, "BT", Condition::Above, 150.0), second]);
        let events = RoastEvents::new();

        assert_eq!(fired(&engine.evaluate(&bt(1.0, 160.0), &events)), vec![1]);
        assert!(engine.evaluate(&bt(2.0, 170.0), &events).is_empty());
    }

    #[test]
    fn test_guards_on_later_rules() {
        // If-alarm on a later rule: never fires
        let mut first = row(1, "BT", Condition::Above, 100.0);
        first.if_alarm = 2;
        // But-not on a later rule: ignored
        let mut third = row(3, "BT", Condition::Above, 100.0);
        third.but_not = 3;
        let mut engine = engine(vec![first, row(2, "BT", Condition::Above, 100.0), third]);
        let events = RoastEvents::new();

        assert_eq!(fired(&engine.evaluate(&bt(1.0, 110.0), &events)), vec![2, 3]);
        assert!(engine.evaluate(&bt(2.0, 120.0), &events).is_empty());
        assert!(!engine.table().fired(1));
    }

    #[test]
    fn test_from_event_and_time_offset() {
        let mut rule = row(1, "BT", Condition::Above, 100.0);
        rule.from_event = AlarmAnchor::Event(RoastEvent::Charge);
        rule.time_offset = 60.0;
        let mut engine = engine(vec![rule]);
        let mut events = RoastEvents::new();

        assert!(engine.evaluate(&bt(10.0, 150.0), &events).is_empty());
        events.mark(RoastEvent::Charge, 20.0);
        assert!(engine.evaluate(&bt(79.0, 150.0), &events).is_empty());
        assert_eq!(fired(&engine.evaluate(&bt(80.0, 150.0), &events)), vec![1]);
    }

    #[test]
    fn test_time_since_event_source() {
        let mut engine = engine(vec![row(1, "dFCs", Condition::Above, 90.0)]);
        let mut events = RoastEvents::new();
        events.mark(RoastEvent::FcStart, 500.0);

        assert!(engine.evaluate(&bt(590.0, 200.0), &events).is_empty());
        let triggers = engine.evaluate(&bt(591.0, 200.0), &events);
        assert_eq!(fired(&triggers), vec![1]);
        assert!((triggers[0].value - 91.0).abs() < 1e-9);
    }

    #[test]
    fn test_dtr_source_is_zero_before_first_crack() {
        let mut engine = engine(vec![row(1, "DTR", Condition::Below, 1.0)]);
        let mut events = RoastEvents::new();
        events.mark(RoastEvent::Charge, 0.0);

        // DTR is 0 before FCs, which is below 1
        let triggers = engine.evaluate(&bt(300.0, 180.0), &events);
        assert_eq!(fired(&triggers), vec![1]);
        assert_eq!(triggers[0].value, 0.0);
    }

    #[test]
    fn test_rate_of_rise_source() {
        let mut engine = engine(vec![row(1, "RoR(BT)", Condition::Below, 5.0)]);
        let events = RoastEvents::new();

        // 1 degree per second is 60 degrees per minute
        for t in 0..5 {
            let t = f64::from(t);
            assert!(engine.evaluate(&bt(t, 100.0 + t), &events).is_empty());
        }
        assert!((engine.ror("BT").unwrap() - 60.0).abs() < 1e-9);

        // Flat for longer than the window
        let mut triggers = Vec::new();
        for t in 5..20 {
            triggers.extend(engine.evaluate(&bt(f64::from(t), 104.0), &events));
        }
        assert_eq!(fired(&triggers), vec![1]);
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let mut engine = engine(vec![row(1, "BT", Condition::Above, 100.0)]);
        engine.table_mut().set_enabled(1, false);
        assert!(engine.evaluate(&bt(1.0, 150.0), &RoastEvents::new()).is_empty());
    }
}

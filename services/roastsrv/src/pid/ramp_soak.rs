//! Ramp/soak programs and background profiles

use serde::{Deserialize, Serialize};

/// One ramp/soak step: ramp to `sv` over `ramp` seconds, then hold it for
/// `soak` seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampSoakSegment {
    pub ramp: f64,
    pub soak: f64,
    pub sv: f64,
}

impl RampSoakSegment {
    pub fn new(ramp: f64, soak: f64, sv: f64) -> Self {
        Self { ramp, soak, sv }
    }

    pub fn duration(&self) -> f64 {
        self.ramp + self.soak
    }

    pub fn is_empty(&self) -> bool {
        self.ramp == 0.0 && self.soak == 0.0 && self.sv == 0.0
    }
}

/// What happens after the last segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndMode {
    /// Keep the last SV
    #[default]
    Hold,
    /// Start over at segment 0
    Repeat,
    /// Turn the controller off
    Off,
}

/// Result of advancing a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampSoakStep {
    /// Not running
    Idle,
    Active(usize),
    /// Past the last segment, with `Hold` or `Off` end mode
    Finished,
}

/// Segment sequencing on elapsed time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RampSoakProgram {
    segments: Vec<RampSoakSegment>,
    end_mode: EndMode,
    started: Option<f64>,
    start_sv: f64,
    finished: bool,
}

impl RampSoakProgram {
    pub fn new(segments: Vec<RampSoakSegment>, end_mode: EndMode) -> Self {
        Self {
            segments,
            end_mode,
            ..Self::default()
        }
    }

    pub fn segments(&self) -> &[RampSoakSegment] {
        &self.segments
    }

    /// Replace the segments; a running program stops
    pub fn set_segments(&mut self, segments: Vec<RampSoakSegment>) {
        self.segments = segments;
        self.stop();
    }

    pub fn end_mode(&self) -> EndMode {
        self.end_mode
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && !self.finished
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Start at `now`; `start_sv` is where the first ramp starts from
    pub fn start(&mut self, now: f64, start_sv: f64) {
        self.started = Some(now);
        self.start_sv = start_sv;
        self.finished = false;
    }

    pub fn stop(&mut self) {
        self.started = None;
        self.finished = false;
    }

    fn cycle(&self) -> f64 {
        self.segments.iter().map(RampSoakSegment::duration).sum()
    }

    /// Segment and time into it, for `elapsed` seconds into one cycle
    fn locate(&self, elapsed: f64) -> Option<(usize, f64)> {
        let mut begin = 0.0;
        for (index, segment) in self.segments.iter().enumerate() {
            let end = begin + segment.duration();
            if elapsed < end {
                return Some((index, elapsed - begin));
            }
            begin = end;
        }
        None
    }

    /// Advance to `now`
    ///
    /// `device_done` reports that the controller finished the pattern on
    /// its own, which ends the current cycle early.
    pub fn advance(&mut self, now: f64, device_done: bool) -> RampSoakStep {
        let Some(started) = self.started else {
            return RampSoakStep::Idle;
        };
        if self.finished {
            return RampSoakStep::Finished;
        }
        let cycle = self.cycle();
        let elapsed = (now - started).max(0.0);
        if !device_done {
            if let Some((index, _)) = self.locate(elapsed) {
                return RampSoakStep::Active(index);
            }
        }
        match self.end_mode {
            EndMode::Repeat if cycle > 0.0 => {
                let restart = if device_done {
                    now
                } else {
                    started + cycle * (elapsed / cycle).floor()
                };
                self.started = Some(restart);
                self.start_sv = self.segments.last().map_or(self.start_sv, |s| s.sv);
                self.locate(now - restart)
                    .map_or(RampSoakStep::Finished, |(index, _)| RampSoakStep::Active(index))
            },
            _ => {
                self.finished = true;
                RampSoakStep::Finished
            },
        }
    }

    /// SV the program asks for at `now`, ramping linearly from the
    /// previous segment's SV
    pub fn setpoint(&self, now: f64) -> Option<f64> {
        let started = self.started?;
        if self.finished {
            return match self.end_mode {
                EndMode::Hold => self.segments.last().map(|s| s.sv),
                _ => None,
            };
        }
        let (index, into) = self.locate((now - started).max(0.0))?;
        let segment = &self.segments[index];
        let from = if index == 0 {
            self.start_sv
        } else {
            self.segments[index - 1].sv
        };
        if segment.ramp > 0.0 && into < segment.ramp {
            Some(from + (segment.sv - from) * into / segment.ramp)
        } else {
            Some(segment.sv)
        }
    }
}

/// Background profile SV curve, as `(time, sv)` points
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(f64, f64)>", into = "Vec<(f64, f64)>")]
pub struct BackgroundProfile {
    points: Vec<(f64, f64)>,
}

impl From<Vec<(f64, f64)>> for BackgroundProfile {
    fn from(points: Vec<(f64, f64)>) -> Self {
        Self::new(points)
    }
}

impl From<BackgroundProfile> for Vec<(f64, f64)> {
    fn from(profile: BackgroundProfile) -> Self {
        profile.points
    }
}

impl BackgroundProfile {
    /// Points are sorted by time; non-finite points are dropped
    pub fn new(mut points: Vec<(f64, f64)>) -> Self {
        points.retain(|(t, sv)| t.is_finite() && sv.is_finite());
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Linear interpolation, clamped to the first and last point
    pub fn sv_at(&self, time: f64) -> Option<f64> {
        let first = self.points.first()?;
        if time <= first.0 {
            return Some(first.1);
        }
        for pair in self.points.windows(2) {
            let ((t0, v0), (t1, v1)) = (pair[0], pair[1]);
            if time <= t1 {
                if t1 == t0 {
                    return Some(v1);
                }
                return Some(v0 + (v1 - v0) * (time - t0) / (t1 - t0));
            }
        }
        self.points.last().map(|(_, sv)| *sv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(end_mode: EndMode) -> RampSoakProgram {
        RampSoakProgram::new(
            vec![
                RampSoakSegment::new(30.0, 60.0, 100.0),
                RampSoakSegment::new(10.0, 20.0, 150.0),
            ],
            end_mode,
        )
    }

    #[test]
    fn test_segments_follow_elapsed_time() {
        let mut program = program(EndMode::Hold);
        assert_eq!(program.advance(0.0, false), RampSoakStep::Idle);

        program.start(0.0, 20.0);
        for t in [0.0, 30.0, 89.9] {
            assert_eq!(program.advance(t, false), RampSoakStep::Active(0), "t={t}");
        }
        for t in [90.0, 100.0, 119.9] {
            assert_eq!(program.advance(t, false), RampSoakStep::Active(1), "t={t}");
        }
        assert_eq!(program.advance(120.0, false), RampSoakStep::Finished);
        assert!(program.is_finished());
        assert_eq!(program.setpoint(500.0), Some(150.0));
    }

    #[test]
    fn test_repeat_restarts_cycle() {
        let mut program = program(EndMode::Repeat);
        program.start(10.0, 20.0);
        assert_eq!(program.advance(135.0, false), RampSoakStep::Active(0));
        assert_eq!(program.advance(225.0, false), RampSoakStep::Active(1));
        assert!(program.is_running());
    }

    #[test]
    fn test_off_end_mode_finishes() {
        let mut program = program(EndMode::Off);
        program.start(0.0, 20.0);
        assert_eq!(program.advance(121.0, false), RampSoakStep::Finished);
        assert_eq!(program.setpoint(121.0), None);
    }

    #[test]
    fn test_device_reported_end() {
        let mut program = program(EndMode::Hold);
        program.start(0.0, 20.0);
        assert_eq!(program.advance(40.0, true), RampSoakStep::Finished);

        let mut program = program_repeat_started();
        assert_eq!(program.advance(40.0, true), RampSoakStep::Active(0));
        assert_eq!(program.advance(131.0, false), RampSoakStep::Active(1));
    }

    fn program_repeat_started() -> RampSoakProgram {
        let mut program = program(EndMode::Repeat);
        program.start(0.0, 20.0);
        program
    }

    #[test]
    fn test_setpoint_ramps_linearly() {
        let mut program = program(EndMode::Hold);
        assert_eq!(program.setpoint(0.0), None);
        program.start(0.0, 40.0);
        assert_eq!(program.setpoint(0.0), Some(40.0));
        assert_eq!(program.setpoint(15.0), Some(70.0));
        assert_eq!(program.setpoint(45.0), Some(100.0));
        assert_eq!(program.setpoint(95.0), Some(125.0));
    }

    #[test]
    fn test_background_interpolation() {
        let profile = BackgroundProfile::new(vec![(60.0, 200.0), (0.0, 180.0), (120.0, 200.0)]);
        assert_eq!(profile.sv_at(-5.0), Some(180.0));
        assert_eq!(profile.sv_at(30.0), Some(190.0));
        assert_eq!(profile.sv_at(90.0), Some(200.0));
        assert_eq!(profile.sv_at(600.0), Some(200.0));
        assert_eq!(BackgroundProfile::default().sv_at(10.0), None);
    }
}

//! Sampling scheduler and sample sinks
//!
//! Every tick polls all links concurrently (each link runs its channels in
//! order) and merges the readings into one [`Sample`]. A slow tick is never
//! made up for: the next tick starts right away and the schedule continues
//! from there.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use roast_alarms::Sample;
use roast_comlink::Clock;

use crate::devices::DeviceRegistry;
use crate::error::{Result, RoastError};

/// Intervals below this are allowed but rarely work with serial devices
pub const STABLE_INTERVAL: Duration = Duration::from_secs(1);

/// Timestamps never repeat; a clock that did not move is bumped by this much
const MIN_STEP: f64 = 0.001;

/// Consumer of completed samples, called before the next tick
pub trait SampleSink: Send + Sync {
    fn record(&mut self, sample: &Sample) -> Result<()>;
}

/// Appends one JSON object per sample
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Append to `path`, creating it when missing
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send + Sync> SampleSink for JsonLinesSink<W> {
    fn record(&mut self, sample: &Sample) -> Result<()> {
        serde_json::to_writer(&mut self.writer, sample)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards samples to an in-process consumer
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Sample>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Sample>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SampleSink for ChannelSink {
    fn record(&mut self, sample: &Sample) -> Result<()> {
        self.sender
            .send(sample.clone())
            .map_err(|_| RoastError::SessionClosed)
    }
}

/// Tick timing and sample assembly
#[derive(Debug)]
pub struct Sampler {
    interval: Duration,
    clock: Arc<dyn Clock>,
    /// Clock time of recording start
    origin: Duration,
    /// Clock time the current tick started
    tick_start: Option<Duration>,
    last_time: Option<f64>,
}

impl Sampler {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        if interval < STABLE_INTERVAL {
            warn!(
                "Sampling interval {:?} is below {:?}; readings may be unstable",
                interval, STABLE_INTERVAL
            );
        }
        let origin = clock.now();
        Self {
            interval,
            clock,
            origin,
            tick_start: None,
            last_time: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Restart the time base at zero
    pub fn start(&mut self) {
        self.origin = self.clock.now();
        self.tick_start = None;
        self.last_time = None;
    }

    /// Seconds since start, strictly increasing between calls
    fn timestamp(&mut self) -> f64 {
        let now = self.clock.now().saturating_sub(self.origin).as_secs_f64();
        let time = match self.last_time {
            Some(last) if now <= last => last + MIN_STEP,
            _ => now,
        };
        self.last_time = Some(time);
        time
    }

    /// Read every channel once
    pub async fn poll(&mut self, registry: &DeviceRegistry) -> Sample {
        self.tick_start = Some(self.clock.now());
        let time = self.timestamp();

        let links = registry.polled_links();
        let readings = join_all(links.iter().map(|link| registry.poll_link(link))).await;

        let mut sample = Sample::new(time);
        for (channel, value) in readings.into_iter().flatten() {
            sample.values.insert(channel, value);
        }
        debug!(
            "Sample at {:.3}s: {} channels, {} gaps",
            time,
            sample.values.len(),
            sample.values.values().filter(|v| v.is_none()).count()
        );
        sample
    }

    /// Time left until the next tick is due; zero after an overrun
    pub fn until_next(&self) -> Duration {
        let Some(start) = self.tick_start else {
            return Duration::ZERO;
        };
        let elapsed = self.clock.now().saturating_sub(start);
        if elapsed > self.interval {
            debug!(
                "Tick took {:?}, longer than the {:?} interval",
                elapsed, self.interval
            );
        }
        self.interval.saturating_sub(elapsed)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::devices::{DeviceChannel, LinkOptions, TemperatureUnit};
    use roast_comlink::{ManualClock, MockTransport, TransportConfig};
    use roast_protocols::{LinkManager, ModbusSlave, Protocol};
    use tracing_test::traced_test;

    fn registry(clock: Arc<ManualClock>) -> (DeviceRegistry, ModbusSlave) {
        let slave = ModbusSlave::new(1);
        slave.set_holding(0, 2105);
        slave.set_holding(1, 1830);

        let mut registry = DeviceRegistry::new(TemperatureUnit::Celsius);
        for port in ["COM3", "COM4"] {
            let mock = MockTransport::new(port);
            let responder = slave.clone();
            mock.handle()
                .set_responder(move |frame| responder.respond_rtu(frame));
            registry.add_link(
                Arc::new(LinkManager::with_transport(
                    port,
                    TransportConfig::serial(port, 9600).with_retries(0),
                    Protocol::ModbusRtu.codec(0, 0),
                    Box::new(mock),
                    clock.clone(),
                )),
                LinkOptions::default(),
            );
        }
        registry
            .add_channel(DeviceChannel::modbus("ET", "COM3", 1, 400_001).with_divider(10.0))
            .unwrap();
        registry
            .add_channel(DeviceChannel::modbus("BT", "COM4", 1, 400_002).with_divider(10.0))
            .unwrap();
        registry
            .add_channel(DeviceChannel::modbus("Fan", "COM4", 1, 400_009))
            .unwrap();
        (registry, slave)
    }

    #[tokio::test]
    async fn test_sample_merges_all_links() {
        let clock = Arc::new(ManualClock::new());
        let (registry, _) = registry(clock.clone());
        let mut sampler = Sampler::new(Duration::from_secs(3), clock.clone());

        let sample = sampler.poll(&registry).await;
        assert_eq!(sample.get("ET"), Some(210.5));
        assert_eq!(sample.get("BT"), Some(183.0));
        assert_eq!(sample.values.get("Fan"), Some(&None));
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let clock = Arc::new(ManualClock::new());
        let (registry, _) = registry(clock.clone());
        let mut sampler = Sampler::new(Duration::from_secs(3), clock.clone());

        let first = sampler.poll(&registry).await.time;
        let second = sampler.poll(&registry).await.time;
        assert!(second > first);
        assert!((second - first - MIN_STEP).abs() < 1e-9);

        clock.advance(Duration::from_secs(3));
        let third = sampler.poll(&registry).await.time;
        assert!((third - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_backlog_after_overrun() {
        let clock = Arc::new(ManualClock::new());
        let (registry, _) = registry(clock.clone());
        let mut sampler = Sampler::new(Duration::from_secs(3), clock.clone());
        assert_eq!(sampler.until_next(), Duration::ZERO);

        sampler.poll(&registry).await;
        clock.advance(Duration::from_secs(1));
        assert_eq!(sampler.until_next(), Duration::from_secs(2));

        // A 7 s tick: the next one is due at once, not two extra ticks later
        clock.advance(Duration::from_secs(6));
        assert_eq!(sampler.until_next(), Duration::ZERO);
        sampler.poll(&registry).await;
        assert_eq!(sampler.until_next(), Duration::from_secs(3));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_short_interval_warns() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let sampler = Sampler::new(Duration::from_millis(500), clock);
        assert_eq!(sampler.interval(), Duration::from_millis(500));
        assert!(logs_contain("readings may be unstable"));
    }

    #[test]
    fn test_json_lines_sink() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.record(&Sample::new(1.5).with("BT", Some(150.0)).with("ET", None))
            .unwrap();
        sink.record(&Sample::new(4.5)).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["time"], 1.5);
        assert_eq!(first["values"]["BT"], 150.0);
        assert!(first["values"]["ET"].is_null());
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (mut sink, mut receiver) = ChannelSink::new();
        sink.record(&Sample::new(2.0)).unwrap();
        assert_eq!(receiver.recv().await.unwrap().time, 2.0);
        drop(receiver);
        assert!(sink.record(&Sample::new(3.0)).is_err());
    }
}

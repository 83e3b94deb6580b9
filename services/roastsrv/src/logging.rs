//! Logging setup for roastsrv
//!
//! Console output uses the `timestamp [LEVEL] message` format; the same
//! events go to a daily rolling file, optionally as JSON lines.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Result, RoastError};

/// Environment variable overriding the log directory
pub const LOG_DIR_ENV: &str = "ROAST_LOG_DIR";

const SERVICE_NAME: &str = "roastsrv";

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// `logging` section of the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Write the log file as JSON lines
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
            json: false,
            console: true,
            file: true,
        }
    }
}

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `2026-03-02T08:15:02.118204Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Log directory: `ROAST_LOG_DIR` > configured directory > `logs`
pub fn log_dir(env_dir: Option<&str>, configured: Option<&Path>) -> PathBuf {
    env_dir
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| configured.map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Filter directive: `RUST_LOG` wins, otherwise `level` with debug output
/// for this service
pub fn filter_directive(rust_log: Option<&str>, level: &str) -> String {
    match rust_log {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => format!("{level},{SERVICE_NAME}=debug"),
    }
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init(config: &LoggingConfig, ansi: bool) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(std::env::var("RUST_LOG").ok().as_deref(), &config.level);
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| RoastError::config(format!("Invalid log filter '{directive}': {e}")))?;

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_ansi(ansi)
            .event_format(BracketedLevelFormat)
            .boxed()
    });

    let (file_layer, guard) = if config.file {
        let dir = log_dir(std::env::var(LOG_DIR_ENV).ok().as_deref(), config.dir.as_deref());
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(&dir, format!("{SERVICE_NAME}.log"));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = if config.json {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_level(true)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| RoastError::config(format!("Logging already initialized: {e}")))?;

    Ok(guard)
}

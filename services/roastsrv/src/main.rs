//! roastsrv - roast device service

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};

use roast_comlink::{Clock, SystemClock};
use roastsrv::{logging, JsonLinesSink, RoastConfig, RoastSession};

/// Command-line arguments for roastsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "roastsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Roast device service",
    long_about = None
)]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long, default_value = "config/roastsrv.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Append every sample as a JSON line to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RoastConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    // Held until exit so the file writer flushes
    let _log_guard = logging::init(&config.logging, !args.no_color)
        .context("Failed to initialize logging")?;

    if args.validate {
        info!("Configuration {} is valid", args.config.display());
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let mut session = RoastSession::from_config(&config, clock).context("Failed to build session")?;
    if let Some(path) = &args.output {
        let sink = JsonLinesSink::create(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        session.add_sink(Box::new(sink));
        info!("Recording samples to {}", path.display());
    }

    let handle = session.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                handle.cancel();
            },
            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    session.run().await?;
    Ok(())
}

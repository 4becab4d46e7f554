//! q2cloud daemon
//!
//! Accepts frontend sessions and serves the management and metrics
//! sidecars until interrupted.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use q2cloud_daemon::config::DaemonConfig;

/// q2cloud daemon - central backend for Quake 2 frontends
#[derive(Parser, Debug)]
#[command(name = "q2cloudd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; given twice, the second is layered over the first
    #[arg(short, long, default_value = "q2cloud.toml")]
    config: Vec<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

async fn load_config(paths: &[PathBuf]) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::default();
    for (i, path) in paths.iter().enumerate() {
        if i == 0 {
            config = DaemonConfig::load(path).await?;
        } else {
            config.load_merge(path).await?;
        }
    }
    Ok(config)
}

fn init_logging(config: &DaemonConfig, verbose: u8) -> Result<()> {
    let level = level_for(verbose.max(config.server.verbose_level));
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    match &config.server.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let subscriber = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            tracing::subscriber::set_global_default(builder.finish())?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config).await?;
    init_logging(&config, args.verbose)?;

    info!("q2cloud daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", args.config);

    if let Err(e) = q2cloud_daemon::run(config).await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

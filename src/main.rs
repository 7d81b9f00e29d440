use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wheelbase_runtime::config::{RuntimeConfig, ScheduleMode};
use wheelbase_runtime::runtime;

/// Wheel velocity control runtime with e-stop interlock
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON configuration file (missing fields use defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session listen address, e.g. 0.0.0.0:5333
    #[arg(long)]
    bind: Option<String>,

    /// Control loop rate in Hz
    #[arg(long)]
    loop_hz: Option<u64>,

    /// Run one control cycle per received command instead of a free-running loop
    #[arg(long)]
    lockstep: bool,
}

fn load_config(args: &Args) -> wheelbase_runtime::Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Using config: {}", path.display());
            RuntimeConfig::from_file(path)?
        }
        None => RuntimeConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(loop_hz) = args.loop_hz {
        config.loop_hz = loop_hz;
    }
    if args.lockstep {
        config.mode = ScheduleMode::Lockstep;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // No hardware adapters are linked in: drive the simulated base
    let (cycle, _base) = runtime::simulated_cycle(&config);

    if let Err(e) = runtime::run(config, cycle).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

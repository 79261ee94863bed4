use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use roadstate::{
    logging::initialize_logging,
    report::RunReport,
    scenario::{ScenarioLoader, WeatherMode},
    DriverBuilder,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Weather- and incident-aware traffic simulation runner")]
struct Cli {
    /// Path to the run configuration YAML file
    #[arg(long, default_value = "scenarios/wolfsburg.yaml")]
    config: PathBuf,

    /// Override the run duration in ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Override the weather mode
    #[arg(long, value_enum)]
    mode: Option<WeatherMode>,

    /// Directory for the report, log file and router scratch files
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Terminal log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ScenarioLoader::new(".").load(&cli.config)?;
    if let Some(ticks) = cli.ticks {
        config.duration_ticks = ticks;
    }
    if let Some(mode) = cli.mode {
        config.weather.mode = mode;
    }
    if let Some(output_dir) = cli.output_dir {
        config.paths.output_dir = output_dir;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    initialize_logging(&config.paths.output_dir, &config.logging.level)?;
    info!("loaded run configuration {}", cli.config.display());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_signal = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current tick");
            stop_on_signal.store(true, Ordering::SeqCst);
        }
    });

    // The feeds use blocking HTTP clients, so the driver lives on a blocking thread.
    let report = tokio::task::spawn_blocking(move || -> Result<RunReport> {
        let driver = DriverBuilder::from_config(&config)?
            .with_stop_flag(stop)
            .build()?;
        Ok(driver.run()?)
    })
    .await
    .context("simulation task panicked")??;

    println!(
        "Run '{}' completed {} ticks ({:?}). Mean speed {:.2} km/h over {} incident checks.",
        report.run_name,
        report.ticks_completed,
        report.stop_reason,
        report.summary.mean_speed_kmh,
        report.summary.incident_checks
    );
    Ok(())
}

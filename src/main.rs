//! CLI entry point for holo_daq
//!
//! Provides a command-line interface for:
//! - Running an exposure session from a config file and a grid CSV
//! - Estimating scan time without touching the hardware
//! - Printing the exposure and power tables a config produces
//! - Listing serial ports
//!
//! # Usage
//!
//! ```bash
//! holo_daq run --config config/holo_daq.toml --grid image.csv
//! holo_daq estimate --config config/holo_daq.toml --grid image.csv
//! ```
//!
//! While a scan runs, type `p`, `r` or `a` followed by Enter to pause,
//! resume or abort. Ctrl-C aborts.

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use holo_daq::config::HoloConfig;
use holo_daq::estimator::estimate_runtime;
use holo_daq::hardware::mock::{MockConnector, MOCK_LASER_PORT, MOCK_SHUTTER_PORT, MOCK_STAGE_PORT};
use holo_daq::hardware::{Connector, SerialPortConfig, TokioSerialConnector};
use holo_daq::raster::{PixelGrid, RasterPlan};
use holo_daq::sequencer::ScanEvent;
use holo_daq::session::{ScanOutcome, Session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "holo_daq")]
#[command(about = "Raster-scan exposure controller for holographic film", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a grid onto film
    Run {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
        /// Row-major CSV of intensities 0-255
        #[arg(long)]
        grid: PathBuf,
        /// Drive the simulated rig instead of the serial ports
        #[arg(long)]
        mock: bool,
        /// Print progress events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Predict how long a scan will take
    Estimate {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
        /// Row-major CSV of intensities 0-255
        #[arg(long)]
        grid: PathBuf,
    },

    /// Print the exposure and power tables built from the configured rules
    Table {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// List serial ports on this machine
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            grid,
            mock,
            json,
        } => run_session(&config, &grid, mock, json).await,
        Commands::Estimate { config, grid } => {
            let config = load_config(&config)?;
            print_estimate(&config, &load_grid(&grid)?)
        }
        Commands::Table { config } => print_tables(&load_config(&config)?),
        Commands::Ports => {
            init_tracing("info");
            list_ports()
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path) -> Result<HoloConfig> {
    let config = HoloConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    init_tracing(&config.application.log_level);
    Ok(config)
}

fn load_grid(path: &Path) -> Result<PixelGrid> {
    PixelGrid::from_csv_path(path).with_context(|| format!("reading grid from {}", path.display()))
}

fn print_estimate(config: &HoloConfig, grid: &PixelGrid) -> Result<()> {
    let map = config.exposure_map()?;
    let geometry = config.geometry()?;
    let estimate = estimate_runtime(grid, &map.exposure, geometry, config.scan.unit_rate);
    let plan = RasterPlan::new(grid, geometry);

    println!("Grid:            {} x {} pixels", grid.x_pix(), grid.y_pix());
    println!("Resolution:      {:.1} dpi", plan.dots_per_inch());
    println!(
        "Exposures:       {} pixels on {} rows",
        estimate.exposed_pixels, estimate.exposed_rows
    );
    println!("Estimated time:  {:.1?}", estimate.duration());
    println!(
        "Finishes around: {}",
        estimate.finish_time(Local::now()).format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}

fn print_tables(config: &HoloConfig) -> Result<()> {
    let map = config.exposure_map()?;
    println!("{:>9}  {:>10}  {:>8}", "intensity", "exposure_s", "power_mw");
    for level in 0..=u8::MAX {
        let (seconds, power) = (map.exposure_for(level), map.power_for(level));
        if seconds != 0.0 || power != 0.0 {
            println!("{level:>9}  {seconds:>10.3}  {power:>8.2}");
        }
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    #[cfg(feature = "instrument_serial")]
    {
        let ports = serialport::available_ports().context("enumerating serial ports")?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}  {:?}", port.port_name, port.port_type);
        }
        Ok(())
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        bail!("serial support not enabled, rebuild with --features instrument_serial")
    }
}

async fn run_session(config_path: &Path, grid_path: &Path, mock: bool, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let grid = load_grid(grid_path)?;
    print_estimate(&config, &grid)?;

    let map = config.exposure_map()?;
    let mut session_config = config.session_config()?;
    let connector: Arc<dyn Connector> = if mock {
        warn!("using the simulated rig, no hardware will move");
        session_config.stage_port = SerialPortConfig {
            port: MOCK_STAGE_PORT.to_string(),
            ..session_config.stage_port
        };
        session_config.shutter_port = SerialPortConfig {
            port: MOCK_SHUTTER_PORT.to_string(),
            ..session_config.shutter_port
        };
        session_config.laser_port = SerialPortConfig {
            port: MOCK_LASER_PORT.to_string(),
            ..session_config.laser_port
        };
        Arc::new(MockConnector::rig())
    } else {
        Arc::new(TokioSerialConnector)
    };

    let (events, progress) = broadcast::channel(1024);
    let session = Session::new(session_config, connector, Arc::new(grid), Arc::new(map));
    let (mut task, control) = session.spawn(events);
    let printer = tokio::spawn(print_progress(progress, json));

    let mut commands = spawn_stdin_reader();
    let mut stdin_open = true;
    let outcome = loop {
        tokio::select! {
            joined = &mut task => break joined.context("session task panicked")?,
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received, aborting");
                control.abort();
            }
            line = commands.recv(), if stdin_open => match line {
                Some(line) => match line.trim() {
                    "p" => control.pause(),
                    "r" => control.run(),
                    "a" => control.abort(),
                    "" => {}
                    other => eprintln!("unknown command '{other}', use p, r or a"),
                },
                None => stdin_open = false,
            },
        }
    };
    // The session dropped its sender, so the printer ends on its own.
    let _ = printer.await;

    let report = outcome.report();
    println!();
    println!(
        "Exposures: {}  power changes: {}  elapsed: {:.1?}",
        report.exposures, report.power_changes, report.elapsed
    );
    for error in &report.release_errors {
        eprintln!("release error: {error}");
    }
    match outcome {
        ScanOutcome::Completed(_) => {
            println!("Scan completed");
            Ok(())
        }
        ScanOutcome::Aborted(_) => {
            println!("Scan aborted");
            Ok(())
        }
        ScanOutcome::Faulted { reason, .. } => bail!("scan faulted: {reason}"),
    }
}

/// Operator keystrokes, read on a plain thread so a pending read never holds up exit.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn print_progress(mut progress: broadcast::Receiver<ScanEvent>, json: bool) {
    loop {
        match progress.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "could not encode progress event"),
            },
            Ok(ScanEvent::Exposed {
                col,
                row,
                exposed,
                total_exposures,
                elapsed,
                ..
            }) => {
                println!(
                    "[{exposed}/{total_exposures}] pixel ({col},{row})  {elapsed:.1?}"
                );
            }
            Ok(ScanEvent::StateChanged(state)) => println!("state: {state:?}"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress output fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

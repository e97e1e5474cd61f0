//! CLI entry point for liv-daq
//!
//! ```bash
//! # write a starting preset, edit it, check it, run it on the simulated bench
//! liv-daq template presets/device.json
//! liv-daq validate presets/device.json
//! liv-daq run presets/device.json --mock
//! ```
//!
//! Ctrl-C during `run` cancels the sweep. Outputs are parked and the samples
//! taken so far are exported.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use liv_daq::config::{BenchConfig, DEFAULT_CONFIG_PATH};
use liv_daq::presets::MeasurementPreset;
use liv_daq::{bench, tracing_init};
use liv_experiment::SetpointPlan;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "liv-daq")]
#[command(about = "Laser-diode L-I-V acquisition", long_about = None)]
struct Cli {
    /// Bench configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sweep described by a preset
    Run {
        /// Preset JSON file
        preset: PathBuf,

        /// Use the simulated bench regardless of configuration
        #[arg(long)]
        mock: bool,

        /// Override the export directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Check a preset and the bench configuration without touching hardware
    Validate {
        /// Preset JSON file
        preset: PathBuf,
    },

    /// Write a template preset
    Template {
        /// Destination file
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = BenchConfig::load_from(&cli.config)?;
    config.validate().map_err(|e| anyhow!(e))?;
    tracing_init::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Run {
            preset,
            mock,
            output,
        } => {
            if let Some(output) = output {
                config.storage.output_dir = output;
            }
            run(config, preset, mock).await
        }
        Commands::Validate { preset } => validate(&config, preset),
        Commands::Template { output } => {
            MeasurementPreset::template().save(&output)?;
            println!("Template written to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: BenchConfig, preset_path: PathBuf, force_mock: bool) -> Result<ExitCode> {
    let preset = MeasurementPreset::load(&preset_path)?;
    let mock = force_mock || config.use_mock();
    info!(
        preset = %preset_path.display(),
        device = %preset.device.name,
        kind = %preset.measurement.kind,
        mock,
        "loading sweep"
    );

    let backend = bench::build_backend(&config, mock);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let report = bench::run_preset(&config, &preset, backend, mock, shutdown).await?;

    let snapshot = &report.snapshot;
    match &snapshot.reason {
        Some(reason) => println!(
            "Session {} {} ({}) with {} samples",
            snapshot.id,
            snapshot.state,
            reason,
            snapshot.samples.len()
        ),
        None => println!(
            "Session {} {} with {} samples",
            snapshot.id,
            snapshot.state,
            snapshot.samples.len()
        ),
    }
    if let Some(path) = &report.export_path {
        println!("Data written to {}", path.display());
    }

    Ok(if report.failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn validate(config: &BenchConfig, preset_path: PathBuf) -> Result<ExitCode> {
    let preset = MeasurementPreset::load(&preset_path)?;
    let measurement = &preset.measurement;
    let mock = config.use_mock();
    config.addresses_for(measurement.kind, mock)?;

    println!("Preset {} is valid", preset_path.display());
    println!("  device:   {}", preset.device.name);
    println!("  kind:     {}", measurement.kind);
    println!("  points:   {}", SetpointPlan::new(measurement.sweep).len());
    if let Some(pulse) = measurement.pulse() {
        println!(
            "  pulses:   {:?} every {:?} ({:.2}% duty)",
            pulse.width,
            pulse.period,
            pulse.duty_cycle() * 100.0
        );
    }
    println!("  bench:    {}", if mock { "simulated" } else { "scpi" });
    Ok(ExitCode::SUCCESS)
}

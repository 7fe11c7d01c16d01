//! CLI Entry Point for tuning_daq
//!
//! Provides command-line interface for:
//! - Running an orientation-tuning experiment
//! - Printing the shuffled trial schedule without touching hardware
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Run against the simulated processor and headless display:
//! ```bash
//! tuning_daq run --circuit circuits/tuning.rcx --output data/run1 --channels 1,3,5
//! ```
//!
//! Preview a seeded schedule:
//! ```bash
//! tuning_daq schedule --seed 42
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tuning_daq::config::Settings;
use tuning_daq::data::StorageBackend;
use tuning_daq::experiment::{run_experiment, TrialSchedule};
use tuning_daq::hardware::mock::{MockDisplay, MockProcessor};
use tuning_daq::logging;

#[derive(Parser)]
#[command(name = "tuning_daq")]
#[command(about = "Trial-synchronized acquisition for orientation tuning", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = "config/tuning.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the experiment on simulated hardware
    Run {
        /// Circuit definition to load on the processor
        #[arg(long)]
        circuit: PathBuf,

        /// Output file or directory (defaults to storage.output)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Comma-separated channel ids (defaults to acquisition.channels)
        #[arg(long, value_delimiter = ',')]
        channels: Vec<u32>,

        /// Disable live monitoring
        #[arg(long)]
        no_monitor: bool,

        /// Storage backend override (csv, hdf5, memory)
        #[arg(long)]
        backend: Option<String>,

        /// Fixed shuffling seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print each set's shuffled condition order
    Schedule {
        /// Fixed shuffling seed
        #[arg(long)]
        seed: Option<u64>,

        /// Number of sets to print (defaults to experiment.num_sets)
        #[arg(long)]
        sets: Option<usize>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Run {
            circuit,
            output,
            channels,
            no_monitor,
            backend,
            seed,
        } => {
            let mut settings = settings;
            if let Some(backend) = backend {
                settings.storage.backend = backend.parse::<StorageBackend>()?;
            }
            if seed.is_some() {
                settings.experiment.seed = seed;
            }
            let output = output.unwrap_or_else(|| settings.storage.output.clone());
            let monitoring = settings.monitoring.enabled && !no_monitor;
            run(&settings, &output, &circuit, channels, monitoring).await
        }
        Commands::Schedule { seed, sets } => print_schedule(settings, seed, sets),
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn run(
    settings: &Settings,
    output: &Path,
    circuit: &Path,
    channels: Vec<u32>,
    monitoring: bool,
) -> Result<()> {
    let channels = if channels.is_empty() {
        settings.acquisition.channels.clone()
    } else {
        channels
    };

    let mut processor = MockProcessor::new(settings.mock.sampling_rate);
    if let Some(trials) = settings.mock.fail_after_trials {
        processor = processor.with_disconnect_after(trials);
    }
    if let Some(channel) = settings.mock.short_read_channel {
        processor = processor.with_short_reads_on(channel);
    }
    let display = MockDisplay::new(settings.display_spec()?);

    println!("Orientation tuning: {} sets", settings.experiment.num_sets);
    println!("  Output:   {} ({})", output.display(), settings.storage.backend);
    println!("  Circuit:  {}", circuit.display());
    println!("  Channels: {channels:?}");
    println!();

    match run_experiment(
        settings,
        output,
        circuit,
        &channels,
        monitoring,
        processor,
        &display,
    )
    .await
    {
        Ok(summary) => {
            println!();
            println!("Run {} complete", summary.run_id);
            println!(
                "  {} trials in {} sets, {:.1} s",
                summary.trials_completed,
                summary.sets_completed,
                summary.elapsed.as_secs_f64()
            );
            println!(
                "  {} samples per channel at {} Hz",
                summary.window_length, summary.sampling_rate
            );
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("Run aborted: {e}");
            eprintln!("Trials stored before the fault remain in {}", output.display());
            Err(e.into())
        }
    }
}

fn print_schedule(mut settings: Settings, seed: Option<u64>, sets: Option<usize>) -> Result<()> {
    if seed.is_some() {
        settings.experiment.seed = seed;
    }
    if let Some(sets) = sets {
        settings.experiment.num_sets = sets;
    }
    let plan = settings.experiment_plan(settings.channels()?)?;

    for (set_index, order) in TrialSchedule::new(&plan).into_sets().iter().enumerate() {
        let labels: Vec<String> = order.iter().map(ToString::to_string).collect();
        println!("set_{}: {}", set_index + 1, labels.join(", "));
    }
    Ok(())
}

use clap::Parser;
use color_eyre::Result;
use env_logger::Env;
use log::info;
use std::path::PathBuf;

use ats_solver::config::SolverKind;
use ats_solver::config_loader::{self, CliOverrides};
use ats_solver::experiment;

/// Replay solver experiments and report the resulting bandwidth allocation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the solver configuration YAML file
    #[arg(short, long)]
    config: PathBuf,

    /// Path to the experiment YAML file
    #[arg(short, long)]
    experiment: PathBuf,

    /// Override the solver named in the configuration
    #[arg(long, value_enum)]
    solver: Option<SolverKind>,

    /// Seed for the RL solver's random source
    #[arg(long)]
    seed: Option<u64>,

    /// Write the JSON report here instead of standard output
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("Starting ATS solver evaluation");
    info!("Configuration file: {:?}", args.config);
    info!("Experiment file: {:?}", args.experiment);

    let mut config = config_loader::load_config(&args.config)?;
    config_loader::apply_overrides(&mut config, &CliOverrides { solver: args.solver })?;

    let scenario = experiment::load_experiment(&args.experiment)?;
    let report = experiment::run_experiment(&config, &scenario, args.seed)?;

    info!(
        "Experiment `{}' finished: {} notifications, {} solve passes",
        report.experiment,
        report.notifications.len(),
        report.solve_passes
    );

    match &args.output {
        Some(path) => report.write_json(path)?,
        None => println!("{}", report.to_json()?),
    }

    Ok(())
}

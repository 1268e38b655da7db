use crate::config::{SolverConfig, SolverKind};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::info;
use std::fs::File;
use std::path::Path;

/// Load, parse and validate a solver configuration from a YAML file
pub fn load_config(config_path: &Path) -> Result<SolverConfig> {
    info!("Loading configuration from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open configuration file {:?}", config_path))?;

    let config: SolverConfig = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse configuration file {:?}", config_path))?;

    config.validate()?;

    info!(
        "Using {:?} solver with {} network quotas",
        config.solver,
        config.quotas.len()
    );
    Ok(config)
}

/// CLI arguments that can override YAML settings
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub solver: Option<SolverKind>,
}

/// Apply CLI overrides to a loaded configuration
pub fn apply_overrides(config: &mut SolverConfig, overrides: &CliOverrides) -> Result<()> {
    if let Some(solver) = overrides.solver {
        info!("Overriding solver from command line: {:?}", solver);
        config.solver = solver;
    }

    // Re-validate after applying overrides
    config.validate()?;

    Ok(())
}

//! Experiment reports.

use color_eyre::eyre::Context;
use color_eyre::Result;
use serde::Serialize;
use std::fs;
use std::path::Path;

use super::environment::Notification;
use crate::config::SolverKind;
use crate::types::NetworkType;

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub experiment: String,
    pub solver: SolverKind,
    pub generated_at: String,
    pub episodes: usize,
    /// Distribution passes announced through the progress hook
    pub solve_passes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_steps: Option<u64>,
    pub notifications: Vec<Notification>,
    pub networks: Vec<NetworkReport>,
    pub addresses: Vec<AddressReport>,
}

/// Final occupancy of one network class
#[derive(Debug, Clone, Serialize)]
pub struct NetworkReport {
    pub network: NetworkType,
    pub quota_in: u64,
    pub quota_out: u64,
    pub total_addresses: u32,
    pub active_addresses: u32,
    pub assigned_in: u64,
    pub assigned_out: u64,
}

/// Final state of one address
#[derive(Debug, Clone, Serialize)]
pub struct AddressReport {
    pub peer: u64,
    pub plugin: String,
    pub address: String,
    pub session: u32,
    pub network: NetworkType,
    pub active: bool,
    pub bw_in: u32,
    pub bw_out: u32,
}

impl ExperimentReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize report to JSON")
    }

    /// Write the report as JSON
    pub fn write_json(&self, output_path: &Path) -> Result<()> {
        fs::write(output_path, self.to_json()?)
            .with_context(|| format!("Failed to write JSON report to {}", output_path.display()))?;

        log::info!("JSON report written to {}", output_path.display());
        Ok(())
    }
}

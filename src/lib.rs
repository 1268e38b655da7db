//! # ATS Solver - Bandwidth allocation for automatic transport selection
//!
//! This library decides, for every peer a node talks to, which of the peer's
//! candidate addresses carries traffic and how much inbound and outbound
//! bandwidth it may use, without exceeding the per-network quotas.
//!
//! ## Overview
//!
//! An address registry owns the addresses and drives a solver through a
//! small set of operations (address added, deleted, reclassified, property
//! or preference changed, peer requests a suggestion). The solver answers
//! by marking one address per requested peer active, assigning bandwidth,
//! and notifying the registry through an injected callbacks object.
//!
//! ## Key Features
//!
//! - **Proportional solver**: every active address gets `MIN_BW` plus a
//!   share of the remaining network quota weighted by the peer's preference
//! - **Reinforcement learning solver**: one SARSA or Q-learning agent per
//!   peer with a linear value approximator that grows and shrinks as
//!   addresses come and go
//! - **Network quotas**: loopback, LAN, WAN, WLAN and unspecified traffic
//!   each have their own inbound and outbound budget
//! - **Bulk operation**: batches of changes trigger a single recalculation
//! - **Offline evaluation**: scripted experiments replay registry events
//!   against either solver and report the resulting allocation
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `types`: Peer identities, network classes, preference and property kinds
//! - `address`: Address records and the generation-checked address table
//! - `network`: Per-network quotas and address counters
//! - `solver`: The solver interface, the proportional and the RL strategies
//! - `config`: Solver configuration structures and validation
//! - `config_loader`: Configuration file loading
//! - `experiment`: Experiment files, replay and reports
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ats_solver::{config_loader, experiment};
//! use std::path::Path;
//!
//! // Load solver configuration from YAML file
//! let config = config_loader::load_config(Path::new("solver.yaml"))?;
//!
//! // Replay an experiment against the configured solver
//! let scenario = experiment::load_experiment(Path::new("experiment.yaml"))?;
//! let report = experiment::run_experiment(&config, &scenario, Some(1))?;
//!
//! println!("{}", report.to_json()?);
//! # Ok::<(), color_eyre::Report>(())
//! ```
//!
//! ## Configuration Format
//!
//! ```yaml
//! solver: ril
//! quotas:
//!   - network: lan
//!     in: 1000000
//!     out: 1000000
//!   - network: wan
//!     in: 65536
//!     out: 65536
//! ril:
//!   step_interval: 3s
//!   algorithm: SARSA
//! ```

pub mod address;
pub mod config;
pub mod config_loader;
pub mod experiment;
pub mod network;
pub mod solver;
pub mod types;

pub use address::{Address, AddressId, AddressTable};
pub use config::{QuotaConfig, RilAlgorithm, RilConfig, SolverConfig, SolverKind, ValidationError};
pub use network::{NetworkEntry, QuotaTable};
pub use solver::{
    AnySolver, ProportionalSolver, RilSolver, Solver, SolverCallbacks, SolverError, SolverOperation,
    SolverScope, SolverSlot,
};
pub use types::{
    NetworkType, PeerId, PreferenceKind, PropertyKind, ATS_BLOCKING_DELTA, DEFAULT_PREFERENCE,
    MAX_BANDWIDTH, MIN_BW,
};

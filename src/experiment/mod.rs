//! Offline solver evaluation.
//!
//! An experiment file scripts the events a registry would deliver (addresses
//! appearing and disappearing, peers asking for suggestions, preference and
//! property updates, network reclassification). [`run_experiment`] replays
//! them against a solver and summarizes the outcome in an
//! [`ExperimentReport`].

pub mod environment;
pub mod report;
pub mod runner;
pub mod types;

pub use environment::{EvalEnvironment, Notification};
pub use report::{AddressReport, ExperimentReport, NetworkReport};
pub use runner::{load_experiment, run_experiment};
pub use types::{AddressRef, Episode, Experiment, Operation};

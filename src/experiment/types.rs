//! Experiment file format.

use serde::{Deserialize, Serialize};

use crate::types::{NetworkType, PreferenceKind, PropertyKind};

/// A scripted sequence of registry events replayed against a solver
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Experiment {
    #[serde(default = "default_name")]
    pub name: String,
    pub episodes: Vec<Episode>,
}

/// One batch of operations, optionally followed by RL steps
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Episode {
    /// Wrap the operations in `bulk_start`/`bulk_stop`
    #[serde(default)]
    pub bulk: bool,
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Learning steps to run after the operations (RL solver only)
    #[serde(default)]
    pub steps: u32,
}

/// An address as written in experiment files
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct AddressRef {
    pub peer: u64,
    /// Empty for an inbound connection
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_plugin")]
    pub plugin: String,
    #[serde(default)]
    pub session: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    AddressAdd {
        #[serde(flatten)]
        address: AddressRef,
        network: NetworkType,
        #[serde(default)]
        delay: f64,
        #[serde(default)]
        distance: f64,
    },
    AddressDel {
        #[serde(flatten)]
        address: AddressRef,
        #[serde(default)]
        session_only: bool,
    },
    StartRequest {
        peer: u64,
    },
    StopRequest {
        peer: u64,
    },
    SetPreference {
        peer: u64,
        kind: PreferenceKind,
        value: f64,
    },
    SetProperty {
        #[serde(flatten)]
        address: AddressRef,
        kind: PropertyKind,
        value: f64,
        #[serde(default)]
        abs_value: u32,
    },
    SetInUse {
        #[serde(flatten)]
        address: AddressRef,
        in_use: bool,
    },
    ChangeNetwork {
        #[serde(flatten)]
        address: AddressRef,
        network: NetworkType,
    },
}

fn default_name() -> String {
    "unnamed experiment".to_string()
}

fn default_plugin() -> String {
    "tcp".to_string()
}

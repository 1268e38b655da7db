//! Solver environment used when replaying experiments.
//!
//! Stands in for the preference and performance services of a running
//! registry: it answers the solver's preference and property queries from
//! plain tables and records every bandwidth notification it receives.

use log::debug;
use serde::Serialize;
use std::collections::HashMap;

use crate::address::{Address, AddressId};
use crate::solver::{SolverCallbacks, SolverOperation, SolverScope};
use crate::types::{
    PeerId, PreferenceKind, PropertyKind, DEFAULT_PREFERENCE, PREFERENCE_KIND_COUNT, PROPERTY_COUNT,
};

/// A bandwidth notification as the solver delivered it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub address: String,
    pub peer: String,
    pub active: bool,
    pub bw_in: u32,
    pub bw_out: u32,
}

#[derive(Debug, Default)]
pub struct EvalEnvironment {
    preferences: HashMap<PeerId, [f64; PREFERENCE_KIND_COUNT]>,
    properties: HashMap<AddressId, [f64; PROPERTY_COUNT]>,
    notifications: Vec<Notification>,
    solve_passes: u64,
}

impl EvalEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one preference kind of a peer; kinds never set stay at
    /// [`DEFAULT_PREFERENCE`].
    pub fn set_preference(&mut self, peer: PeerId, kind: PreferenceKind, value: f64) {
        let entry = self
            .preferences
            .entry(peer)
            .or_insert([DEFAULT_PREFERENCE; PREFERENCE_KIND_COUNT]);
        entry[kind.index()] = value;
    }

    pub fn set_property(&mut self, id: AddressId, kind: PropertyKind, value: f64) {
        self.properties.entry(id).or_insert([0.0; PROPERTY_COUNT])[kind.index()] = value;
    }

    /// Drop the properties of a removed address
    pub fn forget_address(&mut self, id: AddressId) {
        self.properties.remove(&id);
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Number of distribution passes the solver announced
    pub fn solve_passes(&self) -> u64 {
        self.solve_passes
    }
}

impl SolverCallbacks for EvalEnvironment {
    fn bandwidth_changed(&mut self, id: AddressId, address: &Address) {
        debug!(
            "Bandwidth for peer `{}' address {} now {} in / {} out, active: {}",
            address.peer, id, address.assigned_bw_in, address.assigned_bw_out, address.active
        );
        self.notifications.push(Notification {
            address: id.to_string(),
            peer: address.peer.to_string(),
            active: address.active,
            bw_in: address.assigned_bw_in,
            bw_out: address.assigned_bw_out,
        });
    }

    fn preferences(&self, peer: &PeerId) -> Option<[f64; PREFERENCE_KIND_COUNT]> {
        self.preferences.get(peer).copied()
    }

    fn properties(&self, id: AddressId, _address: &Address) -> [f64; PROPERTY_COUNT] {
        self.properties.get(&id).copied().unwrap_or([0.0; PROPERTY_COUNT])
    }

    fn solver_info(&mut self, operation: SolverOperation, scope: SolverScope) {
        debug!("Solver progress: {:?} ({:?})", operation, scope);
        if operation == SolverOperation::SolveStart {
            self.solve_passes += 1;
        }
    }
}

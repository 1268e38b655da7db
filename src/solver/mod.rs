//! Solver interface.
//!
//! The address registry drives a solver one operation at a time. Every
//! operation runs to completion before the next one is accepted, and a
//! solver reports its decisions back through the [`SolverCallbacks`]
//! collaborator it was constructed with. Two strategies implement the
//! interface: [`proportional::ProportionalSolver`] and [`ril::RilSolver`].
//! [`AnySolver`] selects one of them from a [`SolverConfig`].

pub mod proportional;
pub mod ril;

use log::warn;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::address::{Address, AddressId, AddressTable};
use crate::config::{SolverConfig, SolverKind};
use crate::network::QuotaTable;
use crate::types::{
    NetworkType, PeerId, PreferenceKind, PropertyKind, PREFERENCE_KIND_COUNT, PROPERTY_COUNT,
};

pub use proportional::{ProportionalSlot, ProportionalSolver};
pub use ril::{RilSlot, RilSolver};

/// Errors raised while constructing a solver
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("No network classes configured")]
    NoNetworks,
    #[error(
        "Quota lists do not match networks: {networks} networks, \
         {quota_in} inbound and {quota_out} outbound quotas"
    )]
    QuotaMismatch {
        networks: usize,
        quota_in: usize,
        quota_out: usize,
    },
    #[error("Network `{0}' configured more than once")]
    DuplicateNetwork(NetworkType),
}

/// Progress events a solver reports while it works
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverOperation {
    SolveStart,
    SolveStop,
    UpdateNotificationStart,
    UpdateNotificationStop,
}

/// Whether a progress event concerns one network or all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverScope {
    Single,
    All,
}

/// Collaborator injected into a solver at construction
pub trait SolverCallbacks {
    /// The assigned bandwidth or activity of `address` changed
    fn bandwidth_changed(&mut self, id: AddressId, address: &Address);

    /// Preference vector of a peer, `None` if nobody expressed one
    fn preferences(&self, peer: &PeerId) -> Option<[f64; PREFERENCE_KIND_COUNT]>;

    /// Normalized quality properties of an address, indexed by [`PropertyKind::index`]
    fn properties(&self, id: AddressId, address: &Address) -> [f64; PROPERTY_COUNT];

    /// Progress hook
    fn solver_info(&mut self, _operation: SolverOperation, _scope: SolverScope) {}
}

/// Operations every solver strategy offers to the address registry.
///
/// Operations never fail: a contract violation or an internal
/// inconsistency is logged and the operation degrades to a no-op.
pub trait Solver {
    /// Start managing `id`, which lives in `network`. Idempotent.
    fn address_add(&mut self, addresses: &mut AddressTable, id: AddressId, network: NetworkType);

    /// Stop managing `id`. With `session_only` only the session ended and
    /// the address stays a candidate.
    fn address_delete(&mut self, addresses: &mut AddressTable, id: AddressId, session_only: bool);

    fn address_property_changed(
        &mut self,
        addresses: &mut AddressTable,
        id: AddressId,
        kind: PropertyKind,
        abs_value: u32,
        rel_value: f64,
    );

    fn address_session_changed(
        &mut self,
        addresses: &mut AddressTable,
        id: AddressId,
        cur_session: u32,
        new_session: u32,
    );

    fn address_inuse_changed(&mut self, addresses: &mut AddressTable, id: AddressId, in_use: bool);

    fn address_change_network(
        &mut self,
        addresses: &mut AddressTable,
        id: AddressId,
        current_network: NetworkType,
        new_network: NetworkType,
    );

    fn address_change_preference(
        &mut self,
        addresses: &mut AddressTable,
        peer: &PeerId,
        kind: PreferenceKind,
        pref_rel: f64,
    );

    /// Application feedback about a peer. Neither strategy uses it yet.
    fn address_preference_feedback(
        &mut self,
        application: u64,
        peer: &PeerId,
        scope: Duration,
        kind: PreferenceKind,
        score: f64,
    ) {
        warn!(
            "Ignoring preference feedback from application {} for peer `{}': {} {:.3} over {:?}",
            application, peer, kind, score, scope
        );
    }

    /// Pick the address that should serve `peer` and register the peer as
    /// wanting suggestions.
    fn get_preferred_address(
        &mut self,
        addresses: &mut AddressTable,
        peer: &PeerId,
    ) -> Option<AddressId>;

    /// The peer no longer wants suggestions
    fn stop_get_preferred_address(&mut self, addresses: &mut AddressTable, peer: &PeerId);

    /// Start a batch of operations
    fn bulk_start(&mut self);

    /// End a batch of operations; pending recalculations run once
    fn bulk_stop(&mut self, addresses: &mut AddressTable);

    /// Shut the solver down and release its private state
    fn done(&mut self, addresses: &mut AddressTable);

    fn is_shut_down(&self) -> bool;
}

/// Private per-address state of whichever solver manages the address
#[derive(Debug, Clone, PartialEq)]
pub enum SolverSlot {
    Proportional(ProportionalSlot),
    Ril(RilSlot),
}

/// The active solver strategy
pub enum AnySolver<C: SolverCallbacks> {
    Proportional(ProportionalSolver<C>),
    Ril(RilSolver<C>),
}

impl<C: SolverCallbacks> AnySolver<C> {
    /// Build the strategy named in `config`
    ///
    /// # Arguments
    /// * `config` - Validated solver configuration
    /// * `callbacks` - Collaborator the solver reports to
    /// * `seed` - Seed for the RL random source; entropy is used if `None`
    pub fn from_config(
        config: &SolverConfig,
        callbacks: C,
        seed: Option<u64>,
    ) -> Result<Self, SolverError> {
        let (networks, quota_in, quota_out) = config.quota_lists();

        match config.solver {
            SolverKind::Proportional => Ok(AnySolver::Proportional(ProportionalSolver::new(
                callbacks, &networks, &quota_in, &quota_out,
            )?)),
            SolverKind::Ril => {
                let solver = RilSolver::new(
                    callbacks,
                    &networks,
                    &quota_in,
                    &quota_out,
                    config.ril.clone(),
                )?;
                Ok(AnySolver::Ril(match seed {
                    Some(seed) => solver.with_seed(seed),
                    None => solver,
                }))
            }
        }
    }

    pub fn kind(&self) -> SolverKind {
        match self {
            AnySolver::Proportional(_) => SolverKind::Proportional,
            AnySolver::Ril(_) => SolverKind::Ril,
        }
    }

    pub fn solver(&self) -> &dyn Solver {
        match self {
            AnySolver::Proportional(solver) => solver,
            AnySolver::Ril(solver) => solver,
        }
    }

    pub fn solver_mut(&mut self) -> &mut dyn Solver {
        match self {
            AnySolver::Proportional(solver) => solver,
            AnySolver::Ril(solver) => solver,
        }
    }

    pub fn callbacks(&self) -> &C {
        match self {
            AnySolver::Proportional(solver) => solver.callbacks(),
            AnySolver::Ril(solver) => solver.callbacks(),
        }
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        match self {
            AnySolver::Proportional(solver) => solver.callbacks_mut(),
            AnySolver::Ril(solver) => solver.callbacks_mut(),
        }
    }

    pub fn quotas(&self) -> &QuotaTable {
        match self {
            AnySolver::Proportional(solver) => solver.quotas(),
            AnySolver::Ril(solver) => solver.quotas(),
        }
    }

    /// Learning steps taken so far, `None` for the proportional strategy
    pub fn step_count(&self) -> Option<u64> {
        match self {
            AnySolver::Proportional(_) => None,
            AnySolver::Ril(solver) => Some(solver.step_count()),
        }
    }

    /// Drive periodic work. Only the RL strategy has any.
    pub fn poll(&mut self, addresses: &mut AddressTable, now: Instant) {
        if let AnySolver::Ril(solver) = self {
            solver.poll(addresses, now);
        }
    }

    /// Run `count` RL steps immediately; a no-op for the proportional strategy
    pub fn run_steps(&mut self, addresses: &mut AddressTable, count: u32) {
        if let AnySolver::Ril(solver) = self {
            for _ in 0..count {
                solver.step(addresses);
            }
        }
    }
}

/// Network an address was classified into by the proportional solver
pub(crate) fn proportional_network(address: &Address) -> Option<NetworkType> {
    match &address.solver_information {
        Some(SolverSlot::Proportional(slot)) => Some(slot.network),
        _ => None,
    }
}

/// Network an address was classified into by the RL solver
pub(crate) fn ril_network(address: &Address) -> Option<NetworkType> {
    match &address.solver_information {
        Some(SolverSlot::Ril(slot)) => Some(slot.network),
        _ => None,
    }
}

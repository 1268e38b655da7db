//! Network quota table.
//!
//! Every network class has a fixed aggregate inbound and outbound quota and
//! live counters of the addresses it holds. Both solvers consult this table
//! before activating an address, and the proportional solver also keeps each
//! network's membership list here.

use log::{debug, error};
use std::collections::HashSet;

use crate::address::AddressId;
use crate::solver::SolverError;
use crate::types::{NetworkType, MIN_BW};

/// Quota and occupancy of one network class
#[derive(Debug, Clone)]
pub struct NetworkEntry {
    /// Network class
    pub network: NetworkType,
    /// Total inbound quota (bytes/s)
    pub total_quota_in: u64,
    /// Total outbound quota (bytes/s)
    pub total_quota_out: u64,
    /// Number of active addresses in this network
    pub active_addresses: u32,
    /// Number of addresses in this network
    pub total_addresses: u32,
    /// Addresses located in this network
    pub members: Vec<AddressId>,
}

impl NetworkEntry {
    pub fn new(network: NetworkType, total_quota_in: u64, total_quota_out: u64) -> Self {
        NetworkEntry {
            network,
            total_quota_in,
            total_quota_out,
            active_addresses: 0,
            total_addresses: 0,
            members: Vec::new(),
        }
    }

    /// Test if bandwidth is available in this network to add an additional
    /// active address
    pub fn is_bandwidth_available(&self) -> bool {
        let candidates = u64::from(self.active_addresses) + 1;
        let min_bw = u64::from(MIN_BW);
        let available = (self.total_quota_in / candidates) > min_bw
            && (self.total_quota_out / candidates) > min_bw;

        debug!(
            "{} bandwidth available for {} active addresses in network `{}'",
            if available { "Enough" } else { "Not enough" },
            candidates,
            self.network
        );
        available
    }

    /// Check that every active address can still get its minimum bandwidth
    pub fn covers_minimum(&self) -> bool {
        let reserved = u64::from(self.active_addresses) * u64::from(MIN_BW);
        reserved <= self.total_quota_in && reserved <= self.total_quota_out
    }
}

/// All network classes known to a solver, plus solver-wide counters
#[derive(Debug, Clone)]
pub struct QuotaTable {
    entries: Vec<NetworkEntry>,
    total_addresses: u32,
    active_addresses: u32,
}

impl QuotaTable {
    /// Build the table from parallel network and quota lists
    pub fn new(
        networks: &[NetworkType],
        quota_in: &[u64],
        quota_out: &[u64],
    ) -> Result<Self, SolverError> {
        if networks.is_empty() {
            return Err(SolverError::NoNetworks);
        }
        if networks.len() != quota_in.len() || networks.len() != quota_out.len() {
            return Err(SolverError::QuotaMismatch {
                networks: networks.len(),
                quota_in: quota_in.len(),
                quota_out: quota_out.len(),
            });
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(networks.len());
        for (i, network) in networks.iter().enumerate() {
            if !seen.insert(*network) {
                return Err(SolverError::DuplicateNetwork(*network));
            }
            debug!(
                "Network `{}' configured with quota in/out: {}/{}",
                network, quota_in[i], quota_out[i]
            );
            entries.push(NetworkEntry::new(*network, quota_in[i], quota_out[i]));
        }

        Ok(QuotaTable {
            entries,
            total_addresses: 0,
            active_addresses: 0,
        })
    }

    pub fn get(&self, network: NetworkType) -> Option<&NetworkEntry> {
        self.entries.iter().find(|entry| entry.network == network)
    }

    pub fn get_mut(&mut self, network: NetworkType) -> Option<&mut NetworkEntry> {
        self.entries.iter_mut().find(|entry| entry.network == network)
    }

    /// Position of a network in the table, which is also its slot in RL state vectors
    pub fn position(&self, network: NetworkType) -> Option<usize> {
        self.entries.iter().position(|entry| entry.network == network)
    }

    pub fn contains(&self, network: NetworkType) -> bool {
        self.get(network).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkEntry> {
        self.entries.iter_mut()
    }

    pub fn networks(&self) -> Vec<NetworkType> {
        self.entries.iter().map(|entry| entry.network).collect()
    }

    /// Admission gate used before activating any address in `network`
    pub fn is_bandwidth_available(&self, network: NetworkType) -> bool {
        self.get(network).map_or(false, NetworkEntry::is_bandwidth_available)
    }

    pub fn total_addresses(&self) -> u32 {
        self.total_addresses
    }

    pub fn active_addresses(&self) -> u32 {
        self.active_addresses
    }

    /// Increment the total and/or active counters of a network
    pub fn increment(&mut self, network: NetworkType, total: bool, active: bool) {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.network == network) else {
            error!("Counter update for unknown network `{}', should never happen", network);
            return;
        };
        if total {
            entry.total_addresses += 1;
            self.total_addresses += 1;
        }
        if active {
            entry.active_addresses += 1;
            self.active_addresses += 1;
        }
    }

    /// Decrement the total and/or active counters of a network.
    ///
    /// Returns `false` if any counter would have underflowed; the counter is
    /// left at zero in that case.
    pub fn decrement(&mut self, network: NetworkType, total: bool, active: bool) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.network == network) else {
            error!("Counter update for unknown network `{}', should never happen", network);
            return false;
        };
        let mut ok = true;
        if total {
            ok &= checked_decrement(&mut entry.total_addresses, "total addresses", network);
            ok &= checked_decrement(&mut self.total_addresses, "solver total addresses", network);
        }
        if active {
            ok &= checked_decrement(&mut entry.active_addresses, "active addresses", network);
            ok &= checked_decrement(&mut self.active_addresses, "solver active addresses", network);
        }
        ok
    }

    /// Overwrite the active counters from a recount, used by the RL solver
    pub fn set_active_counts(&mut self, counts: &[u32]) {
        let mut sum = 0;
        for (entry, count) in self.entries.iter_mut().zip(counts) {
            entry.active_addresses = *count;
            sum += *count;
        }
        self.active_addresses = sum;
    }
}

fn checked_decrement(counter: &mut u32, what: &str, network: NetworkType) -> bool {
    match counter.checked_sub(1) {
        Some(value) => {
            *counter = value;
            true
        }
        None => {
            error!(
                "Counter of {} in network `{}' would drop below zero, should never happen",
                what, network
            );
            false
        }
    }
}

//! Proportional bandwidth solver.
//!
//! Every network guarantees [`MIN_BW`] to each of its active addresses and
//! splits the rest of its quota between them in proportion to the
//! preference weight of their peers. For each peer that asked for
//! suggestions the solver keeps exactly one address active, preferring
//! addresses that already carry bandwidth so that connections stay stable.

use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::time::Instant;

use crate::address::{Address, AddressId, AddressTable};
use crate::network::QuotaTable;
use crate::solver::{
    proportional_network, Solver, SolverCallbacks, SolverError, SolverOperation, SolverScope,
    SolverSlot,
};
use crate::types::{
    preference_weight, NetworkType, PeerId, PreferenceKind, PropertyKind, MAX_BANDWIDTH, MIN_BW,
    PROPERTY_COUNT,
};

/// Per-address state of the proportional solver
#[derive(Debug, Clone, PartialEq)]
pub struct ProportionalSlot {
    /// Network the address is a member of
    pub network: NetworkType,
}

/// Deterministic proportional-share solver
pub struct ProportionalSolver<C: SolverCallbacks> {
    callbacks: C,
    networks: QuotaTable,
    /// Peers with an outstanding suggestion request
    requests: HashSet<PeerId>,
    /// Nesting depth of bulk operations
    bulk_lock: u32,
    /// Redistributions suppressed while bulk locked
    bulk_requests: u32,
    shut_down: bool,
}

impl<C: SolverCallbacks> ProportionalSolver<C> {
    /// Create a solver for the given networks.
    ///
    /// # Arguments
    /// * `callbacks` - Collaborator notified about bandwidth changes
    /// * `networks` - Network classes to manage
    /// * `quota_in` - Inbound quota per network, same order as `networks`
    /// * `quota_out` - Outbound quota per network, same order as `networks`
    pub fn new(
        callbacks: C,
        networks: &[NetworkType],
        quota_in: &[u64],
        quota_out: &[u64],
    ) -> Result<Self, SolverError> {
        let networks = QuotaTable::new(networks, quota_in, quota_out)?;
        info!("Proportional solver managing {} networks", networks.len());
        Ok(ProportionalSolver {
            callbacks,
            networks,
            requests: HashSet::new(),
            bulk_lock: 0,
            bulk_requests: 0,
            shut_down: false,
        })
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    pub fn quotas(&self) -> &QuotaTable {
        &self.networks
    }

    pub fn is_requested(&self, peer: &PeerId) -> bool {
        self.requests.contains(peer)
    }

    /// Redistribute one network, or all of them if `network` is `None`.
    ///
    /// While a bulk operation is in progress the request is only counted.
    /// `excluded` is left out of the change notifications.
    fn distribute_bandwidth_in_network(
        &mut self,
        addresses: &mut AddressTable,
        network: Option<NetworkType>,
        excluded: Option<AddressId>,
    ) {
        if self.bulk_lock > 0 {
            self.bulk_requests += 1;
            debug!("Solver is bulk locked, deferring redistribution");
            return;
        }

        let (targets, scope) = match network {
            Some(network) => (vec![network], SolverScope::Single),
            None => (self.networks.networks(), SolverScope::All),
        };

        self.callbacks.solver_info(SolverOperation::SolveStart, scope);
        let mut changed = Vec::new();
        for network in targets {
            changed.extend(self.distribute_bandwidth(addresses, network, excluded));
        }
        self.callbacks.solver_info(SolverOperation::SolveStop, scope);

        if changed.is_empty() {
            return;
        }
        self.callbacks.solver_info(SolverOperation::UpdateNotificationStart, scope);
        for id in changed {
            self.notify(addresses, id);
        }
        self.callbacks.solver_info(SolverOperation::UpdateNotificationStop, scope);
    }

    /// Assign bandwidth to the active addresses of a network and return the
    /// addresses whose assignment changed
    fn distribute_bandwidth(
        &self,
        addresses: &mut AddressTable,
        network: NetworkType,
        excluded: Option<AddressId>,
    ) -> Vec<AddressId> {
        let Some(entry) = self.networks.get(network) else {
            warn!("Cannot distribute bandwidth in unknown network `{}'", network);
            return Vec::new();
        };

        info!(
            "Recalculate quota for network `{}' for {} active addresses (in/out): {}/{}",
            network, entry.active_addresses, entry.total_quota_in, entry.total_quota_out
        );
        if entry.active_addresses == 0 {
            return Vec::new();
        }
        if !entry.covers_minimum() {
            error!(
                "Network `{}' cannot give {} bytes/s to {} addresses, should never happen",
                network, MIN_BW, entry.active_addresses
            );
            return Vec::new();
        }

        let min_bw = u64::from(MIN_BW);
        let reserved = u64::from(entry.active_addresses) * min_bw;
        let remaining_in = entry.total_quota_in - reserved;
        let remaining_out = entry.total_quota_out - reserved;
        debug!("Remaining bandwidth (in/out): {}/{}", remaining_in, remaining_out);

        let mut weights = Vec::new();
        for id in &entry.members {
            if let Some(address) = addresses.get(*id) {
                if address.active {
                    let preferences = self.callbacks.preferences(&address.peer);
                    weights.push((*id, preference_weight(preferences.as_ref())));
                }
            }
        }
        if weights.len() != entry.active_addresses as usize {
            error!(
                "Counted {} active addresses in network `{}' but expected {}, should never happen",
                weights.len(),
                network,
                entry.active_addresses
            );
        }

        let total_weight: f64 = weights.iter().map(|(_, weight)| weight).sum();
        debug!(
            "Total relative preference {:.3} for {} addresses in network `{}'",
            total_weight,
            weights.len(),
            network
        );

        let count = weights.len();
        let mut changed = Vec::new();
        let mut used_in = 0u64;
        let mut used_out = 0u64;
        for (id, weight) in weights {
            let share = if total_weight > 0.0 {
                weight / total_weight
            } else {
                1.0 / count as f64
            };
            let assigned_in = clamp_bandwidth(min_bw as f64 + share * remaining_in as f64);
            let assigned_out = clamp_bandwidth(min_bw as f64 + share * remaining_out as f64);
            used_in += u64::from(assigned_in);
            used_out += u64::from(assigned_out);

            let Some(address) = addresses.get_mut(id) else {
                continue;
            };
            debug!(
                "New quota for peer `{}' with weight {:.3}/{:.3} (in/out): {}/{}",
                address.peer, weight, total_weight, assigned_in, assigned_out
            );
            if address.assigned_bw_in != assigned_in || address.assigned_bw_out != assigned_out {
                address.assigned_bw_in = assigned_in;
                address.assigned_bw_out = assigned_out;
                if Some(id) != excluded {
                    changed.push(id);
                }
            }
        }

        if used_in > entry.total_quota_in + 1 || used_out > entry.total_quota_out + 1 {
            error!(
                "Assigned {}/{} exceeds quota {}/{} in network `{}', should never happen",
                used_in, used_out, entry.total_quota_in, entry.total_quota_out, network
            );
        }
        changed
    }

    fn notify(&mut self, addresses: &AddressTable, id: AddressId) {
        if let Some(address) = addresses.get(id) {
            self.callbacks.bandwidth_changed(id, address);
        }
    }

    /// The address currently active for a peer
    fn active_address(&self, addresses: &AddressTable, peer: &PeerId) -> Option<AddressId> {
        let mut active = None;
        for id in addresses.peer_addresses(peer) {
            let Some(address) = addresses.get(id) else {
                continue;
            };
            if !address.active || proportional_network(address).is_none() {
                continue;
            }
            if active.is_some() {
                error!("Multiple active addresses for peer `{}', should never happen", peer);
                break;
            }
            active = Some(id);
        }
        active
    }

    /// Find the best address for a peer among the addresses this solver
    /// manages. Inactive addresses inside their blocking window or in a
    /// network without headroom are skipped.
    fn find_best_address(
        &self,
        addresses: &AddressTable,
        peer: &PeerId,
        now: Instant,
    ) -> Option<AddressId> {
        let mut best: Option<(AddressId, &Address, [f64; PROPERTY_COUNT])> = None;

        for id in addresses.peer_addresses(peer) {
            let Some(address) = addresses.get(id) else {
                continue;
            };
            let Some(network) = proportional_network(address) else {
                continue;
            };
            if !address.active {
                if address.is_blocked(now) {
                    debug!("Address {} blocked for suggestion", id);
                    continue;
                }
                if !self.networks.is_bandwidth_available(network) {
                    debug!("No bandwidth available for address {} in network `{}'", id, network);
                    continue;
                }
            }

            let properties = self.callbacks.properties(id, address);
            match best {
                None => {
                    debug!("Setting initial address {}", id);
                    best = Some((id, address, properties));
                }
                Some((_, best_address, best_properties)) => {
                    if is_better(address, &properties, best_address, &best_properties) {
                        debug!("Preferring address {}", id);
                        best = Some((id, address, properties));
                    }
                }
            }
        }
        best.map(|(id, _, _)| id)
    }

    /// Make the best address of a peer its active address.
    ///
    /// The previous active address is switched off and its network
    /// redistributed. If no address qualifies the peer is disconnected.
    /// `notify_winner` controls whether a newly activated address is
    /// included in the change notifications of its network.
    fn update_active_address(
        &mut self,
        addresses: &mut AddressTable,
        peer: &PeerId,
        notify_winner: bool,
    ) -> Option<AddressId> {
        info!("Updating active address for peer `{}'", peer);
        let current = self.active_address(addresses, peer);
        let best = self.find_best_address(addresses, peer, Instant::now());

        if let Some(current) = current {
            if best != Some(current) {
                info!("Disabling previous active address {} for peer `{}'", current, peer);
                self.deactivate(addresses, current);
            }
            if best.is_none() {
                info!("Disconnecting peer `{}' with previous address {}", peer, current);
                self.notify(addresses, current);
            }
        }

        let Some(best) = best else {
            info!("Cannot suggest address for peer `{}'", peer);
            return None;
        };
        if current == Some(best) {
            return Some(best);
        }

        let Some(address) = addresses.get_mut(best) else {
            return None;
        };
        let Some(network) = proportional_network(address) else {
            return None;
        };
        address.active = true;
        self.networks.increment(network, false, true);
        info!("Address {} for peer `{}' is now active", best, peer);

        let excluded = if notify_winner { None } else { Some(best) };
        self.distribute_bandwidth_in_network(addresses, Some(network), excluded);
        Some(best)
    }

    /// Switch an active address off and redistribute its network
    fn deactivate(&mut self, addresses: &mut AddressTable, id: AddressId) {
        let Some(address) = addresses.get_mut(id) else {
            return;
        };
        let Some(network) = proportional_network(address) else {
            return;
        };
        address.active = false;
        address.assigned_bw_in = 0;
        address.assigned_bw_out = 0;
        self.networks.decrement(network, false, true);
        self.distribute_bandwidth_in_network(addresses, Some(network), None);
    }

    /// Re-evaluate a requested peer after one of its inputs changed
    fn reevaluate_peer(&mut self, addresses: &mut AddressTable, peer: &PeerId) {
        if !self.requests.contains(peer) {
            return;
        }
        let active = self.active_address(addresses, peer);
        let best = self.update_active_address(addresses, peer, true);
        if best.is_some() && best == active {
            // Same address kept, its share may still have moved
            let network = best
                .and_then(|id| addresses.get(id))
                .and_then(proportional_network);
            if let Some(network) = network {
                self.distribute_bandwidth_in_network(addresses, Some(network), None);
            }
        }
    }

    fn managed_network(
        &self,
        addresses: &AddressTable,
        id: AddressId,
    ) -> Option<(PeerId, NetworkType)> {
        let Some(address) = addresses.get(id) else {
            warn!("Unknown address {}", id);
            return None;
        };
        match proportional_network(address) {
            Some(network) => Some((address.peer, network)),
            None => {
                warn!("Address {} is not managed by the proportional solver", id);
                None
            }
        }
    }
}

/// Compare a candidate against the current best address. Returns `true`
/// only if the candidate is strictly better, so the first address seen
/// wins ties.
fn is_better(
    candidate: &Address,
    candidate_properties: &[f64; PROPERTY_COUNT],
    best: &Address,
    best_properties: &[f64; PROPERTY_COUNT],
) -> bool {
    // an active address counts as funded even while redistribution is deferred
    let candidate_funded = candidate.active || candidate.assigned_bw_in > 0;
    let best_funded = best.active || best.assigned_bw_in > 0;
    if candidate_funded != best_funded {
        return candidate_funded;
    }

    if candidate.plugin == best.plugin && candidate.is_inbound() != best.is_inbound() {
        return candidate.is_inbound();
    }

    let distance = PropertyKind::Distance.index();
    if candidate_properties[distance] != best_properties[distance] {
        return candidate_properties[distance] < best_properties[distance];
    }

    let delay = PropertyKind::Delay.index();
    candidate_properties[delay] < best_properties[delay]
}

fn clamp_bandwidth(value: f64) -> u32 {
    if value >= f64::from(MAX_BANDWIDTH) {
        MAX_BANDWIDTH
    } else if value <= 0.0 {
        0
    } else {
        value as u32
    }
}

impl<C: SolverCallbacks> Solver for ProportionalSolver<C> {
    fn address_add(&mut self, addresses: &mut AddressTable, id: AddressId, network: NetworkType) {
        if self.shut_down {
            warn!("Ignoring address {} added after shutdown", id);
            return;
        }
        let Some(address) = addresses.get_mut(id) else {
            warn!("Cannot add unknown address {}", id);
            return;
        };
        match &address.solver_information {
            Some(SolverSlot::Proportional(_)) => {
                debug!("Address {} is already known", id);
                return;
            }
            Some(SolverSlot::Ril(_)) => {
                warn!("Address {} is managed by another solver", id);
                return;
            }
            None => {}
        }
        let peer = address.peer;

        let Some(entry) = self.networks.get_mut(network) else {
            error!("Unknown network `{}' for new address {} of peer `{}'", network, id, peer);
            return;
        };
        entry.members.push(id);
        address.solver_information = Some(SolverSlot::Proportional(ProportionalSlot { network }));
        self.networks.increment(network, true, false);

        if let Some(entry) = self.networks.get(network) {
            info!(
                "Adding address {} for peer `{}', network `{}' now has {} total and {} active",
                id, peer, network, entry.total_addresses, entry.active_addresses
            );
        }

        if !self.requests.contains(&peer) || self.active_address(addresses, &peer).is_some() {
            return;
        }
        self.update_active_address(addresses, &peer, true);
    }

    fn address_delete(&mut self, addresses: &mut AddressTable, id: AddressId, session_only: bool) {
        let Some((peer, network)) = self.managed_network(addresses, id) else {
            return;
        };
        let was_active = addresses.get(id).map_or(false, |address| address.active);

        if session_only {
            info!(
                "Deleting session of {} address {} for peer `{}' in network `{}'",
                if was_active { "active" } else { "inactive" },
                id,
                peer,
                network
            );
        } else {
            info!(
                "Deleting {} address {} for peer `{}' from network `{}'",
                if was_active { "active" } else { "inactive" },
                id,
                peer,
                network
            );
            self.networks.decrement(network, true, false);
            if let Some(entry) = self.networks.get_mut(network) {
                let before = entry.members.len();
                entry.members.retain(|member| *member != id);
                if entry.members.len() == before {
                    error!(
                        "Address {} missing from network `{}', should never happen",
                        id, network
                    );
                }
            }
        }

        if was_active {
            if let Some(address) = addresses.get_mut(id) {
                address.active = false;
                address.assigned_bw_in = 0;
                address.assigned_bw_out = 0;
            }
            self.networks.decrement(network, false, true);
            self.distribute_bandwidth_in_network(addresses, Some(network), None);

            if !session_only {
                // Drop the slot before searching so the address cannot win again
                if let Some(address) = addresses.get_mut(id) {
                    address.solver_information = None;
                }
            }
            if self.update_active_address(addresses, &peer, true).is_none() {
                info!("Disconnecting peer `{}' after deleting previous address {}", peer, id);
                self.notify(addresses, id);
            }
        }

        if !session_only {
            if let Some(address) = addresses.get_mut(id) {
                address.solver_information = None;
            }
        }

        if let Some(entry) = self.networks.get(network) {
            info!(
                "After deleting address now total {} and active {} addresses in network `{}'",
                entry.total_addresses, entry.active_addresses, network
            );
        }
    }

    fn address_property_changed(
        &mut self,
        addresses: &mut AddressTable,
        id: AddressId,
        kind: PropertyKind,
        abs_value: u32,
        rel_value: f64,
    ) {
        let Some((peer, _)) = self.managed_network(addresses, id) else {
            return;
        };
        info!(
            "Property `{}' for peer `{}' address {} changed to {} ({:.2})",
            kind, peer, id, abs_value, rel_value
        );
        self.reevaluate_peer(addresses, &peer);
    }

    fn address_session_changed(
        &mut self,
        addresses: &mut AddressTable,
        id: AddressId,
        cur_session: u32,
        new_session: u32,
    ) {
        if cur_session != new_session {
            debug!("Session changed from {} to {}", cur_session, new_session);
        }
        let Some((peer, _)) = self.managed_network(addresses, id) else {
            return;
        };
        self.reevaluate_peer(addresses, &peer);
    }

    fn address_inuse_changed(&mut self, addresses: &mut AddressTable, id: AddressId, in_use: bool) {
        let Some(address) = addresses.get_mut(id) else {
            warn!("Unknown address {}", id);
            return;
        };
        debug!(
            "Usage of address {} for peer `{}' changed to {}",
            id,
            address.peer,
            if in_use { "in use" } else { "not in use" }
        );
        address.used = in_use;
    }

    fn address_change_network(
        &mut self,
        addresses: &mut AddressTable,
        id: AddressId,
        current_network: NetworkType,
        new_network: NetworkType,
    ) {
        if current_network == new_network {
            warn!("Address {} already in network `{}'", id, new_network);
            return;
        }
        let Some((peer, old_network)) = self.managed_network(addresses, id) else {
            return;
        };
        if old_network != current_network {
            warn!(
                "Address {} is in network `{}', not `{}'",
                id, old_network, current_network
            );
        }
        let was_active = addresses.get(id).map_or(false, |address| address.active);
        debug!(
            "Network type changed, moving {} address from `{}' to `{}'",
            if was_active { "active" } else { "inactive" },
            old_network,
            new_network
        );

        self.bulk_start();

        if was_active {
            if let Some(address) = addresses.get_mut(id) {
                address.active = false;
                address.assigned_bw_in = 0;
                address.assigned_bw_out = 0;
            }
            self.networks.decrement(old_network, false, true);
            self.distribute_bandwidth_in_network(addresses, Some(old_network), None);
        }
        self.networks.decrement(old_network, true, false);
        if let Some(entry) = self.networks.get_mut(old_network) {
            entry.members.retain(|member| *member != id);
        }

        let attached = match self.networks.get_mut(new_network) {
            Some(entry) => {
                entry.members.push(id);
                self.networks.increment(new_network, true, false);
                if let Some(address) = addresses.get_mut(id) {
                    address.solver_information =
                        Some(SolverSlot::Proportional(ProportionalSlot { network: new_network }));
                }
                true
            }
            None => {
                error!("Invalid network type `{}' for address {}: disconnect", new_network, id);
                if let Some(address) = addresses.get_mut(id) {
                    address.solver_information = None;
                }
                self.notify(addresses, id);
                false
            }
        };

        self.bulk_stop(addresses);

        if !was_active || !self.requests.contains(&peer) {
            return;
        }
        if attached && self.networks.is_bandwidth_available(new_network) {
            if let Some(address) = addresses.get_mut(id) {
                address.active = true;
            }
            self.networks.increment(new_network, false, true);
            self.distribute_bandwidth_in_network(addresses, Some(new_network), None);
        } else if self.update_active_address(addresses, &peer, true).is_none() && attached {
            self.notify(addresses, id);
        }
    }

    fn address_change_preference(
        &mut self,
        addresses: &mut AddressTable,
        peer: &PeerId,
        kind: PreferenceKind,
        pref_rel: f64,
    ) {
        debug!("Preference `{}' for peer `{}' changed to {:.3}", kind, peer, pref_rel);
        self.reevaluate_peer(addresses, peer);
    }

    fn get_preferred_address(
        &mut self,
        addresses: &mut AddressTable,
        peer: &PeerId,
    ) -> Option<AddressId> {
        if self.requests.insert(*peer) {
            info!("Start suggesting addresses for peer `{}'", peer);
        }
        self.update_active_address(addresses, peer, false)
    }

    fn stop_get_preferred_address(&mut self, addresses: &mut AddressTable, peer: &PeerId) {
        if self.requests.remove(peer) {
            info!("Stop suggesting addresses for peer `{}'", peer);
        } else {
            warn!("Peer `{}' never requested an address", peer);
        }
        if let Some(current) = self.active_address(addresses, peer) {
            info!("Disabling active address {} for peer `{}'", current, peer);
            self.deactivate(addresses, current);
        }
    }

    fn bulk_start(&mut self) {
        debug!("Locking solver for bulk operation ...");
        self.bulk_lock += 1;
    }

    fn bulk_stop(&mut self, addresses: &mut AddressTable) {
        debug!("Unlocking solver from bulk operation ...");
        if self.bulk_lock == 0 {
            warn!("Bulk unlock without matching lock");
            return;
        }
        self.bulk_lock -= 1;
        if self.bulk_lock == 0 && self.bulk_requests > 0 {
            info!("No lock pending, recalculating");
            self.bulk_requests = 0;
            self.distribute_bandwidth_in_network(addresses, None, None);
        }
    }

    fn done(&mut self, addresses: &mut AddressTable) {
        if self.networks.total_addresses() > 0 {
            warn!(
                "Shutting down with {} addresses still registered",
                self.networks.total_addresses()
            );
        }
        let managed: Vec<AddressId> = self
            .networks
            .iter()
            .flat_map(|entry| entry.members.iter().copied())
            .collect();
        for id in managed {
            if let Some(address) = addresses.get_mut(id) {
                address.solver_information = None;
            }
        }
        for entry in self.networks.iter_mut() {
            entry.members.clear();
        }
        self.requests.clear();
        self.shut_down = true;
        info!("Proportional solver shut down");
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

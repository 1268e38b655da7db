//! Reinforcement-learning solver.
//!
//! Every peer gets an [`Agent`] that learns, by temporal-difference updates
//! of a linear action-value approximation, which address to use and how
//! much bandwidth to request. Agents of peers nobody asked for are kept
//! but not stepped. Steps run periodically on the caller's thread through
//! [`RilSolver::poll`]; address changes resize the affected agent before
//! the next step can see it.

pub mod agent;
pub mod matrix;
pub mod reward;
pub mod schedule;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::address::{AddressId, AddressTable};
use crate::config::{RilAlgorithm, RilConfig};
use crate::network::QuotaTable;
use crate::solver::{
    ril_network, Solver, SolverCallbacks, SolverError, SolverOperation, SolverScope, SolverSlot,
};
use crate::types::{NetworkType, PeerId, PreferenceKind, PropertyKind, MIN_BW};

pub use agent::{Action, Agent, FEATURES_PER_ADDRESS, FEATURES_PER_NETWORK, META_ACTION_COUNT};
pub use reward::{RandomReward, RewardFunction};
pub use schedule::StepTimer;

/// Bandwidth added or removed by the increment and decrement actions
pub const RIL_INC_DEC_STEP: u32 = MIN_BW;

/// Per-address state of the RL solver
#[derive(Debug, Clone, PartialEq)]
pub struct RilSlot {
    /// Network the address belongs to
    pub network: NetworkType,
}

/// Bandwidth in use per network, indexed like the quota table
#[derive(Debug, Clone, Copy, Default)]
struct NetworkUsage {
    assigned_in: u64,
    assigned_out: u64,
    active: u32,
}

/// Online learning solver
pub struct RilSolver<C: SolverCallbacks> {
    callbacks: C,
    networks: QuotaTable,
    params: RilConfig,
    agents: Vec<Agent>,
    rng: StdRng,
    reward: Box<dyn RewardFunction>,
    timer: StepTimer,
    bulk_lock: u32,
    bulk_changes: u32,
    step_count: u64,
    shut_down: bool,
}

impl<C: SolverCallbacks> RilSolver<C> {
    /// Create a solver for the given networks.
    ///
    /// The first step is due one `step_interval` after construction.
    pub fn new(
        callbacks: C,
        networks: &[NetworkType],
        quota_in: &[u64],
        quota_out: &[u64],
        params: RilConfig,
    ) -> Result<Self, SolverError> {
        let networks = QuotaTable::new(networks, quota_in, quota_out)?;
        info!(
            "RL solver managing {} networks with {:?}, step interval {:?}",
            networks.len(),
            params.algorithm,
            params.step_interval
        );
        Ok(RilSolver {
            callbacks,
            networks,
            timer: StepTimer::new(params.step_interval, Instant::now()),
            params,
            agents: Vec::new(),
            rng: StdRng::from_entropy(),
            reward: Box::new(RandomReward),
            bulk_lock: 0,
            bulk_changes: 0,
            step_count: 0,
            shut_down: false,
        })
    }

    /// Use a seeded random source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Replace the reward signal
    pub fn with_reward(mut self, reward: Box<dyn RewardFunction>) -> Self {
        self.reward = reward;
        self
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

    pub fn params(&self) -> &RilConfig {
        &self.params
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn step_interval(&self) -> Duration {
        self.timer.interval()
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agent(&self, peer: &PeerId) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.peer == *peer)
    }

    pub fn agent_mut(&mut self, peer: &PeerId) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|agent| agent.peer == *peer)
    }

    fn agent_index(&self, peer: &PeerId) -> Option<usize> {
        self.agents.iter().position(|agent| agent.peer == *peer)
    }

    fn agent_index_or_create(&mut self, peer: PeerId) -> usize {
        match self.agent_index(&peer) {
            Some(index) => index,
            None => {
                debug!("Creating agent for peer `{}'", peer);
                self.agents.push(Agent::new(peer, self.networks.len(), MIN_BW));
                self.agents.len() - 1
            }
        }
    }

    /// Run a step if the interval elapsed
    pub fn poll(&mut self, addresses: &mut AddressTable, now: Instant) {
        if self.shut_down || !self.timer.is_due(now) {
            return;
        }
        self.timer.reschedule(now);
        self.step(addresses);
    }

    /// One learning step for every active agent.
    ///
    /// While bulk locked the step is only recorded and runs at unlock.
    pub fn step(&mut self, addresses: &mut AddressTable) {
        if self.shut_down {
            return;
        }
        if self.bulk_lock > 0 {
            self.bulk_changes += 1;
            debug!("Solver is bulk locked, deferring step");
            return;
        }

        self.callbacks.solver_info(SolverOperation::SolveStart, SolverScope::All);
        debug!("RL step number {}", self.step_count);
        for index in 0..self.agents.len() {
            if !self.agents[index].active {
                continue;
            }
            if self.agents[index].address_inuse.is_none() {
                self.try_unblock(addresses, index, false);
            }
            if self.agents[index].address_inuse.is_some() {
                self.agent_step(addresses, index);
            }
        }
        self.enforce_quotas(addresses);
        self.refresh_counts(addresses);
        self.step_count += 1;
        self.callbacks.solver_info(SolverOperation::SolveStop, SolverScope::All);

        self.flush_notifications(addresses, SolverScope::All);
    }

    fn agent_step(&mut self, addresses: &mut AddressTable, index: usize) {
        let usage = self.network_usage(addresses);
        let s_next = self.state(addresses, &self.agents[index], &usage);
        let peer = self.agents[index].peer;
        let reward = self.reward.reward(&peer, &s_next, &mut self.rng);
        let explore = self.rng.gen::<f64>() < self.params.explore_ratio;

        let alpha = self.params.gradient_step_size;
        let gamma = self.params.discount_factor;
        let lambda = self.params.trace_decay;

        let agent = &mut self.agents[index];
        let n = agent.n();
        let a_next = match self.params.algorithm {
            RilAlgorithm::Sarsa => {
                let a_next = if explore {
                    self.rng.gen_range(0..n)
                } else {
                    agent.best_action(&s_next)
                };
                if agent.last_action().is_some() {
                    // on-policy: the chosen action is the target
                    agent.update_weights(reward, &s_next, a_next, alpha, gamma);
                    agent.decay_eligibility(gamma * lambda);
                }
                a_next
            }
            RilAlgorithm::QLearning => {
                let a_best = agent.best_action(&s_next);
                if agent.last_action().is_some() {
                    // off-policy: the greedy action is the target
                    agent.update_weights(reward, &s_next, a_best, alpha, gamma);
                }
                if explore {
                    agent.clear_eligibility();
                    self.rng.gen_range(0..n)
                } else {
                    agent.decay_eligibility(gamma * lambda);
                    agent.best_action(&s_next)
                }
            }
        };
        agent.accumulate_eligibility(&s_next);

        info!(
            "Step {} of peer `{}': reward {:.3}, in {} KiB/s, out {} KiB/s, action {:?}{}",
            agent.step_count,
            peer,
            reward,
            agent.bw_in / 1024,
            agent.bw_out / 1024,
            Action::from_index(a_next),
            if explore { " (explore)" } else { "" }
        );

        self.execute(addresses, index, Action::from_index(a_next));
        self.agents[index].finish_step(s_next, a_next);
    }

    /// Apply an action of an agent to its in-use address
    fn execute(&mut self, addresses: &mut AddressTable, index: usize, action: Action) {
        let agent = &self.agents[index];
        let Some(inuse) = agent.address_inuse else {
            debug!("Peer `{}' has no address in use, ignoring {:?}", agent.peer, action);
            return;
        };
        let (bw_in, bw_out) = (agent.bw_in, agent.bw_out);
        let (cap_in, cap_out) = self.headroom(addresses, index);
        let grow_in = |bw: u32| bw.min(cap_in.max(bw_in));
        let grow_out = |bw: u32| bw.min(cap_out.max(bw_out));
        let step = RIL_INC_DEC_STEP;
        let shrink = |bw: u32| bw.saturating_sub(step).max(MIN_BW);

        let (target, new_in, new_out) = match action {
            Action::Nothing => return,
            Action::BwInDouble => (inuse, grow_in(bw_in.saturating_mul(2)), bw_out),
            Action::BwInHalve => (inuse, (bw_in / 2).max(MIN_BW), bw_out),
            Action::BwInIncrement => (inuse, grow_in(bw_in.saturating_add(step)), bw_out),
            Action::BwInDecrement => (inuse, shrink(bw_in), bw_out),
            Action::BwOutDouble => (inuse, bw_in, grow_out(bw_out.saturating_mul(2))),
            Action::BwOutHalve => (inuse, bw_in, (bw_out / 2).max(MIN_BW)),
            Action::BwOutIncrement => (inuse, bw_in, grow_out(bw_out.saturating_add(step))),
            Action::BwOutDecrement => (inuse, bw_in, shrink(bw_out)),
            Action::SwitchTo(k) => {
                let Some(target) = agent.address_for(action.index()) else {
                    error!(
                        "Peer `{}' has no address for switch action {}, should never happen",
                        agent.peer, k
                    );
                    return;
                };
                if target != inuse {
                    let from = addresses.get(inuse).and_then(ril_network);
                    let to = addresses.get(target).and_then(ril_network);
                    let Some(to) = to else {
                        return;
                    };
                    if from != Some(to) && !self.networks.is_bandwidth_available(to) {
                        debug!("No bandwidth in network `{}' to switch peer `{}'", to, agent.peer);
                        return;
                    }
                }
                (target, bw_in, bw_out)
            }
        };
        self.set_active_suggestion(addresses, index, Some(target), new_in, new_out, false);
    }

    /// Move an agent to `new_address` with the given bandwidth.
    ///
    /// This is the only place that changes what an agent suggests. A real
    /// change is reported once the current operation finishes, unless
    /// `silent` is set or nobody asked for the peer.
    fn set_active_suggestion(
        &mut self,
        addresses: &mut AddressTable,
        index: usize,
        new_address: Option<AddressId>,
        new_in: u32,
        new_out: u32,
        silent: bool,
    ) {
        let agent = &mut self.agents[index];
        let previous = agent.address_inuse;
        let mut notify = false;

        if previous != new_address {
            if let Some(old) = previous {
                if let Some(address) = addresses.get_mut(old) {
                    address.active = false;
                    address.assigned_bw_in = 0;
                    address.assigned_bw_out = 0;
                }
            }
            if let Some(new) = new_address {
                if let Some(address) = addresses.get_mut(new) {
                    address.active = agent.active;
                    address.assigned_bw_in = agent.bw_in;
                    address.assigned_bw_out = agent.bw_out;
                }
            }
            notify = true;
        }

        match new_address {
            Some(id) => {
                if let Some(address) = addresses.get_mut(id) {
                    if address.active != agent.active {
                        address.active = agent.active;
                        notify = true;
                    }
                    if agent.bw_in != new_in {
                        agent.bw_in = new_in;
                        address.assigned_bw_in = new_in;
                        notify = true;
                    }
                    if agent.bw_out != new_out {
                        agent.bw_out = new_out;
                        address.assigned_bw_out = new_out;
                        notify = true;
                    }
                }
            }
            None => {
                agent.bw_in = 0;
                agent.bw_out = 0;
            }
        }
        agent.address_inuse = new_address;

        if notify && agent.active && !silent {
            if let Some(id) = new_address.or(previous) {
                agent.set_pending_notification(id);
            }
        }
        self.refresh_counts(addresses);
    }

    /// First candidate of an agent whose network can take another active address
    fn first_available(&self, addresses: &AddressTable, index: usize) -> Option<AddressId> {
        self.agents[index].addresses().iter().copied().find(|id| {
            addresses
                .get(*id)
                .and_then(ril_network)
                .map_or(false, |network| self.networks.is_bandwidth_available(network))
        })
    }

    /// Give an agent without an address its first admissible candidate
    fn try_unblock(&mut self, addresses: &mut AddressTable, index: usize, silent: bool) {
        if self.agents[index].address_inuse.is_some() {
            return;
        }
        match self.first_available(addresses, index) {
            Some(id) => {
                self.set_active_suggestion(addresses, index, Some(id), MIN_BW, MIN_BW, silent)
            }
            None => debug!("No address available for peer `{}'", self.agents[index].peer),
        }
    }

    fn network_usage(&self, addresses: &AddressTable) -> Vec<NetworkUsage> {
        let mut usage = vec![NetworkUsage::default(); self.networks.len()];
        for agent in self.agents.iter().filter(|agent| agent.active) {
            let Some(network) = agent
                .address_inuse
                .and_then(|id| addresses.get(id))
                .and_then(ril_network)
            else {
                continue;
            };
            if let Some(position) = self.networks.position(network) {
                usage[position].assigned_in += u64::from(agent.bw_in);
                usage[position].assigned_out += u64::from(agent.bw_out);
                usage[position].active += 1;
            }
        }
        usage
    }

    /// Largest inbound and outbound bandwidth an agent may hold without
    /// pushing its network over quota
    fn headroom(&self, addresses: &AddressTable, index: usize) -> (u32, u32) {
        let agent = &self.agents[index];
        let Some(network) = agent
            .address_inuse
            .and_then(|id| addresses.get(id))
            .and_then(ril_network)
        else {
            return (agent.bw_in, agent.bw_out);
        };
        let position = self.networks.position(network);
        let (Some(position), Some(entry)) = (position, self.networks.get(network)) else {
            return (agent.bw_in, agent.bw_out);
        };
        let used = self.network_usage(addresses)[position];
        let (own_in, own_out) = if agent.active {
            (u64::from(agent.bw_in), u64::from(agent.bw_out))
        } else {
            (0, 0)
        };
        let others_in = used.assigned_in.saturating_sub(own_in);
        let others_out = used.assigned_out.saturating_sub(own_out);
        (
            saturate(entry.total_quota_in.saturating_sub(others_in)),
            saturate(entry.total_quota_out.saturating_sub(others_out)),
        )
    }

    /// Take bandwidth from the largest assignments of every network that
    /// is over quota, for instance after another address was admitted
    fn enforce_quotas(&mut self, addresses: &mut AddressTable) {
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); self.networks.len()];
        for (index, agent) in self.agents.iter().enumerate() {
            if !agent.active {
                continue;
            }
            let position = agent
                .address_inuse
                .and_then(|id| addresses.get(id))
                .and_then(ril_network)
                .and_then(|network| self.networks.position(network));
            if let Some(position) = position {
                members[position].push(index);
            }
        }
        let quotas: Vec<(NetworkType, u64, u64)> = self
            .networks
            .iter()
            .map(|entry| (entry.network, entry.total_quota_in, entry.total_quota_out))
            .collect();

        for (indices, (network, quota_in, quota_out)) in members.iter().zip(quotas) {
            let current_in: Vec<u32> = indices.iter().map(|i| self.agents[*i].bw_in).collect();
            let current_out: Vec<u32> = indices.iter().map(|i| self.agents[*i].bw_out).collect();
            let fitted_in = fit_to_quota(&current_in, quota_in);
            let fitted_out = fit_to_quota(&current_out, quota_out);
            if fitted_in == current_in && fitted_out == current_out {
                continue;
            }
            debug!("Network `{}' is over quota, reducing its largest assignments", network);
            for (k, index) in indices.iter().enumerate() {
                if fitted_in[k] != current_in[k] || fitted_out[k] != current_out[k] {
                    let inuse = self.agents[*index].address_inuse;
                    let (bw_in, bw_out) = (fitted_in[k], fitted_out[k]);
                    self.set_active_suggestion(addresses, *index, inuse, bw_in, bw_out, false);
                }
            }
        }
    }

    /// Recount active addresses per network from the agents
    fn refresh_counts(&mut self, addresses: &AddressTable) {
        let counts: Vec<u32> = self
            .network_usage(addresses)
            .iter()
            .map(|usage| usage.active)
            .collect();
        self.networks.set_active_counts(&counts);
    }

    /// Feature vector of an agent: per network the assigned and available
    /// share of both quotas, then per address whether it is in use, its
    /// share of both quotas and its delay and distance
    fn state(&self, addresses: &AddressTable, agent: &Agent, usage: &[NetworkUsage]) -> Vec<f64> {
        let mut state = Vec::with_capacity(agent.m());
        for (entry, used) in self.networks.iter().zip(usage) {
            let free_in = entry.total_quota_in.saturating_sub(used.assigned_in);
            let free_out = entry.total_quota_out.saturating_sub(used.assigned_out);
            state.push(ratio(used.assigned_in, entry.total_quota_in));
            state.push(ratio(free_in, entry.total_quota_in));
            state.push(ratio(used.assigned_out, entry.total_quota_out));
            state.push(ratio(free_out, entry.total_quota_out));
        }

        for id in agent.addresses() {
            let Some(address) = addresses.get(*id) else {
                state.extend([0.0; FEATURES_PER_ADDRESS]);
                continue;
            };
            let in_use = agent.address_inuse == Some(*id);
            let quota = ril_network(address).and_then(|network| self.networks.get(network));
            let (quota_in, quota_out) =
                quota.map_or((0, 0), |entry| (entry.total_quota_in, entry.total_quota_out));
            let properties = self.callbacks.properties(*id, address);

            state.push(if in_use { 1.0 } else { 0.0 });
            state.push(if in_use { ratio(u64::from(agent.bw_in), quota_in) } else { 0.0 });
            state.push(if in_use { ratio(u64::from(agent.bw_out), quota_out) } else { 0.0 });
            state.push(properties[PropertyKind::Delay.index()]);
            state.push(properties[PropertyKind::Distance.index()]);
        }
        state
    }

    /// Report every change recorded during the current operation
    fn flush_notifications(&mut self, addresses: &AddressTable, scope: SolverScope) {
        let pending: Vec<AddressId> = self
            .agents
            .iter_mut()
            .filter_map(Agent::take_pending_notification)
            .collect();
        if pending.is_empty() {
            return;
        }
        self.callbacks.solver_info(SolverOperation::UpdateNotificationStart, scope);
        for id in pending {
            if let Some(address) = addresses.get(id) {
                self.callbacks.bandwidth_changed(id, address);
            }
        }
        self.callbacks.solver_info(SolverOperation::UpdateNotificationStop, scope);
    }

    /// Note that the environment changed so the next step comes early
    fn request_step(&mut self) {
        if self.bulk_lock > 0 {
            self.bulk_changes += 1;
        } else {
            self.timer.expedite(Instant::now());
        }
    }
}

fn ratio(value: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        value as f64 / total as f64
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Cut the largest assignments until their sum fits `quota`, never going
/// below [`MIN_BW`]
fn fit_to_quota(assigned: &[u32], quota: u64) -> Vec<u32> {
    let mut fitted = assigned.to_vec();
    let total: u64 = assigned.iter().map(|bw| u64::from(*bw)).sum();
    let mut excess = total.saturating_sub(quota);
    if excess == 0 {
        return fitted;
    }
    let mut order: Vec<usize> = (0..fitted.len()).collect();
    order.sort_by(|a, b| fitted[*b].cmp(&fitted[*a]));
    for k in order {
        let cut = u64::from(fitted[k].saturating_sub(MIN_BW)).min(excess);
        fitted[k] -= saturate(cut);
        excess -= cut;
        if excess == 0 {
            break;
        }
    }
    if excess > 0 {
        error!("Minimum bandwidth of all active addresses exceeds quota, should never happen");
    }
    fitted
}

impl<C: SolverCallbacks> Solver for RilSolver<C> {
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
            Some(SolverSlot::Ril(_)) => {
                debug!("Address {} is already known", id);
                return;
            }
            Some(SolverSlot::Proportional(_)) => {
                warn!("Address {} is managed by another solver", id);
                return;
            }
            None => {}
        }
        if !self.networks.contains(network) {
            error!(
                "Unknown network `{}' for new address {} of peer `{}'",
                network, id, address.peer
            );
            return;
        }
        let peer = address.peer;
        address.solver_information = Some(SolverSlot::Ril(RilSlot { network }));
        self.networks.increment(network, true, false);

        if !self.networks.is_bandwidth_available(network) {
            debug!(
                "Did not add address {} for peer `{}', network `{}' does not have enough bandwidth",
                id, peer, network
            );
            return;
        }

        let index = self.agent_index_or_create(peer);
        self.agents[index].add_address(id);
        self.try_unblock(addresses, index, false);
        self.enforce_quotas(addresses);
        debug!("Added address {} for peer `{}' in network `{}'", id, peer, network);

        self.request_step();
        self.flush_notifications(addresses, SolverScope::Single);
    }

    fn address_delete(&mut self, addresses: &mut AddressTable, id: AddressId, session_only: bool) {
        let Some(address) = addresses.get(id) else {
            warn!("Cannot delete unknown address {}", id);
            return;
        };
        let Some(network) = ril_network(address) else {
            warn!("Address {} is not managed by the RL solver", id);
            return;
        };
        let peer = address.peer;

        if session_only {
            debug!(
                "Session of address {} for peer `{}' ended, address stays a candidate",
                id, peer
            );
            return;
        }
        debug!("Deleting address {} for peer `{}'", id, peer);
        self.networks.decrement(network, true, false);
        if let Some(address) = addresses.get_mut(id) {
            address.solver_information = None;
        }

        let Some(index) = self.agent_index(&peer) else {
            debug!("No agent for peer `{}', address was never admitted", peer);
            return;
        };
        let was_used = self.agents[index].address_inuse == Some(id);
        if self.agents[index].remove_address(id).is_none() {
            debug!("Address {} was not considered by the agent of peer `{}'", id, peer);
            return;
        }

        if was_used {
            self.set_active_suggestion(addresses, index, None, 0, 0, true);
            match self.first_available(addresses, index) {
                Some(next) => {
                    self.set_active_suggestion(addresses, index, Some(next), MIN_BW, MIN_BW, false);
                    self.enforce_quotas(addresses);
                }
                None => {
                    if self.agents[index].active {
                        info!("Disconnecting peer `{}' after deleting address {}", peer, id);
                        self.agents[index].set_pending_notification(id);
                    }
                }
            }
        }

        self.request_step();
        self.flush_notifications(addresses, SolverScope::Single);
    }

    fn address_property_changed(
        &mut self,
        addresses: &mut AddressTable,
        id: AddressId,
        kind: PropertyKind,
        abs_value: u32,
        rel_value: f64,
    ) {
        let Some(address) = addresses.get(id) else {
            warn!("Unknown address {}", id);
            return;
        };
        debug!(
            "Property `{}' for peer `{}' address {} changed to {} ({:.2})",
            kind, address.peer, id, abs_value, rel_value
        );
        self.request_step();
    }

    fn address_session_changed(
        &mut self,
        _addresses: &mut AddressTable,
        id: AddressId,
        cur_session: u32,
        new_session: u32,
    ) {
        debug!("Session of address {} changed from {} to {}", id, cur_session, new_session);
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
            if in_use { "used" } else { "unused" }
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
        let Some(address) = addresses.get(id) else {
            warn!("Unknown address {}", id);
            return;
        };
        let Some(old_network) = ril_network(address) else {
            warn!("Address {} is not managed by the RL solver", id);
            return;
        };
        let peer = address.peer;
        debug!(
            "Network type changed, moving {} address of peer `{}' from `{}' to `{}'",
            if address.active { "active" } else { "inactive" },
            peer,
            old_network,
            new_network
        );

        if !self.networks.contains(new_network) {
            error!("Invalid network type `{}' for address {}: disconnect", new_network, id);
            let in_use = self
                .agent(&peer)
                .map_or(false, |agent| agent.active && agent.address_inuse == Some(id));
            self.address_delete(addresses, id, false);
            // the delete only reports `id` when the peer was left without an address
            let reported = in_use
                && self
                    .agent(&peer)
                    .map_or(false, |agent| agent.address_inuse.is_none());
            if !reported {
                if let Some(address) = addresses.get(id) {
                    self.callbacks.bandwidth_changed(id, address);
                }
            }
            return;
        }

        let admitted = self.agent(&peer).map_or(false, |agent| agent.contains(id));
        if admitted && self.networks.is_bandwidth_available(new_network) {
            if let Some(address) = addresses.get_mut(id) {
                address.solver_information = Some(SolverSlot::Ril(RilSlot {
                    network: new_network,
                }));
            }
            self.networks.decrement(old_network, true, false);
            self.networks.increment(new_network, true, false);
            self.refresh_counts(addresses);
            self.enforce_quotas(addresses);
            self.request_step();
            self.flush_notifications(addresses, SolverScope::Single);
        } else {
            self.address_delete(addresses, id, false);
            self.address_add(addresses, id, new_network);
        }
    }

    fn address_change_preference(
        &mut self,
        _addresses: &mut AddressTable,
        peer: &PeerId,
        kind: PreferenceKind,
        pref_rel: f64,
    ) {
        debug!("Preference `{}' for peer `{}' changed to {:.2}", kind, peer, pref_rel);
        self.request_step();
    }

    fn get_preferred_address(
        &mut self,
        addresses: &mut AddressTable,
        peer: &PeerId,
    ) -> Option<AddressId> {
        let index = self.agent_index_or_create(*peer);
        let agent = &mut self.agents[index];
        let was_active = agent.active;
        agent.active = true;
        let (inuse, bw_in, bw_out) = (agent.address_inuse, agent.bw_in, agent.bw_out);
        if let Some(id) = inuse {
            // an agent that was paused is not counted yet
            let admissible = was_active
                || addresses
                    .get(id)
                    .and_then(ril_network)
                    .map_or(false, |network| self.networks.is_bandwidth_available(network));
            if admissible {
                self.set_active_suggestion(addresses, index, inuse, bw_in, bw_out, true);
            } else {
                debug!("No bandwidth left to activate address {} for peer `{}'", id, peer);
                self.set_active_suggestion(addresses, index, None, 0, 0, true);
            }
        }
        self.try_unblock(addresses, index, true);
        self.enforce_quotas(addresses);
        self.refresh_counts(addresses);
        self.flush_notifications(addresses, SolverScope::Single);

        let chosen = self.agents[index].address_inuse;
        match chosen {
            Some(id) => debug!("Activated agent for peer `{}' with address {}", peer, id),
            None => debug!("Activated agent for peer `{}', but no address available", peer),
        }
        chosen
    }

    fn stop_get_preferred_address(&mut self, addresses: &mut AddressTable, peer: &PeerId) {
        let Some(index) = self.agent_index(peer) else {
            warn!("Peer `{}' never requested an address", peer);
            return;
        };
        if !self.agents[index].active {
            warn!("Agent for peer `{}' is not active", peer);
            return;
        }
        let agent = &mut self.agents[index];
        agent.active = false;
        let (inuse, bw_in, bw_out) = (agent.address_inuse, agent.bw_in, agent.bw_out);
        if inuse.is_some() {
            self.set_active_suggestion(addresses, index, inuse, bw_in, bw_out, true);
        }
        self.refresh_counts(addresses);
        self.request_step();
        debug!("Paused agent for peer `{}'", peer);
    }

    fn bulk_start(&mut self) {
        self.bulk_lock += 1;
        debug!("Bulk lock: {}", self.bulk_lock);
    }

    fn bulk_stop(&mut self, addresses: &mut AddressTable) {
        if self.bulk_lock == 0 {
            warn!("Bulk unlock without matching lock");
            return;
        }
        self.bulk_lock -= 1;
        debug!("Bulk lock: {}", self.bulk_lock);
        if self.bulk_lock == 0 && self.bulk_changes > 0 {
            self.bulk_changes = 0;
            self.step(addresses);
        }
    }

    fn done(&mut self, addresses: &mut AddressTable) {
        self.timer.cancel();
        if self.networks.total_addresses() > 0 {
            warn!(
                "Shutting down with {} addresses still registered",
                self.networks.total_addresses()
            );
        }
        let managed: Vec<AddressId> = addresses
            .iter()
            .filter(|(_, address)| matches!(address.solver_information, Some(SolverSlot::Ril(_))))
            .map(|(id, _)| id)
            .collect();
        for id in managed {
            if let Some(address) = addresses.get_mut(id) {
                address.solver_information = None;
            }
        }
        self.agents.clear();
        self.shut_down = true;
        info!("RL solver shut down after {} steps", self.step_count);
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::types::PROPERTY_COUNT;
    use rand::RngCore;

    #[derive(Default)]
    struct Recorder {
        changes: Vec<(AddressId, bool, u32, u32)>,
    }

    impl SolverCallbacks for Recorder {
        fn bandwidth_changed(&mut self, id: AddressId, address: &Address) {
            self.changes
                .push((id, address.active, address.assigned_bw_in, address.assigned_bw_out));
        }

        fn preferences(&self, _peer: &PeerId) -> Option<[f64; 2]> {
            None
        }

        fn properties(&self, _id: AddressId, _address: &Address) -> [f64; PROPERTY_COUNT] {
            [1.0, 1.0]
        }
    }

    struct FixedReward(f64);

    impl RewardFunction for FixedReward {
        fn reward(&mut self, _peer: &PeerId, _state: &[f64], _rng: &mut dyn RngCore) -> f64 {
            self.0
        }
    }

    fn solver(algorithm: RilAlgorithm) -> RilSolver<Recorder> {
        tuned(algorithm, RilConfig::default().explore_ratio)
    }

    fn tuned(algorithm: RilAlgorithm, explore_ratio: f64) -> RilSolver<Recorder> {
        let params = RilConfig {
            algorithm,
            explore_ratio,
            ..RilConfig::default()
        };
        RilSolver::new(
            Recorder::default(),
            &[NetworkType::Lan, NetworkType::Wan],
            &[1_000_000, 100_000],
            &[1_000_000, 100_000],
            params,
        )
        .unwrap()
        .with_seed(42)
    }

    fn add(
        table: &mut AddressTable,
        solver: &mut RilSolver<Recorder>,
        peer: u64,
        addr: &str,
        net: NetworkType,
    ) -> AddressId {
        let id = table.insert(Address::new(PeerId::from_index(peer), "tcp", addr.as_bytes(), 0));
        solver.address_add(table, id, net);
        id
    }

    #[test]
    fn test_add_resizes_agent() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        add(&mut table, &mut solver, 1, "b", NetworkType::Wan);

        let agent = solver.agent(&PeerId::from_index(1)).unwrap();
        assert_eq!(agent.n(), 11);
        assert_eq!(agent.m(), 18);
        // Inactive agents pick an address but nobody is told
        assert!(agent.address_inuse.is_some());
        assert!(solver.callbacks().changes.is_empty());
    }

    #[test]
    fn test_get_preferred_is_silent_and_idempotent() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        let a = add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        let peer = PeerId::from_index(1);

        assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(a));
        assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(a));
        assert!(solver.callbacks().changes.is_empty());

        let address = table.get(a).unwrap();
        assert!(address.active);
        assert_eq!(address.assigned_bw_in, MIN_BW);
        assert_eq!(solver.quotas().get(NetworkType::Lan).unwrap().active_addresses, 1);
    }

    #[test]
    fn test_delete_used_address_switches_or_disconnects() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::Sarsa);
        let a = add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        let b = add(&mut table, &mut solver, 1, "b", NetworkType::Lan);
        let peer = PeerId::from_index(1);
        assert_eq!(solver.get_preferred_address(&mut table, &peer), Some(a));

        solver.address_delete(&mut table, a, false);
        table.remove(a);
        assert_eq!(solver.agent(&peer).unwrap().address_inuse, Some(b));
        assert_eq!(solver.callbacks().changes, vec![(b, true, MIN_BW, MIN_BW)]);

        solver.address_delete(&mut table, b, false);
        assert_eq!(solver.callbacks().changes.len(), 2);
        assert_eq!(solver.callbacks().changes[1], (b, false, 0, 0));
        assert_eq!(solver.agent(&peer).unwrap().n(), 9);
        assert_eq!(solver.quotas().active_addresses(), 0);
    }

    #[test]
    fn test_session_delete_keeps_candidate() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        let a = add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        solver.address_delete(&mut table, a, true);

        assert!(solver.agent(&PeerId::from_index(1)).unwrap().contains(a));
    }

    #[test]
    fn test_steps_only_active_agents() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        add(&mut table, &mut solver, 2, "b", NetworkType::Lan);
        solver.get_preferred_address(&mut table, &PeerId::from_index(1));

        for _ in 0..20 {
            solver.step(&mut table);
        }
        assert_eq!(solver.step_count(), 20);
        assert_eq!(solver.agent(&PeerId::from_index(1)).unwrap().step_count, 20);
        assert_eq!(solver.agent(&PeerId::from_index(2)).unwrap().step_count, 0);

        let agent = solver.agent(&PeerId::from_index(1)).unwrap();
        assert!(agent.bw_in >= MIN_BW && agent.bw_out >= MIN_BW);
        assert!(agent.weights().rows() == agent.n() && agent.weights().cols() == agent.m());
    }

    #[test]
    fn test_bulk_defers_step() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::Sarsa);
        add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        solver.get_preferred_address(&mut table, &PeerId::from_index(1));

        solver.bulk_start();
        solver.step(&mut table);
        solver.step(&mut table);
        assert_eq!(solver.step_count(), 0);
        solver.bulk_stop(&mut table);
        assert_eq!(solver.step_count(), 1);
    }

    #[test]
    fn test_poll_waits_for_interval() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        let start = Instant::now();
        solver.poll(&mut table, start);
        assert_eq!(solver.step_count(), 0);
        solver.poll(&mut table, start + solver.step_interval() * 2);
        assert_eq!(solver.step_count(), 1);
    }

    #[test]
    fn test_stop_pauses_agent_keeps_weights() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        let a = add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        let peer = PeerId::from_index(1);
        solver.get_preferred_address(&mut table, &peer);
        solver.agent_mut(&peer).unwrap().weights_mut().set(0, 0, 3.5);

        solver.stop_get_preferred_address(&mut table, &peer);
        let agent = solver.agent(&peer).unwrap();
        assert!(!agent.active);
        assert_eq!(agent.weights().get(0, 0), Some(3.5));
        assert!(!table.get(a).unwrap().active);
        assert_eq!(solver.quotas().active_addresses(), 0);
    }

    #[test]
    fn test_change_network_keeps_agent_dimensions() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        let a = add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        solver.address_change_network(&mut table, a, NetworkType::Lan, NetworkType::Wan);

        let agent = solver.agent(&PeerId::from_index(1)).unwrap();
        assert_eq!((agent.n(), agent.m()), (10, 13));
        assert_eq!(
            table.get(a).unwrap().solver_information,
            Some(SolverSlot::Ril(RilSlot { network: NetworkType::Wan }))
        );
        assert_eq!(solver.quotas().get(NetworkType::Wan).unwrap().total_addresses, 1);
    }

    #[test]
    fn test_done_cancels_and_clears() {
        let mut table = AddressTable::new();
        let mut solver = solver(RilAlgorithm::QLearning);
        let a = add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        solver.done(&mut table);

        assert!(solver.is_shut_down());
        assert!(solver.agents().is_empty());
        assert!(table.get(a).unwrap().solver_information.is_none());
        solver.poll(&mut table, Instant::now() + Duration::from_secs(60));
        assert_eq!(solver.step_count(), 0);
    }

    #[test]
    fn test_q_learning_exploration_resets_trace() {
        let mut table = AddressTable::new();
        let mut solver = tuned(RilAlgorithm::QLearning, 1.0);
        add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        let peer = PeerId::from_index(1);
        solver.get_preferred_address(&mut table, &peer);

        for _ in 0..5 {
            solver.step(&mut table);
            // nothing but the latest state survives an exploratory step
            let agent = solver.agent(&peer).unwrap();
            assert_eq!(agent.eligibility(), agent.last_state());
        }
    }

    #[test]
    fn test_greedy_step_decays_trace() {
        for algorithm in [RilAlgorithm::QLearning, RilAlgorithm::Sarsa] {
            let mut table = AddressTable::new();
            let mut solver = tuned(algorithm, 0.0);
            add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
            let peer = PeerId::from_index(1);
            solver.get_preferred_address(&mut table, &peer);
            let decay = solver.params().discount_factor * solver.params().trace_decay;

            solver.step(&mut table);
            let agent = solver.agent(&peer).unwrap();
            assert_eq!(agent.eligibility(), agent.last_state());
            let previous = agent.eligibility().to_vec();

            solver.step(&mut table);
            let agent = solver.agent(&peer).unwrap();
            for ((trace, old), state) in agent
                .eligibility()
                .iter()
                .zip(&previous)
                .zip(agent.last_state())
            {
                assert!((trace - (old * decay + state)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_sarsa_update_uses_trace_before_decay() {
        let mut table = AddressTable::new();
        let mut solver = tuned(RilAlgorithm::Sarsa, 0.0).with_reward(Box::new(FixedReward(1.0)));
        add(&mut table, &mut solver, 1, "a", NetworkType::Lan);
        let peer = PeerId::from_index(1);
        solver.get_preferred_address(&mut table, &peer);
        let alpha = solver.params().gradient_step_size;

        solver.step(&mut table);
        let agent = solver.agent(&peer).unwrap();
        let first_action = agent.last_action().unwrap();
        let trace = agent.eligibility().to_vec();

        // all weights are zero, so the error is the reward alone
        solver.step(&mut table);
        let row = solver.agent(&peer).unwrap().weights().row(first_action).unwrap().to_vec();
        for (weight, trace) in row.iter().zip(&trace) {
            assert!((weight - alpha * trace).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bandwidth_actions_stay_under_quota() {
        let mut table = AddressTable::new();
        let mut solver = tuned(RilAlgorithm::QLearning, 1.0);
        let a = add(&mut table, &mut solver, 1, "a", NetworkType::Wan);
        solver.get_preferred_address(&mut table, &PeerId::from_index(1));

        for _ in 0..300 {
            solver.step(&mut table);
            let address = table.get(a).unwrap();
            assert!(address.assigned_bw_in <= 100_000 && address.assigned_bw_out <= 100_000);
            assert!(address.assigned_bw_in >= MIN_BW && address.assigned_bw_out >= MIN_BW);
        }
    }

    #[test]
    fn test_fit_to_quota_cuts_largest_first() {
        assert_eq!(fit_to_quota(&[4096, 1024], 4096), vec![3072, 1024]);
        assert_eq!(fit_to_quota(&[3000, 2000, 1024], 5000), vec![1976, 2000, 1024]);
        assert_eq!(fit_to_quota(&[2048, 2048], 8192), vec![2048, 2048]);
    }
}

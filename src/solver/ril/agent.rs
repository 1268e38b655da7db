//! Per-peer learning agent.
//!
//! An agent approximates the action value of its peer with one weight row
//! per action over a feature vector of `4 × networks + 5 × addresses`
//! entries. The first [`META_ACTION_COUNT`] actions adjust bandwidth; each
//! address the agent knows adds one "switch to this address" action and
//! five features. Adding or removing an address resizes the weights, the
//! eligibility trace and the stored state in lock-step.

use log::{debug, error};

use super::matrix::{insert_zeros, remove_range, WeightMatrix};
use crate::address::AddressId;
use crate::types::PeerId;

/// Number of fixed bandwidth actions
pub const META_ACTION_COUNT: usize = 9;

/// Features contributed by every network class
pub const FEATURES_PER_NETWORK: usize = 4;

/// Features contributed by every address of the peer
pub const FEATURES_PER_ADDRESS: usize = 5;

/// Action an agent can take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    BwInDouble,
    BwInHalve,
    BwInIncrement,
    BwInDecrement,
    BwOutDouble,
    BwOutHalve,
    BwOutIncrement,
    BwOutDecrement,
    /// Use the k-th address of the agent
    SwitchTo(usize),
}

impl Action {
    pub fn from_index(index: usize) -> Action {
        match index {
            0 => Action::Nothing,
            1 => Action::BwInDouble,
            2 => Action::BwInHalve,
            3 => Action::BwInIncrement,
            4 => Action::BwInDecrement,
            5 => Action::BwOutDouble,
            6 => Action::BwOutHalve,
            7 => Action::BwOutIncrement,
            8 => Action::BwOutDecrement,
            k => Action::SwitchTo(k - META_ACTION_COUNT),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Action::Nothing => 0,
            Action::BwInDouble => 1,
            Action::BwInHalve => 2,
            Action::BwInIncrement => 3,
            Action::BwInDecrement => 4,
            Action::BwOutDouble => 5,
            Action::BwOutHalve => 6,
            Action::BwOutIncrement => 7,
            Action::BwOutDecrement => 8,
            Action::SwitchTo(k) => META_ACTION_COUNT + k,
        }
    }
}

/// Learning agent of one peer
#[derive(Debug, Clone)]
pub struct Agent {
    pub peer: PeerId,
    /// Whether somebody asked for suggestions for this peer
    pub active: bool,
    pub step_count: u64,
    /// Address currently chosen for the peer
    pub address_inuse: Option<AddressId>,
    pub bw_in: u32,
    pub bw_out: u32,
    network_count: usize,
    w: WeightMatrix,
    e: Vec<f64>,
    s_old: Vec<f64>,
    a_old: Option<usize>,
    /// Candidate addresses; position k is action `META_ACTION_COUNT + k`
    addresses: Vec<AddressId>,
    /// Address to report once the current operation finishes
    pending_notification: Option<AddressId>,
}

impl Agent {
    pub fn new(peer: PeerId, network_count: usize, initial_bw: u32) -> Self {
        let m = FEATURES_PER_NETWORK * network_count;
        Agent {
            peer,
            active: false,
            step_count: 0,
            address_inuse: None,
            bw_in: initial_bw,
            bw_out: initial_bw,
            network_count,
            w: WeightMatrix::zeros(META_ACTION_COUNT, m),
            e: vec![0.0; m],
            s_old: vec![0.0; m],
            a_old: None,
            addresses: Vec::new(),
            pending_notification: None,
        }
    }

    /// Number of actions
    pub fn n(&self) -> usize {
        self.w.rows()
    }

    /// Number of features
    pub fn m(&self) -> usize {
        self.w.cols()
    }

    pub fn weights(&self) -> &WeightMatrix {
        &self.w
    }

    pub fn weights_mut(&mut self) -> &mut WeightMatrix {
        &mut self.w
    }

    pub fn eligibility(&self) -> &[f64] {
        &self.e
    }

    pub fn last_state(&self) -> &[f64] {
        &self.s_old
    }

    pub fn last_action(&self) -> Option<usize> {
        self.a_old
    }

    pub fn addresses(&self) -> &[AddressId] {
        &self.addresses
    }

    pub fn contains(&self, id: AddressId) -> bool {
        self.addresses.contains(&id)
    }

    /// Switch action that selects `id`
    pub fn action_for(&self, id: AddressId) -> Option<usize> {
        self.addresses
            .iter()
            .position(|other| *other == id)
            .map(|k| META_ACTION_COUNT + k)
    }

    /// Address selected by a switch action
    pub fn address_for(&self, action: usize) -> Option<AddressId> {
        action
            .checked_sub(META_ACTION_COUNT)
            .and_then(|k| self.addresses.get(k))
            .copied()
    }

    fn address_block_start(&self, k: usize) -> usize {
        FEATURES_PER_NETWORK * self.network_count + FEATURES_PER_ADDRESS * k
    }

    /// Append an address: one new action row and five new feature columns,
    /// all zero. Returns `false` if the address is already known.
    pub fn add_address(&mut self, id: AddressId) -> bool {
        if self.contains(id) {
            return false;
        }
        let at = self.address_block_start(self.addresses.len());
        self.addresses.push(id);

        self.w.insert_cols(at, FEATURES_PER_ADDRESS);
        self.w.insert_row(self.w.rows());
        insert_zeros(&mut self.e, at, FEATURES_PER_ADDRESS);
        insert_zeros(&mut self.s_old, at, FEATURES_PER_ADDRESS);

        debug!(
            "Agent for peer `{}' grew to {} actions and {} features",
            self.peer,
            self.n(),
            self.m()
        );
        true
    }

    /// Remove an address together with its action row and feature block.
    ///
    /// Returns the list position the address had. The last action is
    /// forgotten if it was the removed switch action and shifted down if it
    /// came after it.
    pub fn remove_address(&mut self, id: AddressId) -> Option<usize> {
        let k = self.addresses.iter().position(|other| *other == id)?;
        let action = META_ACTION_COUNT + k;
        let at = self.address_block_start(k);

        self.addresses.remove(k);
        if self.w.remove_row(action).is_none() || !self.w.remove_cols(at, FEATURES_PER_ADDRESS) {
            error!(
                "Weight matrix of peer `{}' out of step with its addresses, should never happen",
                self.peer
            );
        }
        remove_range(&mut self.e, at, FEATURES_PER_ADDRESS);
        remove_range(&mut self.s_old, at, FEATURES_PER_ADDRESS);

        self.a_old = match self.a_old {
            Some(old) if old == action => None,
            Some(old) if old > action => Some(old - 1),
            other => other,
        };
        if self.pending_notification == Some(id) {
            self.pending_notification = None;
        }

        debug!(
            "Agent for peer `{}' shrank to {} actions and {} features",
            self.peer,
            self.n(),
            self.m()
        );
        Some(k)
    }

    /// Estimated value of `action` in `state`
    pub fn estimate_q(&self, state: &[f64], action: usize) -> f64 {
        let q = self.w.dot_row(action, state);
        if q.is_nan() {
            error!("Action value of peer `{}' is NaN, should never happen", self.peer);
            return 0.0;
        }
        if q.is_infinite() {
            return q.signum() * f64::from(u32::MAX);
        }
        q
    }

    /// Greedy action; the lowest index wins ties
    pub fn best_action(&self, state: &[f64]) -> usize {
        let mut best = 0;
        let mut best_q = f64::MIN;
        for action in 0..self.n() {
            let q = self.estimate_q(state, action);
            if q > best_q {
                best_q = q;
                best = action;
            }
        }
        best
    }

    /// Temporal-difference update of the weights of the last action
    ///
    /// # Arguments
    /// * `reward` - Reward observed since the last action
    /// * `s_next` - Newly observed state
    /// * `a_target` - Action whose value is the bootstrap target
    /// * `alpha` - Gradient step size
    /// * `gamma` - Discount factor
    pub fn update_weights(
        &mut self,
        reward: f64,
        s_next: &[f64],
        a_target: usize,
        alpha: f64,
        gamma: f64,
    ) {
        let Some(a_old) = self.a_old else {
            return;
        };
        let q_old = self.estimate_q(&self.s_old, a_old);
        let q_next = self.estimate_q(s_next, a_target);
        let delta = reward + gamma * q_next - q_old;
        debug!(
            "Update step {} of peer `{}': Q(s,a) {:.3}, r {:.3}, Q(s',a') {:.3}, delta {:.3}",
            self.step_count, self.peer, q_old, reward, q_next, delta
        );

        let e = &self.e;
        if let Some(theta) = self.w.row_mut(a_old) {
            for (weight, trace) in theta.iter_mut().zip(e) {
                *weight += alpha * delta * trace;
            }
        }
    }

    /// Decay the eligibility trace by `factor`
    pub fn decay_eligibility(&mut self, factor: f64) {
        for trace in &mut self.e {
            *trace *= factor;
        }
    }

    /// Reset the eligibility trace after an exploratory action
    pub fn clear_eligibility(&mut self) {
        self.e.iter_mut().for_each(|trace| *trace = 0.0);
    }

    /// Accumulate the features of `state` into the eligibility trace
    pub fn accumulate_eligibility(&mut self, state: &[f64]) {
        for (trace, feature) in self.e.iter_mut().zip(state) {
            *trace += feature;
        }
    }

    /// Remember the state and action of the step that just ran
    pub fn finish_step(&mut self, state: Vec<f64>, action: usize) {
        self.s_old = state;
        self.a_old = Some(action);
        self.step_count += 1;
    }

    pub fn set_pending_notification(&mut self, id: AddressId) {
        self.pending_notification = Some(id);
    }

    pub fn take_pending_notification(&mut self) -> Option<AddressId> {
        self.pending_notification.take()
    }
}

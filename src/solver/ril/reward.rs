//! Reward signal for the learning agents.

use rand::{Rng, RngCore};

use crate::types::PeerId;

/// Source of the reward an agent receives for its last action
pub trait RewardFunction {
    /// Reward for `peer` after observing `state`
    fn reward(&mut self, peer: &PeerId, state: &[f64], rng: &mut dyn RngCore) -> f64;
}

/// Placeholder reward drawn uniformly from `[0, 1)`
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomReward;

impl RewardFunction for RandomReward {
    fn reward(&mut self, _peer: &PeerId, _state: &[f64], rng: &mut dyn RngCore) -> f64 {
        rng.gen::<f64>()
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::types::{NetworkType, MIN_BW};

/// Solver strategy
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Deterministic proportional-share distribution
    Proportional,
    /// Reinforcement learning agents
    Ril,
}

/// Learning algorithm of the RL solver
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum RilAlgorithm {
    /// On-policy TD control
    Sarsa,
    /// Off-policy TD control with Watkins' trace reset
    QLearning,
}

impl From<String> for RilAlgorithm {
    fn from(value: String) -> Self {
        // Anything but SARSA selects Q-learning
        if value.eq_ignore_ascii_case("SARSA") {
            RilAlgorithm::Sarsa
        } else {
            RilAlgorithm::QLearning
        }
    }
}

impl From<RilAlgorithm> for String {
    fn from(value: RilAlgorithm) -> Self {
        match value {
            RilAlgorithm::Sarsa => "SARSA".to_string(),
            RilAlgorithm::QLearning => "Q".to_string(),
        }
    }
}

/// Solver configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SolverConfig {
    #[serde(default = "default_solver")]
    pub solver: SolverKind,
    /// One entry per network class the solver manages
    pub quotas: Vec<QuotaConfig>,
    #[serde(default)]
    pub ril: RilConfig,
}

/// Aggregate quota of one network class, in bytes/s
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QuotaConfig {
    pub network: NetworkType,
    #[serde(rename = "in")]
    pub inbound: u64,
    #[serde(rename = "out")]
    pub outbound: u64,
}

/// Parameters of the RL solver
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RilConfig {
    /// Interval between two learning steps
    #[serde(with = "humantime_serde")]
    pub step_interval: Duration,
    pub algorithm: RilAlgorithm,
    /// Discount factor of future rewards (gamma)
    pub discount_factor: f64,
    /// Gradient descent step size (alpha)
    pub gradient_step_size: f64,
    /// Decay of the eligibility trace (lambda)
    pub trace_decay: f64,
    /// Probability of taking a random action
    pub explore_ratio: f64,
}

impl Default for RilConfig {
    fn default() -> Self {
        Self {
            step_interval: Duration::from_secs(3),
            algorithm: RilAlgorithm::QLearning,
            discount_factor: 0.5,
            gradient_step_size: 0.4,
            trace_decay: 0.6,
            explore_ratio: 0.1,
        }
    }
}

fn default_solver() -> SolverKind {
    SolverKind::Proportional
}

impl SolverConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.quotas.is_empty() {
            return Err(ValidationError::InvalidQuota(
                "at least one network quota is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for quota in &self.quotas {
            if !seen.insert(quota.network) {
                return Err(ValidationError::InvalidQuota(format!(
                    "network {} configured more than once",
                    quota.network
                )));
            }
            if quota.inbound < u64::from(MIN_BW) || quota.outbound < u64::from(MIN_BW) {
                return Err(ValidationError::InvalidQuota(format!(
                    "quota of network {} must be at least {} bytes/s in both directions",
                    quota.network, MIN_BW
                )));
            }
        }

        self.ril.validate()
    }

    /// Networks and quotas as parallel lists
    pub fn quota_lists(&self) -> (Vec<NetworkType>, Vec<u64>, Vec<u64>) {
        let networks = self.quotas.iter().map(|q| q.network).collect();
        let quota_in = self.quotas.iter().map(|q| q.inbound).collect();
        let quota_out = self.quotas.iter().map(|q| q.outbound).collect();
        (networks, quota_in, quota_out)
    }
}

impl RilConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.step_interval.is_zero() {
            return Err(ValidationError::InvalidRil(
                "step_interval must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("discount_factor", self.discount_factor),
            ("trace_decay", self.trace_decay),
            ("explore_ratio", self.explore_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::InvalidRil(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(self.gradient_step_size > 0.0) {
            return Err(ValidationError::InvalidRil(format!(
                "gradient_step_size must be positive, got {}",
                self.gradient_step_size
            )));
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid quota configuration: {0}")]
    InvalidQuota(String),
    #[error("Invalid RL configuration: {0}")]
    InvalidRil(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ril_defaults() {
        let ril = RilConfig::default();
        assert_eq!(ril.step_interval, Duration::from_secs(3));
        assert_eq!(ril.algorithm, RilAlgorithm::QLearning);
        assert_eq!(ril.discount_factor, 0.5);
        assert_eq!(ril.gradient_step_size, 0.4);
        assert_eq!(ril.trace_decay, 0.6);
        assert!(ril.validate().is_ok());
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(RilAlgorithm::from("SARSA".to_string()), RilAlgorithm::Sarsa);
        assert_eq!(RilAlgorithm::from("Q".to_string()), RilAlgorithm::QLearning);
        assert_eq!(RilAlgorithm::from("whatever".to_string()), RilAlgorithm::QLearning);
    }

    #[test]
    fn test_parse_minimal() {
        let yaml = r#"
quotas:
  - network: lan
    in: 100000
    out: 50000
"#;
        let config: SolverConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.solver, SolverKind::Proportional);
        assert_eq!(config.quotas[0].inbound, 100_000);
        assert_eq!(config.quotas[0].outbound, 50_000);
        assert_eq!(config.ril, RilConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_ril_section() {
        let yaml = r#"
solver: ril
quotas:
  - network: wan
    in: 65536
    out: 65536
ril:
  step_interval: 500ms
  algorithm: SARSA
  explore_ratio: 0.2
"#;
        let config: SolverConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.solver, SolverKind::Ril);
        assert_eq!(config.ril.step_interval, Duration::from_millis(500));
        assert_eq!(config.ril.algorithm, RilAlgorithm::Sarsa);
        assert_eq!(config.ril.explore_ratio, 0.2);
        assert_eq!(config.ril.discount_factor, 0.5);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = SolverConfig {
            solver: SolverKind::Proportional,
            quotas: vec![],
            ril: RilConfig::default(),
        };
        assert!(matches!(config.validate(), Err(ValidationError::InvalidQuota(_))));

        let lan = QuotaConfig { network: NetworkType::Lan, inbound: 100_000, outbound: 100_000 };
        config.quotas = vec![lan.clone(), lan.clone()];
        assert!(matches!(config.validate(), Err(ValidationError::InvalidQuota(_))));

        config.quotas = vec![QuotaConfig { outbound: 512, ..lan.clone() }];
        assert!(matches!(config.validate(), Err(ValidationError::InvalidQuota(_))));

        config.quotas = vec![lan];
        config.ril.trace_decay = 1.5;
        assert!(matches!(config.validate(), Err(ValidationError::InvalidRil(_))));

        config.ril = RilConfig { gradient_step_size: 0.0, ..RilConfig::default() };
        assert!(matches!(config.validate(), Err(ValidationError::InvalidRil(_))));

        config.ril = RilConfig { step_interval: Duration::ZERO, ..RilConfig::default() };
        assert!(matches!(config.validate(), Err(ValidationError::InvalidRil(_))));
    }
}

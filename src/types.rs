//! Shared identity types and constants.
//!
//! This file holds the small value types every solver speaks: peer
//! identities, network classes, preference and property kinds, and the
//! bandwidth constants both engines are built around.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Minimum bandwidth (bytes/s) guaranteed to every active address before
/// the remainder of a quota is distributed.
pub const MIN_BW: u32 = 1024;

/// Largest bandwidth value an address can be assigned.
pub const MAX_BANDWIDTH: u32 = u32::MAX;

/// Window after a suggestion during which an address is not suggested again.
pub const ATS_BLOCKING_DELTA: Duration = Duration::from_millis(100);

/// Weight used for a peer nobody expressed a preference for.
pub const DEFAULT_PREFERENCE: f64 = 1.0;

/// Number of preference kinds reported by the preference collaborator.
pub const PREFERENCE_KIND_COUNT: usize = 2;

/// Number of normalized quality properties reported per address.
pub const PROPERTY_COUNT: usize = 2;

/// Identity of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Build a peer identity from a small integer, used by experiments and tests
    pub fn from_index(index: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&index.to_be_bytes());
        PeerId(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, like a truncated public key
        for byte in &self.0[..4] {
            write!(f, "{:02X}", byte)?;
        }
        for byte in &self.0[4..8] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Traffic category an address belongs to. Each one has its own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Unspecified,
    Loopback,
    Lan,
    Wan,
    Wlan,
}

impl NetworkType {
    pub const ALL: [NetworkType; 5] = [
        NetworkType::Unspecified,
        NetworkType::Loopback,
        NetworkType::Lan,
        NetworkType::Wan,
        NetworkType::Wlan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Unspecified => "UNSPECIFIED",
            NetworkType::Loopback => "LOOPBACK",
            NetworkType::Lan => "LAN",
            NetworkType::Wan => "WAN",
            NetworkType::Wlan => "WLAN",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client can express a preference about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceKind {
    Bandwidth,
    Latency,
}

impl PreferenceKind {
    pub fn index(&self) -> usize {
        match self {
            PreferenceKind::Bandwidth => 0,
            PreferenceKind::Latency => 1,
        }
    }
}

impl fmt::Display for PreferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreferenceKind::Bandwidth => f.write_str("BANDWIDTH"),
            PreferenceKind::Latency => f.write_str("LATENCY"),
        }
    }
}

/// Quality properties the registry measures and normalizes per address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Delay,
    Distance,
}

impl PropertyKind {
    pub fn index(&self) -> usize {
        match self {
            PropertyKind::Delay => 0,
            PropertyKind::Distance => 1,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKind::Delay => f.write_str("DELAY"),
            PropertyKind::Distance => f.write_str("DISTANCE"),
        }
    }
}

/// Collapse a peer's preference vector into a single weight.
///
/// A missing vector counts as [`DEFAULT_PREFERENCE`]; otherwise the kinds are
/// summed and divided by their count.
pub fn preference_weight(preferences: Option<&[f64; PREFERENCE_KIND_COUNT]>) -> f64 {
    match preferences {
        None => DEFAULT_PREFERENCE,
        Some(values) => values.iter().sum::<f64>() / PREFERENCE_KIND_COUNT as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_index_is_distinct() {
        assert_ne!(PeerId::from_index(1), PeerId::from_index(2));
        assert_eq!(PeerId::from_index(7), PeerId::from_index(7));
        assert_eq!(PeerId::from_index(1).to_string(), "0000000000000001");
    }

    #[test]
    fn test_preference_weight() {
        assert_eq!(preference_weight(None), DEFAULT_PREFERENCE);
        assert_eq!(preference_weight(Some(&[1.0, 2.0])), 1.5);
        assert_eq!(preference_weight(Some(&[0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_network_type_yaml_names() {
        let net: NetworkType = serde_yaml::from_str("wlan").unwrap();
        assert_eq!(net, NetworkType::Wlan);
        assert_eq!(NetworkType::Lan.to_string(), "LAN");
    }
}

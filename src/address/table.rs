//! Address table.
//!
//! This file stores the address records the registry owns. Records live in
//! an arena and are referenced through generation-checked handles, so a
//! handle kept after its address was removed can never reach a different
//! address that later reuses the slot.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::solver::SolverSlot;
use crate::types::PeerId;

/// Handle to an address in an [`AddressTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressId {
    index: u32,
    generation: u32,
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// A candidate address for a peer
#[derive(Debug, Clone)]
pub struct Address {
    /// Peer this address belongs to
    pub peer: PeerId,
    /// Transport plugin name, e.g. "tcp"
    pub plugin: String,
    /// Raw address bytes; empty for inbound connections
    pub addr: Vec<u8>,
    /// Transport session id, 0 if none
    pub session_id: u32,
    /// Whether this is the address currently designated for the peer
    pub active: bool,
    /// Whether transport is actively using the address
    pub used: bool,
    /// Assigned inbound bandwidth (bytes/s)
    pub assigned_bw_in: u32,
    /// Assigned outbound bandwidth (bytes/s)
    pub assigned_bw_out: u32,
    /// End of the post-suggestion blocking window
    pub blocked_until: Option<Instant>,
    /// Private state of the solver managing this address
    pub solver_information: Option<SolverSlot>,
}

impl Address {
    pub fn new(peer: PeerId, plugin: &str, addr: &[u8], session_id: u32) -> Self {
        Address {
            peer,
            plugin: plugin.to_string(),
            addr: addr.to_vec(),
            session_id,
            active: false,
            used: false,
            assigned_bw_in: 0,
            assigned_bw_out: 0,
            blocked_until: None,
            solver_information: None,
        }
    }

    /// Inbound addresses carry no address bytes
    pub fn is_inbound(&self) -> bool {
        self.addr.is_empty()
    }

    /// Check whether the address is still inside its blocking window
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.map_or(false, |until| until > now)
    }

    /// Block the address from being suggested for [`crate::types::ATS_BLOCKING_DELTA`]
    pub fn block(&mut self, now: Instant) {
        self.blocked_until = Some(now + crate::types::ATS_BLOCKING_DELTA);
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Address>,
}

/// Arena of addresses with per-peer lookup
#[derive(Debug, Default)]
pub struct AddressTable {
    slots: Vec<Slot>,
    /// Free slot indices available for reuse
    free: Vec<u32>,
    /// Addresses per peer in insertion order
    by_peer: HashMap<PeerId, Vec<AddressId>>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an address and return its handle
    pub fn insert(&mut self, address: Address) -> AddressId {
        let peer = address.peer;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = Some(address);
                AddressId { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, entry: Some(address) });
                AddressId { index, generation: 0 }
            }
        };
        self.by_peer.entry(peer).or_default().push(id);
        id
    }

    /// Remove an address, returning the record if the handle was live
    pub fn remove(&mut self, id: AddressId) -> Option<Address> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let address = slot.entry.take()?;
        self.free.push(id.index);

        if let Some(ids) = self.by_peer.get_mut(&address.peer) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_peer.remove(&address.peer);
            }
        }
        Some(address)
    }

    pub fn get(&self, id: AddressId) -> Option<&Address> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: AddressId) -> Option<&mut Address> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn contains(&self, id: AddressId) -> bool {
        self.get(id).is_some()
    }

    /// Find an address by its identity (peer, plugin, bytes, session)
    pub fn find(
        &self,
        peer: &PeerId,
        plugin: &str,
        addr: &[u8],
        session_id: u32,
    ) -> Option<AddressId> {
        self.peer_addresses(peer).into_iter().find(|id| {
            self.get(*id).map_or(false, |a| {
                a.plugin == plugin && a.addr == addr && a.session_id == session_id
            })
        })
    }

    /// All addresses of a peer, in the order they were inserted
    pub fn peer_addresses(&self, peer: &PeerId) -> Vec<AddressId> {
        self.by_peer.get(peer).cloned().unwrap_or_default()
    }

    /// Peers with at least one address
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.by_peer.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over all live addresses
    pub fn iter(&self) -> impl Iterator<Item = (AddressId, &Address)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|address| {
                (AddressId { index: index as u32, generation: slot.generation }, address)
            })
        })
    }
}

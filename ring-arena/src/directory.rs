//! Local identity, neighbor table and known-peer cache

use std::net::IpAddr;
use std::sync::RwLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{PeerDescriptor, PeerId};

/// The four neighbor slots of a ring member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NeighborRole {
    Successor1,
    Successor2,
    Predecessor1,
    Predecessor2,
}

impl NeighborRole {
    pub const ALL: [NeighborRole; 4] = [
        NeighborRole::Successor1,
        NeighborRole::Successor2,
        NeighborRole::Predecessor1,
        NeighborRole::Predecessor2,
    ];

    fn index(self) -> usize {
        match self {
            NeighborRole::Successor1 => 0,
            NeighborRole::Successor2 => 1,
            NeighborRole::Predecessor1 => 2,
            NeighborRole::Predecessor2 => 3,
        }
    }
}

/// Role → descriptor mapping
///
/// `revision` counts mutations, so callers can tell whether an operation
/// touched the table at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborTable {
    slots: [Option<PeerDescriptor>; 4],
    revision: u64,
}

impl NeighborTable {
    pub fn get(&self, role: NeighborRole) -> Option<&PeerDescriptor> {
        self.slots[role.index()].as_ref()
    }

    /// Number of mutations applied so far
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Distinct neighbors, primary links first
    pub fn neighbors(&self) -> Vec<PeerDescriptor> {
        let mut out: Vec<PeerDescriptor> = Vec::with_capacity(4);
        for role in [
            NeighborRole::Successor1,
            NeighborRole::Predecessor1,
            NeighborRole::Successor2,
            NeighborRole::Predecessor2,
        ] {
            if let Some(peer) = self.get(role) {
                if !out.iter().any(|p| p.id == peer.id) {
                    out.push(peer.clone());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn set(&mut self, role: NeighborRole, peer: Option<PeerDescriptor>) {
        self.slots[role.index()] = peer;
    }
}

impl std::fmt::Display for NeighborTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |role| {
            self.get(role)
                .map(|p| p.id.to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        write!(
            f,
            "pred2={} pred1={} succ1={} succ2={}",
            show(NeighborRole::Predecessor2),
            show(NeighborRole::Predecessor1),
            show(NeighborRole::Successor1),
            show(NeighborRole::Successor2)
        )
    }
}

/// Holds the local identity and the neighbor table
///
/// The neighbor table has its own lock; the known-peer cache is a sharded map,
/// so lookups from the receiver loop never wait on ring mutations.
#[derive(Debug)]
pub struct PeerDirectory {
    local: PeerDescriptor,
    table: RwLock<NeighborTable>,
    known: DashMap<PeerId, PeerDescriptor>,
}

impl PeerDirectory {
    pub fn new(local: PeerDescriptor) -> Self {
        Self {
            local,
            table: RwLock::new(NeighborTable::default()),
            known: DashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local.id
    }

    /// Copy of the current table
    pub fn snapshot(&self) -> NeighborTable {
        match self.table.read() {
            Ok(table) => table.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn neighbor(&self, role: NeighborRole) -> Option<PeerDescriptor> {
        self.snapshot().get(role).cloned()
    }

    /// Addresses to flood to: every distinct neighbor address except our own
    pub fn neighbor_addresses(&self) -> Vec<IpAddr> {
        let mut out = Vec::new();
        for peer in self.snapshot().neighbors() {
            if peer.address != self.local.address && !out.contains(&peer.address) {
                out.push(peer.address);
            }
        }
        out
    }

    /// Apply a mutation to the table under its write lock
    ///
    /// The closure returns whether it changed anything; the revision is bumped
    /// once per changing call.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut TableEditor<'_>) -> R) -> R {
        let mut guard = match self.table.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut editor = TableEditor {
            table: &mut guard,
            changed: false,
        };
        let result = f(&mut editor);
        if editor.changed {
            guard.revision += 1;
        }
        result
    }

    /// Remember a descriptor learned from the network
    pub fn remember(&self, peer: &PeerDescriptor) {
        if peer.id != self.local.id {
            self.known.insert(peer.id.clone(), peer.clone());
        }
    }

    /// Look up a previously seen peer (neighbors included)
    pub fn find(&self, id: &PeerId) -> Option<PeerDescriptor> {
        if id == &self.local.id {
            return Some(self.local.clone());
        }
        if let Some(peer) = self.known.get(id) {
            return Some(peer.clone());
        }
        self.snapshot().neighbors().into_iter().find(|p| &p.id == id)
    }

    pub fn known_peers(&self) -> Vec<PeerDescriptor> {
        self.known.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Mutable view handed to `PeerDirectory::update`
pub(crate) struct TableEditor<'a> {
    table: &'a mut NeighborTable,
    changed: bool,
}

impl TableEditor<'_> {
    pub(crate) fn get(&self, role: NeighborRole) -> Option<&PeerDescriptor> {
        self.table.get(role)
    }

    pub(crate) fn set(&mut self, role: NeighborRole, peer: Option<PeerDescriptor>) {
        if self.table.get(role) != peer.as_ref() {
            self.table.set(role, peer);
            self.changed = true;
        }
    }
}

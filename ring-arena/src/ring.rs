//! Ring overlay: join, responsibility and neighbor-slot arbitration
//!
//! Peers are ordered on a ring by the lexicographic order of their ids. A node
//! is responsible for the ids in `(local, successor]`, wrapping past the end of
//! the id space when its successor sorts before it.
//!
//! Every RPC sent from here is best effort: failures are logged and the ring is
//! allowed to stay briefly inconsistent.

use std::sync::Arc;

use crate::broadcast::{BroadcastEngine, BroadcastId, BroadcastKind};
use crate::directory::{NeighborRole, PeerDirectory};
use crate::rpc::RpcGateway;
use crate::types::{PeerDescriptor, PeerId};

/// Whether `candidate` lies strictly between `from` and `to` going clockwise
fn strictly_between(from: &PeerId, candidate: &PeerId, to: &PeerId) -> bool {
    if from < to {
        from < candidate && candidate < to
    } else {
        candidate > from || candidate < to
    }
}

pub struct OverlayRing {
    directory: Arc<PeerDirectory>,
    gateway: Arc<RpcGateway>,
}

impl OverlayRing {
    pub fn new(directory: Arc<PeerDirectory>, gateway: Arc<RpcGateway>) -> Self {
        Self { directory, gateway }
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Flood a JOIN carrying our descriptor
    ///
    /// Nothing comes back directly; the responsible peer answers with
    /// neighbor notifications.
    pub async fn join(&self, broadcast: &BroadcastEngine) -> BroadcastId {
        let envelope = broadcast.envelope(BroadcastKind::Join);
        let id = envelope.id.clone();
        tracing::info!("Node '{}' joining the ring (broadcast '{}')", self.directory.local_id(), id);
        broadcast.send(envelope).await;
        id
    }

    /// Whether `candidate` falls in `(local, successor]`
    pub fn is_responsible_for(&self, candidate: &PeerId) -> bool {
        let local = self.directory.local_id();
        let Some(successor) = self.directory.neighbor(NeighborRole::Successor1) else {
            return true;
        };
        let successor = &successor.id;
        if local < successor {
            candidate > local && candidate <= successor
        } else {
            candidate > local || candidate <= successor
        }
    }

    /// Offer `candidate` a slot next to us
    ///
    /// The direction is picked from the display names: if ours sorts after the
    /// candidate's it is tried as predecessor, otherwise as successor. This is
    /// not the id order used by [`OverlayRing::is_responsible_for`].
    pub async fn assign_neighbor(&self, candidate: &PeerDescriptor) -> bool {
        self.directory.remember(candidate);
        if self.directory.local().name > candidate.name {
            self.try_replace_predecessor(candidate).await
        } else {
            self.try_replace_successor(candidate).await
        }
    }

    /// Adopt `candidate` as successor if the slot is empty or it is closer
    ///
    /// On change the old successor moves to the fallback slot and the candidate
    /// gets exactly one notification. Returns whether the table changed.
    pub async fn try_replace_successor(&self, candidate: &PeerDescriptor) -> bool {
        let local = self.directory.local().clone();
        if candidate.id == local.id {
            return false;
        }
        let replaced = self.directory.update(|table| match table.get(NeighborRole::Successor1).cloned() {
            None => {
                table.set(NeighborRole::Successor1, Some(candidate.clone()));
                true
            }
            Some(current) if current.id == candidate.id => false,
            Some(current) if strictly_between(&local.id, &candidate.id, &current.id) => {
                table.set(NeighborRole::Successor2, Some(current));
                table.set(NeighborRole::Successor1, Some(candidate.clone()));
                true
            }
            Some(_) => false,
        });
        if !replaced {
            tracing::debug!("Node '{}' kept its successor over '{}'", local.id, candidate.id);
            return false;
        }
        tracing::info!("Node '{}' new successor '{}'", local.id, candidate.id);
        let prev = self.directory.neighbor(NeighborRole::Predecessor1);
        if let Err(e) = self.gateway.notify_as_predecessor(candidate, local, prev).await {
            tracing::warn!("Node '{}' could not notify successor '{}': {}", self.directory.local_id(), candidate.id, e);
        }
        true
    }

    /// Adopt `candidate` as predecessor if the slot is empty or its id sorts
    /// before the current one
    pub async fn try_replace_predecessor(&self, candidate: &PeerDescriptor) -> bool {
        let local = self.directory.local().clone();
        if candidate.id == local.id {
            return false;
        }
        let replaced = self.directory.update(|table| match table.get(NeighborRole::Predecessor1).cloned() {
            None => {
                table.set(NeighborRole::Predecessor1, Some(candidate.clone()));
                true
            }
            Some(current) if candidate.id < current.id => {
                table.set(NeighborRole::Predecessor2, Some(current));
                table.set(NeighborRole::Predecessor1, Some(candidate.clone()));
                true
            }
            Some(_) => false,
        });
        if !replaced {
            tracing::debug!("Node '{}' kept its predecessor over '{}'", local.id, candidate.id);
            return false;
        }
        tracing::info!("Node '{}' new predecessor '{}'", local.id, candidate.id);
        let next = self.directory.neighbor(NeighborRole::Successor1);
        if let Err(e) = self.gateway.notify_as_successor(candidate, local, next).await {
            tracing::warn!("Node '{}' could not notify predecessor '{}': {}", self.directory.local_id(), candidate.id, e);
        }
        true
    }

    /// Inbound: `me` is now our successor, `next` (if any) the one after it
    pub fn on_notify_as_successor(&self, me: PeerDescriptor, next: Option<PeerDescriptor>) {
        self.adopt_link(NeighborRole::Successor1, NeighborRole::Successor2, me, next);
    }

    /// Inbound: `me` is now our predecessor, `prev` (if any) the one before it
    pub fn on_notify_as_predecessor(&self, me: PeerDescriptor, prev: Option<PeerDescriptor>) {
        self.adopt_link(NeighborRole::Predecessor1, NeighborRole::Predecessor2, me, prev);
    }

    fn adopt_link(
        &self,
        primary: NeighborRole,
        secondary: NeighborRole,
        me: PeerDescriptor,
        fallback: Option<PeerDescriptor>,
    ) {
        let local = self.directory.local_id().clone();
        if me.id == local {
            return;
        }
        self.directory.remember(&me);
        tracing::debug!("Node '{}' {:?} <- '{}'", local, primary, me.id);
        self.directory.update(|table| {
            table.set(primary, Some(me));
            if let Some(fallback) = fallback.filter(|p| p.id != local) {
                table.set(secondary, Some(fallback));
            }
        });
    }

    /// Link predecessor and successor to each other before going away
    ///
    /// Neighbors that cannot be reached are skipped.
    pub async fn leave(&self) {
        let table = self.directory.snapshot();
        let pred = table.get(NeighborRole::Predecessor1).cloned();
        let succ = table.get(NeighborRole::Successor1).cloned();
        if let (Some(pred), Some(succ)) = (&pred, &succ) {
            let next = table.get(NeighborRole::Successor2).cloned();
            if let Err(e) = self.gateway.notify_as_successor(pred, succ.clone(), next).await {
                tracing::debug!("Node '{}' leave: predecessor '{}' unreachable: {}", self.directory.local_id(), pred.id, e);
            }
            let prev = table.get(NeighborRole::Predecessor2).cloned();
            if let Err(e) = self.gateway.notify_as_predecessor(succ, pred.clone(), prev).await {
                tracing::debug!("Node '{}' leave: successor '{}' unreachable: {}", self.directory.local_id(), succ.id, e);
            }
        }
        self.directory.update(|table| {
            for role in NeighborRole::ALL {
                table.set(role, None);
            }
        });
        tracing::info!("Node '{}' left the ring", self.directory.local_id());
    }
}

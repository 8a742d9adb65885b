/// Shared state of a running node and its inbound dispatch
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::broadcast::{
    BroadcastEngine, BroadcastEnvelope, BroadcastId, BroadcastKind, BroadcastResponder, CancelReason,
    ResponderOutcome, PAYLOAD_GAME, PAYLOAD_TARGET,
};
use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::error::Result;
use crate::ring::OverlayRing;
use crate::rpc::{RpcGateway, RpcHandler, RpcRequest, RpcResponse};
use crate::session::{GameSummary, SessionManager};
use crate::stats::StatsTracker;
use crate::types::{GameId, PeerDescriptor, PeerId};

/// One reply collected for a discovery flood
#[derive(Debug, Clone)]
pub(crate) struct LookupAnswer {
    pub(crate) peer: PeerDescriptor,
    pub(crate) game: Option<GameSummary>,
}

/// Everything the background loops and the command tasks share
pub(crate) struct NodeContext {
    pub(crate) config: NodeConfig,
    pub(crate) directory: Arc<PeerDirectory>,
    pub(crate) gateway: Arc<RpcGateway>,
    pub(crate) ring: OverlayRing,
    pub(crate) broadcast: Arc<BroadcastEngine>,
    pub(crate) sessions: SessionManager,
    pub(crate) stats: Arc<StatsTracker>,
    /// Replies to discovery floods we originated and are still waiting on
    replies: DashMap<BroadcastId, Vec<LookupAnswer>>,
}

impl NodeContext {
    pub(crate) fn new(
        config: NodeConfig,
        directory: Arc<PeerDirectory>,
        gateway: Arc<RpcGateway>,
        broadcast: Arc<BroadcastEngine>,
        sessions: SessionManager,
        stats: Arc<StatsTracker>,
    ) -> Self {
        let ring = OverlayRing::new(directory.clone(), gateway.clone());
        Self {
            config,
            directory,
            gateway,
            ring,
            broadcast,
            sessions,
            stats,
            replies: DashMap::new(),
        }
    }

    fn local_id(&self) -> &PeerId {
        self.directory.local_id()
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    /// Find a peer by id: ourselves, then the flood
    pub(crate) async fn lookup_peer(&self, id: &PeerId) -> Option<PeerDescriptor> {
        if id == self.local_id() {
            return Some(self.directory.local().clone());
        }
        let envelope = self
            .broadcast
            .envelope(BroadcastKind::LookupPeer)
            .with_entry(PAYLOAD_TARGET, id.as_str());
        self.lookup(envelope).await.map(|answer| answer.peer)
    }

    /// Find the host advertising an open game
    pub(crate) async fn lookup_game(&self, game_id: &GameId) -> Option<GameSummary> {
        if let Some(game) = self.sessions.open_game(game_id) {
            return Some(game);
        }
        let envelope = self
            .broadcast
            .envelope(BroadcastKind::LookupGame)
            .with_entry(PAYLOAD_GAME, game_id.as_str());
        self.lookup(envelope).await.and_then(|answer| answer.game)
    }

    /// Flood `envelope` and wait for the first reply
    ///
    /// On expiry a TIMEOUT cancel notice is flooded so pending responders
    /// elsewhere stand down.
    async fn lookup(&self, envelope: BroadcastEnvelope) -> Option<LookupAnswer> {
        let id = envelope.id.clone();
        self.replies.insert(id.clone(), Vec::new());
        self.broadcast.send(envelope).await;

        let deadline = Instant::now() + Duration::from_millis(self.config.lookup_window_ms);
        let answer = loop {
            let first = self.replies.get(&id).and_then(|answers| answers.first().cloned());
            if first.is_some() || Instant::now() >= deadline {
                break first;
            }
            tokio::time::sleep(self.poll_interval()).await;
        };
        self.replies.remove(&id);

        if answer.is_none() {
            tracing::debug!("Node '{}' lookup '{}' timed out", self.local_id(), id);
            self.broadcast.cancel(&id, CancelReason::Timeout).await;
        }
        answer
    }

    /// Flood ASK_ONLINE and collect answers for the whole query window
    ///
    /// The flood is left to expire on its own; several peers are expected to answer.
    pub(crate) async fn online_peers(&self) -> Vec<PeerDescriptor> {
        let envelope = self.broadcast.envelope(BroadcastKind::AskOnline);
        let id = envelope.id.clone();
        self.replies.insert(id.clone(), Vec::new());
        self.broadcast.send(envelope).await;

        let deadline = Instant::now() + Duration::from_millis(self.config.online_query_window_ms);
        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval()).await;
        }

        let answers = self.replies.remove(&id).map(|(_, answers)| answers).unwrap_or_default();
        let mut peers: Vec<PeerDescriptor> = Vec::new();
        for answer in answers {
            if !peers.iter().any(|p| p.id == answer.peer.id) {
                peers.push(answer.peer);
            }
        }
        tracing::debug!("Node '{}' sees {} peers online", self.local_id(), peers.len());
        peers
    }

    fn on_lookup_reply(&self, broadcast_id: BroadcastId, kind: BroadcastKind, peer: PeerDescriptor, game: Option<GameSummary>) {
        self.directory.remember(&peer);
        match self.replies.get_mut(&broadcast_id) {
            Some(mut answers) => answers.push(LookupAnswer { peer, game }),
            None => tracing::trace!(
                "Node '{}' late {:?} reply from '{}' for '{}'",
                self.local_id(),
                kind,
                peer.id,
                broadcast_id
            ),
        }
    }

    /// Send our answer to the originator; a failed delivery is not a match
    async fn reply(
        &self,
        origin: &PeerDescriptor,
        envelope: &BroadcastEnvelope,
        game: Option<GameSummary>,
        outcome: ResponderOutcome,
    ) -> ResponderOutcome {
        match self
            .gateway
            .lookup_reply(origin, envelope.id.clone(), envelope.kind, game)
            .await
        {
            Ok(()) => outcome,
            Err(e) => {
                tracing::debug!("Node '{}' could not answer '{}': {}", self.local_id(), origin.id, e);
                ResponderOutcome::NoMatch
            }
        }
    }
}

impl RpcHandler for NodeContext {
    fn handle(&self, request: RpcRequest) -> BoxFuture<'_, Result<RpcResponse>> {
        Box::pin(async move {
            match request {
                RpcRequest::NotifyAsSuccessor { me, next_successor } => {
                    self.ring.on_notify_as_successor(me, next_successor);
                    Ok(RpcResponse::Ack)
                }
                RpcRequest::NotifyAsPredecessor { me, prev_predecessor } => {
                    self.ring.on_notify_as_predecessor(me, prev_predecessor);
                    Ok(RpcResponse::Ack)
                }
                RpcRequest::LookupReply {
                    broadcast_id,
                    kind,
                    peer,
                    game,
                } => {
                    self.on_lookup_reply(broadcast_id, kind, peer, game);
                    Ok(RpcResponse::Ack)
                }
                other => self.sessions.handle_rpc(other).await,
            }
        })
    }
}

impl BroadcastResponder for NodeContext {
    fn respond<'a>(&'a self, envelope: &'a BroadcastEnvelope) -> BoxFuture<'a, ResponderOutcome> {
        Box::pin(async move {
            let Some(origin) = envelope.origin() else {
                tracing::debug!("Node '{}' broadcast '{}' has no reply address", self.local_id(), envelope.id);
                return ResponderOutcome::NoMatch;
            };
            match envelope.kind {
                BroadcastKind::Join => {
                    if !self.ring.is_responsible_for(&origin.id) {
                        return ResponderOutcome::NoMatch;
                    }
                    self.ring.assign_neighbor(&origin).await;
                    ResponderOutcome::Claimed
                }
                BroadcastKind::LookupPeer => {
                    if envelope.entry(PAYLOAD_TARGET) != Some(self.local_id().as_str()) {
                        return ResponderOutcome::NoMatch;
                    }
                    self.reply(&origin, envelope, None, ResponderOutcome::Claimed).await
                }
                BroadcastKind::LookupGame => {
                    let game = envelope
                        .entry(PAYLOAD_GAME)
                        .and_then(|id| self.sessions.open_game(&GameId::from(id)));
                    match game {
                        Some(game) => self.reply(&origin, envelope, Some(game), ResponderOutcome::Claimed).await,
                        None => ResponderOutcome::NoMatch,
                    }
                }
                BroadcastKind::AskOnline => self.reply(&origin, envelope, None, ResponderOutcome::Answered).await,
            }
        })
    }
}

//! Outbound side of the RPC contract
//!
//! [`RpcGateway`] exposes one typed method per call of the contract. Callers
//! either await a call (it runs on the async runtime and never blocks the
//! interaction thread) or hand it to the bounded dispatch queue with
//! [`RpcGateway::dispatch`] when they do not care about the answer.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::message::{PauseReason, RpcRequest, RpcResponse};
use super::transport::RpcTransport;
use crate::broadcast::{BroadcastId, BroadcastKind};
use crate::error::{ArenaError, Result};
use crate::session::{GameRecord, GameSummary, Move, ScoreResult, SessionSnapshot, TimeBudgets};
use crate::types::{GameId, PeerDescriptor, PeerId};

struct RpcJob {
    target: PeerDescriptor,
    request: RpcRequest,
    reply: Option<oneshot::Sender<Result<RpcResponse>>>,
}

/// Typed client of the RPC contract with a bounded worker pool
pub struct RpcGateway {
    local: PeerDescriptor,
    transport: Arc<dyn RpcTransport>,
    queue: flume::Sender<RpcJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcGateway {
    /// Create the gateway and spawn `workers` tasks draining a queue of `capacity` jobs
    pub fn start(
        local: PeerDescriptor,
        transport: Arc<dyn RpcTransport>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (queue, jobs) = flume::bounded::<RpcJob>(capacity.max(1));
        let handles = (0..workers.max(1))
            .map(|_| {
                let jobs = jobs.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    while let Ok(job) = jobs.recv_async().await {
                        let name = job.request.name();
                        let result = transport.call(&job.target, job.request).await;
                        if let Err(e) = &result {
                            tracing::debug!("Dispatched '{}' to '{}' failed: {}", name, job.target.id, e);
                        }
                        if let Some(reply) = job.reply {
                            let _ = reply.send(result);
                        }
                    }
                })
            })
            .collect();
        Self {
            local,
            transport,
            queue,
            workers: Mutex::new(handles),
        }
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    /// Perform one call and wait for its response
    pub async fn call(&self, target: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse> {
        tracing::trace!("Node '{}' calling '{}' on '{}'", self.local.id, request.name(), target.id);
        self.transport.call(target, request).await
    }

    /// Queue a call and return a receiver for its result
    ///
    /// The queue is bounded: when it is full the call fails immediately.
    pub fn submit(&self, target: &PeerDescriptor, request: RpcRequest) -> Result<oneshot::Receiver<Result<RpcResponse>>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(target, request, Some(tx))?;
        Ok(rx)
    }

    /// Queue a call whose outcome nobody waits for; failures are only logged
    pub fn dispatch(&self, target: &PeerDescriptor, request: RpcRequest) {
        let name = request.name();
        if let Err(e) = self.enqueue(target, request, None) {
            tracing::warn!("Node '{}' dropped '{}' to '{}': {}", self.local.id, name, target.id, e);
        }
    }

    fn enqueue(
        &self,
        target: &PeerDescriptor,
        request: RpcRequest,
        reply: Option<oneshot::Sender<Result<RpcResponse>>>,
    ) -> Result<()> {
        self.queue
            .try_send(RpcJob {
                target: target.clone(),
                request,
                reply,
            })
            .map_err(|e| match e {
                flume::TrySendError::Full(_) => ArenaError::Transport("RPC queue full".to_string()),
                flume::TrySendError::Disconnected(_) => ArenaError::Internal("RPC workers stopped".to_string()),
            })
    }

    /// Stop the dispatch workers; queued jobs are discarded
    pub fn shutdown(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                handle.abort();
            }
        }
    }

    async fn call_ack(&self, target: &PeerDescriptor, request: RpcRequest) -> Result<()> {
        match self.call(target, request).await? {
            RpcResponse::Ack => Ok(()),
            RpcResponse::Rejected { reason } => Err(ArenaError::Rejected(reason)),
            other => Err(ArenaError::Protocol(format!("unexpected response {:?}", other))),
        }
    }

    pub async fn invite_to_game(&self, target: &PeerDescriptor, snapshot: SessionSnapshot) -> Result<()> {
        let request = RpcRequest::InviteToGame {
            from: self.local.clone(),
            snapshot,
        };
        self.call_ack(target, request).await
    }

    pub async fn cancel_invite(&self, target: &PeerDescriptor, game_id: GameId) -> Result<()> {
        let request = RpcRequest::CancelInvite {
            game_id,
            from: self.local.id.clone(),
        };
        self.call_ack(target, request).await
    }

    pub async fn decline_invite(&self, target: &PeerDescriptor, game_id: GameId) -> Result<()> {
        let request = RpcRequest::DeclineInvite {
            game_id,
            from: self.local.id.clone(),
        };
        self.call_ack(target, request).await
    }

    /// Accept an open invite; `Ok(())` means the host started the game
    pub async fn join_request(&self, host: &PeerDescriptor, game_id: GameId) -> Result<()> {
        let request = RpcRequest::JoinRequest {
            requester: self.local.clone(),
            game_id,
        };
        self.call_ack(host, request).await
    }

    pub async fn submit_move(&self, target: &PeerDescriptor, game_id: GameId, mv: Move, seq: u64) -> Result<()> {
        let request = RpcRequest::SubmitMove {
            game_id,
            from: self.local.id.clone(),
            mv,
            seq,
        };
        self.call_ack(target, request).await
    }

    pub async fn move_ack(&self, target: &PeerDescriptor, game_id: GameId, seq: u64) -> Result<()> {
        self.call_ack(target, RpcRequest::MoveAck { game_id, seq }).await
    }

    pub async fn reconnect_request(&self, target: &PeerDescriptor, game_id: GameId) -> Result<()> {
        let request = RpcRequest::ReconnectRequest {
            requester: self.local.clone(),
            game_id,
        };
        self.call_ack(target, request).await
    }

    pub async fn reconnect_offer(&self, target: &PeerDescriptor, snapshot: SessionSnapshot) -> Result<()> {
        let request = RpcRequest::ReconnectOffer {
            from: self.local.clone(),
            snapshot,
        };
        self.call_ack(target, request).await
    }

    /// Tell `target` that `me` is now its successor
    pub async fn notify_as_successor(
        &self,
        target: &PeerDescriptor,
        me: PeerDescriptor,
        next_successor: Option<PeerDescriptor>,
    ) -> Result<()> {
        let request = RpcRequest::NotifyAsSuccessor { me, next_successor };
        self.call_ack(target, request).await
    }

    /// Tell `target` that `me` is now its predecessor
    pub async fn notify_as_predecessor(
        &self,
        target: &PeerDescriptor,
        me: PeerDescriptor,
        prev_predecessor: Option<PeerDescriptor>,
    ) -> Result<()> {
        let request = RpcRequest::NotifyAsPredecessor { me, prev_predecessor };
        self.call_ack(target, request).await
    }

    pub async fn notify_game_paused(
        &self,
        target: &PeerDescriptor,
        game_id: GameId,
        who: PeerId,
        reason: PauseReason,
        budgets: TimeBudgets,
    ) -> Result<()> {
        let request = RpcRequest::NotifyGamePaused {
            game_id,
            who,
            reason,
            budgets,
        };
        self.call_ack(target, request).await
    }

    pub async fn send_score_result(&self, target: &PeerDescriptor, game_id: GameId, result: ScoreResult) -> Result<()> {
        self.call_ack(target, RpcRequest::SendScoreResult { game_id, result })
            .await
    }

    pub async fn send_chat_message(&self, target: &PeerDescriptor, game_id: GameId, text: String) -> Result<()> {
        let request = RpcRequest::SendChatMessage {
            game_id,
            sender: self.local.id.clone(),
            text,
        };
        self.call_ack(target, request).await
    }

    pub async fn get_game_history(&self, target: &PeerDescriptor, limit: usize) -> Result<Vec<GameRecord>> {
        match self.call(target, RpcRequest::GetGameHistory { limit }).await? {
            RpcResponse::History { records } => Ok(records),
            RpcResponse::Rejected { reason } => Err(ArenaError::Rejected(reason)),
            other => Err(ArenaError::Protocol(format!("unexpected response {:?}", other))),
        }
    }

    pub async fn lookup_reply(
        &self,
        target: &PeerDescriptor,
        broadcast_id: BroadcastId,
        kind: BroadcastKind,
        game: Option<GameSummary>,
    ) -> Result<()> {
        let request = RpcRequest::LookupReply {
            broadcast_id,
            kind,
            peer: self.local.clone(),
            game,
        };
        self.call_ack(target, request).await
    }
}

impl Drop for RpcGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

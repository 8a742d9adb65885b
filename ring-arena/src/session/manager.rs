//! Sessions of the local node and the session half of the RPC contract
//!
//! Each session sits behind its own mutex in a sharded map, so two games
//! never wait on each other. Locks are never held across an await: a call
//! first mutates the session, then talks to the network with what it copied out.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use super::collaborators::{AiEngine, AiMove, Collaborators, RuleEngine, RuleEngineFactory, ScoreResult, Storage};
use super::game::{GameRecord, GameSession, GameSummary, Move, SessionSnapshot, SessionState, TimeBudgets};
use crate::directory::PeerDirectory;
use crate::error::{ArenaError, Result};
use crate::rpc::{PauseReason, RpcGateway, RpcRequest, RpcResponse};
use crate::types::{GameId, PeerDescriptor, PeerId};

const HISTORY_KEY: &str = "history";
const MAX_HISTORY: usize = 500;

fn session_key(game_id: &GameId) -> String {
    format!("session-{}", game_id)
}

/// What happened to a session, as reported to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Invited {
        from: PeerDescriptor,
        snapshot: SessionSnapshot,
    },
    InviteCancelled {
        game_id: GameId,
    },
    InviteDeclined {
        game_id: GameId,
        by: PeerId,
    },
    Started {
        game_id: GameId,
    },
    MoveApplied {
        game_id: GameId,
        by: PeerId,
        mv: Move,
        seq: u64,
    },
    MoveAcked {
        game_id: GameId,
        seq: u64,
    },
    Paused {
        game_id: GameId,
        who: PeerId,
        reason: PauseReason,
    },
    Resumed {
        game_id: GameId,
        version: u64,
        adopted: bool,
        synchronized: bool,
    },
    Finished {
        game_id: GameId,
        winner: Option<PeerId>,
        score: Option<ScoreResult>,
    },
    Chat {
        game_id: GameId,
        sender: PeerId,
        text: String,
    },
}

struct SessionSlot {
    session: GameSession,
    rules: Box<dyn RuleEngine>,
    /// Reachable descriptor of the other player; `None` against the AI
    opponent: Option<PeerDescriptor>,
}

/// Outcome of an inbound move
enum Delivery {
    Duplicate,
    Refused(String),
    Applied {
        ended: bool,
        sender: Option<PeerDescriptor>,
    },
}

fn lock(slot: &Mutex<SessionSlot>) -> MutexGuard<'_, SessionSlot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct SessionManager {
    directory: Arc<PeerDirectory>,
    gateway: Arc<RpcGateway>,
    rules: RuleEngineFactory,
    ai: Option<Arc<dyn AiEngine>>,
    storage: Arc<dyn Storage>,
    events: flume::Sender<SessionEvent>,
    time_budget_ms: u64,
    sessions: DashMap<GameId, Arc<Mutex<SessionSlot>>>,
    history_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        directory: Arc<PeerDirectory>,
        gateway: Arc<RpcGateway>,
        collaborators: Collaborators,
        events: flume::Sender<SessionEvent>,
        time_budget_ms: u64,
    ) -> Self {
        Self {
            directory,
            gateway,
            rules: collaborators.rules,
            ai: collaborators.ai,
            storage: collaborators.storage,
            events,
            time_budget_ms,
            sessions: DashMap::new(),
            history_lock: Mutex::new(()),
        }
    }

    fn local_id(&self) -> &PeerId {
        self.directory.local_id()
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Node '{}' session event dropped, nobody listening", self.local_id());
        }
    }

    fn slot(&self, game_id: &GameId) -> Result<Arc<Mutex<SessionSlot>>> {
        self.sessions
            .get(game_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ArenaError::UnknownGame(game_id.to_string()))
    }

    /// Rule engine positioned after `moves`
    fn rules_for(&self, board_size: u8, moves: &[Move]) -> Box<dyn RuleEngine> {
        let mut rules = (self.rules)(board_size);
        for mv in moves.iter().filter(|m| !m.is_pass()) {
            rules.apply_move(mv.x, mv.y, mv.color, false);
        }
        rules
    }

    fn insert(&self, session: GameSession, opponent: Option<PeerDescriptor>) -> Arc<Mutex<SessionSlot>> {
        let rules = self.rules_for(session.board_size(), session.moves());
        let game_id = session.game_id().clone();
        let slot = Arc::new(Mutex::new(SessionSlot {
            session,
            rules,
            opponent,
        }));
        self.sessions.insert(game_id, slot.clone());
        slot
    }

    fn opponent_of(&self, slot: &SessionSlot) -> Option<PeerDescriptor> {
        if let Some(peer) = &slot.opponent {
            return Some(peer.clone());
        }
        let id = slot.session.opponent_of(self.local_id())?;
        if id.is_ai() {
            return None;
        }
        self.directory.find(id)
    }

    fn not_participant(&self, peer: &PeerId, game_id: &GameId) -> ArenaError {
        ArenaError::NotParticipant {
            peer: peer.to_string(),
            game: game_id.to_string(),
        }
    }

    pub fn snapshot(&self, game_id: &GameId) -> Option<SessionSnapshot> {
        let slot = self.slot(game_id).ok()?;
        let snapshot = lock(&slot).session.snapshot();
        Some(snapshot)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        slots.iter().map(|slot| lock(slot).session.snapshot()).collect()
    }

    pub fn is_synchronized(&self, game_id: &GameId) -> bool {
        match self.slot(game_id) {
            Ok(slot) => {
                let synchronized = lock(&slot).session.is_synchronized();
                synchronized
            }
            Err(_) => false,
        }
    }

    /// Summary of a live game hosted here, used to answer LOOKUP_GAME
    pub fn open_game(&self, game_id: &GameId) -> Option<GameSummary> {
        let slot = self.slot(game_id).ok()?;
        let s = lock(&slot);
        let hosted = s.session.host_id() == self.local_id() && !s.session.state().is_terminal();
        if !hosted {
            return None;
        }
        Some(GameSummary {
            game_id: game_id.clone(),
            host: self.directory.local().clone(),
            board_size: s.session.board_size(),
            komi: s.session.komi(),
            state: s.session.state(),
        })
    }

    /// Create a game hosted here and invite `opponent` to it
    pub async fn propose(&self, opponent: &PeerDescriptor, board_size: u8, komi: f32) -> Result<GameId> {
        let local = self.directory.local().clone();
        if opponent.id == local.id {
            return Err(ArenaError::Rejected("cannot invite yourself".to_string()));
        }
        let game_id = GameId::generate();
        let session = GameSession::new(
            game_id.clone(),
            local.id.clone(),
            local.id.clone(),
            opponent.id.clone(),
            board_size,
            komi,
            TimeBudgets::uniform(self.time_budget_ms),
        );
        let snapshot = session.snapshot();
        self.insert(session, Some(opponent.clone()));
        self.directory.remember(opponent);
        if let Err(e) = self.gateway.invite_to_game(opponent, snapshot).await {
            self.sessions.remove(&game_id);
            return Err(e);
        }
        tracing::info!("Node '{}' invited '{}' to game '{}'", local.id, opponent.id, game_id);
        Ok(game_id)
    }

    /// Start a game against the local AI; we play black
    pub fn propose_ai(&self, board_size: u8, komi: f32) -> Result<GameId> {
        if self.ai.is_none() {
            return Err(ArenaError::Rejected("no AI engine configured".to_string()));
        }
        let local = self.local_id().clone();
        let game_id = GameId::generate();
        let mut session = GameSession::new(
            game_id.clone(),
            local.clone(),
            local,
            PeerId::ai(),
            board_size,
            komi,
            TimeBudgets::uniform(self.time_budget_ms),
        );
        session.transition(SessionState::Active)?;
        self.insert(session, None);
        self.emit(SessionEvent::Started {
            game_id: game_id.clone(),
        });
        Ok(game_id)
    }

    /// Accept a pending invite by asking its host to start the game
    pub async fn accept(&self, game_id: &GameId) -> Result<()> {
        let slot = self.slot(game_id)?;
        let (host, state) = {
            let s = lock(&slot);
            (self.opponent_of(&s), s.session.state())
        };
        if state != SessionState::Created {
            return Err(ArenaError::InvalidStateTransition {
                from: state.to_string(),
                to: SessionState::Active.to_string(),
            });
        }
        let host = host.ok_or_else(|| ArenaError::Transport(format!("host of game '{}' is unknown", game_id)))?;
        self.gateway.join_request(&host, game_id.clone()).await?;
        lock(&slot).session.transition(SessionState::Active)?;
        tracing::info!("Node '{}' joined game '{}'", self.local_id(), game_id);
        self.emit(SessionEvent::Started {
            game_id: game_id.clone(),
        });
        Ok(())
    }

    pub async fn decline(&self, game_id: &GameId) -> Result<()> {
        let slot = self.slot(game_id)?;
        let host = {
            let mut s = lock(&slot);
            s.session.transition(SessionState::Declined)?;
            self.opponent_of(&s)
        };
        self.sessions.remove(game_id);
        if let Some(host) = host {
            if let Err(e) = self.gateway.decline_invite(&host, game_id.clone()).await {
                tracing::warn!("Node '{}' could not deliver decline of '{}': {}", self.local_id(), game_id, e);
            }
        }
        Ok(())
    }

    /// Withdraw an invite we sent
    pub async fn cancel_invite(&self, game_id: &GameId) -> Result<()> {
        let slot = self.slot(game_id)?;
        let guest = {
            let mut s = lock(&slot);
            if s.session.host_id() != self.local_id() {
                return Err(ArenaError::Rejected("only the host can cancel an invite".to_string()));
            }
            s.session.transition(SessionState::Cancelled)?;
            self.opponent_of(&s)
        };
        self.sessions.remove(game_id);
        if let Some(guest) = guest {
            if let Err(e) = self.gateway.cancel_invite(&guest, game_id.clone()).await {
                tracing::warn!("Node '{}' could not deliver cancel of '{}': {}", self.local_id(), game_id, e);
            }
        }
        Ok(())
    }

    /// Place a stone; returns the move's sequence number
    pub async fn play(&self, game_id: &GameId, x: i32, y: i32) -> Result<u64> {
        self.play_local(game_id, Some((x, y))).await
    }

    pub async fn pass(&self, game_id: &GameId) -> Result<u64> {
        self.play_local(game_id, None).await
    }

    async fn play_local(&self, game_id: &GameId, point: Option<(i32, i32)>) -> Result<u64> {
        let slot = self.slot(game_id)?;
        let local = self.local_id().clone();
        let (mv, seq, opponent, ended, against_ai) = {
            let mut s = lock(&slot);
            if s.session.state() != SessionState::Active {
                return Err(ArenaError::IllegalMove(format!("game '{}' is {}", game_id, s.session.state())));
            }
            let color = s
                .session
                .color_of(&local)
                .ok_or_else(|| self.not_participant(&local, game_id))?;
            if s.session.turn() != color {
                return Err(ArenaError::IllegalMove("not your turn".to_string()));
            }
            let mv = match point {
                Some((x, y)) => Move::place(x, y, color),
                None => Move::pass(color),
            };
            if !mv.is_pass() && !s.rules.apply_move(mv.x, mv.y, color, true).accepted {
                return Err(ArenaError::IllegalMove(format!("{} is not allowed", mv)));
            }
            let seq = s.session.add_move(mv);
            let against_ai = s.session.player(color.opponent()).is_ai();
            (mv, seq, self.opponent_of(&s), s.session.ended_by_passes(), against_ai)
        };
        self.emit(SessionEvent::MoveApplied {
            game_id: game_id.clone(),
            by: local,
            mv,
            seq,
        });
        if let Some(opponent) = &opponent {
            if let Err(e) = self.gateway.submit_move(opponent, game_id.clone(), mv, seq).await {
                tracing::warn!("Node '{}' move {} of '{}' not delivered: {}", self.local_id(), seq, game_id, e);
            }
        }
        if ended {
            self.finish_by_score(game_id, true).await;
        } else if against_ai {
            self.ai_turn(game_id).await?;
        }
        Ok(seq)
    }

    /// Let the AI collaborator answer; it runs on the blocking pool
    async fn ai_turn(&self, game_id: &GameId) -> Result<()> {
        let Some(ai) = self.ai.clone() else {
            return Ok(());
        };
        let slot = self.slot(game_id)?;
        let (color, position) = {
            let s = lock(&slot);
            let color = s.session.turn();
            if s.session.state() != SessionState::Active || !s.session.player(color).is_ai() {
                return Ok(());
            }
            (color, s.session.snapshot())
        };
        let choice = tokio::task::spawn_blocking(move || ai.request_move(color, &position))
            .await
            .map_err(|e| ArenaError::Internal(format!("AI task failed: {}", e)))?;
        let (mv, seq, ended) = {
            let mut s = lock(&slot);
            if s.session.state() != SessionState::Active || s.session.turn() != color {
                return Ok(());
            }
            let placed = match choice {
                AiMove::Place(x, y) => s
                    .rules
                    .apply_move(x, y, color, true)
                    .accepted
                    .then(|| Move::place(x, y, color)),
                AiMove::Pass => None,
            };
            let mv = placed.unwrap_or_else(|| Move::pass(color));
            let seq = s.session.add_move(mv);
            (mv, seq, s.session.ended_by_passes())
        };
        self.emit(SessionEvent::MoveApplied {
            game_id: game_id.clone(),
            by: PeerId::ai(),
            mv,
            seq,
        });
        if ended {
            self.finish_by_score(game_id, false).await;
        }
        Ok(())
    }

    /// Score a game ended by two passes and close it
    async fn finish_by_score(&self, game_id: &GameId, notify: bool) {
        let Ok(slot) = self.slot(game_id) else {
            return;
        };
        let (result, record, opponent) = {
            let mut s = lock(&slot);
            let komi = s.session.komi();
            let result = s.rules.score(komi);
            let winner = result.winner.map(|c| s.session.player(c).clone());
            if let Err(e) = s.session.finish(winner) {
                tracing::warn!("Node '{}' cannot finish '{}': {}", self.local_id(), game_id, e);
                return;
            }
            (result, s.session.record(Some(result)), self.opponent_of(&s))
        };
        tracing::info!(
            "Node '{}' game '{}' over: black {} white {}",
            self.local_id(),
            game_id,
            result.black,
            result.white
        );
        self.conclude(record, Some(result));
        if notify {
            if let Some(opponent) = opponent {
                if let Err(e) = self.gateway.send_score_result(&opponent, game_id.clone(), result).await {
                    tracing::warn!("Node '{}' score of '{}' not delivered: {}", self.local_id(), game_id, e);
                }
            }
        }
    }

    /// Archive a finished game and drop it from the active table
    fn conclude(&self, record: GameRecord, score: Option<ScoreResult>) {
        let game_id = record.game_id.clone();
        let winner = record.winner.clone();
        if let Err(e) = self.append_history(record) {
            tracing::warn!("Node '{}' could not archive '{}': {}", self.local_id(), game_id, e);
        }
        // a paused copy must not resurrect the game on a later reconnect
        if let Err(e) = self.storage.remove(&session_key(&game_id)) {
            tracing::warn!("Node '{}' could not drop saved '{}': {}", self.local_id(), game_id, e);
        }
        self.sessions.remove(&game_id);
        self.emit(SessionEvent::Finished { game_id, winner, score });
    }

    /// Leave a game for now; it can be resumed with [`SessionManager::reconnect`]
    pub async fn pause(&self, game_id: &GameId) -> Result<()> {
        let slot = self.slot(game_id)?;
        let local = self.local_id().clone();
        let (snapshot, opponent) = {
            let mut s = lock(&slot);
            s.session.transition(SessionState::Paused)?;
            (s.session.snapshot(), self.opponent_of(&s))
        };
        self.persist(&snapshot);
        self.emit(SessionEvent::Paused {
            game_id: game_id.clone(),
            who: local.clone(),
            reason: PauseReason::Exit,
        });
        if let Some(opponent) = opponent {
            let budgets = snapshot.budgets;
            if let Err(e) = self
                .gateway
                .notify_game_paused(&opponent, game_id.clone(), local, PauseReason::Exit, budgets)
                .await
            {
                tracing::warn!("Node '{}' pause of '{}' not delivered: {}", self.local_id(), game_id, e);
            }
        }
        Ok(())
    }

    /// Resign; the opponent wins
    pub async fn surrender(&self, game_id: &GameId) -> Result<()> {
        let slot = self.slot(game_id)?;
        let local = self.local_id().clone();
        let (record, budgets, opponent) = {
            let mut s = lock(&slot);
            let winner = s.session.opponent_of(&local).cloned();
            s.session.finish(winner)?;
            (s.session.record(None), s.session.budgets(), self.opponent_of(&s))
        };
        self.conclude(record, None);
        if let Some(opponent) = opponent {
            if let Err(e) = self
                .gateway
                .notify_game_paused(&opponent, game_id.clone(), local, PauseReason::Surrender, budgets)
                .await
            {
                tracing::warn!("Node '{}' surrender of '{}' not delivered: {}", self.local_id(), game_id, e);
            }
        }
        Ok(())
    }

    /// Ask the other player for their view of a paused or interrupted game
    ///
    /// Works after a restart too, from the snapshot persisted on pause.
    pub async fn reconnect(&self, game_id: &GameId) -> Result<()> {
        let slot = self.slot_or_restore(game_id)?;
        let opponent = {
            let s = lock(&slot);
            if !s.session.is_participant(self.local_id()) {
                return Err(self.not_participant(self.local_id(), game_id));
            }
            self.opponent_of(&s)
        };
        let opponent =
            opponent.ok_or_else(|| ArenaError::Transport(format!("opponent of game '{}' is unknown", game_id)))?;
        tracing::info!("Node '{}' reconnecting game '{}' with '{}'", self.local_id(), game_id, opponent.id);
        self.gateway.reconnect_request(&opponent, game_id.clone()).await
    }

    fn slot_or_restore(&self, game_id: &GameId) -> Result<Arc<Mutex<SessionSlot>>> {
        if let Ok(slot) = self.slot(game_id) {
            return Ok(slot);
        }
        if self.is_archived(game_id)? {
            tracing::debug!("Node '{}' game '{}' is already finished", self.local_id(), game_id);
            return Err(ArenaError::UnknownGame(game_id.to_string()));
        }
        let snapshot = self
            .load_snapshot(game_id)?
            .ok_or_else(|| ArenaError::UnknownGame(game_id.to_string()))?;
        let session = GameSession::from_snapshot(snapshot)?;
        Ok(self.insert(session, None))
    }

    pub async fn chat(&self, game_id: &GameId, text: impl Into<String>) -> Result<()> {
        let slot = self.slot(game_id)?;
        let opponent = self
            .opponent_of(&lock(&slot))
            .ok_or_else(|| ArenaError::Transport(format!("opponent of game '{}' is unknown", game_id)))?;
        self.gateway
            .send_chat_message(&opponent, game_id.clone(), text.into())
            .await
    }

    /// Most recent finished games first
    pub fn history(&self, limit: usize) -> Result<Vec<GameRecord>> {
        let mut records = self.load_history()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    fn load_history(&self) -> Result<Vec<GameRecord>> {
        match self.storage.load(HISTORY_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn is_archived(&self, game_id: &GameId) -> Result<bool> {
        Ok(self.load_history()?.iter().any(|r| &r.game_id == game_id))
    }

    fn append_history(&self, record: GameRecord) -> Result<()> {
        let _guard = self
            .history_lock
            .lock()
            .map_err(|_| ArenaError::Storage("history lock poisoned".to_string()))?;
        let mut records = self.load_history()?;
        records.push(record);
        if records.len() > MAX_HISTORY {
            let excess = records.len() - MAX_HISTORY;
            records.drain(..excess);
        }
        self.storage.save(HISTORY_KEY, &serde_json::to_vec(&records)?)
    }

    fn persist(&self, snapshot: &SessionSnapshot) {
        let result = serde_json::to_vec(snapshot)
            .map_err(ArenaError::from)
            .and_then(|bytes| self.storage.save(&session_key(&snapshot.game_id), &bytes));
        if let Err(e) = result {
            tracing::warn!("Node '{}' could not persist '{}': {}", self.local_id(), snapshot.game_id, e);
        }
    }

    fn load_snapshot(&self, game_id: &GameId) -> Result<Option<SessionSnapshot>> {
        match self.storage.load(&session_key(game_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serve the session calls of the RPC contract
    pub async fn handle_rpc(&self, request: RpcRequest) -> Result<RpcResponse> {
        match request {
            RpcRequest::InviteToGame { from, snapshot } => self.on_invite(from, snapshot).map(|_| RpcResponse::Ack),
            RpcRequest::CancelInvite { game_id, from } => {
                self.on_cancel_invite(&game_id, &from).map(|_| RpcResponse::Ack)
            }
            RpcRequest::DeclineInvite { game_id, from } => {
                self.on_decline_invite(&game_id, &from).map(|_| RpcResponse::Ack)
            }
            RpcRequest::JoinRequest { requester, game_id } => {
                self.on_join_request(requester, &game_id).map(|_| RpcResponse::Ack)
            }
            RpcRequest::SubmitMove { game_id, from, mv, seq } => self.on_submit_move(game_id, from, mv, seq).await,
            RpcRequest::MoveAck { game_id, seq } => {
                tracing::trace!("Node '{}' move {} of '{}' acknowledged", self.local_id(), seq, game_id);
                self.emit(SessionEvent::MoveAcked { game_id, seq });
                Ok(RpcResponse::Ack)
            }
            RpcRequest::ReconnectRequest { requester, game_id } => {
                self.on_reconnect_request(requester, &game_id).map(|_| RpcResponse::Ack)
            }
            RpcRequest::ReconnectOffer { from, snapshot } => {
                self.on_reconnect_offer(from, snapshot).map(|_| RpcResponse::Ack)
            }
            RpcRequest::NotifyGamePaused {
                game_id,
                who,
                reason,
                budgets,
            } => self
                .on_game_paused(&game_id, &who, reason, budgets)
                .map(|_| RpcResponse::Ack),
            RpcRequest::SendScoreResult { game_id, result } => {
                self.on_score_result(&game_id, result).map(|_| RpcResponse::Ack)
            }
            RpcRequest::SendChatMessage { game_id, sender, text } => {
                let slot = self.slot(&game_id)?;
                if !lock(&slot).session.is_participant(&sender) {
                    return Err(self.not_participant(&sender, &game_id));
                }
                self.emit(SessionEvent::Chat { game_id, sender, text });
                Ok(RpcResponse::Ack)
            }
            RpcRequest::GetGameHistory { limit } => Ok(RpcResponse::History {
                records: self.history(limit)?,
            }),
            other => Err(ArenaError::Protocol(format!("'{}' is not a session call", other.name()))),
        }
    }

    fn on_invite(&self, from: PeerDescriptor, snapshot: SessionSnapshot) -> Result<()> {
        let session = GameSession::from_snapshot(snapshot.clone())?;
        let game_id = session.game_id().clone();
        if !session.is_participant(self.local_id()) {
            return Err(self.not_participant(self.local_id(), &game_id));
        }
        if session.host_id() != &from.id || !session.is_participant(&from.id) {
            return Err(ArenaError::Protocol(format!("invite to '{}' not sent by its host", game_id)));
        }
        if session.state() != SessionState::Created {
            return Err(ArenaError::Rejected(format!("game '{}' is already {}", game_id, session.state())));
        }
        if self.sessions.contains_key(&game_id) {
            return Ok(());
        }
        self.directory.remember(&from);
        self.insert(session, Some(from.clone()));
        tracing::info!("Node '{}' invited to '{}' by '{}'", self.local_id(), game_id, from.id);
        self.emit(SessionEvent::Invited { from, snapshot });
        Ok(())
    }

    fn on_cancel_invite(&self, game_id: &GameId, from: &PeerId) -> Result<()> {
        let slot = self.slot(game_id)?;
        {
            let mut s = lock(&slot);
            if s.session.host_id() != from {
                return Err(self.not_participant(from, game_id));
            }
            s.session.transition(SessionState::Cancelled)?;
        }
        self.sessions.remove(game_id);
        self.emit(SessionEvent::InviteCancelled {
            game_id: game_id.clone(),
        });
        Ok(())
    }

    fn on_decline_invite(&self, game_id: &GameId, from: &PeerId) -> Result<()> {
        let slot = self.slot(game_id)?;
        {
            let mut s = lock(&slot);
            if !s.session.is_participant(from) || from == self.local_id() {
                return Err(self.not_participant(from, game_id));
            }
            s.session.transition(SessionState::Declined)?;
        }
        self.sessions.remove(game_id);
        self.emit(SessionEvent::InviteDeclined {
            game_id: game_id.clone(),
            by: from.clone(),
        });
        Ok(())
    }

    fn on_join_request(&self, requester: PeerDescriptor, game_id: &GameId) -> Result<()> {
        let slot = self.slot(game_id)?;
        let started = {
            let mut s = lock(&slot);
            if s.session.host_id() != self.local_id() {
                return Err(ArenaError::Rejected(format!("not the host of '{}'", game_id)));
            }
            if !s.session.is_participant(&requester.id) || &requester.id == self.local_id() {
                return Err(self.not_participant(&requester.id, game_id));
            }
            let started = s.session.state() == SessionState::Created;
            s.session.transition(SessionState::Active)?;
            s.opponent = Some(requester.clone());
            started
        };
        self.directory.remember(&requester);
        if started {
            tracing::info!("Node '{}' game '{}' started with '{}'", self.local_id(), game_id, requester.id);
            self.emit(SessionEvent::Started {
                game_id: game_id.clone(),
            });
        }
        Ok(())
    }

    async fn on_submit_move(&self, game_id: GameId, from: PeerId, mv: Move, seq: u64) -> Result<RpcResponse> {
        let slot = self.slot(&game_id)?;
        let delivery = {
            let mut s = lock(&slot);
            let color = s
                .session
                .color_of(&from)
                .filter(|_| &from != self.local_id())
                .ok_or_else(|| self.not_participant(&from, &game_id))?;
            if mv.color != color {
                return Err(ArenaError::Protocol(format!("'{}' cannot play {}", from, mv.color)));
            }
            let expected = s.session.version() + 1;
            if s.session.has_move(seq, &mv) {
                Delivery::Duplicate
            } else if seq != expected {
                Delivery::Refused(format!("expected move {}, got {}", expected, seq))
            } else {
                // a move from the host proves our join was accepted
                if s.session.state() == SessionState::Created {
                    s.session.transition(SessionState::Active)?;
                }
                if s.session.state() != SessionState::Active {
                    Delivery::Refused(format!("game is {}", s.session.state()))
                } else if s.session.turn() != color {
                    Delivery::Refused(format!("not {}'s turn", color))
                } else if !mv.is_pass() && !s.rules.apply_move(mv.x, mv.y, color, true).accepted {
                    Delivery::Refused(format!("{} is not allowed", mv))
                } else {
                    s.session.add_move(mv);
                    Delivery::Applied {
                        ended: s.session.ended_by_passes(),
                        sender: self.opponent_of(&s),
                    }
                }
            }
        };
        match delivery {
            Delivery::Duplicate => {
                tracing::debug!("Node '{}' ignored duplicate move {} of '{}'", self.local_id(), seq, game_id);
                Ok(RpcResponse::Ack)
            }
            Delivery::Refused(reason) => {
                tracing::warn!("Node '{}' refused move {} of '{}': {}", self.local_id(), seq, game_id, reason);
                Ok(RpcResponse::Rejected { reason })
            }
            Delivery::Applied { ended, sender } => {
                self.emit(SessionEvent::MoveApplied {
                    game_id: game_id.clone(),
                    by: from,
                    mv,
                    seq,
                });
                if let Some(sender) = sender {
                    self.gateway.dispatch(
                        &sender,
                        RpcRequest::MoveAck {
                            game_id: game_id.clone(),
                            seq,
                        },
                    );
                }
                if ended {
                    self.finish_by_score(&game_id, false).await;
                }
                Ok(RpcResponse::Ack)
            }
        }
    }

    fn on_game_paused(&self, game_id: &GameId, who: &PeerId, reason: PauseReason, budgets: TimeBudgets) -> Result<()> {
        let slot = self.slot(game_id)?;
        let local = self.local_id().clone();
        match reason {
            PauseReason::Exit => {
                let snapshot = {
                    let mut s = lock(&slot);
                    if !s.session.is_participant(who) || who == &local {
                        return Err(self.not_participant(who, game_id));
                    }
                    s.session.transition(SessionState::Paused)?;
                    s.session.set_budgets(budgets);
                    s.session.snapshot()
                };
                self.persist(&snapshot);
                tracing::info!("Node '{}' game '{}' paused by '{}'", local, game_id, who);
                self.emit(SessionEvent::Paused {
                    game_id: game_id.clone(),
                    who: who.clone(),
                    reason,
                });
            }
            PauseReason::Surrender => {
                let record = {
                    let mut s = lock(&slot);
                    if !s.session.is_participant(who) || who == &local {
                        return Err(self.not_participant(who, game_id));
                    }
                    s.session.set_budgets(budgets);
                    s.session.finish(Some(local.clone()))?;
                    s.session.record(None)
                };
                tracing::info!("Node '{}' game '{}' won by surrender of '{}'", local, game_id, who);
                self.conclude(record, None);
            }
        }
        Ok(())
    }

    fn on_score_result(&self, game_id: &GameId, result: ScoreResult) -> Result<()> {
        let Ok(slot) = self.slot(game_id) else {
            tracing::debug!("Node '{}' score for concluded game '{}'", self.local_id(), game_id);
            return Ok(());
        };
        let record = {
            let mut s = lock(&slot);
            if s.session.state().is_terminal() {
                return Ok(());
            }
            let winner = result.winner.map(|c| s.session.player(c).clone());
            s.session.finish(winner)?;
            s.session.record(Some(result))
        };
        self.conclude(record, Some(result));
        Ok(())
    }

    /// Holder side: verify the requester and send it our snapshot
    fn on_reconnect_request(&self, requester: PeerDescriptor, game_id: &GameId) -> Result<()> {
        let slot = self.slot_or_restore(game_id)?;
        let snapshot = {
            let mut s = lock(&slot);
            if !s.session.is_participant(&requester.id) || &requester.id == self.local_id() {
                return Err(self.not_participant(&requester.id, game_id));
            }
            s.opponent = Some(requester.clone());
            s.session.mark_offer_sent();
            s.session.snapshot()
        };
        self.directory.remember(&requester);
        tracing::info!("Node '{}' offering '{}' v{} to '{}'", self.local_id(), game_id, snapshot.version, requester.id);
        self.gateway.dispatch(
            &requester,
            RpcRequest::ReconnectOffer {
                from: self.directory.local().clone(),
                snapshot,
            },
        );
        Ok(())
    }

    /// Adopt the offered snapshot unless ours is newer, then answer with our
    /// own offer if we have not sent one yet
    fn on_reconnect_offer(&self, from: PeerDescriptor, snapshot: SessionSnapshot) -> Result<()> {
        let game_id = snapshot.game_id.clone();
        let slot = match self.slot_or_restore(&game_id) {
            Ok(slot) => slot,
            Err(ArenaError::UnknownGame(_)) if !self.is_archived(&game_id)? => {
                let session = GameSession::from_snapshot(snapshot.clone())?;
                if !session.is_participant(self.local_id()) {
                    return Err(self.not_participant(self.local_id(), &game_id));
                }
                self.insert(session, Some(from.clone()))
            }
            Err(e) => return Err(e),
        };
        let (adopted, version, synchronized, counter) = {
            let mut s = lock(&slot);
            if !s.session.is_participant(&from.id) || &from.id == self.local_id() {
                return Err(self.not_participant(&from.id, &game_id));
            }
            let adopted = s.session.adopt_snapshot(snapshot)?;
            if adopted {
                let rules = self.rules_for(s.session.board_size(), s.session.moves());
                s.rules = rules;
            }
            if s.session.state() == SessionState::Paused {
                s.session.transition(SessionState::Active)?;
            }
            s.opponent = Some(from.clone());
            let counter = if s.session.offer_sent() {
                None
            } else {
                s.session.mark_offer_sent();
                Some(s.session.snapshot())
            };
            (adopted, s.session.version(), s.session.is_synchronized(), counter)
        };
        self.directory.remember(&from);
        if let Some(snapshot) = counter {
            self.gateway.dispatch(
                &from,
                RpcRequest::ReconnectOffer {
                    from: self.directory.local().clone(),
                    snapshot,
                },
            );
        }
        tracing::info!(
            "Node '{}' resumed '{}' at v{} (adopted: {}, synchronized: {})",
            self.local_id(),
            game_id,
            version,
            adopted,
            synchronized
        );
        self.emit(SessionEvent::Resumed {
            game_id,
            version,
            adopted,
            synchronized,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::rpc::RpcHandler;
    use crate::session::collaborators::MemoryStorage;
    use crate::session::game::StoneColor;
    use futures::future::BoxFuture;
    use std::net::IpAddr;
    use std::time::Duration;

    struct Sessions(Arc<SessionManager>);

    impl RpcHandler for Sessions {
        fn handle(&self, request: RpcRequest) -> BoxFuture<'_, Result<RpcResponse>> {
            Box::pin(self.0.handle_rpc(request))
        }
    }

    struct Player {
        manager: Arc<SessionManager>,
        events: flume::Receiver<SessionEvent>,
        descriptor: PeerDescriptor,
        handler: Arc<dyn RpcHandler>,
        storage: Arc<MemoryStorage>,
    }

    impl Player {
        fn drain(&self) -> Vec<SessionEvent> {
            self.events.try_iter().collect()
        }

        fn state(&self, game_id: &GameId) -> Option<SessionState> {
            self.manager.snapshot(game_id).map(|s| s.state)
        }

        fn version(&self, game_id: &GameId) -> u64 {
            self.manager.snapshot(game_id).map(|s| s.version).unwrap_or(0)
        }
    }

    fn player(network: &Arc<LoopbackNetwork>, id: &str, octet: u8) -> Player {
        let descriptor = PeerDescriptor {
            id: PeerId::from_name(id).unwrap(),
            name: id.to_lowercase(),
            address: IpAddr::from([127, 0, 0, octet]),
            port: 7200,
            service: "go".to_string(),
            rank: 0,
        };
        let gateway = Arc::new(RpcGateway::start(
            descriptor.clone(),
            Arc::new(network.rpc_transport(descriptor.id.clone())),
            2,
            32,
        ));
        let (tx, events) = flume::unbounded();
        let storage = Arc::new(MemoryStorage::new());
        let collaborators = Collaborators {
            storage: storage.clone(),
            ..Collaborators::default()
        };
        let manager = Arc::new(SessionManager::new(
            Arc::new(PeerDirectory::new(descriptor.clone())),
            gateway,
            collaborators,
            tx,
            60_000,
        ));
        let handler: Arc<dyn RpcHandler> = Arc::new(Sessions(manager.clone()));
        network.register_handler(descriptor.rpc_addr(), "go", Arc::downgrade(&handler));
        Player {
            manager,
            events,
            descriptor,
            handler,
            storage,
        }
    }

    async fn started_game(a: &Player, b: &Player) -> GameId {
        let game_id = a.manager.propose(&b.descriptor, 9, 6.5).await.unwrap();
        b.manager.accept(&game_id).await.unwrap();
        game_id
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_invite_accept_and_play() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);

        let game_id = a.manager.propose(&b.descriptor, 9, 6.5).await.unwrap();
        assert_eq!(b.state(&game_id), Some(SessionState::Created));
        assert!(matches!(b.drain().first(), Some(SessionEvent::Invited { .. })));
        assert!(a.manager.open_game(&game_id).is_some());
        assert!(b.manager.open_game(&game_id).is_none());

        b.manager.accept(&game_id).await.unwrap();
        assert_eq!(a.state(&game_id), Some(SessionState::Active));
        assert_eq!(b.state(&game_id), Some(SessionState::Active));

        assert_eq!(a.manager.play(&game_id, 2, 2).await.unwrap(), 1);
        assert_eq!(b.manager.play(&game_id, 3, 3).await.unwrap(), 2);
        assert_eq!(a.manager.play(&game_id, 4, 4).await.unwrap(), 3);
        settle().await;

        assert_eq!(a.version(&game_id), 3);
        assert_eq!(b.version(&game_id), 3);
        assert_eq!(a.manager.snapshot(&game_id).unwrap().moves, b.manager.snapshot(&game_id).unwrap().moves);
        assert_eq!(network.count("move_ack"), 3);
        assert!(a
            .drain()
            .iter()
            .any(|e| matches!(e, SessionEvent::MoveAcked { seq: 3, .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_local_move_checks() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;

        assert!(matches!(b.manager.play(&game_id, 0, 0).await, Err(ArenaError::IllegalMove(_))));
        a.manager.play(&game_id, 0, 0).await.unwrap();
        assert!(matches!(b.manager.play(&game_id, 0, 0).await, Err(ArenaError::IllegalMove(_))));
        assert_eq!(b.version(&game_id), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_duplicate_and_gap_deliveries() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;
        a.manager.play(&game_id, 1, 1).await.unwrap();

        let black = a.descriptor.id.clone();
        let again = b
            .manager
            .handle_rpc(RpcRequest::SubmitMove {
                game_id: game_id.clone(),
                from: black.clone(),
                mv: Move::place(1, 1, StoneColor::Black),
                seq: 1,
            })
            .await
            .unwrap();
        assert_eq!(again, RpcResponse::Ack);
        assert_eq!(b.version(&game_id), 1);

        let gap = b
            .manager
            .handle_rpc(RpcRequest::SubmitMove {
                game_id: game_id.clone(),
                from: black,
                mv: Move::place(5, 5, StoneColor::Black),
                seq: 3,
            })
            .await
            .unwrap();
        assert!(matches!(gap, RpcResponse::Rejected { .. }));
        assert_eq!(b.version(&game_id), 1);

        // a stranger cannot inject moves
        let err = b
            .manager
            .handle_rpc(RpcRequest::SubmitMove {
                game_id,
                from: PeerId::from_name("M").unwrap(),
                mv: Move::place(5, 5, StoneColor::White),
                seq: 2,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::NotParticipant { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_two_passes_finish_and_archive() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;

        a.manager.play(&game_id, 4, 4).await.unwrap();
        b.manager.pass(&game_id).await.unwrap();
        a.manager.pass(&game_id).await.unwrap();
        settle().await;

        assert!(a.manager.snapshot(&game_id).is_none());
        assert!(b.manager.snapshot(&game_id).is_none());
        assert_eq!(network.count("send_score_result"), 1);

        let history = a.manager.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].move_count, 3);
        // one black stone against komi 6.5: black 1, white 6.5
        assert_eq!(history[0].winner.as_ref(), Some(&b.descriptor.id));
        let finished = b
            .drain()
            .into_iter()
            .find(|e| matches!(e, SessionEvent::Finished { .. }));
        assert!(matches!(finished, Some(SessionEvent::Finished { score: Some(_), .. })));

        let remote = b
            .manager
            .handle_rpc(RpcRequest::GetGameHistory { limit: 5 })
            .await
            .unwrap();
        assert!(matches!(remote, RpcResponse::History { records } if records.len() == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_decline_and_cancel() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);

        let declined = a.manager.propose(&b.descriptor, 9, 6.5).await.unwrap();
        b.manager.decline(&declined).await.unwrap();
        assert!(a.manager.snapshot(&declined).is_none());
        assert!(b.manager.snapshot(&declined).is_none());
        assert!(a
            .drain()
            .iter()
            .any(|e| matches!(e, SessionEvent::InviteDeclined { .. })));

        let cancelled = a.manager.propose(&b.descriptor, 9, 6.5).await.unwrap();
        assert!(b.manager.cancel_invite(&cancelled).await.is_err());
        a.manager.cancel_invite(&cancelled).await.unwrap();
        assert!(b.manager.snapshot(&cancelled).is_none());
        assert!(b.manager.accept(&cancelled).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_invite_to_unreachable_peer_fails() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        network.disconnect(&b.descriptor);
        assert!(a.manager.propose(&b.descriptor, 9, 6.5).await.is_err());
        assert!(a.manager.snapshots().is_empty());
    }

    /// B misses a move while unreachable, pauses, then reconnects and adopts
    /// A's newer snapshot; both sides end up synchronized at the same version.
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_pause_and_reconnect_converge() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;
        a.manager.play(&game_id, 0, 0).await.unwrap();
        b.manager.play(&game_id, 1, 1).await.unwrap();

        network.disconnect(&b.descriptor);
        a.manager.play(&game_id, 2, 2).await.unwrap();
        assert_eq!(a.version(&game_id), 3);
        assert_eq!(b.version(&game_id), 2);

        b.manager.pause(&game_id).await.unwrap();
        assert_eq!(a.state(&game_id), Some(SessionState::Paused));
        assert!(!a.manager.is_synchronized(&game_id));

        network.register_handler(b.descriptor.rpc_addr(), "go", Arc::downgrade(&b.handler));
        b.manager.reconnect(&game_id).await.unwrap();
        settle().await;

        for p in [&a, &b] {
            assert_eq!(p.version(&game_id), 3);
            assert_eq!(p.state(&game_id), Some(SessionState::Active));
            assert!(p.manager.is_synchronized(&game_id));
        }
        assert!(b
            .drain()
            .iter()
            .any(|e| matches!(e, SessionEvent::Resumed { adopted: true, version: 3, .. })));
        // B plays white and it is its turn again after the adopted move
        b.manager.play(&game_id, 3, 3).await.unwrap();
        assert_eq!(a.version(&game_id), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_reconnect_from_stranger_rejected() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let m = player(&network, "M", 3);
        let game_id = started_game(&a, &b).await;

        let err = a
            .manager
            .handle_rpc(RpcRequest::ReconnectRequest {
                requester: m.descriptor.clone(),
                game_id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::NotParticipant { .. }));
        assert_eq!(network.count("reconnect_offer"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_surrender_gives_the_win() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;

        b.manager.surrender(&game_id).await.unwrap();
        assert!(a.manager.snapshot(&game_id).is_none());
        for p in [&a, &b] {
            let history = p.manager.history(1).unwrap();
            assert_eq!(history[0].winner.as_ref(), Some(&a.descriptor.id));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_finished_game_stays_finished() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;
        a.manager.play(&game_id, 0, 0).await.unwrap();

        b.manager.pause(&game_id).await.unwrap();
        assert!(b.storage.load(&session_key(&game_id)).unwrap().is_some());
        b.manager.reconnect(&game_id).await.unwrap();
        settle().await;
        assert_eq!(b.state(&game_id), Some(SessionState::Active));

        b.manager.surrender(&game_id).await.unwrap();
        assert!(a.state(&game_id).is_none());
        assert!(b.state(&game_id).is_none());
        for p in [&a, &b] {
            assert!(p.storage.load(&session_key(&game_id)).unwrap().is_none());
        }

        let err = b.manager.reconnect(&game_id).await.unwrap_err();
        assert!(matches!(err, ArenaError::UnknownGame(_)));
        settle().await;
        assert!(a.state(&game_id).is_none());
        assert!(b.state(&game_id).is_none());
        assert_eq!(a.manager.history(10).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_archived_game_refuses_restore() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;
        b.manager.pause(&game_id).await.unwrap();
        let stale = b.storage.load(&session_key(&game_id)).unwrap().unwrap();
        let snapshot: SessionSnapshot = serde_json::from_slice(&stale).unwrap();

        a.manager.reconnect(&game_id).await.unwrap();
        settle().await;
        a.manager.surrender(&game_id).await.unwrap();

        // a stale copy written back by hand is ignored once the game is in the history
        b.storage.save(&session_key(&game_id), &stale).unwrap();
        let err = b.manager.reconnect(&game_id).await.unwrap_err();
        assert!(matches!(err, ArenaError::UnknownGame(_)));
        let err = a
            .manager
            .handle_rpc(RpcRequest::ReconnectOffer {
                from: b.descriptor.clone(),
                snapshot,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::UnknownGame(_)));
        assert!(a.state(&game_id).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_ai_answers_each_move() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let game_id = a.manager.propose_ai(9, 6.5).unwrap();

        a.manager.play(&game_id, 4, 4).await.unwrap();
        let snapshot = a.manager.snapshot(&game_id).unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.turn, StoneColor::Black);
        assert_eq!(snapshot.white, PeerId::ai());

        // the random AI answers a pass with a pass, which ends the game
        a.manager.pass(&game_id).await.unwrap();
        assert!(a.manager.snapshot(&game_id).is_none());
        assert_eq!(a.manager.history(5).unwrap().len(), 1);
        assert!(network.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_chat_reaches_opponent() {
        let network = LoopbackNetwork::new();
        let a = player(&network, "A", 1);
        let b = player(&network, "B", 2);
        let game_id = started_game(&a, &b).await;
        a.manager.chat(&game_id, "good luck").await.unwrap();
        assert!(b
            .drain()
            .iter()
            .any(|e| matches!(e, SessionEvent::Chat { text, .. } if text == "good luck")));
    }
}

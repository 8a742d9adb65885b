//! Per-match state and its snapshot schema

use serde::{Deserialize, Serialize};

use super::collaborators::ScoreResult;
use crate::error::{ArenaError, Result};
use crate::types::{now_ms, GameId, PeerDescriptor, PeerId};

/// Schema version carried by every snapshot
pub const SNAPSHOT_SCHEMA: u16 = 1;

/// Stone color, black moves first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoneColor {
    Black,
    White,
}

impl StoneColor {
    pub fn opponent(self) -> Self {
        match self {
            StoneColor::Black => StoneColor::White,
            StoneColor::White => StoneColor::Black,
        }
    }
}

impl std::fmt::Display for StoneColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoneColor::Black => write!(f, "black"),
            StoneColor::White => write!(f, "white"),
        }
    }
}

/// One move; both coordinates negative means pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub x: i32,
    pub y: i32,
    pub color: StoneColor,
}

impl Move {
    pub fn place(x: i32, y: i32, color: StoneColor) -> Self {
        Self { x, y, color }
    }

    pub fn pass(color: StoneColor) -> Self {
        Self { x: -1, y: -1, color }
    }

    pub fn is_pass(&self) -> bool {
        self.x < 0 && self.y < 0
    }
}

impl std::fmt::Display for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_pass() {
            write!(f, "{} pass", self.color)
        } else {
            write!(f, "{} ({}, {})", self.color, self.x, self.y)
        }
    }
}

/// Lifecycle of a session
///
/// `Created → Active ⇄ Paused → Finished`; `Cancelled` and `Declined` are
/// only reachable from `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Active,
    Paused,
    Finished,
    Cancelled,
    Declined,
}

impl SessionState {
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Created, Active)
                | (Created, Cancelled)
                | (Created, Declined)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Finished)
                | (Paused, Finished)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Cancelled | SessionState::Declined
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Remaining thinking time per side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBudgets {
    pub black_ms: u64,
    pub white_ms: u64,
}

impl TimeBudgets {
    pub fn uniform(ms: u64) -> Self {
        Self {
            black_ms: ms,
            white_ms: ms,
        }
    }

    pub fn remaining(&self, color: StoneColor) -> u64 {
        match color {
            StoneColor::Black => self.black_ms,
            StoneColor::White => self.white_ms,
        }
    }

    fn deduct(&mut self, color: StoneColor, ms: u64) {
        let slot = match color {
            StoneColor::Black => &mut self.black_ms,
            StoneColor::White => &mut self.white_ms,
        };
        *slot = slot.saturating_sub(ms);
    }
}

/// Full copy of a session as exchanged on invite and reconnect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema: u16,
    pub game_id: GameId,
    pub host_id: PeerId,
    pub black: PeerId,
    pub white: PeerId,
    pub board_size: u8,
    pub komi: f32,
    pub moves: Vec<Move>,
    pub turn: StoneColor,
    pub state: SessionState,
    pub last_move_at_ms: u64,
    pub winner: Option<PeerId>,
    pub budgets: TimeBudgets,
    pub version: u64,
}

impl SessionSnapshot {
    /// Structural checks applied before a snapshot is trusted
    pub fn validate(&self) -> Result<()> {
        if self.schema != SNAPSHOT_SCHEMA {
            return Err(ArenaError::Protocol(format!(
                "unsupported snapshot schema {}",
                self.schema
            )));
        }
        if self.version != self.moves.len() as u64 {
            return Err(ArenaError::Protocol(format!(
                "snapshot version {} does not match {} moves",
                self.version,
                self.moves.len()
            )));
        }
        if self.black == self.white {
            return Err(ArenaError::Protocol(
                "snapshot participants must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Advertised answer to a game lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSummary {
    pub game_id: GameId,
    pub host: PeerDescriptor,
    pub board_size: u8,
    pub komi: f32,
    pub state: SessionState,
}

/// Archived result of a finished game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: GameId,
    pub black: PeerId,
    pub white: PeerId,
    pub board_size: u8,
    pub komi: f32,
    pub move_count: u64,
    pub winner: Option<PeerId>,
    pub score: Option<ScoreResult>,
    pub finished_at_ms: u64,
}

/// Per-match state
///
/// `version` only moves through [`GameSession::add_move`] (one per append) or
/// wholesale through snapshot adoption, which never goes backwards.
#[derive(Debug, Clone)]
pub struct GameSession {
    game_id: GameId,
    host_id: PeerId,
    black: PeerId,
    white: PeerId,
    board_size: u8,
    komi: f32,
    moves: Vec<Move>,
    turn: StoneColor,
    state: SessionState,
    last_move_at_ms: u64,
    winner: Option<PeerId>,
    budgets: TimeBudgets,
    version: u64,
    offer_sent: bool,
    offer_received: bool,
}

impl GameSession {
    pub fn new(
        game_id: GameId,
        host_id: PeerId,
        black: PeerId,
        white: PeerId,
        board_size: u8,
        komi: f32,
        budgets: TimeBudgets,
    ) -> Self {
        Self {
            game_id,
            host_id,
            black,
            white,
            board_size,
            komi,
            moves: Vec::new(),
            turn: StoneColor::Black,
            state: SessionState::Created,
            last_move_at_ms: now_ms(),
            winner: None,
            budgets,
            version: 0,
            offer_sent: false,
            offer_received: false,
        }
    }

    /// Rebuild a session from a received snapshot (invite or cold reconnect)
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Result<Self> {
        snapshot.validate()?;
        Ok(Self {
            game_id: snapshot.game_id,
            host_id: snapshot.host_id,
            black: snapshot.black,
            white: snapshot.white,
            board_size: snapshot.board_size,
            komi: snapshot.komi,
            moves: snapshot.moves,
            turn: snapshot.turn,
            state: snapshot.state,
            last_move_at_ms: snapshot.last_move_at_ms,
            winner: snapshot.winner,
            budgets: snapshot.budgets,
            version: snapshot.version,
            offer_sent: false,
            offer_received: false,
        })
    }

    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    pub fn host_id(&self) -> &PeerId {
        &self.host_id
    }

    pub fn black(&self) -> &PeerId {
        &self.black
    }

    pub fn white(&self) -> &PeerId {
        &self.white
    }

    pub fn board_size(&self) -> u8 {
        self.board_size
    }

    pub fn komi(&self) -> f32 {
        self.komi
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn turn(&self) -> StoneColor {
        self.turn
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_move_at_ms(&self) -> u64 {
        self.last_move_at_ms
    }

    pub fn winner(&self) -> Option<&PeerId> {
        self.winner.as_ref()
    }

    pub fn budgets(&self) -> TimeBudgets {
        self.budgets
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True once this instance has both sent and received a reconnect offer
    pub fn is_synchronized(&self) -> bool {
        self.offer_sent && self.offer_received
    }

    pub fn color_of(&self, peer: &PeerId) -> Option<StoneColor> {
        if peer == &self.black {
            Some(StoneColor::Black)
        } else if peer == &self.white {
            Some(StoneColor::White)
        } else {
            None
        }
    }

    pub fn is_participant(&self, peer: &PeerId) -> bool {
        self.color_of(peer).is_some()
    }

    pub fn opponent_of(&self, peer: &PeerId) -> Option<&PeerId> {
        match self.color_of(peer)? {
            StoneColor::Black => Some(&self.white),
            StoneColor::White => Some(&self.black),
        }
    }

    pub fn player(&self, color: StoneColor) -> &PeerId {
        match color {
            StoneColor::Black => &self.black,
            StoneColor::White => &self.white,
        }
    }

    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(ArenaError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        if to == SessionState::Paused {
            // a resumed game needs a fresh reconnect exchange
            self.offer_sent = false;
            self.offer_received = false;
        }
        self.state = to;
        Ok(())
    }

    /// Append a move; the only operation that increments `version`
    ///
    /// Returns the new version, which doubles as the move's sequence number.
    pub fn add_move(&mut self, mv: Move) -> u64 {
        let now = now_ms();
        self.budgets
            .deduct(mv.color, now.saturating_sub(self.last_move_at_ms));
        self.moves.push(mv);
        self.version += 1;
        self.last_move_at_ms = now;
        self.turn = mv.color.opponent();
        self.version
    }

    /// Whether the move with sequence number `seq` is already in the log
    pub fn has_move(&self, seq: u64, mv: &Move) -> bool {
        seq >= 1
            && seq <= self.moves.len() as u64
            && self.moves[(seq - 1) as usize] == *mv
    }

    /// Two consecutive passes end the game
    pub fn ended_by_passes(&self) -> bool {
        let n = self.moves.len();
        n >= 2 && self.moves[n - 1].is_pass() && self.moves[n - 2].is_pass()
    }

    pub fn finish(&mut self, winner: Option<PeerId>) -> Result<()> {
        self.transition(SessionState::Finished)?;
        self.winner = winner;
        Ok(())
    }

    /// Override remaining budgets with the values reported by the opponent
    pub fn set_budgets(&mut self, budgets: TimeBudgets) {
        self.budgets = budgets;
    }

    pub fn mark_offer_sent(&mut self) {
        self.offer_sent = true;
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    /// Reconcile with a snapshot offered by the other participant
    ///
    /// The offer counts as received whether or not it is adopted. It is adopted
    /// only when its version is not older than ours. An offer whose state cannot
    /// be reached from ours is refused. Returns whether it was adopted.
    pub fn adopt_snapshot(&mut self, snapshot: SessionSnapshot) -> Result<bool> {
        snapshot.validate()?;
        if snapshot.game_id != self.game_id {
            return Err(ArenaError::Protocol(format!(
                "snapshot for game '{}' offered to game '{}'",
                snapshot.game_id, self.game_id
            )));
        }
        if snapshot.state != self.state && !self.state.can_transition_to(snapshot.state) {
            return Err(ArenaError::InvalidStateTransition {
                from: self.state.to_string(),
                to: snapshot.state.to_string(),
            });
        }
        self.offer_received = true;
        if snapshot.version < self.version {
            return Ok(false);
        }
        self.moves = snapshot.moves;
        self.version = snapshot.version;
        self.turn = snapshot.turn;
        self.state = snapshot.state;
        self.last_move_at_ms = snapshot.last_move_at_ms;
        self.winner = snapshot.winner;
        self.budgets = snapshot.budgets;
        Ok(true)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            schema: SNAPSHOT_SCHEMA,
            game_id: self.game_id.clone(),
            host_id: self.host_id.clone(),
            black: self.black.clone(),
            white: self.white.clone(),
            board_size: self.board_size,
            komi: self.komi,
            moves: self.moves.clone(),
            turn: self.turn,
            state: self.state,
            last_move_at_ms: self.last_move_at_ms,
            winner: self.winner.clone(),
            budgets: self.budgets,
            version: self.version,
        }
    }

    pub fn record(&self, score: Option<ScoreResult>) -> GameRecord {
        GameRecord {
            game_id: self.game_id.clone(),
            black: self.black.clone(),
            white: self.white.clone(),
            board_size: self.board_size,
            komi: self.komi,
            move_count: self.version,
            winner: self.winner.clone(),
            score,
            finished_at_ms: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> GameSession {
        GameSession::new(
            GameId::from("g1"),
            PeerId::from_name("alice").unwrap(),
            PeerId::from_name("alice").unwrap(),
            PeerId::from_name("bob").unwrap(),
            9,
            6.5,
            TimeBudgets::uniform(600_000),
        )
    }

    fn session_with_moves(n: usize) -> GameSession {
        let mut s = session();
        s.transition(SessionState::Active).unwrap();
        let mut color = StoneColor::Black;
        for i in 0..n {
            s.add_move(Move::place(i as i32 % 9, i as i32 / 9, color));
            color = color.opponent();
        }
        s
    }

    #[test]
    fn test_version_counts_appends() {
        let s = session_with_moves(7);
        assert_eq!(s.version(), 7);
        assert_eq!(s.moves().len(), 7);
        assert_eq!(s.turn(), StoneColor::White);
    }

    #[test]
    fn test_add_move_returns_sequence() {
        let mut s = session();
        s.transition(SessionState::Active).unwrap();
        assert_eq!(s.add_move(Move::place(2, 2, StoneColor::Black)), 1);
        assert_eq!(s.add_move(Move::place(3, 3, StoneColor::White)), 2);
        assert!(s.has_move(2, &Move::place(3, 3, StoneColor::White)));
        assert!(!s.has_move(2, &Move::place(4, 4, StoneColor::White)));
        assert!(!s.has_move(3, &Move::place(3, 3, StoneColor::White)));
        assert!(!s.has_move(0, &Move::place(2, 2, StoneColor::Black)));
    }

    #[test]
    fn test_newer_snapshot_is_adopted() {
        let mut receiver = session_with_moves(3);
        let offer = session_with_moves(5).snapshot();

        assert!(receiver.adopt_snapshot(offer).unwrap());
        assert_eq!(receiver.version(), 5);
    }

    #[test]
    fn test_older_snapshot_never_regresses() {
        let mut receiver = session_with_moves(3);
        let offer = session_with_moves(2).snapshot();

        assert!(!receiver.adopt_snapshot(offer).unwrap());
        assert_eq!(receiver.version(), 3);
        assert_eq!(receiver.moves().len(), 3);
    }

    #[test]
    fn test_equal_snapshot_is_adopted() {
        let mut receiver = session_with_moves(4);
        let offer = session_with_moves(4).snapshot();
        assert!(receiver.adopt_snapshot(offer).unwrap());
        assert_eq!(receiver.version(), 4);
    }

    #[test]
    fn test_unreachable_state_refused() {
        let mut receiver = session_with_moves(4);
        assert_eq!(receiver.state(), SessionState::Active);
        for state in [SessionState::Created, SessionState::Cancelled, SessionState::Declined] {
            let mut offer = session_with_moves(4).snapshot();
            offer.state = state;
            let err = receiver.adopt_snapshot(offer).unwrap_err();
            assert!(matches!(err, ArenaError::InvalidStateTransition { .. }));
        }
        assert_eq!(receiver.state(), SessionState::Active);
        receiver.mark_offer_sent();
        assert!(!receiver.is_synchronized());

        let mut offer = session_with_moves(4).snapshot();
        offer.state = SessionState::Paused;
        assert!(receiver.adopt_snapshot(offer).unwrap());
        assert_eq!(receiver.state(), SessionState::Paused);
    }

    #[test]
    fn test_synchronized_needs_both_directions() {
        let mut a = session_with_moves(4);
        let b = session_with_moves(4);

        // Same version on both sides is not enough
        assert_eq!(a.version(), b.version());
        assert!(!a.is_synchronized());

        a.adopt_snapshot(b.snapshot()).unwrap();
        assert!(!a.is_synchronized());

        a.mark_offer_sent();
        assert!(a.is_synchronized());
    }

    #[test]
    fn test_pause_resets_synchronization() {
        let mut a = session_with_moves(1);
        a.mark_offer_sent();
        a.adopt_snapshot(a.snapshot()).unwrap();
        assert!(a.is_synchronized());

        a.transition(SessionState::Paused).unwrap();
        assert!(!a.is_synchronized());
    }

    #[test]
    fn test_inconsistent_snapshot_rejected() {
        let mut receiver = session_with_moves(1);
        let mut offer = session_with_moves(3).snapshot();
        offer.version = 9;
        assert!(receiver.adopt_snapshot(offer).is_err());

        let mut other_game = session_with_moves(3).snapshot();
        other_game.game_id = GameId::from("g2");
        assert!(receiver.adopt_snapshot(other_game).is_err());
        assert_eq!(receiver.version(), 1);
    }

    #[test]
    fn test_state_machine() {
        let mut s = session();
        assert!(s.transition(SessionState::Paused).is_err());
        s.transition(SessionState::Active).unwrap();
        assert!(s.transition(SessionState::Cancelled).is_err());
        s.transition(SessionState::Paused).unwrap();
        s.transition(SessionState::Active).unwrap();
        s.finish(Some(PeerId::from_name("bob").unwrap())).unwrap();
        assert_eq!(s.state(), SessionState::Finished);
        assert!(s.transition(SessionState::Active).is_err());

        let mut declined = session();
        declined.transition(SessionState::Declined).unwrap();
        assert!(declined.state().is_terminal());
    }

    #[test]
    fn test_two_passes_end_game() {
        let mut s = session_with_moves(2);
        s.add_move(Move::pass(StoneColor::Black));
        assert!(!s.ended_by_passes());
        s.add_move(Move::pass(StoneColor::White));
        assert!(s.ended_by_passes());
    }

    #[test]
    fn test_participants() {
        let s = session();
        let alice = PeerId::from_name("alice").unwrap();
        let bob = PeerId::from_name("bob").unwrap();
        let eve = PeerId::from_name("eve").unwrap();
        assert_eq!(s.color_of(&alice), Some(StoneColor::Black));
        assert_eq!(s.opponent_of(&bob), Some(&alice));
        assert!(!s.is_participant(&eve));
    }

    #[test]
    fn test_budget_deducted_from_mover() {
        let mut s = session();
        s.transition(SessionState::Active).unwrap();
        s.last_move_at_ms = now_ms().saturating_sub(1_000);
        s.add_move(Move::place(0, 0, StoneColor::Black));
        assert!(s.budgets().black_ms <= 599_000);
        assert_eq!(s.budgets().white_ms, 600_000);
    }
}

//! Game sessions: per-match state, its synchronization and collaborators

mod collaborators;
mod game;
mod manager;

pub use collaborators::{
    AiEngine, AiMove, Collaborators, FileStorage, MemoryStorage, MoveOutcome, RandomAi, RuleEngine, RuleEngineFactory,
    ScoreResult, SimpleBoard, Storage,
};
pub use game::{
    GameRecord, GameSession, GameSummary, Move, SessionSnapshot, SessionState, StoneColor, TimeBudgets,
    SNAPSHOT_SCHEMA,
};
pub use manager::{SessionEvent, SessionManager};

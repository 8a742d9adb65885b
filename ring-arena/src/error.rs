/// Error types for the ring-arena library
use thiserror::Error;

/// Result type alias for arena operations
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Errors that can occur in ring-arena operations
#[derive(Debug, Error)]
pub enum ArenaError {
    /// IO error (socket bind, read, write)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame or envelope that does not follow the wire schema
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Remote peer could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// RPC addressed to a service name this node does not serve
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Invalid peer name or id provided
    #[error("Invalid node name: {0}. Must be non-empty and contain no whitespace or /, *, $, ?, #, @")]
    InvalidNodeName(String),

    /// Invalid state transition attempted
    #[error("Invalid state transition: from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Attempted target state
        to: String,
    },

    /// Game id not present in the active-session table
    #[error("Unknown game: {0}")]
    UnknownGame(String),

    /// Peer is not one of the two participants of the game
    #[error("Peer '{peer}' is not a participant of game '{game}'")]
    NotParticipant {
        /// Offending peer id
        peer: String,
        /// Game id
        game: String,
    },

    /// Move refused by the rule engine or out of turn
    #[error("Illegal move: {0}")]
    IllegalMove(String),

    /// Remote side answered with a rejection
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Persistence collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArenaError {
    /// Transport-class failures are soft: the caller logs them and keeps going
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ArenaError::Io(_) | ArenaError::Transport(_) | ArenaError::Timeout(_) | ArenaError::Protocol(_)
        )
    }
}

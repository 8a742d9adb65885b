/// Commands, events and step results of a peer node
use crate::directory::NeighborTable;
use crate::session::{GameRecord, GameSummary, SessionEvent};
use crate::types::{GameId, PeerDescriptor, PeerId};

/// Commands that can be sent to the node
///
/// Each command runs on its own task; its outcome comes back through
/// [`PeerNode::step`](super::PeerNode::step) as a [`NodeEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    /// Flood a JOIN to enter the ring
    Join,
    /// Find a peer by id
    LookupPeer(PeerId),
    /// Find the host of a game
    LookupGame(GameId),
    /// Collect the peers answering an online query
    OnlinePeers,
    /// Invite a peer to a new game we host
    Invite { peer: PeerId, board_size: u8, komi: f32 },
    /// Start a game against the AI
    InviteAi { board_size: u8, komi: f32 },
    Accept(GameId),
    Decline(GameId),
    CancelInvite(GameId),
    Play { game_id: GameId, x: i32, y: i32 },
    Pass(GameId),
    Pause(GameId),
    Surrender(GameId),
    Reconnect(GameId),
    Chat { game_id: GameId, text: String },
    /// Finished games, ours or those of another peer
    History { peer: Option<PeerId>, limit: usize },
    /// Leave the ring and stop the node
    Stop,
}

impl NodeCommand {
    /// Short name used in logs and failure events
    pub fn name(&self) -> &'static str {
        match self {
            NodeCommand::Join => "join",
            NodeCommand::LookupPeer(_) => "lookup_peer",
            NodeCommand::LookupGame(_) => "lookup_game",
            NodeCommand::OnlinePeers => "online_peers",
            NodeCommand::Invite { .. } => "invite",
            NodeCommand::InviteAi { .. } => "invite_ai",
            NodeCommand::Accept(_) => "accept",
            NodeCommand::Decline(_) => "decline",
            NodeCommand::CancelInvite(_) => "cancel_invite",
            NodeCommand::Play { .. } => "play",
            NodeCommand::Pass(_) => "pass",
            NodeCommand::Pause(_) => "pause",
            NodeCommand::Surrender(_) => "surrender",
            NodeCommand::Reconnect(_) => "reconnect",
            NodeCommand::Chat { .. } => "chat",
            NodeCommand::History { .. } => "history",
            NodeCommand::Stop => "stop",
        }
    }
}

/// Something the application should know about
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// The neighbor table changed
    NeighborsChanged(NeighborTable),
    /// Answer to a peer lookup (`None` when nobody answered in time)
    PeerFound { id: PeerId, peer: Option<PeerDescriptor> },
    /// Answer to a game lookup
    GameFound { game_id: GameId, game: Option<GameSummary> },
    OnlinePeers(Vec<PeerDescriptor>),
    /// A game we host was created and the invite delivered
    GameProposed { game_id: GameId, opponent: PeerId },
    History(Vec<GameRecord>),
    Session(SessionEvent),
    /// A command could not be carried out
    CommandFailed { command: &'static str, error: String },
}

/// Result of one [`PeerNode::step`](super::PeerNode::step)
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Event(NodeEvent),
    /// Nothing happened within the step timeout
    Timeout,
    /// The node left the ring and stopped
    Stop,
}

//! Request/response schema of the point-to-point call contract

use serde::{Deserialize, Serialize};

use crate::broadcast::{BroadcastId, BroadcastKind};
use crate::session::{GameRecord, GameSummary, Move, ScoreResult, SessionSnapshot, TimeBudgets};
use crate::types::{GameId, PeerDescriptor, PeerId};

/// Schema version of RPC frames
pub const RPC_SCHEMA: u16 = 1;

/// Why a game was paused or ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Player left the game, it can be resumed later
    Exit,
    /// Player resigned, the game is over
    Surrender,
}

/// Every call a peer can make on another peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum RpcRequest {
    InviteToGame {
        from: PeerDescriptor,
        snapshot: SessionSnapshot,
    },
    CancelInvite {
        game_id: GameId,
        from: PeerId,
    },
    DeclineInvite {
        game_id: GameId,
        from: PeerId,
    },
    JoinRequest {
        requester: PeerDescriptor,
        game_id: GameId,
    },
    SubmitMove {
        game_id: GameId,
        from: PeerId,
        #[serde(rename = "move")]
        mv: Move,
        seq: u64,
    },
    MoveAck {
        game_id: GameId,
        seq: u64,
    },
    ReconnectRequest {
        requester: PeerDescriptor,
        game_id: GameId,
    },
    ReconnectOffer {
        from: PeerDescriptor,
        snapshot: SessionSnapshot,
    },
    NotifyAsSuccessor {
        me: PeerDescriptor,
        next_successor: Option<PeerDescriptor>,
    },
    NotifyAsPredecessor {
        me: PeerDescriptor,
        prev_predecessor: Option<PeerDescriptor>,
    },
    NotifyGamePaused {
        game_id: GameId,
        who: PeerId,
        reason: PauseReason,
        budgets: TimeBudgets,
    },
    SendScoreResult {
        game_id: GameId,
        result: ScoreResult,
    },
    SendChatMessage {
        game_id: GameId,
        sender: PeerId,
        text: String,
    },
    GetGameHistory {
        limit: usize,
    },
    LookupReply {
        broadcast_id: BroadcastId,
        kind: BroadcastKind,
        peer: PeerDescriptor,
        game: Option<GameSummary>,
    },
}

impl RpcRequest {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::InviteToGame { .. } => "invite_to_game",
            RpcRequest::CancelInvite { .. } => "cancel_invite",
            RpcRequest::DeclineInvite { .. } => "decline_invite",
            RpcRequest::JoinRequest { .. } => "join_request",
            RpcRequest::SubmitMove { .. } => "submit_move",
            RpcRequest::MoveAck { .. } => "move_ack",
            RpcRequest::ReconnectRequest { .. } => "reconnect_request",
            RpcRequest::ReconnectOffer { .. } => "reconnect_offer",
            RpcRequest::NotifyAsSuccessor { .. } => "notify_as_successor",
            RpcRequest::NotifyAsPredecessor { .. } => "notify_as_predecessor",
            RpcRequest::NotifyGamePaused { .. } => "notify_game_paused",
            RpcRequest::SendScoreResult { .. } => "send_score_result",
            RpcRequest::SendChatMessage { .. } => "send_chat_message",
            RpcRequest::GetGameHistory { .. } => "get_game_history",
            RpcRequest::LookupReply { .. } => "lookup_reply",
        }
    }
}

/// Answer to an [`RpcRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Ack,
    Rejected { reason: String },
    History { records: Vec<GameRecord> },
}

/// Request as it travels: addressed to a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub schema: u16,
    pub service: String,
    pub request: RpcRequest,
}

/// Response as it travels; `Err` carries a server-side failure description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub schema: u16,
    pub result: std::result::Result<RpcResponse, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_tagged_by_call() {
        let request = RpcRequest::MoveAck {
            game_id: GameId::from("g"),
            seq: 4,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["call"], "move_ack");
        assert_eq!(json["seq"], 4);
        assert_eq!(request.name(), "move_ack");
    }

    #[test]
    fn test_submit_move_field_names() {
        let request = RpcRequest::SubmitMove {
            game_id: GameId::from("g"),
            from: PeerId::from_name("a").unwrap(),
            mv: Move::pass(crate::session::StoneColor::White),
            seq: 9,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["move"]["x"], -1);
        let back: RpcRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_response_frame_error() {
        let frame = ResponseFrame {
            schema: RPC_SCHEMA,
            result: Err("unknown service".to_string()),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ResponseFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.result, Err("unknown service".to_string()));
    }
}

//! Flood envelopes and cancel notices, with their versioned wire schema
//!
//! Every datagram is a JSON object `{"schema": 1, "kind": "envelope" | "cancel", ...}`.
//! Receivers drop anything whose schema or shape they do not recognize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ArenaError, Result};
use crate::types::{now_ms, PeerDescriptor, PeerId};

/// Schema version of broadcast datagrams
pub const WIRE_SCHEMA: u16 = 1;

/// Largest datagram accepted or produced
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// Payload key holding the originator's descriptor (reply address)
pub const PAYLOAD_ORIGIN: &str = "origin";
/// Payload key holding the target peer id of a LOOKUP_PEER
pub const PAYLOAD_TARGET: &str = "target";
/// Payload key holding the game id of a LOOKUP_GAME
pub const PAYLOAD_GAME: &str = "game";

/// Random, collision-resistant broadcast identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastId(String);

impl BroadcastId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        BroadcastId(bs58::encode(uuid.as_bytes()).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BroadcastId {
    fn from(value: &str) -> Self {
        BroadcastId(value.to_string())
    }
}

impl std::fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a flood is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastKind {
    Join,
    LookupPeer,
    LookupGame,
    AskOnline,
}

/// Why a broadcast was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    Responded,
    Timeout,
}

/// A flooded request
///
/// Only `ttl` changes after creation, and only by [`BroadcastEnvelope::relayed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub id: BroadcastId,
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    pub payload: BTreeMap<String, String>,
    pub ttl: u32,
    pub originator: PeerId,
    pub timestamp_ms: u64,
}

impl BroadcastEnvelope {
    /// New envelope originated by `origin`, whose descriptor is embedded as the reply address
    pub fn new(kind: BroadcastKind, origin: &PeerDescriptor, ttl: u32) -> Self {
        let mut envelope = Self {
            id: BroadcastId::generate(),
            kind,
            payload: BTreeMap::new(),
            ttl,
            originator: origin.id.clone(),
            timestamp_ms: now_ms(),
        };
        envelope.put_descriptor(PAYLOAD_ORIGIN, origin);
        envelope
    }

    pub fn with_entry(mut self, key: &str, value: impl Into<String>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn entry(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }

    fn put_descriptor(&mut self, key: &str, peer: &PeerDescriptor) {
        // a descriptor always serializes
        if let Ok(json) = serde_json::to_string(peer) {
            self.payload.insert(key.to_string(), json);
        }
    }

    /// Descriptor of the originating peer, if the payload carries a valid one
    pub fn origin(&self) -> Option<PeerDescriptor> {
        let peer: PeerDescriptor = serde_json::from_str(self.entry(PAYLOAD_ORIGIN)?).ok()?;
        (peer.id == self.originator).then_some(peer)
    }

    /// Copy with one hop consumed
    pub fn relayed(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }
}

/// Suppresses pending handling of a broadcast on every peer it reaches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelNotice {
    pub broadcast_id: BroadcastId,
    pub reason: CancelReason,
    pub responder: PeerId,
}

/// Everything that travels on the broadcast port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Datagram {
    Envelope(BroadcastEnvelope),
    Cancel(CancelNotice),
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    schema: u16,
    #[serde(flatten)]
    datagram: Datagram,
}

impl Datagram {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(&WireFrame {
            schema: WIRE_SCHEMA,
            datagram: self.clone(),
        })?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ArenaError::Protocol(format!(
                "datagram of {} bytes exceeds {}",
                bytes.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame: WireFrame = serde_json::from_slice(bytes)?;
        if frame.schema != WIRE_SCHEMA {
            return Err(ArenaError::Protocol(format!(
                "unsupported datagram schema {}",
                frame.schema
            )));
        }
        Ok(frame.datagram)
    }
}

/// Core identity types for the ring-arena library
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{ArenaError, Result};
use crate::name_generator;

/// Reserved id used as the opponent slot of games played against the AI collaborator
pub const AI_PEER_ID: &str = "ai-engine";

/// Unique peer identifier
///
/// Peers are ordered lexicographically by id on the ring, so the derived
/// `Ord` is the ring order.
/// PeerId must be:
/// - Non-empty UTF-8 string
/// - Free of whitespace and of: / * $ ? # @
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new unique peer id
    /// Uses base58 encoding of a v4 UUID to avoid special characters
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let encoded = bs58::encode(uuid.as_bytes()).into_string();
        PeerId(encoded.chars().take(16).collect())
    }

    /// Create from a specific name, returns error if name contains invalid characters
    pub fn from_name(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(PeerId(name))
    }

    /// The id reserved for the local AI opponent
    pub fn ai() -> Self {
        PeerId(AI_PEER_ID.to_string())
    }

    /// Whether this id designates the AI opponent
    pub fn is_ai(&self) -> bool {
        self.0 == AI_PEER_ID
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<()> {
        if s.is_empty() {
            return Err(ArenaError::InvalidNodeName(
                "Peer id cannot be empty".to_string(),
            ));
        }

        for ch in s.chars() {
            if ch.is_whitespace() || matches!(ch, '/' | '*' | '$' | '?' | '#' | '@') {
                return Err(ArenaError::InvalidNodeName(format!(
                    "Peer id '{}' contains invalid character '{}'",
                    s, ch
                )));
            }
        }

        Ok(())
    }
}

impl TryFrom<String> for PeerId {
    type Error = ArenaError;

    fn try_from(value: String) -> Result<Self> {
        PeerId::from_name(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a peer as it travels in messages
///
/// Assigned once when the node starts and never changed afterwards.
/// `address`/`port`/`service` form the RPC addressing triple; broadcast
/// datagrams go to `address` on the well-known broadcast port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub service: String,
    pub rank: i32,
}

impl PeerDescriptor {
    /// Build a descriptor, generating a display name when none is given
    pub fn new(
        id: PeerId,
        name: Option<String>,
        address: IpAddr,
        port: u16,
        service: impl Into<String>,
        rank: i32,
    ) -> Self {
        Self {
            id,
            name: name.unwrap_or_else(name_generator::generate_display_name),
            address,
            port,
            service: service.into(),
            rank,
        }
    }

    /// Socket address of the peer's RPC endpoint
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl std::fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) @ {}:{}/{}", self.name, self.id, self.address, self.port, self.service)
    }
}

/// Game identifier, generated by the proposing side
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameId(String);

impl GameId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        GameId(bs58::encode(uuid.as_bytes()).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GameId {
    fn from(value: &str) -> Self {
        GameId(value.to_string())
    }
}

impl std::fmt::Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! # ring-arena
//!
//! A serverless peer-to-peer network for playing go, where every peer is
//! both a client and a relay.
//!
//! ## Overview
//!
//! Peers organize themselves on a logical ring ordered by their ids. Each peer
//! keeps two successors and two predecessors; requests that need to reach an
//! unknown peer (joining, finding a peer or a game, listing who is online) are
//! flooded hop by hop with a time-to-live and cancelled once somebody answers.
//! Games are played directly between the two participants over a small RPC
//! contract, and a paused game can be resumed from whichever side holds the
//! most advanced copy.
//!
//! ## Key Features
//!
//! - Ring overlay with neighbor arbitration and leave re-linking
//! - TTL-bounded flood with duplicate suppression, jittered answers and cancellation
//! - Move-by-move session synchronization tolerant to duplicate delivery
//! - Reconnection by snapshot exchange, games against a local AI
//! - In-memory loopback network for running many nodes in one process
//!
//! ## Example
//!
//! ```rust,no_run
//! use ring_arena::{NodeCommand, NodeConfig, PeerNode, StepResult};
//!
//! #[tokio::main]
//! async fn main() -> ring_arena::Result<()> {
//!     let config = NodeConfig::default().with_node_name("Shusaku");
//!     let mut node = PeerNode::builder(config).await?;
//!     node.sender().send(NodeCommand::Join).ok();
//!
//!     loop {
//!         match node.step().await? {
//!             StepResult::Event(event) => println!("{:?}", event),
//!             StepResult::Timeout => continue,
//!             StepResult::Stop => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod broadcast;
pub mod config;
pub mod directory;
pub mod error;
pub mod loopback;
pub mod node;
pub mod ring;
pub mod rpc;
pub mod session;
pub mod stats;
pub mod types;

mod name_generator;

// Re-exports for convenience
pub use config::NodeConfig;
pub use directory::{NeighborRole, NeighborTable, PeerDirectory};
pub use error::{ArenaError, Result};
pub use node::{NodeBuilder, NodeCommand, NodeEvent, PeerNode, StepResult};
pub use session::{GameRecord, GameSummary, Move, SessionEvent, SessionSnapshot, SessionState, StoneColor};
pub use stats::NodeStats;
pub use types::{GameId, PeerDescriptor, PeerId};

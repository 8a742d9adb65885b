//! Node facade: builder, command loop and the glue between the layers

mod builder;
mod context;
mod peer_node;
mod types;

pub use builder::NodeBuilder;
pub use peer_node::PeerNode;
pub use types::{NodeCommand, NodeEvent, StepResult};

//! Flood broadcast over the neighbor links

mod engine;
mod envelope;
mod transport;

pub use engine::{BroadcastEngine, BroadcastResponder, BroadcastSettings, ResponderOutcome};
pub use envelope::{
    BroadcastEnvelope, BroadcastId, BroadcastKind, CancelNotice, CancelReason, Datagram, MAX_DATAGRAM_SIZE,
    PAYLOAD_GAME, PAYLOAD_ORIGIN, PAYLOAD_TARGET, WIRE_SCHEMA,
};
pub use transport::{DatagramTransport, UdpTransport};

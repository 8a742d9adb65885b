//! Point-to-point call contract between peers
//!
//! Requests are addressed by the (address, port, service) triple of a
//! [`PeerDescriptor`](crate::types::PeerDescriptor). Every call is at most once and
//! best effort; callers log failures and carry on.

mod gateway;
mod message;
mod server;
mod transport;

pub use gateway::RpcGateway;
pub use message::{PauseReason, RequestFrame, ResponseFrame, RpcRequest, RpcResponse, RPC_SCHEMA};
pub use server::{serve_frame, RpcHandler, RpcServer};
pub use transport::{read_frame, write_frame, RpcTransport, TcpRpcTransport, MAX_FRAME_SIZE};

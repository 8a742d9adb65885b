//! Request/response transport: length-prefixed JSON frames over TCP
//!
//! ## Framing
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. A connection carries exactly one request frame and one response frame.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::message::{RequestFrame, ResponseFrame, RpcRequest, RpcResponse, RPC_SCHEMA};
use crate::error::{ArenaError, Result};
use crate::types::PeerDescriptor;

/// Largest frame accepted in either direction
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Carries one request to the peer addressed by (address, port, service)
/// and returns its response
pub trait RpcTransport: Send + Sync {
    fn call<'a>(
        &'a self,
        target: &'a PeerDescriptor,
        request: RpcRequest,
    ) -> BoxFuture<'a, Result<RpcResponse>>;
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ArenaError::Protocol(format!(
            "frame of {} bytes exceeds {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ArenaError::Protocol(format!(
            "peer announced a frame of {} bytes",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// TCP implementation of [`RpcTransport`]
#[derive(Debug, Clone)]
pub struct TcpRpcTransport {
    timeout: Duration,
}

impl TcpRpcTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn round_trip(target: &PeerDescriptor, frame: RequestFrame) -> Result<RpcResponse> {
        let mut stream = TcpStream::connect(target.rpc_addr()).await.map_err(|e| {
            ArenaError::Transport(format!("connect to {} failed: {}", target.rpc_addr(), e))
        })?;
        write_frame(&mut stream, &frame).await?;
        let response: ResponseFrame = read_frame(&mut stream).await?;
        if response.schema != RPC_SCHEMA {
            return Err(ArenaError::Protocol(format!(
                "unsupported response schema {}",
                response.schema
            )));
        }
        response.result.map_err(ArenaError::Rejected)
    }
}

impl RpcTransport for TcpRpcTransport {
    fn call<'a>(
        &'a self,
        target: &'a PeerDescriptor,
        request: RpcRequest,
    ) -> BoxFuture<'a, Result<RpcResponse>> {
        Box::pin(async move {
            let name = request.name();
            let frame = RequestFrame {
                schema: RPC_SCHEMA,
                service: target.service.clone(),
                request,
            };
            tokio::time::timeout(self.timeout, Self::round_trip(target, frame))
                .await
                .map_err(|_| {
                    ArenaError::Timeout(format!("{} to '{}' after {:?}", name, target.id, self.timeout))
                })?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GameId, PeerId};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = RequestFrame {
            schema: RPC_SCHEMA,
            service: "go".to_string(),
            request: RpcRequest::MoveAck {
                game_id: GameId::from("g"),
                seq: 2,
            },
        };
        write_frame(&mut client, &frame).await.unwrap();
        let received: RequestFrame = read_frame(&mut server).await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let result: Result<RequestFrame> = read_frame(&mut server).await;
        assert!(matches!(result, Err(ArenaError::Protocol(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_unreachable_peer_is_transport_error() {
        // Bind then drop a listener to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = PeerDescriptor {
            id: PeerId::from_name("ghost").unwrap(),
            name: "ghost".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            port,
            service: "go".to_string(),
            rank: 0,
        };
        let transport = TcpRpcTransport::new(Duration::from_millis(500));
        let result = transport
            .call(&target, RpcRequest::GetGameHistory { limit: 1 })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
    }
}

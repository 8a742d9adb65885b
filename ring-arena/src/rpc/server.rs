//! Inbound side of the RPC contract

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use super::message::{RequestFrame, ResponseFrame, RpcRequest, RpcResponse, RPC_SCHEMA};
use super::transport::{read_frame, write_frame};
use crate::error::{ArenaError, Result};

/// Concurrent inbound connections served at once
const MAX_INBOUND_CONNECTIONS: usize = 64;

/// Receives requests addressed to this node
pub trait RpcHandler: Send + Sync {
    fn handle(&self, request: RpcRequest) -> BoxFuture<'_, Result<RpcResponse>>;
}

/// Check the frame's service/schema and run the handler
///
/// Shared by the TCP server and the in-memory loopback network.
pub async fn serve_frame(service: &str, handler: &dyn RpcHandler, frame: RequestFrame) -> ResponseFrame {
    let result = if frame.schema != RPC_SCHEMA {
        Err(ArenaError::Protocol(format!("unsupported request schema {}", frame.schema)).to_string())
    } else if frame.service != service {
        Err(ArenaError::UnknownService(frame.service).to_string())
    } else {
        let name = frame.request.name();
        handler.handle(frame.request).await.map_err(|e| {
            tracing::debug!("RPC '{}' failed: {}", name, e);
            e.to_string()
        })
    };
    ResponseFrame {
        schema: RPC_SCHEMA,
        result,
    }
}

/// TCP listener dispatching each connection's request to an [`RpcHandler`]
pub struct RpcServer {
    listener: TcpListener,
    service: String,
    permits: Arc<Semaphore>,
    io_timeout: Duration,
}

impl RpcServer {
    /// Bind the listener; failure here is fatal at startup
    ///
    /// `io_timeout` bounds reading the request and writing the response, so an
    /// idle client cannot hold a connection slot.
    pub async fn bind(addr: SocketAddr, service: impl Into<String>, io_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ArenaError::Transport(format!("cannot listen on {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            service: service.into(),
            permits: Arc::new(Semaphore::new(MAX_INBOUND_CONNECTIONS)),
            io_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the task is aborted; per-connection errors are
    /// logged and never end the loop.
    pub async fn run(self, handler: Arc<dyn RpcHandler>) {
        tracing::info!("RPC server for service '{}' listening", self.service);
        let service: Arc<str> = Arc::from(self.service.as_str());
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("RPC accept failed: {}", e);
                    continue;
                }
            };
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let handler = handler.clone();
            let service = service.clone();
            let io_timeout = self.io_timeout;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, &service, handler.as_ref(), io_timeout).await {
                    tracing::debug!("RPC connection from {} dropped: {}", peer_addr, e);
                }
                drop(permit);
            });
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    service: &str,
    handler: &dyn RpcHandler,
    io_timeout: Duration,
) -> Result<()> {
    let frame: RequestFrame = tokio::time::timeout(io_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| ArenaError::Timeout(format!("no request within {:?}", io_timeout)))??;
    let response = serve_frame(service, handler, frame).await;
    tokio::time::timeout(io_timeout, write_frame(&mut stream, &response))
        .await
        .map_err(|_| ArenaError::Timeout(format!("response not written within {:?}", io_timeout)))?
}

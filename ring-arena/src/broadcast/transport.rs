//! Datagram transport carrying envelopes and cancel notices
//!
//! Every node listens on the same well-known port; a datagram addressed to a
//! neighbor goes to `(neighbor.address, broadcast_port)`.

use std::net::{IpAddr, SocketAddr};

use futures::future::BoxFuture;
use tokio::net::UdpSocket;

use super::envelope::MAX_DATAGRAM_SIZE;
use crate::error::{ArenaError, Result};

/// Unreliable unicast of opaque byte blobs between node addresses
pub trait DatagramTransport: Send + Sync {
    fn send_to<'a>(&'a self, bytes: &'a [u8], to: IpAddr) -> BoxFuture<'a, Result<()>>;

    /// Wait for the next datagram and its sender address
    fn recv_from(&self) -> BoxFuture<'_, Result<(Vec<u8>, IpAddr)>>;

    fn local_addr(&self) -> IpAddr;
}

/// UDP implementation of [`DatagramTransport`]
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    address: IpAddr,
    port: u16,
}

impl UdpTransport {
    /// Bind `(address, port)`; a bound port is fatal at startup
    pub async fn bind(address: IpAddr, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(address, port))
            .await
            .map_err(|e| ArenaError::Transport(format!("cannot bind {}:{}: {}", address, port, e)))?;
        let port = socket.local_addr()?.port();
        tracing::info!("Broadcast transport bound to {}:{}", address, port);
        Ok(Self { socket, address, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to<'a>(&'a self, bytes: &'a [u8], to: IpAddr) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.socket.send_to(bytes, SocketAddr::new(to, self.port)).await?;
            Ok(())
        })
    }

    fn recv_from(&self) -> BoxFuture<'_, Result<(Vec<u8>, IpAddr)>> {
        Box::pin(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok((buf, from.ip()))
        })
    }

    fn local_addr(&self) -> IpAddr {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_udp_send_to_self() {
        let transport = UdpTransport::bind("127.0.0.1".parse().unwrap(), 0).await.unwrap();
        transport.send_to(b"ping", transport.local_addr()).await.unwrap();
        let (bytes, from) = transport.recv_from().await.unwrap();
        assert_eq!(bytes, b"ping");
        assert_eq!(from, transport.local_addr());
    }
}

//! In-memory network for running several nodes inside one process
//!
//! Datagrams are routed by destination address through `flume` inboxes, RPC
//! requests go straight to the handler registered for the target's RPC
//! address. Every RPC is recorded so tests can count what was sent.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::broadcast::DatagramTransport;
use crate::error::{ArenaError, Result};
use crate::rpc::{serve_frame, RequestFrame, RpcHandler, RpcRequest, RpcResponse, RpcTransport, RPC_SCHEMA};
use crate::types::{PeerDescriptor, PeerId};

type Inbox = flume::Sender<(Vec<u8>, IpAddr)>;

/// One call observed on the loopback network
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub from: PeerId,
    pub to: PeerId,
    pub request: RpcRequest,
}

struct Endpoint {
    service: String,
    handler: Weak<dyn RpcHandler>,
}

#[derive(Default)]
pub struct LoopbackNetwork {
    inboxes: DashMap<IpAddr, Inbox>,
    endpoints: DashMap<SocketAddr, Endpoint>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Datagram endpoint listening on `address`
    pub fn datagram_endpoint(self: &Arc<Self>, address: IpAddr) -> LoopbackDatagram {
        let (tx, rx) = flume::unbounded();
        self.inboxes.insert(address, tx);
        LoopbackDatagram {
            network: self.clone(),
            address,
            inbox: rx,
        }
    }

    /// RPC transport whose calls are recorded as coming from `local`
    pub fn rpc_transport(self: &Arc<Self>, local: PeerId) -> LoopbackRpc {
        LoopbackRpc {
            network: self.clone(),
            local,
        }
    }

    /// Route calls for `addr` to `handler` while it is alive
    pub fn register_handler(&self, addr: SocketAddr, service: impl Into<String>, handler: Weak<dyn RpcHandler>) {
        self.endpoints.insert(
            addr,
            Endpoint {
                service: service.into(),
                handler,
            },
        );
    }

    /// Take a node off the network, as if its process died
    pub fn disconnect(&self, descriptor: &PeerDescriptor) {
        self.inboxes.remove(&descriptor.address);
        self.endpoints.remove(&descriptor.rpc_addr());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of recorded calls with the given name
    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.request.name() == name).count()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: RecordedCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

/// [`DatagramTransport`] on a [`LoopbackNetwork`]
pub struct LoopbackDatagram {
    network: Arc<LoopbackNetwork>,
    address: IpAddr,
    inbox: flume::Receiver<(Vec<u8>, IpAddr)>,
}

impl DatagramTransport for LoopbackDatagram {
    fn send_to<'a>(&'a self, bytes: &'a [u8], to: IpAddr) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // Unknown destinations swallow the datagram, like UDP
            if let Some(inbox) = self.network.inboxes.get(&to) {
                let _ = inbox.send((bytes.to_vec(), self.address));
            }
            Ok(())
        })
    }

    fn recv_from(&self) -> BoxFuture<'_, Result<(Vec<u8>, IpAddr)>> {
        Box::pin(async move {
            self.inbox
                .recv_async()
                .await
                .map_err(|_| ArenaError::Transport(format!("{} is off the network", self.address)))
        })
    }

    fn local_addr(&self) -> IpAddr {
        self.address
    }
}

/// [`RpcTransport`] on a [`LoopbackNetwork`]
pub struct LoopbackRpc {
    network: Arc<LoopbackNetwork>,
    local: PeerId,
}

impl RpcTransport for LoopbackRpc {
    fn call<'a>(&'a self, target: &'a PeerDescriptor, request: RpcRequest) -> BoxFuture<'a, Result<RpcResponse>> {
        Box::pin(async move {
            self.network.record(RecordedCall {
                from: self.local.clone(),
                to: target.id.clone(),
                request: request.clone(),
            });
            let (service, handler) = match self.network.endpoints.get(&target.rpc_addr()) {
                Some(endpoint) => (endpoint.service.clone(), endpoint.handler.upgrade()),
                None => (String::new(), None),
            };
            let Some(handler) = handler else {
                return Err(ArenaError::Transport(format!("{} unreachable", target.rpc_addr())));
            };
            let frame = RequestFrame {
                schema: RPC_SCHEMA,
                service: target.service.clone(),
                request,
            };
            serve_frame(&service, handler.as_ref(), frame)
                .await
                .result
                .map_err(ArenaError::Rejected)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Acker;

    impl RpcHandler for Acker {
        fn handle(&self, _request: RpcRequest) -> BoxFuture<'_, Result<RpcResponse>> {
            Box::pin(async { Ok(RpcResponse::Ack) })
        }
    }

    fn peer(id: &str, octet: u8) -> PeerDescriptor {
        PeerDescriptor {
            id: PeerId::from_name(id).unwrap(),
            name: id.to_string(),
            address: IpAddr::from([127, 0, 0, octet]),
            port: 9,
            service: "go".to_string(),
            rank: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_rpc_routing_and_recording() {
        let network = LoopbackNetwork::new();
        let target = peer("B", 2);
        let handler: Arc<dyn RpcHandler> = Arc::new(Acker);
        network.register_handler(target.rpc_addr(), "go", Arc::downgrade(&handler));

        let rpc = network.rpc_transport(PeerId::from_name("A").unwrap());
        let response = rpc.call(&target, RpcRequest::GetGameHistory { limit: 1 }).await.unwrap();
        assert_eq!(response, RpcResponse::Ack);
        assert_eq!(network.count("get_game_history"), 1);

        network.disconnect(&target);
        let err = rpc
            .call(&target, RpcRequest::GetGameHistory { limit: 1 })
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(network.calls().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_datagrams_carry_sender_address() {
        let network = LoopbackNetwork::new();
        let a = network.datagram_endpoint(IpAddr::from([127, 0, 0, 1]));
        let b = network.datagram_endpoint(IpAddr::from([127, 0, 0, 2]));
        a.send_to(b"hi", b.local_addr()).await.unwrap();
        a.send_to(b"lost", IpAddr::from([127, 0, 0, 99])).await.unwrap();
        let (bytes, from) = b.recv_from().await.unwrap();
        assert_eq!(bytes, b"hi");
        assert_eq!(from, a.local_addr());
    }
}

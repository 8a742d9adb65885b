use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::context::NodeContext;
use super::peer_node::PeerNode;
use crate::broadcast::{BroadcastEngine, BroadcastResponder, BroadcastSettings, DatagramTransport, UdpTransport};
use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::error::Result;
use crate::loopback::LoopbackNetwork;
use crate::rpc::{RpcGateway, RpcHandler, RpcServer, RpcTransport, TcpRpcTransport};
use crate::session::{AiEngine, Collaborators, FileStorage, RuleEngineFactory, SessionManager, Storage};
use crate::stats::StatsTracker;
use crate::types::{PeerDescriptor, PeerId};

/// Storage key of the persisted identity
const IDENTITY_KEY: &str = "identity";

/// Identity kept across restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIdentity {
    id: PeerId,
    name: String,
}

/// Builder for peer nodes
///
/// Allows configuring the node before starting it; `.await` binds the
/// sockets, spawns the background loops and yields the [`PeerNode`].
#[must_use = "NodeBuilder does nothing unless you `.await` it"]
pub struct NodeBuilder {
    config: NodeConfig,
    collaborators: Collaborators,
    custom_storage: bool,
    network: Option<Arc<LoopbackNetwork>>,
}

impl NodeBuilder {
    pub(crate) fn new(config: NodeConfig) -> Self {
        Self {
            config,
            collaborators: Collaborators::default(),
            custom_storage: false,
            network: None,
        }
    }

    /// Set the display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = Some(name.into());
        self
    }

    /// Set a fixed peer id instead of the persisted or generated one
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = Some(id.into());
        self
    }

    /// Set the step timeout in milliseconds
    pub fn step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.step_timeout_ms = timeout_ms;
        self
    }

    /// Add a seed address used while the node has no neighbor
    pub fn bootstrap(mut self, address: IpAddr) -> Self {
        self.config.bootstrap.push(address);
        self
    }

    /// Persist identity, sessions and history through `storage`
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.collaborators.storage = storage;
        self.custom_storage = true;
        self
    }

    /// Replace the AI opponent; `None` disables games against the AI
    pub fn ai(mut self, ai: Option<Arc<dyn AiEngine>>) -> Self {
        self.collaborators.ai = ai;
        self
    }

    /// Replace the board rules
    pub fn rules(mut self, rules: RuleEngineFactory) -> Self {
        self.collaborators.rules = rules;
        self
    }

    /// Run on an in-memory network instead of UDP and TCP sockets
    pub fn loopback(mut self, network: Arc<LoopbackNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    async fn start(self) -> Result<PeerNode> {
        let NodeBuilder {
            mut config,
            mut collaborators,
            custom_storage,
            network,
        } = self;

        if !custom_storage {
            if let Some(dir) = &config.storage_dir {
                collaborators.storage = Arc::new(FileStorage::open(dir)?);
            }
        }
        let identity = load_identity(&config, collaborators.storage.as_ref())?;

        // The RPC port must be known before the descriptor exists
        let server = match &network {
            Some(_) => None,
            None => {
                let server = RpcServer::bind(
                    (config.bind_address, config.rpc_port).into(),
                    config.service_name.clone(),
                    Duration::from_millis(config.rpc_timeout_ms),
                )
                .await?;
                config.rpc_port = server.local_addr()?.port();
                Some(server)
            }
        };

        let local = PeerDescriptor::new(
            identity.id,
            Some(identity.name),
            config.bind_address,
            config.rpc_port,
            config.service_name.clone(),
            config.rank,
        );

        let (datagrams, rpc): (Arc<dyn DatagramTransport>, Arc<dyn RpcTransport>) = match &network {
            Some(network) => (
                Arc::new(network.datagram_endpoint(config.bind_address)),
                Arc::new(network.rpc_transport(local.id.clone())),
            ),
            None => (
                Arc::new(UdpTransport::bind(config.bind_address, config.broadcast_port).await?),
                Arc::new(TcpRpcTransport::new(Duration::from_millis(config.rpc_timeout_ms))),
            ),
        };

        let stats = Arc::new(StatsTracker::new());
        let directory = Arc::new(PeerDirectory::new(local.clone()));
        let gateway = Arc::new(RpcGateway::start(
            local.clone(),
            rpc,
            config.rpc_workers,
            config.rpc_queue_capacity,
        ));
        let broadcast = Arc::new(BroadcastEngine::new(
            directory.clone(),
            datagrams,
            BroadcastSettings::from_config(&config),
            stats.clone(),
        ));
        let (session_tx, session_rx) = flume::unbounded();
        let sessions = SessionManager::new(
            directory.clone(),
            gateway.clone(),
            collaborators,
            session_tx,
            config.time_budget_ms,
        );
        let context = Arc::new(NodeContext::new(
            config,
            directory,
            gateway,
            broadcast.clone(),
            sessions,
            stats,
        ));

        let responder: Arc<dyn BroadcastResponder> = context.clone();
        let handler: Arc<dyn RpcHandler> = context.clone();
        let mut tasks = vec![tokio::spawn(broadcast.run(responder))];
        match (server, &network) {
            (Some(server), _) => tasks.push(tokio::spawn(server.run(handler))),
            (None, Some(network)) => {
                network.register_handler(local.rpc_addr(), local.service.clone(), Arc::downgrade(&handler))
            }
            (None, None) => {}
        }

        Ok(PeerNode::new_internal(context, session_rx, tasks))
    }
}

impl std::future::IntoFuture for NodeBuilder {
    type Output = Result<PeerNode>;
    type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.start())
    }
}

/// Configured id, else the stored identity, else a fresh one saved for next time
fn load_identity(config: &NodeConfig, storage: &dyn Storage) -> Result<StoredIdentity> {
    if let Some(id) = &config.node_id {
        let id = PeerId::from_name(id.clone())?;
        let name = config.node_name.clone().unwrap_or_else(|| id.to_string());
        return Ok(StoredIdentity { id, name });
    }
    if let Some(bytes) = storage.load(IDENTITY_KEY)? {
        let mut identity: StoredIdentity = serde_json::from_slice(&bytes)?;
        if let Some(name) = &config.node_name {
            identity.name = name.clone();
        }
        tracing::debug!("Reloaded identity '{}'", identity.id);
        return Ok(identity);
    }
    let id = PeerId::generate();
    let name = config
        .node_name
        .clone()
        .unwrap_or_else(crate::name_generator::generate_display_name);
    let identity = StoredIdentity { id, name };
    storage.save(IDENTITY_KEY, &serde_json::to_vec(&identity)?)?;
    tracing::info!("Generated identity '{}' ({})", identity.id, identity.name);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStorage;

    #[test]
    fn test_identity_is_generated_once() {
        let storage = MemoryStorage::new();
        let config = NodeConfig::new();
        let first = load_identity(&config, &storage).unwrap();
        let second = load_identity(&config, &storage).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, second.name);
        assert!(!first.name.is_empty());
    }

    #[test]
    fn test_configured_identity_wins() {
        let storage = MemoryStorage::new();
        let config = NodeConfig::new().with_node_id("fixed");
        let identity = load_identity(&config, &storage).unwrap();
        assert_eq!(identity.id.as_str(), "fixed");
        assert_eq!(identity.name, "fixed");
        assert!(storage.load(IDENTITY_KEY).unwrap().is_none());

        let renamed = load_identity(&NodeConfig::new().with_node_name("Ana"), &storage).unwrap();
        assert_eq!(renamed.name, "Ana");
    }

    #[test]
    fn test_invalid_id_is_refused() {
        let storage = MemoryStorage::new();
        let config = NodeConfig::new().with_node_id("bad id");
        assert!(load_identity(&config, &storage).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_builder_over_sockets() {
        let config = NodeConfig::new()
            .with_node_id("sock")
            .with_rpc_port(0)
            .with_broadcast_port(0);
        let node = PeerNode::builder(config).name("Sock").await.unwrap();
        assert_ne!(node.descriptor().port, 0);
        assert_eq!(node.descriptor().name, "Sock");
        assert_eq!(node.id().as_str(), "sock");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_identity_survives_restart() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let network = LoopbackNetwork::new();
        let first = PeerNode::builder(NodeConfig::new())
            .storage(storage.clone())
            .loopback(network.clone())
            .await
            .unwrap();
        let id = first.id().clone();
        drop(first);
        let second = PeerNode::builder(NodeConfig::new())
            .storage(storage)
            .loopback(network)
            .await
            .unwrap();
        assert_eq!(second.id(), &id);
    }
}

//! Configuration for a peer node

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Well-known UDP port every peer listens on for flood traffic
pub const DEFAULT_BROADCAST_PORT: u16 = 48_620;

/// Default TCP port for the RPC endpoint
pub const DEFAULT_RPC_PORT: u16 = 48_621;

/// Main configuration for a peer node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Optional display name (generated if None)
    pub node_name: Option<String>,

    /// Optional fixed peer id (generated and persisted if None)
    pub node_id: Option<String>,

    /// Address both the broadcast socket and the RPC listener bind to,
    /// also advertised to other peers
    pub bind_address: IpAddr,

    /// TCP port of the RPC endpoint
    pub rpc_port: u16,

    /// Well-known UDP port for broadcast datagrams
    pub broadcast_port: u16,

    /// Service name peers must address RPC calls to
    pub service_name: String,

    /// Player rank advertised in the descriptor
    pub rank: i32,

    /// Hop budget for floods originated by this node
    pub default_ttl: u32,

    /// Lower bound of the responder delay (inclusive)
    pub jitter_min_ms: u64,

    /// Upper bound of the responder delay (exclusive)
    pub jitter_max_ms: u64,

    /// Number of delayed responder tasks allowed to execute at once
    pub responder_pool_size: usize,

    /// Workers draining the outbound RPC queue
    pub rpc_workers: usize,

    /// Capacity of the outbound RPC queue; dispatches beyond it are dropped
    pub rpc_queue_capacity: usize,

    /// Timeout for a single RPC round trip
    pub rpc_timeout_ms: u64,

    /// Wall-clock window of the online-peer query
    pub online_query_window_ms: u64,

    /// Polling interval while waiting for discovery replies
    pub poll_interval_ms: u64,

    /// How long lookups wait for a first reply
    pub lookup_window_ms: u64,

    /// step() returns Timeout when nothing happened within this delay
    pub step_timeout_ms: u64,

    /// Thinking time granted to each side of a new game
    pub time_budget_ms: u64,

    /// Seed addresses flooded to while the neighbor table is empty
    pub bootstrap: Vec<IpAddr>,

    /// Directory for persisted identity and sessions (in-memory when None)
    pub storage_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            node_id: None,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rpc_port: DEFAULT_RPC_PORT,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            service_name: "go-arena".to_string(),
            rank: 0,
            default_ttl: 3,
            jitter_min_ms: 10,
            jitter_max_ms: 500,
            responder_pool_size: 4,
            rpc_workers: 4,
            rpc_queue_capacity: 256,
            rpc_timeout_ms: 3000,
            online_query_window_ms: 1500,
            poll_interval_ms: 50,
            lookup_window_ms: 2000,
            step_timeout_ms: 1000,
            time_budget_ms: 30 * 60 * 1000,
            bootstrap: Vec::new(),
            storage_dir: None,
        }
    }
}

impl NodeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Set the display name
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Set a fixed peer id
    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    /// Set the bind/advertised address
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Set the RPC port
    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    /// Set the broadcast port
    pub fn with_broadcast_port(mut self, port: u16) -> Self {
        self.broadcast_port = port;
        self
    }

    /// Set the service name
    pub fn with_service_name(mut self, service: impl Into<String>) -> Self {
        self.service_name = service.into();
        self
    }

    /// Set the advertised rank
    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    /// Set the TTL of originated floods
    pub fn with_default_ttl(mut self, ttl: u32) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the responder delay range; an empty range collapses to its lower bound
    pub fn with_jitter_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.jitter_min_ms = min_ms;
        self.jitter_max_ms = max_ms.max(min_ms + 1);
        self
    }

    /// Set the online query window
    pub fn with_online_query_window_ms(mut self, window_ms: u64) -> Self {
        self.online_query_window_ms = window_ms;
        self
    }

    /// Set the lookup window
    pub fn with_lookup_window_ms(mut self, window_ms: u64) -> Self {
        self.lookup_window_ms = window_ms;
        self
    }

    /// Set the RPC timeout
    pub fn with_rpc_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = timeout_ms;
        self
    }

    /// Set the step timeout
    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = timeout_ms;
        self
    }

    /// Set the per-side time budget of new games
    pub fn with_time_budget_ms(mut self, budget_ms: u64) -> Self {
        self.time_budget_ms = budget_ms;
        self
    }

    /// Add a bootstrap address
    pub fn with_bootstrap(mut self, address: IpAddr) -> Self {
        self.bootstrap.push(address);
        self
    }

    /// Persist identity and sessions under this directory
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.default_ttl, 3);
        assert_eq!(config.jitter_min_ms, 10);
        assert_eq!(config.jitter_max_ms, 500);
        assert_eq!(config.poll_interval_ms, 50);
        assert!(config.bootstrap.is_empty());
    }

    #[test]
    fn test_jitter_range_never_empty() {
        let config = NodeConfig::new().with_jitter_ms(40, 40);
        assert_eq!(config.jitter_min_ms, 40);
        assert_eq!(config.jitter_max_ms, 41);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"node_name": "alice", "rpc_port": 9100, "bootstrap": ["10.0.0.2"]}"#)
                .unwrap();
        assert_eq!(config.node_name.as_deref(), Some("alice"));
        assert_eq!(config.rpc_port, 9100);
        assert_eq!(config.broadcast_port, DEFAULT_BROADCAST_PORT);
        assert_eq!(config.bootstrap, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("ring-arena-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"service_name": "weiqi", "default_ttl": 5}"#).unwrap();
        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.service_name, "weiqi");
        assert_eq!(config.default_ttl, 5);
        let _ = std::fs::remove_file(path);
    }
}

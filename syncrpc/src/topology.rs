//! Cluster topology: who the local node is and who its peers are.
//!
//! The service reads the topology on every reconnection pass, so a
//! [`Topology`] implementation may change its node list at runtime and the
//! change takes effect on the next pass.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Node, NodeId};

/// Source of cluster membership.
pub trait Topology: Send + Sync + 'static {
    /// Identifier of the local node.
    fn local_node_id(&self) -> NodeId;

    /// All cluster nodes, including the local one.
    fn nodes(&self) -> Vec<Node>;

    /// Address to bind the listener to; `None` binds every interface.
    fn listen_address(&self) -> Option<String>;

    /// Port the local node listens on.
    fn local_port(&self) -> u16;
}

/// Errors produced while loading or validating a [`ClusterConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read cluster config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON for [`ClusterConfig`].
    #[error("failed to parse cluster config: {0}")]
    Parse(#[from] serde_json::Error),

    /// The local node id does not appear in the node list.
    #[error("local node {0} is not part of the node list")]
    MissingLocalNode(NodeId),

    /// Two nodes share an identifier.
    #[error("node id {0} appears more than once")]
    DuplicateNode(NodeId),

    /// A node has port 0.
    #[error("node {0} has no port")]
    MissingPort(NodeId),
}

/// Static cluster membership, usually loaded from a JSON file.
///
/// ```
/// use syncrpc::{ClusterConfig, NodeId, Topology};
///
/// let config = ClusterConfig::from_json_str(r#"{
///     "local_node_id": 2,
///     "nodes": [
///         { "node_id": 1, "hostname": "10.0.0.1", "port": 6642 },
///         { "node_id": 2, "hostname": "10.0.0.2", "port": 6642 }
///     ]
/// }"#).expect("valid config");
///
/// assert_eq!(config.local_node_id(), NodeId(2));
/// assert_eq!(config.local_port(), 6642);
/// assert!(config.listen_address().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifier of the local node.
    pub local_node_id: NodeId,
    /// Optional bind address for the listener.
    #[serde(default)]
    pub listen_address: Option<String>,
    /// Every node in the cluster, the local one included.
    pub nodes: Vec<Node>,
}

impl ClusterConfig {
    /// Build and validate a configuration.
    pub fn new(local_node_id: impl Into<NodeId>, nodes: Vec<Node>) -> Result<Self, ConfigError> {
        let config = Self {
            local_node_id: local_node_id.into(),
            listen_address: None,
            nodes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Bind the listener to a specific address instead of every interface.
    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = Some(address.into());
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check that node ids are unique, ports are set and the local node is listed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id) {
                return Err(ConfigError::DuplicateNode(node.node_id));
            }
            if node.port == 0 {
                return Err(ConfigError::MissingPort(node.node_id));
            }
        }
        if !seen.contains(&self.local_node_id) {
            return Err(ConfigError::MissingLocalNode(self.local_node_id));
        }
        Ok(())
    }

    /// The local node's entry.
    pub fn local_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == self.local_node_id)
    }
}

impl Topology for ClusterConfig {
    fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    fn listen_address(&self) -> Option<String> {
        self.listen_address.clone()
    }

    fn local_port(&self) -> u16 {
        self.local_node().map(|n| n.port).unwrap_or_default()
    }
}

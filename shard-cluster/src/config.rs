//! Cluster membership and shard placement (§3 `ShardRouting`/`ShardPlacement`,
//! §6 `ClusterStateSource`). A `ClusterConfig`/`ClusterRouter` pair, reusing
//! `shard_core::ids::{NodeId, ShardId}` instead of redefining them.

use std::collections::HashMap;
use std::fs;
use std::hash::{BuildHasher, BuildHasherDefault, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};
use shard_core::ids::{NodeId, ShardId};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReadPreference {
    Primary,
    Followers,
    Any,
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::Primary
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub index_name: String,
    pub index_uuid: String,
    pub nodes: Vec<NodeConfig>,
    pub shard_count: u32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    #[serde(default)]
    pub read_preference: ReadPreference,
    /// Explicit shard placements, used for resharding or manual overrides.
    /// When empty, a round-robin scheme is derived from the configured
    /// nodes and replication factor.
    #[serde(default)]
    pub placements: HashMap<u32, ShardPlacement>,
}

fn default_replication_factor() -> u32 {
    1
}

impl ClusterConfig {
    pub fn single_node(index_name: impl Into<String>, index_uuid: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new("local"),
            index_name: index_name.into(),
            index_uuid: index_uuid.into(),
            nodes: vec![NodeConfig { id: NodeId::new("local"), address: "localhost".into() }],
            shard_count: 1,
            replication_factor: 1,
            read_preference: ReadPreference::Primary,
            placements: HashMap::new(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(ClusterError::from)
    }

    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ClusterError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_env_or_default() -> Result<Self, ClusterError> {
        match std::env::var("SHARD_CLUSTER_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_) => Ok(Self::single_node("default", "uuid-0")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub shard_number: u32,
    pub primary: NodeId,
    pub replicas: Vec<NodeId>,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cluster has no nodes configured")]
    EmptyCluster,

    #[error("replication factor must be at least 1")]
    InvalidReplication,

    #[error("shard {0} is not known in the cluster")]
    UnknownShard(u32),

    #[error("node {0} is not part of the configured cluster")]
    UnknownNode(NodeId),

    #[error("shard {shard} is not hosted on node {node}; target node: {target}")]
    NotLocal { shard: u32, node: NodeId, target: NodeId },
}

#[derive(Clone, Debug)]
pub struct ClusterRouter {
    pub node_id: NodeId,
    pub index_name: String,
    pub index_uuid: String,
    pub placements: HashMap<u32, ShardPlacement>,
    pub read_preference: ReadPreference,
}

impl ClusterRouter {
    pub fn from_config(config: ClusterConfig) -> Result<Self, ClusterError> {
        if config.nodes.is_empty() {
            return Err(ClusterError::EmptyCluster);
        }
        if config.replication_factor == 0 {
            return Err(ClusterError::InvalidReplication);
        }

        let mut placements = config.placements.clone();
        if placements.is_empty() {
            let shard_count = config.shard_count.max(1);
            let node_count = config.nodes.len() as u32;
            let replication = config.replication_factor.min(node_count);
            for shard_index in 0..shard_count {
                let primary_index = shard_index % node_count;
                let mut replicas = Vec::new();
                for offset in 1..replication {
                    let idx = (shard_index + offset) % node_count;
                    replicas.push(config.nodes[idx as usize].id.clone());
                }
                placements.insert(
                    shard_index,
                    ShardPlacement {
                        shard_number: shard_index,
                        primary: config.nodes[primary_index as usize].id.clone(),
                        replicas,
                    },
                );
            }
        }

        let known_nodes: HashMap<&NodeId, ()> = config.nodes.iter().map(|n| (&n.id, ())).collect();
        for placement in placements.values() {
            if !known_nodes.contains_key(&placement.primary) {
                return Err(ClusterError::UnknownNode(placement.primary.clone()));
            }
            for replica in &placement.replicas {
                if !known_nodes.contains_key(replica) {
                    return Err(ClusterError::UnknownNode(replica.clone()));
                }
            }
        }

        Ok(Self {
            node_id: config.node_id,
            index_name: config.index_name,
            index_uuid: config.index_uuid,
            placements,
            read_preference: config.read_preference,
        })
    }

    pub fn shard_id(&self, shard_number: u32) -> ShardId {
        ShardId::new(self.index_name.clone(), self.index_uuid.clone(), shard_number)
    }

    pub fn shard_for_key(&self, key: &str) -> u32 {
        let mut hasher = BuildHasherDefault::<ahash::AHasher>::default().build_hasher();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.placements.len() as u64) as u32
    }

    pub fn placement(&self, shard_number: u32) -> Result<ShardPlacement, ClusterError> {
        self.placements.get(&shard_number).cloned().ok_or(ClusterError::UnknownShard(shard_number))
    }

    pub fn ensure_primary(&self, shard_number: u32) -> Result<(), ClusterError> {
        let placement = self.placement(shard_number)?;
        if placement.primary == self.node_id {
            Ok(())
        } else {
            Err(ClusterError::NotLocal { shard: shard_number, node: self.node_id.clone(), target: placement.primary })
        }
    }
}

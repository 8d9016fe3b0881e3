//! Topology description and builder
//!
//! The topology is read once from configuration and turned into a tree of
//! controllers. Unnamed replica sets are named `rs0`, `rs1`, ... by a counter
//! that lives in one [`TopologyBuilder`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::cluster::{
    ClusterComponent, ClusterContext, Node, NodeRole, ReplicaSet, ShardUnit, ShardedCluster,
};
use crate::error::{ClusterError, ClusterResult};
use crate::host::HostInfo;

/// One top-level cluster description, tagged by `cluster_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cluster_type", rename_all = "snake_case")]
pub enum ClusterTopology {
    Standalone(NodeSpec),
    Replset(ReplicaSetSpec),
    #[serde(alias = "shardedCluster")]
    ShardedCluster(ShardedClusterSpec),
}

/// One node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub public_ip: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    /// Product config document for this node
    #[serde(default)]
    pub config_file: Value,
    /// Overrides the global `mongo_dir`
    #[serde(default)]
    pub mongo_dir: Option<String>,
    #[serde(default)]
    pub clean_logs: Option<bool>,
    #[serde(default)]
    pub clean_db_dir: Option<bool>,
    /// Fragment merged into this member's replica set entry (e.g. `priority`)
    #[serde(default)]
    pub rs_conf_member: Map<String, Value>,
}

impl NodeSpec {
    pub fn private_ip(&self) -> &str {
        self.private_ip.as_deref().unwrap_or(&self.public_ip)
    }

    pub fn host_info(&self) -> HostInfo {
        HostInfo {
            public_ip: self.public_ip.clone(),
            private_ip: Some(self.private_ip().to_string()),
            alias: self.alias.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub configsvr: bool,
    /// Fragment merged into the replica set configuration document
    #[serde(default)]
    pub rs_conf: Map<String, Value>,
    #[serde(alias = "node")]
    pub mongod: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardedClusterSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_disable_balancer")]
    pub disable_balancer: bool,
    #[serde(default = "default_configsvr_type")]
    pub configsvr_type: String,
    pub configsvr: Vec<NodeSpec>,
    pub shard: Vec<ClusterTopology>,
    pub mongos: Vec<NodeSpec>,
}

fn default_disable_balancer() -> bool {
    true
}

fn default_configsvr_type() -> String {
    "csrs".to_string()
}

/// Builds controllers from topology descriptions
pub struct TopologyBuilder {
    context: Arc<ClusterContext>,
    replica_sets: usize,
}

impl TopologyBuilder {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        Self {
            context,
            replica_sets: 0,
        }
    }

    /// Build every top-level cluster
    pub fn build_all(
        &mut self,
        topologies: &[ClusterTopology],
    ) -> ClusterResult<Vec<ClusterComponent>> {
        topologies.iter().map(|topology| self.build(topology)).collect()
    }

    pub fn build(&mut self, topology: &ClusterTopology) -> ClusterResult<ClusterComponent> {
        match topology {
            ClusterTopology::Standalone(spec) => {
                info!("creating topology: standalone");
                Ok(ClusterComponent::Node(Arc::new(self.standalone(spec)?)))
            }
            ClusterTopology::Replset(spec) => {
                info!("creating topology: replset");
                Ok(ClusterComponent::ReplicaSet(Arc::new(self.replica_set(spec)?)))
            }
            ClusterTopology::ShardedCluster(spec) => {
                info!("creating topology: sharded_cluster");
                Ok(ClusterComponent::Sharded(Arc::new(self.sharded(spec)?)))
            }
        }
    }

    fn standalone(&self, spec: &NodeSpec) -> ClusterResult<Node> {
        Node::new(
            spec,
            NodeRole::Standalone,
            spec.config_file.clone(),
            Arc::clone(&self.context),
        )
    }

    /// Explicit id, or the next `rs<N>` name
    fn replica_set_id(&mut self, id: Option<&str>) -> String {
        match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = format!("rs{}", self.replica_sets);
                self.replica_sets += 1;
                id
            }
        }
    }

    fn replica_set(&mut self, spec: &ReplicaSetSpec) -> ClusterResult<ReplicaSet> {
        let id = self.replica_set_id(spec.id.as_deref());
        ReplicaSet::new(
            id,
            spec.configsvr,
            &spec.mongod,
            spec.rs_conf.clone(),
            Arc::clone(&self.context),
        )
    }

    fn sharded(&mut self, spec: &ShardedClusterSpec) -> ClusterResult<ShardedCluster> {
        if spec.configsvr_type != "csrs" {
            return Err(ClusterError::UnsupportedTopology(format!(
                "configsvr_type: {}",
                spec.configsvr_type
            )));
        }
        if self.context.product.replication().is_none() {
            return Err(ClusterError::UnsupportedTopology(
                "sharded clusters need a product with a replication protocol".to_string(),
            ));
        }

        let mut shards = Vec::with_capacity(spec.shard.len());
        for shard in &spec.shard {
            shards.push(match shard {
                ClusterTopology::Standalone(node) => {
                    ShardUnit::Node(Arc::new(self.standalone(node)?))
                }
                ClusterTopology::Replset(set) => {
                    ShardUnit::ReplicaSet(Arc::new(self.replica_set(set)?))
                }
                ClusterTopology::ShardedCluster(_) => {
                    return Err(ClusterError::UnsupportedTopology(
                        "a shard cannot itself be a sharded cluster".to_string(),
                    ));
                }
            });
        }

        ShardedCluster::new(
            spec.id.clone(),
            &spec.configsvr,
            shards,
            &spec.mongos,
            spec.disable_balancer,
            Arc::clone(&self.context),
        )
    }
}

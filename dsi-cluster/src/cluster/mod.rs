//! Cluster controllers
//!
//! Lifecycle of the three cluster shapes:
//! - [`Node`]: one process on one host
//! - [`ReplicaSet`]: members bootstrapped into one replica set
//! - [`ShardedCluster`]: config set, shards and routers
//!
//! Lifecycle operations report failure as `false` and never panic. Every
//! operation takes a [`NodeFilter`]; nodes outside the filter succeed without
//! touching their host.

pub mod node;
pub mod replica_set;
pub mod sharded;

pub use node::{GracefulOutcome, Node};
pub use replica_set::ReplicaSet;
pub use sharded::{ShardUnit, ShardedCluster};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::config::{PollingConfig, SetupConfig};
use crate::error::ClusterResult;
use crate::host::{Credentials, HostFactory};
use crate::product::{Product, build_product};

/// Role a node plays in its topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Standalone,
    /// Member of the config server replica set
    ConfigMember,
    /// Member of a data-bearing replica set
    ShardMember,
    Router,
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unconfigured,
    HostPrepared,
    Launched,
    Up,
    ShuttingDown,
    Stopped,
    Destroyed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Unconfigured => "unconfigured",
            NodeState::HostPrepared => "host-prepared",
            NodeState::Launched => "launched",
            NodeState::Up => "up",
            NodeState::ShuttingDown => "shutting-down",
            NodeState::Stopped => "stopped",
            NodeState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Set of node/group ids an operation is restricted to
///
/// The default filter admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    ids: Option<BTreeSet<String>>,
}

impl NodeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_all(&self) -> bool {
        self.ids.is_none()
    }

    /// Whether a node with this id takes part. Nodes without an id only
    /// take part when the filter admits everything.
    pub fn admits(&self, id: Option<&str>) -> bool {
        match (&self.ids, id) {
            (None, _) => true,
            (Some(ids), Some(id)) => ids.contains(id),
            (Some(_), None) => false,
        }
    }

    /// Filter for the members of a group: everything when the group's own id
    /// is listed, otherwise unchanged
    pub fn widen_for(&self, group_id: Option<&str>) -> NodeFilter {
        match (&self.ids, group_id) {
            (Some(ids), Some(id)) if ids.contains(id) => NodeFilter::all(),
            _ => self.clone(),
        }
    }
}

impl From<Option<Vec<String>>> for NodeFilter {
    fn from(ids: Option<Vec<String>>) -> Self {
        match ids {
            Some(ids) => NodeFilter::only(ids),
            None => NodeFilter::all(),
        }
    }
}

/// Options for `launch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Run the bootstrap protocol (initiate replica sets, add shards)
    pub initialize: bool,
    /// Prefix the launch command with the numactl wrapper
    pub use_numactl: bool,
    pub enable_auth: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            initialize: true,
            use_numactl: true,
            enable_auth: false,
        }
    }
}

/// Settings shared by every controller in one topology
pub struct ClusterContext {
    pub product: Arc<dyn Product>,
    pub hosts: Arc<dyn HostFactory>,
    pub numactl_prefix: Vec<String>,
    pub polling: PollingConfig,
    /// Bound for the graceful shutdown issued after a failed launch
    pub shutdown_timeout: Duration,
    pub credentials: Credentials,
    pub clean_logs: bool,
    pub clean_db_dir: bool,
}

impl ClusterContext {
    pub fn from_config(config: &SetupConfig, hosts: Arc<dyn HostFactory>) -> ClusterResult<Self> {
        Ok(Self {
            product: build_product(config)?,
            hosts,
            numactl_prefix: config.numactl_prefix.tokens().to_vec(),
            polling: config.polling.clone(),
            shutdown_timeout: config.timeouts.shutdown(),
            credentials: config.authentication.credentials(),
            clean_logs: config.clean_logs,
            clean_db_dir: config.clean_db_dir,
        })
    }
}

/// One top-level cluster of any shape
#[derive(Clone)]
pub enum ClusterComponent {
    Node(Arc<Node>),
    ReplicaSet(Arc<ReplicaSet>),
    Sharded(Arc<ShardedCluster>),
}

impl ClusterComponent {
    pub fn id(&self) -> Option<&str> {
        match self {
            ClusterComponent::Node(node) => node.id(),
            ClusterComponent::ReplicaSet(set) => Some(set.id()),
            ClusterComponent::Sharded(cluster) => cluster.id(),
        }
    }

    pub async fn setup_host(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> bool {
        match self {
            ClusterComponent::Node(node) => node.setup_host(clean_db_dir, clean_logs, filter).await,
            ClusterComponent::ReplicaSet(set) => {
                set.setup_host(clean_db_dir, clean_logs, filter).await
            }
            ClusterComponent::Sharded(cluster) => {
                cluster.setup_host(clean_db_dir, clean_logs, filter).await
            }
        }
    }

    pub async fn launch(&self, options: LaunchOptions, filter: &NodeFilter) -> bool {
        match self {
            ClusterComponent::Node(node) => node.launch(options, filter).await,
            ClusterComponent::ReplicaSet(set) => set.launch(options, filter).await,
            ClusterComponent::Sharded(cluster) => cluster.launch(options, filter).await,
        }
    }

    /// `setup_host` followed by `launch`
    pub async fn start(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        options: LaunchOptions,
        filter: &NodeFilter,
    ) -> bool {
        if !self.setup_host(clean_db_dir, clean_logs, filter).await {
            error!("Could not set up hosts for {}", self);
            return false;
        }
        if !self.launch(options, filter).await {
            error!("Could not launch {}", self);
            return false;
        }
        true
    }

    pub async fn wait_until_up(&self) -> bool {
        match self {
            ClusterComponent::Node(node) => node.wait_until_up().await,
            ClusterComponent::ReplicaSet(set) => set.wait_until_up().await,
            ClusterComponent::Sharded(cluster) => cluster.wait_until_up().await,
        }
    }

    pub async fn shutdown(
        &self,
        max_time: Duration,
        auth_enabled: Option<bool>,
        retries: u32,
        filter: &NodeFilter,
    ) -> bool {
        match self {
            ClusterComponent::Node(node) => {
                node.shutdown(max_time, auth_enabled, retries, filter).await
            }
            ClusterComponent::ReplicaSet(set) => {
                set.shutdown(max_time, auth_enabled, retries, filter).await
            }
            ClusterComponent::Sharded(cluster) => {
                cluster.shutdown(max_time, auth_enabled, retries, filter).await
            }
        }
    }

    pub async fn destroy(&self, max_time: Duration, filter: &NodeFilter) -> bool {
        match self {
            ClusterComponent::Node(node) => node.destroy(max_time, filter).await,
            ClusterComponent::ReplicaSet(set) => set.destroy(max_time, filter).await,
            ClusterComponent::Sharded(cluster) => cluster.destroy(max_time, filter).await,
        }
    }

    pub async fn add_default_users(&self) -> bool {
        match self {
            ClusterComponent::Node(node) => node.create_user(None).await,
            ClusterComponent::ReplicaSet(set) => set.add_default_users().await,
            ClusterComponent::Sharded(cluster) => cluster.add_default_users().await,
        }
    }

    pub async fn close(&self) {
        match self {
            ClusterComponent::Node(node) => node.close().await,
            ClusterComponent::ReplicaSet(set) => set.close().await,
            ClusterComponent::Sharded(cluster) => cluster.close().await,
        }
    }

    /// Every node in the cluster, in declaration order
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        match self {
            ClusterComponent::Node(node) => vec![Arc::clone(node)],
            ClusterComponent::ReplicaSet(set) => set.nodes().to_vec(),
            ClusterComponent::Sharded(cluster) => cluster.nodes(),
        }
    }
}

impl fmt::Display for ClusterComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterComponent::Node(node) => write!(f, "{}", node),
            ClusterComponent::ReplicaSet(set) => write!(f, "{}", set),
            ClusterComponent::Sharded(cluster) => write!(f, "{}", cluster),
        }
    }
}

//! Sharded-cluster controller
//!
//! Launch order:
//! 1. Config server replica set (no numactl wrapper), shards and routers,
//!    all joined before going further
//! 2. Add every shard through the first router, in declaration order
//! 3. Stop the balancer when it is disabled
//! 4. Wait until every router sees every shard
//!
//! Teardown runs over all three groups in parallel.

use futures_util::FutureExt;
use serde_json::Map;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::{ClusterContext, LaunchOptions, Node, NodeFilter, NodeRole, ReplicaSet};
use crate::error::{ClusterError, ClusterResult};
use crate::fanout::{self, Action, poll_until};
use crate::topology::NodeSpec;

/// Replica set name of the config servers
pub const CONFIG_SET_NAME: &str = "configSvrRS";

/// One shard of a sharded cluster
#[derive(Clone)]
pub enum ShardUnit {
    Node(Arc<Node>),
    ReplicaSet(Arc<ReplicaSet>),
}

impl ShardUnit {
    pub fn id(&self) -> Option<&str> {
        match self {
            ShardUnit::Node(node) => node.id(),
            ShardUnit::ReplicaSet(set) => Some(set.id()),
        }
    }

    pub fn connection_string_private(&self) -> String {
        match self {
            ShardUnit::Node(node) => node.connection_string_private(),
            ShardUnit::ReplicaSet(set) => set.connection_string_private(),
        }
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        match self {
            ShardUnit::Node(node) => vec![Arc::clone(node)],
            ShardUnit::ReplicaSet(set) => set.nodes().to_vec(),
        }
    }

    fn setup_host(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: NodeFilter,
    ) -> Action {
        match self.clone() {
            ShardUnit::Node(node) => {
                async move { node.setup_host(clean_db_dir, clean_logs, &filter).await }.boxed()
            }
            ShardUnit::ReplicaSet(set) => {
                async move { set.setup_host(clean_db_dir, clean_logs, &filter).await }.boxed()
            }
        }
    }

    fn launch(&self, options: LaunchOptions, filter: NodeFilter) -> Action {
        match self.clone() {
            ShardUnit::Node(node) => async move { node.launch(options, &filter).await }.boxed(),
            ShardUnit::ReplicaSet(set) => async move { set.launch(options, &filter).await }.boxed(),
        }
    }

    fn shutdown(
        &self,
        max_time: Duration,
        auth_enabled: Option<bool>,
        retries: u32,
        filter: NodeFilter,
    ) -> Action {
        match self.clone() {
            ShardUnit::Node(node) => {
                async move { node.shutdown(max_time, auth_enabled, retries, &filter).await }
                    .boxed()
            }
            ShardUnit::ReplicaSet(set) => {
                async move { set.shutdown(max_time, auth_enabled, retries, &filter).await }.boxed()
            }
        }
    }

    fn destroy(&self, max_time: Duration, filter: NodeFilter) -> Action {
        match self.clone() {
            ShardUnit::Node(node) => async move { node.destroy(max_time, &filter).await }.boxed(),
            ShardUnit::ReplicaSet(set) => {
                async move { set.destroy(max_time, &filter).await }.boxed()
            }
        }
    }

    async fn add_default_users(&self) -> bool {
        match self {
            ShardUnit::Node(node) => node.create_user(None).await,
            ShardUnit::ReplicaSet(set) => set.add_default_users().await,
        }
    }

    fn close(&self) -> Action {
        match self.clone() {
            ShardUnit::Node(node) => async move {
                node.close().await;
                true
            }
            .boxed(),
            ShardUnit::ReplicaSet(set) => async move {
                set.close().await;
                true
            }
            .boxed(),
        }
    }
}

impl fmt::Display for ShardUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardUnit::Node(node) => write!(f, "{}", node),
            ShardUnit::ReplicaSet(set) => write!(f, "{}", set),
        }
    }
}

pub struct ShardedCluster {
    id: Option<String>,
    config_set: Arc<ReplicaSet>,
    shards: Vec<ShardUnit>,
    routers: Vec<Arc<Node>>,
    disable_balancer: bool,
    context: Arc<ClusterContext>,
}

impl ShardedCluster {
    /// Build the cluster around already-built shards
    ///
    /// Routers are built here so their config can point at the config set.
    pub fn new(
        id: Option<String>,
        config_servers: &[NodeSpec],
        shards: Vec<ShardUnit>,
        routers: &[NodeSpec],
        disable_balancer: bool,
        context: Arc<ClusterContext>,
    ) -> ClusterResult<Self> {
        let Some(protocol) = context.product.replication() else {
            return Err(ClusterError::UnsupportedTopology(
                "sharded clusters need a product with a replication protocol".to_string(),
            ));
        };
        if shards.is_empty() {
            return Err(ClusterError::config(
                "sharded cluster needs at least one shard",
            ));
        }
        if routers.is_empty() {
            return Err(ClusterError::config(
                "sharded cluster needs at least one router",
            ));
        }

        let config_set = Arc::new(ReplicaSet::new(
            CONFIG_SET_NAME.to_string(),
            true,
            config_servers,
            Map::new(),
            Arc::clone(&context),
        )?);

        let config_db = config_set.connection_string_private();
        let mut router_nodes = Vec::with_capacity(routers.len());
        for spec in routers {
            let mut config = spec.config_file.clone();
            protocol.configure_router(&mut config, &config_db);
            router_nodes.push(Arc::new(Node::new(
                spec,
                NodeRole::Router,
                config,
                Arc::clone(&context),
            )?));
        }

        Ok(Self {
            id,
            config_set,
            shards,
            routers: router_nodes,
            disable_balancer,
            context,
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn config_set(&self) -> &Arc<ReplicaSet> {
        &self.config_set
    }

    pub fn shards(&self) -> &[ShardUnit] {
        &self.shards
    }

    pub fn routers(&self) -> &[Arc<Node>] {
        &self.routers
    }

    pub fn disable_balancer(&self) -> bool {
        self.disable_balancer
    }

    /// Config servers, shard members and routers
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes = self.config_set.nodes().to_vec();
        for shard in &self.shards {
            nodes.extend(shard.nodes());
        }
        nodes.extend(self.routers.iter().cloned());
        nodes
    }

    fn first_router(&self) -> &Arc<Node> {
        &self.routers[0]
    }

    fn router_actions<F>(&self, mut make: F) -> Vec<Action>
    where
        F: FnMut(Arc<Node>) -> Action,
    {
        self.routers
            .iter()
            .map(|router| make(Arc::clone(router)))
            .collect()
    }

    pub async fn setup_host(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> bool {
        let filter = filter.widen_for(self.id());

        let mut actions: Vec<Action> = Vec::new();
        let config_set = Arc::clone(&self.config_set);
        let config_filter = filter.clone();
        actions.push(
            async move {
                config_set
                    .setup_host(clean_db_dir, clean_logs, &config_filter)
                    .await
            }
            .boxed(),
        );
        for shard in &self.shards {
            actions.push(shard.setup_host(clean_db_dir, clean_logs, filter.clone()));
        }
        actions.extend(self.router_actions(|router| {
            let filter = filter.clone();
            async move { router.setup_host(clean_db_dir, clean_logs, &filter).await }.boxed()
        }));

        fanout::run_all(actions).await
    }

    /// Launch all groups, register shards, then wait for the routers
    pub async fn launch(&self, options: LaunchOptions, filter: &NodeFilter) -> bool {
        let filter = filter.widen_for(self.id());
        info!("Launching sharded cluster...");

        let mut actions: Vec<Action> = Vec::new();
        let config_set = Arc::clone(&self.config_set);
        let config_filter = filter.clone();
        let config_options = LaunchOptions {
            use_numactl: false,
            ..options
        };
        actions.push(
            async move { config_set.launch(config_options, &config_filter).await }.boxed(),
        );
        for shard in &self.shards {
            actions.push(shard.launch(options, filter.clone()));
        }
        actions.extend(self.router_actions(|router| {
            let filter = filter.clone();
            async move { router.launch(options, &filter).await }.boxed()
        }));

        if !fanout::run_all(actions).await {
            error!("Could not launch every part of the sharded cluster, shutting it down");
            self.shutdown_after_failure(&filter).await;
            return false;
        }

        if options.initialize && !self.add_shards().await {
            self.shutdown_after_failure(&filter).await;
            return false;
        }

        if self.disable_balancer && !self.stop_balancer().await {
            self.shutdown_after_failure(&filter).await;
            return false;
        }

        if !self.wait_until_up().await {
            self.shutdown_after_failure(&filter).await;
            return false;
        }
        true
    }

    async fn shutdown_after_failure(&self, filter: &NodeFilter) {
        self.shutdown(
            self.context.shutdown_timeout,
            None,
            self.context.polling.shutdown_retries,
            filter,
        )
        .await;
    }

    /// Register each shard through the first router, in declaration order
    async fn add_shards(&self) -> bool {
        let Some(protocol) = self.context.product.replication() else {
            return false;
        };
        info!("Configuring sharded cluster...");

        let router = self.first_router();
        for shard in &self.shards {
            let script = protocol.add_shard_script(&shard.connection_string_private());
            if !router.run_control_script(&script, None, true).await {
                error!("Failed to add shard {}", shard);
                return false;
            }
        }
        true
    }

    async fn stop_balancer(&self) -> bool {
        let Some(protocol) = self.context.product.replication() else {
            return false;
        };
        let stopped = self
            .first_router()
            .run_control_script(&protocol.stop_balancer_script(), None, true)
            .await;
        if !stopped {
            error!("Failed to stop the balancer");
        }
        stopped
    }

    /// Wait until every router sees every shard
    pub async fn wait_until_up(&self) -> bool {
        let Some(protocol) = self.context.product.replication() else {
            return false;
        };

        let script = protocol.shard_count_script(self.shards.len());
        for router in &self.routers {
            let what = format!("{} shards on router {}", self.shards.len(), router);
            let converged = poll_until(self.context.polling.shard_count, &what, |_| {
                router.run_control_script(&script, None, false)
            })
            .await;
            if let Err(e) = converged {
                error!("Router {} does not see every shard: {}", router, e);
                return false;
            }
        }
        true
    }

    pub async fn shutdown(
        &self,
        max_time: Duration,
        auth_enabled: Option<bool>,
        retries: u32,
        filter: &NodeFilter,
    ) -> bool {
        let filter = filter.widen_for(self.id());

        let mut actions: Vec<Action> = self
            .shards
            .iter()
            .map(|shard| shard.shutdown(max_time, auth_enabled, retries, filter.clone()))
            .collect();
        let config_set = Arc::clone(&self.config_set);
        let config_filter = filter.clone();
        actions.push(
            async move {
                config_set
                    .shutdown(max_time, auth_enabled, retries, &config_filter)
                    .await
            }
            .boxed(),
        );
        actions.extend(self.router_actions(|router| {
            let filter = filter.clone();
            async move { router.shutdown(max_time, auth_enabled, retries, &filter).await }.boxed()
        }));

        fanout::run_all(actions).await
    }

    pub async fn destroy(&self, max_time: Duration, filter: &NodeFilter) -> bool {
        let filter = filter.widen_for(self.id());

        let mut actions: Vec<Action> = self
            .shards
            .iter()
            .map(|shard| shard.destroy(max_time, filter.clone()))
            .collect();
        let config_set = Arc::clone(&self.config_set);
        let config_filter = filter.clone();
        actions.push(async move { config_set.destroy(max_time, &config_filter).await }.boxed());
        actions.extend(self.router_actions(|router| {
            let filter = filter.clone();
            async move { router.destroy(max_time, &filter).await }.boxed()
        }));

        fanout::spawn_detached(actions).join().await
    }

    /// Create the admin user on the routers, the config set and every shard
    pub async fn add_default_users(&self) -> bool {
        if !self.first_router().create_user(None).await {
            return false;
        }
        if !self.config_set.add_default_users().await {
            return false;
        }
        for shard in &self.shards {
            if !shard.add_default_users().await {
                return false;
            }
        }
        true
    }

    pub async fn close(&self) {
        let mut actions: Vec<Action> = self.shards.iter().map(ShardUnit::close).collect();
        let config_set = Arc::clone(&self.config_set);
        actions.push(
            async move {
                config_set.close().await;
                true
            }
            .boxed(),
        );
        actions.extend(self.router_actions(|router| {
            async move {
                router.close().await;
                true
            }
            .boxed()
        }));
        fanout::spawn_detached(actions).join().await;
    }
}

impl fmt::Display for ShardedCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardedCluster: configsvr: {}", self.config_set)?;
        for shard in &self.shards {
            write!(f, "; shard: {}", shard)?;
        }
        for router in &self.routers {
            write!(f, "; {}", router)?;
        }
        Ok(())
    }
}

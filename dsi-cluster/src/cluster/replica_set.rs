//! Replica-set controller
//!
//! Bootstrap after every member has launched:
//! 1. Assign explicit priorities (first member preferred when none is given)
//! 2. Initiate the set through the preferred primary
//! 3. Wait for the preferred primary to become primary
//! 4. Wait for every member to be primary or secondary
//!
//! Products without a replication protocol skip straight to waiting for
//! every member to be up.

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::{ClusterContext, LaunchOptions, Node, NodeFilter, NodeRole};
use crate::error::{ClusterError, ClusterResult};
use crate::fanout::{self, Action, poll_until};
use crate::product::merge_documents;
use crate::topology::NodeSpec;

/// Priority every member ends up with unless it is the preferred primary
pub const BASE_PRIORITY: i64 = 1;

pub struct ReplicaSet {
    id: String,
    configsvr: bool,
    nodes: Vec<Arc<Node>>,
    /// Per-member config fragments, parallel to `nodes`
    members: RwLock<Vec<Map<String, Value>>>,
    rs_conf: Map<String, Value>,
    context: Arc<ClusterContext>,
}

impl ReplicaSet {
    pub fn new(
        id: String,
        configsvr: bool,
        members: &[NodeSpec],
        rs_conf: Map<String, Value>,
        context: Arc<ClusterContext>,
    ) -> ClusterResult<Self> {
        if members.is_empty() {
            return Err(ClusterError::config(format!(
                "replica set {} needs at least one member",
                id
            )));
        }

        let role = if configsvr {
            NodeRole::ConfigMember
        } else {
            NodeRole::ShardMember
        };

        let mut nodes = Vec::with_capacity(members.len());
        let mut member_confs = Vec::with_capacity(members.len());
        for spec in members {
            let mut config = spec.config_file.clone();
            if let Some(protocol) = context.product.replication() {
                protocol.configure_member(&mut config, &id, configsvr);
            }
            nodes.push(Arc::new(Node::new(spec, role, config, Arc::clone(&context))?));
            member_confs.push(spec.rs_conf_member.clone());
        }

        Ok(Self {
            id,
            configsvr,
            nodes,
            members: RwLock::new(member_confs),
            rs_conf,
            context,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_configsvr(&self) -> bool {
        self.configsvr
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Member config fragments as they stand
    pub fn member_configs(&self) -> Vec<Map<String, Value>> {
        self.members.read().clone()
    }

    /// Member with the highest explicit priority, first member on ties
    pub fn preferred_primary(&self) -> &Arc<Node> {
        let members = self.members.read();
        let mut best = 0;
        let mut best_priority: Option<f64> = None;
        for (i, member) in members.iter().enumerate() {
            if let Some(priority) = member.get("priority").and_then(Value::as_f64) {
                if best_priority.is_none_or(|current| priority > current) {
                    best = i;
                    best_priority = Some(priority);
                }
            }
        }
        &self.nodes[best]
    }

    /// Give every member an explicit priority
    pub fn assign_priorities(&self) {
        let mut members = self.members.write();
        if !members.iter().any(|member| member.contains_key("priority")) {
            if let Some(first) = members.first_mut() {
                first.insert("priority".to_string(), json!(BASE_PRIORITY + 1));
            }
        }
        for member in members.iter_mut() {
            member
                .entry("priority")
                .or_insert_with(|| json!(BASE_PRIORITY));
        }
    }

    /// Replica set configuration document passed to initiation
    pub fn membership_document(&self) -> Value {
        let members = self.members.read();
        let entries: Vec<Value> = self
            .nodes
            .iter()
            .zip(members.iter())
            .enumerate()
            .map(|(i, (node, member))| {
                let mut entry = Value::Object(member.clone());
                merge_documents(
                    &mut entry,
                    json!({"_id": i, "host": node.hostport_private()}),
                );
                entry
            })
            .collect();

        let mut document = Value::Object(self.rs_conf.clone());
        merge_documents(&mut document, json!({"_id": self.id, "members": entries}));
        if self.configsvr {
            merge_documents(&mut document, json!({"configsvr": true}));
        }
        document
    }

    pub async fn setup_host(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> bool {
        let filter = filter.widen_for(Some(&self.id));
        let actions: Vec<Action> = self
            .nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                let filter = filter.clone();
                async move { node.setup_host(clean_db_dir, clean_logs, &filter).await }.boxed()
            })
            .collect();
        fanout::run_all(actions).await
    }

    /// Launch every member, then run the bootstrap protocol
    pub async fn launch(&self, options: LaunchOptions, filter: &NodeFilter) -> bool {
        let filter = filter.widen_for(Some(&self.id));
        let actions: Vec<Action> = self
            .nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                let filter = filter.clone();
                async move { node.launch(options, &filter).await }.boxed()
            })
            .collect();

        if !fanout::run_all(actions).await {
            error!("Could not launch every member of {}, shutting it down", self);
            self.shutdown_after_failure(&filter).await;
            return false;
        }

        if let Some(protocol) = self.context.product.replication() {
            self.assign_priorities();
            if options.initialize {
                info!("Configuring replica set: {}", self.id);
                let script = protocol.initiate_script(&self.membership_document());
                if !self
                    .preferred_primary()
                    .run_control_script(&script, None, true)
                    .await
                {
                    error!("Failed to initiate {}", self);
                    self.shutdown_after_failure(&filter).await;
                    return false;
                }
            }
        }

        if !self.wait_until_up().await {
            self.shutdown_after_failure(&filter).await;
            return false;
        }
        true
    }

    async fn shutdown_after_failure(&self, filter: &NodeFilter) {
        let polling = &self.context.polling;
        self.shutdown(
            self.context.shutdown_timeout,
            None,
            polling.shutdown_retries,
            filter,
        )
        .await;
    }

    /// Wait for the preferred primary, then for every member
    pub async fn wait_until_up(&self) -> bool {
        let Some(protocol) = self.context.product.replication() else {
            for node in &self.nodes {
                if !node.wait_until_up().await {
                    return false;
                }
            }
            return true;
        };

        let primary = self.preferred_primary();
        let script = protocol.primary_probe_script();
        let what = format!("{} as primary of {}", primary, self.id);
        let elected = poll_until(self.context.polling.primary, &what, |_| {
            primary.run_control_script(&script, None, false)
        })
        .await;
        if let Err(e) = elected {
            error!("{} did not become primary of {}: {}", primary, self.id, e);
            return false;
        }

        let script = protocol.member_probe_script();
        for node in &self.nodes {
            let what = format!("{} as member of {}", node, self.id);
            let joined = poll_until(self.context.polling.member, &what, |_| {
                node.run_control_script(&script, None, false)
            })
            .await;
            if let Err(e) = joined {
                error!("{} not primary or secondary in {}: {}", node, self.id, e);
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
        let filter = filter.widen_for(Some(&self.id));
        let actions: Vec<Action> = self
            .nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                let filter = filter.clone();
                async move { node.shutdown(max_time, auth_enabled, retries, &filter).await }
                    .boxed()
            })
            .collect();
        fanout::run_all(actions).await
    }

    pub async fn destroy(&self, max_time: Duration, filter: &NodeFilter) -> bool {
        let filter = filter.widen_for(Some(&self.id));
        let actions: Vec<Action> = self
            .nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                let filter = filter.clone();
                async move { node.destroy(max_time, &filter).await }.boxed()
            })
            .collect();
        fanout::spawn_detached(actions).join().await
    }

    /// Create the admin user through the preferred primary, acknowledged by
    /// every member
    pub async fn add_default_users(&self) -> bool {
        self.preferred_primary()
            .create_user(Some(self.nodes.len()))
            .await
    }

    pub async fn close(&self) {
        let actions: Vec<Action> = self
            .nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                async move {
                    node.close().await;
                    true
                }
                .boxed()
            })
            .collect();
        fanout::spawn_detached(actions).join().await;
    }

    fn connection_string(&self, hostport: impl Fn(&Node) -> String) -> String {
        let hosts: Vec<String> = self.nodes.iter().map(|node| hostport(node.as_ref())).collect();
        format!("{}/{}", self.id, hosts.join(","))
    }

    /// `id/host:port,host:port` over private addresses
    pub fn connection_string_private(&self) -> String {
        self.connection_string(Node::hostport_private)
    }

    pub fn connection_string_public(&self) -> String {
        self.connection_string(Node::hostport_public)
    }
}

impl fmt::Display for ReplicaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaSet: {}", self.connection_string_public())
    }
}

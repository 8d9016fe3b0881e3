//! Product strategies
//!
//! A [`Product`] turns a node description into the concrete commands, files
//! and probes the controllers run. Controllers never look at product-specific
//! configuration themselves.
//!
//! - [`MongoProduct`]: replica sets, sharding and authentication through the
//!   database control shell
//! - [`GenericProduct`]: launch/shutdown/readiness commands taken verbatim
//!   from configuration, no replication protocol

pub mod generic;
pub mod mongodb;

pub use generic::GenericProduct;
pub use mongodb::MongoProduct;

use serde_json::Value;
use std::sync::Arc;

use crate::cluster::NodeRole;
use crate::config::{ProductKind, SetupConfig};
use crate::error::{ClusterError, ClusterResult};
use crate::host::Credentials;
use crate::topology::NodeSpec;

/// Everything a node controller needs to know about its process
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLayout {
    pub port: u16,
    /// Process names signalled by kill/term and checked after shutdown
    pub programs: Vec<String>,
    /// Launch argv, without any numactl prefix
    pub launch_command: Vec<String>,
    /// Remote path of the main config file
    pub config_path: String,
    /// Main config file document, rendered at launch
    pub config_document: Value,
    pub log_dir: String,
    /// File (or glob) tailed when a launch fails
    pub log_file: String,
    pub data_dir: Option<String>,
    pub journal_dir: Option<String>,
    pub lock_file: Option<String>,
    /// Connection string handed to the control shell
    pub connection: String,
    /// Remote path control scripts are written to
    pub script_path: String,
}

/// A file written to the node before launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub content: String,
}

/// Effective clean flags for one `setup_host`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupFlags {
    pub clean_db_dir: bool,
    pub clean_logs: bool,
}

/// How a node is asked to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulStop {
    /// Run a script through the control shell
    ControlScript(String),
    /// Run an argv command on the host
    Command(Vec<String>),
}

/// Product-specific behavior injected into the controllers
pub trait Product: Send + Sync {
    fn kind(&self) -> ProductKind;

    /// Resolve a node description (with its merged config document)
    fn layout(&self, spec: &NodeSpec, role: NodeRole, config: Value) -> ClusterResult<NodeLayout>;

    /// Files to write before launch, main config first
    fn config_files(&self, layout: &NodeLayout, enable_auth: bool)
    -> ClusterResult<Vec<RemoteFile>>;

    /// Commands that clean and recreate the node's directories
    fn setup_commands(&self, layout: &NodeLayout, role: NodeRole, flags: SetupFlags)
    -> Vec<Vec<String>>;

    /// Single readiness check run through the control shell
    fn node_up_script(&self, layout: &NodeLayout, private_ip: &str) -> String;

    fn graceful_stop(&self, layout: &NodeLayout) -> GracefulStop;

    /// Admin user creation script, `None` when the product has no users
    fn create_user_script(
        &self,
        _credentials: &Credentials,
        _write_concern: Option<usize>,
    ) -> Option<String> {
        None
    }

    /// Replication/sharding protocol, `None` when unsupported
    fn replication(&self) -> Option<&dyn ReplicationProtocol> {
        None
    }
}

/// Replica-set and sharded-cluster bootstrap protocol
pub trait ReplicationProtocol: Send + Sync {
    /// Merge replica set membership settings into a member's config document
    fn configure_member(&self, config: &mut Value, set_id: &str, configsvr: bool);

    /// Merge the config server connection string into a router's config document
    fn configure_router(&self, config: &mut Value, config_db: &str);

    fn initiate_script(&self, membership: &Value) -> String;

    /// Succeeds once the member reports itself primary
    fn primary_probe_script(&self) -> String;

    /// Succeeds once the member reports itself primary or secondary
    fn member_probe_script(&self) -> String;

    fn add_shard_script(&self, shard: &str) -> String;

    fn stop_balancer_script(&self) -> String;

    /// Succeeds once the router sees exactly `expected` shards
    fn shard_count_script(&self, expected: usize) -> String;
}

/// Build the product profile selected by the configuration
pub fn build_product(config: &SetupConfig) -> ClusterResult<Arc<dyn Product>> {
    match config.product {
        ProductKind::Mongodb => Ok(Arc::new(MongoProduct::new(config))),
        ProductKind::Generic => {
            let generic = config.generic.clone().ok_or_else(|| {
                ClusterError::config("product 'generic' requires a 'generic' section")
            })?;
            Ok(Arc::new(GenericProduct::new(generic)))
        }
    }
}

/// Recursively merge `overlay` into `base`; objects merge key by key,
/// anything else in `overlay` replaces the value in `base`
pub fn merge_documents(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_documents(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Look up a dotted path in a document
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |value, key| value.get(key))
}

/// Parent directory of a path, `.` when it has none
pub(crate) fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => ".".to_string(),
    }
}

pub(crate) fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

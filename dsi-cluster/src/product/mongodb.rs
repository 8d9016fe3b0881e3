//! Database-specific product profile
//!
//! Nodes run `mongod` (data and config members) or `mongos` (routers) with a
//! YAML config file written to `/tmp/mongo_port_<port>.conf`. Control scripts
//! run through the mongo shell against `localhost:<port>`.

use serde_json::{Value, json};

use super::{
    GracefulStop, NodeLayout, Product, RemoteFile, ReplicationProtocol, SetupFlags, dirname,
    join_path, lookup, merge_documents,
};
use crate::cluster::NodeRole;
use crate::config::{ProductKind, SetupConfig, render_document};
use crate::error::{ClusterError, ClusterResult};
use crate::host::{Credentials, argv};
use crate::topology::NodeSpec;

pub struct MongoProduct {
    mongo_dir: Option<String>,
    journal_dir: Option<String>,
    key_file: Option<String>,
    shutdown_options: Value,
}

impl MongoProduct {
    pub fn new(config: &SetupConfig) -> Self {
        Self {
            mongo_dir: config.mongo_dir.clone(),
            journal_dir: config.journal_dir.clone(),
            key_file: config.authentication.key_file.clone(),
            shutdown_options: config.shutdown_options.clone(),
        }
    }

    fn bin_dir(&self, spec: &NodeSpec) -> String {
        let mongo_dir = spec
            .mongo_dir
            .as_deref()
            .or(self.mongo_dir.as_deref())
            .unwrap_or("/usr");
        join_path(mongo_dir, "bin")
    }
}

fn required_str<'a>(config: &'a Value, path: &str, node: &NodeSpec) -> ClusterResult<&'a str> {
    lookup(config, path).and_then(Value::as_str).ok_or_else(|| {
        ClusterError::config(format!(
            "config_file.{} is required for node {}",
            path, node.public_ip
        ))
    })
}

impl Product for MongoProduct {
    fn kind(&self) -> ProductKind {
        ProductKind::Mongodb
    }

    fn layout(&self, spec: &NodeSpec, role: NodeRole, config: Value) -> ClusterResult<NodeLayout> {
        let port = lookup(&config, "net.port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| {
                ClusterError::config(format!(
                    "config_file.net.port is required for node {}",
                    spec.public_ip
                ))
            })?;

        let log_file = required_str(&config, "systemLog.path", spec)?.to_string();

        let data_dir = match role {
            NodeRole::Router => None,
            _ => Some(required_str(&config, "storage.dbPath", spec)?.to_string()),
        };

        let journal_dir = match role {
            NodeRole::Router | NodeRole::ConfigMember => None,
            _ => self.journal_dir.clone(),
        };

        let program = match role {
            NodeRole::Router => "mongos",
            _ => "mongod",
        };
        let config_path = format!("/tmp/mongo_port_{}.conf", port);

        Ok(NodeLayout {
            port,
            programs: vec![program.to_string()],
            launch_command: vec![
                join_path(&self.bin_dir(spec), program),
                "--config".to_string(),
                config_path.clone(),
            ],
            config_path,
            config_document: config,
            log_dir: dirname(&log_file),
            log_file,
            lock_file: data_dir.as_deref().map(|dir| join_path(dir, "mongod.lock")),
            data_dir,
            journal_dir,
            connection: format!("localhost:{}", port),
            script_path: format!("/tmp/mongo_port_{}.js", port),
        })
    }

    fn config_files(
        &self,
        layout: &NodeLayout,
        enable_auth: bool,
    ) -> ClusterResult<Vec<RemoteFile>> {
        let mut document = layout.config_document.clone();
        if enable_auth {
            let mut security = serde_json::Map::new();
            if layout.data_dir.is_some() {
                security.insert("authorization".to_string(), json!("enabled"));
            }
            if let Some(key_file) = &self.key_file {
                security.insert("keyFile".to_string(), json!(key_file));
            }
            merge_documents(&mut document, json!({ "security": security }));
        }

        Ok(vec![RemoteFile {
            path: layout.config_path.clone(),
            content: render_document(&document)?,
        }])
    }

    fn setup_commands(
        &self,
        layout: &NodeLayout,
        role: NodeRole,
        flags: SetupFlags,
    ) -> Vec<Vec<String>> {
        let log_dir = layout.log_dir.as_str();
        let diagnostic_dir = match (&layout.data_dir, role) {
            (Some(data_dir), _) if role != NodeRole::Router => {
                join_path(data_dir, "diagnostic.data")
            }
            _ => join_path(log_dir, "mongos.diagnostic.data"),
        };

        let mut commands = Vec::new();
        if flags.clean_logs {
            commands.push(argv(["rm", "-rf", &join_path(log_dir, "*.log")]));
            commands.push(argv(["rm", "-rf", &join_path(log_dir, "core.*")]));
            commands.push(argv(["rm", "-rf", &join_path(&diagnostic_dir, "*")]));
        }
        commands.push(argv(["mkdir", "-p", log_dir]));

        if let (Some(data_dir), true) = (&layout.data_dir, flags.clean_db_dir) {
            // diagnostic.data is governed by clean_logs, so park it in the log dir
            let parked = join_path(log_dir, "diagnostic.data");
            commands.push(argv(["mkdir", "-p", &diagnostic_dir]));
            commands.push(argv(["rm", "-rf", &parked]));
            commands.push(argv(["mv", &diagnostic_dir, log_dir]));
            commands.push(argv(["rm", "-rf", data_dir]));
            if let Some(journal_dir) = &layout.journal_dir {
                commands.push(argv(["rm", "-rf", journal_dir]));
            }
            commands.push(argv(["mkdir", "-p", data_dir]));
            commands.push(argv(["mv", &parked, data_dir]));
            if let Some(journal_dir) = &layout.journal_dir {
                commands.push(argv(["mkdir", "-p", journal_dir]));
                commands.push(argv(["ln", "-s", journal_dir, &join_path(data_dir, "journal")]));
            }
        }
        commands
    }

    fn node_up_script(&self, _layout: &NodeLayout, _private_ip: &str) -> String {
        "assert(db.serverStatus().ok == 1);".to_string()
    }

    fn graceful_stop(&self, _layout: &NodeLayout) -> GracefulStop {
        GracefulStop::ControlScript(format!(
            "db.getSiblingDB(\"admin\").shutdownServer({});",
            self.shutdown_options
        ))
    }

    fn create_user_script(
        &self,
        credentials: &Credentials,
        write_concern: Option<usize>,
    ) -> Option<String> {
        let user = json!({
            "user": credentials.username,
            "pwd": credentials.password,
            "roles": [{"role": "root", "db": "admin"}],
        });
        let concern = match write_concern {
            Some(w) => json!({ "w": w }),
            None => json!({ "w": "majority" }),
        };
        Some(format!(
            "db.getSiblingDB(\"admin\").createUser({}, {});",
            user, concern
        ))
    }

    fn replication(&self) -> Option<&dyn ReplicationProtocol> {
        Some(self)
    }
}

impl ReplicationProtocol for MongoProduct {
    fn configure_member(&self, config: &mut Value, set_id: &str, configsvr: bool) {
        merge_documents(config, json!({"replication": {"replSetName": set_id}}));
        if configsvr {
            merge_documents(config, json!({"sharding": {"clusterRole": "configsvr"}}));
        }
    }

    fn configure_router(&self, config: &mut Value, config_db: &str) {
        merge_documents(config, json!({"sharding": {"configDB": config_db}}));
    }

    fn initiate_script(&self, membership: &Value) -> String {
        format!(
            "config = {};\nassert.commandWorked(rs.initiate(config), \
             \"Failed to initiate replica set!\");",
            membership
        )
    }

    fn primary_probe_script(&self) -> String {
        "assert(rs.isMaster().ismaster);\nprint(\"rs.status(): \" + tojson(rs.status()));"
            .to_string()
    }

    fn member_probe_script(&self) -> String {
        "var state = rs.isMaster();\nassert(state.ismaster || state.secondary);".to_string()
    }

    fn add_shard_script(&self, shard: &str) -> String {
        format!("assert.commandWorked(sh.addShard({}));", json!(shard))
    }

    fn stop_balancer_script(&self) -> String {
        "sh.stopBalancer();".to_string()
    }

    fn shard_count_script(&self, expected: usize) -> String {
        format!(
            "assert(db.getSiblingDB(\"config\").shards.find().itcount() == {});",
            expected
        )
    }
}

//! Config-driven product profile
//!
//! Launch, shutdown and readiness commands come straight from the `generic`
//! configuration section. There is no replication protocol, so replica sets
//! only wait for each member to come up and sharded topologies are rejected.

use serde_json::Value;

use super::{GracefulStop, NodeLayout, Product, RemoteFile, SetupFlags, join_path};
use crate::cluster::NodeRole;
use crate::config::{ConfigFileSpec, GenericProductConfig, ProductKind};
use crate::error::{ClusterError, ClusterResult};
use crate::host::argv;
use crate::topology::NodeSpec;

pub struct GenericProduct {
    config: GenericProductConfig,
}

impl GenericProduct {
    pub fn new(config: GenericProductConfig) -> Self {
        Self { config }
    }
}

impl Product for GenericProduct {
    fn kind(&self) -> ProductKind {
        ProductKind::Generic
    }

    fn layout(&self, spec: &NodeSpec, _role: NodeRole, config: Value) -> ClusterResult<NodeLayout> {
        let programs = self.config.launch_program.tokens().to_vec();
        if programs.is_empty() {
            return Err(ClusterError::config("generic.launch_program must not be empty"));
        }
        if self.config.launch_command.is_empty() {
            return Err(ClusterError::config("generic.launch_command must not be empty"));
        }

        // Main config file is optional and carries its own remote path
        let config_path = match &config {
            Value::Null => String::new(),
            other => serde_json::from_value::<ConfigFileSpec>(other.clone())
                .map_err(|e| {
                    ClusterError::config(format!(
                        "config_file for node {} needs remote_path and content: {}",
                        spec.public_ip, e
                    ))
                })?
                .remote_path,
        };

        let directories = &self.config.directories;
        Ok(NodeLayout {
            port: self.config.port,
            programs,
            launch_command: self.config.launch_command.tokens().to_vec(),
            config_path,
            config_document: config,
            log_dir: directories.log_dir.clone(),
            log_file: join_path(&directories.log_dir, "*.log"),
            data_dir: directories.data_dir.clone(),
            journal_dir: directories.journal_dir.clone(),
            lock_file: self.config.lock_file.clone(),
            connection: format!("{}:{}", spec.private_ip(), self.config.port),
            script_path: join_path(&directories.config_dir, "check_node_up.sh"),
        })
    }

    fn config_files(
        &self,
        layout: &NodeLayout,
        _enable_auth: bool,
    ) -> ClusterResult<Vec<RemoteFile>> {
        let mut files = Vec::new();
        if !layout.config_document.is_null() {
            let spec: ConfigFileSpec = serde_json::from_value(layout.config_document.clone())?;
            files.push(RemoteFile {
                path: spec.remote_path.clone(),
                content: spec.render()?,
            });
        }
        for other in &self.config.other_config_files {
            files.push(RemoteFile {
                path: other.remote_path.clone(),
                content: other.render()?,
            });
        }
        Ok(files)
    }

    fn setup_commands(
        &self,
        layout: &NodeLayout,
        _role: NodeRole,
        flags: SetupFlags,
    ) -> Vec<Vec<String>> {
        let log_dir = layout.log_dir.as_str();
        let mut commands = Vec::new();
        if flags.clean_logs {
            for pattern in ["*.log", "*.svg", "core.*"] {
                commands.push(argv(["rm", "-rf", &join_path(log_dir, pattern)]));
            }
        }
        commands.push(argv(["mkdir", "-p", log_dir]));

        if let (Some(data_dir), true) = (&layout.data_dir, flags.clean_db_dir) {
            commands.push(argv(["rm", "-rf", data_dir]));
            if let Some(journal_dir) = &layout.journal_dir {
                commands.push(argv(["rm", "-rf", journal_dir]));
            }
            commands.push(argv(["mkdir", "-p", data_dir]));
            if let Some(journal_dir) = &layout.journal_dir {
                commands.push(argv(["mkdir", "-p", journal_dir]));
            }
        }

        commands.push(argv(["mkdir", "-p", &self.config.directories.config_dir]));
        commands
    }

    fn node_up_script(&self, _layout: &NodeLayout, private_ip: &str) -> String {
        self.config.check_node_up.replace("{host}", private_ip)
    }

    fn graceful_stop(&self, _layout: &NodeLayout) -> GracefulStop {
        GracefulStop::Command(self.config.shutdown_command.tokens().to_vec())
    }
}

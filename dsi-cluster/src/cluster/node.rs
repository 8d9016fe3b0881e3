//! Node controller
//!
//! Lifecycle of one process on one host. The host connection is created on
//! first use and owned by the node.

use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::{ClusterContext, LaunchOptions, NodeFilter, NodeRole, NodeState};
use crate::error::{ClusterError, ClusterResult};
use crate::fanout::poll_until;
use crate::host::{ControlTarget, Host, HostError, HostInfo, HostResult, Signal, argv};
use crate::product::{GracefulStop, NodeLayout, SetupFlags};
use crate::topology::NodeSpec;

/// Result of one graceful stop attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GracefulOutcome {
    Completed,
    /// `benign` failures are the expected side effect of the server going
    /// away while the stop command was still connected
    Failed { benign: bool, detail: String },
}

impl GracefulOutcome {
    fn from_host_error(error: &HostError) -> Self {
        GracefulOutcome::Failed {
            benign: error.is_likely_benign(),
            detail: error.to_string(),
        }
    }
}

pub struct Node {
    id: Option<String>,
    role: NodeRole,
    info: HostInfo,
    layout: NodeLayout,
    clean_logs: bool,
    clean_db_dir: bool,
    context: Arc<ClusterContext>,
    host: OnceCell<Box<dyn Host>>,
    state: Mutex<NodeState>,
    auth_enabled: AtomicBool,
}

impl Node {
    /// Build a node from its description and merged config document
    pub fn new(
        spec: &NodeSpec,
        role: NodeRole,
        config: Value,
        context: Arc<ClusterContext>,
    ) -> ClusterResult<Self> {
        let layout = context.product.layout(spec, role, config)?;
        let clean_logs = spec.clean_logs.unwrap_or(context.clean_logs);
        let clean_db_dir = spec
            .clean_db_dir
            .unwrap_or(role != NodeRole::Router && context.clean_db_dir);

        Ok(Self {
            id: spec.id.clone(),
            role,
            info: spec.host_info(),
            layout,
            clean_logs,
            clean_db_dir,
            context,
            host: OnceCell::new(),
            state: Mutex::new(NodeState::Unconfigured),
            auth_enabled: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub fn host_info(&self) -> &HostInfo {
        &self.info
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    fn set_state(&self, state: NodeState) {
        let mut current = self.state.lock();
        debug!("{} {} -> {}", self, *current, state);
        *current = state;
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_enabled.load(Ordering::SeqCst)
    }

    pub fn hostport_private(&self) -> String {
        format!("{}:{}", self.info.private_ip(), self.layout.port)
    }

    pub fn hostport_public(&self) -> String {
        format!("{}:{}", self.info.public_ip, self.layout.port)
    }

    pub fn connection_string_private(&self) -> String {
        self.hostport_private()
    }

    async fn host(&self) -> HostResult<&dyn Host> {
        let host = self
            .host
            .get_or_try_init(|| async { self.context.hosts.make_host(&self.info) })
            .await?;
        Ok(host.as_ref())
    }

    /// Host for a lifecycle operation, logging the failure to connect
    async fn connected_host(&self, operation: &str) -> Option<&dyn Host> {
        match self.host().await {
            Ok(host) => Some(host),
            Err(e) => {
                error!("Cannot {} {}: {}", operation, self, e);
                None
            }
        }
    }

    fn control_target(&self) -> ControlTarget {
        let credentials = self
            .auth_enabled()
            .then(|| self.context.credentials.clone());
        ControlTarget::new(&self.layout.connection, &self.layout.script_path)
            .with_credentials(credentials)
    }

    /// Kill any prior instance and prepare directories
    pub async fn setup_host(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> bool {
        if !filter.admits(self.id()) {
            return true;
        }
        let Some(host) = self.connected_host("set up").await else {
            return false;
        };

        self.signal_all(host, Signal::Kill, None).await;

        let flags = SetupFlags {
            clean_db_dir: clean_db_dir.unwrap_or(self.clean_db_dir),
            clean_logs: clean_logs.unwrap_or(self.clean_logs),
        };
        debug!("Setting up {} with {:?}", self, flags);

        let commands = self
            .context
            .product
            .setup_commands(&self.layout, self.role, flags);
        if !host.run_all(&commands).await {
            error!("Setup commands failed on {}", self);
            return false;
        }

        self.set_state(NodeState::HostPrepared);
        true
    }

    /// Full launch argv, with the numactl wrapper when requested
    pub fn launch_command(&self, use_numactl: bool) -> Vec<String> {
        let mut command = Vec::new();
        if use_numactl {
            command.extend(self.context.numactl_prefix.iter().cloned());
        }
        command.extend(self.layout.launch_command.iter().cloned());
        command
    }

    /// Write config files, start the process and wait for it to come up
    pub async fn launch(&self, options: LaunchOptions, filter: &NodeFilter) -> bool {
        if !filter.admits(self.id()) {
            return true;
        }
        let Some(host) = self.connected_host("launch").await else {
            return false;
        };

        self.auth_enabled
            .store(options.enable_auth, Ordering::SeqCst);

        let files = match self
            .context
            .product
            .config_files(&self.layout, options.enable_auth)
        {
            Ok(files) => files,
            Err(e) => {
                error!("Cannot render config for {}: {}", self, e);
                return false;
            }
        };
        for file in &files {
            if let Err(e) = host.create_file(&file.path, &file.content).await {
                error!("Cannot write {} on {}: {}", file.path, self, e);
                return false;
            }
        }
        if let Some(main) = files.first() {
            host.run(&argv(["cat", main.path.as_str()])).await;
        }

        let command = self.launch_command(options.use_numactl);
        debug!("Launch command for {}: {:?}", self, command);
        if !host.run(&command).await {
            error!("Failed launch command on {}: {:?}", self, command);
            self.dump_log(host).await;
            return false;
        }
        self.set_state(NodeState::Launched);

        self.wait_until_up().await
    }

    /// Poll the readiness probe until it succeeds or the attempts run out
    pub async fn wait_until_up(&self) -> bool {
        let script = self
            .context
            .product
            .node_up_script(&self.layout, self.info.private_ip());

        let what = format!("readiness of {}", self);
        match poll_until(self.context.polling.node_up, &what, |_| {
            self.run_control_script(&script, None, false)
        })
        .await
        {
            Ok(()) => {
                self.set_state(NodeState::Up);
                true
            }
            Err(e) => {
                error!("Node {} not up at end of wait_until_up: {}", self, e);
                false
            }
        }
    }

    /// Run a script through the control shell; a non-zero exit status is a
    /// [`ClusterError::RemoteExecution`]
    pub async fn exec_script(&self, script: &str, max_time: Option<Duration>) -> ClusterResult<()> {
        let host = self.host().await?;
        match host
            .exec_control_script(script, &self.control_target(), max_time)
            .await?
        {
            0 => Ok(()),
            status => Err(ClusterError::RemoteExecution {
                host: self.hostport_public(),
                detail: format!("control script exited with {}", status),
            }),
        }
    }

    /// Run a script through the control shell, true on exit status 0
    pub async fn run_control_script(
        &self,
        script: &str,
        max_time: Option<Duration>,
        dump_on_error: bool,
    ) -> bool {
        let Err(e) = self.exec_script(script, max_time).await else {
            return true;
        };
        match &e {
            ClusterError::RemoteExecution { .. } => debug!("{}", e),
            _ => warn!("Control script on {} failed: {}", self, e),
        }
        if dump_on_error {
            if let Some(host) = self.connected_host("reach").await {
                self.dump_log(host).await;
            }
        }
        false
    }

    async fn graceful_stop(&self, host: &dyn Host, max_time: Duration) -> GracefulOutcome {
        match self.context.product.graceful_stop(&self.layout) {
            GracefulStop::ControlScript(script) => {
                match host
                    .exec_control_script(&script, &self.control_target(), Some(max_time))
                    .await
                {
                    Ok(0) => GracefulOutcome::Completed,
                    Ok(status) => GracefulOutcome::Failed {
                        benign: false,
                        detail: format!("exit status {}", status),
                    },
                    Err(e) => GracefulOutcome::from_host_error(&e),
                }
            }
            GracefulStop::Command(command) => {
                if host.run(&command).await {
                    GracefulOutcome::Completed
                } else {
                    GracefulOutcome::Failed {
                        benign: false,
                        detail: format!("{:?} failed", command),
                    }
                }
            }
        }
    }

    async fn is_running(&self, host: &dyn Host) -> bool {
        for program in &self.layout.programs {
            if host.run(&argv(["pgrep", "-l", program.as_str()])).await {
                return true;
            }
        }
        false
    }

    /// Stop the process gracefully, retrying while it is still running
    ///
    /// Never force-kills; returns false when the process survives every attempt.
    pub async fn shutdown(
        &self,
        max_time: Duration,
        auth_enabled: Option<bool>,
        retries: u32,
        filter: &NodeFilter,
    ) -> bool {
        if !filter.admits(self.id()) {
            return true;
        }
        let Some(host) = self.connected_host("shut down").await else {
            return false;
        };

        if let Some(enabled) = auth_enabled {
            self.auth_enabled.store(enabled, Ordering::SeqCst);
        }
        self.set_state(NodeState::ShuttingDown);

        for attempt in 0..retries {
            // only the first two failures dump the log
            let dump_on_error = attempt < 2;

            match self.graceful_stop(host, max_time).await {
                GracefulOutcome::Completed => {}
                GracefulOutcome::Failed {
                    benign: true,
                    detail,
                } => debug!("Shutdown of {} closed the connection: {}", self, detail),
                GracefulOutcome::Failed {
                    benign: false,
                    detail,
                } => {
                    error!("Error shutting down {}: {}", self, detail);
                    if dump_on_error {
                        self.dump_log(host).await;
                    }
                }
            }

            if !self.is_running(host).await {
                self.set_state(NodeState::Stopped);
                return true;
            }
            warn!("{} did not shut down yet", self);
            tokio::time::sleep(self.context.polling.shutdown_interval()).await;
        }

        error!("{} still running after {} shutdown attempts", self, retries);
        false
    }

    async fn signal_all(
        &self,
        host: &dyn Host,
        signal: Signal,
        max_time: Option<Duration>,
    ) -> bool {
        let mut all_stopped = true;
        for program in &self.layout.programs {
            all_stopped &= host.kill_process_by_name(program, signal, max_time).await;
        }
        all_stopped
    }

    /// SIGKILL every process of this node's role
    pub async fn kill(&self) -> bool {
        match self.connected_host("kill").await {
            Some(host) => self.signal_all(host, Signal::Kill, None).await,
            None => false,
        }
    }

    /// SIGTERM every process of this node's role, waiting up to `max_time`
    pub async fn term(&self, max_time: Option<Duration>) -> bool {
        match self.connected_host("terminate").await {
            Some(host) => self.signal_all(host, Signal::Term, max_time).await,
            None => false,
        }
    }

    /// SIGTERM, then always SIGKILL and remove the lock file
    ///
    /// True when no matching process remains.
    pub async fn destroy(&self, max_time: Duration, filter: &NodeFilter) -> bool {
        if !filter.admits(self.id()) {
            return true;
        }
        let Some(host) = self.connected_host("destroy").await else {
            return false;
        };

        if !self.signal_all(host, Signal::Term, Some(max_time)).await {
            warn!(
                "{} did not shut down cleanly, sending SIGKILL and deleting lock file",
                self
            );
        }
        let killed = self.signal_all(host, Signal::Kill, None).await;

        if self.layout.data_dir.is_some() {
            if let Some(lock_file) = &self.layout.lock_file {
                host.run(&argv(["rm", "-rf", lock_file.as_str()])).await;
            }
        }

        self.set_state(NodeState::Destroyed);
        killed
    }

    /// Create the configured admin user on this node
    pub async fn create_user(&self, write_concern: Option<usize>) -> bool {
        let Some(script) = self
            .context
            .product
            .create_user_script(&self.context.credentials, write_concern)
        else {
            error!("Product does not support users, cannot add them on {}", self);
            return false;
        };

        info!(
            "Adding user {} on {}",
            self.context.credentials.username, self
        );
        self.run_control_script(&script, None, true).await
    }

    async fn dump_log(&self, host: &dyn Host) {
        info!("Dumping log for node {}", self.hostport_public());
        host.run(&argv(["tail", "-n", "100", self.layout.log_file.as_str()]))
            .await;
    }

    /// Close the host connection if one was opened
    pub async fn close(&self) {
        if let Some(host) = self.host.get() {
            host.close().await;
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self
            .layout
            .programs
            .first()
            .map(String::as_str)
            .unwrap_or("node");
        write!(f, "{}: {}", program, self.hostport_public())
    }
}

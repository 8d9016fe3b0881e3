//! Command dispatcher
//!
//! Runs the configured command phases (`pre_cluster_start`,
//! `post_cluster_start`, `upon_error`, ...) against host groups:
//! - Every phase is parsed and validated when the dispatcher is built
//! - Host actions fan out to all hosts of a group and are joined
//! - `restart_cluster` entries call back into the cluster controller
//! - A [`FailurePolicy`] decides what a failing entry does to the phase

pub mod actions;
pub mod batch;
pub mod groups;
pub mod reports;

pub use actions::{
    ActionContext, ActionHandler, ActionPayload, ActionRegistry, NetworkDelays, PayloadHandler,
    PreparedAction,
};
pub use batch::{RawCommand, RestartRequest, Step};
pub use groups::HostGroups;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cluster::NodeFilter;
use crate::config::SetupConfig;
use crate::error::ClusterResult;
use crate::fanout::{self, Action};
use crate::host::{Credentials, HostFactory, HostInfo};

/// What a failing phase entry does to the rest of the phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and carry on with the next entry
    Continue,
    /// Stop the phase and return the error
    Reraise,
    /// Log, then terminate the process with status 1
    Exit,
}

/// Dispatcher error types
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{phase}: '{action}' on {target} failed: {detail}")]
    Action {
        phase: String,
        target: String,
        action: String,
        detail: String,
    },

    #[error("{phase}: restart failed: {detail}")]
    Restart { phase: String, detail: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Exited after failure: {0}")]
    Exited(String),
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Restarts the cluster on behalf of a `restart_cluster` entry
#[async_trait]
pub trait ClusterRestart: Send + Sync {
    async fn restart(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> ClusterResult<bool>;
}

/// Called with the exit status under [`FailurePolicy::Exit`]
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

const DEFAULT_DELAY_INTERFACE: &str = "eth0";

/// Validated command phases, ready to run
pub struct CommandDispatcher {
    hosts: Arc<dyn HostFactory>,
    groups: HostGroups,
    phases: BTreeMap<String, Vec<Step>>,
    restart: Option<Arc<dyn ClusterRestart>>,
    credentials: Option<Credentials>,
    work_dir: PathBuf,
    repo_root: PathBuf,
    exit_hook: ExitHook,
}

impl CommandDispatcher {
    /// Build a dispatcher with the built-in actions
    pub fn new(
        config: &SetupConfig,
        hosts: Arc<dyn HostFactory>,
        groups: HostGroups,
        restart: Option<Arc<dyn ClusterRestart>>,
    ) -> DispatchResult<Self> {
        Self::with_registry(
            config,
            hosts,
            groups,
            restart,
            &ActionRegistry::with_defaults(),
        )
    }

    /// Build a dispatcher, resolving actions through `registry`
    pub fn with_registry(
        config: &SetupConfig,
        hosts: Arc<dyn HostFactory>,
        groups: HostGroups,
        restart: Option<Arc<dyn ClusterRestart>>,
        registry: &ActionRegistry,
    ) -> DispatchResult<Self> {
        let mut phases = BTreeMap::new();
        for (name, commands) in config.all_phases() {
            let steps = batch::parse_phase(name, commands, &groups, registry)?;
            if restart.is_none() {
                if let Some(step) = steps.iter().find(|s| matches!(s, Step::Restart { .. })) {
                    return Err(DispatchError::Configuration(format!(
                        "{}: '{}' needs a cluster to restart",
                        name,
                        step.target()
                    )));
                }
            }
            debug!("Validated phase {} ({} entries)", name, steps.len());
            phases.insert(name.to_string(), steps);
        }

        Ok(Self {
            hosts,
            groups,
            phases,
            restart,
            credentials: config.credentials(),
            work_dir: PathBuf::from("."),
            repo_root: PathBuf::from("."),
            exit_hook: Arc::new(|code| std::process::exit(code)),
        })
    }

    /// Replace process exit under [`FailurePolicy::Exit`]
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.exit_hook = hook;
        self
    }

    /// Directory holding `reports/`
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Root for `upload_repo_files` sources
    pub fn with_repo_root(mut self, repo_root: impl Into<PathBuf>) -> Self {
        self.repo_root = repo_root.into();
        self
    }

    pub fn groups(&self) -> &HostGroups {
        &self.groups
    }

    /// Parsed entries of a phase; unknown phases are empty
    pub fn steps(&self, phase: &str) -> &[Step] {
        self.phases.get(phase).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run a phase with the phase name as the reports prefix
    pub async fn run_phase(&self, phase: &str, policy: FailurePolicy) -> DispatchResult<()> {
        self.run_phase_with_prefix(phase, phase, policy).await
    }

    /// Run a phase, filing retrieved files under `reports/<prefix>/`
    pub async fn run_phase_with_prefix(
        &self,
        phase: &str,
        prefix: &str,
        policy: FailurePolicy,
    ) -> DispatchResult<()> {
        let steps = self.steps(phase);
        if steps.is_empty() {
            debug!("No commands for {}", phase);
            return Ok(());
        }

        info!("Running {} ({} entries)", phase, steps.len());
        let context = ActionContext {
            prefix: prefix.to_string(),
            work_dir: self.work_dir.clone(),
            repo_root: self.repo_root.clone(),
            credentials: self.credentials.clone(),
        };

        for step in steps {
            let Err(err) = self.execute(phase, step, &context).await else {
                continue;
            };
            error!("{} failed: {}", step, err);
            match policy {
                FailurePolicy::Continue => {}
                FailurePolicy::Reraise => return Err(err),
                FailurePolicy::Exit => {
                    error!(
                        "Exiting with status code: 1 (phase {}, target {})",
                        phase,
                        step.target()
                    );
                    (self.exit_hook)(1);
                    return Err(DispatchError::Exited(err.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Run `upon_error` for a failed task into a fresh reports directory
    pub async fn run_upon_error(&self, task: &str, policy: FailurePolicy) -> DispatchResult<()> {
        if let Err(e) = reports::prepare_reports_dir(&self.work_dir) {
            warn!("Could not prepare reports directory: {}", e);
        }
        let prefix = format!("upon_error/{}", task);
        self.run_phase_with_prefix("upon_error", &prefix, policy)
            .await
    }

    /// Remove any network delay on every known host, ignoring failures
    pub async fn reset_all_delays(&self) {
        let hosts = self.groups.all_hosts();
        if hosts.is_empty() {
            return;
        }
        info!("Resetting network delays on {} hosts", hosts.len());
        let reset: Arc<dyn PreparedAction> =
            Arc::new(NetworkDelays::reset(DEFAULT_DELAY_INTERFACE));
        let context = ActionContext {
            prefix: String::new(),
            work_dir: self.work_dir.clone(),
            repo_root: self.repo_root.clone(),
            credentials: None,
        };
        let failures = self.fan_out(hosts, vec![reset], context).await;
        for (host, action, detail) in failures {
            debug!("{} on {} failed: {}", action, host, detail);
        }
    }

    async fn execute(
        &self,
        phase: &str,
        step: &Step,
        context: &ActionContext,
    ) -> DispatchResult<()> {
        match step {
            Step::OnHosts {
                target,
                group,
                actions,
            } => {
                let hosts = self.groups.resolve(group).ok_or_else(|| {
                    DispatchError::Configuration(format!("unknown host group '{}'", group))
                })?;
                let failures = self
                    .fan_out(hosts, actions.clone(), context.clone())
                    .await;
                match failures.first() {
                    None => Ok(()),
                    Some((_, action, _)) => Err(DispatchError::Action {
                        phase: phase.to_string(),
                        target: target.clone(),
                        action: action.clone(),
                        detail: failures
                            .iter()
                            .map(|(host, _, detail)| format!("{}: {}", host, detail))
                            .collect::<Vec<_>>()
                            .join("; "),
                    }),
                }
            }
            Step::Restart { request, .. } => {
                let Some(restart) = &self.restart else {
                    return Err(DispatchError::Configuration(
                        "no cluster to restart".to_string(),
                    ));
                };
                let filter = NodeFilter::from(request.nodes.clone());
                match restart
                    .restart(request.clean_db_dir, request.clean_logs, &filter)
                    .await
                {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(DispatchError::Restart {
                        phase: phase.to_string(),
                        detail: "cluster did not come back up".to_string(),
                    }),
                    Err(e) => Err(DispatchError::Restart {
                        phase: phase.to_string(),
                        detail: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Run `actions` in order on every host concurrently; returns
    /// `(host, action, detail)` for each host that failed
    async fn fan_out(
        &self,
        hosts: Vec<HostInfo>,
        actions: Vec<Arc<dyn PreparedAction>>,
        context: ActionContext,
    ) -> Vec<(String, String, String)> {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let context = Arc::new(context);

        let tasks: Vec<Action> = hosts
            .into_iter()
            .map(|info| {
                let factory = Arc::clone(&self.hosts);
                let actions = actions.clone();
                let context = Arc::clone(&context);
                let failures = Arc::clone(&failures);
                async move {
                    let host = match factory.make_host(&info) {
                        Ok(host) => host,
                        Err(e) => {
                            failures.lock().push((
                                info.alias().to_string(),
                                "connect".to_string(),
                                e.to_string(),
                            ));
                            return false;
                        }
                    };
                    let mut ok = true;
                    for action in &actions {
                        if let Err(detail) = action.run(host.as_ref(), &context).await {
                            failures.lock().push((
                                info.alias().to_string(),
                                action.name().to_string(),
                                detail,
                            ));
                            ok = false;
                            break;
                        }
                    }
                    host.close().await;
                    ok
                }
                .boxed()
            })
            .collect();

        fanout::run_all(tasks).await;
        std::mem::take(&mut *failures.lock())
    }
}

//! Host action registry
//!
//! Every action name a command batch may use maps to an [`ActionHandler`].
//! Handlers validate their payload once, when the dispatcher is built, and
//! hand back a [`PreparedAction`] that runs against one host.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::reports::report_path;
use super::{DispatchError, DispatchResult};
use crate::host::{ControlTarget, Credentials, Host, argv};

/// What a running action knows besides its payload
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Phase or test id, used as the reports sub-directory
    pub prefix: String,
    /// Directory holding `reports/`
    pub work_dir: PathBuf,
    /// Root that `upload_repo_files` sources are relative to
    pub repo_root: PathBuf,
    /// Control shell credentials, when authentication is enabled
    pub credentials: Option<Credentials>,
}

/// A validated action, ready to run on any number of hosts
#[async_trait]
pub trait PreparedAction: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn run(&self, host: &dyn Host, context: &ActionContext) -> Result<(), String>;
}

/// Turns a payload into a [`PreparedAction`]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn prepare(&self, payload: &Value) -> DispatchResult<Arc<dyn PreparedAction>>;
}

/// Payload types that know their action name and can check themselves
pub trait ActionPayload: DeserializeOwned + PreparedAction + 'static {
    const NAME: &'static str;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Handler that deserializes the payload straight into `P`
pub struct PayloadHandler<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P> PayloadHandler<P> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<P> Default for PayloadHandler<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ActionPayload> ActionHandler for PayloadHandler<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn prepare(&self, payload: &Value) -> DispatchResult<Arc<dyn PreparedAction>> {
        let action: P = serde_json::from_value(payload.clone()).map_err(|e| {
            DispatchError::Configuration(format!("invalid '{}' payload: {}", P::NAME, e))
        })?;
        action.validate().map_err(|e| {
            DispatchError::Configuration(format!("invalid '{}' payload: {}", P::NAME, e))
        })?;
        Ok(Arc::new(action))
    }
}

/// Action name to handler
#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PayloadHandler::<Exec>::new()));
        registry.register(Arc::new(PayloadHandler::<ExecControlScript>::new()));
        registry.register(Arc::new(PayloadHandler::<UploadFiles>::new()));
        registry.register(Arc::new(PayloadHandler::<UploadRepoFiles>::new()));
        registry.register(Arc::new(PayloadHandler::<RetrieveFiles>::new()));
        registry.register(Arc::new(PayloadHandler::<CheckoutRepos>::new()));
        registry.register(Arc::new(PayloadHandler::<DownloadFiles>::new()));
        registry.register(Arc::new(PayloadHandler::<NetworkDelays>::new()));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn prepare(&self, name: &str, payload: &Value) -> DispatchResult<Arc<dyn PreparedAction>> {
        let handler = self.handlers.get(name).ok_or_else(|| {
            DispatchError::Configuration(format!("unknown action '{}'", name))
        })?;
        handler.prepare(payload)
    }
}

async fn run_checked(host: &dyn Host, command: &[String]) -> Result<(), String> {
    if host.run(command).await {
        Ok(())
    } else {
        Err(format!("command failed: {}", command.join(" ")))
    }
}

/// `exec`: a shell line or an argv list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Exec {
    Line(String),
    Argv(Vec<String>),
}

impl Exec {
    pub fn command(&self) -> Vec<String> {
        match self {
            Exec::Line(line) => argv(["sh", "-c", line.as_str()]),
            Exec::Argv(command) => command.clone(),
        }
    }
}

impl ActionPayload for Exec {
    const NAME: &'static str = "exec";

    fn validate(&self) -> Result<(), String> {
        match self {
            Exec::Line(line) if line.trim().is_empty() => Err("empty command".to_string()),
            Exec::Argv(command) if command.is_empty() => Err("empty command".to_string()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PreparedAction for Exec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, _context: &ActionContext) -> Result<(), String> {
        debug!("Executing command {:?} on {}", self, host.alias());
        run_checked(host, &self.command()).await
    }
}

/// `exec_control_script`: run a script through the control shell
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecControlScript {
    pub script: String,
    #[serde(default)]
    pub connection_string: String,
    #[serde(default = "default_script_path")]
    pub remote_file: String,
}

fn default_script_path() -> String {
    "/tmp/control_script.js".to_string()
}

impl ActionPayload for ExecControlScript {
    const NAME: &'static str = "exec_control_script";
}

#[async_trait]
impl PreparedAction for ExecControlScript {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, context: &ActionContext) -> Result<(), String> {
        let target = ControlTarget::new(&self.connection_string, &self.remote_file)
            .with_credentials(context.credentials.clone());
        match host.exec_control_script(&self.script, &target, None).await {
            Ok(0) => Ok(()),
            Ok(status) => Err(format!("control script exited with {}", status)),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadEntry {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    pub target: String,
}

/// `upload_files`: local files, or inline content, to the host
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct UploadFiles(pub Vec<UploadEntry>);

impl ActionPayload for UploadFiles {
    const NAME: &'static str = "upload_files";

    fn validate(&self) -> Result<(), String> {
        for entry in &self.0 {
            let has_source = entry.source.as_deref().is_some_and(|s| !s.is_empty());
            let has_content = entry.content.as_deref().is_some_and(|c| !c.is_empty());
            if !has_source && !has_content {
                return Err(format!(
                    "{}: either a source file or content is required",
                    entry.target
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PreparedAction for UploadFiles {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, _context: &ActionContext) -> Result<(), String> {
        for entry in &self.0 {
            let result = match (&entry.source, &entry.content) {
                (Some(source), _) if !source.is_empty() => {
                    host.upload_file(source.as_ref(), &entry.target).await
                }
                (_, Some(content)) => host.create_file(&entry.target, content).await,
                _ => Ok(()),
            };
            result.map_err(|e| format!("upload to {} failed: {}", entry.target, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathPair {
    pub source: String,
    pub target: String,
}

/// `upload_repo_files`: files relative to the repository root
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct UploadRepoFiles(pub Vec<PathPair>);

impl ActionPayload for UploadRepoFiles {
    const NAME: &'static str = "upload_repo_files";
}

#[async_trait]
impl PreparedAction for UploadRepoFiles {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, context: &ActionContext) -> Result<(), String> {
        for pair in &self.0 {
            let source = context.repo_root.join(&pair.source);
            host.upload_file(&source, &pair.target)
                .await
                .map_err(|e| format!("upload of {} failed: {}", source.display(), e))?;
        }
        Ok(())
    }
}

/// `retrieve_files`: host files into `reports/<prefix>/<alias>/<target>`
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct RetrieveFiles(pub Vec<PathPair>);

impl ActionPayload for RetrieveFiles {
    const NAME: &'static str = "retrieve_files";
}

#[async_trait]
impl PreparedAction for RetrieveFiles {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, context: &ActionContext) -> Result<(), String> {
        for pair in &self.0 {
            let local = report_path(&context.work_dir, &context.prefix, host.alias(), &pair.target);
            info!("Retrieving {} from {} to {}", pair.source, host.alias(), local.display());
            host.retrieve_file(&pair.source, &local)
                .await
                .map_err(|e| format!("retrieve of {} failed: {}", pair.source, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoCheckout {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

/// `checkout_repos`: clone unless present, then check out a branch
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct CheckoutRepos(pub Vec<RepoCheckout>);

impl ActionPayload for CheckoutRepos {
    const NAME: &'static str = "checkout_repos";
}

#[async_trait]
impl PreparedAction for CheckoutRepos {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, _context: &ActionContext) -> Result<(), String> {
        for repo in &self.0 {
            let git_dir = format!("{}/.git", repo.target.trim_end_matches('/'));
            if !host.run(&argv(["test", "-d", git_dir.as_str()])).await {
                let mut clone = argv(["git", "clone"]);
                if !repo.verbose {
                    clone.push("--quiet".to_string());
                }
                clone.push(repo.source.clone());
                clone.push(repo.target.clone());
                run_checked(host, &clone).await?;
            }
            if let Some(branch) = &repo.branch {
                run_checked(
                    host,
                    &argv(["git", "-C", repo.target.as_str(), "checkout", branch.as_str()]),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Download {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub verbose: bool,
}

/// `download_files`: fetch URLs onto the host
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct DownloadFiles(pub Vec<Download>);

impl ActionPayload for DownloadFiles {
    const NAME: &'static str = "download_files";
}

#[async_trait]
impl PreparedAction for DownloadFiles {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, _context: &ActionContext) -> Result<(), String> {
        for download in &self.0 {
            let flags = if download.verbose { "-fL" } else { "-sSfL" };
            run_checked(
                host,
                &argv([
                    "curl",
                    flags,
                    "--create-dirs",
                    "-o",
                    download.target.as_str(),
                    download.source.as_str(),
                ]),
            )
            .await?;
        }
        Ok(())
    }
}

/// `network_delays`: replace the root qdisc with a netem delay
///
/// A zero delay only removes the existing qdisc.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDelays {
    #[serde(default = "default_interface")]
    pub interface: String,
    pub delay_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_interface() -> String {
    "eth0".to_string()
}

impl NetworkDelays {
    /// Payload that removes any delay on `interface`
    pub fn reset(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            delay_ms: 0,
            jitter_ms: 0,
        }
    }

    pub fn commands(&self) -> (Vec<String>, Option<Vec<String>>) {
        let interface = self.interface.as_str();
        let remove = argv(["sudo", "tc", "qdisc", "del", "dev", interface, "root"]);
        let add = (self.delay_ms > 0).then(|| {
            let mut add = argv([
                "sudo", "tc", "qdisc", "add", "dev", interface, "root", "netem", "delay",
            ]);
            add.push(format!("{}ms", self.delay_ms));
            if self.jitter_ms > 0 {
                add.push(format!("{}ms", self.jitter_ms));
            }
            add
        });
        (remove, add)
    }
}

impl ActionPayload for NetworkDelays {
    const NAME: &'static str = "network_delays";

    fn validate(&self) -> Result<(), String> {
        if self.interface.is_empty() {
            return Err("interface must not be empty".to_string());
        }
        if self.delay_ms == 0 && self.jitter_ms > 0 {
            return Err("jitter_ms needs a non-zero delay_ms".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl PreparedAction for NetworkDelays {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, host: &dyn Host, _context: &ActionContext) -> Result<(), String> {
        let (remove, add) = self.commands();
        // fails when no qdisc is installed yet
        host.run(&remove).await;
        match add {
            Some(add) => {
                info!(
                    "Delaying {} on {} by {}ms",
                    self.interface,
                    host.alias(),
                    self.delay_ms
                );
                run_checked(host, &add).await
            }
            None => Ok(()),
        }
    }
}

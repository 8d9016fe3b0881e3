use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::dispatcher::RawCommand;
use crate::error::{ClusterError, ClusterResult};
use crate::host::shell::SshSettings;
use crate::host::{Credentials, HostInfo};
use crate::topology::ClusterTopology;

/// Main cluster setup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Which product profile drives launch/probe/shutdown behavior
    #[serde(default)]
    pub product: ProductKind,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub ssh: SshSettings,

    /// CPU/NUMA wrapper prepended to launch commands
    #[serde(default)]
    pub numactl_prefix: CommandLine,

    /// Directory holding `bin/` with the database binaries
    #[serde(default)]
    pub mongo_dir: Option<String>,

    /// Control shell argv; `{connection}` and `{script}` are substituted
    #[serde(default)]
    pub control_shell: Option<CommandLine>,

    #[serde(default = "default_true")]
    pub clean_logs: bool,

    #[serde(default = "default_true")]
    pub clean_db_dir: bool,

    #[serde(default)]
    pub journal_dir: Option<String>,

    /// Options document passed to the graceful shutdown command
    #[serde(default = "default_shutdown_options")]
    pub shutdown_options: serde_json::Value,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub authentication: AuthConfig,

    /// Named host groups addressable as `on_<group>` by the command dispatcher
    #[serde(default)]
    pub host_groups: BTreeMap<String, Vec<HostInfo>>,

    /// Settings for the config-driven `generic` product
    #[serde(default)]
    pub generic: Option<GenericProductConfig>,

    #[serde(default)]
    pub topology: Vec<ClusterTopology>,

    #[serde(default)]
    pub pre_cluster_start: Vec<RawCommand>,

    #[serde(default)]
    pub post_cluster_start: Vec<RawCommand>,

    #[serde(default)]
    pub upon_error: Vec<RawCommand>,

    /// Additional named command phases (e.g. `between_tests`)
    #[serde(default)]
    pub phases: BTreeMap<String, Vec<RawCommand>>,
}

/// Product profile selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    /// Database-specific profile: replica sets, sharding, mongo shell probes
    #[default]
    Mongodb,
    /// Config-driven profile: launch/shutdown/readiness commands from `generic`
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Upper bound for one graceful shutdown attempt
    pub shutdown_ms: u64,
    /// Upper bound for SIGTERM before SIGKILL
    pub sigterm_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            shutdown_ms: 9 * 60 * 1000,
            sigterm_ms: 60 * 1000,
        }
    }
}

impl TimeoutsConfig {
    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    pub fn sigterm(&self) -> Duration {
        Duration::from_millis(self.sigterm_ms)
    }
}

/// Fixed attempt ceiling and fixed interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval_ms: u64) -> Self {
        Self {
            attempts,
            interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Node readiness probe
    pub node_up: PollPolicy,
    /// Preferred member becoming primary
    pub primary: PollPolicy,
    /// Every member reaching primary or secondary
    pub member: PollPolicy,
    /// Routers seeing every registered shard
    pub shard_count: PollPolicy,
    /// Sleep between graceful shutdown attempts
    pub shutdown_interval_ms: u64,
    /// Graceful shutdown attempts per node
    pub shutdown_retries: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            node_up: PollPolicy::new(10, 1000),
            primary: PollPolicy::new(120, 1000),
            member: PollPolicy::new(20, 1000),
            shard_count: PollPolicy::new(10, 1000),
            shutdown_interval_ms: 1000,
            shutdown_retries: 20,
        }
    }
}

impl PollingConfig {
    pub fn shutdown_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_interval_ms)
    }

    /// Zero-interval policies for tests and dry runs
    pub fn immediate() -> Self {
        Self {
            node_up: PollPolicy::new(10, 0),
            primary: PollPolicy::new(120, 0),
            member: PollPolicy::new(20, 0),
            shard_count: PollPolicy::new(10, 0),
            shutdown_interval_ms: 0,
            shutdown_retries: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
    /// Shared key file members use to authenticate to each other
    pub key_file: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "username".to_string(),
            password: "password".to_string(),
            key_file: None,
        }
    }
}

impl AuthConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Settings for the `generic` product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericProductConfig {
    /// Process names started by `launch_command`
    pub launch_program: CommandLine,
    pub launch_command: CommandLine,
    pub shutdown_command: CommandLine,
    /// Readiness script; `{host}` is replaced by the node's private address
    pub check_node_up: String,
    pub port: u16,
    pub directories: GenericDirectories,
    #[serde(default)]
    pub lock_file: Option<String>,
    #[serde(default)]
    pub other_config_files: Vec<ConfigFileSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericDirectories {
    pub log_dir: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    pub config_dir: String,
    #[serde(default)]
    pub journal_dir: Option<String>,
}

/// A file written to the node before launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFileSpec {
    pub remote_path: String,
    /// Written verbatim when a string, dumped as YAML otherwise
    pub content: serde_json::Value,
}

impl ConfigFileSpec {
    pub fn render(&self) -> ClusterResult<String> {
        render_document(&self.content)
    }
}

/// Render a document as file content: strings verbatim, everything else as YAML
pub fn render_document(content: &serde_json::Value) -> ClusterResult<String> {
    match content {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Ok(serde_yaml::to_string(other)?),
    }
}

/// Command tokens that may be written either as a list or as one
/// whitespace-separated string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CommandLine(pub Vec<String>);

impl CommandLine {
    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine(line.split_whitespace().map(str::to_string).collect())
    }
}

impl<'de> Deserialize<'de> for CommandLine {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Line(String),
            Tokens(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Line(line) => CommandLine::from(line.as_str()),
            Raw::Tokens(tokens) => CommandLine(tokens),
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_shutdown_options() -> serde_json::Value {
    serde_json::json!({ "force": true, "timeoutSecs": 5 })
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            product: ProductKind::default(),
            logging: LoggingConfig::default(),
            ssh: SshSettings::default(),
            numactl_prefix: CommandLine::default(),
            mongo_dir: None,
            control_shell: None,
            clean_logs: true,
            clean_db_dir: true,
            journal_dir: None,
            shutdown_options: default_shutdown_options(),
            timeouts: TimeoutsConfig::default(),
            polling: PollingConfig::default(),
            authentication: AuthConfig::default(),
            host_groups: BTreeMap::new(),
            generic: None,
            topology: Vec::new(),
            pre_cluster_start: Vec::new(),
            post_cluster_start: Vec::new(),
            upon_error: Vec::new(),
            phases: BTreeMap::new(),
        }
    }
}

impl SetupConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> ClusterResult<Self> {
        let config: SetupConfig = serde_yaml::from_str(content)
            .map_err(|e| ClusterError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> ClusterResult<()> {
        if self.product == ProductKind::Generic && self.generic.is_none() {
            return Err(ClusterError::config(
                "product 'generic' requires a 'generic' section",
            ));
        }

        if self.authentication.enabled {
            if self.product == ProductKind::Generic {
                return Err(ClusterError::UnsupportedTopology(
                    "authentication is only supported for product 'mongodb'".to_string(),
                ));
            }
            if self.authentication.username.is_empty() || self.authentication.password.is_empty()
            {
                return Err(ClusterError::config(
                    "authentication requires a username and password",
                ));
            }
        }

        let polls = [
            ("node_up", self.polling.node_up),
            ("primary", self.polling.primary),
            ("member", self.polling.member),
            ("shard_count", self.polling.shard_count),
        ];
        for (name, policy) in polls {
            if policy.attempts == 0 {
                return Err(ClusterError::config(format!(
                    "polling.{}.attempts must be at least 1",
                    name
                )));
            }
        }

        if self.polling.shutdown_retries == 0 {
            return Err(ClusterError::config(
                "polling.shutdown_retries must be at least 1",
            ));
        }

        Ok(())
    }

    /// Directory holding the database `bin/` directory
    pub fn bin_dir(&self) -> String {
        format!("{}/bin", self.mongo_dir.as_deref().unwrap_or("/usr"))
    }

    /// Control shell argv for the configured product
    pub fn control_shell(&self) -> Vec<String> {
        if let Some(shell) = &self.control_shell {
            return shell.tokens().to_vec();
        }
        match self.product {
            ProductKind::Mongodb => vec![
                format!("{}/mongo", self.bin_dir()),
                "--quiet".to_string(),
                "{connection}".to_string(),
                "{script}".to_string(),
            ],
            ProductKind::Generic => vec!["sh".to_string(), "{script}".to_string()],
        }
    }

    /// Credentials once authentication is configured
    pub fn credentials(&self) -> Option<Credentials> {
        self.authentication
            .enabled
            .then(|| self.authentication.credentials())
    }

    /// Command list for a named phase
    pub fn phase(&self, name: &str) -> &[RawCommand] {
        match name {
            "pre_cluster_start" => &self.pre_cluster_start,
            "post_cluster_start" => &self.post_cluster_start,
            "upon_error" => &self.upon_error,
            other => self.phases.get(other).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    /// Every phase name with its commands
    pub fn all_phases(&self) -> Vec<(&str, &[RawCommand])> {
        let mut phases: Vec<(&str, &[RawCommand])> = vec![
            ("pre_cluster_start", &self.pre_cluster_start),
            ("post_cluster_start", &self.post_cluster_start),
            ("upon_error", &self.upon_error),
        ];
        for (name, commands) in &self.phases {
            phases.push((name.as_str(), commands.as_slice()));
        }
        phases
    }
}

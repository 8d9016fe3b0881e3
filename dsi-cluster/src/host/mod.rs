//! Host capability - run commands and move files on one machine
//!
//! Every controller talks to its machine only through [`Host`]:
//! - Run an argv command and report success
//! - Write/upload/retrieve files
//! - Run a script through the database control shell
//! - Signal processes by name
//!
//! Hosts are created lazily through a [`HostFactory`] and never shared
//! between nodes.

pub mod shell;

pub use shell::{ShellHost, ShellHostFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Addressing information for one machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostInfo {
    pub public_ip: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    /// Name used in logs and report paths (defaults to the public ip)
    #[serde(default)]
    pub alias: Option<String>,
}

impl HostInfo {
    pub fn new(public_ip: impl Into<String>, private_ip: impl Into<String>) -> Self {
        Self {
            public_ip: public_ip.into(),
            private_ip: Some(private_ip.into()),
            alias: None,
        }
    }

    pub fn private_ip(&self) -> &str {
        self.private_ip.as_deref().unwrap_or(&self.public_ip)
    }

    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.public_ip)
    }

    /// True when commands for this host can run without ssh
    pub fn is_local(&self) -> bool {
        matches!(self.public_ip.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Credentials passed to the control shell once authentication is enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Where and how a control script runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTarget {
    /// Connection string handed to the control shell (e.g. `localhost:27017`)
    pub connection: String,
    /// Remote path the script is written to before it runs
    pub script_path: String,
    pub credentials: Option<Credentials>,
}

impl ControlTarget {
    pub fn new(connection: impl Into<String>, script_path: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            script_path: script_path.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Process signals used by the lifecycle operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host error types
#[derive(Debug, Error)]
pub enum HostError {
    /// The connection dropped while the command ran. Expected when the
    /// command itself stops the remote server.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command failed ({status}): {command}")]
    CommandFailed { command: String, status: i32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Failures that are the normal side effect of stopping a server
    pub fn is_likely_benign(&self) -> bool {
        matches!(self, HostError::ConnectionClosed(_))
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Capability to act on one machine
#[async_trait]
pub trait Host: Send + Sync {
    /// Name used in logs and report paths
    fn alias(&self) -> &str;

    /// Run one argv command, true on exit status 0
    async fn run(&self, command: &[String]) -> bool;

    /// Run commands in order, stopping at the first failure
    async fn run_all(&self, commands: &[Vec<String>]) -> bool {
        for command in commands {
            if !self.run(command).await {
                return false;
            }
        }
        true
    }

    /// Write `content` to `remote_path`
    async fn create_file(&self, remote_path: &str, content: &str) -> HostResult<()>;

    /// Run `script` in the control shell against `target`, returning its exit code
    async fn exec_control_script(
        &self,
        script: &str,
        target: &ControlTarget,
        max_time: Option<Duration>,
    ) -> HostResult<i32>;

    async fn upload_file(&self, source: &Path, target: &str) -> HostResult<()>;

    async fn retrieve_file(&self, source: &str, target: &Path) -> HostResult<()>;

    /// Signal every process named `name`, waiting up to `max_time` for them to
    /// exit. True when no matching process remains.
    async fn kill_process_by_name(
        &self,
        name: &str,
        signal: Signal,
        max_time: Option<Duration>,
    ) -> bool;

    async fn close(&self);
}

/// Creates hosts on demand
pub trait HostFactory: Send + Sync {
    fn make_host(&self, info: &HostInfo) -> HostResult<Box<dyn Host>>;
}

/// Convert a list of string slices into an argv vector
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

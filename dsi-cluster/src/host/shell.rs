//! Process-backed host
//!
//! Runs commands through `sh -c`, either on this machine or through the
//! system `ssh`/`scp` binaries. Arguments are quoted except for shell globs,
//! so cleanup commands such as `rm -rf /logs/*.log` expand remotely.

use super::{ControlTarget, Host, HostError, HostFactory, HostInfo, HostResult, Signal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Interval between process checks while waiting for a signalled process to exit
const KILL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a signal without its own `max_time` waits for the process table
/// to clear. A SIGKILLed process stays listed until pending I/O completes.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// SSH settings shared by all remote hosts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum Transport {
    Local,
    Ssh {
        destination: String,
        key_file: Option<PathBuf>,
    },
}

/// Host that shells out to local processes
pub struct ShellHost {
    info: HostInfo,
    transport: Transport,
    control_shell: Vec<String>,
}

impl ShellHost {
    pub fn new(info: HostInfo, ssh: &SshSettings, control_shell: Vec<String>) -> Self {
        let transport = if info.is_local() {
            Transport::Local
        } else {
            let destination = match &ssh.user {
                Some(user) => format!("{}@{}", user, info.public_ip),
                None => info.public_ip.clone(),
            };
            Transport::Ssh {
                destination,
                key_file: ssh.key_file.clone(),
            }
        };

        Self {
            info,
            transport,
            control_shell,
        }
    }

    fn ssh_options(key_file: &Option<PathBuf>) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(key) = key_file {
            options.push("-i".to_string());
            options.push(key.display().to_string());
        }
        options
    }

    /// Build the local process that runs `line` on this host
    fn shell_command(&self, line: &str) -> Command {
        match &self.transport {
            Transport::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            Transport::Ssh {
                destination,
                key_file,
            } => {
                let mut cmd = Command::new("ssh");
                cmd.args(Self::ssh_options(key_file))
                    .arg(destination)
                    .arg(line);
                cmd
            }
        }
    }

    async fn output(&self, line: &str, stdin: Option<&str>) -> HostResult<Output> {
        let mut cmd = self.shell_command(line);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::Transport(format!("{}: {}", self.info.alias(), e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;

        if matches!(self.transport, Transport::Ssh { .. })
            && output.status.code() == Some(SSH_CONNECTION_FAILURE)
        {
            return Err(HostError::ConnectionClosed(format!(
                "{}: {}",
                self.info.alias(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output)
    }

    async fn copy(&self, source: &str, target: &str, upload: bool) -> HostResult<()> {
        match &self.transport {
            Transport::Local => {
                if let Some(parent) = Path::new(target).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(source, target).await?;
                Ok(())
            }
            Transport::Ssh {
                destination,
                key_file,
            } => {
                let (from, to) = if upload {
                    (source.to_string(), format!("{}:{}", destination, target))
                } else {
                    if let Some(parent) = Path::new(target).parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    (format!("{}:{}", destination, source), target.to_string())
                };

                let status = Command::new("scp")
                    .args(Self::ssh_options(key_file))
                    .arg("-r")
                    .arg(&from)
                    .arg(&to)
                    .stdin(Stdio::null())
                    .status()
                    .await?;

                if status.success() {
                    Ok(())
                } else {
                    Err(HostError::CommandFailed {
                        command: format!("scp {} {}", from, to),
                        status: status.code().unwrap_or(-1),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Host for ShellHost {
    fn alias(&self) -> &str {
        self.info.alias()
    }

    async fn run(&self, command: &[String]) -> bool {
        let line = shell_join(command);
        debug!("[{}] running: {}", self.alias(), line);

        match self.output(&line, None).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if !stdout.trim().is_empty() {
                    info!("[{}] {}", self.alias(), stdout.trim_end());
                }
                if !output.status.success() {
                    warn!(
                        "[{}] command failed ({:?}): {}: {}",
                        self.alias(),
                        output.status.code(),
                        line,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                output.status.success()
            }
            Err(e) => {
                warn!("[{}] could not run {}: {}", self.alias(), line, e);
                false
            }
        }
    }

    async fn create_file(&self, remote_path: &str, content: &str) -> HostResult<()> {
        let line = format!("cat > {}", quote(remote_path));
        let output = self.output(&line, Some(content)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(HostError::CommandFailed {
                command: line,
                status: output.status.code().unwrap_or(-1),
            })
        }
    }

    async fn exec_control_script(
        &self,
        script: &str,
        target: &ControlTarget,
        max_time: Option<Duration>,
    ) -> HostResult<i32> {
        self.create_file(&target.script_path, script).await?;

        let line = shell_join(&control_command(&self.control_shell, target));
        let output = match max_time {
            Some(limit) => tokio::time::timeout(limit, self.output(&line, None))
                .await
                .map_err(|_| {
                    HostError::Transport(format!("control script exceeded {:?}", limit))
                })??,
            None => self.output(&line, None).await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("[{}] {}", self.alias(), stdout.trim_end());
        }

        output
            .status
            .code()
            .ok_or_else(|| HostError::Transport("control shell killed by signal".to_string()))
    }

    async fn upload_file(&self, source: &Path, target: &str) -> HostResult<()> {
        info!("[{}] uploading {} to {}", self.alias(), source.display(), target);
        self.copy(&source.display().to_string(), target, true).await
    }

    async fn retrieve_file(&self, source: &str, target: &Path) -> HostResult<()> {
        info!(
            "[{}] retrieving {} to {}",
            self.alias(),
            source,
            target.display()
        );
        self.copy(source, &target.display().to_string(), false)
            .await
    }

    async fn kill_process_by_name(
        &self,
        name: &str,
        signal: Signal,
        max_time: Option<Duration>,
    ) -> bool {
        let pkill = vec![
            "pkill".to_string(),
            format!("-{}", signal.as_str()),
            name.to_string(),
        ];
        let pgrep = vec!["pgrep".to_string(), name.to_string()];

        let (pkill, pgrep) = (&pkill, &pgrep);
        let gone = repeat_until(confirm_limit(max_time), KILL_POLL_INTERVAL, move || async move {
            // pkill exits 1 when nothing matched, which is fine here
            let _ = self.output(&shell_join(pkill), None).await;
            !self.run(pgrep).await
        })
        .await;

        if !gone {
            warn!(
                "[{}] {} still running after {}",
                self.alias(),
                name,
                signal
            );
        }
        gone
    }

    async fn close(&self) {
        debug!("[{}] closing host", self.alias());
    }
}

fn confirm_limit(max_time: Option<Duration>) -> Duration {
    max_time.unwrap_or(KILL_CONFIRM_TIMEOUT)
}

/// Run `attempt` until it returns true, at least once and then every
/// `interval` until `limit` has passed
async fn repeat_until<F, Fut>(limit: Duration, interval: Duration, mut attempt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if attempt().await {
            return true;
        }
        if started.elapsed() >= limit {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Creates [`ShellHost`]s
pub struct ShellHostFactory {
    ssh: SshSettings,
    control_shell: Vec<String>,
}

impl ShellHostFactory {
    pub fn new(ssh: SshSettings, control_shell: Vec<String>) -> Self {
        Self { ssh, control_shell }
    }
}

impl HostFactory for ShellHostFactory {
    fn make_host(&self, info: &HostInfo) -> HostResult<Box<dyn Host>> {
        Ok(Box::new(ShellHost::new(
            info.clone(),
            &self.ssh,
            self.control_shell.clone(),
        )))
    }
}

/// Expand the control shell template for `target`
///
/// `{connection}` and `{script}` are substituted in place; when the template
/// has neither, both are appended. Credentials follow the shell binary.
pub fn control_command(template: &[String], target: &ControlTarget) -> Vec<String> {
    let mut command = Vec::with_capacity(template.len() + 8);
    let mut substituted = false;

    for (i, token) in template.iter().enumerate() {
        match token.as_str() {
            "{connection}" => {
                command.push(target.connection.clone());
                substituted = true;
            }
            "{script}" => {
                command.push(target.script_path.clone());
                substituted = true;
            }
            _ => command.push(token.clone()),
        }

        if i == 0 {
            if let Some(credentials) = &target.credentials {
                command.extend([
                    "-u".to_string(),
                    credentials.username.clone(),
                    "-p".to_string(),
                    credentials.password.clone(),
                    "--authenticationDatabase".to_string(),
                    "admin".to_string(),
                ]);
            }
        }
    }

    if !substituted {
        command.push(target.connection.clone());
        command.push(target.script_path.clone());
    }
    command
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_-./*:=,@%+".contains(c)
}

/// Quote one argument for `sh`
pub fn quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(|c| c != '*' && is_shell_safe(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Join argv into one shell line, leaving glob-only arguments unquoted
pub fn shell_join(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| {
            if !arg.is_empty() && arg.chars().all(is_shell_safe) {
                arg.clone()
            } else {
                quote(arg)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

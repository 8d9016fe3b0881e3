//! Scripted in-memory hosts shared by the integration tests
//!
//! Every host call is recorded in one ordered log. Launch commands mark a
//! process as running; kill, SIGTERM and the shutdown script stop it.

#![allow(dead_code)]

use async_trait::async_trait;
use dsi_cluster::host::{
    ControlTarget, Host, HostError, HostFactory, HostInfo, HostResult, Signal,
};
use dsi_cluster::{PollingConfig, SetupConfig};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One recorded host call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run(Vec<String>),
    CreateFile {
        path: String,
        content: String,
    },
    Control {
        script: String,
        connection: String,
        authenticated: bool,
    },
    Signal { name: String, signal: Signal },
    Upload { target: String },
    Retrieve { source: String },
    Close,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub host: String,
    pub call: Call,
}

/// Shared state behind every mock host
#[derive(Default)]
pub struct World {
    events: Mutex<Vec<Event>>,
    /// (host, port, program)
    running: Mutex<BTreeSet<(String, u16, String)>>,
    /// Hosts whose launch command fails
    failing_launch: Mutex<HashSet<String>>,
    /// Hosts whose processes ignore the shutdown script
    stubborn: Mutex<HashSet<String>>,
    /// Hosts whose processes ignore SIGTERM
    ignore_term: Mutex<HashSet<String>>,
    /// Command substrings that fail on every host
    failing_commands: Mutex<Vec<String>>,
    /// Hosts the factory refuses to connect to
    unreachable: Mutex<HashSet<String>>,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn HostFactory> {
        Arc::new(MockHostFactory {
            world: Arc::clone(self),
        })
    }

    pub fn fail_launch_on(&self, host: &str) {
        self.failing_launch.lock().insert(host.to_string());
    }

    pub fn make_stubborn(&self, host: &str) {
        self.stubborn.lock().insert(host.to_string());
    }

    pub fn ignore_sigterm_on(&self, host: &str) {
        self.ignore_term.lock().insert(host.to_string());
    }

    pub fn fail_commands_containing(&self, pattern: &str) {
        self.failing_commands.lock().push(pattern.to_string());
    }

    pub fn make_unreachable(&self, host: &str) {
        self.unreachable.lock().insert(host.to_string());
    }

    /// Pretend a process from an earlier run is still alive
    pub fn start_process(&self, host: &str, port: u16, program: &str) {
        self.running
            .lock()
            .insert((host.to_string(), port, program.to_string()));
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn calls_on(&self, host: &str) -> Vec<Call> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.host == host)
            .map(|event| event.call.clone())
            .collect()
    }

    /// Control scripts containing `needle`, in order, with their host
    pub fn scripts_containing(&self, needle: &str) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match &event.call {
                Call::Control { script, .. } if script.contains(needle) => {
                    Some((event.host.clone(), script.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Index in the event log of the first call matching `predicate`
    pub fn position<F>(&self, predicate: F) -> Option<usize>
    where
        F: Fn(&Event) -> bool,
    {
        self.events.lock().iter().position(predicate)
    }

    /// Index of the last call matching `predicate`
    pub fn last_position<F>(&self, predicate: F) -> Option<usize>
    where
        F: Fn(&Event) -> bool,
    {
        self.events.lock().iter().rposition(predicate)
    }

    pub fn is_running(&self, host: &str) -> bool {
        self.running.lock().iter().any(|(h, _, _)| h == host)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    fn record(&self, host: &str, call: Call) {
        self.events.lock().push(Event {
            host: host.to_string(),
            call,
        });
    }
}

pub struct MockHostFactory {
    world: Arc<World>,
}

impl HostFactory for MockHostFactory {
    fn make_host(&self, info: &HostInfo) -> HostResult<Box<dyn Host>> {
        if self.world.unreachable.lock().contains(&info.public_ip) {
            return Err(HostError::Transport(format!(
                "cannot connect to {}",
                info.public_ip
            )));
        }
        Ok(Box::new(MockHost {
            alias: info.alias().to_string(),
            world: Arc::clone(&self.world),
        }))
    }
}

pub struct MockHost {
    alias: String,
    world: Arc<World>,
}

fn port_of_config(path: &str) -> Option<u16> {
    path.strip_prefix("/tmp/mongo_port_")?
        .strip_suffix(".conf")?
        .parse()
        .ok()
}

fn port_of_connection(connection: &str) -> Option<u16> {
    connection.rsplit(':').next()?.parse().ok()
}

fn program_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

impl MockHost {
    /// `<binary> --config /tmp/mongo_port_<port>.conf` starts a process
    fn launch(&self, command: &[String]) -> Option<bool> {
        let index = command.iter().position(|arg| arg == "--config")?;
        let program = program_name(command.get(index.checked_sub(1)?)?);
        let port = port_of_config(command.get(index + 1)?)?;
        if self.world.failing_launch.lock().contains(&self.alias) {
            return Some(false);
        }
        self.world
            .running
            .lock()
            .insert((self.alias.clone(), port, program));
        Some(true)
    }

    fn process_running(&self, port: u16) -> bool {
        self.world
            .running
            .lock()
            .iter()
            .any(|(host, p, _)| host == &self.alias && *p == port)
    }

    fn stop_port(&self, port: u16) {
        self.world
            .running
            .lock()
            .retain(|(host, p, _)| !(host == &self.alias && *p == port));
    }
}

#[async_trait]
impl Host for MockHost {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn run(&self, command: &[String]) -> bool {
        self.world.record(&self.alias, Call::Run(command.to_vec()));
        tokio::task::yield_now().await;

        let line = command.join(" ");
        if self
            .world
            .failing_commands
            .lock()
            .iter()
            .any(|pattern| line.contains(pattern.as_str()))
        {
            return false;
        }
        if let Some(launched) = self.launch(command) {
            return launched;
        }
        if command.first().map(String::as_str) == Some("pgrep") {
            let program = command.last().cloned().unwrap_or_default();
            return self
                .world
                .running
                .lock()
                .iter()
                .any(|(host, _, p)| host == &self.alias && *p == program);
        }
        true
    }

    async fn create_file(&self, remote_path: &str, content: &str) -> HostResult<()> {
        self.world.record(
            &self.alias,
            Call::CreateFile {
                path: remote_path.to_string(),
                content: content.to_string(),
            },
        );
        Ok(())
    }

    async fn exec_control_script(
        &self,
        script: &str,
        target: &ControlTarget,
        _max_time: Option<Duration>,
    ) -> HostResult<i32> {
        self.world.record(
            &self.alias,
            Call::Control {
                script: script.to_string(),
                connection: target.connection.clone(),
                authenticated: target.credentials.is_some(),
            },
        );
        tokio::task::yield_now().await;

        if self
            .world
            .failing_commands
            .lock()
            .iter()
            .any(|pattern| script.contains(pattern.as_str()))
        {
            return Ok(1);
        }

        let port = port_of_connection(&target.connection);
        if script.contains("shutdownServer") {
            if self.world.stubborn.lock().contains(&self.alias) {
                return Ok(1);
            }
            if let Some(port) = port {
                self.stop_port(port);
            }
            return Err(HostError::ConnectionClosed(
                "server closed the connection".to_string(),
            ));
        }
        if script.contains("serverStatus") {
            let up = port.is_some_and(|port| self.process_running(port));
            return Ok(if up { 0 } else { 1 });
        }
        Ok(0)
    }

    async fn upload_file(&self, _source: &Path, target: &str) -> HostResult<()> {
        self.world.record(
            &self.alias,
            Call::Upload {
                target: target.to_string(),
            },
        );
        Ok(())
    }

    async fn retrieve_file(&self, source: &str, target: &Path) -> HostResult<()> {
        self.world.record(
            &self.alias,
            Call::Retrieve {
                source: source.to_string(),
            },
        );
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, format!("{} from {}", source, self.alias))?;
        Ok(())
    }

    async fn kill_process_by_name(
        &self,
        name: &str,
        signal: Signal,
        _max_time: Option<Duration>,
    ) -> bool {
        self.world.record(
            &self.alias,
            Call::Signal {
                name: name.to_string(),
                signal,
            },
        );
        if signal == Signal::Term && self.world.ignore_term.lock().contains(&self.alias) {
            return !self
                .world
                .running
                .lock()
                .iter()
                .any(|(host, _, p)| host == &self.alias && p == name);
        }
        self.world
            .running
            .lock()
            .retain(|(host, _, p)| !(host == &self.alias && p == name));
        true
    }

    async fn close(&self) {
        self.world.record(&self.alias, Call::Close);
    }
}

/// Parse a test configuration with zero-interval polling
pub fn config(yaml: &str) -> SetupConfig {
    let mut config = SetupConfig::from_yaml(yaml).expect("valid test configuration");
    config.polling = PollingConfig::immediate();
    config
}

/// Node entry with the config document a mongod needs
pub fn mongod(ip: &str, port: u16) -> String {
    mongod_with(ip, port, "")
}

/// Like [`mongod`], with extra node keys such as `id: n1, `
pub fn mongod_with(ip: &str, port: u16, extra: &str) -> String {
    format!(
        "{{public_ip: {ip}, {extra}config_file: {{net: {{port: {port}}}, \
         systemLog: {{path: /data/logs/mongod.log}}, storage: {{dbPath: /data/dbs}}}}}}"
    )
}

pub fn mongos(ip: &str, port: u16) -> String {
    format!(
        "{{public_ip: {ip}, config_file: {{net: {{port: {port}}}, \
         systemLog: {{path: /data/logs/mongos.log}}}}}}"
    )
}

/// `topology:` section with one replica set of `members`
pub fn replset_yaml(id: &str, members: &[String]) -> String {
    let mut yaml = format!("topology:\n  - cluster_type: replset\n    id: {}\n    mongod:\n", id);
    for member in members {
        yaml.push_str(&format!("      - {}\n", member));
    }
    yaml
}

/// The membership document of an initiate script
pub fn initiate_document(script: &str) -> serde_json::Value {
    let json = script
        .strip_prefix("config = ")
        .and_then(|rest| rest.split(";\n").next())
        .expect("initiate script");
    serde_json::from_str(json).expect("membership document")
}

pub fn is_launch(event: &Event) -> bool {
    matches!(&event.call, Call::Run(command) if command.iter().any(|arg| arg == "--config"))
}

pub fn is_control_on(event: &Event, host: &str, needle: &str) -> bool {
    event.host == host
        && matches!(&event.call, Call::Control { script, .. } if script.contains(needle))
}

//! Phase parsing
//!
//! A phase is an ordered list of single-entry maps `{target: command}`.
//! Parsing resolves every target and action up front so that a typo in a
//! late phase is reported before the first remote command runs.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::actions::{ActionRegistry, Exec, PreparedAction};
use super::groups::{ALL_HOSTS, HostGroups};
use super::{DispatchError, DispatchResult};

/// One raw `{target: command}` entry as read from configuration
pub type RawCommand = Map<String, Value>;

const RESTART_TARGETS: [&str; 3] = ["restart_cluster", "restart_database", "restart_mongodb"];

/// Payload of a `restart_cluster` target
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartRequest {
    #[serde(default)]
    pub clean_db_dir: Option<bool>,
    #[serde(default)]
    pub clean_logs: Option<bool>,
    /// Restrict the restart to these node ids
    #[serde(default)]
    pub nodes: Option<Vec<String>>,
}

/// A resolved phase entry
#[derive(Debug, Clone)]
pub enum Step {
    /// Run actions, in order, on every host of a group
    OnHosts {
        target: String,
        group: String,
        actions: Vec<Arc<dyn PreparedAction>>,
    },
    Restart {
        target: String,
        request: RestartRequest,
    },
}

impl Step {
    pub fn target(&self) -> &str {
        match self {
            Step::OnHosts { target, .. } | Step::Restart { target, .. } => target,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::OnHosts {
                target, actions, ..
            } => {
                let names: Vec<_> = actions.iter().map(|action| action.name()).collect();
                write!(f, "{}: [{}]", target, names.join(", "))
            }
            Step::Restart { target, request } => write!(f, "{}: {:?}", target, request),
        }
    }
}

/// Resolve one phase
pub fn parse_phase(
    phase: &str,
    commands: &[RawCommand],
    groups: &HostGroups,
    registry: &ActionRegistry,
) -> DispatchResult<Vec<Step>> {
    commands
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let mut targets = entry.iter();
            match (targets.next(), targets.next()) {
                (Some((target, command)), None) => {
                    parse_step(target, command, groups, registry).map_err(|e| {
                        DispatchError::Configuration(format!("{}[{}]: {}", phase, index, e))
                    })
                }
                _ => Err(DispatchError::Configuration(format!(
                    "{}[{}]: each entry must have exactly one target, found {}",
                    phase,
                    index,
                    entry.len()
                ))),
            }
        })
        .collect()
}

fn parse_step(
    target: &str,
    command: &Value,
    groups: &HostGroups,
    registry: &ActionRegistry,
) -> Result<Step, String> {
    if let Some(group) = target.strip_prefix("on_") {
        if !groups.contains(group) {
            return Err(format!("unknown host group '{}'", group));
        }
        let actions = parse_actions(command, registry)?;
        return Ok(Step::OnHosts {
            target: target.to_string(),
            group: group.to_string(),
            actions,
        });
    }

    if RESTART_TARGETS.contains(&target) {
        let request: RestartRequest = serde_json::from_value(command.clone())
            .map_err(|e| format!("invalid {} payload: {}", target, e))?;
        return Ok(Step::Restart {
            target: target.to_string(),
            request,
        });
    }

    if target == "network_delays" {
        let action = registry
            .prepare("network_delays", command)
            .map_err(|e| e.to_string())?;
        return Ok(Step::OnHosts {
            target: target.to_string(),
            group: ALL_HOSTS.to_string(),
            actions: vec![action],
        });
    }

    Err(format!("unknown target '{}'", target))
}

/// A bare string is shorthand for `exec`; a map lists actions in order
fn parse_actions(
    command: &Value,
    registry: &ActionRegistry,
) -> Result<Vec<Arc<dyn PreparedAction>>, String> {
    match command {
        Value::String(line) => {
            let action: Arc<dyn PreparedAction> = Arc::new(Exec::Line(line.clone()));
            Ok(vec![action])
        }
        Value::Object(actions) if !actions.is_empty() => actions
            .iter()
            .map(|(name, payload)| registry.prepare(name, payload).map_err(|e| e.to_string()))
            .collect(),
        other => Err(format!("expected a command string or an action map, got {}", other)),
    }
}

use thiserror::Error;

use crate::host::HostError;

/// Main error type for cluster construction and orchestration
///
/// Lifecycle operations (`setup_host`, `launch`, `shutdown`, `destroy`) report
/// failure as `false`; this type is used where a failure must stop the caller
/// outright, mostly while building the topology.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported topology: {0}")]
    UnsupportedTopology(String),

    #[error("Remote execution failed on {host}: {detail}")]
    RemoteExecution { host: String, detail: String },

    #[error("Timed out after {attempts} attempts: {what}")]
    Timeout { what: String, attempts: u32 },

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True for errors raised while building the topology, before any remote action
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnsupportedTopology(_) | Self::Yaml(_)
        )
    }
}

/// Result type alias for cluster operations
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_errors() {
        assert!(ClusterError::config("missing net.port").is_construction_error());
        assert!(ClusterError::UnsupportedTopology("scc".to_string()).is_construction_error());
        assert!(
            !ClusterError::Timeout {
                what: "primary".to_string(),
                attempts: 120
            }
            .is_construction_error()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ClusterError::RemoteExecution {
            host: "10.2.0.1".to_string(),
            detail: "exit status 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Remote execution failed on 10.2.0.1: exit status 1"
        );
    }
}

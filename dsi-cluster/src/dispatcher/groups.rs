use std::collections::BTreeMap;

use crate::cluster::{ClusterComponent, NodeRole};
use crate::host::HostInfo;

/// Built-in group holding every known host
pub const ALL_HOSTS: &str = "all_hosts";
/// Built-in group holding only this machine
pub const LOCALHOST: &str = "localhost";

/// Named host groups addressable as `on_<group>`
#[derive(Debug, Clone, Default)]
pub struct HostGroups {
    groups: BTreeMap<String, Vec<HostInfo>>,
}

impl HostGroups {
    pub fn new(configured: BTreeMap<String, Vec<HostInfo>>) -> Self {
        Self { groups: configured }
    }

    /// Add `mongod`, `mongos` and `configsvr` groups from the built topology
    pub fn with_topology(mut self, clusters: &[ClusterComponent]) -> Self {
        for cluster in clusters {
            for node in cluster.nodes() {
                let group = match node.role() {
                    NodeRole::Router => "mongos",
                    NodeRole::ConfigMember => "configsvr",
                    NodeRole::Standalone | NodeRole::ShardMember => "mongod",
                };
                let hosts = self.groups.entry(group.to_string()).or_default();
                if !hosts.contains(node.host_info()) {
                    hosts.push(node.host_info().clone());
                }
            }
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(name, ALL_HOSTS | LOCALHOST) || self.groups.contains_key(name)
    }

    /// Hosts of one group, `None` when the group is unknown
    pub fn resolve(&self, name: &str) -> Option<Vec<HostInfo>> {
        match name {
            ALL_HOSTS => Some(self.all_hosts()),
            LOCALHOST => Some(vec![HostInfo {
                public_ip: "localhost".to_string(),
                private_ip: Some("127.0.0.1".to_string()),
                alias: Some("localhost".to_string()),
            }]),
            other => self.groups.get(other).cloned(),
        }
    }

    /// Every host of every group, once each, by public address
    pub fn all_hosts(&self) -> Vec<HostInfo> {
        let mut hosts: Vec<HostInfo> = Vec::new();
        for group in self.groups.values() {
            for host in group {
                if !hosts.iter().any(|known| known.public_ip == host.public_ip) {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }
}

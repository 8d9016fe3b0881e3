pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod host;
pub mod logging;
pub mod product;
pub mod setup;
pub mod topology;

// Re-export commonly used types
pub use cluster::{
    ClusterComponent, ClusterContext, LaunchOptions, Node, NodeFilter, NodeRole, NodeState,
    ReplicaSet, ShardUnit, ShardedCluster,
};
pub use config::{PollPolicy, PollingConfig, ProductKind, SetupConfig};
pub use dispatcher::{
    ActionRegistry, ClusterRestart, CommandDispatcher, DispatchError, DispatchResult,
    FailurePolicy, HostGroups,
};
pub use error::{ClusterError, ClusterResult};
pub use host::{Host, HostError, HostFactory, HostInfo, ShellHost, ShellHostFactory};
pub use product::{Product, ReplicationProtocol};
pub use setup::ClusterSetup;
pub use topology::{ClusterTopology, TopologyBuilder};

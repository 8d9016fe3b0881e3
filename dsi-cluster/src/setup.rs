//! Cluster setup - lifecycle of every top-level cluster
//!
//! A first start kills whatever a previous run left behind, runs the
//! `pre_cluster_start` commands, starts all clusters in parallel and then
//! runs `post_cluster_start`. With authentication configured, users are
//! created on the fresh clusters which are then restarted with access
//! control on.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterComponent, ClusterContext, LaunchOptions, NodeFilter};
use crate::config::SetupConfig;
use crate::dispatcher::{
    ClusterRestart, CommandDispatcher, DispatchResult, FailurePolicy, HostGroups,
};
use crate::error::{ClusterError, ClusterResult};
use crate::fanout::{self, Action};
use crate::host::HostFactory;
use crate::topology::TopologyBuilder;

/// Every top-level cluster of one configuration
pub struct ClusterSetup {
    config: Arc<SetupConfig>,
    clusters: Vec<ClusterComponent>,
    /// Set once the clusters run with access control
    auth_active: AtomicBool,
}

impl ClusterSetup {
    /// Build the topology; fails before any remote action on a bad topology
    pub fn new(config: Arc<SetupConfig>, hosts: Arc<dyn HostFactory>) -> ClusterResult<Self> {
        let context = Arc::new(ClusterContext::from_config(&config, hosts)?);
        let clusters = TopologyBuilder::new(context).build_all(&config.topology)?;
        info!("Built {} clusters", clusters.len());

        Ok(Self {
            config,
            clusters,
            auth_active: AtomicBool::new(false),
        })
    }

    pub fn clusters(&self) -> &[ClusterComponent] {
        &self.clusters
    }

    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    /// Configured host groups plus the groups derived from the topology
    pub fn host_groups(&self) -> HostGroups {
        HostGroups::new(self.config.host_groups.clone()).with_topology(&self.clusters)
    }

    pub fn auth_active(&self) -> bool {
        self.auth_active.load(Ordering::SeqCst)
    }

    /// First start of all clusters
    ///
    /// Leftover processes are killed outright, not shut down. Command phases
    /// run under [`FailurePolicy::Exit`].
    pub async fn start(&self, dispatcher: &CommandDispatcher) -> DispatchResult<bool> {
        self.destroy(self.config.timeouts.sigterm(), &NodeFilter::all())
            .await;

        info!("Running pre_cluster_start commands");
        dispatcher
            .run_phase("pre_cluster_start", FailurePolicy::Exit)
            .await?;

        let mut status = self
            .start_all(false, None, None, &NodeFilter::all(), false)
            .await;
        if status && self.config.authentication.enabled {
            status = self.enable_authentication().await;
        }

        info!("Running post_cluster_start commands");
        dispatcher
            .run_phase("post_cluster_start", FailurePolicy::Exit)
            .await?;

        Ok(status)
    }

    /// Stop (gracefully, else by force) and start again
    ///
    /// Cleaning the data directory re-bootstraps every group, which only
    /// makes sense for the whole topology, so a node filter is refused then.
    pub async fn restart(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> ClusterResult<bool> {
        debug!(
            "ClusterSetup.restart({:?}, {:?}, {:?})",
            clean_db_dir, clean_logs, filter
        );
        if clean_db_dir == Some(true) && !filter.is_all() {
            return Err(ClusterError::config(
                "restarting a subset of nodes is not supported with clean_db_dir=true",
            ));
        }

        let shutdown = self.shutdown(self.config.timeouts.shutdown(), None, filter).await;
        let destroy = self.destroy(self.config.timeouts.sigterm(), filter).await;
        if !(shutdown || destroy) {
            error!("Shutdown failed on restart");
            return Ok(false);
        }

        let enable_auth = self.auth_active();
        Ok(self
            .start_all(true, clean_db_dir, clean_logs, filter, enable_auth)
            .await)
    }

    /// Graceful shutdown of all clusters in parallel
    pub async fn shutdown(
        &self,
        max_time: Duration,
        auth_enabled: Option<bool>,
        filter: &NodeFilter,
    ) -> bool {
        info!("Calling shutdown for {} clusters", self.clusters.len());
        if !filter.is_all() {
            info!("...on a subset of nodes only: {:?}", filter);
        }
        let retries = self.config.polling.shutdown_retries;
        let tasks: Vec<Action> = self
            .clusters
            .iter()
            .map(|cluster| {
                let cluster = cluster.clone();
                let filter = filter.clone();
                async move { cluster.shutdown(max_time, auth_enabled, retries, &filter).await }
                    .boxed()
            })
            .collect();
        let result = fanout::run_all(tasks).await;
        warn!("shutdown: {}", if result { "succeeded" } else { "failed" });
        result
    }

    /// Kill all cluster processes in parallel
    pub async fn destroy(&self, max_time: Duration, filter: &NodeFilter) -> bool {
        info!("Calling destroy");
        let tasks: Vec<Action> = self
            .clusters
            .iter()
            .map(|cluster| {
                let cluster = cluster.clone();
                let filter = filter.clone();
                async move { cluster.destroy(max_time, &filter).await }.boxed()
            })
            .collect();
        let result = fanout::spawn_detached(tasks).join().await;
        if !result {
            warn!("destroy: failed");
        }
        result
    }

    /// Close every host connection
    pub async fn close(&self) {
        let tasks: Vec<Action> = self
            .clusters
            .iter()
            .map(|cluster| {
                let cluster = cluster.clone();
                async move {
                    cluster.close().await;
                    true
                }
                .boxed()
            })
            .collect();
        fanout::spawn_detached(tasks).join().await;
    }

    async fn start_all(
        &self,
        is_restart: bool,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
        enable_auth: bool,
    ) -> bool {
        // Keeping the data directory on restart keeps the bootstrapped state
        let options = LaunchOptions {
            initialize: !is_restart || clean_db_dir == Some(true),
            use_numactl: true,
            enable_auth,
        };

        let tasks: Vec<Action> = self
            .clusters
            .iter()
            .map(|cluster| {
                let cluster = cluster.clone();
                let filter = filter.clone();
                async move {
                    info!("starting topology: {}", cluster);
                    let started = cluster
                        .start(clean_db_dir, clean_logs, options, &filter)
                        .await;
                    if started {
                        info!("started topology: {}", cluster);
                    }
                    started
                }
                .boxed()
            })
            .collect();

        if !fanout::run_all(tasks).await {
            error!("Could not start clusters. Shutting down...");
            self.shutdown(self.config.timeouts.shutdown(), None, filter)
                .await;
            return false;
        }
        true
    }

    /// Create the admin user everywhere, then restart with access control
    async fn enable_authentication(&self) -> bool {
        info!("Adding default users for all clusters");
        let tasks: Vec<Action> = self
            .clusters
            .iter()
            .map(|cluster| {
                let cluster = cluster.clone();
                async move { cluster.add_default_users().await }.boxed()
            })
            .collect();
        if !fanout::run_all(tasks).await {
            error!("Could not add default users");
            return false;
        }

        let all = NodeFilter::all();
        if !self
            .shutdown(self.config.timeouts.shutdown(), Some(false), &all)
            .await
        {
            error!("Could not shut down clusters before enabling authentication");
            return false;
        }
        self.auth_active.store(true, Ordering::SeqCst);
        self.start_all(true, Some(false), Some(false), &all, true)
            .await
    }
}

#[async_trait]
impl ClusterRestart for ClusterSetup {
    async fn restart(
        &self,
        clean_db_dir: Option<bool>,
        clean_logs: Option<bool>,
        filter: &NodeFilter,
    ) -> ClusterResult<bool> {
        ClusterSetup::restart(self, clean_db_dir, clean_logs, filter).await
    }
}

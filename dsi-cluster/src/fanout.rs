//! Fan-out executor
//!
//! Two primitives for running sibling actions concurrently, one tokio task
//! per action:
//! - [`run_all`]: joining parallel map for startup-critical paths. Every
//!   action runs to completion even when a sibling fails.
//! - [`spawn_detached`]: parallel map for teardown. Tasks are not tied to the
//!   caller and never hold up process exit.
//!
//! [`bounded_poll`] is the fixed attempts x fixed interval wait used by every
//! readiness check; [`poll_until`] reports exhaustion as an error.

use futures_util::future::BoxFuture;
use std::future::Future;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

use crate::config::PollPolicy;
use crate::error::{ClusterError, ClusterResult};

/// One fanned-out action
pub type Action = BoxFuture<'static, bool>;

/// Run every action concurrently and join all of them
///
/// True only when every action returned true. A panicked action counts as a
/// failure. Dropping the returned future aborts the tasks still running.
pub async fn run_all(actions: Vec<Action>) -> bool {
    let mut set = JoinSet::new();
    for action in actions {
        set.spawn(action);
    }

    let mut all_ok = true;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(true) => {}
            Ok(false) => all_ok = false,
            Err(e) => {
                error!("Fan-out task did not complete: {}", e);
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Detached fan-out handle
///
/// Dropping it leaves the tasks running in the background.
pub struct DetachedFanOut {
    handles: Vec<JoinHandle<bool>>,
}

impl DetachedFanOut {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task, true when all of them returned true
    pub async fn join(self) -> bool {
        let mut all_ok = true;
        for handle in self.handles {
            match handle.await {
                Ok(ok) => all_ok &= ok,
                Err(e) => {
                    error!("Detached task did not complete: {}", e);
                    all_ok = false;
                }
            }
        }
        all_ok
    }
}

/// Start every action without waiting for any of them
pub fn spawn_detached(actions: Vec<Action>) -> DetachedFanOut {
    DetachedFanOut {
        handles: actions.into_iter().map(tokio::spawn).collect(),
    }
}

/// Call `probe` until it returns true or `policy.attempts` is exhausted,
/// sleeping `policy.interval()` between attempts
pub async fn bounded_poll<F, Fut>(policy: PollPolicy, mut probe: F) -> bool
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 0..policy.attempts {
        if probe(attempt).await {
            return true;
        }
        debug!("Poll attempt {}/{} failed", attempt + 1, policy.attempts);
        if attempt + 1 < policy.attempts {
            tokio::time::sleep(policy.interval()).await;
        }
    }
    false
}

/// [`bounded_poll`] that reports an exhausted ceiling as [`ClusterError::Timeout`]
pub async fn poll_until<F, Fut>(policy: PollPolicy, what: &str, check: F) -> ClusterResult<()>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    if bounded_poll(policy, check).await {
        Ok(())
    } else {
        Err(ClusterError::Timeout {
            what: what.to_string(),
            attempts: policy.attempts,
        })
    }
}

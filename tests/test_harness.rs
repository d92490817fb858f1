//! Test harness for in-process cluster integration tests.
//!
//! Provides utilities for starting a scheduler with simulated daemons on a
//! shared hub and waiting for the cluster to reach a given state.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use fleet_rm::bus::envelope::PeerIdentity;
use fleet_rm::config::{PresenceConfig, SchedulerConfig};
use fleet_rm::job::{AppSpec, JobId, JobSpec};
use fleet_rm::node::LocalCluster;
use fleet_rm::scheduler::SchedulerHandle;
use fleet_rm::status::{ClusterStatus, JobView};

/// Presence timing with shorter periods for faster tests
pub fn test_presence() -> PresenceConfig {
    PresenceConfig {
        heartbeat_interval_ms: 50,
        wireup_timeout_ms: 200,
    }
}

/// Scheduler configuration with shorter timeouts for faster tests
pub fn test_scheduler_config() -> SchedulerConfig {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    SchedulerConfig::new(1, addr)
        .with_presence(test_presence())
        .with_launch_timeout(2000)
}

/// A job of one app with `procs` simulated workers.
pub fn worker_job(name: &str, procs: u32, max_restarts: i32, max_local: u32) -> JobSpec {
    JobSpec::new(
        name,
        vec![AppSpec::new("worker", vec!["worker".into()], procs).with_restarts(max_restarts, max_local)],
    )
}

/// Start a cluster with one daemon per `(node, slots)` entry and wait until
/// bootstrap is over and every daemon is registered.
pub async fn start_cluster(nodes: &[(&str, u32)]) -> (LocalCluster, Vec<PeerIdentity>) {
    let mut cluster = LocalCluster::start(test_scheduler_config());
    let daemons: Vec<PeerIdentity> = nodes
        .iter()
        .map(|(node, slots)| cluster.add_daemon(node, *slots))
        .collect();

    let expected = daemons.len();
    let handle = cluster.scheduler.clone();
    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                match handle.status().await {
                    Ok(status) => status.bootstrapped && up_daemons(&status) == expected,
                    Err(_) => false,
                }
            }
        },
        Duration::from_secs(5),
        "Cluster should bootstrap with every daemon up",
    )
    .await;

    (cluster, daemons)
}

pub fn up_daemons(status: &ClusterStatus) -> usize {
    status
        .daemons
        .iter()
        .filter(|d| d.state == fleet_rm::job::DaemonState::Up)
        .count()
}

/// Current view of one job, active or finished.
pub async fn job_view(handle: &SchedulerHandle, id: JobId) -> Option<JobView> {
    handle.status().await.ok()?.job(id).cloned()
}

/// Wait until job `id` satisfies `check`, returning its last view.
pub async fn wait_for_job<F>(handle: &SchedulerHandle, id: JobId, check: F, timeout_duration: Duration) -> Option<JobView>
where
    F: Fn(&JobView) -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if let Some(view) = job_view(handle, id).await {
            if check(&view) {
                return Some(view);
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    None
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}

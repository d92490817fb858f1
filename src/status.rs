//! Read-only view of the scheduler's tables, served to tools and the dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::envelope::{PeerIdentity, Rank};
use crate::job::{
    DaemonRecord, DaemonState, JobId, JobRecord, JobState, NodeRecord, NodeState, ProcessRecord, ProcessState,
    ResourceUsage,
};
use crate::scheduler::tables::ClusterState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub bootstrapped: bool,
    pub jobs: Vec<JobView>,
    /// Drained jobs.
    pub finished: Vec<JobView>,
    pub nodes: Vec<NodeView>,
    pub daemons: Vec<DaemonView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub recovery_enabled: bool,
    pub num_launched: u32,
    pub num_reported: u32,
    pub num_terminated: u32,
    pub submitted_at: DateTime<Utc>,
    pub procs: Vec<ProcView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcView {
    pub rank: Rank,
    pub app: String,
    pub state: ProcessState,
    pub daemon: Option<PeerIdentity>,
    pub node: Option<String>,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub local_restarts: u32,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub name: String,
    pub state: NodeState,
    pub daemon: Option<PeerIdentity>,
    pub slots: u32,
    pub hosted: usize,
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonView {
    pub identity: PeerIdentity,
    pub node: String,
    pub state: DaemonState,
    pub contact: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub usage: ResourceUsage,
}

impl ClusterStatus {
    pub fn from_state(state: &ClusterState, bootstrapped: bool) -> Self {
        Self {
            bootstrapped,
            jobs: state.jobs.values().map(JobView::from).collect(),
            finished: state.finished.values().map(JobView::from).collect(),
            nodes: state.nodes.values().map(NodeView::from).collect(),
            daemons: state.daemons.values().map(DaemonView::from).collect(),
        }
    }

    /// Active or finished job by id.
    pub fn job(&self, id: JobId) -> Option<&JobView> {
        self.jobs
            .iter()
            .chain(self.finished.iter())
            .find(|job| job.id == id)
    }
}

impl JobView {
    pub fn proc(&self, rank: Rank) -> Option<&ProcView> {
        self.procs.iter().find(|p| p.rank == rank)
    }
}

impl From<&JobRecord> for JobView {
    fn from(job: &JobRecord) -> Self {
        let app_name = |p: &ProcessRecord| {
            job.apps
                .get(p.app_index)
                .map(|a| a.name.clone())
                .unwrap_or_default()
        };
        Self {
            id: job.id,
            name: job.name.clone(),
            state: job.state,
            recovery_enabled: job.recovery_enabled,
            num_launched: job.num_launched,
            num_reported: job.num_reported,
            num_terminated: job.num_terminated,
            submitted_at: job.submitted_at,
            procs: job
                .procs
                .values()
                .map(|p| ProcView {
                    rank: p.name.rank,
                    app: app_name(p),
                    state: p.state,
                    daemon: p.daemon,
                    node: p.node.clone(),
                    pid: p.pid,
                    restarts: p.restarts,
                    local_restarts: p.local_restarts,
                    exit_code: p.exit_code,
                })
                .collect(),
        }
    }
}

impl From<&NodeRecord> for NodeView {
    fn from(node: &NodeRecord) -> Self {
        Self {
            name: node.name.clone(),
            state: node.state,
            daemon: node.daemon,
            slots: node.slots,
            hosted: node.hosted.len(),
            usage: node.usage,
        }
    }
}

impl From<&DaemonRecord> for DaemonView {
    fn from(daemon: &DaemonRecord) -> Self {
        Self {
            identity: daemon.identity,
            node: daemon.node.clone(),
            state: daemon.state,
            contact: daemon.contact.clone(),
            last_heartbeat: daemon.last_heartbeat,
            usage: daemon.usage,
        }
    }
}

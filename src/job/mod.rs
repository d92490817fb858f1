//! Job, process, node and daemon records.
//!
//! The scheduler holds the authoritative copy of every record here. Daemons
//! keep their own, smaller view of the processes they host (see
//! [`daemon::recovery`](crate::daemon::recovery)).

mod spec;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::envelope::{PeerIdentity, Rank};
use crate::error::{FleetError, Result};

pub use spec::{AppSpec, JobSpec};

pub type JobId = u32;

/// Cluster-wide name of one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessName {
    pub job: JobId,
    pub rank: Rank,
}

impl ProcessName {
    pub const fn new(job: JobId, rank: Rank) -> Self {
        Self { job, rank }
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job, self.rank)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    /// Known but not yet placed.
    Pending,
    /// Launch instruction sent, not yet reported running.
    Launching,
    Running,
    LocallyRestarting,
    /// Flagged for a scheduler-driven relaunch.
    Restart,
    /// Exited normally.
    Terminated,
    /// Exited abnormally with recovery disabled.
    Aborted,
    Killed,
    FailedToStart,
    /// Local restart budget used up.
    Exhausted,
    CannotRestart,
    /// Host lost with nowhere to relaunch.
    Down,
}

impl ProcessState {
    /// Alive on some daemon, or about to be.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ProcessState::Launching | ProcessState::Running | ProcessState::LocallyRestarting
        )
    }

    /// Terminated and accounted for, or parked for an operator.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ProcessState::Terminated
                | ProcessState::Aborted
                | ProcessState::Killed
                | ProcessState::FailedToStart
                | ProcessState::CannotRestart
                | ProcessState::Down
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessState::Pending => "pending",
            ProcessState::Launching => "launching",
            ProcessState::Running => "running",
            ProcessState::LocallyRestarting => "locally-restarting",
            ProcessState::Restart => "restart",
            ProcessState::Terminated => "terminated",
            ProcessState::Aborted => "aborted",
            ProcessState::Killed => "killed",
            ProcessState::FailedToStart => "failed-to-start",
            ProcessState::Exhausted => "exhausted",
            ProcessState::CannotRestart => "cannot-restart",
            ProcessState::Down => "down",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    Launching,
    Running,
    RestartCandidate,
    Remapping,
    Relaunching,
    Drained,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::Launching => "launching",
            JobState::Running => "running",
            JobState::RestartCandidate => "restart-candidate",
            JobState::Remapping => "remapping",
            JobState::Relaunching => "relaunching",
            JobState::Drained => "drained",
        };
        f.write_str(label)
    }
}

/// Template and restart policy for one application in a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppContext {
    pub index: usize,
    pub name: String,
    pub argv: Vec<String>,
    pub num_procs: u32,
    /// Scheduler-driven restarts allowed per process; negative means unlimited.
    pub max_restarts: i32,
    /// Restarts a hosting daemon may perform on its own.
    pub max_local_restarts: u32,
}

impl AppContext {
    /// Whether a process that has been charged `charged` restarts may have another.
    pub fn allows_restart(&self, charged: u32) -> bool {
        self.max_restarts < 0 || i64::from(charged) < i64::from(self.max_restarts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub name: ProcessName,
    pub app_index: usize,
    /// Exactly one hosting daemon, or none while waiting for placement.
    pub daemon: Option<PeerIdentity>,
    pub node: Option<String>,
    pub pid: Option<u32>,
    pub state: ProcessState,
    /// Relaunches of any kind, as shown to operators.
    pub restarts: u32,
    /// Relaunches counted against the app's `max_restarts`.
    pub charged_restarts: u32,
    pub local_restarts: u32,
    pub exit_code: Option<i32>,
    /// Set while launching: past it, the launch counts as lost.
    pub launch_deadline: Option<Instant>,
}

impl ProcessRecord {
    pub fn new(name: ProcessName, app_index: usize) -> Self {
        Self {
            name,
            app_index,
            daemon: None,
            node: None,
            pid: None,
            state: ProcessState::Pending,
            restarts: 0,
            charged_restarts: 0,
            local_restarts: 0,
            exit_code: None,
            launch_deadline: None,
        }
    }

    /// Detach from the current host and wait for a relaunch.
    pub fn flag_restart(&mut self) {
        self.daemon = None;
        self.node = None;
        self.pid = None;
        self.launch_deadline = None;
        self.state = ProcessState::Restart;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub recovery_enabled: bool,
    pub apps: Vec<AppContext>,
    pub procs: BTreeMap<Rank, ProcessRecord>,
    pub num_launched: u32,
    pub num_reported: u32,
    pub num_terminated: u32,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a pending job from a validated spec. Ranks are numbered across
    /// apps in order.
    pub fn from_spec(id: JobId, spec: &JobSpec) -> Result<Self> {
        let mut apps = Vec::with_capacity(spec.apps.len());
        let mut procs = BTreeMap::new();
        let mut rank: Rank = 0;
        for (index, app) in spec.apps.iter().enumerate() {
            apps.push(AppContext {
                index,
                name: app.name.clone(),
                argv: app.argv.clone(),
                num_procs: app.num_procs,
                max_restarts: app.max_restarts,
                max_local_restarts: app.max_local_restarts,
            });
            for _ in 0..app.num_procs {
                procs.insert(rank, ProcessRecord::new(ProcessName::new(id, rank), index));
                rank = rank.checked_add(1).ok_or_else(|| {
                    FleetError::InvalidJob(format!("job '{}' has more processes than ranks", spec.name))
                })?;
            }
        }
        Ok(Self {
            id,
            name: spec.name.clone(),
            recovery_enabled: spec.recovery,
            apps,
            procs,
            num_launched: 0,
            num_reported: 0,
            num_terminated: 0,
            state: JobState::Pending,
            submitted_at: Utc::now(),
        })
    }

    pub fn app_of(&self, rank: Rank) -> Option<&AppContext> {
        let proc = self.procs.get(&rank)?;
        self.apps.get(proc.app_index)
    }

    pub fn ranks_in(&self, state: ProcessState) -> Vec<Rank> {
        self.procs
            .values()
            .filter(|p| p.state == state)
            .map(|p| p.name.rank)
            .collect()
    }

    pub fn ranks_on(&self, daemon: PeerIdentity) -> Vec<Rank> {
        self.procs
            .values()
            .filter(|p| p.daemon == Some(daemon) && !p.state.is_settled())
            .map(|p| p.name.rank)
            .collect()
    }

    /// Every remaining process is settled (or none remain).
    pub fn is_drained(&self) -> bool {
        self.procs.values().all(|p| p.state.is_settled())
    }

    pub fn all_running(&self) -> bool {
        !self.procs.is_empty() && self.procs.values().all(|p| p.state == ProcessState::Running)
    }

    pub fn refresh_counts(&mut self) {
        self.num_terminated = self
            .procs
            .values()
            .filter(|p| p.state.is_settled())
            .count() as u32;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Up,
    Down,
    NotIncluded,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Up => write!(f, "up"),
            NodeState::Down => write!(f, "down"),
            NodeState::NotIncluded => write!(f, "not-included"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonState {
    Up,
    HeartbeatFailed,
    Recovering,
    Down,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Up => write!(f, "up"),
            DaemonState::HeartbeatFailed => write!(f, "heartbeat-failed"),
            DaemonState::Recovering => write!(f, "recovering"),
            DaemonState::Down => write!(f, "down"),
        }
    }
}

/// Accumulated per-node and per-daemon statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub launched: u64,
    pub exited: u64,
    pub local_restarts: u64,
}

impl ResourceUsage {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    /// Back-reference only; losing the daemon does not remove the node.
    pub daemon: Option<PeerIdentity>,
    pub state: NodeState,
    pub hosted: BTreeSet<ProcessName>,
    pub slots: u32,
    pub usage: ResourceUsage,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, slots: u32) -> Self {
        Self {
            name: name.into(),
            daemon: None,
            state: NodeState::NotIncluded,
            hosted: BTreeSet::new(),
            slots,
            usage: ResourceUsage::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonRecord {
    pub identity: PeerIdentity,
    pub node: String,
    pub state: DaemonState,
    pub contact: Option<String>,
    /// Changes every time the daemon process restarts.
    pub instance: Uuid,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub usage: ResourceUsage,
}

//! Typed control payloads carried inside envelopes.
//!
//! | Channel | Tag | Payload |
//! |---|---|---|
//! | system-control | announce | [`AnnouncePayload`](crate::presence::AnnouncePayload) |
//! | system-control | announce-reply | [`AnnounceReply`](crate::presence::AnnounceReply) |
//! | system-control | heartbeat | empty |
//! | system-control | command | [`Command`] |
//! | system-control | process-state-update | [`StateReport`] |
//! | error-report | process-state-update | [`FailureNotice`] |
//! | system-control | tool-request / tool-response | [`ToolRequest`] / [`ToolResponse`] |

pub mod codec;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::envelope::{PeerIdentity, Rank};
use crate::job::{AppContext, JobId, ProcessName, ProcessState};
use crate::status::ClusterStatus;

/// Scheduler-issued instruction to daemons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    /// Add processes to a job. Each daemon starts only the ranks assigned to it.
    Launch(LaunchInstruction),
    /// Kill one rank, or every rank of the job when `rank` is `None`.
    Kill { job: JobId, rank: Option<Rank> },
    /// Orderly cluster shutdown.
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInstruction {
    pub job: JobId,
    pub recovery_enabled: bool,
    pub apps: Vec<AppContext>,
    pub procs: Vec<ProcLaunch>,
}

impl LaunchInstruction {
    pub fn procs_for(&self, daemon: PeerIdentity) -> impl Iterator<Item = &ProcLaunch> {
        self.procs.iter().filter(move |p| p.daemon == daemon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcLaunch {
    pub rank: Rank,
    pub app_index: usize,
    pub daemon: PeerIdentity,
    pub node: String,
    pub restarts: u32,
}

/// One process state change observed by its hosting daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcUpdate {
    pub name: ProcessName,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub local_restarts: u32,
    /// The process ended because a kill was requested, not on its own.
    pub killed_by_command: bool,
}

impl ProcUpdate {
    pub fn new(name: ProcessName, state: ProcessState) -> Self {
        Self {
            name,
            state,
            pid: None,
            exit_code: None,
            local_restarts: 0,
            killed_by_command: false,
        }
    }
}

/// Batch of updates from one daemon to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub daemon: PeerIdentity,
    pub updates: Vec<ProcUpdate>,
}

/// Identity-only notice that processes failed. `daemon` is set when the
/// failure is the loss of that daemon, along with the instance that was lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub daemon: Option<PeerIdentity>,
    #[serde(default)]
    pub instance: Option<Uuid>,
    pub procs: Vec<ProcessName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolRequest {
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolResponse {
    Status(ClusterStatus),
    /// The request was understood but could not be answered.
    Error { message: String },
}

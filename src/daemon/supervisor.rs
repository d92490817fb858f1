//! Worker process supervision.
//!
//! The recovery engine talks to workers only through [`Supervisor`]. Exits are
//! delivered asynchronously as [`WorkerEvent`]s on the channel handed to the
//! supervisor at construction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::bus::envelope::Rank;
use crate::job::{JobId, ProcessName};

/// What a daemon needs to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: ProcessName,
    pub app: String,
    pub argv: Vec<String>,
    pub restarts: u32,
}

/// A supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEvent {
    pub name: ProcessName,
    pub pid: u32,
    /// `None` when ended by a signal.
    pub exit_code: Option<i32>,
}

impl WorkerEvent {
    pub fn is_normal(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("{name} has no program to run")]
    NoProgram { name: ProcessName },

    #[error("failed to spawn {name}: {reason}")]
    Spawn { name: ProcessName, reason: String },
}

/// Result of a job launch. Launching stops at the first failure.
#[derive(Debug, Default)]
pub struct LaunchOutcome {
    pub started: Vec<(Rank, u32)>,
    pub failed: Option<(Rank, SupervisorError)>,
}

pub trait Supervisor: Send {
    fn launch(&mut self, job: JobId, procs: &[LaunchSpec]) -> LaunchOutcome;

    /// Signal one rank, or every rank of `job`. Exit events follow.
    fn kill(&mut self, job: JobId, rank: Option<Rank>);

    fn restart_one(&mut self, spec: &LaunchSpec) -> Result<u32, SupervisorError>;

    /// Forget bookkeeping for a process whose exit has been handled.
    fn reap(&mut self, _event: &WorkerEvent) {}
}

fn run_launch<F>(procs: &[LaunchSpec], mut start: F) -> LaunchOutcome
where
    F: FnMut(&LaunchSpec) -> Result<u32, SupervisorError>,
{
    let mut outcome = LaunchOutcome::default();
    for spec in procs {
        match start(spec) {
            Ok(pid) => outcome.started.push((spec.name.rank, pid)),
            Err(e) => {
                outcome.failed = Some((spec.name.rank, e));
                break;
            }
        }
    }
    outcome
}

// =============================================================================
// OS processes
// =============================================================================

struct Child {
    pid: u32,
    kill_tx: oneshot::Sender<()>,
}

/// Runs workers as local OS processes via `tokio::process`.
pub struct ProcessSupervisor {
    events: mpsc::UnboundedSender<WorkerEvent>,
    children: HashMap<ProcessName, Child>,
}

impl ProcessSupervisor {
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            events,
            children: HashMap::new(),
        }
    }

    fn spawn(&mut self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or(SupervisorError::NoProgram { name: spec.name })?;

        let mut child = Command::new(program)
            .args(args)
            .env("FLEET_JOB", spec.name.job.to_string())
            .env("FLEET_RANK", spec.name.rank.to_string())
            .env("FLEET_RESTARTS", spec.restarts.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                name: spec.name,
                reason: e.to_string(),
            })?;

        let pid = child.id().unwrap_or_default();
        let name = spec.name;
        let events = self.events.clone();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(process = %name, error = %e, "Failed to wait for worker");
                    None
                }
            };
            tracing::info!(process = %name, pid, exit_code = ?exit_code, "Worker exited");
            let _ = events.send(WorkerEvent {
                name,
                pid,
                exit_code,
            });
        });

        tracing::info!(process = %name, pid, program = %program, "Worker started");
        self.children.insert(name, Child { pid, kill_tx });
        Ok(pid)
    }
}

impl Supervisor for ProcessSupervisor {
    fn launch(&mut self, _job: JobId, procs: &[LaunchSpec]) -> LaunchOutcome {
        run_launch(procs, |spec| self.spawn(spec))
    }

    fn kill(&mut self, job: JobId, rank: Option<Rank>) {
        let doomed: Vec<ProcessName> = self
            .children
            .keys()
            .filter(|name| name.job == job && rank.map_or(true, |r| name.rank == r))
            .copied()
            .collect();
        for name in doomed {
            if let Some(child) = self.children.remove(&name) {
                tracing::info!(process = %name, pid = child.pid, "Killing worker");
                let _ = child.kill_tx.send(());
            }
        }
    }

    fn restart_one(&mut self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        self.spawn(spec)
    }

    fn reap(&mut self, event: &WorkerEvent) {
        if self.children.get(&event.name).is_some_and(|c| c.pid == event.pid) {
            self.children.remove(&event.name);
        }
    }
}

// =============================================================================
// Simulated workers
// =============================================================================

#[derive(Debug)]
struct SimState {
    next_pid: u32,
    running: BTreeMap<ProcessName, u32>,
    fail_launch: BTreeSet<ProcessName>,
    fail_restart: BTreeSet<ProcessName>,
    launches: BTreeMap<ProcessName, u32>,
    restarts: BTreeMap<ProcessName, u32>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Workers that exist only as table entries. Tests and the `sim` command
/// drive their exits through a [`SimControl`].
pub struct SimulatedSupervisor {
    state: Arc<Mutex<SimState>>,
}

/// Test-side handle onto a [`SimulatedSupervisor`].
#[derive(Clone)]
pub struct SimControl {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedSupervisor {
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> (Self, SimControl) {
        let state = Arc::new(Mutex::new(SimState {
            next_pid: 1000,
            running: BTreeMap::new(),
            fail_launch: BTreeSet::new(),
            fail_restart: BTreeSet::new(),
            launches: BTreeMap::new(),
            restarts: BTreeMap::new(),
            events,
        }));
        (
            Self {
                state: state.clone(),
            },
            SimControl { state },
        )
    }

    fn start(&self, spec: &LaunchSpec, restart: bool) -> Result<u32, SupervisorError> {
        let mut state = lock(&self.state);
        let refused = if restart {
            state.fail_restart.contains(&spec.name)
        } else {
            state.fail_launch.contains(&spec.name)
        };
        if refused {
            return Err(SupervisorError::Spawn {
                name: spec.name,
                reason: "simulated failure".to_string(),
            });
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.running.insert(spec.name, pid);
        let counter = if restart {
            &mut state.restarts
        } else {
            &mut state.launches
        };
        *counter.entry(spec.name).or_insert(0) += 1;
        Ok(pid)
    }
}

impl Supervisor for SimulatedSupervisor {
    fn launch(&mut self, _job: JobId, procs: &[LaunchSpec]) -> LaunchOutcome {
        run_launch(procs, |spec| self.start(spec, false))
    }

    fn kill(&mut self, job: JobId, rank: Option<Rank>) {
        let mut state = lock(&self.state);
        let doomed: Vec<(ProcessName, u32)> = state
            .running
            .iter()
            .filter(|(name, _)| name.job == job && rank.map_or(true, |r| name.rank == r))
            .map(|(name, pid)| (*name, *pid))
            .collect();
        for (name, pid) in doomed {
            state.running.remove(&name);
            let _ = state.events.send(WorkerEvent {
                name,
                pid,
                exit_code: None,
            });
        }
    }

    fn restart_one(&mut self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        self.start(spec, true)
    }
}

impl SimControl {
    /// Make a running worker exit with `code`. Returns false if it is not running.
    pub fn exit(&self, name: ProcessName, code: i32) -> bool {
        let mut state = lock(&self.state);
        let Some(pid) = state.running.remove(&name) else {
            return false;
        };
        state
            .events
            .send(WorkerEvent {
                name,
                pid,
                exit_code: Some(code),
            })
            .is_ok()
    }

    pub fn running(&self) -> Vec<ProcessName> {
        lock(&self.state).running.keys().copied().collect()
    }

    pub fn is_running(&self, name: ProcessName) -> bool {
        lock(&self.state).running.contains_key(&name)
    }

    pub fn pid_of(&self, name: ProcessName) -> Option<u32> {
        lock(&self.state).running.get(&name).copied()
    }

    pub fn fail_launches_of(&self, name: ProcessName) {
        lock(&self.state).fail_launch.insert(name);
    }

    pub fn fail_restart_of(&self, name: ProcessName) {
        lock(&self.state).fail_restart.insert(name);
    }

    pub fn launch_count(&self, name: ProcessName) -> u32 {
        lock(&self.state).launches.get(&name).copied().unwrap_or(0)
    }

    pub fn restart_count(&self, name: ProcessName) -> u32 {
        lock(&self.state).restarts.get(&name).copied().unwrap_or(0)
    }
}

//! Daemon-local recovery.
//!
//! The engine owns this daemon's view of the processes it hosts. It reacts to
//! worker exits by restarting locally within the app's budget, and otherwise
//! gives the process up and tells the scheduler. It never talks to the bus
//! itself: every decision comes back as a list of [`Effect`]s for the daemon
//! actor to publish.

use std::collections::BTreeMap;

use crate::bus::envelope::{PeerIdentity, Rank};
use crate::daemon::supervisor::{LaunchSpec, Supervisor, WorkerEvent};
use crate::job::{AppContext, JobId, ProcessName, ProcessState};
use crate::protocol::{LaunchInstruction, ProcUpdate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Broadcast an identity-only failure notice on the error-report channel.
    NotifyFailure(Vec<ProcessName>),
    /// Report a state change to the scheduler.
    Report(ProcUpdate),
    /// The last local process of a job is gone.
    JobDrained(JobId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProc {
    pub name: ProcessName,
    pub app_index: usize,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub restarts: u32,
    pub local_restarts: u32,
    pub kill_requested: bool,
}

impl LocalProc {
    fn update(&self, state: ProcessState) -> ProcUpdate {
        ProcUpdate {
            name: self.name,
            state,
            pid: self.pid,
            exit_code: None,
            local_restarts: self.local_restarts,
            killed_by_command: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalJob {
    pub id: JobId,
    pub recovery_enabled: bool,
    pub apps: Vec<AppContext>,
    pub procs: BTreeMap<Rank, LocalProc>,
}

fn launch_spec(apps: &[AppContext], proc: &LocalProc) -> LaunchSpec {
    let app = apps.get(proc.app_index);
    LaunchSpec {
        name: proc.name,
        app: app.map(|a| a.name.clone()).unwrap_or_default(),
        argv: app.map(|a| a.argv.clone()).unwrap_or_default(),
        restarts: proc.restarts + proc.local_restarts,
    }
}

impl LocalJob {
    /// Number of processes this daemon still accounts for.
    pub fn local_count(&self) -> usize {
        self.procs.len()
    }
}

#[derive(Debug)]
pub struct RecoveryEngine {
    me: PeerIdentity,
    jobs: BTreeMap<JobId, LocalJob>,
}

impl RecoveryEngine {
    pub fn new(me: PeerIdentity) -> Self {
        Self {
            me,
            jobs: BTreeMap::new(),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &LocalJob> {
        self.jobs.values()
    }

    pub fn job(&self, id: JobId) -> Option<&LocalJob> {
        self.jobs.get(&id)
    }

    pub fn proc(&self, name: ProcessName) -> Option<&LocalProc> {
        self.jobs.get(&name.job)?.procs.get(&name.rank)
    }

    pub fn hosted_count(&self) -> usize {
        self.jobs.values().map(LocalJob::local_count).sum()
    }

    /// Apply a launch instruction: start ranks assigned here and discard
    /// local copies of ranks now assigned elsewhere.
    pub fn adopt(&mut self, instr: &LaunchInstruction, sup: &mut dyn Supervisor) -> Vec<Effect> {
        let me = self.me;
        let mut effects = Vec::new();
        let job = self.jobs.entry(instr.job).or_insert_with(|| LocalJob {
            id: instr.job,
            recovery_enabled: instr.recovery_enabled,
            apps: instr.apps.clone(),
            procs: BTreeMap::new(),
        });
        job.recovery_enabled = instr.recovery_enabled;
        job.apps = instr.apps.clone();

        for moved in instr.procs.iter().filter(|p| p.daemon != me) {
            if job.procs.remove(&moved.rank).is_some() {
                tracing::warn!(
                    job = instr.job,
                    rank = moved.rank,
                    new_host = %moved.daemon,
                    "Process reassigned elsewhere, discarding local copy"
                );
                sup.kill(instr.job, Some(moved.rank));
            }
        }

        let mut specs = Vec::new();
        for assigned in instr.procs_for(me) {
            if let Some(existing) = job.procs.get(&assigned.rank) {
                if existing.state.is_live() {
                    // Duplicate instruction; restate what we have.
                    effects.push(Effect::Report(existing.update(existing.state)));
                    continue;
                }
            }
            let proc = LocalProc {
                name: ProcessName::new(instr.job, assigned.rank),
                app_index: assigned.app_index,
                pid: None,
                state: ProcessState::Launching,
                restarts: assigned.restarts,
                local_restarts: 0,
                kill_requested: false,
            };
            specs.push(launch_spec(&job.apps, &proc));
            job.procs.insert(assigned.rank, proc);
        }

        if !specs.is_empty() {
            let outcome = sup.launch(instr.job, &specs);
            for (rank, pid) in outcome.started {
                if let Some(proc) = job.procs.get_mut(&rank) {
                    proc.pid = Some(pid);
                    proc.state = ProcessState::Running;
                    effects.push(Effect::Report(proc.update(ProcessState::Running)));
                }
            }
            if let Some((rank, e)) = outcome.failed {
                tracing::error!(job = instr.job, rank, error = %e, "Job failed to start");
                effects.extend(self.on_job_failed_to_start(instr.job));
            }
        }

        effects.extend(self.drain_if_empty(instr.job));
        effects
    }

    /// Entry point for the supervisor: a hosted process ended.
    pub fn on_worker_state_changed(&mut self, event: WorkerEvent, sup: &mut dyn Supervisor) -> Vec<Effect> {
        sup.reap(&event);
        let name = event.name;
        let Some(job) = self.jobs.get_mut(&name.job) else {
            return Vec::new();
        };
        let Some(proc) = job.procs.get_mut(&name.rank) else {
            return Vec::new();
        };
        if proc.pid != Some(event.pid) {
            tracing::debug!(process = %name, pid = event.pid, "Exit of a stale incarnation");
            return Vec::new();
        }

        let mut effects = Vec::new();
        if proc.kill_requested {
            let mut update = proc.update(ProcessState::Killed);
            update.exit_code = event.exit_code;
            update.killed_by_command = true;
            job.procs.remove(&name.rank);
            tracing::info!(process = %name, "Worker killed on request");
            effects.push(Effect::Report(update));
        } else if event.is_normal() {
            let mut update = proc.update(ProcessState::Terminated);
            update.exit_code = event.exit_code;
            job.procs.remove(&name.rank);
            effects.push(Effect::Report(update));
        } else {
            let budget = job
                .apps
                .get(proc.app_index)
                .map_or(0, |a| a.max_local_restarts);
            if job.recovery_enabled && proc.local_restarts < budget {
                proc.local_restarts += 1;
                proc.state = ProcessState::LocallyRestarting;
                tracing::info!(
                    process = %name,
                    exit_code = ?event.exit_code,
                    attempt = proc.local_restarts,
                    budget,
                    "Restarting worker locally"
                );
                effects.push(Effect::NotifyFailure(vec![name]));
                effects.push(Effect::Report(proc.update(ProcessState::LocallyRestarting)));

                let spec = launch_spec(&job.apps, proc);
                match sup.restart_one(&spec) {
                    Ok(pid) => {
                        proc.pid = Some(pid);
                        proc.state = ProcessState::Running;
                        effects.push(Effect::Report(proc.update(ProcessState::Running)));
                    }
                    Err(e) => {
                        tracing::warn!(process = %name, error = %e, "Local restart failed");
                        let mut update = proc.update(ProcessState::Exhausted);
                        update.exit_code = event.exit_code;
                        job.procs.remove(&name.rank);
                        effects.push(Effect::Report(update));
                    }
                }
            } else {
                let state = if job.recovery_enabled {
                    ProcessState::Exhausted
                } else {
                    ProcessState::Aborted
                };
                tracing::warn!(process = %name, exit_code = ?event.exit_code, %state, "Worker failed");
                let mut update = proc.update(state);
                update.exit_code = event.exit_code;
                job.procs.remove(&name.rank);
                effects.push(Effect::NotifyFailure(vec![name]));
                effects.push(Effect::Report(update));
            }
        }

        effects.extend(self.drain_if_empty(name.job));
        effects
    }

    /// Mark every process of `job` that has not started as done so nothing
    /// waits on it.
    pub fn on_job_failed_to_start(&mut self, job_id: JobId) -> Vec<Effect> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Vec::new();
        };
        let unlaunched: Vec<Rank> = job
            .procs
            .values()
            .filter(|p| matches!(p.state, ProcessState::Pending | ProcessState::Launching))
            .map(|p| p.name.rank)
            .collect();
        let mut effects = Vec::new();
        for rank in unlaunched {
            if let Some(proc) = job.procs.remove(&rank) {
                effects.push(Effect::Report(proc.update(ProcessState::FailedToStart)));
            }
        }
        effects.extend(self.drain_if_empty(job_id));
        effects
    }

    /// A resource limit was crossed: kill the whole job, no local restarts.
    pub fn on_sensor_bound_exceeded(&mut self, job: JobId, sup: &mut dyn Supervisor) {
        tracing::warn!(job, "Sensor bound exceeded, killing job");
        self.kill(job, None, sup);
    }

    pub fn kill(&mut self, job_id: JobId, rank: Option<Rank>, sup: &mut dyn Supervisor) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let mut any = false;
        for proc in job.procs.values_mut() {
            if rank.map_or(true, |r| r == proc.name.rank) {
                proc.kill_requested = true;
                any = true;
            }
        }
        if any {
            sup.kill(job_id, rank);
        }
    }

    /// Kill everything and forget it. Used when the daemon is going away.
    pub fn kill_all(&mut self, sup: &mut dyn Supervisor) {
        for job in std::mem::take(&mut self.jobs).into_values() {
            tracing::info!(job = job.id, procs = job.procs.len(), "Killing local workers");
            sup.kill(job.id, None);
        }
    }

    fn drain_if_empty(&mut self, job_id: JobId) -> Vec<Effect> {
        match self.jobs.get(&job_id) {
            Some(job) if job.procs.is_empty() => {
                self.jobs.remove(&job_id);
                tracing::debug!(job = job_id, "No local processes left");
                vec![Effect::JobDrained(job_id)]
            }
            _ => Vec::new(),
        }
    }
}

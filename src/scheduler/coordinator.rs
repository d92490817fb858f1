//! Scheduler-side recovery.
//!
//! The [`RecoveryCoordinator`] owns the authoritative [`ClusterState`] and
//! turns daemon registrations, heartbeats, state reports and timeouts into
//! table updates plus the [`Outbound`] messages the scheduler must publish.
//! It never touches the bus itself, so every transition is testable with
//! plain `Instant`s.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::bus::envelope::{PeerIdentity, Rank};
use crate::config::JobLimits;
use crate::error::{FleetError, Result};
use crate::job::{
    DaemonRecord, DaemonState, JobId, JobRecord, JobSpec, JobState, NodeRecord, NodeState, ProcessName,
    ProcessState, ResourceUsage,
};
use crate::presence::{HeartbeatMonitor, Presence};
use crate::protocol::codec::launch_batches;
use crate::protocol::{FailureNotice, LaunchInstruction, StateReport};
use crate::scheduler::mapper::Mapper;
use crate::scheduler::tables::ClusterState;

/// Messages the coordinator asks the scheduler to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Broadcast add-processes instruction.
    Launch(LaunchInstruction),
    Kill { job: JobId, rank: Option<Rank> },
    /// Broadcast on the error-report channel.
    FailureNotice(FailureNotice),
}

pub struct RecoveryCoordinator {
    state: ClusterState,
    mapper: Box<dyn Mapper>,
    monitor: HeartbeatMonitor,
    launch_timeout: Duration,
    limits: JobLimits,
    /// When a failure notice was last repeated to a lost daemon that kept
    /// heartbeating.
    renotified: HashMap<PeerIdentity, Instant>,
    next_job: JobId,
}

impl RecoveryCoordinator {
    pub fn new(mapper: Box<dyn Mapper>, heartbeat_interval_ms: u64, launch_timeout: Duration) -> Self {
        Self {
            state: ClusterState::new(),
            mapper,
            monitor: HeartbeatMonitor::new(heartbeat_interval_ms),
            launch_timeout,
            limits: JobLimits::default(),
            renotified: HashMap::new(),
            next_job: 1,
        }
    }

    pub fn with_limits(mut self, limits: JobLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &JobLimits {
        &self.limits
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    /// Record a node we expect a daemon on, so it shows up before it reports.
    pub fn expect_node(&mut self, name: &str) {
        self.state
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| NodeRecord::new(name, 0));
    }

    // -------------------------------------------------------------------------
    // Daemon membership
    // -------------------------------------------------------------------------

    /// A daemon announced (or answered our announce).
    ///
    /// The same instance announcing again only refreshes its contact. A new
    /// instance under a live identity means the daemon restarted: its old
    /// processes are recovered through the heartbeat-failed path first.
    pub fn register_daemon(&mut self, identity: PeerIdentity, presence: &Presence, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        if let Some(existing) = self.state.daemons.get_mut(&identity) {
            if existing.instance == presence.instance && existing.state == DaemonState::Up {
                existing.contact = presence.contact.clone();
                return out;
            }
            if existing.instance != presence.instance && existing.state == DaemonState::Up {
                tracing::warn!(daemon = %identity, node = %existing.node, "Daemon restarted, recovering its processes");
                out.extend(self.on_heartbeat_timeout(identity, now));
            }
        }

        let node_name = presence.node.hostname.clone();
        let node = self
            .state
            .nodes
            .entry(node_name.clone())
            .or_insert_with(|| NodeRecord::new(node_name.as_str(), presence.node.slots));
        node.slots = presence.node.slots;
        node.daemon = Some(identity);
        node.state = NodeState::Up;

        self.state.daemons.insert(
            identity,
            DaemonRecord {
                identity,
                node: node_name.clone(),
                state: DaemonState::Up,
                contact: presence.contact.clone(),
                instance: presence.instance,
                last_heartbeat: Some(Utc::now()),
                usage: ResourceUsage::default(),
            },
        );
        self.monitor.watch(identity, now);
        self.renotified.remove(&identity);
        tracing::info!(daemon = %identity, node = %node_name, slots = presence.node.slots, "Daemon registered");

        out.extend(self.process_restart_candidates(now));
        out
    }

    /// Returns false when the heartbeat came from a daemon we are not watching.
    pub fn on_heartbeat(&mut self, daemon: PeerIdentity, now: Instant) -> bool {
        if !self.monitor.record(daemon, now) {
            return false;
        }
        if let Some(record) = self.state.daemons.get_mut(&daemon) {
            record.last_heartbeat = Some(Utc::now());
        }
        true
    }

    /// A daemon we declared lost is still heartbeating, so it never got its
    /// failure notice and may still run processes placed elsewhere since.
    /// Repeat the notice, at most once per check period.
    pub fn on_stray_heartbeat(&mut self, daemon: PeerIdentity, now: Instant) -> Vec<Outbound> {
        let Some(record) = self.state.daemons.get(&daemon) else {
            return Vec::new();
        };
        if record.state == DaemonState::Up {
            return Vec::new();
        }
        if let Some(sent) = self.renotified.get(&daemon) {
            if now.saturating_duration_since(*sent) < self.monitor.check_period() {
                return Vec::new();
            }
        }
        self.renotified.insert(daemon, now);
        tracing::warn!(%daemon, node = %record.node, state = %record.state, "Lost daemon still heartbeating, repeating failure notice");
        vec![Outbound::FailureNotice(FailureNotice {
            daemon: Some(daemon),
            instance: Some(record.instance),
            procs: Vec::new(),
        })]
    }

    /// Liveness sweep: fail silent daemons, expire overdue launches, relaunch.
    pub fn check_heartbeats(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        for daemon in self.monitor.scan(now) {
            out.extend(self.on_heartbeat_timeout(daemon, now));
        }
        self.expire_launches(now);
        out.extend(self.process_restart_candidates(now));
        out
    }

    /// A daemon stopped heartbeating. Repeat calls for the same daemon do nothing.
    pub fn on_heartbeat_timeout(&mut self, daemon: PeerIdentity, _now: Instant) -> Vec<Outbound> {
        let Some(record) = self.state.daemons.get_mut(&daemon) else {
            return Vec::new();
        };
        if record.state != DaemonState::Up {
            return Vec::new();
        }
        record.state = DaemonState::HeartbeatFailed;
        record.usage.reset();
        let node_name = record.node.clone();
        let instance = record.instance;
        self.monitor.ignore(daemon);

        if let Some(node) = self.state.nodes.get_mut(&node_name) {
            if node.daemon == Some(daemon) {
                node.state = NodeState::Down;
                node.usage.reset();
            }
        }

        let affected = self.state.hosted_by(daemon);
        let survivors = !self.state.live_daemons().is_empty();
        let mut flagged = 0usize;

        for name in &affected {
            let Some(job) = self.state.jobs.get_mut(&name.job) else {
                continue;
            };
            let recovery_enabled = job.recovery_enabled;
            let Some(proc) = job.procs.get_mut(&name.rank) else {
                continue;
            };
            if recovery_enabled && survivors {
                // Not the worker's fault: the relaunch is not charged.
                proc.flag_restart();
                job.state = JobState::RestartCandidate;
                flagged += 1;
            } else {
                proc.state = ProcessState::Down;
            }
        }

        let next = if flagged > 0 {
            DaemonState::Recovering
        } else {
            DaemonState::Down
        };
        if let Some(record) = self.state.daemons.get_mut(&daemon) {
            record.state = next;
        }

        tracing::warn!(
            %daemon,
            node = %node_name,
            affected = affected.len(),
            flagged,
            survivors,
            "Daemon lost"
        );

        self.retire_drained();
        self.state.refresh_hosted();
        vec![Outbound::FailureNotice(FailureNotice {
            daemon: Some(daemon),
            instance: Some(instance),
            procs: affected,
        })]
    }

    // -------------------------------------------------------------------------
    // Jobs
    // -------------------------------------------------------------------------

    pub fn submit(&mut self, spec: &JobSpec) -> Result<JobId> {
        spec.validate_within(&self.limits)?;
        let id = self.next_job;
        let job = JobRecord::from_spec(id, spec)?;
        self.next_job += 1;
        tracing::info!(job = id, name = %job.name, procs = job.procs.len(), "Job submitted");
        self.state.jobs.insert(id, job);
        Ok(id)
    }

    /// Place and launch every job's pending processes.
    pub fn launch_pending(&mut self, now: Instant) -> Vec<Outbound> {
        let ids: Vec<JobId> = self
            .state
            .jobs
            .values()
            .filter(|job| job.procs.values().any(|p| p.state == ProcessState::Pending))
            .map(|job| job.id)
            .collect();

        let mut out = Vec::new();
        for id in ids {
            let ranks = self.state.jobs[&id].ranks_in(ProcessState::Pending);
            let instructions = self.place(id, &ranks, now, false);
            if instructions.is_empty() {
                continue;
            }
            if let Some(job) = self.state.jobs.get_mut(&id) {
                if job.state == JobState::Pending {
                    job.state = JobState::Launching;
                }
            }
            out.extend(instructions.into_iter().map(Outbound::Launch));
        }
        self.state.refresh_hosted();
        out
    }

    /// Remap and relaunch every job waiting for a restart. Jobs whose
    /// processes cannot all be placed stay candidates for the next round.
    pub fn process_restart_candidates(&mut self, now: Instant) -> Vec<Outbound> {
        let ids: Vec<JobId> = self
            .state
            .jobs
            .values()
            .filter(|job| job.state == JobState::RestartCandidate)
            .map(|job| job.id)
            .collect();

        let mut out = Vec::new();
        for id in ids {
            let ranks = self.state.jobs[&id].ranks_in(ProcessState::Restart);
            if ranks.is_empty() {
                if let Some(job) = self.state.jobs.get_mut(&id) {
                    job.state = if job.all_running() {
                        JobState::Running
                    } else {
                        JobState::Launching
                    };
                }
                continue;
            }
            if let Some(job) = self.state.jobs.get_mut(&id) {
                job.state = JobState::Remapping;
            }

            let instructions = self.place(id, &ranks, now, true);
            let Some(job) = self.state.jobs.get_mut(&id) else {
                continue;
            };
            let leftover = job.procs.values().any(|p| p.state == ProcessState::Restart);
            job.state = if leftover {
                JobState::RestartCandidate
            } else {
                JobState::Relaunching
            };
            if !instructions.is_empty() {
                let procs: usize = instructions.iter().map(|i| i.procs.len()).sum();
                tracing::info!(job = id, procs, batches = instructions.len(), "Relaunching processes");
                out.extend(instructions.into_iter().map(Outbound::Launch));
            }
        }

        for record in self.state.daemons.values_mut() {
            if record.state == DaemonState::Recovering {
                record.state = DaemonState::Down;
            }
        }
        self.state.refresh_hosted();
        out
    }

    /// Map `ranks` of job `id` and mark the placed ones launching, each with
    /// its own deadline. Returns the launch instructions for whatever was
    /// placed, at most `launch_batch` processes each.
    fn place(&mut self, id: JobId, ranks: &[Rank], now: Instant, relaunch: bool) -> Vec<LaunchInstruction> {
        let hosts = self.state.capacities();
        let Some(job) = self.state.jobs.get(&id) else {
            return Vec::new();
        };
        let placement = self.mapper.map_job(job, ranks, &hosts);
        if placement.assignments.is_empty() {
            return Vec::new();
        }

        let deadline = now + self.launch_timeout;
        let Some(job) = self.state.jobs.get_mut(&id) else {
            return Vec::new();
        };
        let mut placed = Vec::with_capacity(placement.assignments.len());
        for assignment in placement.assignments {
            let Some(proc) = job.procs.get_mut(&assignment.rank) else {
                continue;
            };
            proc.daemon = Some(assignment.daemon);
            proc.node = Some(assignment.node);
            proc.pid = None;
            proc.exit_code = None;
            proc.state = ProcessState::Launching;
            proc.launch_deadline = Some(deadline);
            if relaunch {
                proc.restarts += 1;
            }
            placed.push(assignment.rank);
        }
        job.num_launched += placed.len() as u32;

        match launch_batches(job, &placed, self.limits.launch_batch) {
            Ok(instructions) => instructions,
            Err(e) => {
                tracing::error!(job = id, error = %e, "Failed to build launch instruction");
                Vec::new()
            }
        }
    }

    /// Processes still launching past their deadline are relaunched
    /// elsewhere without charging them.
    pub fn expire_launches(&mut self, now: Instant) {
        for job in self.state.jobs.values_mut() {
            let mut expired = Vec::new();
            for proc in job.procs.values_mut() {
                let overdue = proc.launch_deadline.map_or(false, |deadline| now >= deadline);
                if proc.state == ProcessState::Launching && overdue {
                    proc.flag_restart();
                    expired.push(proc.name.rank);
                }
            }
            if !expired.is_empty() {
                tracing::warn!(job = job.id, ranks = ?expired, "Launch not reported in time");
                job.state = JobState::RestartCandidate;
            }
        }
        self.state.refresh_hosted();
    }

    /// A launch instruction could not be sent at all. Its processes fail to
    /// start rather than wait out the launch deadline.
    pub fn on_launch_refused(&mut self, instruction: &LaunchInstruction, reason: &FleetError) {
        let Some(job) = self.state.jobs.get_mut(&instruction.job) else {
            return;
        };
        let mut refused = Vec::new();
        for launch in &instruction.procs {
            let Some(proc) = job.procs.get_mut(&launch.rank) else {
                continue;
            };
            if proc.state == ProcessState::Launching && proc.daemon == Some(launch.daemon) {
                proc.state = ProcessState::FailedToStart;
                proc.launch_deadline = None;
                refused.push(launch.rank);
            }
        }
        job.refresh_counts();
        tracing::error!(job = instruction.job, ranks = ?refused, error = %reason, "Launch instruction could not be sent");

        self.retire_drained();
        self.state.refresh_hosted();
    }

    /// Apply a daemon's batch of process state updates.
    pub fn on_state_report(&mut self, report: &StateReport, now: Instant) -> Vec<Outbound> {
        let daemon = report.daemon;
        for update in &report.updates {
            let Some(job) = self.state.jobs.get_mut(&update.name.job) else {
                tracing::debug!(%daemon, proc = %update.name, "Update for unknown job");
                continue;
            };
            let Some(proc) = job.procs.get_mut(&update.name.rank) else {
                continue;
            };
            if proc.daemon != Some(daemon) || proc.state.is_settled() {
                tracing::debug!(%daemon, proc = %update.name, state = %update.state, "Ignoring stale update");
                continue;
            }

            proc.local_restarts = update.local_restarts;
            if update.pid.is_some() {
                proc.pid = update.pid;
            }
            proc.exit_code = update.exit_code;

            if update.killed_by_command {
                tracing::info!(proc = %update.name, "Killed on request, removing");
                job.procs.remove(&update.name.rank);
                job.refresh_counts();
                continue;
            }

            match update.state {
                ProcessState::Running => {
                    if proc.state == ProcessState::Launching {
                        proc.launch_deadline = None;
                        job.num_reported += 1;
                        bump(&mut self.state.daemons, &mut self.state.nodes, daemon, |u| u.launched += 1);
                    }
                    proc.state = ProcessState::Running;
                }
                ProcessState::LocallyRestarting => {
                    proc.state = ProcessState::LocallyRestarting;
                    bump(&mut self.state.daemons, &mut self.state.nodes, daemon, |u| u.local_restarts += 1);
                }
                ProcessState::Terminated | ProcessState::FailedToStart => {
                    proc.state = update.state;
                    bump(&mut self.state.daemons, &mut self.state.nodes, daemon, |u| u.exited += 1);
                }
                ProcessState::Exhausted | ProcessState::Aborted | ProcessState::Killed => {
                    bump(&mut self.state.daemons, &mut self.state.nodes, daemon, |u| u.exited += 1);
                    let allowed = job
                        .apps
                        .get(proc.app_index)
                        .map_or(false, |app| app.allows_restart(proc.charged_restarts));
                    if job.recovery_enabled && allowed {
                        proc.charged_restarts += 1;
                        proc.flag_restart();
                        job.state = JobState::RestartCandidate;
                        tracing::info!(proc = %update.name, charged = proc.charged_restarts, "Process flagged for restart");
                    } else if job.recovery_enabled {
                        proc.state = ProcessState::CannotRestart;
                        tracing::warn!(proc = %update.name, "Restart limit reached");
                    } else {
                        proc.state = ProcessState::Aborted;
                    }
                }
                other => proc.state = other,
            }

            if job.all_running() && job.state != JobState::RestartCandidate {
                job.state = JobState::Running;
            }
            job.refresh_counts();
        }

        self.retire_drained();
        self.state.refresh_hosted();
        self.process_restart_candidates(now)
    }

    /// Kill a whole job, or one rank of it. Processes not placed anywhere are
    /// removed immediately; the rest go when their daemon reports them killed.
    pub fn kill_job(&mut self, id: JobId, rank: Option<Rank>) -> Result<Vec<Outbound>> {
        let job = self.state.jobs.get_mut(&id).ok_or(FleetError::JobNotFound(id))?;
        if let Some(rank) = rank {
            if !job.procs.contains_key(&rank) {
                return Err(FleetError::ProcessNotFound(ProcessName::new(id, rank)));
            }
        }

        job.procs.retain(|r, p| {
            let targeted = rank.map_or(true, |k| k == *r);
            !(targeted && p.daemon.is_none() && !p.state.is_settled())
        });
        job.refresh_counts();
        tracing::info!(job = id, rank = ?rank, "Kill requested");

        self.retire_drained();
        self.state.refresh_hosted();
        Ok(vec![Outbound::Kill { job: id, rank }])
    }

    /// Move fully settled jobs out of the active table. Only the most recent
    /// `finished_retention` of them are kept.
    fn retire_drained(&mut self) {
        let drained: Vec<JobId> = self
            .state
            .jobs
            .values()
            .filter(|job| job.is_drained())
            .map(|job| job.id)
            .collect();
        for id in drained {
            if let Some(mut job) = self.state.jobs.remove(&id) {
                job.state = JobState::Drained;
                tracing::info!(job = id, procs = job.procs.len(), "Job drained");
                self.state.finished.insert(id, job);
            }
        }
        while self.state.finished.len() > self.limits.finished_retention {
            if let Some((id, _)) = self.state.finished.pop_first() {
                tracing::debug!(job = id, "Dropping finished job from history");
            }
        }
    }
}

fn bump(
    daemons: &mut std::collections::BTreeMap<PeerIdentity, DaemonRecord>,
    nodes: &mut std::collections::BTreeMap<String, NodeRecord>,
    daemon: PeerIdentity,
    f: impl Fn(&mut ResourceUsage),
) {
    if let Some(record) = daemons.get_mut(&daemon) {
        f(&mut record.usage);
        if let Some(node) = nodes.get_mut(&record.node) {
            f(&mut node.usage);
        }
    }
}

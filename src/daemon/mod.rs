//! Per-node daemon.
//!
//! One [`Daemon`] runs on every node. It owns the node's bus endpoint, the
//! [`RecoveryEngine`] for the processes hosted here and the supervisor that
//! runs them, all inside a single event loop:
//!
//! - **Inbound envelopes**: announces, heartbeats and scheduler commands
//! - **Worker events**: exits reported by the supervisor
//! - **Requests**: snapshots and sensor trips from a [`DaemonHandle`]
//! - **Timers**: heartbeat emission and the lifeline check
//!
//! Losing the lifeline (the scheduler) is fatal: every local worker is killed
//! and [`Daemon::run`] returns [`FleetError::LifelineLost`].

pub mod recovery;
pub mod supervisor;

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bus::envelope::{Channel, Envelope, PeerIdentity, Tag};
use crate::bus::Bus;
use crate::config::DaemonConfig;
use crate::error::{FleetError, Result};
use crate::job::{JobId, ProcessName, ProcessState};
use crate::presence::{
    AnnounceClass, AnnouncePayload, AnnounceReply, HeartbeatMonitor, LocalPresence, Presence, Role,
};
use crate::protocol::codec::decode;
use crate::protocol::{Command, FailureNotice, StateReport};
use recovery::{Effect, RecoveryEngine};
use supervisor::{Supervisor, WorkerEvent};

#[derive(Debug)]
pub enum DaemonRequest {
    Snapshot {
        response_tx: oneshot::Sender<DaemonSnapshot>,
    },
    /// An external resource monitor reports `job` over its limits.
    SensorBoundExceeded { job: JobId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalProcView {
    pub name: ProcessName,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub local_restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonSnapshot {
    pub identity: PeerIdentity,
    pub node: String,
    pub lifeline: PeerIdentity,
    pub procs: Vec<LocalProcView>,
}

/// Cloneable handle for talking to a running daemon.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonRequest>,
}

impl DaemonHandle {
    pub async fn snapshot(&self) -> Result<DaemonSnapshot> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .send(DaemonRequest::Snapshot { response_tx })
            .await
            .map_err(|_| FleetError::ChannelClosed)?;
        rx.await.map_err(|_| FleetError::ChannelClosed)
    }

    pub async fn sensor_bound_exceeded(&self, job: JobId) -> Result<()> {
        self.tx
            .send(DaemonRequest::SensorBoundExceeded { job })
            .await
            .map_err(|_| FleetError::ChannelClosed)
    }
}

pub struct Daemon<S: Supervisor> {
    presence: LocalPresence,
    bus: Bus,
    engine: RecoveryEngine,
    supervisor: S,
    monitor: HeartbeatMonitor,
    lifeline: PeerIdentity,
    startup_window: Duration,
    started_at: Instant,
    request_tx: mpsc::Sender<DaemonRequest>,
}

impl<S: Supervisor> Daemon<S> {
    pub fn new(config: &DaemonConfig, bus: Bus, supervisor: S) -> (Self, mpsc::Receiver<DaemonRequest>) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let identity = bus.identity();
        let daemon = Self {
            presence: LocalPresence::new(identity, Role::Daemon, config.node.clone()),
            bus,
            engine: RecoveryEngine::new(identity),
            supervisor,
            monitor: HeartbeatMonitor::new(config.presence.heartbeat_interval_ms),
            lifeline: PeerIdentity::scheduler(config.family),
            startup_window: Duration::from_millis(config.presence.wireup_timeout_ms),
            started_at: Instant::now(),
            request_tx,
        };
        (daemon, request_rx)
    }

    /// Use a fixed user name instead of the environment's.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.presence = self.presence.with_user(user);
        self
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            tx: self.request_tx.clone(),
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.presence.identity
    }

    fn in_startup_window(&self) -> bool {
        self.started_at.elapsed() < self.startup_window
    }

    fn my_presence(&self) -> Presence {
        self.presence.presence(self.bus.contact())
    }

    /// Run the daemon until shutdown, an `Exit` command, or a fatal condition.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut requests: mpsc::Receiver<DaemonRequest>,
        token: CancellationToken,
    ) -> Result<()> {
        let identity = self.identity();
        tracing::info!(
            %identity,
            node = %self.presence.node.hostname,
            lifeline = %self.lifeline,
            "Daemon starting"
        );

        self.started_at = Instant::now();
        self.monitor.watch(self.lifeline, self.started_at);
        self.announce()?;

        let enabled = self.monitor.is_enabled();
        let period = self.monitor.interval().max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = tokio::time::interval(period * 2);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(%identity, "Daemon shutting down");
                    self.engine.kill_all(&mut self.supervisor);
                    return Ok(());
                }

                Some(envelope) = inbound.recv() => {
                    match self.handle_envelope(envelope) {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => {
                            tracing::info!(%identity, "Exit requested by scheduler");
                            self.engine.kill_all(&mut self.supervisor);
                            return Ok(());
                        }
                        Err(e) if e.is_fatal() => {
                            self.engine.kill_all(&mut self.supervisor);
                            return Err(e);
                        }
                        Err(e) => tracing::warn!(%identity, error = %e, "Failed to handle envelope"),
                    }
                }

                Some(event) = worker_events.recv() => {
                    let effects = self.engine.on_worker_state_changed(event, &mut self.supervisor);
                    if let Err(e) = self.apply(effects) {
                        tracing::warn!(%identity, error = %e, "Failed to publish worker state");
                    }
                }

                Some(request) = requests.recv() => {
                    self.handle_request(request);
                }

                _ = heartbeat.tick(), if enabled => {
                    self.bus.heartbeat();
                }

                _ = liveness.tick(), if enabled => {
                    self.check_lifeline(Instant::now())?;
                    if self.bus.announce_responders() == 0 {
                        self.announce()?;
                    }
                }
            }
        }
    }

    /// Broadcast our presence. Repeated from the liveness timer until someone answers.
    fn announce(&mut self) -> Result<()> {
        let identity = self.identity();
        let announce = AnnouncePayload {
            presence: self.my_presence(),
            apps: self.bus.registry().local_apps(),
        };
        let payload = serde_json::to_vec(&announce)?;
        let status = self.bus.announce(payload, move |responder| {
            tracing::debug!(%identity, %responder, "Announce answered");
        });
        drop(status);
        Ok(())
    }

    fn handle_request(&mut self, request: DaemonRequest) {
        match request {
            DaemonRequest::Snapshot { response_tx } => {
                let _ = response_tx.send(self.snapshot());
            }
            DaemonRequest::SensorBoundExceeded { job } => {
                self.engine.on_sensor_bound_exceeded(job, &mut self.supervisor);
            }
        }
    }

    pub fn snapshot(&self) -> DaemonSnapshot {
        let procs = self
            .engine
            .jobs()
            .flat_map(|job| job.procs.values())
            .map(|p| LocalProcView {
                name: p.name,
                state: p.state,
                pid: p.pid,
                local_restarts: p.local_restarts,
            })
            .collect();
        DaemonSnapshot {
            identity: self.identity(),
            node: self.presence.node.hostname.clone(),
            lifeline: self.lifeline,
            procs,
        }
    }

    fn check_lifeline(&mut self, now: Instant) -> Result<()> {
        for peer in self.monitor.scan(now) {
            if peer == self.lifeline {
                tracing::error!(identity = %self.identity(), lifeline = %peer, "Lifeline lost, killing local workers");
                self.engine.kill_all(&mut self.supervisor);
                return Err(FleetError::LifelineLost(peer));
            }
            self.bus.forget_peer(peer);
        }
        Ok(())
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<ControlFlow<()>> {
        let now = Instant::now();
        let Some(envelope) = self.bus.receive(envelope, now) else {
            return Ok(ControlFlow::Continue(()));
        };
        let sender = envelope.sender;
        if self.presence.is_foreign(sender) && !matches!(envelope.tag, Tag::Announce | Tag::AnnounceReply) {
            return Ok(ControlFlow::Continue(()));
        }

        match (envelope.channel, envelope.tag) {
            (Channel::SystemControl, Tag::Announce) => {
                let announce: AnnouncePayload = decode(&envelope)?;
                self.on_announce(sender, announce)?;
            }
            (Channel::SystemControl, Tag::AnnounceReply) => {
                let reply: AnnounceReply = decode(&envelope)?;
                self.on_announce_reply(sender, reply)?;
            }
            (Channel::SystemControl, Tag::Heartbeat) => {
                self.monitor.record(sender, now);
            }
            (Channel::SystemControl, Tag::Command) if sender == self.lifeline => {
                let command: Command = decode(&envelope)?;
                return self.on_command(command);
            }
            (Channel::ErrorReport, Tag::ProcessStateUpdate) => {
                let notice: FailureNotice = decode(&envelope)?;
                self.on_failure_notice(notice)?;
            }
            (channel, tag) => {
                tracing::trace!(%sender, %channel, %tag, "Unhandled envelope");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_announce(&mut self, sender: PeerIdentity, announce: AnnouncePayload) -> Result<()> {
        match self.presence.classify(sender, &announce.presence) {
            AnnounceClass::Foreign => return Ok(()),
            AnnounceClass::Conflict => {
                self.refuse_if_starting(&announce.presence)?;
                tracing::warn!(
                    %sender,
                    user = %announce.presence.user,
                    node = %announce.presence.node.hostname,
                    "Another cluster's daemon announced on this node"
                );
            }
            AnnounceClass::Accept => {
                if let Some(contact) = &announce.presence.contact {
                    self.bus.learn(sender, contact);
                }
                for app in &announce.apps {
                    self.bus.join_group(app, sender);
                }
                if sender == self.lifeline {
                    tracing::info!(scheduler = %sender, "Scheduler announced");
                    self.monitor.watch(sender, Instant::now());
                }
            }
        }

        let reply = AnnounceReply {
            presence: self.my_presence(),
            directory: Vec::new(),
        };
        self.bus
            .post_msg(Channel::SystemControl, Some(sender), Tag::AnnounceReply, &reply)
    }

    fn on_announce_reply(&mut self, sender: PeerIdentity, reply: AnnounceReply) -> Result<()> {
        match self.presence.classify(sender, &reply.presence) {
            AnnounceClass::Foreign => {}
            AnnounceClass::Conflict => self.refuse_if_starting(&reply.presence)?,
            AnnounceClass::Accept => {
                if let Some(contact) = &reply.presence.contact {
                    self.bus.learn(sender, contact);
                }
                for entry in &reply.directory {
                    self.bus.learn(entry.identity, &entry.address);
                }
            }
        }
        Ok(())
    }

    fn refuse_if_starting(&self, other: &Presence) -> Result<()> {
        if self.in_startup_window() {
            tracing::error!(
                user = %other.user,
                node = %other.node.hostname,
                "Duplicate daemon detected during startup"
            );
            return Err(FleetError::DuplicateDaemon {
                user: other.user.clone(),
                node: other.node.hostname.clone(),
            });
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) -> Result<ControlFlow<()>> {
        match command {
            Command::Launch(instr) => {
                tracing::info!(job = instr.job, procs = instr.procs.len(), "Launch instruction received");
                let effects = self.engine.adopt(&instr, &mut self.supervisor);
                self.apply(effects)?;
            }
            Command::Kill { job, rank } => {
                tracing::info!(job, rank = ?rank, "Kill requested");
                self.engine.kill(job, rank, &mut self.supervisor);
            }
            Command::Exit => return Ok(ControlFlow::Break(())),
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_failure_notice(&mut self, notice: FailureNotice) -> Result<()> {
        match notice.daemon {
            Some(lost) if lost == self.identity() => {
                if notice.instance != Some(self.presence.instance) {
                    tracing::debug!(identity = %lost, "Notice about a previous instance of this daemon");
                    return Ok(());
                }
                // Our workers are being relaunched elsewhere.
                tracing::warn!(identity = %lost, procs = notice.procs.len(), "Scheduler declared this daemon dead, rejoining");
                self.engine.kill_all(&mut self.supervisor);
                self.announce()?;
            }
            Some(lost) => {
                let changed = self.bus.forget_peer(lost);
                tracing::info!(daemon = %lost, procs = notice.procs.len(), groups = changed.len(), "Peer daemon lost");
            }
            None => {
                tracing::debug!(procs = ?notice.procs, "Peer processes failed");
            }
        }
        Ok(())
    }

    fn apply(&mut self, effects: Vec<Effect>) -> Result<()> {
        let mut updates = Vec::new();
        for effect in effects {
            match effect {
                Effect::NotifyFailure(procs) => {
                    let notice = FailureNotice {
                        daemon: None,
                        instance: None,
                        procs,
                    };
                    self.bus
                        .post_msg(Channel::ErrorReport, None, Tag::ProcessStateUpdate, &notice)?;
                }
                Effect::Report(update) => updates.push(update),
                Effect::JobDrained(job) => {
                    tracing::info!(job, "All local processes of job finished");
                }
            }
        }
        if !updates.is_empty() {
            let report = StateReport {
                daemon: self.identity(),
                updates,
            };
            self.bus.post_msg(
                Channel::SystemControl,
                Some(self.lifeline),
                Tag::ProcessStateUpdate,
                &report,
            )?;
        }
        Ok(())
    }
}

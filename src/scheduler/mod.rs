//! The scheduler process.
//!
//! A single [`Scheduler`] actor owns the bus endpoint, the startup
//! [`WireupBarrier`] and the [`RecoveryCoordinator`] with every job, node
//! and daemon table. It reacts to:
//!
//! - **Inbound envelopes**: announces, heartbeats, state reports, tool requests
//! - **Requests**: status, submit and kill from a [`SchedulerHandle`]
//! - **Timers**: the wireup deadline, heartbeat emission and the liveness sweep

pub mod coordinator;
pub mod mapper;
pub mod tables;

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bus::envelope::{Channel, Envelope, PeerIdentity, Rank, Tag};
use crate::bus::Bus;
use crate::config::SchedulerConfig;
use crate::error::{FleetError, Result};
use crate::job::{DaemonState, JobId, JobSpec};
use crate::presence::{
    AnnouncePayload, AnnounceReply, BootstrapReport, Contact, LocalPresence, Presence, Role, WireupBarrier,
};
use crate::protocol::codec::{decode, encode, encode_launch_instruction};
use crate::protocol::{Command, LaunchInstruction, StateReport, ToolRequest, ToolResponse};
use crate::status::ClusterStatus;
use coordinator::{Outbound, RecoveryCoordinator};
use mapper::{LeastLoadedMapper, Mapper};

#[derive(Debug)]
pub enum SchedulerRequest {
    Status {
        response_tx: oneshot::Sender<ClusterStatus>,
    },
    Submit {
        spec: JobSpec,
        response_tx: oneshot::Sender<Result<JobId>>,
    },
    Kill {
        job: JobId,
        rank: Option<Rank>,
        response_tx: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle for talking to a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerRequest>,
}

impl SchedulerHandle {
    pub async fn status(&self) -> Result<ClusterStatus> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .send(SchedulerRequest::Status { response_tx })
            .await
            .map_err(|_| FleetError::ChannelClosed)?;
        rx.await.map_err(|_| FleetError::ChannelClosed)
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .send(SchedulerRequest::Submit { spec, response_tx })
            .await
            .map_err(|_| FleetError::ChannelClosed)?;
        rx.await.map_err(|_| FleetError::ChannelClosed)?
    }

    pub async fn kill(&self, job: JobId, rank: Option<Rank>) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .send(SchedulerRequest::Kill {
                job,
                rank,
                response_tx,
            })
            .await
            .map_err(|_| FleetError::ChannelClosed)?;
        rx.await.map_err(|_| FleetError::ChannelClosed)?
    }
}

pub struct Scheduler {
    presence: LocalPresence,
    bus: Bus,
    coordinator: RecoveryCoordinator,
    barrier: WireupBarrier,
    config: SchedulerConfig,
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, bus: Bus) -> (Self, mpsc::Receiver<SchedulerRequest>) {
        Self::with_mapper(config, bus, Box::new(LeastLoadedMapper))
    }

    pub fn with_mapper(
        config: SchedulerConfig,
        bus: Bus,
        mapper: Box<dyn Mapper>,
    ) -> (Self, mpsc::Receiver<SchedulerRequest>) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let identity = bus.identity();
        let mut coordinator = RecoveryCoordinator::new(
            mapper,
            config.presence.heartbeat_interval_ms,
            Duration::from_millis(config.launch_timeout_ms),
        )
        .with_limits(config.limits.clone());
        for node in &config.expected_nodes {
            coordinator.expect_node(node);
        }
        let barrier = WireupBarrier::new(
            Duration::from_millis(config.presence.wireup_timeout_ms),
            config.expected_nodes.clone(),
            Instant::now(),
        );
        let scheduler = Self {
            presence: LocalPresence::new(identity, Role::Scheduler, config.node.clone()),
            bus,
            coordinator,
            barrier,
            config,
            request_tx,
        };
        (scheduler, request_rx)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.presence = self.presence.with_user(user);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.request_tx.clone(),
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.presence.identity
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus::from_state(self.coordinator.state(), self.barrier.is_complete())
    }

    fn my_presence(&self) -> Presence {
        self.presence.presence(self.bus.contact())
    }

    /// Run until cancelled. On shutdown every daemon is told to exit.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut requests: mpsc::Receiver<SchedulerRequest>,
        token: CancellationToken,
    ) -> Result<()> {
        let identity = self.identity();
        tracing::info!(
            %identity,
            wireup_timeout_ms = self.config.presence.wireup_timeout_ms,
            expected = self.config.expected_nodes.len(),
            "Scheduler starting"
        );

        self.barrier = WireupBarrier::new(
            Duration::from_millis(self.config.presence.wireup_timeout_ms),
            self.config.expected_nodes.clone(),
            Instant::now(),
        );
        self.announce()?;

        let enabled = self.coordinator.monitor().is_enabled();
        let interval = self.coordinator.monitor().interval().max(Duration::from_millis(1));
        let sweep_period = if enabled {
            self.coordinator.monitor().check_period()
        } else {
            Duration::from_secs(1)
        };
        let mut heartbeat = tokio::time::interval(interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wireup = self.barrier.deadline();
            let wireup_at = tokio::time::Instant::from_std(wireup.unwrap_or_else(Instant::now));

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(%identity, "Scheduler shutting down, releasing daemons");
                    self.bus.post_msg(Channel::SystemControl, None, Tag::Command, &Command::Exit)?;
                    return Ok(());
                }

                Some(envelope) = inbound.recv() => {
                    if let Err(e) = self.handle_envelope(envelope) {
                        tracing::warn!(%identity, error = %e, "Failed to handle envelope");
                    }
                }

                Some(request) = requests.recv() => {
                    self.handle_request(request);
                }

                _ = tokio::time::sleep_until(wireup_at), if wireup.is_some() => {
                    let now = Instant::now();
                    if let Some(report) = self.barrier.poll(now) {
                        self.on_bootstrap(report, now);
                    }
                }

                _ = heartbeat.tick(), if enabled => {
                    self.bus.heartbeat();
                }

                _ = sweep.tick() => {
                    let out = self.coordinator.check_heartbeats(Instant::now());
                    self.publish(out);
                }
            }
        }
    }

    fn announce(&mut self) -> Result<()> {
        let identity = self.identity();
        let payload = serde_json::to_vec(&AnnouncePayload {
            presence: self.my_presence(),
            apps: self.bus.registry().local_apps(),
        })?;
        drop(self.bus.announce(payload, move |responder| {
            tracing::debug!(%identity, %responder, "Announce answered");
        }));
        Ok(())
    }

    fn on_bootstrap(&mut self, report: BootstrapReport, now: Instant) {
        for node in &report.missing {
            tracing::warn!(node = %node, "Expected daemon never reported");
        }
        tracing::info!(
            reported = report.reported.len(),
            missing = report.missing.len(),
            "Bootstrap complete"
        );
        let out = self.coordinator.launch_pending(now);
        self.publish(out);
    }

    fn handle_request(&mut self, request: SchedulerRequest) {
        match request {
            SchedulerRequest::Status { response_tx } => {
                let _ = response_tx.send(self.status());
            }
            SchedulerRequest::Submit { spec, response_tx } => {
                let result = self.coordinator.submit(&spec);
                if result.is_ok() && self.barrier.is_complete() {
                    let out = self.coordinator.launch_pending(Instant::now());
                    self.publish(out);
                }
                let _ = response_tx.send(result);
            }
            SchedulerRequest::Kill {
                job,
                rank,
                response_tx,
            } => {
                let result = self.coordinator.kill_job(job, rank).map(|out| self.publish(out));
                let _ = response_tx.send(result);
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        let now = Instant::now();
        let Some(envelope) = self.bus.receive(envelope, now) else {
            return Ok(());
        };
        let sender = envelope.sender;
        if self.presence.is_foreign(sender) {
            return Ok(());
        }

        match (envelope.channel, envelope.tag) {
            (Channel::SystemControl, Tag::Announce) => {
                let announce: AnnouncePayload = decode(&envelope)?;
                self.on_presence(sender, &announce.presence, now);
                for app in &announce.apps {
                    self.bus.join_group(app, sender);
                }
                let reply = AnnounceReply {
                    presence: self.my_presence(),
                    directory: self.directory(),
                };
                self.bus
                    .post_msg(Channel::SystemControl, Some(sender), Tag::AnnounceReply, &reply)?;
            }
            (Channel::SystemControl, Tag::AnnounceReply) => {
                let reply: AnnounceReply = decode(&envelope)?;
                self.on_presence(sender, &reply.presence, now);
            }
            (Channel::SystemControl, Tag::Heartbeat) => {
                if !self.coordinator.on_heartbeat(sender, now) {
                    tracing::trace!(%sender, "Heartbeat from unwatched peer");
                    let out = self.coordinator.on_stray_heartbeat(sender, now);
                    self.publish(out);
                }
            }
            (Channel::SystemControl, Tag::ProcessStateUpdate) => {
                let report: StateReport = decode(&envelope)?;
                if report.daemon != sender {
                    tracing::debug!(%sender, daemon = %report.daemon, "State report on behalf of another daemon");
                    return Ok(());
                }
                let out = self.coordinator.on_state_report(&report, now);
                self.publish(out);
            }
            (Channel::SystemControl, Tag::ToolRequest) => {
                let request: ToolRequest = decode(&envelope)?;
                match request {
                    ToolRequest::Status => {
                        let payload = encode(&ToolResponse::Status(self.status()))?;
                        let size = payload.len();
                        if let Err(e) = self
                            .bus
                            .try_post(Channel::SystemControl, Some(sender), Tag::ToolResponse, payload)
                        {
                            tracing::warn!(tool = %sender, size, error = %e, "Status reply could not be sent");
                            let response = ToolResponse::Error {
                                message: format!("status reply of {} bytes could not be sent: {}", size, e),
                            };
                            self.bus
                                .post_msg(Channel::SystemControl, Some(sender), Tag::ToolResponse, &response)?;
                        }
                    }
                }
                // Tools are one-shot; stop fanning broadcasts out to them.
                if sender.is_tool() {
                    self.bus.forget_peer(sender);
                }
            }
            (Channel::ErrorReport, Tag::ProcessStateUpdate) => {
                tracing::debug!(%sender, "Worker failure notice");
            }
            (channel, tag) => {
                tracing::trace!(%sender, %channel, %tag, "Unhandled envelope");
            }
        }
        Ok(())
    }

    /// A peer told us who it is. Daemons are counted towards bootstrap and
    /// registered with the coordinator.
    fn on_presence(&mut self, sender: PeerIdentity, presence: &Presence, now: Instant) {
        if presence.role == Role::Daemon && sender.is_daemon() {
            self.barrier.on_announce(&presence.node.hostname, now);
            let out = self.coordinator.register_daemon(sender, presence, now);
            self.publish(out);
            if self.barrier.is_complete() {
                let out = self.coordinator.launch_pending(now);
                self.publish(out);
            }
        }
        // After publishing: a restarted daemon's failure notice forgets it.
        if let Some(contact) = &presence.contact {
            self.bus.learn(sender, contact);
        }
    }

    fn directory(&self) -> Vec<Contact> {
        self.coordinator
            .state()
            .daemons
            .values()
            .filter(|d| d.state == DaemonState::Up)
            .filter_map(|d| {
                Some(Contact {
                    identity: d.identity,
                    address: d.contact.clone()?,
                })
            })
            .collect()
    }

    fn publish(&mut self, out: Vec<Outbound>) {
        for message in out {
            let result = match message {
                Outbound::Launch(instruction) => {
                    self.send_launch(&instruction);
                    Ok(())
                }
                Outbound::Kill { job, rank } => {
                    self.bus
                        .post_msg(Channel::SystemControl, None, Tag::Command, &Command::Kill { job, rank })
                }
                Outbound::FailureNotice(notice) => {
                    let result = self
                        .bus
                        .post_msg(Channel::ErrorReport, None, Tag::ProcessStateUpdate, &notice);
                    if let Some(daemon) = notice.daemon {
                        self.bus.forget_peer(daemon);
                    }
                    result
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to publish");
            }
        }
    }

    /// Broadcast one launch instruction; every daemon sees it, so ranks
    /// placed elsewhere are dropped by their old hosts. An instruction that
    /// cannot be sent fails its processes straight away.
    fn send_launch(&mut self, instruction: &LaunchInstruction) {
        let result = encode_launch_instruction(instruction).and_then(|payload| {
            self.bus
                .try_post(Channel::SystemControl, None, Tag::Command, payload)
                .map_err(FleetError::from)
        });
        if let Err(e) = result {
            self.coordinator.on_launch_refused(instruction, &e);
        }
    }
}

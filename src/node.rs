//! Process wiring: transport + actor + dashboard + shutdown.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::envelope::{Channel, JobFamily, PeerIdentity, Rank, Tag, FIRST_DAEMON_RANK, TOOL_RANK_BASE};
use crate::bus::transport::{LocalHub, UdpTransport};
use crate::bus::Bus;
use crate::config::{DaemonConfig, PresenceConfig, SchedulerConfig};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::daemon::supervisor::{ProcessSupervisor, SimControl, SimulatedSupervisor};
use crate::daemon::{Daemon, DaemonHandle};
use crate::error::{FleetError, Result};
use crate::job::JobSpec;
use crate::presence::NodeInfo;
use crate::protocol::codec::{decode, encode};
use crate::protocol::{ToolRequest, ToolResponse};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::status::ClusterStatus;

/// Run the scheduler over UDP until `token` is cancelled. `jobs` are queued
/// immediately and launched once bootstrap completes.
pub async fn run_scheduler(config: SchedulerConfig, jobs: Vec<JobSpec>, token: CancellationToken) -> Result<()> {
    let (transport, inbound) = UdpTransport::bind(config.listen_addr, Vec::new()).await?;
    let bus = Bus::new(PeerIdentity::scheduler(config.family), Arc::new(transport));
    let dashboard_addr = config.dashboard_addr;
    let (scheduler, requests) = Scheduler::new(config, bus);
    let handle = scheduler.handle();

    if let Some(addr) = dashboard_addr {
        let state = DashboardState {
            scheduler: handle.clone(),
        };
        tokio::spawn(async move {
            run_dashboard(addr, state).await;
        });
    }

    if !jobs.is_empty() {
        let handle = handle.clone();
        tokio::spawn(async move {
            for spec in jobs {
                let name = spec.name.clone();
                match handle.submit(spec).await {
                    Ok(job) => tracing::info!(job, name = %name, "Queued job from command line"),
                    Err(e) => tracing::error!(name = %name, error = %e, "Failed to queue job"),
                }
            }
        });
    }

    scheduler.run(inbound, requests, token).await
}

/// Run a daemon over UDP, supervising real OS processes.
pub async fn run_daemon(config: DaemonConfig, token: CancellationToken) -> Result<()> {
    let (transport, inbound) = UdpTransport::bind(config.listen_addr, vec![config.scheduler_addr]).await?;
    let identity = PeerIdentity::new(config.family, config.rank);
    let mut bus = Bus::new(identity, Arc::new(transport));
    bus.learn(PeerIdentity::scheduler(config.family), &config.scheduler_addr.to_string());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = ProcessSupervisor::new(events_tx);
    let (daemon, requests) = Daemon::new(&config, bus, supervisor);
    daemon.run(inbound, events_rx, requests, token).await
}

/// Ask a running scheduler for its status, as a one-shot tool.
pub async fn query_status(scheduler_addr: SocketAddr, family: JobFamily, timeout: Duration) -> Result<ClusterStatus> {
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let (transport, mut inbound) = UdpTransport::bind(bind, Vec::new()).await?;
    let rank: Rank = TOOL_RANK_BASE + rand::thread_rng().gen_range(0..1 << 20);
    let identity = PeerIdentity::new(family, rank);
    let scheduler = PeerIdentity::scheduler(family);

    let mut bus = Bus::new(identity, Arc::new(transport));
    bus.learn(scheduler, &scheduler_addr.to_string());
    let status = bus.publish(
        Channel::SystemControl,
        Some(scheduler),
        Tag::ToolRequest,
        encode(&ToolRequest::Status)?,
    );
    if let Ok(Err(e)) = status.await {
        return Err(e.into());
    }

    let wait = async {
        while let Some(envelope) = inbound.recv().await {
            let Some(envelope) = bus.receive(envelope, Instant::now()) else {
                continue;
            };
            if envelope.sender == scheduler && envelope.tag == Tag::ToolResponse {
                return match decode(&envelope)? {
                    ToolResponse::Status(status) => Ok(status),
                    ToolResponse::Error { message } => Err(FleetError::Refused(message)),
                };
            }
        }
        Err(FleetError::ChannelClosed)
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| FleetError::Timeout(format!("status from {}", scheduler_addr)))?
}

// =============================================================================
// In-process cluster
// =============================================================================

/// One simulated daemon inside a [`LocalCluster`].
pub struct LocalDaemon {
    pub identity: PeerIdentity,
    pub node: String,
    pub handle: DaemonHandle,
    pub sim: SimControl,
    task: JoinHandle<Result<()>>,
}

impl LocalDaemon {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// A scheduler and any number of daemons on a [`LocalHub`], running
/// simulated workers. Used by the `sim` command and the tests.
pub struct LocalCluster {
    pub hub: LocalHub,
    pub scheduler: SchedulerHandle,
    config: SchedulerConfig,
    scheduler_task: JoinHandle<Result<()>>,
    daemons: BTreeMap<PeerIdentity, LocalDaemon>,
    next_rank: Rank,
    token: CancellationToken,
}

impl LocalCluster {
    /// Start the scheduler. Must be called inside a tokio runtime.
    pub fn start(config: SchedulerConfig) -> Self {
        let hub = LocalHub::new();
        let token = CancellationToken::new();
        let identity = PeerIdentity::scheduler(config.family);
        let (transport, inbound) = hub.attach(identity);
        let bus = Bus::new(identity, Arc::new(transport));
        let (scheduler, requests) = Scheduler::new(config.clone(), bus);
        let handle = scheduler.handle();
        let scheduler_task = tokio::spawn(scheduler.run(inbound, requests, token.child_token()));

        Self {
            hub,
            scheduler: handle,
            config,
            scheduler_task,
            daemons: BTreeMap::new(),
            next_rank: FIRST_DAEMON_RANK,
            token,
        }
    }

    pub fn presence(&self) -> &PresenceConfig {
        &self.config.presence
    }

    /// Start a daemon on a new node and return its identity.
    pub fn add_daemon(&mut self, node: &str, slots: u32) -> PeerIdentity {
        let rank = self.next_rank;
        self.next_rank += 1;
        self.spawn_daemon(rank, node, slots)
    }

    fn spawn_daemon(&mut self, rank: Rank, node: &str, slots: u32) -> PeerIdentity {
        let identity = PeerIdentity::new(self.config.family, rank);
        let config = DaemonConfig::new(self.config.family, rank, NodeInfo::new(node, slots))
            .with_presence(self.config.presence.clone());
        let (transport, inbound) = self.hub.attach(identity);
        let bus = Bus::new(identity, Arc::new(transport));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (supervisor, sim) = SimulatedSupervisor::new(events_tx);
        let (daemon, requests) = Daemon::new(&config, bus, supervisor);
        let handle = daemon.handle();
        let task = tokio::spawn(daemon.run(inbound, events_rx, requests, self.token.child_token()));

        self.daemons.insert(
            identity,
            LocalDaemon {
                identity,
                node: node.to_string(),
                handle,
                sim,
                task,
            },
        );
        identity
    }

    pub fn daemon(&self, identity: PeerIdentity) -> Option<&LocalDaemon> {
        self.daemons.get(&identity)
    }

    pub fn daemons(&self) -> impl Iterator<Item = &LocalDaemon> {
        self.daemons.values()
    }

    /// Kill a daemon abruptly: it vanishes from the network without a word.
    pub fn crash_daemon(&mut self, identity: PeerIdentity) -> bool {
        self.hub.detach(identity);
        match self.daemons.remove(&identity) {
            Some(daemon) => {
                daemon.task.abort();
                tracing::info!(daemon = %identity, node = %daemon.node, "Daemon crashed");
                true
            }
            None => false,
        }
    }

    /// Crash a daemon and start a fresh instance under the same identity.
    pub fn restart_daemon(&mut self, identity: PeerIdentity, slots: u32) -> Option<PeerIdentity> {
        let node = self.daemons.get(&identity)?.node.clone();
        self.crash_daemon(identity);
        Some(self.spawn_daemon(identity.rank, &node, slots))
    }

    /// Wait for a daemon's event loop to end and return its result.
    pub async fn join_daemon(&mut self, identity: PeerIdentity) -> Option<Result<()>> {
        let daemon = self.daemons.remove(&identity)?;
        match daemon.task.await {
            Ok(result) => Some(result),
            Err(e) => Some(Err(FleetError::Io(std::io::Error::other(e.to_string())))),
        }
    }

    /// Stop the scheduler without stopping the daemons.
    pub fn crash_scheduler(&self) {
        self.hub.detach(PeerIdentity::scheduler(self.config.family));
        self.scheduler_task.abort();
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.scheduler_task.await;
        for (_, daemon) in self.daemons {
            let _ = daemon.task.await;
        }
    }
}

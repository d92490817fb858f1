use std::net::{Ipv4Addr, SocketAddr};

use crate::bus::envelope::{JobFamily, Rank, FIRST_DAEMON_RANK};
use crate::presence::NodeInfo;

/// UDP port the scheduler listens on unless told otherwise.
pub const DEFAULT_SCHEDULER_PORT: u16 = 47000;

/// Heartbeat and bootstrap timing shared by every participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Heartbeat period. Liveness is checked every `2 ×` this; `0` disables both.
    pub heartbeat_interval_ms: u64,
    /// Quiet period after the last daemon announce before bootstrap completes.
    /// Daemons also use it as their startup window for duplicate detection.
    pub wireup_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            wireup_timeout_ms: 3000,
        }
    }
}

/// Bounds on job size, launch messages and retained history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLimits {
    /// Processes one job may ask for, across all its apps.
    pub max_procs_per_job: u32,
    /// Processes carried by one launch instruction. Larger placements are
    /// sent as several instructions.
    pub launch_batch: usize,
    /// Drained jobs kept for status queries; the oldest go first.
    pub finished_retention: usize,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_procs_per_job: 16_384,
            launch_batch: 256,
            finished_retention: 128,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub family: JobFamily,
    pub listen_addr: SocketAddr,
    pub node: NodeInfo,
    pub presence: PresenceConfig,
    /// How long launched processes have to report running before relaunch.
    pub launch_timeout_ms: u64,
    /// Nodes whose daemons should announce during bootstrap.
    pub expected_nodes: Vec<String>,
    pub dashboard_addr: Option<SocketAddr>,
    pub limits: JobLimits,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            family: 1,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SCHEDULER_PORT)),
            node: NodeInfo::local(),
            presence: PresenceConfig::default(),
            launch_timeout_ms: 10_000,
            expected_nodes: Vec::new(),
            dashboard_addr: None,
            limits: JobLimits::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(family: JobFamily, listen_addr: SocketAddr) -> Self {
        Self {
            family,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_launch_timeout(mut self, launch_timeout_ms: u64) -> Self {
        self.launch_timeout_ms = launch_timeout_ms;
        self
    }

    pub fn with_expected_node(mut self, node: impl Into<String>) -> Self {
        self.expected_nodes.push(node.into());
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_limits(mut self, limits: JobLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub family: JobFamily,
    pub rank: Rank,
    pub node: NodeInfo,
    pub listen_addr: SocketAddr,
    pub scheduler_addr: SocketAddr,
    pub presence: PresenceConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            family: 1,
            rank: FIRST_DAEMON_RANK,
            node: NodeInfo::local(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            scheduler_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_SCHEDULER_PORT)),
            presence: PresenceConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn new(family: JobFamily, rank: Rank, node: NodeInfo) -> Self {
        Self {
            family,
            rank,
            node,
            ..Default::default()
        }
    }

    pub fn with_scheduler(mut self, scheduler_addr: SocketAddr) -> Self {
        self.scheduler_addr = scheduler_addr;
        self
    }

    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }
}

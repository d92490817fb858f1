use std::collections::BTreeMap;

use crate::bus::envelope::PeerIdentity;
use crate::job::{DaemonRecord, DaemonState, JobId, JobRecord, NodeRecord, NodeState, ProcessName, ProcessRecord};
use crate::scheduler::mapper::HostCapacity;

/// The scheduler's authoritative tables. Owned by the coordinator, never shared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterState {
    pub jobs: BTreeMap<JobId, JobRecord>,
    /// Drained jobs, kept for inspection.
    pub finished: BTreeMap<JobId, JobRecord>,
    pub nodes: BTreeMap<String, NodeRecord>,
    pub daemons: BTreeMap<PeerIdentity, DaemonRecord>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_daemons(&self) -> Vec<PeerIdentity> {
        self.daemons
            .values()
            .filter(|d| d.state == DaemonState::Up)
            .map(|d| d.identity)
            .collect()
    }

    pub fn proc(&self, name: ProcessName) -> Option<&ProcessRecord> {
        self.jobs.get(&name.job)?.procs.get(&name.rank)
    }

    /// Processes (across all active jobs) currently assigned to `daemon`.
    pub fn hosted_by(&self, daemon: PeerIdentity) -> Vec<ProcessName> {
        self.jobs
            .values()
            .flat_map(|job| job.procs.values())
            .filter(|p| p.daemon == Some(daemon) && !p.state.is_settled())
            .map(|p| p.name)
            .collect()
    }

    /// Room on every live daemon, for the mapper.
    pub fn capacities(&self) -> Vec<HostCapacity> {
        self.daemons
            .values()
            .filter(|d| d.state == DaemonState::Up)
            .filter_map(|d| {
                let node = self.nodes.get(&d.node)?;
                if node.state != NodeState::Up || node.daemon != Some(d.identity) {
                    return None;
                }
                Some(HostCapacity {
                    daemon: d.identity,
                    node: node.name.clone(),
                    slots: node.slots,
                    load: self.hosted_by(d.identity).len() as u32,
                })
            })
            .collect()
    }

    /// Rebuild every node's hosted set from the process records.
    pub fn refresh_hosted(&mut self) {
        for node in self.nodes.values_mut() {
            node.hosted.clear();
        }
        for proc in self.jobs.values().flat_map(|job| job.procs.values()) {
            if proc.state.is_settled() {
                continue;
            }
            if let Some(node) = proc.node.as_ref().and_then(|n| self.nodes.get_mut(n)) {
                node.hosted.insert(proc.name);
            }
        }
    }
}

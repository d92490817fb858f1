use std::collections::BTreeMap;

use crate::bus::envelope::{PeerIdentity, Rank};
use crate::job::JobRecord;

/// Free room on one live daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapacity {
    pub daemon: PeerIdentity,
    pub node: String,
    /// Zero means unlimited.
    pub slots: u32,
    pub load: u32,
}

impl HostCapacity {
    fn has_room(&self) -> bool {
        self.slots == 0 || self.load < self.slots
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub assignments: Vec<Assignment>,
    /// Ranks with nowhere to go this round.
    pub unplaced: Vec<Rank>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub rank: Rank,
    pub daemon: PeerIdentity,
    pub node: String,
}

/// Places processes on daemons.
pub trait Mapper: Send {
    fn map_job(&mut self, job: &JobRecord, ranks: &[Rank], hosts: &[HostCapacity]) -> Placement;
}

/// Puts each rank on the daemon with the fewest hosted processes.
#[derive(Debug, Default, Clone)]
pub struct LeastLoadedMapper;

impl Mapper for LeastLoadedMapper {
    fn map_job(&mut self, job: &JobRecord, ranks: &[Rank], hosts: &[HostCapacity]) -> Placement {
        let mut hosts: BTreeMap<PeerIdentity, HostCapacity> =
            hosts.iter().map(|h| (h.daemon, h.clone())).collect();
        let mut placement = Placement::default();

        for &rank in ranks {
            // Ties go to the lowest identity so placement is deterministic.
            let target = hosts
                .values()
                .filter(|h| h.has_room())
                .min_by_key(|h| (h.load, h.daemon))
                .map(|h| h.daemon);

            match target.and_then(|d| hosts.get_mut(&d)) {
                Some(host) => {
                    host.load += 1;
                    placement.assignments.push(Assignment {
                        rank,
                        daemon: host.daemon,
                        node: host.node.clone(),
                    });
                }
                None => placement.unplaced.push(rank),
            }
        }

        if !placement.unplaced.is_empty() {
            tracing::warn!(job = job.id, unplaced = ?placement.unplaced, "No room for processes");
        }
        placement
    }
}

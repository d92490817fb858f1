use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::bus::envelope::PeerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
    Watching { last_heartbeat: Instant },
    /// Already declared failed; further heartbeats are ignored until re-watched.
    Ignored,
}

/// Tracks heartbeats from watched peers and reports each silent one once.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    peers: HashMap<PeerIdentity, Watch>,
}

impl HeartbeatMonitor {
    /// An interval of zero disables failure detection entirely.
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            peers: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How often to scan, and how old a heartbeat may get.
    pub fn check_period(&self) -> Duration {
        self.interval * 2
    }

    /// Start (or restart) watching `peer` as if it had just beaten.
    pub fn watch(&mut self, peer: PeerIdentity, now: Instant) {
        self.peers.insert(peer, Watch::Watching { last_heartbeat: now });
    }

    /// Record a heartbeat. Returns false for unknown or ignored peers.
    pub fn record(&mut self, peer: PeerIdentity, now: Instant) -> bool {
        match self.peers.get_mut(&peer) {
            Some(Watch::Watching { last_heartbeat }) => {
                *last_heartbeat = now;
                true
            }
            _ => false,
        }
    }

    pub fn ignore(&mut self, peer: PeerIdentity) {
        if let Some(watch) = self.peers.get_mut(&peer) {
            *watch = Watch::Ignored;
        }
    }

    pub fn last_heartbeat(&self, peer: PeerIdentity) -> Option<Instant> {
        match self.peers.get(&peer) {
            Some(Watch::Watching { last_heartbeat }) => Some(*last_heartbeat),
            _ => None,
        }
    }

    /// Peers whose last heartbeat is older than twice the interval. Each one
    /// is returned once and then ignored.
    pub fn scan(&mut self, now: Instant) -> Vec<PeerIdentity> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let limit = self.check_period();
        let mut failed: Vec<PeerIdentity> = self
            .peers
            .iter()
            .filter_map(|(peer, watch)| match watch {
                Watch::Watching { last_heartbeat }
                    if now.saturating_duration_since(*last_heartbeat) > limit =>
                {
                    Some(*peer)
                }
                _ => None,
            })
            .collect();
        failed.sort();
        for peer in &failed {
            self.ignore(*peer);
            tracing::warn!(%peer, limit_ms = limit.as_millis() as u64, "Heartbeat failed");
        }
        failed
    }
}

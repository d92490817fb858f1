//! Announce-on-join, heartbeats and liveness.
//!
//! - [`HeartbeatMonitor`]: per-peer last-heartbeat tracking with one-shot
//!   failure detection
//! - [`WireupBarrier`]: debounced bootstrap barrier used by the scheduler
//!
//! The announce payloads and their classification live here too; the actors
//! decide what to do with each class.

pub mod heartbeat;
pub mod wireup;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::envelope::PeerIdentity;
use crate::bus::registry::AppIdentity;

pub use heartbeat::HeartbeatMonitor;
pub use wireup::{BootstrapReport, WireupBarrier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Scheduler,
    Daemon,
    Tool,
}

/// Static facts about the host a participant runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    pub slots: u32,
}

impl NodeInfo {
    pub fn new(hostname: impl Into<String>, slots: u32) -> Self {
        Self {
            hostname: hostname.into(),
            slots,
        }
    }

    /// This machine, with one slot per available CPU.
    pub fn local() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .unwrap_or_else(|| "localhost".to_string());
        let slots = std::thread::available_parallelism().map_or(1, |n| n.get() as u32);
        Self::new(hostname, slots)
    }
}

/// Who a participant is, as carried by announces and their replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub instance: Uuid,
    pub role: Role,
    pub user: String,
    pub node: NodeInfo,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub presence: Presence,
    pub apps: Vec<AppIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: PeerIdentity,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceReply {
    pub presence: Presence,
    /// Known contacts; only the scheduler fills this in.
    pub directory: Vec<Contact>,
}

/// The local participant's own presence.
#[derive(Debug, Clone)]
pub struct LocalPresence {
    pub identity: PeerIdentity,
    pub instance: Uuid,
    pub role: Role,
    pub user: String,
    pub node: NodeInfo,
}

impl LocalPresence {
    pub fn new(identity: PeerIdentity, role: Role, node: NodeInfo) -> Self {
        Self {
            identity,
            instance: Uuid::new_v4(),
            role,
            user: current_user(),
            node,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn presence(&self, contact: Option<String>) -> Presence {
        Presence {
            instance: self.instance,
            role: self.role,
            user: self.user.clone(),
            node: self.node.clone(),
            contact,
        }
    }

    pub fn is_foreign(&self, peer: PeerIdentity) -> bool {
        peer.family != self.identity.family
    }

    /// Classify a peer's presence from its announce or announce reply.
    pub fn classify(&self, sender: PeerIdentity, other: &Presence) -> AnnounceClass {
        if !self.is_foreign(sender) {
            return AnnounceClass::Accept;
        }
        let same_daemon_slot = self.role == Role::Daemon
            && other.role == Role::Daemon
            && self.user == other.user
            && self.node.hostname == other.node.hostname;
        if same_daemon_slot {
            AnnounceClass::Conflict
        } else {
            AnnounceClass::Foreign
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceClass {
    Accept,
    /// Another cluster instance; ignore it.
    Foreign,
    /// Another cluster's daemon for the same user on the same node.
    Conflict,
}

pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon(family: u32, host: &str) -> LocalPresence {
        LocalPresence::new(PeerIdentity::new(family, 2), Role::Daemon, NodeInfo::new(host, 4))
            .with_user("alice")
    }

    #[test]
    fn same_family_is_accepted() {
        let me = daemon(1, "n1");
        let other = daemon(1, "n1").presence(None);
        assert_eq!(me.classify(PeerIdentity::new(1, 3), &other), AnnounceClass::Accept);
    }

    #[test]
    fn foreign_daemon_on_same_node_conflicts() {
        let me = daemon(1, "n1");
        let other = daemon(2, "n1").presence(None);
        assert_eq!(me.classify(PeerIdentity::new(2, 2), &other), AnnounceClass::Conflict);
    }

    #[test]
    fn foreign_daemon_elsewhere_is_ignored() {
        let me = daemon(1, "n1");
        let elsewhere = daemon(2, "n2").presence(None);
        assert_eq!(me.classify(PeerIdentity::new(2, 2), &elsewhere), AnnounceClass::Foreign);

        let other_user = daemon(2, "n1").with_user("bob").presence(None);
        assert_eq!(me.classify(PeerIdentity::new(2, 2), &other_user), AnnounceClass::Foreign);
    }

    #[test]
    fn scheduler_never_conflicts() {
        let me = LocalPresence::new(PeerIdentity::scheduler(1), Role::Scheduler, NodeInfo::new("n1", 1))
            .with_user("alice");
        let other = daemon(2, "n1").presence(None);
        assert_eq!(me.classify(PeerIdentity::new(2, 2), &other), AnnounceClass::Foreign);
    }
}

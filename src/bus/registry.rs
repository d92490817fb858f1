use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bus::envelope::{Channel, Envelope, PeerIdentity, Tag};

/// Namespace of an application cohort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppIdentity {
    pub name: String,
    pub version: String,
    pub release: String,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            release: release.into(),
        }
    }
}

impl std::fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}.{}", self.name, self.version, self.release)
    }
}

pub type SubscriptionId = u64;

#[derive(Debug)]
struct Subscription {
    id: SubscriptionId,
    app: AppIdentity,
    channel: Channel,
    tag: Tag,
    handler: mpsc::UnboundedSender<Envelope>,
}

/// Known peers of one application and who currently leads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub app: AppIdentity,
    pub channels: BTreeSet<Channel>,
    pub pending_receives: usize,
    pub members: BTreeSet<PeerIdentity>,
    pub leader: Option<PeerIdentity>,
}

impl GroupRecord {
    fn new(app: AppIdentity) -> Self {
        Self {
            app,
            channels: BTreeSet::new(),
            pending_receives: 0,
            members: BTreeSet::new(),
            leader: None,
        }
    }

    /// Lowest-ranked live member leads.
    fn elect_leader(&mut self) -> bool {
        let leader = self.members.iter().next().copied();
        let changed = leader != self.leader;
        self.leader = leader;
        changed
    }
}

/// Local callbacks per (channel, tag) and the application groups they imply.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: SubscriptionId,
    subscriptions: Vec<Subscription>,
    groups: BTreeMap<AppIdentity, GroupRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Several apps may listen on the same (channel, tag).
    pub fn subscribe(
        &mut self,
        app: &AppIdentity,
        channel: Channel,
        tag: Tag,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Envelope>) {
        let (handler, rx) = mpsc::unbounded_channel();
        self.next_id += 1;
        let id = self.next_id;
        self.subscriptions.push(Subscription {
            id,
            app: app.clone(),
            channel,
            tag,
            handler,
        });

        let group = self
            .groups
            .entry(app.clone())
            .or_insert_with(|| GroupRecord::new(app.clone()));
        group.channels.insert(channel);
        group.pending_receives += 1;

        tracing::debug!(app = %app, %channel, %tag, id, "Subscribed");
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(pos) = self.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        let sub = self.subscriptions.remove(pos);
        self.release(&sub);
        true
    }

    fn release(&mut self, sub: &Subscription) {
        let still_on_channel = self
            .subscriptions
            .iter()
            .any(|s| s.app == sub.app && s.channel == sub.channel);
        if let Some(group) = self.groups.get_mut(&sub.app) {
            group.pending_receives = group.pending_receives.saturating_sub(1);
            if !still_on_channel {
                group.channels.remove(&sub.channel);
            }
        }
    }

    /// Hand the envelope to every matching handler. Returns how many fired.
    pub fn dispatch(&mut self, envelope: &Envelope) -> usize {
        let mut fired = 0;
        let mut closed = Vec::new();
        for sub in &self.subscriptions {
            if sub.channel != envelope.channel || sub.tag != envelope.tag {
                continue;
            }
            if sub.handler.send(envelope.clone()).is_ok() {
                fired += 1;
            } else {
                closed.push(sub.id);
            }
        }
        for id in closed {
            self.unsubscribe(id);
        }
        fired
    }

    /// Record `peer` as a member of `app`'s group.
    pub fn join(&mut self, app: &AppIdentity, peer: PeerIdentity) {
        let group = self
            .groups
            .entry(app.clone())
            .or_insert_with(|| GroupRecord::new(app.clone()));
        if group.members.insert(peer) && group.elect_leader() {
            tracing::debug!(app = %app, leader = ?group.leader, "Group leader changed");
        }
    }

    /// Drop a dead peer from every group. Returns the apps whose leader changed.
    pub fn peer_lost(&mut self, peer: PeerIdentity) -> Vec<AppIdentity> {
        let mut changed = Vec::new();
        for group in self.groups.values_mut() {
            if group.members.remove(&peer) && group.elect_leader() {
                tracing::info!(app = %group.app, leader = ?group.leader, lost = %peer, "Group leader changed");
                changed.push(group.app.clone());
            }
        }
        changed
    }

    pub fn group(&self, app: &AppIdentity) -> Option<&GroupRecord> {
        self.groups.get(app)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupRecord> {
        self.groups.values()
    }

    /// Apps with at least one live local subscription.
    pub fn local_apps(&self) -> Vec<AppIdentity> {
        self.groups
            .values()
            .filter(|g| g.pending_receives > 0)
            .map(|g| g.app.clone())
            .collect()
    }
}

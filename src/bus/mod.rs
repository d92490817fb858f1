//! Channel/tag publish-subscribe bus.
//!
//! Every participant owns one [`Bus`]. It numbers outbound streams, validates
//! inbound ones against the [`SourceTable`](sequence::SourceTable), and fans
//! accepted envelopes out to local subscriptions.
//!
//! # Components
//!
//! - [`envelope`]: identities, channels, tags, the wire envelope
//! - [`sequence`]: per-source ordering validation
//! - [`registry`]: local subscriptions and application groups
//! - [`transport`]: the wire (in-process hub or UDP)
//! - [`frame`]: datagram splitting for envelopes larger than one datagram
//!
//! The bus is not shared: it lives inside one actor and is driven from its
//! event loop, so nothing here is locked.

pub mod envelope;
pub mod frame;
pub mod registry;
pub mod sequence;
pub mod transport;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use envelope::{next_seq, Channel, Envelope, PeerIdentity, Tag};
use registry::{AppIdentity, Registry, SubscriptionId};
use sequence::{SourceTable, Verdict};
use transport::{completed, SendStatus, Transport, TransportError};

/// Invoked once per distinct peer answering our announce.
pub type AnnounceCallback = Box<dyn FnMut(PeerIdentity) + Send>;

struct AnnounceTracker {
    responders: BTreeSet<PeerIdentity>,
    callback: AnnounceCallback,
}

/// A message waiting to ride along with the next heartbeat.
#[derive(Debug, Clone)]
struct Piggyback {
    channel: Channel,
    target: Option<PeerIdentity>,
    tag: Tag,
    payload: Vec<u8>,
}

pub struct Bus {
    identity: PeerIdentity,
    transport: Arc<dyn Transport>,
    /// Next sequence number per (channel, unicast target).
    counters: HashMap<(Channel, Option<PeerIdentity>), u32>,
    sources: SourceTable,
    registry: Registry,
    piggyback: VecDeque<Piggyback>,
    tracker: Option<AnnounceTracker>,
}

impl Bus {
    pub fn new(identity: PeerIdentity, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity,
            transport,
            counters: HashMap::new(),
            sources: SourceTable::new(),
            registry: Registry::new(),
            piggyback: VecDeque::new(),
            tracker: None,
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    pub fn contact(&self) -> Option<String> {
        self.transport.contact()
    }

    pub fn sources(&self) -> &SourceTable {
        &self.sources
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn stamp(&mut self, channel: Channel, target: Option<PeerIdentity>) -> u32 {
        let counter = self.counters.entry((channel, target)).or_insert(0);
        let seq = *counter;
        *counter = next_seq(seq);
        seq
    }

    /// Send `payload` on `channel` with `tag`, to one peer or (`None`) to every
    /// member. Returns immediately; the receiver resolves when the send is done.
    ///
    /// A send the transport refuses outright does not consume a sequence
    /// number, so receivers see no gap.
    pub fn publish(
        &mut self,
        channel: Channel,
        target: Option<PeerIdentity>,
        tag: Tag,
        payload: Vec<u8>,
    ) -> oneshot::Receiver<SendStatus> {
        let seq = self.stamp(channel, target);
        let envelope = Envelope {
            sender: self.identity,
            target,
            channel,
            tag,
            seq,
            payload,
        };
        tracing::trace!(%channel, %tag, seq, target = ?target, "Publishing");
        let mut status = self.transport.send(envelope);
        match status.try_recv() {
            Ok(Err(e)) => {
                self.counters.insert((channel, target), seq);
                completed(Err(e))
            }
            Ok(Ok(())) => completed(Ok(())),
            Err(oneshot::error::TryRecvError::Empty) => status,
            Err(oneshot::error::TryRecvError::Closed) => completed(Err(TransportError::Closed)),
        }
    }

    /// Publish without waiting on the outcome. Failures are logged.
    pub fn post(&mut self, channel: Channel, target: Option<PeerIdentity>, tag: Tag, payload: Vec<u8>) {
        let status = self.publish(channel, target, tag, payload);
        watch_send(status, channel, tag);
    }

    /// Like [`post`](Self::post), but a send the transport refuses outright
    /// is returned to the caller instead of logged.
    pub fn try_post(
        &mut self,
        channel: Channel,
        target: Option<PeerIdentity>,
        tag: Tag,
        payload: Vec<u8>,
    ) -> std::result::Result<(), TransportError> {
        let mut status = self.publish(channel, target, tag, payload);
        match status.try_recv() {
            Ok(result) => result,
            Err(_) => {
                watch_send(status, channel, tag);
                Ok(())
            }
        }
    }

    /// Serialize `message` and [`post`](Self::post) it.
    pub fn post_msg<T: Serialize>(
        &mut self,
        channel: Channel,
        target: Option<PeerIdentity>,
        tag: Tag,
        message: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.post(channel, target, tag, payload);
        Ok(())
    }

    pub fn subscribe(
        &mut self,
        app: &AppIdentity,
        channel: Channel,
        tag: Tag,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Envelope>) {
        self.registry.subscribe(app, channel, tag)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn join_group(&mut self, app: &AppIdentity, peer: PeerIdentity) {
        self.registry.join(app, peer);
    }

    /// Broadcast an announce. `callback` fires once for each distinct peer
    /// that answers; a new announce replaces the previous tracker.
    pub fn announce(
        &mut self,
        payload: Vec<u8>,
        callback: impl FnMut(PeerIdentity) + Send + 'static,
    ) -> oneshot::Receiver<SendStatus> {
        self.tracker = Some(AnnounceTracker {
            responders: BTreeSet::new(),
            callback: Box::new(callback),
        });
        self.publish(Channel::SystemControl, None, Tag::Announce, payload)
    }

    /// Number of distinct peers that answered the latest announce.
    pub fn announce_responders(&self) -> usize {
        self.tracker.as_ref().map_or(0, |t| t.responders.len())
    }

    /// Queue an application message for the next heartbeat.
    pub fn queue_piggyback(&mut self, channel: Channel, target: Option<PeerIdentity>, tag: Tag, payload: Vec<u8>) {
        self.piggyback.push_back(Piggyback {
            channel,
            target,
            tag,
            payload,
        });
    }

    pub fn piggyback_len(&self) -> usize {
        self.piggyback.len()
    }

    /// Drain queued piggyback messages, then broadcast a heartbeat.
    pub fn heartbeat(&mut self) {
        while let Some(msg) = self.piggyback.pop_front() {
            self.post(msg.channel, msg.target, msg.tag, msg.payload);
        }
        self.post(Channel::SystemControl, None, Tag::Heartbeat, Vec::new());
    }

    /// Tell the transport how to reach a peer.
    pub fn learn(&mut self, peer: PeerIdentity, contact: &str) {
        if peer != self.identity {
            self.transport.learn(peer, contact);
        }
    }

    /// A peer is dead: drop its stream record, stop routing to it and drop it
    /// from every group.
    pub fn forget_peer(&mut self, peer: PeerIdentity) -> Vec<AppIdentity> {
        self.sources.remove(peer);
        self.transport.forget(peer);
        self.registry.peer_lost(peer)
    }

    /// Validate and dispatch one inbound envelope.
    ///
    /// Returns the envelope when it was accepted so the owning actor can act
    /// on control traffic; `None` means it was dropped.
    pub fn receive(&mut self, envelope: Envelope, now: Instant) -> Option<Envelope> {
        if envelope.sender == self.identity {
            return None;
        }
        if let Some(target) = envelope.target {
            if target != self.identity {
                tracing::debug!(sender = %envelope.sender, %target, "Dropping misrouted envelope");
                return None;
            }
        }
        if envelope.tag == Tag::Announce {
            self.sources.restart(envelope.sender, now);
        }

        match self.sources.check(&envelope, now) {
            Verdict::Accepted => {}
            Verdict::Stale { last_accepted } => {
                tracing::debug!(
                    sender = %envelope.sender,
                    channel = %envelope.channel,
                    seq = envelope.seq,
                    last_accepted,
                    "Dropping duplicate or reordered envelope"
                );
                return None;
            }
            Verdict::Gap { last_accepted } => {
                tracing::debug!(
                    sender = %envelope.sender,
                    channel = %envelope.channel,
                    seq = envelope.seq,
                    last_accepted,
                    "Sequence gap, dropping and resynchronising"
                );
                return None;
            }
        }

        if envelope.tag == Tag::AnnounceReply {
            if let Some(tracker) = self.tracker.as_mut() {
                if tracker.responders.insert(envelope.sender) {
                    (tracker.callback)(envelope.sender);
                }
            }
        }

        self.registry.dispatch(&envelope);
        Some(envelope)
    }
}

fn watch_send(mut status: oneshot::Receiver<SendStatus>, channel: Channel, tag: Tag) {
    match status.try_recv() {
        Ok(Ok(())) | Err(oneshot::error::TryRecvError::Closed) => {}
        Ok(Err(e)) => tracing::debug!(%channel, %tag, error = %e, "Send failed"),
        Err(oneshot::error::TryRecvError::Empty) => {
            tokio::spawn(async move {
                if let Ok(Err(e)) = status.await {
                    tracing::debug!(%channel, %tag, error = %e, "Send failed");
                }
            });
        }
    }
}

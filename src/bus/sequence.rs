//! Per-source ordering validation.
//!
//! Every sender numbers each of its streams independently. A stream is one
//! channel, either broadcast or directed at the receiver. The receiver keeps
//! the last accepted number per stream and only accepts the exact successor.
//!
//! A rejected number is always dropped. When it lies ahead of the stream
//! (numbers were lost on the wire) the stream is resynchronised to it, so a
//! single lost datagram does not silence a peer for good.

use std::collections::HashMap;
use std::time::Instant;

use crate::bus::envelope::{Channel, Envelope, PeerIdentity, SEQ_MAX};

/// Decide whether `incoming` may follow `last_accepted` on one stream.
///
/// `None` means nothing has been accepted yet, so any number starts the stream.
pub fn is_valid_next(last_accepted: Option<u32>, incoming: u32) -> bool {
    match last_accepted {
        None => true,
        Some(SEQ_MAX) => incoming == 0,
        Some(last) => incoming == last + 1,
    }
}

/// One ordered stream from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub channel: Channel,
    /// Unicast traffic addressed to us is numbered apart from broadcasts.
    pub directed: bool,
}

impl StreamKey {
    pub fn of(envelope: &Envelope) -> Self {
        Self {
            channel: envelope.channel,
            directed: envelope.target.is_some(),
        }
    }
}

/// What we know about one remote peer.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub identity: PeerIdentity,
    last_accepted: HashMap<StreamKey, u32>,
    pub last_seen: Instant,
}

impl SourceRecord {
    pub fn new(identity: PeerIdentity, now: Instant) -> Self {
        Self {
            identity,
            last_accepted: HashMap::new(),
            last_seen: now,
        }
    }

    pub fn last_accepted(&self, key: StreamKey) -> Option<u32> {
        self.last_accepted.get(&key).copied()
    }

    /// Accept `seq` on `key` if it is the valid successor.
    pub fn accept(&mut self, key: StreamKey, seq: u32) -> bool {
        if !is_valid_next(self.last_accepted(key), seq) {
            return false;
        }
        self.last_accepted.insert(key, seq);
        true
    }

    fn resync(&mut self, key: StreamKey, seq: u32) {
        self.last_accepted.insert(key, seq);
    }

    /// Forget every stream position, as for a freshly announced peer.
    pub fn reset_streams(&mut self) {
        self.last_accepted.clear();
    }
}

/// Outcome of validating one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    /// Duplicate or reordered. Dropped.
    Stale { last_accepted: u32 },
    /// Numbers were skipped. Dropped, and the stream continues after it.
    Gap { last_accepted: u32 },
}

/// True when `incoming` is ahead of `last` by less than half the number space.
fn is_ahead(last: u32, incoming: u32) -> bool {
    let distance = incoming.wrapping_sub(last);
    distance != 0 && distance < (1 << 31)
}

/// All source records held by one participant.
#[derive(Debug, Default)]
pub struct SourceTable {
    sources: HashMap<PeerIdentity, SourceRecord>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate an envelope against its sender's stream, creating the record
    /// on first contact.
    pub fn check(&mut self, envelope: &Envelope, now: Instant) -> Verdict {
        let record = self
            .sources
            .entry(envelope.sender)
            .or_insert_with(|| SourceRecord::new(envelope.sender, now));
        let key = StreamKey::of(envelope);
        if record.accept(key, envelope.seq) {
            record.last_seen = now;
            return Verdict::Accepted;
        }
        // accept() only refuses once something was accepted
        let last_accepted = record.last_accepted(key).unwrap_or_default();
        if is_ahead(last_accepted, envelope.seq) {
            record.resync(key, envelope.seq);
            record.last_seen = now;
            Verdict::Gap { last_accepted }
        } else {
            Verdict::Stale { last_accepted }
        }
    }

    /// Put a peer back into the accept-anything state (it announced itself).
    pub fn restart(&mut self, identity: PeerIdentity, now: Instant) {
        let record = self
            .sources
            .entry(identity)
            .or_insert_with(|| SourceRecord::new(identity, now));
        record.reset_streams();
        record.last_seen = now;
    }

    pub fn remove(&mut self, identity: PeerIdentity) -> Option<SourceRecord> {
        self.sources.remove(&identity)
    }

    pub fn get(&self, identity: PeerIdentity) -> Option<&SourceRecord> {
        self.sources.get(&identity)
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = self.sources.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

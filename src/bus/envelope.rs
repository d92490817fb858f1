use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::transport::TransportError;
use crate::error::Result;

/// Namespace partition separating one cluster instance from another.
pub type JobFamily = u32;
pub type Rank = u32;

/// Rank of the scheduler within a daemon job-family.
pub const SCHEDULER_RANK: Rank = 0;
/// Rank reserved for the scheduler's backup/launcher role.
pub const LAUNCHER_RANK: Rank = 1;
/// First rank available to per-node daemons.
pub const FIRST_DAEMON_RANK: Rank = 2;
/// Ranks at or above this value belong to short-lived tools.
pub const TOOL_RANK_BASE: Rank = 1 << 30;

/// Largest sequence number before a stream wraps back to zero.
pub const SEQ_MAX: u32 = u32::MAX;

/// Unique name of any bus participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub family: JobFamily,
    pub rank: Rank,
}

impl PeerIdentity {
    pub const fn new(family: JobFamily, rank: Rank) -> Self {
        Self { family, rank }
    }

    pub const fn scheduler(family: JobFamily) -> Self {
        Self::new(family, SCHEDULER_RANK)
    }

    pub fn is_scheduler(&self) -> bool {
        self.rank == SCHEDULER_RANK
    }

    pub fn is_daemon(&self) -> bool {
        (FIRST_DAEMON_RANK..TOOL_RANK_BASE).contains(&self.rank)
    }

    pub fn is_tool(&self) -> bool {
        self.rank >= TOOL_RANK_BASE
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.family, self.rank)
    }
}

/// Logical multicast topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    SystemControl,
    ErrorReport,
    DataExchange,
    ApplicationPublic,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::SystemControl => write!(f, "system-control"),
            Channel::ErrorReport => write!(f, "error-report"),
            Channel::DataExchange => write!(f, "data-exchange"),
            Channel::ApplicationPublic => write!(f, "application-public"),
        }
    }
}

/// Message purpose within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tag {
    Announce,
    AnnounceReply,
    Heartbeat,
    Command,
    ProcessStateUpdate,
    ToolRequest,
    ToolResponse,
    /// Application-defined tag.
    App(u32),
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Announce => write!(f, "announce"),
            Tag::AnnounceReply => write!(f, "announce-reply"),
            Tag::Heartbeat => write!(f, "heartbeat"),
            Tag::Command => write!(f, "command"),
            Tag::ProcessStateUpdate => write!(f, "process-state-update"),
            Tag::ToolRequest => write!(f, "tool-request"),
            Tag::ToolResponse => write!(f, "tool-response"),
            Tag::App(n) => write!(f, "app-{}", n),
        }
    }
}

/// The unit the transport carries. Created at send time, discarded after dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerIdentity,
    /// `None` for a broadcast to the channel.
    pub target: Option<PeerIdentity>,
    pub channel: Channel,
    pub tag: Tag,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Wire form: a big-endian `u32` header length, the JSON header, then the
    /// payload bytes as-is.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&Header {
            sender: self.sender,
            target: self.target,
            channel: self.channel,
            tag: self.tag,
            seq: self.seq,
        })?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| TransportError::Malformed("envelope header too long".to_string()))?;
        let mut bytes = Vec::with_capacity(4 + header.len() + self.payload.len());
        bytes.extend_from_slice(&header_len.to_be_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(TransportError::Malformed("truncated envelope".to_string()).into());
        }
        let (len, rest) = bytes.split_at(4);
        let header_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < header_len {
            return Err(TransportError::Malformed("truncated envelope header".to_string()).into());
        }
        let (header, payload) = rest.split_at(header_len);
        let header: Header = serde_json::from_slice(header)?;
        Ok(Self {
            sender: header.sender,
            target: header.target,
            channel: header.channel,
            tag: header.tag,
            seq: header.seq,
            payload: payload.to_vec(),
        })
    }

    /// Size of [`to_bytes`](Self::to_bytes) output, give or take a few header bytes.
    pub fn approx_len(&self) -> usize {
        64 + self.payload.len()
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    sender: PeerIdentity,
    target: Option<PeerIdentity>,
    channel: Channel,
    tag: Tag,
    seq: u32,
}

/// Sequence number following `current`, wrapping at [`SEQ_MAX`].
pub fn next_seq(current: u32) -> u32 {
    if current == SEQ_MAX {
        0
    } else {
        current + 1
    }
}

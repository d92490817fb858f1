//! Wire transports for envelopes.
//!
//! A transport moves one envelope at a time and reports the outcome through a
//! oneshot completion. It never retries: loss is silent and the layers above
//! (heartbeats, launch deadlines) are built around that.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::bus::envelope::{Envelope, PeerIdentity};
use crate::bus::frame::{self, Reassembler, MAX_DATAGRAM};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    NoRoute(PeerIdentity),

    #[error("local endpoint is closed")]
    Closed,

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("send failed: {0}")]
    Io(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

pub type SendStatus = Result<(), TransportError>;

/// Moves envelopes between participants.
pub trait Transport: Send + Sync {
    /// Hand one envelope to the wire. The returned receiver resolves once the
    /// send has completed or failed.
    fn send(&self, envelope: Envelope) -> oneshot::Receiver<SendStatus>;

    /// Record a contact address for a peer.
    fn learn(&self, _peer: PeerIdentity, _contact: &str) {}

    /// Drop routing state for a peer.
    fn forget(&self, _peer: PeerIdentity) {}

    /// Address other participants should use to reach us.
    fn contact(&self) -> Option<String> {
        None
    }
}

pub(crate) fn completed(status: SendStatus) -> oneshot::Receiver<SendStatus> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(status);
    rx
}

// =============================================================================
// In-process hub
// =============================================================================

/// Decides, per delivery, whether an envelope bound for a peer is lost.
type DropFilter = Arc<dyn Fn(PeerIdentity, &Envelope) -> bool + Send + Sync>;

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerIdentity, mpsc::UnboundedSender<Envelope>>,
    loss_rate: f64,
    drop_filter: Option<DropFilter>,
}

impl std::fmt::Debug for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubState")
            .field("endpoints", &self.endpoints.len())
            .field("loss_rate", &self.loss_rate)
            .field("drop_filter", &self.drop_filter.is_some())
            .finish()
    }
}

/// Shared in-process network. Every attached endpoint sees every broadcast.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a participant. Re-attaching an identity replaces the old endpoint.
    pub fn attach(&self, identity: PeerIdentity) -> (LocalTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().endpoints.insert(identity, tx);
        (
            LocalTransport {
                identity,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Cut a participant off the network, as if its host died.
    pub fn detach(&self, identity: PeerIdentity) -> bool {
        self.state().endpoints.remove(&identity).is_some()
    }

    /// Probability in `[0, 1]` that any single delivery is silently lost.
    pub fn set_loss_rate(&self, rate: f64) {
        self.state().loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Silently lose every delivery for which `filter(recipient, envelope)`
    /// is true, until [`clear_drop_filter`](Self::clear_drop_filter).
    pub fn set_drop_filter(&self, filter: impl Fn(PeerIdentity, &Envelope) -> bool + Send + Sync + 'static) {
        self.state().drop_filter = Some(Arc::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.state().drop_filter = None;
    }

    pub fn members(&self) -> Vec<PeerIdentity> {
        let mut members: Vec<PeerIdentity> = self.state().endpoints.keys().copied().collect();
        members.sort();
        members
    }

    fn deliver(&self, from: PeerIdentity, envelope: Envelope) -> SendStatus {
        let state = self.state();
        if !state.endpoints.contains_key(&from) {
            return Err(TransportError::Closed);
        }
        let loss_rate = state.loss_rate;
        let filter = state.drop_filter.clone();
        let mut rng = rand::thread_rng();
        let mut lost = |to: PeerIdentity, envelope: &Envelope| {
            filter.as_ref().map_or(false, |f| f(to, envelope)) || (loss_rate > 0.0 && rng.gen_bool(loss_rate))
        };

        match envelope.target {
            Some(target) => {
                let endpoint = state
                    .endpoints
                    .get(&target)
                    .ok_or(TransportError::NoRoute(target))?;
                if !lost(target, &envelope) {
                    endpoint
                        .send(envelope)
                        .map_err(|_| TransportError::NoRoute(target))?;
                }
            }
            None => {
                for (peer, endpoint) in state.endpoints.iter() {
                    if *peer == from || lost(*peer, &envelope) {
                        continue;
                    }
                    let _ = endpoint.send(envelope.clone());
                }
            }
        }
        Ok(())
    }
}

/// One participant's handle on a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    identity: PeerIdentity,
    hub: LocalHub,
}

impl Transport for LocalTransport {
    fn send(&self, envelope: Envelope) -> oneshot::Receiver<SendStatus> {
        if let Err(e) = frame::check_size(envelope.approx_len()) {
            return completed(Err(e));
        }
        completed(self.hub.deliver(self.identity, envelope))
    }

    fn contact(&self) -> Option<String> {
        Some(format!("local:{}", self.identity))
    }
}

// =============================================================================
// UDP fan-out
// =============================================================================

/// UDP transport. Broadcasts fan out to every known contact and seed.
/// Envelopes too big for one datagram travel as several
/// [frames](crate::bus::frame).
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    seeds: Vec<SocketAddr>,
    contacts: Arc<RwLock<HashMap<PeerIdentity, SocketAddr>>>,
    next_message: AtomicU64,
}

impl UdpTransport {
    /// Bind `addr` and start the receive loop. Decoded envelopes are forwarded
    /// on the returned receiver; the loop ends when the receiver is dropped.
    pub async fn bind(
        addr: SocketAddr,
        seeds: Vec<SocketAddr>,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let contacts = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::recv_loop(socket.clone(), contacts.clone(), tx));
        tracing::info!(addr = %local_addr, seeds = ?seeds, "UDP transport bound");

        Ok((
            Self {
                socket,
                local_addr,
                seeds,
                contacts,
                next_message: AtomicU64::new(rand::thread_rng().gen()),
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        contacts: Arc<RwLock<HashMap<PeerIdentity, SocketAddr>>>,
        tx: mpsc::UnboundedSender<Envelope>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut reassembler = Reassembler::new();
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "UDP receive failed");
                    continue;
                }
            };
            let bytes = match reassembler.accept(from, &buf[..len], Instant::now()) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "Dropping malformed datagram");
                    continue;
                }
            };
            let envelope = match Envelope::from_bytes(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "Dropping undecodable datagram");
                    continue;
                }
            };
            if let Ok(mut contacts) = contacts.write() {
                contacts.insert(envelope.sender, from);
            }
            if tx.send(envelope).is_err() {
                break;
            }
        }
    }

    fn destinations(&self, envelope: &Envelope) -> Result<Vec<SocketAddr>, TransportError> {
        let contacts = self
            .contacts
            .read()
            .map_err(|_| TransportError::Io("contact table poisoned".to_string()))?;
        match envelope.target {
            Some(target) => contacts
                .get(&target)
                .map(|addr| vec![*addr])
                .ok_or(TransportError::NoRoute(target)),
            None => {
                let mut seen = HashSet::new();
                Ok(contacts
                    .iter()
                    .filter(|(peer, _)| **peer != envelope.sender)
                    .map(|(_, addr)| *addr)
                    .chain(self.seeds.iter().copied())
                    .filter(|addr| *addr != self.local_addr && seen.insert(*addr))
                    .collect())
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, envelope: Envelope) -> oneshot::Receiver<SendStatus> {
        let destinations = match self.destinations(&envelope) {
            Ok(destinations) => destinations,
            Err(e) => return completed(Err(e)),
        };
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return completed(Err(TransportError::Encode(e.to_string()))),
        };
        let frames = match frame::split(&bytes, self.next_message.fetch_add(1, Ordering::Relaxed)) {
            Ok(frames) => frames,
            Err(e) => return completed(Err(e)),
        };

        let (tx, rx) = oneshot::channel();
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut status = Ok(());
            for addr in destinations {
                for frame in &frames {
                    if let Err(e) = socket.send_to(frame, addr).await {
                        status = Err(TransportError::Io(format!("{}: {}", addr, e)));
                        break;
                    }
                }
            }
            let _ = tx.send(status);
        });
        rx
    }

    fn learn(&self, peer: PeerIdentity, contact: &str) {
        match contact.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Ok(mut contacts) = self.contacts.write() {
                    // A wildcard bind names no host; keep the observed source address.
                    if addr.ip().is_unspecified() && contacts.contains_key(&peer) {
                        return;
                    }
                    contacts.insert(peer, addr);
                }
            }
            Err(_) => tracing::debug!(%peer, contact, "Ignoring non-UDP contact"),
        }
    }

    fn forget(&self, peer: PeerIdentity) {
        if let Ok(mut contacts) = self.contacts.write() {
            contacts.remove(&peer);
        }
    }

    fn contact(&self) -> Option<String> {
        Some(self.local_addr.to_string())
    }
}

//! Splitting encoded envelopes across datagrams.
//!
//! An envelope that fits in one datagram goes out as a single whole frame.
//! Larger ones are cut into numbered part frames that the receiver stitches
//! back together. A message whose parts do not all arrive within
//! [`REASSEMBLY_TIMEOUT`] is dropped like any other lost datagram.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::bus::transport::TransportError;

/// Receive buffer size; no frame is larger.
pub const MAX_DATAGRAM: usize = 64 * 1024;
/// Bytes of encoded envelope carried by one frame.
pub const PART_BYTES: usize = 48 * 1024;
/// Largest encoded envelope any transport carries.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Incomplete messages held per receiver before the oldest is dropped.
const MAX_PENDING: usize = 64;

const WHOLE: u8 = 0;
const PART: u8 = 1;
/// Kind byte, message id, part index, part count.
const PART_HEADER: usize = 1 + 8 + 2 + 2;

fn max_parts() -> usize {
    MAX_MESSAGE_BYTES.div_ceil(PART_BYTES)
}

/// Refuse an encoded envelope of `size` bytes if it is over the limit.
pub fn check_size(size: usize) -> Result<(), TransportError> {
    if size > MAX_MESSAGE_BYTES {
        return Err(TransportError::TooLarge {
            size,
            limit: MAX_MESSAGE_BYTES,
        });
    }
    Ok(())
}

/// Cut `bytes` into datagrams. `message_id` must be unique per sender for as
/// long as the parts may be in flight.
pub fn split(bytes: &[u8], message_id: u64) -> Result<Vec<Vec<u8>>, TransportError> {
    check_size(bytes.len())?;
    if bytes.len() <= PART_BYTES {
        let mut frame = Vec::with_capacity(1 + bytes.len());
        frame.push(WHOLE);
        frame.extend_from_slice(bytes);
        return Ok(vec![frame]);
    }

    let count = bytes.len().div_ceil(PART_BYTES) as u16;
    Ok(bytes
        .chunks(PART_BYTES)
        .enumerate()
        .map(|(index, chunk)| {
            let mut frame = Vec::with_capacity(PART_HEADER + chunk.len());
            frame.push(PART);
            frame.extend_from_slice(&message_id.to_be_bytes());
            frame.extend_from_slice(&(index as u16).to_be_bytes());
            frame.extend_from_slice(&count.to_be_bytes());
            frame.extend_from_slice(chunk);
            frame
        })
        .collect())
}

struct Partial {
    parts: Vec<Option<Vec<u8>>>,
    filled: usize,
    started: Instant,
}

/// Collects part frames per (source address, message id).
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<(SocketAddr, u64), Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incomplete messages currently held.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Take one datagram. Returns the encoded envelope once it is complete.
    pub fn accept(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let (&kind, rest) = datagram
            .split_first()
            .ok_or_else(|| TransportError::Malformed("empty datagram".to_string()))?;
        match kind {
            WHOLE => Ok(Some(rest.to_vec())),
            PART => self.accept_part(from, datagram, now),
            other => Err(TransportError::Malformed(format!("unknown frame kind {}", other))),
        }
    }

    fn accept_part(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if datagram.len() <= PART_HEADER {
            return Err(TransportError::Malformed("truncated part frame".to_string()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&datagram[1..9]);
        let id = u64::from_be_bytes(id);
        let index = u16::from_be_bytes([datagram[9], datagram[10]]) as usize;
        let count = u16::from_be_bytes([datagram[11], datagram[12]]) as usize;
        if count < 2 || count > max_parts() || index >= count {
            return Err(TransportError::Malformed(format!("bad part {} of {}", index, count)));
        }

        self.pending
            .retain(|_, partial| now.saturating_duration_since(partial.started) < REASSEMBLY_TIMEOUT);
        let key = (from, id);
        if !self.pending.contains_key(&key) && self.pending.len() >= MAX_PENDING {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, partial)| partial.started)
                .map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                self.pending.remove(&oldest);
            }
        }

        let partial = self.pending.entry(key).or_insert_with(|| Partial {
            parts: vec![None; count],
            filled: 0,
            started: now,
        });
        if partial.parts.len() != count {
            self.pending.remove(&key);
            return Err(TransportError::Malformed("part count changed mid-message".to_string()));
        }
        if partial.parts[index].is_none() {
            partial.parts[index] = Some(datagram[PART_HEADER..].to_vec());
            partial.filled += 1;
        }
        if partial.filled < count {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&key) else {
            return Ok(None);
        };
        Ok(Some(partial.parts.into_iter().flatten().flatten().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn small_message_is_one_frame() {
        let frames = split(b"{}", 1).unwrap();
        assert_eq!(frames.len(), 1);

        let mut r = Reassembler::new();
        assert_eq!(r.accept(addr(), &frames[0], Instant::now()).unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn parts_reassemble_in_any_order() {
        let bytes = message(PART_BYTES * 3 + 10);
        let mut frames = split(&bytes, 42).unwrap();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.len() <= MAX_DATAGRAM));
        frames.reverse();

        let mut r = Reassembler::new();
        let now = Instant::now();
        // A duplicate part is harmless
        assert_eq!(r.accept(addr(), &frames[0], now).unwrap(), None);
        assert_eq!(r.accept(addr(), &frames[0], now).unwrap(), None);
        assert_eq!(r.accept(addr(), &frames[1], now).unwrap(), None);
        assert_eq!(r.accept(addr(), &frames[2], now).unwrap(), None);
        assert_eq!(r.accept(addr(), &frames[3], now).unwrap(), Some(bytes));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn interleaved_senders_do_not_mix() {
        let a = message(PART_BYTES + 1);
        let b: Vec<u8> = a.iter().map(|x| x.wrapping_add(1)).collect();
        let other: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let fa = split(&a, 5).unwrap();
        let fb = split(&b, 5).unwrap();

        let mut r = Reassembler::new();
        let now = Instant::now();
        assert_eq!(r.accept(addr(), &fa[0], now).unwrap(), None);
        assert_eq!(r.accept(other, &fb[0], now).unwrap(), None);
        assert_eq!(r.accept(other, &fb[1], now).unwrap(), Some(b));
        assert_eq!(r.accept(addr(), &fa[1], now).unwrap(), Some(a));
    }

    #[test]
    fn incomplete_message_expires() {
        let frames = split(&message(PART_BYTES * 2), 9).unwrap();
        let mut r = Reassembler::new();
        let start = Instant::now();
        assert_eq!(r.accept(addr(), &frames[0], start).unwrap(), None);

        let later = start + REASSEMBLY_TIMEOUT + Duration::from_millis(1);
        assert_eq!(r.accept(addr(), &frames[1], later).unwrap(), None);
        assert_eq!(r.pending(), 1, "only the late part should be held");
    }

    #[test]
    fn oversized_message_is_refused() {
        let err = split(&vec![0u8; MAX_MESSAGE_BYTES + 1], 1).unwrap_err();
        assert_eq!(
            err,
            TransportError::TooLarge {
                size: MAX_MESSAGE_BYTES + 1,
                limit: MAX_MESSAGE_BYTES
            }
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let mut r = Reassembler::new();
        assert!(r.accept(addr(), &[], Instant::now()).is_err());
        assert!(r.accept(addr(), &[7, 1, 2], Instant::now()).is_err());
        assert!(r.accept(addr(), &[PART, 0, 0], Instant::now()).is_err());
    }
}

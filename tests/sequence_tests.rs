//! Sequence validation tests.
//!
//! Covers the acceptance rule over the interesting corners of the number
//! space and the stream behaviour of a source table fed with envelopes.

use std::time::Instant;

use fleet_rm::bus::envelope::{Channel, Envelope, PeerIdentity, Tag, SEQ_MAX};
use fleet_rm::bus::sequence::{is_valid_next, SourceTable, Verdict};

const GAP: u32 = 1_000;

fn envelope(sender: PeerIdentity, channel: Channel, seq: u32) -> Envelope {
    Envelope {
        sender,
        target: None,
        channel,
        tag: Tag::App(1),
        seq,
        payload: Vec::new(),
    }
}

#[test]
fn test_is_valid_next_grid() {
    let last_values = [None, Some(0), Some(SEQ_MAX - 1), Some(SEQ_MAX)];
    let incoming_values = [0, 1, SEQ_MAX - 1, SEQ_MAX, GAP];

    for last in last_values {
        for incoming in incoming_values {
            let expected = match last {
                None => true,
                Some(SEQ_MAX) => incoming == 0,
                Some(l) => incoming == l + 1,
            };
            assert_eq!(
                is_valid_next(last, incoming),
                expected,
                "last={:?} incoming={}",
                last,
                incoming
            );
        }
    }

    // Spot checks of the table above
    assert!(is_valid_next(Some(0), 1));
    assert!(is_valid_next(Some(SEQ_MAX - 1), SEQ_MAX));
    assert!(is_valid_next(Some(SEQ_MAX), 0));
    assert!(!is_valid_next(Some(SEQ_MAX), SEQ_MAX));
    assert!(!is_valid_next(Some(0), 0));
    assert!(!is_valid_next(Some(0), GAP));
}

#[test]
fn test_first_then_next_then_duplicate() {
    let mut table = SourceTable::new();
    let peer = PeerIdentity::new(1, 2);
    let now = Instant::now();

    assert_eq!(table.check(&envelope(peer, Channel::SystemControl, 0), now), Verdict::Accepted);
    assert_eq!(table.check(&envelope(peer, Channel::SystemControl, 1), now), Verdict::Accepted);
    assert_eq!(
        table.check(&envelope(peer, Channel::SystemControl, 1), now),
        Verdict::Stale { last_accepted: 1 }
    );
}

#[test]
fn test_streams_are_per_channel_and_per_sender() {
    let mut table = SourceTable::new();
    let a = PeerIdentity::new(1, 2);
    let b = PeerIdentity::new(1, 3);
    let now = Instant::now();

    assert_eq!(table.check(&envelope(a, Channel::SystemControl, 10), now), Verdict::Accepted);
    assert_eq!(table.check(&envelope(a, Channel::ErrorReport, 0), now), Verdict::Accepted);
    assert_eq!(table.check(&envelope(b, Channel::SystemControl, 10), now), Verdict::Accepted);
    assert_eq!(table.check(&envelope(a, Channel::SystemControl, 11), now), Verdict::Accepted);
    assert_eq!(
        table.check(&envelope(b, Channel::SystemControl, 10), now),
        Verdict::Stale { last_accepted: 10 }
    );
    assert_eq!(table.len(), 2);
}

#[test]
fn test_stream_wraps_at_max() {
    let mut table = SourceTable::new();
    let peer = PeerIdentity::new(1, 2);
    let now = Instant::now();

    assert_eq!(table.check(&envelope(peer, Channel::DataExchange, SEQ_MAX - 1), now), Verdict::Accepted);
    assert_eq!(table.check(&envelope(peer, Channel::DataExchange, SEQ_MAX), now), Verdict::Accepted);
    assert_eq!(table.check(&envelope(peer, Channel::DataExchange, 0), now), Verdict::Accepted);
    assert_eq!(table.check(&envelope(peer, Channel::DataExchange, 1), now), Verdict::Accepted);
}

#[test]
fn test_gap_is_dropped_and_resynchronised() {
    let mut table = SourceTable::new();
    let peer = PeerIdentity::new(1, 2);
    let now = Instant::now();

    assert_eq!(table.check(&envelope(peer, Channel::SystemControl, 0), now), Verdict::Accepted);
    assert_eq!(
        table.check(&envelope(peer, Channel::SystemControl, GAP), now),
        Verdict::Gap { last_accepted: 0 }
    );
    assert_eq!(
        table.check(&envelope(peer, Channel::SystemControl, GAP + 1), now),
        Verdict::Accepted
    );
}

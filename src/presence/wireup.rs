use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Outcome of the startup barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub reported: Vec<String>,
    /// Expected nodes whose daemon never announced.
    pub missing: Vec<String>,
    pub completed_at: Instant,
}

/// Debounced startup barrier: every daemon announce pushes the deadline out by
/// the full timeout; bootstrap completes once a timeout passes in silence.
#[derive(Debug, Clone)]
pub struct WireupBarrier {
    timeout: Duration,
    deadline: Instant,
    expected: BTreeSet<String>,
    reported: BTreeSet<String>,
    complete: bool,
}

impl WireupBarrier {
    pub fn new(timeout: Duration, expected: impl IntoIterator<Item = String>, now: Instant) -> Self {
        Self {
            timeout,
            deadline: now + timeout,
            expected: expected.into_iter().collect(),
            reported: BTreeSet::new(),
            complete: false,
        }
    }

    /// Count a daemon announce and re-arm the timer. Ignored after completion.
    pub fn on_announce(&mut self, node: &str, now: Instant) -> bool {
        if self.complete {
            return false;
        }
        self.reported.insert(node.to_string());
        self.deadline = now + self.timeout;
        tracing::debug!(node, reported = self.reported.len(), "Daemon reported during wireup");
        true
    }

    /// `None` once the barrier has fired.
    pub fn deadline(&self) -> Option<Instant> {
        (!self.complete).then_some(self.deadline)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }

    /// Fire the barrier if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<BootstrapReport> {
        if self.complete || now < self.deadline {
            return None;
        }
        self.complete = true;
        Some(BootstrapReport {
            reported: self.reported.iter().cloned().collect(),
            missing: self.expected.difference(&self.reported).cloned().collect(),
            completed_at: now,
        })
    }
}

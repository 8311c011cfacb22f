use super::Session;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How a forwarded request finished: the server answered, or the bounded
/// wait expired first. Expiry is terminal for the request; only handlers
/// with an explicit compensation rule (pause) retry.
pub enum Outcome {
    Response(Value),
    Timeout,
}

/// Continuation run when an outbound request resolves. Carries the rest of
/// the client-facing operation across the round trip, so nothing ever
/// blocks the event loop.
pub type Continuation = Box<dyn FnOnce(&mut Session, Outcome, Instant) -> anyhow::Result<()> + Send>;

struct Pending {
    deadline: Option<Instant>,
    continuation: Continuation,
}

/// Correlates outbound-to-server requests with their response or timeout.
///
/// Whichever of the two fires first removes the entry, so the loser finds
/// nothing and becomes a no-op.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<i64, Pending>,
}

impl PendingTable {
    pub fn register(
        &mut self,
        seq: i64,
        timeout: Option<Duration>,
        now: Instant,
        continuation: Continuation,
    ) {
        let deadline = timeout.map(|t| now + t);
        self.entries.insert(
            seq,
            Pending {
                deadline,
                continuation,
            },
        );
    }

    pub fn take(&mut self, seq: i64) -> Option<Continuation> {
        self.entries.remove(&seq).map(|pending| pending.continuation)
    }

    /// Earliest deadline among in-flight requests; the event pump sleeps
    /// until then.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|p| p.deadline).min()
    }

    pub fn take_expired(&mut self, now: Instant) -> Vec<(i64, Continuation)> {
        let due: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.deadline.is_some_and(|d| d <= now))
            .map(|(seq, _)| *seq)
            .collect();
        due.into_iter()
            .filter_map(|seq| self.take(seq).map(|continuation| (seq, continuation)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

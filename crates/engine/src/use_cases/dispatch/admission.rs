//! Per-key FIFO admission with a global in-flight budget.
//!
//! A job is admitted only when no other job with the same concurrency key
//! is in flight and the global budget has room. Within a key, jobs leave in
//! the order they arrived; a job sent back for retry goes to the front of
//! its key so later jobs on that key keep waiting behind it. Across keys the
//! oldest ready head is admitted first.

use std::collections::{HashMap, HashSet, VecDeque};

use nwnbridge_domain::ConcurrencyKey;
use tokio::time::Instant;

/// Proof of admission. Must be handed back through [`AdmissionQueue::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket {
    key: ConcurrencyKey,
    seq: u64,
}

#[derive(Debug)]
struct Waiting<J> {
    seq: u64,
    not_before: Option<Instant>,
    job: J,
}

#[derive(Debug)]
pub struct AdmissionQueue<J> {
    queues: HashMap<ConcurrencyKey, VecDeque<Waiting<J>>>,
    in_flight: HashSet<ConcurrencyKey>,
    max_in_flight: usize,
    next_seq: u64,
    pending: usize,
}

impl<J> AdmissionQueue<J> {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            queues: HashMap::new(),
            in_flight: HashSet::new(),
            max_in_flight: max_in_flight.max(1),
            next_seq: 0,
            pending: 0,
        }
    }

    /// Append a new job behind everything already queued on `key`.
    pub fn push(&mut self, key: ConcurrencyKey, job: J) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queues.entry(key).or_default().push_back(Waiting {
            seq,
            not_before: None,
            job,
        });
        self.pending += 1;
    }

    /// Admit the oldest ready job, if the budget and key locks allow one.
    pub fn pop_ready(&mut self, now: Instant) -> Option<(Ticket, J)> {
        if self.in_flight.len() >= self.max_in_flight {
            return None;
        }

        let key = self
            .queues
            .iter()
            .filter(|(key, _)| !self.in_flight.contains(*key))
            .filter_map(|(key, queue)| queue.front().map(|head| (key, head)))
            .filter(|(_, head)| head.not_before.map_or(true, |at| at <= now))
            .min_by_key(|(_, head)| head.seq)
            .map(|(key, _)| key.clone())?;

        let queue = self.queues.get_mut(&key)?;
        let waiting = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&key);
        }
        self.pending -= 1;
        self.in_flight.insert(key.clone());
        Some((
            Ticket {
                key,
                seq: waiting.seq,
            },
            waiting.job,
        ))
    }

    /// Free the key lock and budget slot held by `ticket`.
    pub fn release(&mut self, ticket: &Ticket) {
        self.in_flight.remove(&ticket.key);
    }

    /// Put a released job back at the head of its key, not admissible
    /// before `not_before`.
    pub fn requeue(&mut self, ticket: Ticket, job: J, not_before: Instant) {
        self.in_flight.remove(&ticket.key);
        self.queues.entry(ticket.key).or_default().push_front(Waiting {
            seq: ticket.seq,
            not_before: Some(not_before),
            job,
        });
        self.pending += 1;
    }

    /// Earliest time a backed-off head becomes admissible. `None` while the
    /// budget is exhausted, since a release must come first.
    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.in_flight.len() >= self.max_in_flight {
            return None;
        }
        self.queues
            .iter()
            .filter(|(key, _)| !self.in_flight.contains(*key))
            .filter_map(|(_, queue)| queue.front().and_then(|head| head.not_before))
            .min()
    }

    /// Jobs waiting for admission, including those backing off.
    pub fn pending_len(&self) -> usize {
        self.pending
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_key_in_flight(&self, key: &ConcurrencyKey) -> bool {
        self.in_flight.contains(key)
    }
}

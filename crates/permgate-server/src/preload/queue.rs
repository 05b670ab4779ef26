//! Capacity-bounded priority queue of preload requests.

use std::collections::BTreeMap;

use super::types::PreloadRequest;

/// Outcome of a push.
#[derive(Debug)]
pub(crate) enum PushOutcome {
    Accepted,
    /// Accepted by displacing the least urgent queued request.
    Evicted(PreloadRequest),
    /// Queue full of requests at least as urgent.
    Rejected(PreloadRequest),
}

/// Ordered by `(priority, sequence)`: lowest priority number first, FIFO
/// within a priority.
#[derive(Debug)]
pub(crate) struct PriorityQueue {
    entries: BTreeMap<(u8, u64), PreloadRequest>,
    next_seq: u64,
    capacity: usize,
}

impl PriorityQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn push(&mut self, request: PreloadRequest) -> PushOutcome {
        let evicted = if self.entries.len() >= self.capacity {
            match self.entries.keys().next_back().copied() {
                Some(worst) if worst.0 > request.priority => self.entries.remove(&worst),
                _ => return PushOutcome::Rejected(request),
            }
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((request.priority, seq), request);

        match evicted {
            Some(evicted) => PushOutcome::Evicted(evicted),
            None => PushOutcome::Accepted,
        }
    }

    pub(crate) fn pop(&mut self) -> Option<PreloadRequest> {
        self.entries.pop_first().map(|(_, request)| request)
    }
}

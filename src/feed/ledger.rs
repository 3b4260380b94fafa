//! In-order request ledger.
//!
//! Requests are appended in the order their ids are discovered and only leave
//! the ledger from the front, once finished. Downloads may complete in any
//! order; consumers still see payloads in feed order.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use bytes::Bytes;

use crate::feed::change_id::ChangeId;

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTimes {
    pub added: Option<Instant>,
    pub submitted: Option<Instant>,
    pub started: Option<Instant>,
    pub peeked: Option<Instant>,
}

#[derive(Debug)]
pub struct FeedRequest {
    /// Position in the ledger, unique and increasing.
    pub seq: u64,
    pub id: ChangeId,
    pub payload: Bytes,
    pub submitted_next: Option<ChangeId>,
    pub times: RequestTimes,
    pub finished: bool,
    pub skip_data: bool,
    /// Consecutive failed attempts for this id.
    pub failures: u32,
}

impl FeedRequest {
    fn new(seq: u64, id: ChangeId, skip_data: bool) -> Self {
        Self {
            seq,
            id,
            payload: Bytes::new(),
            submitted_next: None,
            times: RequestTimes {
                added: Some(Instant::now()),
                ..RequestTimes::default()
            },
            finished: false,
            skip_data,
            failures: 0,
        }
    }

    /// Drop any partial body so the same id can be fetched again.
    pub fn reset(&mut self) {
        self.payload = Bytes::new();
        self.times.started = None;
        self.times.submitted = None;
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    requests: VecDeque<FeedRequest>,
    ready: BTreeSet<u64>,
    next_seq: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request for `id` and mark it ready for dispatch.
    pub fn add(&mut self, id: ChangeId, skip_data: bool) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.requests.push_back(FeedRequest::new(seq, id, skip_data));
        self.ready.insert(seq);
        seq
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Take the ready request with the lowest ledger position.
    pub fn take_ready(&mut self) -> Option<&mut FeedRequest> {
        let seq = self.ready.pop_first()?;
        let request = self.get_mut(seq)?;
        request.times.submitted = Some(Instant::now());
        Some(request)
    }

    /// Put a failed request back into the ready set with an empty buffer.
    /// Returns how many times this request has failed so far.
    pub fn requeue(&mut self, seq: u64) -> u32 {
        let Some(request) = self.get_mut(seq) else {
            return 0;
        };
        request.reset();
        request.failures += 1;
        let failures = request.failures;
        self.ready.insert(seq);
        failures
    }

    pub fn get(&self, seq: u64) -> Option<&FeedRequest> {
        let idx = self.requests.binary_search_by_key(&seq, |r| r.seq).ok()?;
        self.requests.get(idx)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut FeedRequest> {
        let idx = self.requests.binary_search_by_key(&seq, |r| r.seq).ok()?;
        self.requests.get_mut(idx)
    }

    /// Remove the head request if it has finished.
    pub fn pop_finished(&mut self) -> Option<FeedRequest> {
        if self.requests.front().is_some_and(|r| r.finished) {
            self.requests.pop_front()
        } else {
            None
        }
    }

    /// Ids of every request still held, in ledger order.
    pub fn pending_ids(&self) -> Vec<ChangeId> {
        self.requests.iter().map(|r| r.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

//! Commit watermark of one partition
//!
//! Contexts of different entities settle out of order. Only the contiguous
//! prefix of settled offsets may be committed: the watermark is the smallest
//! offset that is still in flight, blocked or not yet fetched.

use std::collections::BTreeSet;

use crate::domain::record::Offset;

#[derive(Debug)]
pub struct OffsetTracker {
    committed:  Offset,
    next_fetch: Offset,
    in_flight:  BTreeSet<Offset>,
    /// Offsets that must never be committed by this round (fenced contexts)
    blocked:    BTreeSet<Offset>
}

impl OffsetTracker {
    pub fn new(committed: Offset) -> Self {
        Self { committed, next_fetch: committed, in_flight: BTreeSet::new(), blocked: BTreeSet::new() }
    }

    pub fn dispatched(&mut self, offset: Offset) {
        self.in_flight.insert(offset);
        self.next_fetch = self.next_fetch.max(offset + 1);
    }

    pub fn complete(&mut self, offset: Offset) {
        self.in_flight.remove(&offset);
    }

    pub fn block(&mut self, offset: Offset) {
        if self.in_flight.remove(&offset) {
            self.blocked.insert(offset);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn committed(&self) -> Offset {
        self.committed
    }

    pub fn watermark(&self) -> Offset {
        [self.in_flight.first(), self.blocked.first(), Some(&self.next_fetch)]
            .into_iter()
            .flatten()
            .copied()
            .min()
            .unwrap_or(self.next_fetch)
    }

    /// Offset to commit, if the watermark moved past the last commit
    pub fn pending_commit(&self) -> Option<Offset> {
        let watermark = self.watermark();
        (watermark > self.committed).then_some(watermark)
    }

    pub fn mark_committed(&mut self, offset: Offset) {
        self.committed = self.committed.max(offset);
    }
}

//! Per-cycle transaction state.
//!
//! A transaction snapshots the worker's step crowds, accumulates proposed
//! moves, and keeps the queue offsets observed during the cycle. The worker
//! installs the working crowds and emits one notify per change on commit.

use crate::bitmap::{acquire_bm, release_bm};
use crate::meta::UserEvent;
use roaring::RoaringBitmap;
use std::collections::HashMap;

/// One proposed move: `who` leaves step `from` for step `to`.
/// `to = None` is a terminal exit.
pub(crate) struct StepChange {
    pub from: usize,
    pub to: Option<usize>,
    pub who: RoaringBitmap,
    /// Cycle TTL of the target step, 0 if none.
    pub ttl: u32,
}

pub(crate) struct Transaction {
    /// Working copies of the step crowds; mutated as changes are recorded.
    pub step_crowds: Vec<RoaringBitmap>,
    pub changes: Vec<StepChange>,
    buffered: Vec<UserEvent>,
    /// Users already moved this cycle. At most one change per user.
    moved: RoaringBitmap,
    /// Highest observed offset per input partition.
    pub offsets: HashMap<u32, u64>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            step_crowds: Vec::new(),
            changes: Vec::new(),
            buffered: Vec::new(),
            moved: RoaringBitmap::new(),
            offsets: HashMap::new(),
        }
    }

    /// Begin a cycle over a snapshot of the live crowds.
    pub fn start(&mut self, crowds: &[RoaringBitmap]) {
        debug_assert!(self.step_crowds.is_empty(), "BUG: transaction not reset");
        for crowd in crowds {
            let mut copy = acquire_bm();
            copy.clone_from(crowd);
            self.step_crowds.push(copy);
        }
    }

    pub fn buffer_user_event(&mut self, event: UserEvent) {
        self.buffered.push(event);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn take_buffered(&mut self) -> Vec<UserEvent> {
        std::mem::take(&mut self.buffered)
    }

    pub fn record_offset(&mut self, partition: u32, offset: u64) {
        let slot = self.offsets.entry(partition).or_insert(0);
        if offset > *slot {
            *slot = offset;
        }
    }

    pub fn moved_contains(&self, user_id: u32) -> bool {
        self.moved.contains(user_id)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Apply a move to the working crowds and record it. Changes with the
    /// same endpoints merge into one.
    pub fn record_change(&mut self, from: usize, to: Option<usize>, who: RoaringBitmap, ttl: u32) {
        if who.is_empty() {
            release_bm(who);
            return;
        }

        self.step_crowds[from] -= &who;
        if let Some(to) = to {
            self.step_crowds[to] |= &who;
        }
        self.moved |= &who;

        if let Some(change) = self
            .changes
            .iter_mut()
            .find(|c| c.from == from && c.to == to)
        {
            change.who |= &who;
            release_bm(who);
        } else {
            self.changes.push(StepChange { from, to, who, ttl });
        }
    }

    /// Drop all cycle state and return the bitmaps to the pool.
    pub fn reset(&mut self) {
        for crowd in self.step_crowds.drain(..) {
            release_bm(crowd);
        }
        for change in self.changes.drain(..) {
            release_bm(change.who);
        }
        self.buffered.clear();
        self.moved.clear();
        self.offsets.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.reset();
    }
}

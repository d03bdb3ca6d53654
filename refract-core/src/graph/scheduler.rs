//! Update Scheduler
//!
//! The scheduler batches writes into ticks and hands each flush a
//! deduplicated set of affected subscribers.
//!
//! # State Machine
//!
//! ```text
//! Idle --write--> Batching --flush--> Flushing --done--> Idle
//!                     ^                   |
//!                     +--write in flush---+ (queued for the next round)
//! ```
//!
//! The scheduler itself only keeps the bookkeeping. The flush loop that
//! settles derived values and runs effects lives in the runtime, which is
//! the only place that may call back into user code.

use indexmap::IndexSet;

use super::node::NodeId;
use crate::error::ReactiveError;

/// Current phase of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No pending writes and no open batch.
    Idle,
    /// Writes are being collected, either inside `batch` or waiting for a
    /// flush.
    Batching,
    /// A flush is running.
    Flushing,
}

/// Batching and deduplication state for one runtime.
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Subscribers affected since the last round, in notification order.
    pending: IndexSet<NodeId>,

    /// Depth of nested `batch` calls.
    batch_depth: usize,

    /// Whether a flush is currently running.
    flushing: bool,

    /// Rounds taken so far, across all flushes.
    rounds: u64,
}

impl Scheduler {
    /// Create an idle scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The phase the scheduler is in.
    pub fn phase(&self) -> Phase {
        if self.flushing {
            Phase::Flushing
        } else if self.batch_depth > 0 || !self.pending.is_empty() {
            Phase::Batching
        } else {
            Phase::Idle
        }
    }

    /// Queue subscribers for the next round. Already queued subscribers keep
    /// their position.
    pub fn enqueue<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        self.pending.extend(ids);
    }

    /// Drop a subscriber from the queue (it was torn down).
    pub fn remove(&mut self, id: NodeId) {
        self.pending.shift_remove(&id);
    }

    /// Whether any subscriber is queued.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of queued subscribers.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open a batch.
    pub fn enter_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Close a batch. Returns true when the outermost batch was closed.
    pub fn exit_batch(&mut self) -> bool {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        self.batch_depth == 0
    }

    /// Depth of nested batches.
    pub fn batch_depth(&self) -> usize {
        self.batch_depth
    }

    /// Start a flush. Returns false if one is already running.
    pub fn begin_flush(&mut self) -> bool {
        if self.flushing {
            return false;
        }
        self.flushing = true;
        true
    }

    /// Mark the running flush as finished.
    pub fn end_flush(&mut self) {
        self.flushing = false;
    }

    /// Whether a flush is running.
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Take everything queued so far as the next round. Writes made while
    /// the round runs are queued for the round after.
    pub fn take_round(&mut self) -> Vec<NodeId> {
        if !self.pending.is_empty() {
            self.rounds += 1;
        }
        self.pending.drain(..).collect()
    }

    /// Identifies the round being flushed, or `None` outside a flush.
    pub fn current_round(&self) -> Option<u64> {
        self.flushing.then_some(self.rounds)
    }

    /// Forget all queued work.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// True when a write should trigger a flush right away: nothing is
    /// batching or flushing and there is work queued.
    pub fn should_flush(&self) -> bool {
        !self.flushing && self.batch_depth == 0 && !self.pending.is_empty()
    }

    /// Return to the initial state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.batch_depth = 0;
        self.flushing = false;
    }
}

/// Summary of one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Number of rounds the flush needed (writes during a flush add rounds).
    pub rounds: usize,
    /// Derived computations that recomputed.
    pub derived_settled: usize,
    /// Effects whose body ran.
    pub effects_run: usize,
    /// Subscriber failures collected (and reported) during the flush.
    pub errors: Vec<ReactiveError>,
}

impl FlushReport {
    /// True when nothing ran.
    pub fn is_empty(&self) -> bool {
        self.rounds == 0
    }
}

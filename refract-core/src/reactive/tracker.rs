//! Dependency Tracker
//!
//! The tracker correlates reads with the computation currently running.
//! When a cell or derived value is read, it is recorded in the topmost
//! frame of the tracker stack.
//!
//! # Implementation
//!
//! An explicit stack of frames. Running a tracked computation pushes a frame
//! holding an empty dependency set; `untracked` pushes a null frame that
//! swallows reads. Nested computations push their own frames, so a read only
//! ever lands in the innermost one.
//!
//! Each read is recorded with the version of the node at the time of its
//! first read in the frame. A computation that writes something it already
//! read therefore sees that write as a change.
//!
//! Frames are popped by [`FrameGuard`]'s `Drop`, so a computation that panics
//! still leaves the stack exactly as it found it. A leaked frame would make
//! every later read in the session land in the wrong place.

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::graph::NodeId;

/// Result of a tracked evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked<R> {
    /// What the evaluated function returned.
    pub result: R,
    /// Nodes read during the evaluation, in first-read order.
    pub dependencies: Vec<NodeId>,
}

/// An entry in the tracker stack.
#[derive(Debug, Default)]
struct Frame {
    /// The computation this frame belongs to, if any.
    owner: Option<NodeId>,
    /// Nodes read while this frame was on top, with the version seen first.
    dependencies: IndexMap<NodeId, u64>,
}

/// The tracker stack. `None` entries are untracked frames.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    frames: Vec<Option<Frame>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Push a recording frame and return its index.
    fn push(&mut self, owner: Option<NodeId>) -> usize {
        self.frames.push(Some(Frame {
            owner,
            dependencies: IndexMap::new(),
        }));
        self.frames.len() - 1
    }

    /// Push a frame that ignores reads and return its index.
    fn push_untracked(&mut self) -> usize {
        self.frames.push(None);
        self.frames.len() - 1
    }

    /// Pop the frame at `index` together with anything left above it.
    fn pop_to(&mut self, index: usize) -> Option<Frame> {
        if index >= self.frames.len() {
            return None;
        }
        self.frames.truncate(index + 1);
        self.frames.pop().flatten()
    }

    /// Record a read of `node` at `version` in the topmost frame.
    ///
    /// Returns the frame's owner when this is the first read of `node` in
    /// the frame, so the caller can subscribe the owner right away.
    pub(crate) fn track(&mut self, node: NodeId, version: u64) -> Option<NodeId> {
        let Some(Some(frame)) = self.frames.last_mut() else {
            return None;
        };
        // A computation never depends on itself through the tracker; self
        // reads are caught by cycle detection instead.
        if frame.owner == Some(node) || frame.dependencies.contains_key(&node) {
            return None;
        }
        frame.dependencies.insert(node, version);
        frame.owner
    }

    /// True if reads are currently being recorded.
    pub(crate) fn is_tracking(&self) -> bool {
        matches!(self.frames.last(), Some(Some(_)))
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The computations between `node`'s frame and the top of the stack,
    /// outermost first. Used to describe a cycle that re-enters `node`.
    pub(crate) fn cycle_members(&self, node: NodeId) -> Vec<NodeId> {
        let owners: Vec<NodeId> = self
            .frames
            .iter()
            .filter_map(|frame| frame.as_ref().and_then(|f| f.owner))
            .collect();
        match owners.iter().rposition(|owner| *owner == node) {
            Some(start) => owners[start..].to_vec(),
            None => vec![node],
        }
    }
}

/// Scoped frame: pops itself on drop, including during unwinding.
pub(crate) struct FrameGuard<'a> {
    tracker: &'a Mutex<Tracker>,
    index: usize,
    finished: bool,
}

impl<'a> FrameGuard<'a> {
    /// Push a recording frame owned by `owner`.
    pub(crate) fn enter(tracker: &'a Mutex<Tracker>, owner: Option<NodeId>) -> Self {
        let index = tracker.lock().push(owner);
        Self {
            tracker,
            index,
            finished: false,
        }
    }

    /// Push an untracked frame.
    pub(crate) fn enter_untracked(tracker: &'a Mutex<Tracker>) -> Self {
        let index = tracker.lock().push_untracked();
        Self {
            tracker,
            index,
            finished: false,
        }
    }

    /// Pop the frame and return the reads it collected, with the versions
    /// they were read at.
    pub(crate) fn finish(mut self) -> Vec<(NodeId, u64)> {
        self.finished = true;
        self.tracker
            .lock()
            .pop_to(self.index)
            .map(|frame| frame.dependencies.into_iter().collect())
            .unwrap_or_default()
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.lock().pop_to(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn frame_records_reads_in_order_without_duplicates() {
        let tracker = Mutex::new(Tracker::new());
        let (a, b) = (NodeId::new(), NodeId::new());

        let guard = FrameGuard::enter(&tracker, None);
        assert!(tracker.lock().is_tracking());
        tracker.lock().track(b, 0);
        tracker.lock().track(a, 3);
        tracker.lock().track(b, 1);

        // The first read of `b` decides the version it was observed at.
        assert_eq!(guard.finish(), vec![(b, 0), (a, 3)]);
        assert_eq!(tracker.lock().depth(), 0);
    }

    #[test]
    fn nested_frames_only_see_their_own_reads() {
        let tracker = Mutex::new(Tracker::new());
        let (outer_read, inner_read) = (NodeId::new(), NodeId::new());

        let outer = FrameGuard::enter(&tracker, None);
        tracker.lock().track(outer_read, 0);
        {
            let inner = FrameGuard::enter(&tracker, None);
            tracker.lock().track(inner_read, 0);
            assert_eq!(inner.finish(), vec![(inner_read, 0)]);
        }
        assert_eq!(outer.finish(), vec![(outer_read, 0)]);
    }

    #[test]
    fn untracked_frame_swallows_reads() {
        let tracker = Mutex::new(Tracker::new());
        let read = NodeId::new();

        let outer = FrameGuard::enter(&tracker, None);
        {
            let _untracked = FrameGuard::enter_untracked(&tracker);
            assert!(!tracker.lock().is_tracking());
            assert_eq!(tracker.lock().track(read, 0), None);
        }
        assert!(tracker.lock().is_tracking());
        assert!(outer.finish().is_empty());
    }

    #[test]
    fn guard_pops_frame_when_computation_panics() {
        let tracker = Mutex::new(Tracker::new());

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = FrameGuard::enter(&tracker, None);
            panic!("compute failed");
        }));

        assert!(result.is_err());
        assert_eq!(tracker.lock().depth(), 0);
    }

    #[test]
    fn cycle_members_start_at_the_reentered_owner() {
        let tracker = Mutex::new(Tracker::new());
        let (root, a, b) = (NodeId::new(), NodeId::new(), NodeId::new());

        let _g0 = FrameGuard::enter(&tracker, Some(root));
        let _g1 = FrameGuard::enter(&tracker, Some(a));
        let _g2 = FrameGuard::enter_untracked(&tracker);
        let _g3 = FrameGuard::enter(&tracker, Some(b));

        assert_eq!(tracker.lock().cycle_members(a), vec![a, b]);
    }

    #[test]
    fn owner_never_records_itself() {
        let tracker = Mutex::new(Tracker::new());
        let owner = NodeId::new();

        let guard = FrameGuard::enter(&tracker, Some(owner));
        assert_eq!(tracker.lock().track(owner, 0), None);
        assert!(guard.finish().is_empty());
    }

    #[test]
    fn first_read_reports_the_owner_to_subscribe() {
        let tracker = Mutex::new(Tracker::new());
        let (owner, read) = (NodeId::new(), NodeId::new());

        let guard = FrameGuard::enter(&tracker, Some(owner));
        assert_eq!(tracker.lock().track(read, 2), Some(owner));
        assert_eq!(tracker.lock().track(read, 3), None);
        assert_eq!(guard.finish(), vec![(read, 2)]);
    }
}

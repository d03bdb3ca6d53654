//! Cell Implementation
//!
//! A Cell is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Cells Work
//!
//! 1. When a cell is read within a tracked evaluation (derived/effect), the
//!    read is recorded in the tracker's topmost frame. After the evaluation
//!    the runtime subscribes the computation to the cell.
//!
//! 2. When a cell's value changes, all subscribers are marked dirty and
//!    queued in the scheduler.
//!
//! 3. The scheduler re-runs them once per flush.
//!
//! # Equality
//!
//! A write that is equal to the current value under the cell's
//! [`Equality`] is dropped: no version bump, no notification. The default
//! is `PartialEq`.
//!
//! # Memory Layout
//!
//! Each cell consists of:
//! - A unique ID (8 bytes)
//! - The value (behind an `RwLock`, shared by every clone of the handle)
//! - A version counter
//! - Its subscriber set, which lives in the runtime's graph

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::runtime::{Reactive, RuntimeInner};
use super::subscriber::Subscriber;
use crate::error::Result;
use crate::graph::{Node, NodeId, NodeKind};

/// Anything that can be named as a dependency: cells and derived values.
pub trait Source {
    /// The graph node backing this value.
    fn node_id(&self) -> NodeId;
}

/// Equality policy deciding whether a write (or a recomputed derived value)
/// counts as a change.
pub struct Equality<T> {
    eq: Option<Arc<dyn Fn(&T, &T) -> bool + Send + Sync>>,
}

impl<T> Equality<T> {
    /// Compare with `PartialEq`.
    pub fn partial_eq() -> Self
    where
        T: PartialEq + 'static,
    {
        Self {
            eq: Some(Arc::new(|a: &T, b: &T| a == b)),
        }
    }

    /// Treat every write as a change.
    pub fn never() -> Self {
        Self { eq: None }
    }

    /// Compare with a custom function.
    pub fn custom<F>(eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            eq: Some(Arc::new(eq)),
        }
    }

    pub(crate) fn is_equal(&self, current: &T, next: &T) -> bool {
        self.eq.as_ref().is_some_and(|eq| eq(current, next))
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self {
            eq: self.eq.clone(),
        }
    }
}

impl<T> Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.eq {
            Some(_) => f.write_str("Equality::Compare"),
            None => f.write_str("Equality::Never"),
        }
    }
}

/// Options for [`Scope::cell_with`](crate::Scope::cell_with).
#[derive(Debug, Clone)]
pub struct CellOptions<T> {
    equality: Equality<T>,
}

impl<T: PartialEq + 'static> Default for CellOptions<T> {
    fn default() -> Self {
        Self {
            equality: Equality::partial_eq(),
        }
    }
}

impl<T> CellOptions<T> {
    /// Options with the given equality policy.
    pub fn with_equality(equality: Equality<T>) -> Self {
        Self { equality }
    }

    /// Every write notifies, even if the value is unchanged.
    pub fn always_notify() -> Self {
        Self::with_equality(Equality::never())
    }

    /// Writes are suppressed when `eq(current, new)` holds.
    pub fn equals<F>(eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::with_equality(Equality::custom(eq))
    }
}

struct CellInner<T> {
    /// Unique identifier for this cell.
    id: NodeId,

    /// The runtime this cell reports reads and writes to.
    runtime: Weak<RuntimeInner>,

    /// The current value.
    value: RwLock<T>,

    /// Change detection for writes.
    equality: Equality<T>,

    /// Bumped on every write that was not suppressed.
    version: AtomicU64,

    /// Cleared when the owning scope is torn down.
    alive: AtomicBool,
}

/// A reactive cell holding a value of type T.
///
/// Cloning a `Cell` creates a new handle to the **same** value.
///
/// # Example
///
/// ```rust
/// use refract_core::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.cell(0);
///
/// count.write(5);
/// assert_eq!(count.read(), 5);
/// ```
pub struct Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Allocate a cell and register it with the runtime, if it is alive.
    pub(crate) fn create(runtime: Weak<RuntimeInner>, value: T, options: CellOptions<T>) -> Self {
        let id = NodeId::new();
        let inner = Arc::new(CellInner {
            id,
            runtime,
            value: RwLock::new(value),
            equality: options.equality,
            version: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        });

        if let Some(rt) = inner.runtime.upgrade() {
            let reactive: Arc<dyn Reactive> = inner.clone();
            rt.graph
                .lock()
                .add_node(Node::with_id(id, NodeKind::Source).with_reactive(Arc::downgrade(&reactive)));
        }

        Self { inner }
    }

    pub(crate) fn as_reactive(&self) -> Arc<dyn Reactive> {
        self.inner.clone()
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a tracked evaluation, this also records the cell as
    /// a dependency of that evaluation.
    pub fn read(&self) -> T {
        self.track();
        self.inner.value.read().clone()
    }

    /// Get the current value without tracking dependencies.
    pub fn read_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value (tracked, like [`read`](Self::read)).
    ///
    /// The value stays read-locked while `f` runs, so `f` must not write
    /// this cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.inner.value.read())
    }

    fn track(&self) {
        if !self.inner.alive.load(Ordering::SeqCst) {
            return;
        }
        if let Some(rt) = self.inner.runtime.upgrade() {
            rt.track(self.inner.id, self.version());
        }
    }

    /// Set a new value and notify subscribers.
    ///
    /// # Panics
    ///
    /// Panics with a [`ReactiveError`](crate::ReactiveError) payload if the
    /// flush triggered by this write is aborted by the re-entrancy limit.
    /// Use [`try_write`](Self::try_write) to get the error back instead.
    pub fn write(&self, value: T) {
        if let Err(error) = self.try_write(value) {
            std::panic::panic_any(error);
        }
    }

    /// Set a new value and notify subscribers, returning fatal scheduler
    /// errors instead of panicking.
    ///
    /// A write equal to the current value is a no-op. Outside a batch or
    /// flush the write flushes before returning (in automatic flush mode).
    pub fn try_write(&self, value: T) -> Result<()> {
        if !self.inner.alive.load(Ordering::SeqCst) {
            warn!(cell = %self.inner.id, "write to a disposed cell ignored");
            return Ok(());
        }

        {
            let mut guard = self.inner.value.write();
            if self.inner.equality.is_equal(&guard, &value) {
                trace!(cell = %self.inner.id, "equal write suppressed");
                return Ok(());
            }
            *guard = value;
        }

        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(cell = %self.inner.id, version, "cell written");

        match self.inner.runtime.upgrade() {
            Some(rt) => rt.notify(self.inner.id),
            None => Ok(()),
        }
    }

    /// Update the value using a function of the current one.
    ///
    /// # Panics
    ///
    /// Same as [`write`](Self::write).
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = {
            let guard = self.inner.value.read();
            f(&guard)
        };
        self.write(new_value);
    }

    /// Number of successful writes so far.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Register a subscriber with this cell. Subscribing twice is a no-op,
    /// and dead subscribers are ignored.
    ///
    /// Track-all subscribers replace their dependency set on every run, so
    /// a manual subscription only lasts until their next run.
    pub fn subscribe(&self, subscriber: &Subscriber) {
        if !subscriber.is_alive() || !self.inner.alive.load(Ordering::SeqCst) {
            return;
        }
        if let Some(rt) = self.inner.runtime.upgrade() {
            rt.graph
                .lock()
                .add_edge(self.inner.id, subscriber.id(), self.version());
        }
    }

    /// Remove a subscriber. Unsubscribing twice is a no-op.
    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        if let Some(rt) = self.inner.runtime.upgrade() {
            rt.graph.lock().remove_edge(self.inner.id, subscriber.id());
        }
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        let Some(rt) = self.inner.runtime.upgrade() else {
            return 0;
        };
        let dependents = rt.graph.lock().dependents(self.inner.id);
        dependents.len()
    }

    /// Tear the cell down: every subscription referencing it is released and
    /// later writes are ignored. Reads keep returning the last value.
    pub fn dispose(&self) {
        let rt = self.inner.runtime.upgrade();
        self.inner.dispose(rt.as_deref());
    }

    /// Whether the cell was torn down.
    pub fn is_disposed(&self) -> bool {
        !self.inner.alive.load(Ordering::SeqCst)
    }
}

impl<T> Reactive for CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn is_eager(&self) -> bool {
        false
    }

    fn update(&self, _rt: &RuntimeInner) -> Result<bool> {
        Ok(false)
    }

    fn dispose(&self, rt: Option<&RuntimeInner>) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(rt) = rt {
            rt.graph.lock().remove_node(self.id);
        }
    }

    fn is_disposed(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }
}

impl<T> Source for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.inner.id
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &self.read_untracked())
            .field("version", &self.version())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn cell_read_and_write() {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        assert_eq!(cell.read(), 0);

        cell.write(42);
        assert_eq!(cell.read(), 42);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn cell_update() {
        let rt = Runtime::new();
        let cell = rt.cell(10);
        cell.update(|v| v + 5);
        assert_eq!(cell.read(), 15);
    }

    #[test]
    fn equal_writes_are_suppressed() {
        let rt = Runtime::new();
        let cell = rt.cell(7);

        cell.write(7);
        assert_eq!(cell.version(), 0);

        cell.write(8);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn always_notify_bumps_version_on_equal_writes() {
        let rt = Runtime::new();
        let cell = rt.cell_with(7, CellOptions::always_notify());

        cell.write(7);
        cell.write(7);
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn custom_equality_decides_what_counts_as_change() {
        let rt = Runtime::new();
        // Compare case-insensitively.
        let cell = rt.cell_with(
            String::from("Hello"),
            CellOptions::equals(|a: &String, b: &String| a.eq_ignore_ascii_case(b)),
        );

        cell.write("HELLO".into());
        assert_eq!(cell.read(), "Hello");

        cell.write("World".into());
        assert_eq!(cell.read(), "World");
    }

    #[test]
    fn cell_clone_shares_state() {
        let rt = Runtime::new();
        let cell1 = rt.cell(0);
        let cell2 = cell1.clone();

        cell1.write(42);
        assert_eq!(cell2.read(), 42);

        cell2.write(100);
        assert_eq!(cell1.read(), 100);
        assert_eq!(cell1.id(), cell2.id());
    }

    #[test]
    fn cell_ids_are_unique() {
        let rt = Runtime::new();
        let c1 = rt.cell(0);
        let c2 = rt.cell(0);
        assert_ne!(c1.id(), c2.id());
    }

    #[test]
    fn subscribe_and_unsubscribe_are_idempotent() {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let effect = rt.effect_with_deps([], move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        cell.subscribe(&effect.subscriber());
        cell.subscribe(&effect.subscriber());
        assert_eq!(cell.subscriber_count(), 1);

        cell.write(1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        cell.unsubscribe(&effect.subscriber());
        cell.unsubscribe(&effect.subscriber());
        assert_eq!(cell.subscriber_count(), 0);

        cell.write(2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disposed_cell_ignores_writes() {
        let rt = Runtime::new();
        let cell = rt.cell(1);
        cell.dispose();

        cell.write(2);
        assert!(cell.is_disposed());
        assert_eq!(cell.read(), 1);
        assert_eq!(cell.version(), 0);
    }
}

//! Ownership scopes.
//!
//! Every node belongs to exactly one scope. Disposing a scope disposes what
//! it owns in reverse creation order: effects run their final cleanup,
//! subscriptions are released, and derived values stop tracking. A node
//! created while an effect body runs belongs to that effect and is disposed
//! before the effect's next run.
//!
//! A scope also disposes itself when its last handle drops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::cell::{Cell, CellOptions};
use super::derived::{Derived, DerivedOptions};
use super::effect::{Effect, EffectOutput};
use super::runtime::{Reactive, RuntimeInner};

/// Entries are pruned once the list reaches this length.
const PRUNE_THRESHOLD: usize = 32;

enum Owned {
    Node(Arc<dyn Reactive>),
    Scope(Scope),
}

impl Owned {
    fn is_live(&self) -> bool {
        match self {
            Owned::Node(node) => !node.is_disposed(),
            Owned::Scope(scope) => !scope.is_disposed(),
        }
    }
}

/// What a scope owns, in creation order. Entries disposed on their own are
/// dropped when the list grows past twice its live size.
#[derive(Default)]
struct OwnedList {
    entries: Vec<Owned>,
    prune_at: usize,
}

impl OwnedList {
    /// Append `entry`. Returns the disposed entries pruned along the way,
    /// for the caller to drop outside the lock.
    #[must_use]
    fn push(&mut self, entry: Owned) -> Vec<Owned> {
        self.entries.push(entry);
        if self.entries.len() < self.prune_at.max(PRUNE_THRESHOLD) {
            return Vec::new();
        }
        let (live, pruned): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(Owned::is_live);
        self.entries = live;
        self.prune_at = self.entries.len() * 2;
        pruned
    }

    fn live(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_live()).count()
    }
}

struct ScopeInner {
    runtime: Weak<RuntimeInner>,
    owned: Mutex<OwnedList>,
    disposed: AtomicBool,
}

/// A group of nodes torn down together.
///
/// # Example
///
/// ```rust
/// use refract_core::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.cell(0);
///
/// let scope = rt.create_scope();
/// let count_clone = count.clone();
/// let effect = scope.effect(move || {
///     count_clone.read();
/// });
///
/// scope.dispose();
/// assert!(effect.is_disposed());
/// assert_eq!(count.subscriber_count(), 0);
/// ```
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub(crate) fn detached(runtime: Weak<RuntimeInner>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                runtime,
                owned: Mutex::new(OwnedList::default()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Take ownership of `node`. A disposed scope disposes it right away.
    fn adopt(&self, node: Arc<dyn Reactive>) -> bool {
        if self.is_disposed() {
            warn!(node = %node.node_id(), "node created in a disposed scope");
            node.dispose(self.inner.runtime.upgrade().as_deref());
            return false;
        }
        // Pruned nodes may hold the last handle to anything, including
        // this scope's runtime, so they are dropped after the lock.
        let pruned = self.inner.owned.lock().push(Owned::Node(node));
        drop(pruned);
        true
    }

    /// Create a cell owned by this scope.
    pub fn cell<T>(&self, value: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.cell_with(value, CellOptions::default())
    }

    /// Create a cell with a custom equality policy.
    pub fn cell_with<T>(&self, value: T, options: CellOptions<T>) -> Cell<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let cell = Cell::create(self.inner.runtime.clone(), value, options);
        self.adopt(cell.as_reactive());
        cell
    }

    /// Create a derived computation owned by this scope.
    pub fn derived<T, F>(&self, compute: F) -> Derived<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.derived_with(compute, DerivedOptions::default())
    }

    /// Create a derived computation with explicit options. An eager derived
    /// computes immediately.
    pub fn derived_with<T, F>(&self, compute: F, options: DerivedOptions<T>) -> Derived<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let derived = Derived::create(self.inner.runtime.clone(), compute, options);
        if self.adopt(derived.as_reactive()) {
            derived.prime();
        }
        derived
    }

    /// Create a tracking effect owned by this scope. It runs immediately.
    ///
    /// # Panics
    ///
    /// Panics with a [`ReactiveError`](crate::ReactiveError) payload if the
    /// flush following the first run hits the re-entrancy limit.
    pub fn effect<F, O>(&self, body: F) -> Effect
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: EffectOutput,
    {
        let effect = Effect::tracked(self.inner.runtime.clone(), body);
        if self.adopt(effect.as_reactive()) {
            effect.start();
        }
        effect
    }

    /// Create an effect with explicit dependencies owned by this scope.
    ///
    /// # Panics
    ///
    /// Same as [`effect`](Self::effect).
    pub fn effect_with_deps<I, F, O>(&self, dependencies: I, body: F) -> Effect
    where
        I: IntoIterator<Item = crate::graph::NodeId>,
        F: Fn() -> O + Send + Sync + 'static,
        O: EffectOutput,
    {
        let effect = Effect::explicit(self.inner.runtime.clone(), dependencies.into_iter().collect(), body);
        if self.adopt(effect.as_reactive()) {
            effect.start();
        }
        effect
    }

    /// Create a scope owned by this one. It is disposed together with its
    /// parent, or earlier on its own.
    pub fn child(&self) -> Scope {
        let child = Scope::detached(self.inner.runtime.clone());
        if self.is_disposed() {
            child.inner.disposed.store(true, Ordering::SeqCst);
        } else {
            let pruned = self.inner.owned.lock().push(Owned::Scope(child.clone()));
            drop(pruned);
        }
        child
    }

    /// Dispose everything this scope owns. Later creations through a
    /// disposed scope are disposed immediately.
    pub fn dispose(&self) {
        let rt = self.inner.runtime.upgrade();
        self.dispose_in(rt.as_deref());
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Number of live nodes and child scopes owned.
    pub fn len(&self) -> usize {
        self.inner.owned.lock().live()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn dispose_in(&self, rt: Option<&RuntimeInner>) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.clear_in(rt);
    }

    /// Dispose everything owned but keep the scope usable.
    pub(crate) fn clear_in(&self, rt: Option<&RuntimeInner>) {
        self.inner.clear_in(rt);
    }
}

impl ScopeInner {
    fn clear_in(&self, rt: Option<&RuntimeInner>) {
        // Taken out first: disposal runs user cleanups, which may create
        // nodes in this scope again.
        let owned = std::mem::take(&mut self.owned.lock().entries);
        if owned.is_empty() {
            return;
        }
        debug!(count = owned.len(), "disposing scope contents");
        for entry in owned.into_iter().rev() {
            match entry {
                Owned::Node(node) => {
                    trace!(node = %node.node_id(), kind = ?node.kind(), "dispose");
                    node.dispose(rt);
                }
                Owned::Scope(scope) => scope.dispose_in(rt),
            }
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            let rt = self.runtime.upgrade();
            self.clear_in(rt.as_deref());
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("len", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

//! Derived Implementation
//!
//! A Derived is a cached value computed from other reactive values. It
//! re-evaluates only when its dependencies change.
//!
//! # How Derived Values Work
//!
//! 1. On first read, the computation runs inside a tracking frame and the
//!    result is cached. The values it read become its dependencies.
//!
//! 2. When read again and nothing changed, the cached value is returned.
//!
//! 3. When a dependency changes, the derived is marked dirty (direct) or
//!    maybe-dirty (behind another derived).
//!
//! 4. On the next read, a maybe-dirty derived first settles its own
//!    dependencies and compares their versions with the ones it saw last
//!    time. Only if one differs does it recompute.
//!
//! 5. If the recomputed value equals the cached one under the equality
//!    policy, the derived's version stays the same and nothing downstream
//!    re-runs.
//!
//! # Lazy and Eager
//!
//! A lazy derived (the default) that nobody observes stays dirty until it is
//! read. An eager one is also settled during the flush after every change,
//! which keeps it subscribed even without dependents.
//!
//! # Cycles
//!
//! A derived that ends up reading itself, directly or through other derived
//! values, fails with [`ReactiveError::CyclicDependency`] instead of
//! recursing.
//!
//! # Failures
//!
//! A computation that panics leaves the derived dirty, still subscribed to
//! whatever it read before failing, and still observed by its readers. The
//! next change retries it. Within one flush round a failed derived is
//! computed once; later reads in that round get the same error back.

use std::fmt::{self, Debug};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::cell::{Equality, Source};
use super::runtime::{Reactive, RuntimeInner};
use super::subscriber::{Subscriber, SubscriberKind};
use crate::config::DerivedPolicy;
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyState, Node, NodeId, NodeKind};

/// Options for [`Scope::derived_with`](crate::Scope::derived_with).
#[derive(Debug, Clone)]
pub struct DerivedOptions<T> {
    equality: Equality<T>,
    policy: Option<DerivedPolicy>,
}

impl<T: PartialEq + 'static> Default for DerivedOptions<T> {
    fn default() -> Self {
        Self {
            equality: Equality::partial_eq(),
            policy: None,
        }
    }
}

impl<T> DerivedOptions<T> {
    /// Options with the given equality policy and the runtime's default
    /// recompute policy.
    pub fn with_equality(equality: Equality<T>) -> Self {
        Self {
            equality,
            policy: None,
        }
    }

    /// Every recomputation counts as a change.
    pub fn always_notify() -> Self {
        Self::with_equality(Equality::never())
    }

    /// Recompute during the flush after every change.
    pub fn eager(mut self) -> Self {
        self.policy = Some(DerivedPolicy::Eager);
        self
    }

    /// Recompute on the next read.
    pub fn lazy(mut self) -> Self {
        self.policy = Some(DerivedPolicy::Lazy);
        self
    }
}

/// Clears the computing flag when the computation ends, also on unwind.
struct ComputingGuard<'a>(&'a AtomicBool);

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct DerivedInner<T> {
    /// Unique identifier for this derived.
    id: NodeId,

    runtime: Weak<RuntimeInner>,

    subscriber: Subscriber,

    /// The computation function.
    compute: Box<dyn Fn() -> T + Send + Sync>,

    /// The cached value. `None` until the first successful computation.
    value: RwLock<Option<T>>,

    equality: Equality<T>,

    policy: DerivedPolicy,

    /// Set while the computation runs; a read that finds it set is a cycle.
    computing: AtomicBool,

    /// Bumped when a recomputation produced a different value.
    version: AtomicU64,

    runs: AtomicU64,

    /// Last failure and the flush round it happened in.
    failure: Mutex<Option<(u64, ReactiveError)>>,
}

/// A cached value derived from other reactive values.
///
/// Cloning a `Derived` creates a new handle to the **same** computation.
///
/// # Example
///
/// ```rust
/// use refract_core::Runtime;
///
/// let rt = Runtime::new();
/// let first = rt.cell(String::from("Ada"));
/// let last = rt.cell(String::from("Lovelace"));
///
/// let full = {
///     let (first, last) = (first.clone(), last.clone());
///     rt.derived(move || format!("{} {}", first.read(), last.read()))
/// };
///
/// assert_eq!(full.read(), "Ada Lovelace");
/// first.write("Augusta".into());
/// assert_eq!(full.read(), "Augusta Lovelace");
/// ```
pub struct Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<DerivedInner<T>>,
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn create<F>(runtime: Weak<RuntimeInner>, compute: F, options: DerivedOptions<T>) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let id = NodeId::new();
        let rt = runtime.upgrade();
        let policy = options
            .policy
            .or_else(|| rt.as_ref().map(|rt| rt.config().derived_policy))
            .unwrap_or_default();

        let inner = Arc::new(DerivedInner {
            id,
            runtime,
            subscriber: Subscriber::new(id, SubscriberKind::Derived),
            compute: Box::new(compute),
            value: RwLock::new(None),
            equality: options.equality,
            policy,
            computing: AtomicBool::new(false),
            version: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            failure: Mutex::new(None),
        });

        if let Some(rt) = rt {
            let reactive: Arc<dyn Reactive> = inner.clone();
            rt.graph
                .lock()
                .add_node(Node::with_id(id, NodeKind::Derived).with_reactive(Arc::downgrade(&reactive)));
        }

        Self { inner }
    }

    /// Compute now if eager. Called once the derived has an owner.
    pub(crate) fn prime(&self) {
        if self.inner.policy != DerivedPolicy::Eager {
            return;
        }
        if let Some(rt) = self.inner.runtime.upgrade() {
            if let Err(error) = self.inner.settle(&rt) {
                rt.report(&error, SubscriberKind::Derived, self.inner.id);
            }
        }
    }

    pub(crate) fn as_reactive(&self) -> Arc<dyn Reactive> {
        self.inner.clone()
    }

    /// Get the derived's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Descriptor for this derived as a subscriber.
    pub fn subscriber(&self) -> Subscriber {
        self.inner.subscriber.clone()
    }

    /// Get the current value, recomputing if needed.
    ///
    /// If called within a tracked evaluation, this also records the derived
    /// as a dependency of that evaluation.
    ///
    /// # Panics
    ///
    /// Panics with the [`ReactiveError`] payload returned by
    /// [`try_read`](Self::try_read) if the computation fails or forms a
    /// cycle. Inside another derived or an effect the panic is caught and
    /// reported for that subscriber.
    pub fn read(&self) -> T {
        self.try_read()
            .unwrap_or_else(|error| std::panic::panic_any(error))
    }

    /// Get the current value, returning computation failures and cycles as
    /// errors.
    pub fn try_read(&self) -> Result<T> {
        let inner = &self.inner;
        let Some(rt) = inner.runtime.upgrade() else {
            return inner.read_detached();
        };
        if !inner.subscriber.is_alive() {
            return inner.read_detached();
        }

        let settled = inner.settle(&rt);
        // Subscribe even when settling failed, so a recovery reaches the
        // reader.
        rt.track(inner.id, inner.version.load(Ordering::SeqCst));
        settled?;

        let cached = inner.value.read().clone();
        match cached {
            Some(value) => Ok(value),
            None => inner.read_detached(),
        }
    }

    /// Get the current value without tracking dependencies.
    ///
    /// # Panics
    ///
    /// Same as [`read`](Self::read).
    pub fn read_untracked(&self) -> T {
        match self.inner.runtime.upgrade() {
            Some(rt) => rt.untracked(|| self.read()),
            None => self.read(),
        }
    }

    /// Number of times the computation has completed.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Bumped each time a recomputation produced a different value.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// The recompute policy in effect for this derived.
    pub fn policy(&self) -> DerivedPolicy {
        self.inner.policy
    }

    /// Whether the next read will have to check or recompute.
    pub fn is_dirty(&self) -> bool {
        let Some(rt) = self.inner.runtime.upgrade() else {
            return false;
        };
        let state = rt.graph.lock().state(self.inner.id);
        state.is_some_and(|state| state != DirtyState::Clean)
    }

    /// Whether a value has been computed yet.
    pub fn has_value(&self) -> bool {
        self.inner.value.read().is_some()
    }

    /// Stop tracking. Reads keep returning the last cached value.
    pub fn dispose(&self) {
        let rt = self.inner.runtime.upgrade();
        self.inner.dispose(rt.as_deref());
    }

    pub fn is_disposed(&self) -> bool {
        !self.inner.subscriber.is_alive()
    }
}

impl<T> DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Make the cached value current. Returns true if it recomputed.
    fn settle(&self, rt: &RuntimeInner) -> Result<bool> {
        if self.computing.load(Ordering::SeqCst) {
            return Err(ReactiveError::CyclicDependency {
                members: rt.cycle_members(self.id),
            });
        }

        let state = rt.graph.lock().state(self.id);
        match state {
            None | Some(DirtyState::Clean) => Ok(false),
            Some(DirtyState::MaybeDirty) => {
                if rt.sources_changed(self.id)? {
                    self.recompute(rt)
                } else {
                    rt.graph.lock().set_state(self.id, DirtyState::Clean);
                    Ok(false)
                }
            }
            Some(DirtyState::Dirty) => self.recompute(rt),
        }
    }

    fn recompute(&self, rt: &RuntimeInner) -> Result<bool> {
        let round = rt.flush_round();
        if let Some(error) = self.failed_in(round) {
            trace!(derived = %self.id, "already failed this round");
            return Err(error);
        }

        self.computing.store(true, Ordering::SeqCst);
        let _computing = ComputingGuard(&self.computing);

        let (result, observed) = rt.run_observed(self.id, || catch_unwind(AssertUnwindSafe(|| (self.compute)())));

        let value = match result {
            Ok(value) => value,
            Err(payload) => {
                // Reads made before the failure stay subscribed; the node
                // stays dirty so the next change retries it.
                let error = ReactiveError::from_panic(payload, SubscriberKind::Derived, self.id);
                rt.graph.lock().set_state(self.id, DirtyState::Dirty);
                if let Some(round) = round {
                    *self.failure.lock() = Some((round, error.clone()));
                }
                return Err(error);
            }
        };
        *self.failure.lock() = None;

        let diff = rt.graph.lock().set_dependencies(self.id, &observed);
        if !diff.removed.is_empty() {
            trace!(derived = %self.id, removed = ?diff.removed, "dependencies dropped");
        }

        let changed = {
            let mut slot = self.value.write();
            let changed = match slot.as_ref() {
                Some(old) => !self.equality.is_equal(old, &value),
                None => true,
            };
            *slot = Some(value);
            changed
        };
        if changed {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;

        rt.graph.lock().set_state(self.id, DirtyState::Clean);
        trace!(derived = %self.id, runs, changed, "recomputed");
        Ok(true)
    }

    /// The error from an earlier failure in `round`, if there was one.
    fn failed_in(&self, round: Option<u64>) -> Option<ReactiveError> {
        let round = round?;
        let failure = self.failure.lock();
        match &*failure {
            Some((failed_round, error)) if *failed_round == round => Some(error.clone()),
            _ => None,
        }
    }

    /// Value for a derived outside any live runtime: the cache, or a one-off
    /// untracked computation.
    fn read_detached(&self) -> Result<T> {
        if let Some(value) = self.value.read().clone() {
            return Ok(value);
        }
        let value = catch_unwind(AssertUnwindSafe(|| (self.compute)()))
            .map_err(|payload| ReactiveError::from_panic(payload, SubscriberKind::Derived, self.id))?;
        *self.value.write() = Some(value.clone());
        Ok(value)
    }
}

impl<T> Reactive for DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Derived
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn is_eager(&self) -> bool {
        self.policy == DerivedPolicy::Eager
    }

    fn update(&self, rt: &RuntimeInner) -> Result<bool> {
        if !self.subscriber.is_alive() {
            return Ok(false);
        }
        self.settle(rt)
    }

    fn dispose(&self, rt: Option<&RuntimeInner>) {
        if !self.subscriber.kill() {
            return;
        }
        if let Some(rt) = rt {
            rt.unregister(self.id);
        }
        trace!(derived = %self.id, "disposed");
    }

    fn is_disposed(&self) -> bool {
        !self.subscriber.is_alive()
    }
}

impl<T> Source for Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.inner.id
    }
}

impl<T> Clone for Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Derived<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.read())
            .field("policy", &self.inner.policy)
            .field("version", &self.version())
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

    fn counted<T, F>(rt: &Runtime, counter: &Arc<AtomicI32>, f: F) -> Derived<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let counter = counter.clone();
        rt.derived(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            f()
        })
    }

    #[test]
    fn derived_computes_on_first_read() {
        let rt = Runtime::new();
        let computes = Arc::new(AtomicI32::new(0));
        let derived = counted(&rt, &computes, || 42);

        assert_eq!(computes.load(Ordering::SeqCst), 0);
        assert!(!derived.has_value());

        assert_eq!(derived.read(), 42);
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn derived_caches_value_when_clean() {
        let rt = Runtime::new();
        let computes = Arc::new(AtomicI32::new(0));
        let a = rt.cell(2);
        let a_clone = a.clone();
        let derived = counted(&rt, &computes, move || a_clone.read() * 2);

        assert_eq!(derived.read(), 4);
        assert_eq!(derived.read(), 4);
        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert!(!derived.is_dirty());
    }

    #[test]
    fn derived_recomputes_after_dependency_changes() {
        let rt = Runtime::new();
        let computes = Arc::new(AtomicI32::new(0));
        let a = rt.cell(2);
        let a_clone = a.clone();
        let derived = counted(&rt, &computes, move || a_clone.read() * 2);

        assert_eq!(derived.read(), 4);
        a.write(5);
        assert!(derived.is_dirty());
        assert_eq!(derived.read(), 10);
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unchanged_intermediate_stops_propagation() {
        let rt = Runtime::new();
        let a = rt.cell(1);
        let parity_runs = Arc::new(AtomicI32::new(0));
        let label_runs = Arc::new(AtomicI32::new(0));

        let a_clone = a.clone();
        let parity = counted(&rt, &parity_runs, move || a_clone.read() % 2);
        let parity_clone = parity.clone();
        let label = counted(&rt, &label_runs, move || {
            if parity_clone.read() == 0 { "even" } else { "odd" }
        });

        assert_eq!(label.read(), "odd");
        a.write(3);
        assert_eq!(label.read(), "odd");

        assert_eq!(parity_runs.load(Ordering::SeqCst), 2);
        assert_eq!(label_runs.load(Ordering::SeqCst), 1);
        assert_eq!(parity.version(), 1);
    }

    #[test]
    fn dynamic_dependencies_follow_the_last_run() {
        let rt = Runtime::new();
        let use_left = rt.cell(true);
        let left = rt.cell(1);
        let right = rt.cell(2);

        let (flag, l, r) = (use_left.clone(), left.clone(), right.clone());
        let picked = rt.derived(move || if flag.read() { l.read() } else { r.read() });

        assert_eq!(picked.read(), 1);
        assert_eq!(left.subscriber_count(), 1);
        assert_eq!(right.subscriber_count(), 0);

        use_left.write(false);
        assert_eq!(picked.read(), 2);
        assert_eq!(left.subscriber_count(), 0);
        assert_eq!(right.subscriber_count(), 1);

        left.write(10);
        assert!(!picked.is_dirty());
    }

    #[test]
    fn self_read_is_a_cycle() {
        let rt = Runtime::new();
        let slot: Arc<std::sync::OnceLock<Derived<i32>>> = Arc::new(std::sync::OnceLock::new());
        let slot_clone = slot.clone();
        let derived = rt.derived(move || slot_clone.get().map(|d| d.read()).unwrap_or(0) + 1);
        let _ = slot.set(derived.clone());

        match derived.try_read() {
            Err(ReactiveError::CyclicDependency { members }) => {
                assert_eq!(members, vec![derived.id()]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert!(!rt.is_tracking());
    }

    #[test]
    fn panicking_compute_stays_dirty_and_retries() {
        let rt = Runtime::new();
        let a = rt.cell(0);
        let a_clone = a.clone();
        let derived = rt.derived(move || {
            let v = a_clone.read();
            assert!(v >= 0, "negative input");
            v
        });

        a.write(-1);
        match derived.try_read() {
            Err(ReactiveError::SubscriberException { kind, message, .. }) => {
                assert_eq!(kind, SubscriberKind::Derived);
                assert!(message.contains("negative input"));
            }
            other => panic!("expected a failure, got {other:?}"),
        }
        assert!(derived.is_dirty());

        a.write(3);
        assert_eq!(derived.try_read(), Ok(3));
    }

    #[test]
    fn failing_compute_runs_once_per_flush() {
        let rt = Runtime::new();
        rt.on_error(|_, _, _| {});
        let a = rt.cell(-1);
        let computes = Arc::new(AtomicI32::new(0));

        let a_clone = a.clone();
        let derived = counted(&rt, &computes, move || {
            let v = a_clone.read();
            assert!(v >= 0, "negative input");
            v
        });
        let derived_clone = derived.clone();
        let _effect = rt.effect(move || {
            derived_clone.read();
        });
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        // Both the flush and the effect's read ask for it; it computes once.
        a.write(-2);
        assert_eq!(computes.load(Ordering::SeqCst), 2);

        a.write(4);
        assert_eq!(computes.load(Ordering::SeqCst), 3);
        assert_eq!(derived.read(), 4);
    }

    #[test]
    fn custom_equality_suppresses_version_bumps() {
        let rt = Runtime::new();
        let a = rt.cell(10);
        let a_clone = a.clone();
        let bucket = rt.derived_with(
            move || a_clone.read(),
            DerivedOptions::with_equality(Equality::custom(|x: &i32, y: &i32| x / 10 == y / 10)),
        );

        assert_eq!(bucket.read(), 10);
        a.write(15);
        assert_eq!(bucket.read(), 15);
        assert_eq!(bucket.version(), 1);

        a.write(25);
        assert_eq!(bucket.read(), 25);
        assert_eq!(bucket.version(), 2);
    }

    #[test]
    fn eager_derived_recomputes_without_readers() {
        let rt = Runtime::new();
        let computes = Arc::new(AtomicI32::new(0));
        let a = rt.cell(1);

        let (a_clone, counter) = (a.clone(), computes.clone());
        let derived = rt.derived_with(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                a_clone.read() + 1
            },
            DerivedOptions::default().eager(),
        );
        assert_eq!(derived.policy(), DerivedPolicy::Eager);
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        a.write(2);
        assert_eq!(computes.load(Ordering::SeqCst), 2);
        assert!(!derived.is_dirty());
        assert_eq!(derived.read(), 3);
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn derived_clone_shares_state() {
        let rt = Runtime::new();
        let derived = rt.derived(|| 7);
        let clone = derived.clone();

        assert_eq!(derived.read(), 7);
        assert_eq!(clone.run_count(), 1);
        assert_eq!(derived.id(), clone.id());
    }
}

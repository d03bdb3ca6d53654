//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects cells, derived
//! computations and effects. It owns the dependency graph, the tracker
//! stack and the scheduler, and drives every flush.
//!
//! # How It Works
//!
//! 1. When a cell, derived or effect is created, it registers a node in the
//!    runtime's graph and is owned by the current [`Scope`].
//!
//! 2. When a derived or effect reads a value, the tracker records the read
//!    together with the version it saw, and the reader is subscribed. After
//!    the evaluation the runtime drops edges to nodes it no longer read.
//!
//! 3. When a cell's value changes, the runtime:
//!    a. Marks direct dependents dirty and everything further downstream
//!       maybe-dirty
//!    b. Queues them in the scheduler
//!    c. Flushes, unless a batch or flush is already in progress
//!
//! 4. A flush settles queued derived values in topological order, then runs
//!    queued effects in creation order, and repeats while effects keep
//!    writing. Lazy derived values nobody observes are skipped; they
//!    recompute on their next read.
//!
//! # Thread Safety
//!
//! A runtime handle is `Send + Sync` and every primitive can be moved across
//! threads. Internal locks are never held while user code runs. The engine
//! is not designed for concurrent writers; flushes from different threads
//! are serialized by the scheduler's flushing flag.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::map::Entry;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, debug_span, error, trace};

use super::cell::{Cell, CellOptions};
use super::derived::{Derived, DerivedOptions};
use super::effect::{Effect, EffectOutput};
use super::scope::Scope;
use super::subscriber::{SubscriberId, SubscriberKind};
use super::tracker::{FrameGuard, Tracked, Tracker};
use crate::config::{FlushMode, RuntimeConfig};
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyState, FlushReport, Graph, NodeId, NodeKind, Phase, Scheduler};

/// Behaviour shared by every primitive registered in the graph.
pub(crate) trait Reactive: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn kind(&self) -> NodeKind;

    /// Bumped whenever the observable value changed.
    fn version(&self) -> u64;

    /// Settled during flushes even without dependents.
    fn is_eager(&self) -> bool;

    /// Bring the node up to date. Returns true if it recomputed or ran.
    fn update(&self, rt: &RuntimeInner) -> Result<bool>;

    /// Tear the node down. Idempotent. `rt` is `None` once the runtime is gone.
    fn dispose(&self, rt: Option<&RuntimeInner>);

    fn is_disposed(&self) -> bool;
}

/// Callback receiving isolated subscriber failures.
pub type ErrorHandler = Arc<dyn Fn(&ReactiveError, SubscriberKind, SubscriberId) + Send + Sync>;

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    pub(crate) graph: Mutex<Graph>,
    pub(crate) tracker: Mutex<Tracker>,
    pub(crate) scheduler: Mutex<Scheduler>,
    /// Scope that owns everything created outside an effect or explicit scope.
    root: Scope,
    /// Scopes currently collecting newly created nodes, innermost last.
    owners: Mutex<Vec<Scope>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    globals: Mutex<IndexMap<String, Box<dyn Any + Send + Sync>>>,
}

impl RuntimeInner {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Record a read of `node` at `version` in the current tracking frame.
    ///
    /// The reading computation is subscribed on its first read, so writes
    /// it makes later in the same run already reach it.
    pub(crate) fn track(&self, node: NodeId, version: u64) {
        let owner = self.tracker.lock().track(node, version);
        if let Some(owner) = owner {
            self.graph.lock().add_edge(node, owner, version);
        }
    }

    /// Run `f` in a fresh frame owned by `owner`. Returns what `f` read and
    /// the version it saw for each.
    pub(crate) fn run_observed<R>(&self, owner: NodeId, f: impl FnOnce() -> R) -> (R, Vec<(NodeId, u64)>) {
        let guard = FrameGuard::enter(&self.tracker, Some(owner));
        let result = f();
        (result, guard.finish())
    }

    /// Run `f` in an ownerless frame.
    pub(crate) fn run_tracked<R>(&self, f: impl FnOnce() -> R) -> Tracked<R> {
        let guard = FrameGuard::enter(&self.tracker, None);
        let result = f();
        let dependencies = guard.finish().into_iter().map(|(id, _)| id).collect();
        Tracked {
            result,
            dependencies,
        }
    }

    pub(crate) fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = FrameGuard::enter_untracked(&self.tracker);
        f()
    }

    pub(crate) fn cycle_members(&self, node: NodeId) -> Vec<NodeId> {
        self.tracker.lock().cycle_members(node)
    }

    /// Settle each of `dependencies` and return the version it ended at.
    /// Nodes that are no longer registered are left out. Used for
    /// explicitly declared dependencies, which are never read through the
    /// tracker.
    pub(crate) fn observe_settled(&self, dependencies: &[NodeId], owner: SubscriberId) -> Vec<(NodeId, u64)> {
        let reactives: Vec<_> = {
            let graph = self.graph.lock();
            dependencies
                .iter()
                .filter_map(|id| graph.reactive(*id).map(|r| (*id, r)))
                .collect()
        };
        reactives
            .into_iter()
            .map(|(id, reactive)| {
                if let Err(error) = reactive.update(self) {
                    self.report(&error, SubscriberKind::Effect, owner);
                }
                (id, reactive.version())
            })
            .collect()
    }

    /// Whether any dependency of `id` changed since `id` last observed it.
    ///
    /// Derived dependencies are settled first, so this is where a
    /// maybe-dirty node pulls its upstream up to date.
    pub(crate) fn sources_changed(&self, id: NodeId) -> Result<bool> {
        let observed: Vec<_> = {
            let graph = self.graph.lock();
            graph
                .observed(id)
                .into_iter()
                .map(|(dep, seen)| (dep, seen, graph.reactive(dep)))
                .collect()
        };

        for (dep, seen, reactive) in observed {
            let Some(reactive) = reactive else {
                trace!(node = %id, dependency = %dep, "dependency gone");
                return Ok(true);
            };
            reactive.update(self)?;
            if reactive.version() != seen {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Propagate a change of `source` and flush if nothing holds it back.
    pub(crate) fn notify(&self, source: NodeId) -> Result<()> {
        let affected = self.graph.lock().mark_changed(source);
        if affected.is_empty() {
            return Ok(());
        }

        let flush_now = {
            let mut scheduler = self.scheduler.lock();
            scheduler.enqueue(affected);
            self.config.flush_mode == FlushMode::Auto && scheduler.should_flush()
        };
        if flush_now {
            self.flush()?;
        }
        Ok(())
    }

    /// Run `f` as a batch. The outermost batch flushes on exit.
    pub(crate) fn with_batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let guard = BatchGuard::enter(self);
        let result = f();
        let outermost = guard.close();

        if outermost
            && self.config.flush_mode == FlushMode::Auto
            && self.scheduler.lock().should_flush()
        {
            self.flush()?;
        }
        Ok(result)
    }

    /// Drain the pending queue.
    ///
    /// Only `ReentrancyLimitExceeded` is returned as an error; subscriber
    /// failures are reported and collected in the [`FlushReport`]. A flush
    /// requested while one is running returns an empty report; the running
    /// flush picks the new work up in its next round.
    pub(crate) fn flush(&self) -> Result<FlushReport> {
        if !self.scheduler.lock().begin_flush() {
            return Ok(FlushReport::default());
        }
        let _flushing = FlushGuard { rt: self };
        let span = debug_span!("flush");
        let _enter = span.enter();
        debug!(pending = self.scheduler.lock().pending_count(), "flush started");

        let mut report = FlushReport::default();
        loop {
            let round = self.scheduler.lock().take_round();
            if round.is_empty() {
                break;
            }

            report.rounds += 1;
            if report.rounds > self.config.reentrancy_limit {
                self.scheduler.lock().clear_pending();
                let error = ReactiveError::ReentrancyLimitExceeded {
                    limit: self.config.reentrancy_limit,
                };
                error!(%error, "flush aborted");
                return Err(error);
            }

            let (derived, mut effects) = {
                let graph = self.graph.lock();
                let mut derived = Vec::new();
                let mut effects = Vec::new();
                for id in round {
                    match graph.kind(id) {
                        Some(NodeKind::Derived) => derived.push(id),
                        Some(NodeKind::Effect) => effects.push(id),
                        _ => {}
                    }
                }
                (graph.topological_sort(&derived), effects)
            };
            effects.sort();
            trace!(round = report.rounds, derived = derived.len(), effects = effects.len(), "flush round");

            for id in derived {
                let (reactive, observed) = {
                    let graph = self.graph.lock();
                    (graph.reactive(id), graph.has_dependents(id))
                };
                let Some(reactive) = reactive else { continue };
                if !reactive.is_eager() && !observed {
                    continue;
                }
                match reactive.update(self) {
                    Ok(true) => report.derived_settled += 1,
                    Ok(false) => {}
                    Err(error) => {
                        self.report(&error, SubscriberKind::Derived, id);
                        report.errors.push(error);
                    }
                }
            }

            for id in effects {
                let Some(reactive) = self.graph.lock().reactive(id) else { continue };
                match reactive.update(self) {
                    Ok(true) => report.effects_run += 1,
                    Ok(false) => {}
                    Err(error) => {
                        self.report(&error, SubscriberKind::Effect, id);
                        report.errors.push(error);
                    }
                }
            }
        }

        debug!(
            rounds = report.rounds,
            derived = report.derived_settled,
            effects = report.effects_run,
            errors = report.errors.len(),
            "flush finished"
        );
        Ok(report)
    }

    /// Settle the state of effect `id` after its body ran.
    ///
    /// The node was clean when the body started, so a state other than
    /// clean means the body wrote something it had already read. Such a node
    /// is still queued; it is downgraded to maybe-dirty so the next round
    /// re-runs it only if a version it saw has moved. A failed run that
    /// nothing touched stays dirty and re-runs on the next change.
    pub(crate) fn after_run(&self, id: NodeId, failed: bool) {
        let mut graph = self.graph.lock();
        match graph.state(id) {
            None => {}
            Some(DirtyState::Clean) => {
                if failed {
                    graph.set_state(id, DirtyState::Dirty);
                }
            }
            Some(_) => {
                graph.set_state(id, DirtyState::Clean);
                graph.set_state(id, DirtyState::MaybeDirty);
            }
        }
    }

    /// The flush round running right now, if any.
    pub(crate) fn flush_round(&self) -> Option<u64> {
        self.scheduler.lock().current_round()
    }

    /// Deliver an isolated failure to the error handler, or log it.
    pub(crate) fn report(&self, error: &ReactiveError, kind: SubscriberKind, id: SubscriberId) {
        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => handler(error, kind, id),
            None => error!(%error, %kind, subscriber = %id, "subscriber failed"),
        }
    }

    /// Scope that owns nodes created right now.
    pub(crate) fn current_scope(&self) -> Scope {
        self.owners
            .lock()
            .last()
            .cloned()
            .unwrap_or_else(|| self.root.clone())
    }

    /// Make `scope` the owner of nodes created until the guard drops.
    pub(crate) fn push_owner(&self, scope: Scope) -> OwnerGuard<'_> {
        let mut owners = self.owners.lock();
        owners.push(scope);
        OwnerGuard {
            rt: self,
            index: owners.len() - 1,
        }
    }

    /// Remove a node from the graph and the pending queue.
    pub(crate) fn unregister(&self, id: NodeId) {
        self.graph.lock().remove_node(id);
        self.scheduler.lock().remove(id);
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        let rt: &RuntimeInner = self;
        rt.root.dispose_in(Some(rt));
    }
}

/// Batch depth guard. A batch that unwinds releases its depth but does not
/// flush; queued work waits for the next flush.
struct BatchGuard<'a> {
    rt: &'a RuntimeInner,
    open: bool,
}

impl<'a> BatchGuard<'a> {
    fn enter(rt: &'a RuntimeInner) -> Self {
        rt.scheduler.lock().enter_batch();
        Self { rt, open: true }
    }

    /// Close the batch. Returns true if it was the outermost one.
    fn close(mut self) -> bool {
        self.open = false;
        self.rt.scheduler.lock().exit_batch()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            self.rt.scheduler.lock().exit_batch();
        }
    }
}

struct FlushGuard<'a> {
    rt: &'a RuntimeInner,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.rt.scheduler.lock().end_flush();
    }
}

pub(crate) struct OwnerGuard<'a> {
    rt: &'a RuntimeInner,
    index: usize,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        self.rt.owners.lock().truncate(self.index);
    }
}

/// Handle to a reactive runtime.
///
/// All cells, derived values and effects belong to exactly one runtime.
/// Cloning the handle is cheap; the runtime is torn down (running every
/// pending cleanup) when the last handle drops.
///
/// Primitives only hold weak references to their runtime. A `Runtime`
/// captured inside an effect or derived body is a strong one, so that
/// runtime stays alive until the node is disposed (for example by
/// [`reset`](Self::reset)).
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicI32, Ordering};
/// use std::sync::Arc;
/// use refract_core::Runtime;
///
/// let rt = Runtime::new();
/// let a = rt.cell(1);
/// let b = {
///     let a = a.clone();
///     rt.derived(move || a.read() * 2)
/// };
///
/// let seen = Arc::new(AtomicI32::new(0));
/// let seen_clone = seen.clone();
/// let b_clone = b.clone();
/// let _effect = rt.effect(move || {
///     seen_clone.store(b_clone.read(), Ordering::SeqCst);
/// });
///
/// a.write(5);
/// assert_eq!(seen.load(Ordering::SeqCst), 10);
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::build(RuntimeConfig::default())
    }

    /// Create a runtime with a custom configuration.
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RuntimeConfig) -> Self {
        debug!(?config, "runtime created");
        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| RuntimeInner {
            config,
            graph: Mutex::new(Graph::new()),
            tracker: Mutex::new(Tracker::new()),
            scheduler: Mutex::new(Scheduler::new()),
            root: Scope::detached(weak.clone()),
            owners: Mutex::new(Vec::new()),
            error_handler: RwLock::new(None),
            globals: Mutex::new(IndexMap::new()),
        });
        Self { inner }
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Create a cell owned by the current scope.
    pub fn cell<T>(&self, value: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.inner.current_scope().cell(value)
    }

    /// Create a cell with a custom equality policy.
    pub fn cell_with<T>(&self, value: T, options: CellOptions<T>) -> Cell<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner.current_scope().cell_with(value, options)
    }

    /// Create a derived computation owned by the current scope.
    pub fn derived<T, F>(&self, compute: F) -> Derived<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.inner.current_scope().derived(compute)
    }

    /// Create a derived computation with explicit options.
    pub fn derived_with<T, F>(&self, compute: F, options: DerivedOptions<T>) -> Derived<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.inner.current_scope().derived_with(compute, options)
    }

    /// Create an effect that tracks everything it reads. The effect runs
    /// immediately.
    ///
    /// # Panics
    ///
    /// Panics with a [`ReactiveError`] payload if the flush following the
    /// first run hits the re-entrancy limit.
    pub fn effect<F, O>(&self, body: F) -> Effect
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: EffectOutput,
    {
        self.inner.current_scope().effect(body)
    }

    /// Create an effect that only re-runs when one of `dependencies`
    /// changes. Reads inside the body are not tracked. With an empty list
    /// the body runs exactly once.
    ///
    /// # Panics
    ///
    /// Same as [`effect`](Self::effect).
    pub fn effect_with_deps<I, F, O>(&self, dependencies: I, body: F) -> Effect
    where
        I: IntoIterator<Item = NodeId>,
        F: Fn() -> O + Send + Sync + 'static,
        O: EffectOutput,
    {
        self.inner.current_scope().effect_with_deps(dependencies, body)
    }

    /// Create a standalone scope. Nodes created through it are disposed
    /// together when the scope is disposed or its last handle drops.
    pub fn create_scope(&self) -> Scope {
        Scope::detached(Arc::downgrade(&self.inner))
    }

    /// Run `f` with notifications deferred. Nested batches flush once, when
    /// the outermost one returns.
    ///
    /// # Panics
    ///
    /// Panics with a [`ReactiveError`] payload if the final flush hits the
    /// re-entrancy limit. Use [`try_batch`](Self::try_batch) to get the
    /// error back instead.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.inner.with_batch(f) {
            Ok(result) => result,
            Err(error) => std::panic::panic_any(error),
        }
    }

    /// Like [`batch`](Self::batch), returning fatal flush errors.
    pub fn try_batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.inner.with_batch(f)
    }

    /// Run `f` without recording any of its reads.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.untracked(f)
    }

    /// Run `f` and report which nodes it read.
    pub fn run_tracked<R>(&self, f: impl FnOnce() -> R) -> Tracked<R> {
        self.inner.run_tracked(f)
    }

    /// Whether reads are currently being recorded.
    pub fn is_tracking(&self) -> bool {
        self.inner.tracker.lock().is_tracking()
    }

    /// Flush all pending work now.
    ///
    /// Needed in [`FlushMode::Manual`]; in automatic mode the queue is
    /// normally empty already.
    pub fn flush(&self) -> Result<FlushReport> {
        self.inner.flush()
    }

    /// Install the handler receiving isolated subscriber failures. Without
    /// one, failures are logged at error level.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ReactiveError, SubscriberKind, SubscriberId) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Some(Arc::new(handler));
    }

    /// Remove the error handler.
    pub fn clear_error_handler(&self) {
        *self.inner.error_handler.write() = None;
    }

    /// A process-wide cell registered under `key`, created from `init` on
    /// first use. Global cells are owned by the runtime's root scope.
    ///
    /// Returns [`ReactiveError::GlobalTypeMismatch`] if `key` already holds
    /// a cell of a different type.
    pub fn global<T>(&self, key: &str, init: impl FnOnce() -> T) -> Result<Cell<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        if let Some(existing) = self.lookup_global::<T>(key) {
            return existing;
        }

        let cell = self.inner.root.cell(init());
        let registered = {
            let mut globals = self.inner.globals.lock();
            match globals.entry(key.to_string()) {
                Entry::Occupied(entry) => Some(downcast_global::<T>(key, &**entry.get())),
                Entry::Vacant(entry) => {
                    entry.insert(Box::new(cell.clone()));
                    None
                }
            }
        };
        match registered {
            // `init` registered the key itself; that cell wins.
            Some(existing) => {
                cell.dispose();
                existing
            }
            None => Ok(cell),
        }
    }

    fn lookup_global<T>(&self, key: &str) -> Option<Result<Cell<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let globals = self.inner.globals.lock();
        globals.get(key).map(|entry| downcast_global(key, &**entry))
    }

    /// Dispose everything owned by the root scope, forget all globals and
    /// drop pending work. Explicit scopes are left alone.
    ///
    /// Must not be called from inside a computation or effect.
    pub fn reset(&self) {
        let globals = std::mem::take(&mut *self.inner.globals.lock());
        drop(globals);
        self.inner.root.clear_in(Some(self.inner.as_ref()));
        self.inner.scheduler.lock().reset();
        debug!("runtime reset");
    }

    /// What the scheduler is doing right now.
    pub fn phase(&self) -> Phase {
        self.inner.scheduler.lock().phase()
    }

    /// Number of live nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.inner.graph.lock().node_count()
    }

    /// Number of nodes waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        self.inner.scheduler.lock().pending_count()
    }
}

fn downcast_global<T>(key: &str, entry: &(dyn Any + Send + Sync)) -> Result<Cell<T>>
where
    T: Clone + Send + Sync + 'static,
{
    entry
        .downcast_ref::<Cell<T>>()
        .cloned()
        .ok_or_else(|| ReactiveError::GlobalTypeMismatch {
            key: key.to_string(),
        })
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("phase", &self.phase())
            .field("node_count", &self.node_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DerivedPolicy;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn zero_reentrancy_limit_is_rejected() {
        let config = RuntimeConfig::default().with_reentrancy_limit(0);
        assert!(matches!(
            Runtime::with_config(config),
            Err(ReactiveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn nodes_register_and_reset_clears_them() {
        let rt = Runtime::new();
        let a = rt.cell(1);
        let a_clone = a.clone();
        let _d = rt.derived(move || a_clone.read() + 1);
        assert_eq!(rt.node_count(), 2);

        rt.reset();
        assert_eq!(rt.node_count(), 0);
        assert!(a.is_disposed());
    }

    #[test]
    fn run_tracked_reports_reads_in_order() {
        let rt = Runtime::new();
        let a = rt.cell(1);
        let b = rt.cell(2);

        let tracked = rt.run_tracked(|| b.read() + a.read() + b.read());
        assert_eq!(tracked.result, 5);
        assert_eq!(tracked.dependencies, vec![b.id(), a.id()]);
        assert!(!rt.is_tracking());
    }

    #[test]
    fn untracked_reads_are_not_recorded() {
        let rt = Runtime::new();
        let a = rt.cell(1);

        let tracked = rt.run_tracked(|| rt.untracked(|| a.read()));
        assert_eq!(tracked.result, 1);
        assert!(tracked.dependencies.is_empty());
    }

    #[test]
    fn phase_follows_batches() {
        let rt = Runtime::new();
        assert_eq!(rt.phase(), Phase::Idle);
        rt.batch(|| assert_eq!(rt.phase(), Phase::Batching));
        assert_eq!(rt.phase(), Phase::Idle);
    }

    #[test]
    fn manual_mode_waits_for_flush() {
        let config = RuntimeConfig::default().with_flush_mode(FlushMode::Manual);
        let rt = Runtime::with_config(config).unwrap();
        let a = rt.cell(0);
        let seen = Arc::new(AtomicI32::new(-1));

        let seen_clone = seen.clone();
        let a_clone = a.clone();
        let _effect = rt.effect(move || seen_clone.store(a_clone.read(), Ordering::SeqCst));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        a.write(4);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(rt.pending_count(), 1);

        let report = rt.flush().unwrap();
        assert_eq!(report.effects_run, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn panicking_batch_releases_its_depth() {
        let rt = Runtime::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            rt.batch(|| panic!("inside batch"));
        }));
        assert!(result.is_err());
        assert_eq!(rt.phase(), Phase::Idle);
    }

    #[test]
    fn globals_are_shared_by_key() {
        let rt = Runtime::new();
        let first = rt.global("count", || 1).unwrap();
        let second = rt.global("count", || 99).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(second.read(), 1);

        assert!(matches!(
            rt.global("count", || String::from("nope")),
            Err(ReactiveError::GlobalTypeMismatch { .. })
        ));
    }

    #[test]
    fn global_registered_by_its_own_init_wins() {
        let rt = Runtime::new();
        let theme = rt
            .global("theme", || {
                let inner = rt.global("theme", || 1).map(|cell| cell.read()).unwrap_or(0);
                inner + 10
            })
            .unwrap();

        assert_eq!(theme.read(), 1);
        assert_eq!(rt.global("theme", || 99).unwrap().id(), theme.id());
        // The cell built for the outer call is gone, not orphaned.
        assert_eq!(rt.node_count(), 1);
    }

    #[test]
    fn eager_config_applies_to_new_derived_values() {
        let config = RuntimeConfig::default().with_derived_policy(DerivedPolicy::Eager);
        let rt = Runtime::with_config(config).unwrap();
        let a = rt.cell(1);
        let computes = Arc::new(AtomicI32::new(0));

        let computes_clone = computes.clone();
        let a_clone = a.clone();
        let _d = rt.derived(move || {
            computes_clone.fetch_add(1, Ordering::SeqCst);
            a_clone.read() * 2
        });
        assert_eq!(computes.load(Ordering::SeqCst), 1);

        a.write(2);
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }
}

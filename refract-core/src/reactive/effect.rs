//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its body immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is queued and re-runs once in
//!    the next flush, after every derived value has settled.
//!
//! 3. Before re-running, the effect runs the cleanup returned by its
//!    previous run, disposes everything it created last time, and tracks a
//!    fresh dependency set during execution.
//!
//! # Dependencies
//!
//! By default an effect tracks everything it reads. An effect created with
//! an explicit dependency list runs its body untracked and only re-runs when
//! one of the listed nodes changes; an empty list means it runs once.
//!
//! # Cleanup
//!
//! The body can return a [`Cleanup`] (or `Option<Cleanup>`, or a `Result`
//! of either). The cleanup runs before the next run and, exactly once, when
//! the effect is disposed.
//!
//! # Writes From the Body
//!
//! A body that writes something it already read in the same run is queued
//! again and re-runs in the next round of the flush, until it stops
//! changing its own inputs or the re-entrancy limit is hit.
//!
//! # Failures
//!
//! A body that panics or returns `Err` is reported through the runtime's
//! error handler. It does not stop the flush or other effects, and the
//! effect stays subscribed to whatever it read before failing.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use super::runtime::{Reactive, RuntimeInner};
use super::scope::Scope;
use super::subscriber::{Subscriber, SubscriberKind};
use crate::error::{ReactiveError, Result};
use crate::graph::{DirtyState, Node, NodeId, NodeKind};

/// Error type an effect body may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A teardown function returned by an effect run.
pub struct Cleanup(Box<dyn FnOnce() + Send>);

impl Cleanup {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup")
    }
}

/// Values an effect body can return.
pub trait EffectOutput {
    /// Split the return value into an optional cleanup or a failure.
    fn into_cleanup(self) -> std::result::Result<Option<Cleanup>, BoxError>;
}

impl EffectOutput for () {
    fn into_cleanup(self) -> std::result::Result<Option<Cleanup>, BoxError> {
        Ok(None)
    }
}

impl EffectOutput for Cleanup {
    fn into_cleanup(self) -> std::result::Result<Option<Cleanup>, BoxError> {
        Ok(Some(self))
    }
}

impl EffectOutput for Option<Cleanup> {
    fn into_cleanup(self) -> std::result::Result<Option<Cleanup>, BoxError> {
        Ok(self)
    }
}

impl<C, E> EffectOutput for std::result::Result<C, E>
where
    C: EffectOutput,
    E: Into<BoxError>,
{
    fn into_cleanup(self) -> std::result::Result<Option<Cleanup>, BoxError> {
        self.map_err(Into::into)?.into_cleanup()
    }
}

type Body = Box<dyn Fn() -> std::result::Result<Option<Cleanup>, BoxError> + Send + Sync>;

#[derive(Debug)]
enum DependencyMode {
    /// Subscribe to everything read during the last run.
    Tracked,
    /// Subscribe to exactly these nodes.
    Explicit(Vec<NodeId>),
}

struct EffectInner {
    /// Unique identifier for this effect.
    id: NodeId,

    runtime: Weak<RuntimeInner>,

    subscriber: Subscriber,

    /// The effect body, with its return value already normalized.
    body: Body,

    mode: DependencyMode,

    /// Cleanup returned by the latest run.
    cleanup: Mutex<Option<Cleanup>>,

    /// Owns nodes created by the body; cleared before every run.
    children: Scope,

    runs: AtomicU64,
}

/// A side-effecting computation that runs when dependencies change.
///
/// Dropping the handle does not stop the effect; it lives until its owning
/// scope is disposed or [`dispose`](Self::dispose) is called.
///
/// # Example
///
/// ```rust
/// use refract_core::{Cleanup, Runtime};
///
/// let rt = Runtime::new();
/// let count = rt.cell(0);
///
/// let count_clone = count.clone();
/// let effect = rt.effect(move || {
///     let seen = count_clone.read();
///     Cleanup::new(move || println!("leaving {seen}"))
/// });
///
/// count.write(5);
/// assert_eq!(effect.run_count(), 2);
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    fn create<F, O>(runtime: Weak<RuntimeInner>, mode: DependencyMode, body: F) -> Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: EffectOutput,
    {
        let id = NodeId::new();
        let inner = Arc::new(EffectInner {
            id,
            runtime: runtime.clone(),
            subscriber: Subscriber::new(id, SubscriberKind::Effect),
            body: Box::new(move || body().into_cleanup()),
            mode,
            cleanup: Mutex::new(None),
            children: Scope::detached(runtime),
            runs: AtomicU64::new(0),
        });

        if let Some(rt) = inner.runtime.upgrade() {
            let reactive: Arc<dyn Reactive> = inner.clone();
            rt.graph
                .lock()
                .add_node(Node::with_id(id, NodeKind::Effect).with_reactive(Arc::downgrade(&reactive)));
        }

        Self { inner }
    }

    pub(crate) fn tracked<F, O>(runtime: Weak<RuntimeInner>, body: F) -> Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: EffectOutput,
    {
        Self::create(runtime, DependencyMode::Tracked, body)
    }

    pub(crate) fn explicit<F, O>(runtime: Weak<RuntimeInner>, dependencies: Vec<NodeId>, body: F) -> Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: EffectOutput,
    {
        Self::create(runtime, DependencyMode::Explicit(dependencies), body)
    }

    /// First run. Executed as a batch so writes made by the body flush once
    /// it returns.
    ///
    /// Panics with the fatal error if that flush is aborted.
    pub(crate) fn start(&self) {
        let Some(rt) = self.inner.runtime.upgrade() else {
            return;
        };
        match rt.with_batch(|| self.inner.execute(&rt)) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => rt.report(&error, SubscriberKind::Effect, self.inner.id),
            Err(fatal) => std::panic::panic_any(fatal),
        }
    }

    pub(crate) fn as_reactive(&self) -> Arc<dyn Reactive> {
        self.inner.clone()
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Descriptor for this effect as a subscriber.
    pub fn subscriber(&self) -> Subscriber {
        self.inner.subscriber.clone()
    }

    /// Stop the effect and run its pending cleanup.
    ///
    /// After disposal the effect never runs again. Disposing twice is a
    /// no-op.
    pub fn dispose(&self) {
        let rt = self.inner.runtime.upgrade();
        self.inner.dispose(rt.as_deref());
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        !self.inner.subscriber.is_alive()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Number of nodes the effect is currently subscribed to.
    pub fn dependency_count(&self) -> usize {
        let Some(rt) = self.inner.runtime.upgrade() else {
            return 0;
        };
        let observed = rt.graph.lock().observed(self.inner.id);
        observed.len()
    }
}

impl EffectInner {
    fn execute(&self, rt: &RuntimeInner) -> Result<()> {
        if !self.subscriber.is_alive() {
            return Ok(());
        }

        if let Err(error) = self.run_cleanup() {
            rt.report(&error, SubscriberKind::Effect, self.id);
        }
        self.children.clear_in(Some(rt));

        // From here on, writes the body makes to what it reads mark this node
        // again and queue it for the next round.
        rt.graph.lock().set_state(self.id, DirtyState::Clean);

        let outcome = {
            let _owner = rt.push_owner(self.children.clone());
            match &self.mode {
                DependencyMode::Tracked => {
                    let (result, observed) =
                        rt.run_observed(self.id, || catch_unwind(AssertUnwindSafe(|| (self.body)())));
                    // Reads made before a failure still count.
                    rt.graph.lock().set_dependencies(self.id, &observed);
                    result
                }
                DependencyMode::Explicit(dependencies) => {
                    // Versions are taken before the body, so its own writes
                    // to them count as changes. Edges are only added, so
                    // manual subscriptions survive.
                    let observed = rt.observe_settled(dependencies, self.id);
                    {
                        let mut graph = rt.graph.lock();
                        for (dependency, version) in observed {
                            graph.add_edge(dependency, self.id, version);
                        }
                    }
                    rt.untracked(|| catch_unwind(AssertUnwindSafe(|| (self.body)())))
                }
            }
        };

        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(effect = %self.id, runs, "effect ran");

        let result = match outcome {
            Ok(Ok(cleanup)) => {
                if self.subscriber.is_alive() {
                    *self.cleanup.lock() = cleanup;
                } else if let Some(cleanup) = cleanup {
                    // Disposed by its own body: teardown already happened.
                    cleanup.run();
                }
                Ok(())
            }
            Ok(Err(error)) => Err(ReactiveError::SubscriberException {
                kind: SubscriberKind::Effect,
                id: self.id,
                message: error.to_string(),
            }),
            Err(payload) => Err(ReactiveError::from_panic(payload, SubscriberKind::Effect, self.id)),
        };

        if self.subscriber.is_alive() {
            rt.after_run(self.id, result.is_err());
        }
        result
    }

    fn run_cleanup(&self) -> Result<()> {
        let cleanup = self.cleanup.lock().take();
        match cleanup {
            Some(cleanup) => catch_unwind(AssertUnwindSafe(move || cleanup.run()))
                .map_err(|payload| ReactiveError::from_panic(payload, SubscriberKind::Effect, self.id)),
            None => Ok(()),
        }
    }
}

impl Reactive for EffectInner {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Effect
    }

    fn version(&self) -> u64 {
        0
    }

    fn is_eager(&self) -> bool {
        true
    }

    fn update(&self, rt: &RuntimeInner) -> Result<bool> {
        if !self.subscriber.is_alive() {
            return Ok(false);
        }

        let state = rt.graph.lock().state(self.id);
        let stale = match state {
            None | Some(DirtyState::Clean) => false,
            Some(DirtyState::MaybeDirty) => rt.sources_changed(self.id)?,
            Some(DirtyState::Dirty) => true,
        };
        if !stale {
            rt.graph.lock().set_state(self.id, DirtyState::Clean);
            return Ok(false);
        }
        self.execute(rt).map(|()| true)
    }

    fn dispose(&self, rt: Option<&RuntimeInner>) {
        if !self.subscriber.kill() {
            return;
        }
        if let Some(rt) = rt {
            rt.unregister(self.id);
        }

        let result = self.run_cleanup();
        self.children.dispose_in(rt);

        if let Err(failure) = result {
            match rt {
                Some(rt) => rt.report(&failure, SubscriberKind::Effect, self.id),
                None => error!(error = %failure, "effect cleanup failed"),
            }
        }
        trace!(effect = %self.id, "disposed");
    }

    fn is_disposed(&self) -> bool {
        !self.subscriber.is_alive()
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("disposed", &self.is_disposed())
            .field("run_count", &self.run_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

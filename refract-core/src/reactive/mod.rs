//! Reactive Primitives
//!
//! This module implements the core reactive system: cells, derived values,
//! and effects. These primitives form the foundation of Refract's
//! fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state. When a cell's value is read
//! within a tracking frame (such as a derived computation or effect), the
//! read is recorded and the reader is subscribed to the cell. When the
//! cell's value changes, all dependents are notified.
//!
//! ## Derived Values
//!
//! A Derived is a value computed from other reactive values that caches its
//! result. It re-evaluates only when one of its dependencies actually
//! changed. Derived values are useful for expensive computations that should
//! not be repeated unnecessarily.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects are used to synchronize reactive state with
//! external systems, such as rendering or logging.
//!
//! ## Scopes
//!
//! Every node is owned by a [`Scope`]. Disposing the scope releases all of
//! its subscriptions and runs pending effect cleanups.
//!
//! # Implementation Notes
//!
//! The reactive system keeps an explicit tracker stack on the [`Runtime`].
//! Each derived or effect evaluation pushes a frame; reads land in the
//! topmost one. After the evaluation, the recorded set replaces the node's
//! previous dependencies, so conditional reads subscribe and unsubscribe as
//! the branches change.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

mod cell;
mod derived;
mod effect;
mod runtime;
mod scope;
mod subscriber;
mod tracker;

pub use cell::{Cell, CellOptions, Equality, Source};
pub use derived::{Derived, DerivedOptions};
pub use effect::{BoxError, Cleanup, Effect, EffectOutput};
pub use runtime::{ErrorHandler, Runtime};
pub use scope::Scope;
pub use subscriber::{Subscriber, SubscriberId, SubscriberKind};
pub use tracker::Tracked;

pub(crate) use runtime::Reactive;

//! Refract Core
//!
//! This crate provides a fine-grained reactive state engine. It implements:
//!
//! - Reactive primitives (cells, derived values, effects)
//! - Automatic dependency tracking with dynamic dependency sets
//! - Glitch-free, batched propagation through a dependency graph
//! - Ownership scopes with deterministic cleanup
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Core reactive primitives, the tracker and the runtime
//! - `graph`: Dependency graph, dirty states and the flush scheduler
//! - `config`: Runtime configuration
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use refract_core::Runtime;
//!
//! let rt = Runtime::new();
//!
//! // Create a cell
//! let count = rt.cell(0);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     rt.derived(move || count.read() * 2)
//! };
//!
//! // Create an effect
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let (count_clone, doubled_clone, log_clone) = (count.clone(), doubled.clone(), log.clone());
//! let _effect = rt.effect(move || {
//!     log_clone
//!         .lock()
//!         .unwrap()
//!         .push(format!("Count: {}, Doubled: {}", count_clone.read(), doubled_clone.read()));
//! });
//!
//! // Update the cell; the effect runs before `write` returns
//! count.write(5);
//! assert_eq!(log.lock().unwrap().last().unwrap(), "Count: 5, Doubled: 10");
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{DerivedPolicy, FlushMode, RuntimeConfig};
pub use error::{ReactiveError, Result};
pub use graph::{FlushReport, NodeId, Phase};
pub use reactive::{
    BoxError, Cell, CellOptions, Cleanup, Derived, DerivedOptions, Effect, EffectOutput, Equality,
    Runtime, Scope, Source, Subscriber, SubscriberId, SubscriberKind, Tracked,
};

//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between cells, derived computations and effects, plus the scheduler that
//! batches the updates flowing through it.
//!
//! # Overview
//!
//! The dependency graph is a directed graph where:
//!
//! - Nodes represent reactive values (cells) or computations (derived values, effects)
//! - Edges represent dependencies: if A depends on B, there is an edge from B to A
//!
//! When a cell changes, we traverse the graph to find all affected nodes and
//! mark them as dirty. The scheduler then queues them for the next flush.
//!
//! # Design Decisions
//!
//! 1. We use a centralized graph rather than distributed linked lists because:
//!    - It enables efficient topological ordering for batch updates
//!    - It gives teardown a single place to release every edge
//!    - It allows for global optimization of update scheduling
//!
//! 2. The graph is indexed by node ID for O(1) lookups.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod node;
mod scheduler;
mod topology;

pub use node::{DirtyState, Node, NodeId, NodeKind};
pub use scheduler::{FlushReport, Phase, Scheduler};
pub use topology::{DependencyDiff, Graph};

//! Graph Topology
//!
//! The graph owns every node and the edges between them. It determines
//! which nodes a change reaches and the order in which they must settle.
//!
//! # Algorithm
//!
//! 1. When a source node changes, mark its direct dependents "dirty"
//! 2. Propagate "maybe dirty" through derived nodes to their dependents
//! 3. Hand the affected nodes to the scheduler
//! 4. At flush time, sort derived nodes topologically (dependencies before
//!    dependents, registration order as the tie-break)
//!
//! Maybe-dirty nodes later compare the versions they observed against the
//! current ones, so an intermediate value that did not change stops the
//! propagation there.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::node::{DirtyState, Node, NodeId, NodeKind};
use crate::reactive::Reactive;

/// Result of replacing a node's dependency set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DependencyDiff {
    /// Dependencies that were not present before.
    pub added: Vec<NodeId>,
    /// Dependencies that are no longer read.
    pub removed: Vec<NodeId>,
}

impl DependencyDiff {
    /// True when the dependency set did not change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The dependency graph: nodes indexed by ID plus both edge directions.
#[derive(Debug, Default)]
pub struct Graph {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node, so nothing is left
    /// pointing at it.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;

        // Remove this node from its dependencies' dependent lists
        for dep_id in node.dependencies().keys() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
        }

        // Remove this node from its dependents' dependency lists
        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        Some(node)
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// Check whether a node is still registered.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Upgrade the primitive attached to a node.
    pub(crate) fn reactive(&self, node_id: NodeId) -> Option<Arc<dyn Reactive>> {
        self.nodes.get(&node_id).and_then(Node::reactive)
    }

    /// Kind of a node, if registered.
    pub fn kind(&self, node_id: NodeId) -> Option<NodeKind> {
        self.nodes.get(&node_id).map(Node::kind)
    }

    /// Dirty state of a node, if registered.
    pub fn state(&self, node_id: NodeId) -> Option<DirtyState> {
        self.nodes.get(&node_id).map(Node::dirty_state)
    }

    /// Move a node to the given dirty state. Maybe-dirty never downgrades a
    /// dirty node.
    pub fn set_state(&mut self, node_id: NodeId, state: DirtyState) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            match state {
                DirtyState::Clean => node.mark_clean(),
                DirtyState::MaybeDirty => node.mark_maybe_dirty(),
                DirtyState::Dirty => node.mark_dirty(),
            }
        }
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    ///
    /// Returns false if either end is not registered. Adding an existing
    /// edge refreshes its observed version and is otherwise a no-op.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId, observed_version: u64) -> bool {
        if !self.nodes.contains_key(&dependency) || !self.nodes.contains_key(&dependent) {
            return false;
        }
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency, observed_version);
        }
        true
    }

    /// Remove a dependency edge. Removing a missing edge is a no-op.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.remove_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.remove_dependency(dependency);
        }
    }

    /// Replace the dependency set of `dependent` with `observed`.
    ///
    /// Edges to nodes no longer read are removed and edges to newly read
    /// nodes are added; dependencies that are not registered (disposed
    /// mid-run) are skipped.
    pub fn set_dependencies(&mut self, dependent: NodeId, observed: &[(NodeId, u64)]) -> DependencyDiff {
        let Some(node) = self.nodes.get(&dependent) else {
            return DependencyDiff::default();
        };

        let previous: HashSet<NodeId> = node.dependencies().keys().copied().collect();
        let next: HashSet<NodeId> = observed.iter().map(|(id, _)| *id).collect();

        let mut diff = DependencyDiff::default();
        for old in node.dependencies().keys() {
            if !next.contains(old) {
                diff.removed.push(*old);
            }
        }
        for removed in &diff.removed {
            self.remove_edge(*removed, dependent);
        }

        if let Some(node) = self.nodes.get_mut(&dependent) {
            node.clear_dependencies();
        }
        for &(id, version) in observed {
            if self.add_edge(id, dependent, version) && !previous.contains(&id) {
                diff.added.push(id);
            }
        }

        diff
    }

    /// Snapshot of a node's dependencies and the versions it observed.
    pub fn observed(&self, node_id: NodeId) -> Vec<(NodeId, u64)> {
        self.nodes
            .get(&node_id)
            .map(|node| node.dependencies().iter().map(|(id, v)| (*id, *v)).collect())
            .unwrap_or_default()
    }

    /// Snapshot of a node's dependents.
    pub fn dependents(&self, node_id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node_id)
            .map(|node| node.dependents().to_vec())
            .unwrap_or_default()
    }

    /// Check whether anything currently reads this node.
    pub fn has_dependents(&self, node_id: NodeId) -> bool {
        self.nodes
            .get(&node_id)
            .is_some_and(|node| !node.dependents().is_empty())
    }

    /// Mark a source node as changed and propagate dirty flags.
    ///
    /// Direct dependents become dirty; nodes reached through a derived node
    /// become maybe-dirty. Returns every affected node in discovery order.
    pub fn mark_changed(&mut self, source_id: NodeId) -> Vec<NodeId> {
        let mut affected = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        // Start with the source node's direct dependents
        if let Some(source) = self.nodes.get(&source_id) {
            for dependent_id in source.dependents() {
                queue.push_back((*dependent_id, true));
            }
        }

        // BFS: direct dependents are queued first, so they are seen as dirty
        // before any transitive path can reach them.
        while let Some((node_id, direct)) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            if let Some(node) = self.nodes.get_mut(&node_id) {
                if direct {
                    node.mark_dirty();
                } else {
                    node.mark_maybe_dirty();
                }
                affected.push(node_id);

                if node.kind() == NodeKind::Derived {
                    for dependent_id in node.dependents() {
                        queue.push_back((*dependent_id, false));
                    }
                }
            }
        }

        affected
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents.
    /// Among nodes that are ready at the same time the lower ID goes first.
    /// Nodes caught in a cycle are appended at the end in ID order.
    pub fn topological_sort(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(node_set.len());
        let mut ready = BinaryHeap::new();

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in &node_set {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .keys()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    ready.push(Reverse(node_id));
                }
            }
        }

        // Kahn's algorithm
        while let Some(Reverse(node_id)) = ready.pop() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                for &dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        if *degree == 0 {
                            continue;
                        }
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(Reverse(dependent_id));
                        }
                    }
                }
            }
        }

        if result.len() < in_degree.len() {
            let placed: HashSet<_> = result.iter().copied().collect();
            let mut rest: Vec<_> = in_degree
                .keys()
                .copied()
                .filter(|id| !placed.contains(id))
                .collect();
            rest.sort();
            result.extend(rest);
        }

        result
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(graph: &mut Graph) -> (NodeId, NodeId, NodeId) {
        let source_id = graph.add_node(Node::source());
        let derived1_id = graph.add_node(Node::derived());
        let derived2_id = graph.add_node(Node::derived());

        graph.add_edge(source_id, derived1_id, 0);
        graph.add_edge(derived1_id, derived2_id, 0);
        graph.set_state(derived1_id, DirtyState::Clean);
        graph.set_state(derived2_id, DirtyState::Clean);

        (source_id, derived1_id, derived2_id)
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut graph = Graph::new();

        let id1 = graph.add_node(Node::source());
        let id2 = graph.add_node(Node::derived());
        graph.add_edge(id1, id2, 0);

        assert_eq!(graph.node_count(), 2);

        graph.remove_node(id1);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.get_node(id1).is_none());

        // The dangling edge is gone too.
        assert!(graph.get_node(id2).unwrap().dependencies().is_empty());
    }

    #[test]
    fn add_and_remove_edges() {
        let mut graph = Graph::new();

        let source_id = graph.add_node(Node::source());
        let derived_id = graph.add_node(Node::derived());

        assert!(graph.add_edge(source_id, derived_id, 0));
        assert!(graph.add_edge(source_id, derived_id, 0));

        assert_eq!(graph.dependents(source_id), vec![derived_id]);
        assert_eq!(graph.observed(derived_id), vec![(source_id, 0)]);

        graph.remove_edge(source_id, derived_id);
        graph.remove_edge(source_id, derived_id);

        assert!(graph.dependents(source_id).is_empty());
        assert!(graph.observed(derived_id).is_empty());
    }

    #[test]
    fn edges_to_unknown_nodes_are_rejected() {
        let mut graph = Graph::new();
        let derived_id = graph.add_node(Node::derived());

        assert!(!graph.add_edge(NodeId::new(), derived_id, 0));
        assert!(graph.observed(derived_id).is_empty());
    }

    #[test]
    fn set_dependencies_diffs_against_previous_run() {
        let mut graph = Graph::new();
        let a = graph.add_node(Node::source());
        let b = graph.add_node(Node::source());
        let c = graph.add_node(Node::source());
        let d = graph.add_node(Node::derived());

        let diff = graph.set_dependencies(d, &[(a, 1), (b, 1)]);
        assert_eq!(diff.added, vec![a, b]);
        assert!(diff.removed.is_empty());

        let diff = graph.set_dependencies(d, &[(b, 2), (c, 0)]);
        assert_eq!(diff.added, vec![c]);
        assert_eq!(diff.removed, vec![a]);

        assert!(graph.dependents(a).is_empty());
        assert_eq!(graph.dependents(b), vec![d]);
        assert_eq!(graph.observed(d), vec![(b, 2), (c, 0)]);

        assert!(graph.set_dependencies(d, &[(b, 2), (c, 0)]).is_empty());
    }

    #[test]
    fn mark_changed_propagates() {
        let mut graph = Graph::new();
        let (source_id, derived1_id, derived2_id) = chain(&mut graph);

        let affected = graph.mark_changed(source_id);

        assert_eq!(affected, vec![derived1_id, derived2_id]);
        assert_eq!(graph.state(derived1_id), Some(DirtyState::Dirty));
        assert_eq!(graph.state(derived2_id), Some(DirtyState::MaybeDirty));
    }

    #[test]
    fn mark_changed_does_not_propagate_through_effects() {
        let mut graph = Graph::new();
        let source = graph.add_node(Node::source());
        let effect = graph.add_node(Node::effect());
        let downstream = graph.add_node(Node::derived());
        graph.add_edge(source, effect, 0);
        graph.add_edge(effect, downstream, 0);
        graph.set_state(downstream, DirtyState::Clean);

        assert_eq!(graph.mark_changed(source), vec![effect]);
        assert_eq!(graph.state(downstream), Some(DirtyState::Clean));
    }

    #[test]
    fn topological_sort_orders_dependencies_first() {
        let mut graph = Graph::new();
        let (_, derived1_id, derived2_id) = chain(&mut graph);

        let order = graph.topological_sort(&[derived2_id, derived1_id]);
        assert_eq!(order, vec![derived1_id, derived2_id]);
    }

    #[test]
    fn topological_sort_breaks_ties_by_registration_order() {
        let mut graph = Graph::new();
        let source = graph.add_node(Node::source());
        let first = graph.add_node(Node::derived());
        let second = graph.add_node(Node::derived());
        let third = graph.add_node(Node::derived());
        for id in [third, first, second] {
            graph.add_edge(source, id, 0);
        }

        assert_eq!(graph.topological_sort(&[third, second, first]), vec![first, second, third]);
    }
}

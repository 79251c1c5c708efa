//! Host-side construction of the layered fan-out/fan-in task graph.
//!
//! The graph is a plain petgraph structure built without any accelerator
//! present. Backends compile it into a device plan in a single
//! [`Runtime::instantiate`](crate::runtime::Runtime::instantiate) step.

use std::hash::{Hash, Hasher};

use itertools::Itertools;
use petgraph::{
    Directed, Direction,
    stable_graph::StableGraph,
    visit::{EdgeRef, IntoEdgeReferences},
};
use rustc_hash::FxHasher;
use serde::Serialize;

use crate::{
    chunk::{Chunk, chunk},
    kernel::{Kernel, KernelOp, Task},
    params::Params,
};

pub use petgraph::stable_graph::NodeIndex;

/// A node of the task graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Node {
    /// No-op synchronization point. Barrier `i` closes epoch `i - 1` and
    /// opens epoch `i`.
    Barrier(usize),
    Task(TaskNode),
}

impl Node {
    pub fn as_task(&self) -> Option<&TaskNode> {
        match self {
            Self::Task(t) => Some(t),
            Self::Barrier(_) => None,
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, Self::Barrier(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskNode {
    pub epoch: usize,
    pub layer: usize,
    pub slot: usize,
    pub chunk: Chunk,
    pub task: Task,
}

pub type TaskGraphInner = StableGraph<Node, (), Directed>;

/// Shape of a graph stripped of arguments and geometry. Two graphs with equal
/// topologies can be swapped into the same instantiated plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    nodes: Vec<Option<KernelOp>>,
    edges: Vec<(usize, usize)>,
}

impl Topology {
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// A built task graph.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph: TaskGraphInner,
    barriers: Vec<NodeIndex>,
    params: Params,
}

impl TaskGraph {
    /// Build `params.epochs()` epochs of `params.kernels_per_slot()` layers,
    /// each layer `params.slots()` tasks wide, all running `kernel`.
    ///
    /// Layer 0 hangs off the trailing barrier, every later layer depends on
    /// every task of the layer before it, and a closing barrier joins the
    /// last layer. Nodes are only ever connected to nodes created before
    /// them, so the graph is acyclic and insertion order is a valid
    /// execution order.
    #[tracing::instrument(skip_all, fields(epochs = params.epochs(), slots = params.slots(), layers = params.kernels_per_slot()))]
    pub fn build(params: &Params, kernel: &Kernel) -> Self {
        let slots = params.slots();
        let n_tasks = params.tasks_per_epoch();
        let mut graph = TaskGraphInner::with_capacity(
            params.epochs() * n_tasks + params.epochs() + 1,
            Self::expected_edge_count(params),
        );

        let mut trailing = graph.add_node(Node::Barrier(0));
        let mut barriers = vec![trailing];
        for epoch in 0..params.epochs() {
            let mut previous: Vec<NodeIndex> = Vec::with_capacity(slots);
            for layer in 0..params.kernels_per_slot() {
                let current = (0..slots)
                    .map(|slot| {
                        let chunk = chunk(
                            slot + layer * slots,
                            n_tasks,
                            params.elements_per_kernel(),
                            params.total_elements(),
                        );
                        graph.add_node(Node::Task(TaskNode {
                            epoch,
                            layer,
                            slot,
                            chunk,
                            task: kernel.task(chunk, params.launch_width()),
                        }))
                    })
                    .collect_vec();
                for &node in &current {
                    if layer == 0 {
                        graph.add_edge(trailing, node, ());
                    } else {
                        for &producer in &previous {
                            graph.add_edge(producer, node, ());
                        }
                    }
                }
                previous = current;
            }
            trailing = graph.add_node(Node::Barrier(epoch + 1));
            for &producer in &previous {
                graph.add_edge(producer, trailing, ());
            }
            barriers.push(trailing);
        }

        tracing::debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "built task graph"
        );
        Self {
            graph,
            barriers,
            params: *params,
        }
    }

    /// Edges `build` creates for `params`.
    pub fn expected_edge_count(params: &Params) -> usize {
        let slots = params.slots();
        params.epochs() * (2 * slots + (params.kernels_per_slot() - 1) * slots * slots)
    }

    pub fn graph(&self) -> &TaskGraphInner {
        &self.graph
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn barriers(&self) -> &[NodeIndex] {
        &self.barriers
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers.len()
    }

    pub fn task_count(&self) -> usize {
        self.graph
            .node_indices()
            .filter(|&n| !self.graph[n].is_barrier())
            .count()
    }

    /// Task nodes in execution order.
    pub fn tasks(&self) -> impl Iterator<Item = (NodeIndex, &TaskNode)> {
        self.graph
            .node_indices()
            .filter_map(|n| self.graph[n].as_task().map(|t| (n, t)))
    }

    pub fn node(&self, node: NodeIndex) -> &Node {
        &self.graph[node]
    }

    /// Producers `node` waits on, in creation order.
    pub fn predecessors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| e.source())
            .sorted()
            .collect()
    }

    /// Consumers waiting on `node`, in creation order.
    pub fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| e.target())
            .sorted()
            .collect()
    }

    /// Nodes in an order where every producer precedes its consumers.
    pub fn execution_order(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    pub fn topology(&self) -> Topology {
        Topology {
            nodes: self
                .graph
                .node_indices()
                .map(|n| self.graph[n].as_task().map(|t| t.task.op))
                .collect(),
            edges: self
                .graph
                .edge_references()
                .map(|e| (e.source().index(), e.target().index()))
                .sorted()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BufferId;
    use petgraph::algo::is_cyclic_directed;
    use proptest::prelude::*;

    fn build(epochs: usize, slots: usize, layers: usize, total: usize) -> TaskGraph {
        let params = Params::new(epochs, slots, layers, 1, total, 32).unwrap();
        TaskGraph::build(&params, &Kernel::newton(BufferId(0), total))
    }

    #[test]
    fn two_epochs_two_slots() {
        let g = build(2, 2, 1, 8);
        assert_eq!(g.barrier_count(), 3);
        assert_eq!(g.task_count(), 4);
        assert!(g.tasks().all(|(_, t)| t.chunk.width == 4));

        let [b0, b1, b2] = g.barriers() else {
            panic!("expected three barriers")
        };
        for (n, t) in g.tasks() {
            let (before, after) = if t.epoch == 0 { (*b0, *b1) } else { (*b1, *b2) };
            assert_eq!(g.predecessors(n), vec![before]);
            assert_eq!(g.successors(n), vec![after]);
        }
        assert!(g.predecessors(*b0).is_empty());
        assert!(g.successors(*b2).is_empty());
    }

    #[test]
    fn barrier_list_matches_barrier_nodes() {
        let g = build(3, 2, 2, 64);
        let barriers = g
            .execution_order()
            .into_iter()
            .filter(|&n| g.node(n).is_barrier())
            .collect_vec();
        assert_eq!(barriers, g.barriers());
        assert_eq!(g.task_count() + barriers.len(), g.node_count());
        assert!(g.tasks().all(|(n, _)| !g.node(n).is_barrier()));
    }

    #[test]
    fn layers_are_fully_connected() {
        let g = build(1, 3, 3, 90);
        let layer = |l: usize| {
            g.tasks()
                .filter(|(_, t)| t.layer == l)
                .map(|(n, _)| n)
                .collect_vec()
        };
        for l in 1..3 {
            let prev = layer(l - 1);
            for n in layer(l) {
                assert_eq!(g.predecessors(n), prev);
            }
        }
        assert_eq!(g.predecessors(g.barriers()[1]), layer(2));
    }

    #[test]
    fn chunks_follow_layer_major_indexing() {
        let g = build(1, 2, 2, 10);
        let chunks = g
            .tasks()
            .map(|(_, t)| (t.layer, t.slot, t.chunk.offset, t.chunk.width))
            .collect_vec();
        assert_eq!(
            chunks,
            vec![(0, 0, 0, 2), (0, 1, 2, 2), (1, 0, 4, 2), (1, 1, 6, 4)]
        );
    }

    #[test]
    fn zero_epochs_is_a_lone_barrier() {
        let g = build(0, 4, 4, 64);
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn rebuild_has_identical_topology() {
        let a = build(3, 4, 2, 1000);
        let b = build(3, 4, 2, 1000);
        assert_eq!(a.topology(), b.topology());
        assert_eq!(a.topology().fingerprint(), b.topology().fingerprint());
        assert_ne!(a.topology(), build(2, 4, 2, 1000).topology());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn shape_counts(epochs in 0usize..5, slots in 1usize..6, layers in 1usize..5, total in 1usize..500) {
            let g = build(epochs, slots, layers, total);
            prop_assert_eq!(g.task_count(), epochs * slots * layers);
            prop_assert_eq!(g.barrier_count(), epochs + 1);
            prop_assert_eq!(g.edge_count(), TaskGraph::expected_edge_count(g.params()));
            prop_assert_eq!(
                g.edge_count(),
                epochs * (slots + (layers - 1) * slots * slots + slots)
            );
        }

        #[test]
        fn edges_only_point_forward(epochs in 1usize..4, slots in 1usize..5, layers in 1usize..4) {
            let g = build(epochs, slots, layers, 256);
            prop_assert!(!is_cyclic_directed(g.graph()));
            for e in g.graph().edge_references() {
                prop_assert!(e.source().index() < e.target().index());
                if let (Some(a), Some(b)) = (g.node(e.source()).as_task(), g.node(e.target()).as_task()) {
                    prop_assert!((a.epoch, a.layer) < (b.epoch, b.layer));
                }
            }
        }

        #[test]
        fn every_epoch_covers_the_buffer(epochs in 1usize..3, slots in 1usize..5, layers in 1usize..4, total in 1usize..300) {
            let g = build(epochs, slots, layers, total);
            for epoch in 0..epochs {
                let mut covered = vec![0u8; total];
                for (_, t) in g.tasks().filter(|(_, t)| t.epoch == epoch) {
                    for c in &mut covered[t.chunk.offset..t.chunk.end()] {
                        *c += 1;
                    }
                }
                prop_assert!(covered.iter().all(|&c| c == 1));
            }
        }
    }
}

//! Slice graph: the partitioned form of the stream graph
//!
//! A slice is a non-branching pipeline of filters between a join (input
//! node) and a split (output node); it is the atomic scheduling and
//! placement unit. Slices, nodes, and edges live in arenas indexed by stable
//! integer IDs, so back-references are plain ID lookups and nothing aliases.
//!
//! Fan-in and fan-out can only occur at input/output nodes: the node type
//! itself enforces that interior filter nodes have exactly one predecessor
//! and successor.

use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::graph::{ElementType, FilterId, StreamGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SliceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EdgeId(pub u32);

impl std::fmt::Display for SliceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slice{}", self.0)
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "edge{}", self.0)
    }
}

/// Execution stage a size or item count refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulingPhase {
    Init,
    Steady,
}

impl std::fmt::Display for SchedulingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingPhase::Init => write!(f, "init"),
            SchedulingPhase::Steady => write!(f, "steady"),
        }
    }
}

/// Joining endpoint of a slice; the only place incoming edges may fan in
#[derive(Debug, Clone, Serialize)]
pub struct InputNode {
    pub slice: SliceId,
    /// Incoming edges with their round-robin weights
    pub sources: Vec<(EdgeId, u32)>,
}

impl InputNode {
    pub fn total_weight(&self) -> u64 {
        self.sources.iter().map(|(_, w)| *w as u64).sum()
    }

    pub fn weight_of(&self, edge: EdgeId) -> Option<u32> {
        self.sources.iter().find(|(e, _)| *e == edge).map(|(_, w)| *w)
    }

    pub fn single_source(&self) -> bool {
        self.sources.len() == 1
    }
}

/// Splitting endpoint of a slice; the only place outgoing edges may fan out
#[derive(Debug, Clone, Serialize)]
pub struct OutputNode {
    pub slice: SliceId,
    /// Outgoing edges with their round-robin weights
    pub dests: Vec<(EdgeId, u32)>,
}

impl OutputNode {
    pub fn total_weight(&self) -> u64 {
        self.dests.iter().map(|(_, w)| *w as u64).sum()
    }

    pub fn weight_of(&self, edge: EdgeId) -> Option<u32> {
        self.dests.iter().find(|(e, _)| *e == edge).map(|(_, w)| *w)
    }

    pub fn single_dest(&self) -> bool {
        self.dests.len() == 1
    }
}

/// Interior pipeline stage of a slice
#[derive(Debug, Clone, Serialize)]
pub struct FilterNode {
    pub slice: SliceId,
    pub filter: FilterId,
}

/// Closed set of node kinds; matched exhaustively at every consumer site
#[derive(Debug, Clone, Serialize)]
pub enum SliceNode {
    Input(InputNode),
    Filter(FilterNode),
    Output(OutputNode),
}

impl SliceNode {
    pub fn slice(&self) -> SliceId {
        match self {
            SliceNode::Input(n) => n.slice,
            SliceNode::Filter(n) => n.slice,
            SliceNode::Output(n) => n.slice,
        }
    }

    pub fn as_input(&self) -> Option<&InputNode> {
        match self {
            SliceNode::Input(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<&OutputNode> {
        match self {
            SliceNode::Output(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> Option<&FilterNode> {
        match self {
            SliceNode::Filter(n) => Some(n),
            _ => None,
        }
    }
}

/// Directed link between one slice's output node and another's input node
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
    pub element: ElementType,
}

/// One slice: input node, ordered filter chain, output node
#[derive(Debug, Clone, Serialize)]
pub struct Slice {
    pub head: NodeId,
    pub filters: Vec<NodeId>,
    pub tail: NodeId,
}

/// The partitioned graph: arena of slices, nodes, and edges
#[derive(Debug, Clone, Serialize)]
pub struct SliceGraph {
    pub(crate) slices: Vec<Slice>,
    pub(crate) nodes: Vec<SliceNode>,
    pub(crate) edges: Vec<Edge>,
    /// Max per-firing work among each slice's filters
    pub(crate) bottleneck: Vec<u64>,
}

impl SliceGraph {
    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn slice_ids(&self) -> impl Iterator<Item = SliceId> {
        (0..self.slices.len() as u32).map(SliceId)
    }

    pub fn slice(&self, id: SliceId) -> &Slice {
        &self.slices[id.0 as usize]
    }

    pub fn node(&self, id: NodeId) -> &SliceNode {
        &self.nodes[id.0 as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> {
        (0..self.edges.len() as u32).map(EdgeId)
    }

    pub fn input(&self, id: NodeId) -> &InputNode {
        match &self.nodes[id.0 as usize] {
            SliceNode::Input(n) => n,
            other => panic!("node {:?} is not an input node: {:?}", id, other),
        }
    }

    pub fn output(&self, id: NodeId) -> &OutputNode {
        match &self.nodes[id.0 as usize] {
            SliceNode::Output(n) => n,
            other => panic!("node {:?} is not an output node: {:?}", id, other),
        }
    }

    pub fn filter_node(&self, id: NodeId) -> &FilterNode {
        match &self.nodes[id.0 as usize] {
            SliceNode::Filter(n) => n,
            other => panic!("node {:?} is not a filter node: {:?}", id, other),
        }
    }

    pub fn first_filter(&self, slice: SliceId) -> NodeId {
        self.slices[slice.0 as usize].filters[0]
    }

    pub fn last_filter(&self, slice: SliceId) -> NodeId {
        *self.slices[slice.0 as usize]
            .filters
            .last()
            .expect("slice has no filters")
    }

    pub fn bottleneck_work(&self, slice: SliceId) -> u64 {
        self.bottleneck[slice.0 as usize]
    }

    /// True if this slice holds a file reader/writer
    pub fn is_boundary(&self, slice: SliceId, graph: &StreamGraph) -> bool {
        let node = self.filter_node(self.first_filter(slice));
        graph.filter(node.filter).is_boundary()
    }

    /// Human-readable slice name, the filter chain joined with `|`
    pub fn slice_name(&self, slice: SliceId, graph: &StreamGraph) -> String {
        self.slices[slice.0 as usize]
            .filters
            .iter()
            .map(|n| graph.filter(self.filter_node(*n).filter).name.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Upstream slices this slice consumes from, deduplicated
    pub fn dependencies(&self, slice: SliceId) -> Vec<SliceId> {
        let head = self.input(self.slice(slice).head);
        let mut deps = Vec::new();
        for (edge, _) in &head.sources {
            let src_slice = self.node(self.edge(*edge).src).slice();
            if !deps.contains(&src_slice) {
                deps.push(src_slice);
            }
        }
        deps
    }

    /// Downstream slices this slice produces for, deduplicated
    pub fn successors(&self, slice: SliceId) -> Vec<SliceId> {
        let tail = self.output(self.slice(slice).tail);
        let mut succs = Vec::new();
        for (edge, _) in &tail.dests {
            let dst_slice = self.node(self.edge(*edge).dst).slice();
            if !succs.contains(&dst_slice) {
                succs.push(dst_slice);
            }
        }
        succs
    }

    fn producer_filter(&self, edge: EdgeId) -> FilterId {
        let out = self.output(self.edge(edge).src);
        self.filter_node(self.last_filter(out.slice)).filter
    }

    fn consumer_filter(&self, edge: EdgeId) -> FilterId {
        let inp = self.input(self.edge(edge).dst);
        self.filter_node(self.first_filter(inp.slice)).filter
    }

    fn weight_share(
        &self,
        total_items: u64,
        weight: u32,
        total_weight: u64,
        edge: EdgeId,
        phase: SchedulingPhase,
    ) -> CompileResult<u64> {
        if total_weight == 0 {
            return Ok(0);
        }
        let numer = total_items * weight as u64;
        if numer % total_weight != 0 {
            return Err(CompileError::invariant(format!(
                "{edge}: {total_items} items do not divide evenly over weight \
                 {weight}/{total_weight} in the {phase} stage"
            )));
        }
        Ok(numer / total_weight)
    }

    /// Items that traverse `edge` in the given stage, computed from both the
    /// producer and consumer sides; a mismatch is a hard graph error.
    pub fn edge_items(
        &self,
        graph: &StreamGraph,
        edge: EdgeId,
        phase: SchedulingPhase,
    ) -> CompileResult<u64> {
        let e = self.edge(edge);
        let out = self.output(e.src);
        let inp = self.input(e.dst);
        let producer = graph.filter(self.producer_filter(edge));
        let consumer = graph.filter(self.consumer_filter(edge));

        let (sent_total, recv_total) = match phase {
            SchedulingPhase::Init => {
                (producer.init_items_sent(), consumer.init_items_received())
            }
            SchedulingPhase::Steady => {
                (producer.steady_items_sent(), consumer.steady_items_received())
            }
        };

        let out_weight = out.weight_of(edge).ok_or_else(|| {
            CompileError::invariant(format!("{edge} missing from its source output node"))
        })?;
        let in_weight = inp.weight_of(edge).ok_or_else(|| {
            CompileError::invariant(format!("{edge} missing from its dest input node"))
        })?;

        let sent = self.weight_share(sent_total, out_weight, out.total_weight(), edge, phase)?;
        let received = self.weight_share(recv_total, in_weight, inp.total_weight(), edge, phase)?;

        if sent != received {
            return Err(CompileError::invariant(format!(
                "{edge} ({} -> {}): {sent} items sent != {received} items received \
                 in the {phase} stage",
                producer.name, consumer.name
            )));
        }
        Ok(sent)
    }

    /// Check producer/consumer conservation on every edge for both stages
    pub fn check_conservation(&self, graph: &StreamGraph) -> CompileResult<()> {
        for edge in self.edge_ids() {
            self.edge_items(graph, edge, SchedulingPhase::Init)?;
            self.edge_items(graph, edge, SchedulingPhase::Steady)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::MeshConfig;
    use crate::graph::FilterSpec;
    use crate::partition::Partitioner;
    use crate::CompilerOptions;

    fn two_slice_graph(push: u32, pop: u32) -> (StreamGraph, SliceGraph) {
        let mut b = StreamGraph::builder();
        let mut a = FilterSpec::new("a", 0, push, 10);
        a.boundary = Some(crate::graph::BoundaryKind::FileReader);
        let a = b.add_filter(a).unwrap();
        let c = b.add_filter(FilterSpec::new("c", pop, 0, 10)).unwrap();
        b.connect(a, c).unwrap();
        let graph = b.build().unwrap();
        let chip = MeshConfig::default_4x4();
        let slices = Partitioner::new(&graph, &chip, &CompilerOptions::default())
            .partition()
            .unwrap();
        (graph, slices)
    }

    #[test]
    fn test_edge_items_conserved() {
        let (graph, slices) = two_slice_graph(3, 3);
        let edge = EdgeId(0);
        assert_eq!(
            slices.edge_items(&graph, edge, SchedulingPhase::Steady).unwrap(),
            3
        );
        assert_eq!(
            slices.edge_items(&graph, edge, SchedulingPhase::Init).unwrap(),
            0
        );
        slices.check_conservation(&graph).unwrap();
    }

    #[test]
    fn test_edge_items_mismatch_is_fatal() {
        let (graph, slices) = two_slice_graph(3, 2);
        let err = slices
            .edge_items(&graph, EdgeId(0), SchedulingPhase::Steady)
            .unwrap_err();
        assert!(matches!(err, CompileError::GraphInvariant { .. }));
    }

    #[test]
    fn test_dependencies() {
        let (_, slices) = two_slice_graph(1, 1);
        assert_eq!(slices.num_slices(), 2);
        assert_eq!(slices.dependencies(SliceId(1)), vec![SliceId(0)]);
        assert_eq!(slices.successors(SliceId(0)), vec![SliceId(1)]);
        assert!(slices.dependencies(SliceId(0)).is_empty());
    }
}

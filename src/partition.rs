//! Greedy partitioning of the flat stream graph into slices
//!
//! Walks the graph breadth-first from its roots and grows each slice
//! downstream while the chain stays non-branching and the neighboring
//! filters are balanced enough to share a pipeline. File readers and
//! writers always get singleton slices, as do linear filters.

use std::collections::{HashMap, VecDeque};

use crate::chip::MeshConfig;
use crate::error::{CompileError, CompileResult};
use crate::graph::{FilterId, StreamGraph};
use crate::slice::{
    Edge, EdgeId, FilterNode, InputNode, NodeId, OutputNode, Slice, SliceGraph, SliceId, SliceNode,
};
use crate::CompilerOptions;

pub struct Partitioner<'a> {
    graph: &'a StreamGraph,
    chip: &'a MeshConfig,
    options: &'a CompilerOptions,
}

impl<'a> Partitioner<'a> {
    pub fn new(graph: &'a StreamGraph, chip: &'a MeshConfig, options: &'a CompilerOptions) -> Self {
        Partitioner { graph, chip, options }
    }

    /// Partition the stream graph into a slice graph
    pub fn partition(&self) -> CompileResult<SliceGraph> {
        if self.graph.is_empty() {
            return Err(CompileError::invariant("stream graph has no filters"));
        }
        let chains = self.form_chains();
        self.assemble(chains)
    }

    /// Grow filter chains breadth-first from the graph roots. Filters not
    /// reachable from any root (only possible in a cyclic graph) still get
    /// chains, in declaration order; the scheduler rejects the cycle later
    /// with a better message than we could give here.
    fn form_chains(&self) -> Vec<Vec<FilterId>> {
        let mut visited = vec![false; self.graph.len()];
        let mut chains = Vec::new();
        let mut worklist: VecDeque<FilterId> = self.graph.roots().into();

        loop {
            while let Some(start) = worklist.pop_front() {
                if visited[start.0 as usize] {
                    continue;
                }
                visited[start.0 as usize] = true;
                let mut chain = vec![start];
                let mut bottleneck = self.weighted_work(start);
                while let Some(next) =
                    self.chain_next(*chain.last().unwrap(), bottleneck, chain.len(), &visited)
                {
                    visited[next.0 as usize] = true;
                    bottleneck = bottleneck.max(self.weighted_work(next));
                    chain.push(next);
                }
                for (succ, _) in self.graph.successors(*chain.last().unwrap()) {
                    worklist.push_back(*succ);
                }
                chains.push(chain);
            }
            match self.graph.filter_ids().find(|f| !visited[f.0 as usize]) {
                Some(f) => worklist.push_back(f),
                None => break,
            }
        }
        chains
    }

    /// The filter the chain ending in `cur` may absorb, if any.
    /// `chain_work` is the running bottleneck of the whole chain so far.
    fn chain_next(
        &self,
        cur: FilterId,
        chain_work: u64,
        chain_len: usize,
        visited: &[bool],
    ) -> Option<FilterId> {
        let succs = self.graph.successors(cur);
        if succs.len() != 1 {
            return None;
        }
        let next = succs[0].0;
        if visited[next.0 as usize] || self.graph.predecessors(next).len() != 1 {
            return None;
        }
        if chain_len >= self.chip.total_tiles() {
            return None;
        }
        let a = self.graph.filter(cur);
        let b = self.graph.filter(next);
        if a.is_boundary() || b.is_boundary() || a.linear || b.linear {
            return None;
        }
        // a slice runs at the pace of its slowest filter, so the candidate
        // is measured against the bottleneck of everything fused so far,
        // not just its immediate predecessor
        let wb = self.weighted_work(next);
        let (min, max) = (chain_work.min(wb), chain_work.max(wb));
        if max == 0 || (min as f64 / max as f64) < self.options.slice_threshold {
            return None;
        }
        Some(next)
    }

    /// Per-iteration work of one filter: per-firing estimate times firings
    fn weighted_work(&self, f: FilterId) -> u64 {
        let spec = self.graph.filter(f);
        spec.work * spec.steady_mult as u64
    }

    /// Turn chains into the slice/node/edge arenas
    fn assemble(&self, chains: Vec<Vec<FilterId>>) -> CompileResult<SliceGraph> {
        let mut slice_of = vec![SliceId(0); self.graph.len()];
        for (i, chain) in chains.iter().enumerate() {
            for f in chain {
                slice_of[f.0 as usize] = SliceId(i as u32);
            }
        }

        let mut nodes: Vec<SliceNode> = Vec::new();
        let mut slices: Vec<Slice> = Vec::new();
        let mut bottleneck: Vec<u64> = Vec::new();
        for (i, chain) in chains.iter().enumerate() {
            let slice = SliceId(i as u32);
            let head = NodeId(nodes.len() as u32);
            nodes.push(SliceNode::Input(InputNode { slice, sources: Vec::new() }));
            let mut filters = Vec::with_capacity(chain.len());
            for f in chain {
                filters.push(NodeId(nodes.len() as u32));
                nodes.push(SliceNode::Filter(FilterNode { slice, filter: *f }));
            }
            let tail = NodeId(nodes.len() as u32);
            nodes.push(SliceNode::Output(OutputNode { slice, dests: Vec::new() }));
            slices.push(Slice { head, filters, tail });
            bottleneck.push(chain.iter().map(|f| self.weighted_work(*f)).max().unwrap_or(0));
        }

        // edges fan out from each slice tail, then get matched back up at
        // the consuming heads in round-robin order
        let mut edges: Vec<Edge> = Vec::new();
        let mut pending: HashMap<(FilterId, FilterId), VecDeque<EdgeId>> = HashMap::new();
        for (i, chain) in chains.iter().enumerate() {
            let last = *chain.last().unwrap();
            let tail = slices[i].tail;
            for (succ, weight) in self.graph.successors(last) {
                if slice_of[succ.0 as usize] == SliceId(i as u32) {
                    // only interior chain links stay inside a slice, and those
                    // never leave the last filter; this is a feedback edge
                    return Err(CompileError::unsupported(format!(
                        "feedback edge {} -> {} closes a loop inside one slice",
                        self.graph.filter(last).name,
                        self.graph.filter(*succ).name
                    )));
                }
                let dst_head = slices[slice_of[succ.0 as usize].0 as usize].head;
                let edge = EdgeId(edges.len() as u32);
                edges.push(Edge {
                    src: tail,
                    dst: dst_head,
                    element: self.graph.filter(last).element,
                });
                match &mut nodes[tail.0 as usize] {
                    SliceNode::Output(out) => out.dests.push((edge, *weight)),
                    _ => unreachable!(),
                }
                pending.entry((last, *succ)).or_default().push_back(edge);
            }
        }
        for (i, chain) in chains.iter().enumerate() {
            let first = chain[0];
            let head = slices[i].head;
            for (pred, weight) in self.graph.predecessors(first) {
                if slice_of[pred.0 as usize] == SliceId(i as u32) {
                    continue;
                }
                let edge = pending
                    .get_mut(&(*pred, first))
                    .and_then(|q| q.pop_front())
                    .ok_or_else(|| {
                        CompileError::invariant(format!(
                            "no edge recorded for connection {} -> {}",
                            self.graph.filter(*pred).name,
                            self.graph.filter(first).name
                        ))
                    })?;
                match &mut nodes[head.0 as usize] {
                    SliceNode::Input(inp) => inp.sources.push((edge, *weight)),
                    _ => unreachable!(),
                }
            }
        }
        if pending.values().any(|q| !q.is_empty()) {
            return Err(CompileError::invariant(
                "edge fan-out and fan-in lists disagree after partitioning",
            ));
        }

        Ok(SliceGraph { slices, nodes, edges, bottleneck })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FilterSpec;

    fn compile_chains(graph: &StreamGraph) -> SliceGraph {
        let chip = MeshConfig::default_4x4();
        let options = CompilerOptions::default();
        Partitioner::new(graph, &chip, &options).partition().unwrap()
    }

    #[test]
    fn test_balanced_pipeline_fuses() {
        let mut b = StreamGraph::builder();
        let r = b.add_filter(FilterSpec::file_reader("src", 1)).unwrap();
        let a = b.add_filter(FilterSpec::new("a", 1, 1, 10)).unwrap();
        let c = b.add_filter(FilterSpec::new("b", 1, 1, 12)).unwrap();
        let w = b.add_filter(FilterSpec::file_writer("sink", 1)).unwrap();
        b.connect(r, a).unwrap();
        b.connect(a, c).unwrap();
        b.connect(c, w).unwrap();
        let g = b.build().unwrap();
        let slices = compile_chains(&g);
        // reader, fused a|b, writer
        assert_eq!(slices.num_slices(), 3);
        assert_eq!(slices.slice_name(crate::slice::SliceId(1), &g), "a|b");
        assert_eq!(slices.bottleneck_work(crate::slice::SliceId(1)), 12);
    }

    #[test]
    fn test_unbalanced_pipeline_splits() {
        let mut b = StreamGraph::builder();
        let a = b.add_filter(FilterSpec::new("a", 0, 1, 100)).unwrap();
        let c = b.add_filter(FilterSpec::new("b", 1, 0, 1)).unwrap();
        b.connect(a, c).unwrap();
        let g = b.build().unwrap();
        // 1/100 is far below the default threshold
        assert_eq!(compile_chains(&g).num_slices(), 2);
    }

    #[test]
    fn test_split_join_topology() {
        let mut b = StreamGraph::builder();
        let s = b.add_filter(FilterSpec::new("split", 0, 2, 10)).unwrap();
        let x = b.add_filter(FilterSpec::new("x", 1, 1, 10)).unwrap();
        let y = b.add_filter(FilterSpec::new("y", 1, 1, 10)).unwrap();
        let j = b.add_filter(FilterSpec::new("join", 2, 0, 10)).unwrap();
        b.connect_weighted(s, x, 1).unwrap();
        b.connect_weighted(s, y, 1).unwrap();
        b.connect_weighted(x, j, 1).unwrap();
        b.connect_weighted(y, j, 1).unwrap();
        let g = b.build().unwrap();
        let slices = compile_chains(&g);
        assert_eq!(slices.num_slices(), 4);
        let split = crate::slice::SliceId(0);
        let tail = slices.output(slices.slice(split).tail);
        assert_eq!(tail.dests.len(), 2);
        // the join slice fans in from both branches
        let join_id = slices
            .slice_ids()
            .find(|s| slices.slice_name(*s, &g) == "join")
            .unwrap();
        assert_eq!(slices.input(slices.slice(join_id).head).sources.len(), 2);
        assert_eq!(slices.dependencies(join_id).len(), 2);
    }

    #[test]
    fn test_fusion_tracks_chain_bottleneck() {
        let mut b = StreamGraph::builder();
        let a = b.add_filter(FilterSpec::new("a", 0, 1, 100)).unwrap();
        let c = b.add_filter(FilterSpec::new("b", 1, 1, 50)).unwrap();
        let d = b.add_filter(FilterSpec::new("c", 1, 0, 40)).unwrap();
        b.connect(a, c).unwrap();
        b.connect(c, d).unwrap();
        let g = b.build().unwrap();
        let chip = MeshConfig::default_4x4();
        let options = CompilerOptions { slice_threshold: 0.5, ..Default::default() };
        let slices = Partitioner::new(&g, &chip, &options).partition().unwrap();
        // b joins a (50/100 = 0.5), but c is measured against the chain's
        // bottleneck of 100, not b's 50, and 40/100 falls short
        assert_eq!(slices.num_slices(), 2);
        assert_eq!(slices.slice_name(crate::slice::SliceId(0), &g), "a|b");
        assert_eq!(slices.slice_name(crate::slice::SliceId(1), &g), "c");
    }

    #[test]
    fn test_linear_filter_stays_alone() {
        let mut b = StreamGraph::builder();
        let a = b.add_filter(FilterSpec::new("a", 0, 1, 10)).unwrap();
        let mut fir = FilterSpec::new("fir", 1, 1, 10);
        fir.linear = true;
        let f = b.add_filter(fir).unwrap();
        let c = b.add_filter(FilterSpec::new("c", 1, 0, 10)).unwrap();
        b.connect(a, f).unwrap();
        b.connect(f, c).unwrap();
        let g = b.build().unwrap();
        assert_eq!(compile_chains(&g).num_slices(), 3);
    }

    #[test]
    fn test_chain_capped_by_tile_count() {
        let mut b = StreamGraph::builder();
        let chip = MeshConfig::new(2, 1, 8, 8);
        let mut prev = b.add_filter(FilterSpec::new("f0", 0, 1, 10)).unwrap();
        for i in 1..4 {
            let f = b
                .add_filter(FilterSpec::new(format!("f{i}"), 1, 1, 10))
                .unwrap();
            b.connect(prev, f).unwrap();
            prev = f;
        }
        let sink = b.add_filter(FilterSpec::new("f4", 1, 0, 10)).unwrap();
        b.connect(prev, sink).unwrap();
        let g = b.build().unwrap();
        let options = CompilerOptions::default();
        let slices = Partitioner::new(&g, &chip, &options).partition().unwrap();
        // 5 filters on a 2-tile chip: no slice longer than 2
        assert!(slices
            .slice_ids()
            .all(|s| slices.slice(s).filters.len() <= 2));
        assert_eq!(slices.num_slices(), 3);
    }
}

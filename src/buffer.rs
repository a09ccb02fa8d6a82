//! DRAM-backed stream buffers
//!
//! Every slice endpoint and every inter-slice edge conceptually owns a
//! buffer, but most of them are redundant: when an output node does not
//! split, its outgoing edge can read straight from the producer's buffer,
//! and when an input node does not join, the consumer can read straight
//! from the edge. Redundant buffers are kept in the pool with a pointer to
//! their non-redundant stand-in so that lookups stay uniform; only
//! non-redundant buffers get DRAM ports and bytes.
//!
//! All sizes are rounded up to whole cache lines so that DRAM transfers
//! never straddle an alignment boundary.

use serde::Serialize;

use crate::chip::{MeshConfig, PortId, WORD_BYTES};
use crate::error::{CompileError, CompileResult};
use crate::graph::{ElementType, StreamGraph};
use crate::schedule::Layout;
use crate::slice::{EdgeId, SchedulingPhase, SliceGraph, SliceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub u32);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// What a buffer sits between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferKind {
    /// Between two slices, carrying one edge's share of the split
    Inter(EdgeId),
    /// Between a slice's input node and its first filter
    Head(SliceId),
    /// Between a slice's last filter and its output node
    Tail(SliceId),
}

#[derive(Debug, Clone, Serialize)]
pub struct Buffer {
    pub id: BufferId,
    pub kind: BufferKind,
    pub element: ElementType,
    /// Items crossing this buffer during the whole init stage
    pub init_items: u64,
    /// Items crossing this buffer per steady iteration
    pub steady_items: u64,
    /// Aligned bytes moved during the whole init stage
    pub init_bytes: u64,
    /// Aligned bytes moved per steady iteration
    pub steady_bytes: u64,
    /// Capacity in words, cache-line aligned; covers the larger stage plus
    /// any peek-ahead the consumer keeps live
    pub capacity_words: u64,
    pub size_bytes: u64,
    /// DRAM port backing this buffer; `None` exactly when redundant
    pub port: Option<PortId>,
    /// The buffer actually holding the data; `id` itself when non-redundant
    pub canonical: BufferId,
}

impl Buffer {
    pub fn is_redundant(&self) -> bool {
        self.canonical != self.id
    }

    /// Words transferred in the given stage, before alignment
    pub fn stage_words(&self, phase: SchedulingPhase) -> u64 {
        let items = match phase {
            SchedulingPhase::Init => self.init_items,
            SchedulingPhase::Steady => self.steady_items,
        };
        items * self.element.words() as u64
    }
}

impl std::fmt::Display for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            BufferKind::Inter(e) => write!(f, "{}[{}]", self.id, e),
            BufferKind::Head(s) => write!(f, "{}[head {}]", self.id, s),
            BufferKind::Tail(s) => write!(f, "{}[tail {}]", self.id, s),
        }
    }
}

/// All buffers of a compiled program, memoized by endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
    edge_index: Vec<Option<BufferId>>,
    head_index: Vec<Option<BufferId>>,
    tail_index: Vec<Option<BufferId>>,
}

impl BufferPool {
    /// Create and size every buffer the slice graph needs. Tail buffers come
    /// first so that the redundancy chains of edges and heads can resolve to
    /// already-built buffers.
    pub fn build(
        graph: &StreamGraph,
        slices: &SliceGraph,
        chip: &MeshConfig,
        layout: &Layout,
    ) -> CompileResult<BufferPool> {
        let mut pool = BufferPool {
            buffers: Vec::new(),
            edge_index: vec![None; slices.edge_ids().count()],
            head_index: vec![None; slices.num_slices()],
            tail_index: vec![None; slices.num_slices()],
        };

        for slice in slices.slice_ids() {
            let tail = slices.output(slices.slice(slice).tail);
            if tail.dests.is_empty() {
                continue;
            }
            let last = slices.filter_node(slices.last_filter(slice));
            let spec = graph.filter(last.filter);
            let tile = layout.tile_of_checked(slices.last_filter(slice), slices, graph)?;
            let id = pool.push(
                BufferKind::Tail(slice),
                spec.element,
                spec.init_items_sent(),
                spec.steady_items_sent(),
                0,
                Some(chip.port_near(tile)),
                None,
                chip,
            );
            pool.tail_index[slice.0 as usize] = Some(id);
        }

        for edge_id in slices.edge_ids() {
            let edge = slices.edge(edge_id);
            let src = slices.output(edge.src);
            let init = slices.edge_items(graph, edge_id, SchedulingPhase::Init)?;
            let steady = slices.edge_items(graph, edge_id, SchedulingPhase::Steady)?;
            let (port, canonical) = if src.single_dest() {
                // no split: the edge carries everything the producer wrote,
                // so it reads straight out of the tail buffer
                (None, pool.tail_index[src.slice.0 as usize])
            } else {
                let tile =
                    layout.tile_of_checked(slices.last_filter(src.slice), slices, graph)?;
                (Some(chip.port_near(tile)), None)
            };
            let id = pool.push(
                BufferKind::Inter(edge_id),
                edge.element,
                init,
                steady,
                0,
                port,
                canonical,
                chip,
            );
            pool.edge_index[edge_id.0 as usize] = Some(id);
        }

        for slice in slices.slice_ids() {
            let head = slices.input(slices.slice(slice).head);
            if head.sources.is_empty() {
                continue;
            }
            let first = slices.filter_node(slices.first_filter(slice));
            let spec = graph.filter(first.filter);
            let (port, canonical) = if head.single_source() {
                // no join: read straight from the single incoming edge
                let edge_buf = pool.edge_index[head.sources[0].0 .0 as usize];
                (None, edge_buf)
            } else {
                let tile =
                    layout.tile_of_checked(slices.first_filter(slice), slices, graph)?;
                (Some(chip.port_near(tile)), None)
            };
            let id = pool.push(
                BufferKind::Head(slice),
                spec.element,
                spec.init_items_received(),
                spec.steady_items_received(),
                spec.peek_ahead() as u64 * spec.element.words() as u64,
                port,
                canonical,
                chip,
            );
            pool.head_index[slice.0 as usize] = Some(id);
        }

        Ok(pool)
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        kind: BufferKind,
        element: ElementType,
        init_items: u64,
        steady_items: u64,
        extra_words: u64,
        port: Option<PortId>,
        canonical: Option<BufferId>,
        chip: &MeshConfig,
    ) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        let canonical = match canonical {
            // a redundant buffer stands in for whatever its target stands for
            Some(target) => self.buffers[target.0 as usize].canonical,
            None => id,
        };
        let words = element.words() as u64;
        let live = init_items.max(steady_items) * words + extra_words;
        let capacity_words = chip.align_words(live);
        self.buffers.push(Buffer {
            id,
            kind,
            element,
            init_items,
            steady_items,
            init_bytes: chip.aligned_bytes(init_items * words),
            steady_bytes: chip.aligned_bytes(steady_items * words),
            capacity_words,
            size_bytes: capacity_words * WORD_BYTES,
            port,
            canonical,
        });
        id
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0 as usize]
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    pub fn edge_buffer(&self, edge: EdgeId) -> &Buffer {
        self.buffer(self.edge_index[edge.0 as usize].expect("edge buffers are always built"))
    }

    pub fn head_buffer(&self, slice: SliceId) -> Option<&Buffer> {
        self.head_index[slice.0 as usize].map(|id| self.buffer(id))
    }

    pub fn tail_buffer(&self, slice: SliceId) -> Option<&Buffer> {
        self.tail_index[slice.0 as usize].map(|id| self.buffer(id))
    }

    /// The buffer that actually holds `id`'s data
    pub fn non_redundant(&self, id: BufferId) -> &Buffer {
        self.buffer(self.buffer(id).canonical)
    }

    /// DRAM port of the storage backing `id`
    pub fn port_of(&self, id: BufferId) -> CompileResult<PortId> {
        let backing = self.non_redundant(id);
        backing.port.ok_or_else(|| {
            CompileError::unassigned(format!("{backing} has no DRAM port"))
        })
    }

    /// Total DRAM bytes reserved; redundant buffers contribute nothing
    pub fn total_bytes(&self) -> u64 {
        self.buffers
            .iter()
            .filter(|b| !b.is_redundant())
            .map(|b| b.size_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FilterSpec;
    use crate::partition::Partitioner;
    use crate::CompilerOptions;

    fn build_pool(graph: &StreamGraph) -> (SliceGraph, BufferPool) {
        let chip = MeshConfig::default_4x4();
        let options = CompilerOptions::default();
        let slices = Partitioner::new(graph, &chip, &options).partition().unwrap();
        let layout = Layout::row_major(&slices, &chip).unwrap();
        let pool = BufferPool::build(graph, &slices, &chip, &layout).unwrap();
        (slices, pool)
    }

    fn pipeline() -> StreamGraph {
        let mut b = StreamGraph::builder();
        let r = b.add_filter(FilterSpec::file_reader("src", 2)).unwrap();
        let a = b.add_filter(FilterSpec::new("a", 2, 2, 100)).unwrap();
        let w = b.add_filter(FilterSpec::file_writer("sink", 2)).unwrap();
        b.connect(r, a).unwrap();
        b.connect(a, w).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_pipeline_redundancy_chain() {
        let (slices, pool) = build_pool(&pipeline());
        let a = SliceId(1);
        // no split upstream, no join here: head -> edge -> upstream tail
        let head = pool.head_buffer(a).unwrap();
        assert!(head.is_redundant());
        let backing = pool.non_redundant(head.id);
        assert_eq!(backing.kind, BufferKind::Tail(SliceId(0)));
        assert!(!backing.is_redundant());
        assert!(pool.port_of(head.id).is_ok());
        // only one real buffer per inter-slice hop
        let real = pool.buffers().filter(|b| !b.is_redundant()).count();
        assert_eq!(real, 2);
        let _ = slices;
    }

    #[test]
    fn test_split_makes_edges_real() {
        let mut b = StreamGraph::builder();
        let s = b.add_filter(FilterSpec::new("split", 0, 2, 10)).unwrap();
        let x = b.add_filter(FilterSpec::new("x", 1, 0, 10)).unwrap();
        let y = b.add_filter(FilterSpec::new("y", 1, 0, 10)).unwrap();
        b.connect(s, x).unwrap();
        b.connect(s, y).unwrap();
        let g = b.build().unwrap();
        let (slices, pool) = build_pool(&g);
        for edge in slices.edge_ids() {
            let buf = pool.edge_buffer(edge);
            assert!(!buf.is_redundant());
            assert!(buf.port.is_some());
            assert_eq!(buf.steady_items, 1);
        }
    }

    #[test]
    fn test_capacity_is_cache_line_aligned() {
        let (_, pool) = build_pool(&pipeline());
        for buf in pool.buffers() {
            assert_eq!(buf.capacity_words % 8, 0);
            assert_eq!(buf.init_bytes % 32, 0);
            assert_eq!(buf.steady_bytes % 32, 0);
            assert_eq!(buf.size_bytes, buf.capacity_words * WORD_BYTES);
        }
        // 2 items of one word round up to a full 8-word line, 32 bytes each
        assert_eq!(pool.total_bytes(), 64);
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let (slices, pool) = build_pool(&pipeline());
        for edge in slices.edge_ids() {
            let a = pool.edge_buffer(edge);
            let b = pool.edge_buffer(edge);
            assert_eq!(a.id, b.id);
            assert_eq!(a.size_bytes, b.size_bytes);
        }
        for slice in slices.slice_ids() {
            assert_eq!(
                pool.head_buffer(slice).map(|b| b.id),
                pool.head_buffer(slice).map(|b| b.id)
            );
        }
    }

    #[test]
    fn test_peek_ahead_grows_head_buffer() {
        let mut b = StreamGraph::builder();
        let s = b.add_filter(FilterSpec::new("a", 0, 1, 10)).unwrap();
        let j = b.add_filter(FilterSpec::new("b", 0, 1, 10)).unwrap();
        let mut fir = FilterSpec::new("fir", 2, 0, 10);
        fir.peek = 16;
        let f = b.add_filter(fir).unwrap();
        b.connect(s, f).unwrap();
        b.connect(j, f).unwrap();
        let g = b.build().unwrap();
        let (slices, pool) = build_pool(&g);
        let fir_slice = slices
            .slice_ids()
            .find(|s| slices.slice_name(*s, &g) == "fir")
            .unwrap();
        let head = pool.head_buffer(fir_slice).unwrap();
        // joined input: the head buffer is real and holds the peek window
        assert!(!head.is_redundant());
        assert!(head.capacity_words >= 14);
    }
}

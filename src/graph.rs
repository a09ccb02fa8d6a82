//! Stream graph model: filters, rates, and weighted connectivity
//!
//! The front end hands the backend a flat graph of filters with known
//! peek/pop/push rates, firing multiplicities, and work estimates. Everything
//! here is immutable once [`StreamGraphBuilder::build`] has run; later stages
//! only query it.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

/// Identifier of a filter in the flat stream graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(pub u32);

impl std::fmt::Display for FilterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Element type flowing over a stream, with a fixed word size per item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Int,
    Float,
    /// Fixed-length aggregate, e.g. a small array pushed as one item
    Vector(u32),
}

impl ElementType {
    /// Number of words that must be routed for one item of this type
    pub fn words(&self) -> u32 {
        match self {
            ElementType::Int | ElementType::Float => 1,
            ElementType::Vector(n) => *n,
        }
    }
}

/// File-I/O boundary kinds; boundary filters always live in their own slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryKind {
    FileReader,
    FileWriter,
}

/// Rates for the one-time pre-work firing of a two-phase filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreWork {
    pub peek: u32,
    pub pop: u32,
    pub push: u32,
}

/// A filter as seen by the backend: rates, multiplicities, and a work estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    /// Steady-state rates per firing
    pub peek: u32,
    pub pop: u32,
    pub push: u32,
    /// Rates for the first firing of a two-phase filter, if any
    pub prework: Option<PreWork>,
    /// Firing count during the initialization stage
    pub init_mult: u32,
    /// Firing count per steady-state iteration
    pub steady_mult: u32,
    /// Per-firing work estimate
    pub work: u64,
    pub element: ElementType,
    pub boundary: Option<BoundaryKind>,
    /// Linear-transform filter; cannot be fused into a longer slice
    pub linear: bool,
}

impl FilterSpec {
    /// A plain single-phase filter with the given steady rates
    pub fn new(name: impl Into<String>, pop: u32, push: u32, work: u64) -> Self {
        FilterSpec {
            name: name.into(),
            peek: pop,
            pop,
            push,
            prework: None,
            init_mult: 0,
            steady_mult: 1,
            work,
            element: ElementType::Int,
            boundary: None,
            linear: false,
        }
    }

    /// A file reader producing `push` items per firing
    pub fn file_reader(name: impl Into<String>, push: u32) -> Self {
        let mut f = FilterSpec::new(name, 0, push, 0);
        f.peek = 0;
        f.boundary = Some(BoundaryKind::FileReader);
        f
    }

    /// A file writer consuming `pop` items per firing
    pub fn file_writer(name: impl Into<String>, pop: u32) -> Self {
        let mut f = FilterSpec::new(name, pop, 0, 0);
        f.boundary = Some(BoundaryKind::FileWriter);
        f
    }

    pub fn is_boundary(&self) -> bool {
        self.boundary.is_some()
    }

    pub fn is_two_stage(&self) -> bool {
        self.prework.is_some()
    }

    /// Items this filter pushes during the whole initialization stage.
    /// Only the very first firing uses the pre-work rates.
    pub fn init_items_sent(&self) -> u64 {
        if self.init_mult == 0 {
            return 0;
        }
        match self.prework {
            Some(pre) => pre.push as u64 + self.push as u64 * (self.init_mult as u64 - 1),
            None => self.push as u64 * self.init_mult as u64,
        }
    }

    /// Items this filter pops during the whole initialization stage
    pub fn init_items_received(&self) -> u64 {
        if self.init_mult == 0 {
            return 0;
        }
        match self.prework {
            Some(pre) => pre.pop as u64 + self.pop as u64 * (self.init_mult as u64 - 1),
            None => self.pop as u64 * self.init_mult as u64,
        }
    }

    /// Items pushed per steady-state iteration
    pub fn steady_items_sent(&self) -> u64 {
        self.push as u64 * self.steady_mult as u64
    }

    /// Items popped per steady-state iteration
    pub fn steady_items_received(&self) -> u64 {
        self.pop as u64 * self.steady_mult as u64
    }

    /// How many items the filter reads ahead of what it consumes; the input
    /// buffer must hold these beyond the popped items.
    pub fn peek_ahead(&self) -> u32 {
        let steady = self.peek.saturating_sub(self.pop);
        let pre = self
            .prework
            .map(|p| p.peek.saturating_sub(p.pop))
            .unwrap_or(0);
        steady.max(pre)
    }

    /// Items needed on the input tape before firing number `firing` of the
    /// given stage can run
    pub fn items_needed_to_fire(&self, firing: u32, init: bool) -> u32 {
        if init && firing == 0 {
            match self.prework {
                Some(pre) => pre.peek,
                None => self.peek,
            }
        } else {
            self.pop
        }
    }

    /// Items produced by firing number `firing` of the given stage
    pub fn items_fired(&self, firing: u32, init: bool) -> u32 {
        if init && firing == 0 {
            if let Some(pre) = self.prework {
                return pre.push;
            }
        }
        self.push
    }
}

/// The flat, immutable stream graph handed to the partitioner
#[derive(Debug, Clone)]
pub struct StreamGraph {
    filters: Vec<FilterSpec>,
    /// Weighted round-robin fan-out per filter, in declaration order
    outputs: Vec<Vec<(FilterId, u32)>>,
    /// Weighted round-robin fan-in per filter, in declaration order
    inputs: Vec<Vec<(FilterId, u32)>>,
}

impl StreamGraph {
    pub fn builder() -> StreamGraphBuilder {
        StreamGraphBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filter(&self, id: FilterId) -> &FilterSpec {
        &self.filters[id.0 as usize]
    }

    pub fn filter_ids(&self) -> impl Iterator<Item = FilterId> {
        (0..self.filters.len() as u32).map(FilterId)
    }

    pub fn find(&self, name: &str) -> Option<FilterId> {
        self.filters
            .iter()
            .position(|f| f.name == name)
            .map(|i| FilterId(i as u32))
    }

    /// Weighted successors of `id`, in round-robin order
    pub fn successors(&self, id: FilterId) -> &[(FilterId, u32)] {
        &self.outputs[id.0 as usize]
    }

    /// Weighted predecessors of `id`, in round-robin order
    pub fn predecessors(&self, id: FilterId) -> &[(FilterId, u32)] {
        &self.inputs[id.0 as usize]
    }

    pub fn total_out_weight(&self, id: FilterId) -> u64 {
        self.outputs[id.0 as usize].iter().map(|(_, w)| *w as u64).sum()
    }

    pub fn total_in_weight(&self, id: FilterId) -> u64 {
        self.inputs[id.0 as usize].iter().map(|(_, w)| *w as u64).sum()
    }

    /// Filters with no incoming arcs; partitioning starts here
    pub fn roots(&self) -> Vec<FilterId> {
        self.filter_ids()
            .filter(|id| self.inputs[id.0 as usize].is_empty())
            .collect()
    }
}

/// Builds a [`StreamGraph`], validating names, endpoints, and weights
pub struct StreamGraphBuilder {
    filters: Vec<FilterSpec>,
    connections: Vec<(FilterId, FilterId, u32)>,
}

impl StreamGraphBuilder {
    pub fn new() -> Self {
        StreamGraphBuilder {
            filters: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn add_filter(&mut self, spec: FilterSpec) -> CompileResult<FilterId> {
        if self.filters.iter().any(|f| f.name == spec.name) {
            return Err(CompileError::invariant(format!(
                "duplicate filter name '{}'",
                spec.name
            )));
        }
        if spec.prework.is_some() && spec.init_mult == 0 {
            return Err(CompileError::invariant(format!(
                "filter '{}' declares pre-work but never fires in the init stage",
                spec.name
            )));
        }
        let id = FilterId(self.filters.len() as u32);
        self.filters.push(spec);
        Ok(id)
    }

    /// Connect `src -> dst` with weight 1
    pub fn connect(&mut self, src: FilterId, dst: FilterId) -> CompileResult<()> {
        self.connect_weighted(src, dst, 1)
    }

    pub fn connect_weighted(
        &mut self,
        src: FilterId,
        dst: FilterId,
        weight: u32,
    ) -> CompileResult<()> {
        if src.0 as usize >= self.filters.len() || dst.0 as usize >= self.filters.len() {
            return Err(CompileError::invariant(format!(
                "connection {src} -> {dst} references an unknown filter"
            )));
        }
        if weight == 0 {
            return Err(CompileError::invariant(format!(
                "connection {} -> {} has zero weight",
                self.filters[src.0 as usize].name, self.filters[dst.0 as usize].name
            )));
        }
        self.connections.push((src, dst, weight));
        Ok(())
    }

    pub fn build(self) -> CompileResult<StreamGraph> {
        let n = self.filters.len();
        let mut outputs = vec![Vec::new(); n];
        let mut inputs = vec![Vec::new(); n];
        for (src, dst, weight) in &self.connections {
            outputs[src.0 as usize].push((*dst, *weight));
            inputs[dst.0 as usize].push((*src, *weight));
        }
        // element types must agree across each connection
        for (src, dst, _) in &self.connections {
            let s = &self.filters[src.0 as usize];
            let d = &self.filters[dst.0 as usize];
            if s.element != d.element {
                return Err(CompileError::invariant(format!(
                    "element type mismatch on {} -> {}",
                    s.name, d.name
                )));
            }
        }
        // a producer with nowhere to send breaks conservation downstream;
        // boundary filters and fully disconnected graphs are exempt
        for (i, f) in self.filters.iter().enumerate() {
            if f.push > 0
                && outputs[i].is_empty()
                && f.boundary.is_none()
                && f.steady_mult > 0
                && !self.connections.is_empty()
            {
                return Err(CompileError::invariant(format!(
                    "filter '{}' pushes items but has no outgoing connection",
                    f.name
                )));
            }
        }
        Ok(StreamGraph {
            filters: self.filters,
            outputs,
            inputs,
        })
    }
}

impl Default for StreamGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Stream-to-Mesh Backend
//!
//! This library is the backend of a stream compiler: it takes a synchronous
//! dataflow graph of rate-annotated filters and maps it onto a tiled mesh
//! chip with per-tile routers and streaming-DRAM ports on the perimeter.
//! Compilation partitions the graph into slices, sizes every DRAM-backed
//! buffer, builds the three-stage execution schedule, and generates the
//! per-tile switch code that moves every word of data.
//!
//! # Example
//!
//! ```rust
//! use stream_to_mesh::{compile_source, CompilerOptions, MeshConfig};
//!
//! let chip = MeshConfig::default_4x4();
//! let plan = compile_source(
//!     "filter src { file_reader push 2 }
//!      filter scale { pop 2 push 2 work 100 }
//!      filter out { file_writer pop 2 }
//!      src -> scale; scale -> out;",
//!     &chip,
//!     &CompilerOptions::default(),
//! )
//! .unwrap();
//! println!("{}", plan.program.summary());
//! ```

pub mod buffer;
pub mod chip;
pub mod error;
pub mod graph;
pub mod lexer;
pub mod parser;
pub mod partition;
pub mod router;
pub mod schedule;
pub mod slice;

pub use buffer::{Buffer, BufferId, BufferKind, BufferPool};
pub use chip::{Endpoint, MeshConfig, PortId, Side, TileId};
pub use error::{CompileError, CompileResult};
pub use graph::{BoundaryKind, ElementType, FilterId, FilterSpec, PreWork, StreamGraph};
pub use parser::parse_graph;
pub use partition::Partitioner;
pub use router::{Link, RouterProgram, SwitchCodeStore, SwitchIns};
pub use schedule::{Layout, Schedule};
pub use slice::{EdgeId, NodeId, SchedulingPhase, SliceGraph, SliceId};

use serde::Serialize;

/// Backend tunables. Both thresholds come from the hardware team's tuning
/// runs and have no derivation; they stay configurable.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Minimum work ratio between chain-adjacent filters fused into a slice
    pub slice_threshold: f64,
    /// Repetition count at which switch code switches to a hardware loop
    pub loop_threshold: u64,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions { slice_threshold: 0.33, loop_threshold: 8 }
    }
}

/// Everything the backend produces for one program
#[derive(Debug, Clone, Serialize)]
pub struct CompiledPlan {
    pub slices: SliceGraph,
    pub buffers: BufferPool,
    pub schedule: Schedule,
    pub program: RouterProgram,
}

impl CompiledPlan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Run the whole backend: partition, size buffers, schedule, and generate
/// switch code
pub fn compile(
    graph: &StreamGraph,
    chip: &MeshConfig,
    layout: &Layout,
    options: &CompilerOptions,
) -> CompileResult<CompiledPlan> {
    let slices = Partitioner::new(graph, chip, options).partition()?;
    compile_slices(graph, slices, chip, layout, options)
}

/// Parse a graph description, place it row-major, and compile it
pub fn compile_source(
    source: &str,
    chip: &MeshConfig,
    options: &CompilerOptions,
) -> CompileResult<CompiledPlan> {
    let graph = parse_graph(source)?;
    let slices = Partitioner::new(&graph, chip, options).partition()?;
    let layout = Layout::row_major(&slices, chip)?;
    compile_slices(&graph, slices, chip, &layout, options)
}

/// Backend stages downstream of partitioning
fn compile_slices(
    graph: &StreamGraph,
    slices: SliceGraph,
    chip: &MeshConfig,
    layout: &Layout,
    options: &CompilerOptions,
) -> CompileResult<CompiledPlan> {
    slices.check_conservation(graph)?;

    let buffers = BufferPool::build(graph, &slices, chip, layout)?;
    let schedule = Schedule::build(graph, &slices, chip, layout)?;
    let program =
        RouterProgram::generate(graph, &slices, chip, layout, &schedule, &buffers, options)?;

    Ok(CompiledPlan { slices, buffers, schedule, program })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile_str(source: &str, chip: &MeshConfig) -> CompileResult<CompiledPlan> {
        compile_source(source, chip, &CompilerOptions::default())
    }

    #[test]
    fn test_uniform_chain_is_one_slice() {
        let chip = MeshConfig::default_4x4();
        let plan = compile_str(
            "filter a { pop 0 push 1 work 10 }
             filter b { pop 1 push 1 work 10 }
             filter c { pop 1 push 0 work 10 }
             a -> b; b -> c;",
            &chip,
        )
        .unwrap();
        assert_eq!(plan.slices.num_slices(), 1);
        assert_eq!(plan.slices.slice(SliceId(0)).filters.len(), 3);
    }

    #[test]
    fn test_unbalanced_chain_splits() {
        let chip = MeshConfig::default_4x4();
        let options = CompilerOptions { slice_threshold: 0.5, ..Default::default() };
        let plan = compile_source(
            "filter a { pop 0 push 1 work 10 }
             filter b { pop 1 push 1 work 1 }
             filter c { pop 1 push 0 work 10 }
             a -> b; b -> c;",
            &chip,
            &options,
        )
        .unwrap();
        // 1/10 < 0.5 on both sides of b
        assert_eq!(plan.slices.num_slices(), 3);
    }

    #[test]
    fn test_split_join_makes_singleton_slices() {
        let chip = MeshConfig::default_4x4();
        let plan = compile_str(
            "filter a { pop 0 push 2 work 10 }
             filter b { pop 1 push 1 work 10 }
             filter c { pop 1 push 1 work 10 }
             filter d { pop 2 push 0 work 10 }
             a -> b; a -> c; b -> d; c -> d;",
            &chip,
        )
        .unwrap();
        assert_eq!(plan.slices.num_slices(), 4);
        for slice in plan.slices.slice_ids() {
            assert_eq!(plan.slices.slice(slice).filters.len(), 1);
        }
    }

    #[test]
    fn test_inter_buffer_rounds_to_alignment() {
        // 16-byte alignment unit: 3 one-word items round 12 bytes up to 16
        let chip = MeshConfig::new(4, 4, 4, 8);
        let plan = compile_str(
            "filter a { pop 0 push 3 work 100 }
             filter b { pop 3 push 0 work 1 }
             a -> b;",
            &chip,
        )
        .unwrap();
        assert_eq!(plan.slices.num_slices(), 2);
        let buf = plan.buffers.edge_buffer(EdgeId(0));
        assert_eq!(buf.steady_items, 3);
        assert_eq!(plan.buffers.non_redundant(buf.id).steady_bytes, 16);
    }

    #[test]
    fn test_two_slice_cycle_is_unsupported() {
        let chip = MeshConfig::default_4x4();
        let err = compile_str(
            "filter a { pop 1 push 1 work 100 }
             filter b { pop 1 push 1 work 1 }
             a -> b; b -> a;",
            &chip,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedTopology { .. }));
    }

    #[test]
    fn test_source_and_graph_entry_points_agree() {
        let chip = MeshConfig::default_4x4();
        let options = CompilerOptions::default();
        let source = "filter src { file_reader push 2 }
             filter a { pop 2 push 2 work 100 }
             filter out { file_writer pop 2 }
             src -> a; a -> out;";
        let from_source = compile_source(source, &chip, &options).unwrap();
        let graph = parse_graph(source).unwrap();
        let slices = Partitioner::new(&graph, &chip, &options).partition().unwrap();
        let layout = Layout::row_major(&slices, &chip).unwrap();
        let from_graph = compile(&graph, &chip, &layout, &options).unwrap();
        assert_eq!(from_source.to_json().unwrap(), from_graph.to_json().unwrap());
    }

    #[test]
    fn test_plan_serializes() {
        let chip = MeshConfig::default_4x4();
        let plan = compile_str(
            "filter src { file_reader push 1 }
             filter a { pop 1 push 1 work 10 }
             filter out { file_writer pop 1 }
             src -> a; a -> out;",
            &chip,
        )
        .unwrap();
        let json = plan.to_json().unwrap();
        assert!(json.contains("\"steady\""));
        assert!(json.contains("\"tiles\""));
    }

    #[test]
    fn test_split_join_program_moves_every_item() {
        let chip = MeshConfig::default_4x4();
        let plan = compile_str(
            "filter src { file_reader push 2 }
             filter up { pop 1 push 1 work 10 }
             filter down { pop 1 push 1 work 10 }
             filter out { file_writer pop 2 }
             src -> up; src -> down; up -> out; down -> out;",
            &chip,
        )
        .unwrap();
        // the join at 'out' pulls from two real edge buffers
        let out = plan
            .slices
            .slice_ids()
            .find(|s| plan.slices.slice(*s).filters.len() == 1)
            .unwrap();
        let _ = out;
        let real = plan.buffers.buffers().filter(|b| !b.is_redundant()).count();
        assert!(real >= 2);
        assert!(plan.program.total_instructions() > 0);
        assert_eq!(plan.schedule.pipeline_depth(), 2);
    }
}

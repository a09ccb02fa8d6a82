//! Example: Straight Pipeline
//!
//! Compiles a file-to-file pipeline of two compute filters and prints the
//! schedule and the per-tile switch code the backend generates.
//!
//! Run with: cargo run --example pipeline

use stream_to_mesh::{compile_source, CompilerOptions, MeshConfig, SliceId};

fn main() {
    println!("=== Straight Pipeline Example ===\n");

    let chip = MeshConfig::default_4x4();
    let source = "
        filter src    { file_reader push 8 }
        filter scale  { pop 8 push 8 work 120 }
        filter clamp  { pop 8 push 8 work 100 }
        filter out    { file_writer pop 8 }
        src -> scale; scale -> clamp; clamp -> out;
    ";

    let plan = compile_source(source, &chip, &CompilerOptions::default()).unwrap();

    println!("Slices:");
    for slice in plan.slices.slice_ids() {
        println!(
            "  {}: bottleneck work {}",
            slice,
            plan.slices.bottleneck_work(slice)
        );
    }
    println!();

    // scale and clamp are balanced (100/120 > 0.33), so they fuse
    assert_eq!(plan.slices.slice(SliceId(1)).filters.len(), 2);

    println!(
        "Ramp-up: {} waves, steady period {} time units",
        plan.schedule.ramp_up.len(),
        plan.schedule.steady_period()
    );
    println!("DRAM reserved: {} bytes", plan.buffers.total_bytes());
    println!();
    println!("{}", plan.program.summary());
    println!();
    print!("{}", plan.program);
}

//! Example: Split-Join
//!
//! A weighted 2-way round-robin split and rejoin. Shows how the backend
//! gives each branch its own slice, backs the split edges with real DRAM
//! buffers, and interleaves the join reads by weight.
//!
//! Run with: cargo run --example split_join

use stream_to_mesh::{compile_source, CompilerOptions, MeshConfig};

fn main() {
    println!("=== Split-Join Example ===\n");

    let chip = MeshConfig::default_4x4();
    // 'lo' takes 1 of every 3 items, 'hi' the other 2
    let source = "
        filter src { file_reader push 3 }
        filter lo  { pop 1 push 1 work 50 }
        filter hi  { pop 2 push 2 work 90 }
        filter out { file_writer pop 3 }
        src -> lo weight 1; src -> hi weight 2;
        lo -> out weight 1; hi -> out weight 2;
    ";

    let plan = compile_source(source, &chip, &CompilerOptions::default()).unwrap();

    println!("Buffers:");
    for buf in plan.buffers.buffers() {
        if buf.is_redundant() {
            println!("  {} -> redirected to {}", buf, plan.buffers.non_redundant(buf.id).id);
        } else {
            println!("  {}: {} bytes", buf, buf.size_bytes);
        }
    }
    println!();

    println!("Ramp-up waves:");
    for (i, wave) in plan.schedule.ramp_up.iter().enumerate() {
        println!("  wave {}: {} slice(s)", i, wave.len());
    }
    println!();
    println!("{}", plan.program.summary());
}

//! Stream-to-Mesh Backend CLI
//!
//! Usage:
//!   stream2mesh "filter src { file_reader push 1 } ..." --mesh 4x4
//!   stream2mesh -f pipeline.graph --threshold 0.5
//!   stream2mesh -f pipeline.graph --json

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read};

use stream_to_mesh::{
    compile, parse_graph, BufferPool, CompiledPlan, CompilerOptions, Layout, MeshConfig,
    Partitioner, RouterProgram, Schedule, StreamGraph,
};

#[derive(ClapParser, Debug)]
#[command(name = "stream2mesh")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Schedules stream graphs onto a tiled mesh and emits switch code")]
struct Args {
    /// Graph description to compile
    #[arg(value_name = "GRAPH")]
    graph: Option<String>,

    /// Read the graph description from a file
    #[arg(short = 'f', long = "file")]
    input_file: Option<String>,

    /// Mesh dimensions (e.g., "4x4")
    #[arg(short = 'm', long = "mesh", default_value = "4x4", value_parser = parse_mesh)]
    mesh: (u16, u16),

    /// Load-balance threshold for fusing filters into one slice
    #[arg(short = 't', long = "threshold", default_value = "0.33")]
    threshold: f64,

    /// Repetition count at which switch code uses a hardware loop
    #[arg(short = 'l', long = "loop-threshold", default_value = "8")]
    loop_threshold: u64,

    /// Cache line size in words
    #[arg(short = 'c', long = "cache-line", default_value = "8")]
    cache_line: u32,

    /// Outstanding DRAM commands per port
    #[arg(short = 'q', long = "dram-queue", default_value = "8")]
    dram_queue: u32,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output (full per-tile switch code)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_mesh(s: &str) -> Result<(u16, u16), String> {
    let dims: Vec<&str> = s.split('x').collect();
    if dims.len() != 2 {
        return Err(format!("Invalid mesh format: {}", s));
    }
    let width = dims[0]
        .parse::<u16>()
        .map_err(|_| format!("Invalid mesh width: {}", dims[0]))?;
    let height = dims[1]
        .parse::<u16>()
        .map_err(|_| format!("Invalid mesh height: {}", dims[1]))?;
    if width == 0 || height == 0 {
        return Err(format!("Mesh must have at least one tile: {}", s));
    }
    Ok((width, height))
}

fn main() {
    let args = Args::parse();

    let source = if let Some(expr) = args.graph {
        expr
    } else if let Some(file) = args.input_file {
        fs::read_to_string(&file).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read file '{}': {}", "Error".red(), file, e);
            std::process::exit(1);
        })
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
            std::process::exit(1);
        });
        buffer
    };

    let chip = MeshConfig::new(args.mesh.0, args.mesh.1, args.cache_line, args.dram_queue);
    let options = CompilerOptions {
        slice_threshold: args.threshold,
        loop_threshold: args.loop_threshold,
    };

    if args.verbose {
        println!("{}", "Stream-to-Mesh Backend".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!(
            "{}: {}x{} tiles, {}-word cache lines, {} DRAM commands per port",
            "Target".green(),
            chip.width,
            chip.height,
            chip.cache_line_words,
            chip.dram_queue_size
        );
        println!();
    }

    let graph = match parse_graph(&source) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{}: {}", "Parse error".red(), e);
            std::process::exit(1);
        }
    };

    let slices = match Partitioner::new(&graph, &chip, &options).partition() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", "Partitioning error".red(), e);
            std::process::exit(1);
        }
    };

    let layout = match Layout::row_major(&slices, &chip) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}: {}", "Layout error".red(), e);
            std::process::exit(1);
        }
    };

    let plan = match compile(&graph, &chip, &layout, &options) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", "Compilation error".red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match plan.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_plan(&graph, &plan, args.verbose);
    }
}

fn print_plan(graph: &StreamGraph, plan: &CompiledPlan, verbose: bool) {
    println!("{}", "Compilation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    print_slices(graph, plan);
    print_schedule(graph, plan);
    print_buffers(&plan.buffers);
    print_program(&plan.program, verbose);
}

fn print_slices(graph: &StreamGraph, plan: &CompiledPlan) {
    println!("{}: {}", "Slices".cyan(), plan.slices.num_slices());
    for slice in plan.slices.slice_ids() {
        println!(
            "  {} = {} (bottleneck work {})",
            slice,
            plan.slices.slice_name(slice, graph),
            plan.slices.bottleneck_work(slice)
        );
    }
    println!();
}

fn print_schedule(graph: &StreamGraph, plan: &CompiledPlan) {
    let schedule: &Schedule = &plan.schedule;
    println!("{}: {} waves", "Ramp-up".cyan(), schedule.ramp_up.len());
    for (i, wave) in schedule.ramp_up.iter().enumerate() {
        let names: Vec<String> = wave
            .iter()
            .map(|s| plan.slices.slice_name(*s, graph))
            .collect();
        println!("  wave {}: {}", i, names.join(", "));
    }
    let steady: Vec<String> = schedule
        .steady
        .iter()
        .map(|s| plan.slices.slice_name(*s, graph))
        .collect();
    println!("{}: {}", "Steady order".cyan(), steady.join(", "));
    println!(
        "{}: {} time units per iteration",
        "Steady period".cyan(),
        schedule.steady_period()
    );
    if let Some(tile) = schedule.bottleneck_tile() {
        println!("{}: {}", "Bottleneck tile".cyan(), tile);
    }
    println!();
}

fn print_buffers(buffers: &BufferPool) {
    println!("{}: {} bytes of DRAM", "Buffers".cyan(), buffers.total_bytes());
    for buf in buffers.buffers().filter(|b| !b.is_redundant()) {
        let port = match buf.port {
            Some(p) => p.to_string(),
            None => "-".to_string(),
        };
        println!(
            "  {} on {}: {} bytes capacity ({} steady items)",
            buf, port, buf.size_bytes, buf.steady_items
        );
    }
    println!();
}

fn print_program(program: &RouterProgram, verbose: bool) {
    println!("{}: {}", "Switch code".cyan(), program.summary());
    for store in &program.tiles {
        if store.is_empty() {
            continue;
        }
        println!(
            "  {}: {} init + {} steady instructions",
            store.tile,
            store.init.len(),
            store.steady.len()
        );
    }
    if verbose {
        println!();
        println!("{}", "Per-tile switch code".bold().yellow());
        println!("{}", "-".repeat(50));
        print!("{}", program);
    }
}

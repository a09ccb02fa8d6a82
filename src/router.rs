//! Switch code generation
//!
//! Every data word a steady iteration moves gets a route instruction on each
//! switch it crosses: joins pull the weighted round-robin pattern out of
//! DRAM into the first filter's tile, interior links hop tile to tile, and
//! splits push the tail pattern back out to the edges' DRAM ports. Repeated
//! patterns above a threshold are wrapped in a hardware loop whose trip
//! count the compute processor injects at run time.
//!
//! Transfers to and from DRAM are padded to whole cache lines: extra words
//! are sourced from (or sunk into) a switch register at the port's tile.

use serde::Serialize;

use crate::buffer::BufferPool;
use crate::chip::{Endpoint, MeshConfig, PortId, Side, TileId};
use crate::error::{CompileError, CompileResult};
use crate::graph::StreamGraph;
use crate::schedule::{Layout, Schedule};
use crate::slice::{SchedulingPhase, SliceGraph, SliceId};
use crate::CompilerOptions;

/// A port of the switch crossbar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Link {
    North,
    East,
    South,
    West,
    /// The tile's own compute processor
    Processor,
    /// Switch scratch register, used to source pad words and sink fill
    Register,
}

impl Link {
    fn from_side(side: Side) -> Link {
        match side {
            Side::North => Link::North,
            Side::East => Link::East,
            Side::South => Link::South,
            Side::West => Link::West,
        }
    }

    fn incoming(&self) -> &'static str {
        match self {
            Link::North => "$cNi",
            Link::East => "$cEi",
            Link::South => "$cSi",
            Link::West => "$cWi",
            Link::Processor => "$csti",
            Link::Register => "$3",
        }
    }

    fn outgoing(&self) -> &'static str {
        match self {
            Link::North => "$cNo",
            Link::East => "$cEo",
            Link::South => "$cSo",
            Link::West => "$cWo",
            Link::Processor => "$csto",
            Link::Register => "$3",
        }
    }
}

/// One switch instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SwitchIns {
    /// Move one word from an input link to an output link
    Route { from: Link, to: Link },
    /// Compute processor pushes a loop trip count into the switch network
    SendConst { value: u64 },
    /// Switch moves the trip count off the network into its loop register
    ReceiveConst,
    LoopHeader { label: u32 },
    /// Decrement the loop register and branch back while nonzero
    LoopTrailer { label: u32 },
    Comment(String),
}

impl std::fmt::Display for SwitchIns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchIns::Route { from, to } => {
                write!(f, "nop\troute {}->{}", from.incoming(), to.outgoing())
            }
            SwitchIns::SendConst { value } => write!(f, "ori!\t$csto, $0, {value}"),
            SwitchIns::ReceiveConst => write!(f, "move\t$3, $csti"),
            SwitchIns::LoopHeader { label } => write!(f, "L_{label}:"),
            SwitchIns::LoopTrailer { label } => write!(f, "bnezd\t$3, $3, L_{label}"),
            SwitchIns::Comment(text) => write!(f, "# {text}"),
        }
    }
}

/// The two instruction streams of one tile's switch
#[derive(Debug, Clone, Serialize)]
pub struct SwitchCodeStore {
    pub tile: TileId,
    /// Runs once: initialization plus the pipeline-filling waves
    pub init: Vec<SwitchIns>,
    /// Repeats forever
    pub steady: Vec<SwitchIns>,
}

impl SwitchCodeStore {
    fn new(tile: TileId) -> Self {
        SwitchCodeStore { tile, init: Vec::new(), steady: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.init.is_empty() && self.steady.is_empty()
    }

    pub fn len(&self) -> usize {
        self.init.len() + self.steady.len()
    }

    /// A switch has a single loop register, so compressed loops cannot nest
    pub fn check_loop_nesting(&self) -> CompileResult<()> {
        for stream in [&self.init, &self.steady] {
            let mut depth = 0u32;
            for ins in stream {
                match ins {
                    SwitchIns::LoopHeader { .. } => {
                        depth += 1;
                        if depth > 1 {
                            return Err(CompileError::unsupported(format!(
                                "nested compressed loop in the switch code of {}",
                                self.tile
                            )));
                        }
                    }
                    SwitchIns::LoopTrailer { .. } => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// DRAM commands one port must issue per stage
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortCommands {
    pub init_reads: u32,
    pub init_writes: u32,
    pub steady_reads: u32,
    pub steady_writes: u32,
}

impl PortCommands {
    fn stage_total(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Init => self.init_reads + self.init_writes,
            Bucket::Steady => self.steady_reads + self.steady_writes,
        }
    }
}

/// Which instruction stream emission targets. Ramp-up firings move
/// steady-rate data but land in the init stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Init,
    Steady,
}

/// The complete routing plan: per-tile switch code plus the DRAM command
/// load it puts on each port
#[derive(Debug, Clone, Serialize)]
pub struct RouterProgram {
    pub chip: MeshConfig,
    pub tiles: Vec<SwitchCodeStore>,
    pub ports: Vec<PortCommands>,
}

impl RouterProgram {
    pub fn generate(
        graph: &StreamGraph,
        slices: &SliceGraph,
        chip: &MeshConfig,
        layout: &Layout,
        schedule: &Schedule,
        pool: &BufferPool,
        options: &CompilerOptions,
    ) -> CompileResult<RouterProgram> {
        let mut gen = SwitchCodeGen {
            graph,
            slices,
            chip,
            layout,
            pool,
            loop_threshold: options.loop_threshold,
            next_label: 0,
            tiles: (0..chip.total_tiles())
                .map(|i| SwitchCodeStore::new(TileId(i as u16)))
                .collect(),
            ports: vec![PortCommands::default(); chip.num_ports()],
        };

        for slice in &schedule.init {
            gen.emit_slice(*slice, "init", SchedulingPhase::Init, Bucket::Init)?;
        }
        for wave in &schedule.ramp_up {
            for slice in wave {
                gen.emit_slice(*slice, "ramp-up", SchedulingPhase::Steady, Bucket::Init)?;
            }
        }
        for slice in &schedule.steady {
            gen.emit_slice(*slice, "steady", SchedulingPhase::Steady, Bucket::Steady)?;
        }

        for store in &gen.tiles {
            store.check_loop_nesting()?;
        }
        gen.check_port_load()?;
        Ok(RouterProgram { chip: chip.clone(), tiles: gen.tiles, ports: gen.ports })
    }

    pub fn switch_code(&self, tile: TileId) -> &SwitchCodeStore {
        &self.tiles[tile.0 as usize]
    }

    pub fn total_instructions(&self) -> usize {
        self.tiles.iter().map(|t| t.len()).sum()
    }

    pub fn tiles_used(&self) -> usize {
        self.tiles.iter().filter(|t| !t.is_empty()).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn summary(&self) -> String {
        let busiest = self
            .ports
            .iter()
            .map(|p| p.steady_reads + p.steady_writes)
            .max()
            .unwrap_or(0);
        format!(
            "{} switch instructions across {} tiles; busiest DRAM port issues {} commands per steady iteration",
            self.total_instructions(),
            self.tiles_used(),
            busiest
        )
    }
}

impl std::fmt::Display for RouterProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for store in &self.tiles {
            if store.is_empty() {
                continue;
            }
            let (x, y) = self.chip.tile_xy(store.tile);
            writeln!(f, "{} ({x},{y}):", store.tile)?;
            writeln!(f, "  .init")?;
            for ins in &store.init {
                writeln!(f, "    {ins}")?;
            }
            writeln!(f, "  .steady")?;
            for ins in &store.steady {
                writeln!(f, "    {ins}")?;
            }
        }
        Ok(())
    }
}

struct SwitchCodeGen<'a> {
    graph: &'a StreamGraph,
    slices: &'a SliceGraph,
    chip: &'a MeshConfig,
    layout: &'a Layout,
    pool: &'a BufferPool,
    loop_threshold: u64,
    next_label: u32,
    tiles: Vec<SwitchCodeStore>,
    ports: Vec<PortCommands>,
}

impl<'a> SwitchCodeGen<'a> {
    fn emit_slice(
        &mut self,
        slice: SliceId,
        stage: &str,
        phase: SchedulingPhase,
        bucket: Bucket,
    ) -> CompileResult<()> {
        let first = self.slices.first_filter(slice);
        let tile = self.layout.tile_of_checked(first, self.slices, self.graph)?;
        self.push(
            tile,
            bucket,
            SwitchIns::Comment(format!(
                "{stage}: {}",
                self.slices.slice_name(slice, self.graph)
            )),
        );
        self.emit_join(slice, phase, bucket)?;
        self.emit_intra(slice, phase, bucket)?;
        self.emit_split(slice, phase, bucket)?;
        Ok(())
    }

    /// Pull the weighted round-robin join pattern out of DRAM into the
    /// first filter's tile.
    fn emit_join(
        &mut self,
        slice: SliceId,
        phase: SchedulingPhase,
        bucket: Bucket,
    ) -> CompileResult<()> {
        let head = self.slices.input(self.slices.slice(slice).head);
        if head.sources.is_empty() {
            return Ok(());
        }
        let spec = self
            .graph
            .filter(self.slices.filter_node(self.slices.first_filter(slice)).filter);
        let items = match phase {
            SchedulingPhase::Init => spec.init_items_received(),
            SchedulingPhase::Steady => spec.steady_items_received(),
        };
        if items == 0 {
            return Ok(());
        }
        let total_weight = head.total_weight();
        if items % total_weight != 0 {
            return Err(CompileError::unsupported(format!(
                "slice {} consumes {items} items in the {phase} stage, a partial \
                 round-robin cycle over weight total {total_weight}",
                self.slices.slice_name(slice, self.graph)
            )));
        }
        let rounds = items / total_weight;
        let dst = Endpoint::Tile(
            self.layout
                .tile_of_checked(self.slices.first_filter(slice), self.slices, self.graph)?,
        );

        let sources = head.sources.clone();
        let mut pattern = Vec::new();
        let mut pads = Vec::new();
        for (edge, weight) in &sources {
            let port = self.pool.port_of(self.pool.edge_buffer(*edge).id)?;
            let item_words = self.slices.edge(*edge).element.words() as u64;
            let hop = self.hops(Endpoint::Dram(port), dst);
            for _ in 0..(*weight as u64 * item_words) {
                pattern.extend_from_slice(&hop);
            }
            self.note_command(port, true, bucket);
            let edge_words =
                self.slices.edge_items(self.graph, *edge, phase)? * item_words;
            pads.push((port, self.chip.alignment_fill(edge_words)));
        }
        self.emit_pattern(&pattern, rounds, bucket);
        for (port, fill) in pads {
            self.pad(port, fill, true, bucket);
        }
        Ok(())
    }

    /// Hop items between consecutive filters of the chain
    fn emit_intra(
        &mut self,
        slice: SliceId,
        phase: SchedulingPhase,
        bucket: Bucket,
    ) -> CompileResult<()> {
        let chain = self.slices.slice(slice).filters.clone();
        for pair in chain.windows(2) {
            let up = self.graph.filter(self.slices.filter_node(pair[0]).filter);
            let down = self.graph.filter(self.slices.filter_node(pair[1]).filter);
            let (sent, received) = match phase {
                SchedulingPhase::Init => (up.init_items_sent(), down.init_items_received()),
                SchedulingPhase::Steady => (up.steady_items_sent(), down.steady_items_received()),
            };
            if sent != received {
                return Err(CompileError::invariant(format!(
                    "{} pushes {sent} items but {} pops {received} in the {phase} stage",
                    up.name, down.name
                )));
            }
            let words = sent * up.element.words() as u64;
            let src = Endpoint::Tile(self.layout.tile_of_checked(pair[0], self.slices, self.graph)?);
            let dst = Endpoint::Tile(self.layout.tile_of_checked(pair[1], self.slices, self.graph)?);
            let pattern = self.hops(src, dst);
            self.emit_pattern(&pattern, words, bucket);
        }
        Ok(())
    }

    /// Push the tail's weighted round-robin split back out to DRAM
    fn emit_split(
        &mut self,
        slice: SliceId,
        phase: SchedulingPhase,
        bucket: Bucket,
    ) -> CompileResult<()> {
        let tail = self.slices.output(self.slices.slice(slice).tail);
        if tail.dests.is_empty() {
            return Ok(());
        }
        let spec = self
            .graph
            .filter(self.slices.filter_node(self.slices.last_filter(slice)).filter);
        let items = match phase {
            SchedulingPhase::Init => spec.init_items_sent(),
            SchedulingPhase::Steady => spec.steady_items_sent(),
        };
        if items == 0 {
            return Ok(());
        }
        let total_weight = tail.total_weight();
        if items % total_weight != 0 {
            return Err(CompileError::unsupported(format!(
                "slice {} produces {items} items in the {phase} stage, a partial \
                 round-robin cycle over weight total {total_weight}",
                self.slices.slice_name(slice, self.graph)
            )));
        }
        let rounds = items / total_weight;
        let src = Endpoint::Tile(
            self.layout
                .tile_of_checked(self.slices.last_filter(slice), self.slices, self.graph)?,
        );

        let dests = tail.dests.clone();
        let mut pattern = Vec::new();
        let mut pads = Vec::new();
        for (edge, weight) in &dests {
            let port = self.pool.port_of(self.pool.edge_buffer(*edge).id)?;
            let item_words = self.slices.edge(*edge).element.words() as u64;
            let hop = self.hops(src, Endpoint::Dram(port));
            for _ in 0..(*weight as u64 * item_words) {
                pattern.extend_from_slice(&hop);
            }
            self.note_command(port, false, bucket);
            let edge_words =
                self.slices.edge_items(self.graph, *edge, phase)? * item_words;
            pads.push((port, self.chip.alignment_fill(edge_words)));
        }
        self.emit_pattern(&pattern, rounds, bucket);
        for (port, fill) in pads {
            self.pad(port, fill, false, bucket);
        }
        Ok(())
    }

    /// Per-tile route instructions for one word traveling `src` to `dst`,
    /// in travel order
    fn hops(&self, src: Endpoint, dst: Endpoint) -> Vec<(TileId, SwitchIns)> {
        let path = self.chip.route(src, dst);
        let mut out = Vec::with_capacity(path.len());
        for (i, tile) in path.iter().enumerate() {
            let from = if i == 0 {
                match src {
                    Endpoint::Dram(p) => Link::from_side(self.chip.port_side(p)),
                    Endpoint::Tile(_) => Link::Processor,
                }
            } else {
                self.direction(*tile, path[i - 1])
            };
            let to = if i == path.len() - 1 {
                match dst {
                    Endpoint::Dram(p) => Link::from_side(self.chip.port_side(p)),
                    Endpoint::Tile(_) => Link::Processor,
                }
            } else {
                self.direction(*tile, path[i + 1])
            };
            out.push((*tile, SwitchIns::Route { from, to }));
        }
        out
    }

    /// Compass link on `from` facing `toward`; the two tiles are mesh
    /// neighbors by construction of the route
    fn direction(&self, from: TileId, toward: TileId) -> Link {
        let (fx, fy) = self.chip.tile_xy(from);
        let (tx, ty) = self.chip.tile_xy(toward);
        if tx > fx {
            Link::East
        } else if tx < fx {
            Link::West
        } else if ty > fy {
            Link::South
        } else {
            Link::North
        }
    }

    /// Emit `pattern` `reps` times, wrapping it in a hardware loop per tile
    /// once the repetition count reaches the threshold
    fn emit_pattern(&mut self, pattern: &[(TileId, SwitchIns)], reps: u64, bucket: Bucket) {
        if reps == 0 || pattern.is_empty() {
            return;
        }
        if reps > 1 && reps >= self.loop_threshold {
            let label = self.next_label;
            self.next_label += 1;
            let mut seen: Vec<TileId> = Vec::new();
            for (tile, _) in pattern {
                if !seen.contains(tile) {
                    seen.push(*tile);
                }
            }
            for tile in seen {
                self.push(tile, bucket, SwitchIns::SendConst { value: reps - 1 });
                self.push(tile, bucket, SwitchIns::ReceiveConst);
                self.push(tile, bucket, SwitchIns::LoopHeader { label });
                let body: Vec<SwitchIns> = pattern
                    .iter()
                    .filter(|(t, _)| *t == tile)
                    .map(|(_, ins)| ins.clone())
                    .collect();
                for ins in body {
                    self.push(tile, bucket, ins);
                }
                self.push(tile, bucket, SwitchIns::LoopTrailer { label });
            }
        } else {
            for _ in 0..reps {
                for (tile, ins) in pattern {
                    self.push(*tile, bucket, ins.clone());
                }
            }
        }
    }

    /// Pad a DRAM transfer to the cache line: extra words shuttle between
    /// the port's side and the switch register at the port's own tile
    fn pad(&mut self, port: PortId, fill: u64, read: bool, bucket: Bucket) {
        debug_assert!(fill < self.chip.cache_line_words as u64);
        if fill == 0 {
            return;
        }
        let tile = self.chip.port_tile(port);
        let side = Link::from_side(self.chip.port_side(port));
        let ins = if read {
            // disregard the fill words the DRAM line brings along
            SwitchIns::Route { from: side, to: Link::Register }
        } else {
            // flush dummy words to complete the line
            SwitchIns::Route { from: Link::Register, to: side }
        };
        for _ in 0..fill {
            self.push(tile, bucket, ins.clone());
        }
    }

    fn push(&mut self, tile: TileId, bucket: Bucket, ins: SwitchIns) {
        let store = &mut self.tiles[tile.0 as usize];
        match bucket {
            Bucket::Init => store.init.push(ins),
            Bucket::Steady => store.steady.push(ins),
        }
    }

    fn note_command(&mut self, port: PortId, read: bool, bucket: Bucket) {
        let p = &mut self.ports[port.0 as usize];
        match (bucket, read) {
            (Bucket::Init, true) => p.init_reads += 1,
            (Bucket::Init, false) => p.init_writes += 1,
            (Bucket::Steady, true) => p.steady_reads += 1,
            (Bucket::Steady, false) => p.steady_writes += 1,
        }
    }

    fn check_port_load(&self) -> CompileResult<()> {
        for (i, port) in self.ports.iter().enumerate() {
            for bucket in [Bucket::Init, Bucket::Steady] {
                let total = port.stage_total(bucket);
                if total > self.chip.dram_queue_size {
                    return Err(CompileError::capacity(format!(
                        "{} must issue {total} commands in one stage but its queue \
                         holds {}",
                        PortId(i as u16),
                        self.chip.dram_queue_size
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FilterSpec;
    use crate::partition::Partitioner;
    use crate::CompilerOptions;

    fn generate(graph: &StreamGraph, chip: &MeshConfig) -> CompileResult<RouterProgram> {
        let options = CompilerOptions::default();
        let slices = Partitioner::new(graph, chip, &options).partition()?;
        let layout = Layout::row_major(&slices, chip)?;
        let schedule = Schedule::build(graph, &slices, chip, &layout)?;
        let pool = BufferPool::build(graph, &slices, chip, &layout)?;
        RouterProgram::generate(graph, &slices, chip, &layout, &schedule, &pool, &options)
    }

    fn pipeline(push: u32) -> StreamGraph {
        let mut b = StreamGraph::builder();
        let r = b.add_filter(FilterSpec::file_reader("src", push)).unwrap();
        let a = b.add_filter(FilterSpec::new("a", push, push, 100)).unwrap();
        let w = b.add_filter(FilterSpec::file_writer("sink", push)).unwrap();
        b.connect(r, a).unwrap();
        b.connect(a, w).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_every_word_is_routed() {
        let g = pipeline(2);
        let chip = MeshConfig::default_4x4();
        let program = generate(&g, &chip).unwrap();
        // below the loop threshold everything is unrolled: count the route
        // instructions that touch a compute processor in the steady stream
        let deliveries: usize = program
            .tiles
            .iter()
            .flat_map(|t| t.steady.iter())
            .filter(|ins| {
                matches!(
                    ins,
                    SwitchIns::Route { to: Link::Processor, .. }
                )
            })
            .count();
        // 2 words into 'a' and 2 words into 'sink'
        assert_eq!(deliveries, 4);
    }

    #[test]
    fn test_long_transfers_are_loop_compressed() {
        let g = pipeline(64);
        let chip = MeshConfig::default_4x4();
        let program = generate(&g, &chip).unwrap();
        let headers: usize = program
            .tiles
            .iter()
            .flat_map(|t| t.steady.iter())
            .filter(|ins| matches!(ins, SwitchIns::LoopHeader { .. }))
            .count();
        assert!(headers > 0);
        // compression keeps the stream far below one instruction per word
        assert!(program.total_instructions() < 64 * 4);
        // every header has a matching trailer on the same tile
        for store in &program.tiles {
            for stream in [&store.init, &store.steady] {
                let h = stream
                    .iter()
                    .filter(|i| matches!(i, SwitchIns::LoopHeader { .. }))
                    .count();
                let t = stream
                    .iter()
                    .filter(|i| matches!(i, SwitchIns::LoopTrailer { .. }))
                    .count();
                assert_eq!(h, t);
            }
        }
    }

    #[test]
    fn test_unaligned_write_gets_dummy_padding() {
        // 3 words per iteration against an 8-word cache line: 5 pad words
        let g = pipeline(3);
        let chip = MeshConfig::default_4x4();
        let program = generate(&g, &chip).unwrap();
        let dummies: usize = program
            .tiles
            .iter()
            .flat_map(|t| t.steady.iter())
            .filter(|ins| {
                matches!(ins, SwitchIns::Route { from: Link::Register, .. })
            })
            .count();
        let disregards: usize = program
            .tiles
            .iter()
            .flat_map(|t| t.steady.iter())
            .filter(|ins| {
                matches!(ins, SwitchIns::Route { to: Link::Register, .. })
            })
            .count();
        // one padded write per producing slice, one padded read per consumer
        assert_eq!(dummies, 2 * 5);
        assert_eq!(disregards, 2 * 5);
    }

    #[test]
    fn test_aligned_transfers_need_no_padding() {
        let g = pipeline(8);
        let chip = MeshConfig::default_4x4();
        let program = generate(&g, &chip).unwrap();
        assert!(!program.tiles.iter().flat_map(|t| t.steady.iter()).any(|ins| {
            matches!(
                ins,
                SwitchIns::Route { from: Link::Register, .. }
                    | SwitchIns::Route { to: Link::Register, .. }
            )
        }));
    }

    #[test]
    fn test_port_queue_overflow_rejected() {
        // a 1x1 chip funnels every buffer onto one port
        let g = pipeline(1);
        let chip = MeshConfig::new(1, 1, 8, 2);
        let err = generate(&g, &chip).unwrap_err();
        assert!(matches!(err, CompileError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_nested_loops_rejected() {
        let mut store = SwitchCodeStore::new(TileId(0));
        store.steady = vec![
            SwitchIns::LoopHeader { label: 0 },
            SwitchIns::LoopHeader { label: 1 },
            SwitchIns::Route { from: Link::West, to: Link::East },
            SwitchIns::LoopTrailer { label: 1 },
            SwitchIns::LoopTrailer { label: 0 },
        ];
        assert!(matches!(
            store.check_loop_nesting().unwrap_err(),
            CompileError::UnsupportedTopology { .. }
        ));
    }

    #[test]
    fn test_route_rendering() {
        let ins = SwitchIns::Route { from: Link::West, to: Link::Processor };
        assert_eq!(ins.to_string(), "nop\troute $cWi->$csto");
        let ins = SwitchIns::Route { from: Link::Register, to: Link::North };
        assert_eq!(ins.to_string(), "nop\troute $3->$cNo");
        assert_eq!(SwitchIns::LoopTrailer { label: 2 }.to_string(), "bnezd\t$3, $3, L_2");
    }
}

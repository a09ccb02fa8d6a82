//! Space-time scheduling: tile placement and the three execution stages
//!
//! A compiled program runs in three stages. The *init* stage fires every
//! slice's initialization work in data-flow order. The *ramp-up* stage fires
//! slices in waves until every slice can fire concurrently, filling the
//! software pipeline. The *steady* stage then repeats forever; it is built
//! with a discrete-time simulation that tracks when each tile becomes idle,
//! issuing the heaviest slices first.

use serde::Serialize;

use crate::chip::{MeshConfig, TileId};
use crate::error::{CompileError, CompileResult};
use crate::graph::StreamGraph;
use crate::slice::{NodeId, SliceGraph, SliceId};

/// Assignment of filter nodes to compute tiles
#[derive(Debug, Clone, Serialize)]
pub struct Layout {
    /// Indexed by `NodeId`; only filter nodes get tiles
    tiles: Vec<Option<TileId>>,
}

impl Layout {
    pub fn empty(num_nodes: usize) -> Self {
        Layout { tiles: vec![None; num_nodes] }
    }

    pub fn assign(&mut self, node: NodeId, tile: TileId) {
        self.tiles[node.0 as usize] = Some(tile);
    }

    pub fn tile_of(&self, node: NodeId) -> Option<TileId> {
        self.tiles[node.0 as usize]
    }

    pub(crate) fn tile_of_checked(
        &self,
        node: NodeId,
        slices: &SliceGraph,
        graph: &StreamGraph,
    ) -> CompileResult<TileId> {
        self.tile_of(node).ok_or_else(|| {
            CompileError::unassigned(format!(
                "filter '{}' has no tile",
                graph.filter(slices.filter_node(node).filter).name
            ))
        })
    }

    /// Place each slice's filter chain on consecutive tiles, wrapping around
    /// the grid; slices time-multiplex tiles, so reuse across slices is fine.
    pub fn row_major(slices: &SliceGraph, chip: &MeshConfig) -> CompileResult<Layout> {
        let total = chip.total_tiles();
        let mut layout = Layout::empty(
            slices
                .slice_ids()
                .map(|s| slices.slice(s).filters.len() + 2)
                .sum(),
        );
        let mut cursor = 0usize;
        for slice in slices.slice_ids() {
            let chain = &slices.slice(slice).filters;
            if chain.len() > total {
                return Err(CompileError::capacity(format!(
                    "slice of {} filters does not fit on {} tiles",
                    chain.len(),
                    total
                )));
            }
            for node in chain {
                layout.assign(*node, TileId(cursor as u16));
                cursor = (cursor + 1) % total;
            }
        }
        Ok(layout)
    }
}

/// The three-stage execution schedule plus the tile-time it implies
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    /// Init stage: every slice once, in data-flow order
    pub init: Vec<SliceId>,
    /// Ramp-up stage: waves of slice firings that fill the pipeline
    pub ramp_up: Vec<Vec<SliceId>>,
    /// Steady stage issue order, heaviest bottleneck first
    pub steady: Vec<SliceId>,
    /// Simulated time at which each tile goes idle in one steady iteration
    pub tile_avail: Vec<u64>,
}

impl Schedule {
    pub fn build(
        graph: &StreamGraph,
        slices: &SliceGraph,
        chip: &MeshConfig,
        layout: &Layout,
    ) -> CompileResult<Schedule> {
        let init = data_flow_order(slices);
        let ramp_up = ramp_up_waves(graph, slices, &init)?;
        let (steady, tile_avail) = steady_order(graph, slices, chip, layout)?;
        Ok(Schedule { init, ramp_up, steady, tile_avail })
    }

    /// Length of one steady-state iteration: the busiest tile's finish time
    pub fn steady_period(&self) -> u64 {
        self.tile_avail.iter().copied().max().unwrap_or(0)
    }

    /// The tile that bounds the steady-state throughput
    pub fn bottleneck_tile(&self) -> Option<TileId> {
        self.tile_avail
            .iter()
            .enumerate()
            .max_by_key(|(_, t)| **t)
            .filter(|(_, t)| **t > 0)
            .map(|(i, _)| TileId(i as u16))
    }

    /// Steady iterations in flight once the pipeline is full
    pub fn pipeline_depth(&self) -> usize {
        self.ramp_up.len() + 1
    }
}

/// Topological order over slices; ready slices issue in id order so the
/// traversal is deterministic. Slices caught in a cycle are appended at the
/// end; the ramp-up construction rejects them with a proper diagnostic.
fn data_flow_order(slices: &SliceGraph) -> Vec<SliceId> {
    let n = slices.num_slices();
    let mut in_deg: Vec<usize> = slices.slice_ids().map(|s| slices.dependencies(s).len()).collect();
    let mut order = Vec::with_capacity(n);
    let mut ready: Vec<SliceId> = slices.slice_ids().filter(|s| in_deg[s.0 as usize] == 0).collect();
    while let Some(slice) = ready.first().copied() {
        ready.remove(0);
        order.push(slice);
        for succ in slices.successors(slice) {
            in_deg[succ.0 as usize] -= 1;
            if in_deg[succ.0 as usize] == 0 {
                let at = ready.partition_point(|s| *s < succ);
                ready.insert(at, succ);
            }
        }
    }
    for slice in slices.slice_ids() {
        if !order.contains(&slice) {
            order.push(slice);
        }
    }
    order
}

/// Fire waves of slices until every slice could fire at once. A slice may
/// fire when each upstream slice has fired strictly more often than it has;
/// file boundaries are exempt as dependencies since DRAM feeds them on
/// demand, and a boundary slice only takes part itself when it really splits
/// or joins (otherwise its movement folds into the neighboring slice).
fn ramp_up_waves(
    graph: &StreamGraph,
    slices: &SliceGraph,
    init_order: &[SliceId],
) -> CompileResult<Vec<Vec<SliceId>>> {
    let mut fired = vec![0u64; slices.num_slices()];
    let can_fire = |slice: SliceId, fired: &[u64]| {
        slices.dependencies(slice).iter().all(|dep| {
            slices.is_boundary(*dep, graph) || fired[dep.0 as usize] > fired[slice.0 as usize]
        })
    };
    let takes_part = |slice: SliceId| {
        if !slices.is_boundary(slice, graph) {
            return true;
        }
        !slices.input(slices.slice(slice).head).single_source()
            && !slices.input(slices.slice(slice).head).sources.is_empty()
            || !slices.output(slices.slice(slice).tail).single_dest()
                && !slices.output(slices.slice(slice).tail).dests.is_empty()
    };
    let candidates: Vec<SliceId> = init_order.iter().copied().filter(|s| takes_part(*s)).collect();

    let mut waves = Vec::new();
    while !candidates.iter().all(|s| can_fire(*s, &fired)) {
        let wave: Vec<SliceId> = candidates
            .iter()
            .copied()
            .filter(|s| can_fire(*s, &fired))
            .collect();
        if wave.is_empty() {
            return Err(CompileError::unsupported(
                "graph contains a feedback loop; no slice can make progress",
            ));
        }
        for slice in &wave {
            fired[slice.0 as usize] += 1;
        }
        waves.push(wave);
    }
    Ok(waves)
}

/// Discrete-time simulation of one steady iteration. Slices issue heaviest
/// first; each filter node occupies its own tile for the slice's bottleneck
/// work, so every tile's clock advances independently.
fn steady_order(
    graph: &StreamGraph,
    slices: &SliceGraph,
    chip: &MeshConfig,
    layout: &Layout,
) -> CompileResult<(Vec<SliceId>, Vec<u64>)> {
    let mut order: Vec<SliceId> = slices.slice_ids().collect();
    order.sort_by(|a, b| {
        slices
            .bottleneck_work(*b)
            .cmp(&slices.bottleneck_work(*a))
            .then(a.cmp(b))
    });

    let mut tile_avail = vec![0u64; chip.total_tiles()];
    for slice in &order {
        let work = slices.bottleneck_work(*slice);
        for node in &slices.slice(*slice).filters {
            let tile = layout.tile_of_checked(*node, slices, graph)?;
            tile_avail[tile.0 as usize] += work;
        }
    }
    Ok((order, tile_avail))
}

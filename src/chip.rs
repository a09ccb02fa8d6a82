//! Mesh chip model: tiles, DRAM ports, and routing paths
//!
//! These types describe the target chip: a `width` x `height` grid of tiles
//! (compute processor + router) with streaming-DRAM ports around the
//! perimeter. The model is purely queried by the scheduler and router code
//! generator; nothing here is mutated during compilation.

use serde::{Deserialize, Serialize};

/// Bytes per routed word
pub const WORD_BYTES: u64 = 4;

/// Identifier of a tile, row-major over the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId(pub u16);

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tile{}", self.0)
    }
}

/// Identifier of a DRAM port on the chip perimeter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u16);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dram{}", self.0)
    }
}

/// Which side of its neighboring tile a DRAM port sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    North,
    East,
    South,
    West,
}

/// One endpoint of a physical transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Tile(TileId),
    Dram(PortId),
}

/// Configuration of the target mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Grid width in tiles
    pub width: u16,
    /// Grid height in tiles
    pub height: u16,
    /// Transfer-alignment unit: every DRAM transfer is a whole multiple of
    /// this many words
    pub cache_line_words: u32,
    /// Maximum outstanding commands per streaming-DRAM port
    pub dram_queue_size: u32,
}

impl MeshConfig {
    pub fn new(width: u16, height: u16, cache_line_words: u32, dram_queue_size: u32) -> Self {
        MeshConfig {
            width,
            height,
            cache_line_words,
            dram_queue_size,
        }
    }

    /// Default configuration: 4x4 grid, 8-word (32-byte) cache lines,
    /// 8 outstanding commands per port
    pub fn default_4x4() -> Self {
        MeshConfig::new(4, 4, 8, 8)
    }

    pub fn total_tiles(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// DRAM ports ring the perimeter, one per boundary tile side
    pub fn num_ports(&self) -> usize {
        2 * (self.width as usize + self.height as usize)
    }

    pub fn tile_at(&self, x: u16, y: u16) -> TileId {
        debug_assert!(x < self.width && y < self.height);
        TileId(y * self.width + x)
    }

    pub fn tile_xy(&self, tile: TileId) -> (u16, u16) {
        (tile.0 % self.width, tile.0 / self.width)
    }

    /// The boundary tile adjacent to `port`. Ports are numbered clockwise:
    /// top edge left-to-right, right edge top-to-bottom, bottom edge
    /// right-to-left, left edge bottom-to-top.
    pub fn port_tile(&self, port: PortId) -> TileId {
        let (w, h) = (self.width as usize, self.height as usize);
        let p = port.0 as usize;
        debug_assert!(p < self.num_ports());
        if p < w {
            self.tile_at(p as u16, 0)
        } else if p < w + h {
            self.tile_at(self.width - 1, (p - w) as u16)
        } else if p < 2 * w + h {
            self.tile_at((2 * w + h - 1 - p) as u16, self.height - 1)
        } else {
            self.tile_at(0, (2 * w + 2 * h - 1 - p) as u16)
        }
    }

    /// The side of its neighboring tile that `port` hangs off
    pub fn port_side(&self, port: PortId) -> Side {
        let (w, h) = (self.width as usize, self.height as usize);
        let p = port.0 as usize;
        if p < w {
            Side::North
        } else if p < w + h {
            Side::East
        } else if p < 2 * w + h {
            Side::South
        } else {
            Side::West
        }
    }

    /// The port whose neighboring tile is closest to `tile` (Manhattan
    /// distance, lowest port number on ties)
    pub fn port_near(&self, tile: TileId) -> PortId {
        let (tx, ty) = self.tile_xy(tile);
        let mut best = PortId(0);
        let mut best_dist = u32::MAX;
        for p in 0..self.num_ports() as u16 {
            let (px, py) = self.tile_xy(self.port_tile(PortId(p)));
            let dist = (tx as i32 - px as i32).unsigned_abs()
                + (ty as i32 - py as i32).unsigned_abs();
            if dist < best_dist {
                best_dist = dist;
                best = PortId(p);
            }
        }
        best
    }

    fn endpoint_tile(&self, e: Endpoint) -> TileId {
        match e {
            Endpoint::Tile(t) => t,
            Endpoint::Dram(p) => self.port_tile(p),
        }
    }

    /// Dimension-ordered (X then Y) route between two endpoints, returned as
    /// the ordered list of tiles the data crosses, both ends inclusive. A
    /// DRAM endpoint enters/leaves the mesh at its neighboring tile.
    pub fn route(&self, src: Endpoint, dst: Endpoint) -> Vec<TileId> {
        let start = self.endpoint_tile(src);
        let end = self.endpoint_tile(dst);
        let (mut x, mut y) = self.tile_xy(start);
        let (ex, ey) = self.tile_xy(end);
        let mut path = vec![start];
        while x != ex {
            if x < ex {
                x += 1;
            } else {
                x -= 1;
            }
            path.push(self.tile_at(x, y));
        }
        while y != ey {
            if y < ey {
                y += 1;
            } else {
                y -= 1;
            }
            path.push(self.tile_at(x, y));
        }
        path
    }

    /// Round `words` up to a whole number of cache lines
    pub fn align_words(&self, words: u64) -> u64 {
        let line = self.cache_line_words as u64;
        match words % line {
            0 => words,
            rem => words + (line - rem),
        }
    }

    /// Padding words needed to reach the next cache-line boundary; always
    /// strictly less than one line
    pub fn alignment_fill(&self, words: u64) -> u64 {
        self.align_words(words) - words
    }

    /// Aligned byte size for `words` words of payload
    pub fn aligned_bytes(&self, words: u64) -> u64 {
        self.align_words(words) * WORD_BYTES
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::default_4x4()
    }
}

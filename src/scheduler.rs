//! Block schedulers
//!
//! A scheduler turns a flat loop index into the output tile (and K range)
//! that iteration computes. Cores walk loop indices `core, core + block_dim,
//! ...`, so the visitation order decides which tiles run concurrently; the
//! swizzle keeps concurrently running tiles close together so their
//! operand panels stay in L2.

use crate::coord::{ceil_div, GemmCoord, MatrixCoord};
use crate::params::{SplitMode, TilingParameters};

/// Whether a drain overwrites or adds into its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Accumulate,
}

/// Tile indices of one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCoord {
    /// Tile row
    pub m: usize,
    /// Tile column
    pub n: usize,
    /// First K tile (in units of k1)
    pub k: usize,
    /// Last K tile, exclusive
    pub k_end: usize,
    /// K slice index for split variants, 0 otherwise
    pub slice: usize,
    pub write: WriteMode,
}

/// Maps loop indices to tiles
pub trait BlockScheduler: Send + Sync {
    /// Number of loop indices shared out across cores
    fn core_loops(&self) -> usize;

    /// Work for a loop index; `None` for indices that only keep the
    /// per-core partition aligned
    fn block_coord(&self, loop_idx: usize) -> Option<BlockCoord>;

    /// Element extents of a block, clipped at the problem edge
    fn actual_block_shape(&self, coord: &BlockCoord) -> GemmCoord;

    /// Element offset of a block's first (row, column, k)
    fn block_offset(&self, coord: &BlockCoord) -> GemmCoord;
}

/// Swizzled visitation of the (m, n) tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityScheduler {
    problem: GemmCoord,
    tile: GemmCoord,
    loops: GemmCoord,
    swizzle_offset: usize,
    swizzle_direction: usize,
}

impl IdentityScheduler {
    pub fn new(problem: GemmCoord, tile: GemmCoord, swizzle_offset: usize, swizzle_direction: usize) -> Self {
        Self {
            problem,
            tile,
            loops: problem.loops(&tile),
            swizzle_offset: swizzle_offset.max(1),
            swizzle_direction,
        }
    }

    pub fn from_params(params: &TilingParameters) -> Self {
        Self::new(
            params.problem,
            params.tiles.l1,
            params.swizzle_offset,
            params.swizzle_direction,
        )
    }

    pub fn tile_count(&self) -> usize {
        self.loops.m * self.loops.n
    }

    pub fn k_tiles(&self) -> usize {
        self.loops.k
    }

    pub fn tile(&self) -> GemmCoord {
        self.tile
    }

    /// (tile row, tile column) of the `idx`-th tile in visitation order
    pub fn swizzle(&self, idx: usize) -> MatrixCoord {
        let idx = idx % self.tile_count();
        let offset = self.swizzle_offset;
        let (rows, cols) = (self.loops.m, self.loops.n);
        if self.swizzle_direction == 0 {
            // Bands of `offset` tile rows, walked column by column
            let band_loop = ceil_div(rows, offset);
            let band = idx / (offset * cols);
            let in_band = idx % (offset * cols);
            let band_rows = if band == band_loop - 1 {
                rows - offset * band
            } else {
                offset
            };
            let m = band * offset + in_band % band_rows;
            let mut n = in_band / band_rows;
            if band % 2 == 1 {
                n = cols - n - 1;
            }
            MatrixCoord::new(m, n)
        } else {
            let band_loop = ceil_div(cols, offset);
            let band = idx / (offset * rows);
            let in_band = idx % (offset * rows);
            let band_cols = if band == band_loop - 1 {
                cols - offset * band
            } else {
                offset
            };
            let mut m = in_band / band_cols;
            let n = band * offset + in_band % band_cols;
            if band % 2 == 1 {
                m = rows - m - 1;
            }
            MatrixCoord::new(m, n)
        }
    }

    fn shape_of(&self, coord: &BlockCoord) -> GemmCoord {
        let offset = self.offset_of(coord);
        let k_end = (coord.k_end * self.tile.k).min(self.problem.k);
        GemmCoord::new(
            self.tile.m.min(self.problem.m - offset.m),
            self.tile.n.min(self.problem.n - offset.n),
            k_end - offset.k,
        )
    }

    fn offset_of(&self, coord: &BlockCoord) -> GemmCoord {
        GemmCoord::new(coord.m * self.tile.m, coord.n * self.tile.n, coord.k * self.tile.k)
    }
}

impl BlockScheduler for IdentityScheduler {
    fn core_loops(&self) -> usize {
        self.tile_count()
    }

    fn block_coord(&self, loop_idx: usize) -> Option<BlockCoord> {
        let tile = self.swizzle(loop_idx);
        Some(BlockCoord {
            m: tile.row,
            n: tile.column,
            k: 0,
            k_end: self.loops.k,
            slice: 0,
            write: WriteMode::Overwrite,
        })
    }

    fn actual_block_shape(&self, coord: &BlockCoord) -> GemmCoord {
        self.shape_of(coord)
    }

    fn block_offset(&self, coord: &BlockCoord) -> GemmCoord {
        self.offset_of(coord)
    }
}

/// K range, in K tiles, of slice `slice` out of `split`. Slices differ by
/// at most one tile and none is empty while `split <= k_tiles`.
pub fn slice_k_tiles(k_tiles: usize, split: usize, slice: usize) -> (usize, usize) {
    (slice * k_tiles / split, (slice + 1) * k_tiles / split)
}

/// Split-K visitation: every (m, n) tile is computed as `split` partial
/// products over disjoint K ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitKScheduler {
    identity: IdentityScheduler,
    split: usize,
    mode: SplitMode,
    /// Tile slots per slice in sequential mode, a multiple of the core count
    padded_tiles: usize,
}

impl SplitKScheduler {
    pub fn new(identity: IdentityScheduler, split: usize, mode: SplitMode, block_dim: usize) -> Self {
        let split = split.clamp(1, identity.k_tiles().max(1));
        let padded_tiles = ceil_div(identity.tile_count(), block_dim.max(1)) * block_dim.max(1);
        Self {
            identity,
            split,
            mode,
            padded_tiles,
        }
    }

    pub fn from_params(params: &TilingParameters) -> Self {
        Self::new(
            IdentityScheduler::from_params(params),
            params.split_factor,
            params.split_mode,
            params.block_dim,
        )
    }

    pub fn split(&self) -> usize {
        self.split
    }

    fn coord(&self, tile_idx: usize, slice: usize, write: WriteMode) -> BlockCoord {
        let tile = self.identity.swizzle(tile_idx);
        let (k, k_end) = slice_k_tiles(self.identity.k_tiles(), self.split, slice);
        BlockCoord {
            m: tile.row,
            n: tile.column,
            k,
            k_end,
            slice,
            write,
        }
    }
}

impl BlockScheduler for SplitKScheduler {
    fn core_loops(&self) -> usize {
        match self.mode {
            SplitMode::Sequential => self.padded_tiles * self.split,
            _ => self.identity.tile_count() * self.split,
        }
    }

    fn block_coord(&self, loop_idx: usize) -> Option<BlockCoord> {
        match self.mode {
            SplitMode::Sequential => {
                // Slice-major with a core-aligned stride: tile t always
                // lands on core t % block_dim, so its slices never overlap.
                let slice = loop_idx / self.padded_tiles;
                let tile_idx = loop_idx % self.padded_tiles;
                if tile_idx >= self.identity.tile_count() {
                    return None;
                }
                let write = if slice == 0 {
                    WriteMode::Overwrite
                } else {
                    WriteMode::Accumulate
                };
                Some(self.coord(tile_idx, slice, write))
            }
            _ => Some(self.coord(loop_idx / self.split, loop_idx % self.split, WriteMode::Overwrite)),
        }
    }

    fn actual_block_shape(&self, coord: &BlockCoord) -> GemmCoord {
        self.identity.shape_of(coord)
    }

    fn block_offset(&self, coord: &BlockCoord) -> GemmCoord {
        self.identity.offset_of(coord)
    }
}

/// Part of a stream-K block computed by one core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamKPiece {
    /// Index among the stream-K blocks
    pub block: usize,
    pub core: usize,
    /// Workspace slot (two per core)
    pub slot: usize,
    pub coord: BlockCoord,
}

/// Stream-K visitation.
///
/// Whole waves of tiles are scheduled normally. The tiles of the last,
/// partial wave are cut along K and their K iterations spread evenly over
/// every core, so no core idles through the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamKScheduler {
    identity: IdentityScheduler,
    block_dim: usize,
    normal_blocks: usize,
    stream_blocks: usize,
}

impl StreamKScheduler {
    pub fn new(identity: IdentityScheduler, block_dim: usize) -> Self {
        let tiles = identity.tile_count();
        let stream_blocks = if tiles > block_dim { tiles % block_dim } else { tiles };
        Self {
            identity,
            block_dim,
            normal_blocks: tiles - stream_blocks,
            stream_blocks,
        }
    }

    pub fn from_params(params: &TilingParameters) -> Self {
        Self::new(IdentityScheduler::from_params(params), params.block_dim)
    }

    pub fn identity(&self) -> &IdentityScheduler {
        &self.identity
    }

    pub fn normal_blocks(&self) -> usize {
        self.normal_blocks
    }

    pub fn stream_blocks(&self) -> usize {
        self.stream_blocks
    }

    fn total_iterations(&self) -> usize {
        self.stream_blocks * self.identity.k_tiles()
    }

    /// First stream-K iteration of `core`'s chunk
    fn chunk_start(&self, core: usize) -> usize {
        let total = self.total_iterations();
        let base = total / self.block_dim;
        let rem = total % self.block_dim;
        core * base + core.min(rem)
    }

    /// Core whose chunk holds iteration `iteration`; `block_dim` past the end
    fn owner(&self, iteration: usize) -> usize {
        if iteration >= self.total_iterations() {
            return self.block_dim;
        }
        (0..self.block_dim)
            .rev()
            .find(|&core| self.chunk_start(core) <= iteration)
            .unwrap_or(0)
    }

    /// Loop indices of `core` in execution order. The core's stream-K unit
    /// runs before its last normal tile so the reduction overlaps it.
    pub fn loop_order(&self, core: usize) -> Vec<usize> {
        let core_loops = self.normal_blocks + self.block_dim;
        let mut order: Vec<usize> = (core..core_loops).step_by(self.block_dim).collect();
        let len = order.len();
        if len >= 2 {
            order.swap(len - 2, len - 1);
        }
        order
    }

    /// Tile of a normal loop index, or `None` for the stream-K unit
    pub fn normal_block(&self, loop_idx: usize) -> Option<BlockCoord> {
        if loop_idx >= self.normal_blocks {
            return None;
        }
        self.identity.block_coord(loop_idx)
    }

    /// Stream-K pieces computed by `core`: at most two, the second one
    /// crossing into the next block.
    pub fn pieces(&self, core: usize) -> Vec<StreamKPiece> {
        let k_tiles = self.identity.k_tiles();
        let (start, end) = (self.chunk_start(core), self.chunk_start(core + 1).min(self.total_iterations()));
        let mut pieces = Vec::new();
        let mut at = start;
        while at < end {
            let block = at / k_tiles;
            let piece_end = end.min((block + 1) * k_tiles);
            let tile = self.identity.swizzle(self.normal_blocks + block);
            pieces.push(StreamKPiece {
                block,
                core,
                slot: 2 * core + pieces.len(),
                coord: BlockCoord {
                    m: tile.row,
                    n: tile.column,
                    k: at - block * k_tiles,
                    k_end: piece_end - block * k_tiles,
                    slice: pieces.len(),
                    write: WriteMode::Overwrite,
                },
            });
            at = piece_end;
        }
        pieces
    }

    /// Pieces making up stream-K block `block`, in K order
    pub fn block_pieces(&self, block: usize) -> Vec<StreamKPiece> {
        let k_tiles = self.identity.k_tiles();
        let first = self.owner(block * k_tiles);
        let last = self.owner((block + 1) * k_tiles - 1);
        (first..=last)
            .flat_map(|core| self.pieces(core))
            .filter(|piece| piece.block == block)
            .collect()
    }

    /// Cores whose transfer contexts reduce `block`; ranges of different
    /// blocks never overlap.
    pub fn reduce_range(&self, block: usize) -> std::ops::Range<usize> {
        let k_tiles = self.identity.k_tiles();
        let start = self.owner(block * k_tiles);
        let end = if block + 1 == self.stream_blocks {
            self.block_dim
        } else {
            self.owner((block + 1) * k_tiles)
        };
        start..end.max(start + 1).min(self.block_dim)
    }

    pub fn actual_block_shape(&self, coord: &BlockCoord) -> GemmCoord {
        self.identity.shape_of(coord)
    }

    pub fn block_offset(&self, coord: &BlockCoord) -> GemmCoord {
        self.identity.offset_of(coord)
    }
}

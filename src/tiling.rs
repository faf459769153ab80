//! Initial L1 / L0 tile derivation
//!
//! Tiles start from the shapes that give the best copy bandwidth for the
//! operand layout combination and are then balanced against the core
//! count. K tiles are sized last to fill whatever L1 is left.
//!
//! For C = A @ B where A is MxK and B is KxN:
//! - the long contiguous axis of each operand gets the 256-wide side
//! - tiles shrink while the last wave of blocks leaves most cores idle
//! - thin problems spread the other axis so every core gets a block

use crate::coord::{ceil_div, round_down, round_up, GemmCoord};
use crate::hardware::{ElementSizes, PlatformDescriptor, StageConfig, TileConfig};
use crate::layout::LayoutTag;
use tracing::trace;

/// Tile edges are multiples of this
pub const TILE_ALIGN: usize = 16;

/// Largest K tile representable in the tiling blob
const MAX_K1: usize = 65520;

/// Wave utilisation below which workload balancing kicks in
const BALANCE_THRESHOLD: f64 = 0.8;

/// Extents from which the bandwidth-optimal defaults are always used
const HUGE_EXTENT: usize = 65536;

/// Tiling strategy for a platform and element width combination
pub struct TilingStrategy<'a> {
    platform: &'a PlatformDescriptor,
    sizes: ElementSizes,
    stages: StageConfig,
}

impl<'a> TilingStrategy<'a> {
    pub fn new(platform: &'a PlatformDescriptor, sizes: ElementSizes, stages: StageConfig) -> Self {
        Self {
            platform,
            sizes,
            stages,
        }
    }

    fn cores(&self) -> usize {
        self.platform.core_count
    }

    /// L1 bytes of the bias row staged alongside one stage of operands
    fn bias_bytes(&self, n1: usize) -> usize {
        self.sizes.bias.map_or(0, |size| n1 * size)
    }

    /// Whether an L1 tile fits in L1 and its accumulator in L0C
    pub fn fits(&self, m1: usize, n1: usize, k1: usize) -> bool {
        let l1 = (m1 * k1 * self.sizes.a + n1 * k1 * self.sizes.b + self.bias_bytes(n1)) * self.stages.l1_stages;
        let l0c = m1 * n1 * self.sizes.accumulator * self.stages.l0c_stages;
        l1 <= self.platform.l1_bytes && l0c <= self.platform.l0c_bytes
    }

    /// Deepest K tile that still fits L1 for the given M/N tile, after the
    /// bias row has taken its share of every stage
    pub fn max_k1(&self, m1: usize, n1: usize) -> usize {
        let per_stage = (self.platform.l1_bytes / self.stages.l1_stages.max(1)).saturating_sub(self.bias_bytes(n1));
        let k1 = per_stage / (m1 * self.sizes.a + n1 * self.sizes.b).max(1);
        let k1 = if k1 >= 64 {
            round_down(k1, 64)
        } else {
            round_down(k1, TILE_ALIGN)
        };
        k1.clamp(TILE_ALIGN, MAX_K1)
    }

    /// Shrink `tile` (along an axis of extent `extent`) towards `threshold`
    /// when the last wave of blocks is badly under-filled.
    fn balance_workload(&self, extent: usize, other_blocks: usize, tile: &mut usize, threshold: usize) {
        let utilisation = |t: usize| {
            let blocks = ceil_div(extent, t) * other_blocks;
            blocks as f64 / (round_up(blocks, self.cores())) as f64
        };
        if utilisation(*tile) >= BALANCE_THRESHOLD {
            return;
        }
        let mut best = *tile;
        let mut best_util = utilisation(best);
        let mut candidate = *tile;
        while candidate > threshold {
            candidate -= TILE_ALIGN;
            let util = utilisation(candidate);
            if util > best_util + f64::EPSILON {
                best = candidate;
                best_util = util;
            }
        }
        *tile = best;
    }

    /// Grow `tile` in 16-steps while it fits L1 and removes a whole wave.
    fn grow_while_fits(&self, extent: usize, other_blocks: usize, tile: &mut usize, fits: impl Fn(usize) -> bool) {
        let max_blocks = round_up(ceil_div(extent, *tile) * other_blocks, self.cores());
        let mut candidate = *tile;
        while fits(candidate + TILE_ALIGN) {
            candidate += TILE_ALIGN;
            let blocks = ceil_div(extent, candidate) * other_blocks;
            if blocks + self.cores() <= max_blocks {
                *tile = candidate;
            }
            if candidate >= extent {
                break;
            }
        }
    }

    /// Halve the larger tile while that still fits in one wave, so thin or
    /// small problems use more cores.
    fn spread_to_cores(&self, m: usize, n: usize, m1: &mut usize, n1: &mut usize) {
        const MIN_SPREAD_TILE: usize = 32;
        loop {
            let blocks = ceil_div(m, *m1) * ceil_div(n, *n1);
            if blocks >= self.cores() {
                return;
            }
            let halve_n = *n1 >= *m1 && *n1 / 2 >= MIN_SPREAD_TILE && n > *n1 / 2;
            let halve_m = !halve_n && *m1 / 2 >= MIN_SPREAD_TILE && m > *m1 / 2;
            let (next_m1, next_n1) = match (halve_n, halve_m) {
                (true, _) => (*m1, round_up(*n1 / 2, TILE_ALIGN)),
                (_, true) => (round_up(*m1 / 2, TILE_ALIGN), *n1),
                _ => return,
            };
            if ceil_div(m, next_m1) * ceil_div(n, next_n1) > self.cores() {
                return;
            }
            *m1 = next_m1;
            *n1 = next_n1;
        }
    }

    /// Initial L1 tile for a problem and layout combination
    pub fn l1_tile(&self, problem: GemmCoord, layout_a: LayoutTag, layout_b: LayoutTag) -> GemmCoord {
        let GemmCoord { m, n, k } = problem;
        let (mut m1, mut n1) = match (layout_a, layout_b) {
            (LayoutTag::RowMajor, LayoutTag::RowMajor) => {
                if n >= 256 {
                    // A 256-wide B row burst is the bandwidth sweet spot
                    let (mut m1, n1) = (128, 256);
                    self.balance_workload(m, ceil_div(n, n1), &mut m1, 32);
                    (m1, n1)
                } else {
                    let (mut m1, n1) = (256, 128);
                    self.balance_workload(m, ceil_div(n, n1), &mut m1, 32);
                    self.grow_while_fits(m, ceil_div(n, n1), &mut m1, |t| self.fits(t, n1, 128));
                    (m1, n1)
                }
            }
            (LayoutTag::RowMajor, LayoutTag::ColumnMajor) => {
                // Both operands are K-contiguous: only balance matters
                let (mut m1, mut n1) = if m < n { (128, 256) } else { (256, 128) };
                if m < n {
                    self.balance_workload(n, ceil_div(m, m1), &mut n1, 64);
                    self.balance_workload(m, ceil_div(n, n1), &mut m1, 64);
                    self.grow_while_fits(n, ceil_div(m, m1), &mut n1, |t| self.fits(m1, t, 128));
                } else {
                    self.balance_workload(m, ceil_div(n, n1), &mut m1, 64);
                    self.balance_workload(n, ceil_div(m, m1), &mut n1, 64);
                    self.grow_while_fits(m, ceil_div(n, n1), &mut m1, |t| self.fits(t, n1, 128));
                }
                (m1, n1)
            }
            (LayoutTag::ColumnMajor, LayoutTag::RowMajor) => {
                let (mut m1, mut n1) = if m > n { (256, 128) } else { (128, 256) };
                m1 = m1.min(round_up(m, TILE_ALIGN));
                n1 = n1.min(round_up(n, TILE_ALIGN));
                let blocks = ceil_div(m, m1) * ceil_div(n, n1);
                let half = |t: usize| round_up(t / 2, TILE_ALIGN);
                if blocks <= self.cores() / 4 {
                    if n1 > TILE_ALIGN {
                        n1 = half(n1);
                    }
                    if m1 > TILE_ALIGN {
                        m1 = half(m1);
                    }
                } else if blocks <= self.cores() / 2 {
                    if m1 > n1 {
                        m1 = half(m1);
                    } else if n1 > TILE_ALIGN {
                        n1 = half(n1);
                    }
                }
                (m1, n1)
            }
            (LayoutTag::ColumnMajor, LayoutTag::ColumnMajor) => {
                if m >= 256 {
                    // A 256-tall A column burst is the bandwidth sweet spot
                    let (m1, mut n1) = (256, 128);
                    self.balance_workload(n, ceil_div(m, m1), &mut n1, 32);
                    (m1, n1)
                } else {
                    let (m1, mut n1) = (128, 256);
                    self.balance_workload(n, ceil_div(m, m1), &mut n1, 32);
                    self.grow_while_fits(n, ceil_div(m, m1), &mut n1, |t| self.fits(m1, t, 128));
                    (m1, n1)
                }
            }
        };

        if k >= HUGE_EXTENT || m > HUGE_EXTENT || n > HUGE_EXTENT {
            (m1, n1) = if layout_a == LayoutTag::ColumnMajor && (layout_b == LayoutTag::ColumnMajor || m > n) {
                (256, 128)
            } else {
                (128, 256)
            };
        } else {
            m1 = m1.min(round_up(m, TILE_ALIGN));
            n1 = n1.min(round_up(n, TILE_ALIGN));
            self.spread_to_cores(m, n, &mut m1, &mut n1);
        }

        let k1 = self.max_k1(m1, n1).min(round_up(k, TILE_ALIGN));
        trace!(m1, n1, k1, "initial L1 tile");
        GemmCoord::new(m1, n1, k1)
    }

    /// L0 tile for an L1 tile: full M/N, the deepest K slice both L0
    /// operand tiers can hold.
    pub fn l0_tile(&self, l1: GemmCoord) -> GemmCoord {
        let (mut m0, mut n0) = (l1.m, l1.n);
        loop {
            let by_a = self.platform.l0a_bytes / (m0 * self.sizes.a * self.stages.l0a_stages).max(1);
            let by_b = self.platform.l0b_bytes / (n0 * self.sizes.b * self.stages.l0b_stages).max(1);
            let k0 = round_down(by_a.min(by_b).min(round_up(l1.k, TILE_ALIGN)), TILE_ALIGN).min(l1.k);
            if k0 >= TILE_ALIGN.min(l1.k) && k0 > 0 {
                return GemmCoord::new(m0, n0, k0);
            }
            if m0 >= n0 && m0 > TILE_ALIGN {
                m0 = round_up(m0 / 2, TILE_ALIGN);
            } else if n0 > TILE_ALIGN {
                n0 = round_up(n0 / 2, TILE_ALIGN);
            } else {
                return GemmCoord::new(m0, n0, TILE_ALIGN.min(l1.k));
            }
        }
    }

    /// L1 tile plus its derived L0 tile
    pub fn tile_config(&self, l1: GemmCoord) -> TileConfig {
        TileConfig::new(l1, self.l0_tile(l1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_strategy(platform: &PlatformDescriptor) -> TilingStrategy<'_> {
        let sizes = ElementSizes {
            a: 4,
            b: 4,
            accumulator: 4,
            bias: None,
        };
        TilingStrategy::new(platform, sizes, StageConfig::ping_pong())
    }

    #[test]
    fn test_max_k1() {
        let platform = PlatformDescriptor::default();
        let strategy = f32_strategy(&platform);
        // 512 KiB / (2 * 384 * 4) = 170 -> 128
        assert_eq!(strategy.max_k1(128, 256), 128);
        assert_eq!(strategy.max_k1(16, 32), 1344);
    }

    #[test]
    fn test_max_k1_leaves_room_for_bias() {
        let platform = PlatformDescriptor::default();
        let sizes = ElementSizes {
            a: 4,
            b: 4,
            accumulator: 4,
            bias: Some(4),
        };
        let strategy = TilingStrategy::new(&platform, sizes, StageConfig::ping_pong());
        // (256 KiB - 128 * 4) / (256 * 4) = 255.5 -> 192
        assert_eq!(strategy.max_k1(128, 128), 192);
        assert!(strategy.fits(128, 128, 192));
        assert!(!strategy.fits(128, 128, 256));

        let l1 = strategy.l1_tile(GemmCoord::new(256, 256, 256), LayoutTag::ColumnMajor, LayoutTag::RowMajor);
        let tiles = strategy.tile_config(l1);
        assert!(tiles.validate(&platform, &sizes, &StageConfig::ping_pong()).is_ok(), "{tiles}");
    }

    #[test]
    fn test_large_row_major_keeps_bandwidth_tile() {
        let platform = PlatformDescriptor::default();
        let strategy = f32_strategy(&platform);
        let tile = strategy.l1_tile(GemmCoord::new(4096, 4096, 4096), LayoutTag::RowMajor, LayoutTag::RowMajor);
        assert_eq!(tile, GemmCoord::new(128, 256, 128));
    }

    #[test]
    fn test_vector_problem_spreads_over_cores() {
        let platform = PlatformDescriptor::default();
        let strategy = f32_strategy(&platform);
        let tile = strategy.l1_tile(GemmCoord::new(1, 512, 1024), LayoutTag::RowMajor, LayoutTag::RowMajor);
        assert_eq!(tile.m, 16);
        assert_eq!(tile.n, 32);
        assert_eq!(tile.k, 1024);
        assert!(GemmCoord::new(1, 512, 1024).tile_count_mn(&tile) <= platform.core_count);
    }

    #[test]
    fn test_tiles_always_fit() {
        let platform = PlatformDescriptor::default();
        for bias in [None, Some(4)] {
            let sizes = ElementSizes {
                a: 4,
                b: 4,
                accumulator: 4,
                bias,
            };
            let strategy = TilingStrategy::new(&platform, sizes, StageConfig::ping_pong());
            for &(m, n, k) in &[(1, 1, 1), (77, 300, 5000), (3000, 200, 64), (513, 2049, 100000), (100, 100, 3000)] {
                for &la in &[LayoutTag::RowMajor, LayoutTag::ColumnMajor] {
                    for &lb in &[LayoutTag::RowMajor, LayoutTag::ColumnMajor] {
                        let l1 = strategy.l1_tile(GemmCoord::new(m, n, k), la, lb);
                        let tiles = strategy.tile_config(l1);
                        let result = tiles.validate(&platform, &sizes, &StageConfig::ping_pong());
                        assert!(result.is_ok(), "{m}x{n}x{k} {la:?}/{lb:?} bias {bias:?}: {tiles} {result:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_l0_tile_fits_operand_tiers() {
        let platform = PlatformDescriptor::default();
        let strategy = f32_strategy(&platform);
        assert_eq!(strategy.l0_tile(GemmCoord::new(128, 256, 128)), GemmCoord::new(128, 256, 32));
        assert_eq!(strategy.l0_tile(GemmCoord::new(16, 32, 1024)), GemmCoord::new(16, 32, 256));
    }
}

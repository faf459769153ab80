//! Kernel variant selection
//!
//! A pure decision chain from problem shape and platform to a complete
//! [`TilingParameters`] record. Handlers run in order and the first one
//! that accepts the problem fixes the variant:
//!
//! 1. small matmul: one wave of tiles, one K tile, nothing to pad
//! 2. split-K: deep K with too few output tiles to fill the cores
//! 3. stream-K: a badly filled last wave of tiles over a deep K
//! 4. padding common: the cost model wants an operand rewritten
//! 5. common: everything else

use crate::coord::{ceil_div, GemmCoord};
use crate::cost_model::CostModel;
use crate::element::DataType;
use crate::hardware::{ElementSizes, PlatformDescriptor, StageConfig};
use crate::layout::{Layout, LayoutTag};
use crate::padding::{padding_tasks, PaddingTag};
use crate::params::{KernelVariant, PipelineKind, SplitMode, TilingParameters};
use crate::tiling::TilingStrategy;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tiles whose K panel can be rewritten at all
const MIN_SPLIT_K: usize = 128;

/// K from which every split-K tier applies
const DEEP_K: usize = 12288;

/// M x N above which padding the output is considered
const OUTPUT_PADDING_AREA: usize = 2048 * 2048;

/// Inner extent above which padding tasks are counted as extra launch width
const WIDE_INNER: usize = 192;

/// Everything the selector needs to know about a GEMM call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDescriptor {
    pub shape: GemmCoord,
    pub layout_a: LayoutTag,
    pub layout_b: LayoutTag,
    /// Element type of A and B
    pub element: DataType,
    /// Element type of C (and of the bias row)
    pub output: DataType,
    pub with_bias: bool,
}

impl ProblemDescriptor {
    pub fn new(shape: GemmCoord, layout_a: LayoutTag, layout_b: LayoutTag, element: DataType) -> Self {
        Self {
            shape,
            layout_a,
            layout_b,
            element,
            output: element,
            with_bias: false,
        }
    }

    pub fn with_output(mut self, output: DataType) -> Self {
        self.output = output;
        self
    }

    pub fn with_bias(mut self, with_bias: bool) -> Self {
        self.with_bias = with_bias;
        self
    }

    pub fn element_sizes(&self) -> ElementSizes {
        ElementSizes {
            a: self.element.size(),
            b: self.element.size(),
            accumulator: self.element.accumulator().size(),
            bias: self.with_bias.then(|| self.output.size()),
        }
    }
}

/// Result of a selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub params: TilingParameters,
    /// Whether the chosen tiles pass the static capacity check
    pub feasible: bool,
    /// A was treated as row-major while deciding
    pub normalized_a: bool,
    /// B was treated as column-major while deciding
    pub normalized_b: bool,
}

/// Output of the padding cost model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingDecision {
    pub a: PaddingTag,
    pub b: PaddingTag,
    pub c: PaddingTag,
}

impl PaddingDecision {
    pub fn any(&self) -> bool {
        self.a.is_padded() || self.b.is_padded() || self.c.is_padded()
    }
}

/// How one operand is streamed by the compute contexts
#[derive(Debug, Clone, Copy)]
struct OperandStream {
    outer: usize,
    inner: usize,
    /// Rows of one tile burst
    burst_rows: usize,
    /// Contiguous elements per burst
    burst_width: usize,
    /// Tiles along this operand's non-K axis
    tiles_along: usize,
    /// Non-K extent of one tile
    tile_extent: usize,
    element_size: usize,
}

impl OperandStream {
    fn a(params: &TilingParameters, element_size: usize) -> Self {
        let GemmCoord { m, n: _, k } = params.problem;
        let l1 = params.tiles.l1;
        let (outer, inner, burst_rows, burst_width) = match params.layout_a {
            LayoutTag::RowMajor => (m, k, m.min(l1.m), k.min(l1.k)),
            LayoutTag::ColumnMajor => (k, m, k.min(l1.k), m.min(l1.m)),
        };
        Self {
            outer,
            inner,
            burst_rows,
            burst_width,
            tiles_along: ceil_div(m, l1.m),
            tile_extent: m.min(l1.m),
            element_size,
        }
    }

    fn b(params: &TilingParameters, element_size: usize) -> Self {
        let GemmCoord { m: _, n, k } = params.problem;
        let l1 = params.tiles.l1;
        let (outer, inner, burst_rows, burst_width) = match params.layout_b {
            LayoutTag::RowMajor => (k, n, k.min(l1.k), n.min(l1.n)),
            LayoutTag::ColumnMajor => (n, k, n.min(l1.n), k.min(l1.k)),
        };
        Self {
            outer,
            inner,
            burst_rows,
            burst_width,
            tiles_along: ceil_div(n, l1.n),
            tile_extent: n.min(l1.n),
            element_size,
        }
    }

    /// Small inner extents stream so badly that padding is forced
    fn needs_forced_padding(&self) -> bool {
        (self.inner < 8 || (self.inner < 32 && self.inner % 16 != 0)) && self.outer > 512
    }
}

/// Padding work of one operand on the transfer contexts
struct PaddingWork {
    tasks: usize,
    /// Bytes moved by the busiest transfer context
    max_bytes: usize,
}

/// Kernel variant selector for one platform and cost table
pub struct Selector<'a> {
    platform: &'a PlatformDescriptor,
    cost_model: &'a CostModel,
}

type Handler<'a> = fn(&Selector<'a>, &mut TilingParameters, &ProblemDescriptor, &PaddingDecision) -> bool;

impl<'a> Selector<'a> {
    pub fn new(platform: &'a PlatformDescriptor, cost_model: &'a CostModel) -> Self {
        Self { platform, cost_model }
    }

    fn cores(&self) -> usize {
        self.platform.core_count.max(1)
    }

    fn strategy(&self, problem: &ProblemDescriptor) -> TilingStrategy<'a> {
        TilingStrategy::new(self.platform, problem.element_sizes(), StageConfig::ping_pong())
    }

    /// Run the decision chain. Never fails for a non-empty shape.
    pub fn select(&self, problem: &ProblemDescriptor) -> Selection {
        let GemmCoord { m, n, k } = problem.shape;
        let mut working = *problem;
        let normalized_a = m == 1 && problem.layout_a == LayoutTag::ColumnMajor;
        let normalized_b = n == 1 && problem.layout_b == LayoutTag::RowMajor;
        if normalized_a {
            working.layout_a = LayoutTag::RowMajor;
        }
        if normalized_b {
            working.layout_b = LayoutTag::ColumnMajor;
        }

        let strategy = self.strategy(&working);
        let l1 = strategy.l1_tile(working.shape, working.layout_a, working.layout_b);
        let mut params = TilingParameters::common(
            working.shape,
            working.layout_a,
            working.layout_b,
            working.element,
            strategy.tile_config(l1),
            self.cores(),
        );
        let initial = self.padding_tags(&params, &working);
        debug!(%l1, a = ?initial.a, b = ?initial.b, c = ?initial.c, "initial tiling");

        let handlers: [(&str, Handler<'a>); 5] = [
            ("small-matmul", Selector::small_matmul),
            ("split-k", Selector::split_k),
            ("stream-k", Selector::stream_k),
            ("padding-common", Selector::padding_common),
            ("common", Selector::common),
        ];
        let rule = handlers
            .iter()
            .find(|(_, handler)| handler(self, &mut params, &working, &initial))
            .map_or("common", |(name, _)| *name);

        // The data itself is never transposed
        params.layout_a = problem.layout_a;
        params.layout_b = problem.layout_b;
        params.stride_a = Layout::natural(problem.layout_a, m, k).stride();
        params.stride_b = Layout::natural(problem.layout_b, k, n).stride();
        params.stride_c = n;
        params.swizzle_offset = 3;
        params.swizzle_direction = if m > n { 0 } else { 1 };
        let blocks = params.problem.tile_count_mn(&params.tiles.l1) * params.split_factor;
        params.block_dim = match params.variant {
            KernelVariant::StreamK => self.cores(),
            _ => blocks.min(self.cores()).max(1),
        };

        let stages = params.pipeline.stages();
        let feasible = self.platform.validate().is_ok()
            && params
                .tiles
                .validate(self.platform, &problem.element_sizes(), &stages)
                .is_ok();
        debug!(
            rule,
            variant = %params.variant,
            tiles = %params.tiles,
            split = params.split_factor,
            block_dim = params.block_dim,
            feasible,
            "variant selected"
        );
        Selection {
            params,
            feasible,
            normalized_a,
            normalized_b,
        }
    }

    /// Per-operand padding decision from the bandwidth cost model
    pub fn padding_tags(&self, params: &TilingParameters, problem: &ProblemDescriptor) -> PaddingDecision {
        let model = self.cost_model;
        let cores = self.cores();
        let GemmCoord { m, n, k } = params.problem;
        let l1 = params.tiles.l1;
        let split = params.split_factor.max(1);
        let sizes = problem.element_sizes();
        let a = OperandStream::a(params, sizes.a);
        let b = OperandStream::b(params, sizes.b);

        let ceiling = model.core_ceiling(cores);
        let tasks_compute = params.problem.tile_count_mn(&l1);
        let mut block_dim = tasks_compute.min(cores);
        let before_a = self.bandwidth_before_padding(&a, block_dim, k <= l1.k, ceiling);
        let before_b = self.bandwidth_before_padding(&b, block_dim, k <= l1.k, ceiling);
        let after = ceiling;
        let transfer_a = model.transfer_bandwidth_for(m * k * sizes.a, self.platform.l2_bytes);
        let transfer_b = model.transfer_bandwidth_for(k * n * sizes.b, self.platform.l2_bytes);

        let rounds = ceil_div(tasks_compute * split, cores);
        let k_slice = ceil_div(k, split);
        let compute_a = (rounds * a.tile_extent * k_slice * a.element_size) as f64;
        let compute_b = (rounds * b.tile_extent * k_slice * b.element_size) as f64;

        let work_a = self.padding_work(&a, params.layout_a);
        let work_b = self.padding_work(&b, params.layout_b);
        let transfer_block_dim = ceil_div(
            work_a.tasks.max(work_b.tasks),
            self.platform.transfer_units_per_core.max(1),
        )
        .min(cores);
        if a.inner > WIDE_INNER && b.inner > WIDE_INNER {
            block_dim = block_dim.max(transfer_block_dim);
        }
        let head = model.head_cost(block_dim, cores);

        let pad_a = work_a.max_bytes as f64 / transfer_a / 1000.0;
        let pad_b = work_b.max_bytes as f64 / transfer_b / 1000.0;
        let t00 = compute_a / before_a / 1000.0 + compute_b / before_b / 1000.0;
        let t01 = compute_a / before_a / 1000.0 + compute_b / after / 1000.0 + pad_b + head;
        let t10 = compute_a / after / 1000.0 + compute_b / before_b / 1000.0 + pad_a + head;
        let t11 = compute_a / after / 1000.0 + compute_b / after / 1000.0 + pad_a + pad_b + head + model.dual_padding_us;

        let scenarios = [
            (t00, PaddingTag::None, PaddingTag::None),
            (t01, PaddingTag::None, PaddingTag::Nz),
            (t10, PaddingTag::Nz, PaddingTag::None),
            (t11, PaddingTag::Nz, PaddingTag::Nz),
        ];
        let (mut best, mut tag_a, mut tag_b) = scenarios[0];
        for &(cost, scenario_a, scenario_b) in &scenarios[1..] {
            if cost < best {
                (best, tag_a, tag_b) = (cost, scenario_a, scenario_b);
            }
        }
        if a.needs_forced_padding() {
            tag_a = PaddingTag::Nz;
        }
        if b.needs_forced_padding() {
            tag_b = PaddingTag::Nz;
        }

        let mut tag_c = PaddingTag::None;
        if m * n > OUTPUT_PADDING_AREA && n > 256 && n % 128 != 0 {
            let traffic = m * k * ceil_div(n, l1.n) * sizes.a
                + k * n * ceil_div(m, l1.m) * sizes.b
                + m * n * problem.output.size();
            if traffic < self.platform.l2_bytes {
                tag_c = PaddingTag::Nd;
            }
        }
        debug!(t00, t01, t10, t11, a = ?tag_a, b = ?tag_b, c = ?tag_c, "padding cost");
        PaddingDecision {
            a: tag_a,
            b: tag_b,
            c: tag_c,
        }
    }

    fn bandwidth_before_padding(&self, operand: &OperandStream, block_dim: usize, single_k: bool, ceiling: f64) -> f64 {
        let mut band = self
            .cost_model
            .bandwidth(operand.burst_rows, operand.burst_width, operand.inner, ceiling);
        // A thin operand is re-read by every core that shares its tiles
        if operand.tiles_along < block_dim / 2 && single_k && operand.tiles_along <= 2 {
            band = band / (block_dim / operand.tiles_along) as f64 * 1.5;
        }
        band
    }

    fn padding_work(&self, operand: &OperandStream, tag: LayoutTag) -> PaddingWork {
        let (rows, cols) = match tag {
            LayoutTag::RowMajor => (operand.outer, operand.inner),
            LayoutTag::ColumnMajor => (operand.inner, operand.outer),
        };
        let natural = Layout::natural(tag, rows, cols);
        let tasks = padding_tasks(&natural, operand.element_size, self.cost_model.padding_task_bytes);
        let task_elements = tasks.first().map_or(0, |t| t.outer_len * t.inner_len);
        let per_unit = ceil_div(tasks.len(), self.platform.transfer_unit_count().max(1));
        PaddingWork {
            tasks: tasks.len(),
            max_bytes: per_unit * task_elements * operand.element_size,
        }
    }

    /// Bandwidth-optimal tile used by the split variants
    fn candidate_tile(problem: &ProblemDescriptor) -> GemmCoord {
        let wide_m = problem.layout_a == LayoutTag::ColumnMajor
            && (problem.layout_b == LayoutTag::ColumnMajor || problem.shape.m > problem.shape.n);
        if wide_m {
            GemmCoord::new(256, 128, 128)
        } else {
            GemmCoord::new(128, 256, 128)
        }
    }

    fn small_matmul(&self, params: &mut TilingParameters, _problem: &ProblemDescriptor, padding: &PaddingDecision) -> bool {
        if padding.any() {
            return false;
        }
        let blocks = params.problem.tile_count_mn(&params.tiles.l1);
        if blocks <= self.cores() && params.problem.k <= params.tiles.l1.k {
            params.variant = KernelVariant::SmallMatmul;
            return true;
        }
        false
    }

    fn split_k(&self, params: &mut TilingParameters, problem: &ProblemDescriptor, _padding: &PaddingDecision) -> bool {
        let GemmCoord { m: _, n: _, k } = params.problem;
        if k <= MIN_SPLIT_K {
            return false;
        }
        let cores = self.cores();
        let original_blocks = params.problem.tile_count_mn(&params.tiles.l1);
        let tile = Self::candidate_tile(problem);
        let blocks = params.problem.tile_count_mn(&tile);

        let max_split = if k >= DEEP_K {
            cores
        } else if k > 8192 {
            8
        } else if k > 1024 {
            4
        } else {
            2
        };
        let mut split = (cores / blocks).min(max_split);
        if k >= DEEP_K {
            split = split.max(4);
        } else if k > 8192 {
            split = split.max(2);
        }
        split = split.min(ceil_div(k, tile.k));
        if split <= 1 || blocks * split < original_blocks {
            return false;
        }
        let worthwhile = (blocks <= cores / 2 && k > 5120) || (blocks <= 2 && k > 1024) || k >= DEEP_K;
        if !worthwhile {
            return false;
        }

        params.tiles = self.strategy(problem).tile_config(tile);
        params.split_factor = split;
        params.split_mode = if blocks < cores {
            SplitMode::Partitioned
        } else {
            SplitMode::Sequential
        };
        let padding = self.padding_tags(params, problem);
        params.padding_a = padding.a;
        params.padding_b = padding.b;
        params.padding_c = PaddingTag::None;
        params.variant = KernelVariant::SplitK;
        true
    }

    fn stream_k(&self, params: &mut TilingParameters, problem: &ProblemDescriptor, _padding: &PaddingDecision) -> bool {
        let cores = self.cores();
        let tile = Self::candidate_tile(problem);
        let blocks = params.problem.tile_count_mn(&tile);
        let tail = blocks % cores;
        let unbalanced = blocks > cores && blocks < 8 * cores && tail > 0 && (tail as f64) < 0.8 * cores as f64;
        if !unbalanced || params.problem.k <= 3072 {
            return false;
        }
        params.tiles = self.strategy(problem).tile_config(tile);
        let padding = self.padding_tags(params, problem);
        params.padding_a = padding.a;
        params.padding_b = padding.b;
        params.padding_c = PaddingTag::None;
        params.variant = KernelVariant::StreamK;
        true
    }

    fn padding_common(&self, params: &mut TilingParameters, _problem: &ProblemDescriptor, padding: &PaddingDecision) -> bool {
        if !padding.any() {
            return false;
        }
        params.padding_a = padding.a;
        params.padding_b = padding.b;
        params.padding_c = padding.c;
        if padding.c.is_padded() {
            params.pipeline = PipelineKind::PreloadAsync;
        }
        params.variant = KernelVariant::PaddingCommon;
        true
    }

    fn common(&self, params: &mut TilingParameters, _problem: &ProblemDescriptor, _padding: &PaddingDecision) -> bool {
        params.variant = KernelVariant::Common;
        true
    }
}

/// Select a kernel variant for `problem`
pub fn select_variant(problem: &ProblemDescriptor, platform: &PlatformDescriptor, cost_model: &CostModel) -> Selection {
    Selector::new(platform, cost_model).select(problem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn select(m: usize, n: usize, k: usize, la: LayoutTag, lb: LayoutTag) -> Selection {
        select_biased(m, n, k, la, lb, false)
    }

    fn select_biased(m: usize, n: usize, k: usize, la: LayoutTag, lb: LayoutTag, bias: bool) -> Selection {
        let problem = ProblemDescriptor::new(GemmCoord::new(m, n, k), la, lb, DataType::F32).with_bias(bias);
        select_variant(&problem, &PlatformDescriptor::default(), &CostModel::default())
    }

    #[test]
    fn test_thin_problem_takes_small_matmul() {
        let selection = select(1, 512, 1024, LayoutTag::ColumnMajor, LayoutTag::RowMajor);
        let params = &selection.params;
        assert_eq!(params.variant, KernelVariant::SmallMatmul);
        assert!(selection.normalized_a);
        assert!(!selection.normalized_b);
        assert_eq!(params.layout_a, LayoutTag::ColumnMajor);
        assert_eq!(params.tiles.l1, GemmCoord::new(16, 32, 1024));
        assert_eq!(params.split_factor, 1);
        assert!(selection.feasible);
    }

    #[test]
    fn test_deep_k_takes_sequential_split_k() {
        let selection = select(4096, 4096, 16384, LayoutTag::RowMajor, LayoutTag::RowMajor);
        let params = &selection.params;
        assert_eq!(params.variant, KernelVariant::SplitK);
        assert_eq!(params.split_mode, SplitMode::Sequential);
        assert_eq!(params.split_factor, 4);
        assert_eq!(params.tiles.l1, GemmCoord::new(128, 256, 128));
        assert_eq!(params.padding_c, PaddingTag::None);
        assert_eq!(params.block_dim, 24);
        assert!(selection.feasible);
    }

    #[test]
    fn test_few_tiles_take_partitioned_split_k() {
        let selection = select(256, 256, 10000, LayoutTag::RowMajor, LayoutTag::RowMajor);
        let params = &selection.params;
        assert_eq!(params.variant, KernelVariant::SplitK);
        assert_eq!(params.split_mode, SplitMode::Partitioned);
        // 2 tiles, 24 / 2 = 12 capped at 8
        assert_eq!(params.split_factor, 8);
        assert_eq!(params.block_dim, 16);
    }

    #[test]
    fn test_ragged_last_wave_takes_stream_k() {
        // 10 x 6 = 60 tiles on 24 cores: 12 left over
        let selection = select(1280, 1536, 4096, LayoutTag::RowMajor, LayoutTag::RowMajor);
        let params = &selection.params;
        assert_eq!(params.variant, KernelVariant::StreamK);
        assert_eq!(params.split_factor, 1);
        assert_eq!(params.block_dim, 24);
        assert_eq!(params.padding_c, PaddingTag::None);
    }

    #[test]
    fn test_narrow_operand_forces_padding() {
        let selection = select(1024, 64, 4, LayoutTag::RowMajor, LayoutTag::RowMajor);
        let params = &selection.params;
        assert_eq!(params.variant, KernelVariant::PaddingCommon);
        assert_eq!(params.padding_a, PaddingTag::Nz);
    }

    #[test]
    fn test_large_misaligned_output_is_padded() {
        let selection = select(4096, 2100, 64, LayoutTag::RowMajor, LayoutTag::RowMajor);
        let params = &selection.params;
        assert_eq!(params.variant, KernelVariant::PaddingCommon);
        assert_eq!(params.padding_c, PaddingTag::Nd);
        assert_eq!(params.pipeline, PipelineKind::PreloadAsync);
        assert!(selection.feasible);
    }

    #[test]
    fn test_swizzle_follows_aspect_ratio() {
        assert_eq!(select(512, 128, 64, LayoutTag::RowMajor, LayoutTag::RowMajor).params.swizzle_direction, 0);
        assert_eq!(select(128, 512, 64, LayoutTag::RowMajor, LayoutTag::RowMajor).params.swizzle_direction, 1);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let shapes = [(1, 512, 1024), (4096, 4096, 16384), (1280, 1536, 4096), (77, 3001, 129), (5, 5, 5)];
        for &(m, n, k) in &shapes {
            for la in [LayoutTag::RowMajor, LayoutTag::ColumnMajor] {
                for lb in [LayoutTag::RowMajor, LayoutTag::ColumnMajor] {
                    let first = select(m, n, k, la, lb);
                    let second = select(m, n, k, la, lb);
                    assert_eq!(first, second);
                    assert_eq!(first.params.to_bytes().unwrap(), second.params.to_bytes().unwrap());
                }
            }
        }
    }

    #[test]
    fn test_bias_row_keeps_full_k_tiles_feasible() {
        // Without bias both of these fill L1 exactly
        let selection = select_biased(100, 100, 3000, LayoutTag::RowMajor, LayoutTag::RowMajor, true);
        assert!(selection.feasible, "{}", selection.params.tiles);
        let selection = select_biased(16, 256, 3000, LayoutTag::RowMajor, LayoutTag::ColumnMajor, true);
        assert!(selection.feasible, "{}", selection.params.tiles);
        assert!(select(100, 100, 3000, LayoutTag::RowMajor, LayoutTag::RowMajor).feasible);
    }

    #[test]
    fn test_every_selection_is_well_formed() {
        let shapes = [
            (1, 1, 1),
            (1, 4096, 8),
            (4096, 1, 8),
            (300, 300, 300),
            (33, 4097, 13000),
            (100, 100, 3000),
            (256, 256, 256),
        ];
        for &(m, n, k) in &shapes {
            for la in [LayoutTag::RowMajor, LayoutTag::ColumnMajor] {
                for lb in [LayoutTag::RowMajor, LayoutTag::ColumnMajor] {
                    for bias in [false, true] {
                        let selection = select_biased(m, n, k, la, lb, bias);
                        let params = &selection.params;
                        assert!(params.check().is_ok(), "{m}x{n}x{k}: {params}");
                        assert!(params.block_dim >= 1 && params.block_dim <= 24);
                        assert!(selection.feasible, "{m}x{n}x{k} {la:?}/{lb:?} bias {bias}");
                    }
                }
            }
        }
    }
}

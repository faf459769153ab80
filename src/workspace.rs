//! Workspace planning
//!
//! One device allocation per launch holds every scratch region a variant
//! needs, each starting on a 512-byte boundary:
//!
//! * the padded copy of A, when A is padded
//! * the padded copy of B, when B is padded
//! * the C-side region: split-K slices, the stream-K partial slots, an
//!   accumulator-typed copy of C, or the padded output

use crate::coord::{round_up, MatrixCoord};
use crate::element::DataType;
use crate::layout::{Layout, LayoutTag};
use crate::memory::{BufferHandle, Region};
use crate::padding::{padded_layout, PaddingTag, ND_ALIGN_BYTES};
use crate::params::{KernelVariant, SplitMode, TilingParameters};
use serde::Serialize;

/// A padded operand copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperandRegion {
    pub offset: usize,
    pub bytes: usize,
    pub layout: Layout,
}

/// What the C-side region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutputWorkspace {
    /// `split` row-major `m x n` accumulator slices
    SplitSlices { split: usize },
    /// One row-major `m x n` accumulator matrix
    Accumulator,
    /// Two `m1 x n1` accumulator slots per core
    StreamKSlots { slots: usize },
    /// Output elements in the padded layout
    PaddedOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputRegion {
    pub offset: usize,
    pub bytes: usize,
    pub kind: OutputWorkspace,
    pub layout: Layout,
}

/// Scratch layout of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkspacePlan {
    pub a: Option<OperandRegion>,
    pub b: Option<OperandRegion>,
    pub c: Option<OutputRegion>,
    /// End of the last region
    pub bytes: usize,
}

impl WorkspacePlan {
    /// Regions needed by `params` when the output element is `output`
    pub fn new(params: &TilingParameters, output: DataType) -> Self {
        let problem = params.problem;
        let tile = params.tiles.l1;
        let element = params.element.size();
        let accumulator = params.element.accumulator().size();
        let mut cursor = 0;
        let mut place = |bytes: usize| {
            let offset = round_up(cursor, ND_ALIGN_BYTES);
            cursor = offset + bytes;
            offset
        };

        let mut operand = |tag: PaddingTag, natural: Layout, block: MatrixCoord| {
            if !tag.is_padded() {
                return None;
            }
            let layout = padded_layout(&natural, tag, block, element);
            let bytes = layout.capacity() * element;
            Some(OperandRegion {
                offset: place(bytes),
                bytes,
                layout,
            })
        };
        let a = operand(
            params.padding_a,
            Layout::strided(params.layout_a, problem.m, problem.k, params.stride_a),
            tile.mk(),
        );
        let b = operand(
            params.padding_b,
            Layout::strided(params.layout_b, problem.k, problem.n, params.stride_b),
            tile.kn(),
        );

        let dense = Layout::row_major(problem.m, problem.n);
        let c_side = match params.variant {
            KernelVariant::SplitK if params.split_mode == SplitMode::Partitioned => {
                let split = params.split_factor;
                Some((OutputWorkspace::SplitSlices { split }, dense, split * dense.capacity() * accumulator))
            }
            KernelVariant::SplitK if output != params.element.accumulator() => {
                Some((OutputWorkspace::Accumulator, dense, dense.capacity() * accumulator))
            }
            KernelVariant::StreamK => {
                let slots = 2 * params.block_dim;
                let slot = Layout::row_major(tile.m, tile.n);
                Some((OutputWorkspace::StreamKSlots { slots }, slot, slots * slot.capacity() * accumulator))
            }
            KernelVariant::Common | KernelVariant::SmallMatmul | KernelVariant::PaddingCommon
                if params.padding_c.is_padded() =>
            {
                let natural = Layout::strided(LayoutTag::RowMajor, problem.m, problem.n, params.stride_c);
                let layout = padded_layout(&natural, params.padding_c, tile.mn(), output.size());
                Some((OutputWorkspace::PaddedOutput, layout, layout.capacity() * output.size()))
            }
            _ => None,
        };
        let c = c_side.map(|(kind, layout, bytes)| OutputRegion {
            offset: place(bytes),
            bytes,
            kind,
            layout,
        });

        Self { a, b, c, bytes: cursor }
    }

    /// Region of the padded A copy inside `workspace`
    pub fn a_region(&self, workspace: BufferHandle) -> Option<Region> {
        self.a.map(|r| workspace.region().slice(r.offset, r.bytes))
    }

    pub fn b_region(&self, workspace: BufferHandle) -> Option<Region> {
        self.b.map(|r| workspace.region().slice(r.offset, r.bytes))
    }

    pub fn c_region(&self, workspace: BufferHandle) -> Option<Region> {
        self.c.map(|r| workspace.region().slice(r.offset, r.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::GemmCoord;
    use crate::hardware::TileConfig;
    use pretty_assertions::assert_eq;

    fn params(problem: GemmCoord) -> TilingParameters {
        let tiles = TileConfig::new(GemmCoord::new(128, 256, 128), GemmCoord::new(128, 256, 64));
        TilingParameters::common(problem, LayoutTag::RowMajor, LayoutTag::RowMajor, DataType::F16, tiles, 24)
    }

    #[test]
    fn test_common_needs_nothing() {
        let plan = WorkspacePlan::new(&params(GemmCoord::new(512, 512, 512)), DataType::F16);
        assert_eq!(plan.bytes, 0);
        assert!(plan.a.is_none() && plan.b.is_none() && plan.c.is_none());
    }

    #[test]
    fn test_partitioned_split_slices() {
        let mut p = params(GemmCoord::new(256, 256, 10000));
        p.variant = KernelVariant::SplitK;
        p.split_mode = SplitMode::Partitioned;
        p.split_factor = 8;
        let plan = WorkspacePlan::new(&p, DataType::F16);
        let c = plan.c.unwrap();
        assert_eq!(c.kind, OutputWorkspace::SplitSlices { split: 8 });
        assert_eq!(plan.bytes, 8 * 256 * 256 * 4);
    }

    #[test]
    fn test_sequential_split_needs_workspace_only_when_narrowing() {
        let mut p = params(GemmCoord::new(4096, 4096, 16384));
        p.variant = KernelVariant::SplitK;
        p.split_mode = SplitMode::Sequential;
        p.split_factor = 4;
        assert_eq!(WorkspacePlan::new(&p, DataType::F16).bytes, 4096 * 4096 * 4);
        assert_eq!(WorkspacePlan::new(&p, DataType::F32).bytes, 0);
    }

    #[test]
    fn test_regions_are_aligned_and_disjoint() {
        let mut p = params(GemmCoord::new(100, 60, 30));
        p.variant = KernelVariant::PaddingCommon;
        p.padding_a = PaddingTag::Nd;
        p.padding_b = PaddingTag::Nz;
        p.padding_c = PaddingTag::Nd;
        let plan = WorkspacePlan::new(&p, DataType::F16);
        let (a, b, c) = (plan.a.unwrap(), plan.b.unwrap(), plan.c.unwrap());
        for offset in [a.offset, b.offset, c.offset] {
            assert_eq!(offset % ND_ALIGN_BYTES, 0);
        }
        assert!(a.offset + a.bytes <= b.offset);
        assert!(b.offset + b.bytes <= c.offset);
        assert_eq!(plan.bytes, c.offset + c.bytes);
        assert_eq!(c.kind, OutputWorkspace::PaddedOutput);
        assert_eq!(c.layout.stride(), 256);
    }

    #[test]
    fn test_stream_k_slots() {
        let mut p = params(GemmCoord::new(1280, 1536, 4096));
        p.variant = KernelVariant::StreamK;
        let plan = WorkspacePlan::new(&p, DataType::F16);
        assert_eq!(plan.c.unwrap().kind, OutputWorkspace::StreamKSlots { slots: 48 });
        assert_eq!(plan.bytes, 48 * 128 * 256 * 4);
    }
}

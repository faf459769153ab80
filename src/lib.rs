//! Staged GEMM
//!
//! This library plans and runs `C = A x B (+ bias)` on a multi-core
//! accelerator with tiered on-chip memory. A pure selector picks one of
//! five kernel variants and a full set of tiling parameters from the
//! problem shape; the kernel then runs every compute and transfer context
//! of the launch against simulated device memory.
//!
//! # Example
//!
//! ```rust
//! use staged_gemm::{plan, CostModel, GemmCoord, LayoutTag, PlatformDescriptor, ProblemDescriptor};
//! use staged_gemm::{DataType, KernelVariant};
//!
//! let problem = ProblemDescriptor::new(
//!     GemmCoord::new(4096, 4096, 16384),
//!     LayoutTag::RowMajor,
//!     LayoutTag::RowMajor,
//!     DataType::F32,
//! );
//! let selection = plan(&problem, &PlatformDescriptor::default(), &CostModel::default());
//! assert_eq!(selection.params.variant, KernelVariant::SplitK);
//! ```

pub mod block_mmad;
pub mod coord;
pub mod cost_model;
pub mod element;
pub mod error;
pub mod hardware;
pub mod kernel;
pub mod launcher;
pub mod layout;
pub mod memory;
pub mod padding;
pub mod params;
pub mod reduction;
pub mod reference;
pub mod scheduler;
pub mod selector;
pub mod sync;
pub mod tiling;
pub mod workspace;

pub use coord::{GemmCoord, MatrixCoord};
pub use cost_model::CostModel;
pub use element::{DataType, Element};
pub use error::{GemmError, GemmResult};
pub use hardware::{PlatformDescriptor, StageConfig, TileConfig};
pub use kernel::{GemmArguments, GemmKernel, LaunchArguments};
pub use launcher::{Launcher, ThreadLauncher};
pub use layout::{Layout, LayoutTag};
pub use memory::{Allocator, BufferHandle, DeviceMemory};
pub use padding::PaddingTag;
pub use params::{KernelVariant, PipelineKind, SplitMode, TilingParameters};
pub use selector::{select_variant, ProblemDescriptor, Selection};
pub use tiling::TilingStrategy;
pub use workspace::WorkspacePlan;

use tracing::debug;

/// Choose a kernel variant and tiling for `problem`
pub fn plan(problem: &ProblemDescriptor, platform: &PlatformDescriptor, cost_model: &CostModel) -> Selection {
    select_variant(problem, platform, cost_model)
}

/// Host operands of one call to [`matmul`]
#[derive(Debug, Clone, Copy)]
pub struct HostOperands<'a, E, O> {
    pub a: &'a [E],
    pub layout_a: Layout,
    pub b: &'a [E],
    pub layout_b: Layout,
    pub bias: Option<&'a [O]>,
}

/// Plan, upload, launch and download in one call. The result is row-major
/// `m x n`.
pub fn matmul<E, O>(
    memory: &DeviceMemory,
    launcher: &dyn Launcher,
    platform: &PlatformDescriptor,
    cost_model: &CostModel,
    operands: HostOperands<'_, E, O>,
) -> GemmResult<(Selection, Vec<O>)>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    let HostOperands {
        a,
        layout_a,
        b,
        layout_b,
        bias,
    } = operands;
    if layout_a.cols != layout_b.rows {
        return Err(GemmError::shape(
            format!("B with {} rows", layout_a.cols),
            format!("B with {} rows", layout_b.rows),
        ));
    }
    let problem = GemmCoord::new(layout_a.rows, layout_b.cols, layout_a.cols);
    for (name, data, layout) in [("A", a, &layout_a), ("B", b, &layout_b)] {
        if data.len() < layout.capacity() {
            return Err(GemmError::shape(
                format!("{name} with {} elements", layout.capacity()),
                format!("{name} with {} elements", data.len()),
            ));
        }
    }
    if let Some(bias) = bias {
        if bias.len() < problem.n {
            return Err(GemmError::shape(
                format!("bias with {} elements", problem.n),
                format!("bias with {} elements", bias.len()),
            ));
        }
    }

    let descriptor = ProblemDescriptor::new(problem, layout_a.tag, layout_b.tag, E::DTYPE)
        .with_output(O::DTYPE)
        .with_bias(bias.is_some());
    let selection = plan(&descriptor, platform, cost_model);
    if !selection.feasible {
        return Err(GemmError::infeasible(format!(
            "no tiling of {problem} fits the platform ({})",
            selection.params.tiles
        )));
    }
    debug!(variant = %selection.params.variant, "selected");

    let layout_c = Layout::row_major(problem.m, problem.n);
    let args = GemmArguments {
        problem,
        layout_a,
        layout_b,
        layout_c,
        a: memory.upload(a),
        b: memory.upload(b),
        c: memory.allocate(layout_c.capacity() * O::size()),
        bias: bias.map(|bias| memory.upload(bias)),
    };
    let kernel = GemmKernel::<E, O>::new(platform.clone());
    let launch = kernel.initialize(memory, &args, &selection.params)?;
    kernel.launch(memory, launcher, &launch)?;
    let c = memory.download::<O>(args.c, layout_c.capacity())?;

    let scratch = [launch.blob, args.a, args.b, args.c];
    for handle in scratch.into_iter().chain(launch.workspace).chain(args.bias) {
        memory.release(handle)?;
    }
    Ok((selection, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{fill_pattern, reference_gemm};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_matmul_releases_everything() {
        let memory = DeviceMemory::new();
        let platform = PlatformDescriptor::new(4, 2);
        let layout_a = Layout::row_major(33, 20);
        let layout_b = Layout::row_major(20, 17);
        let a: Vec<i32> = fill_pattern(layout_a.capacity(), 5);
        let b: Vec<i32> = fill_pattern(layout_b.capacity(), 6);
        let bias: Vec<i32> = fill_pattern(17, 7);
        let operands = HostOperands {
            a: &a,
            layout_a,
            b: &b,
            layout_b,
            bias: Some(bias.as_slice()),
        };
        let (_, c) = matmul(&memory, &ThreadLauncher, &platform, &CostModel::default(), operands).unwrap();
        let want = reference_gemm::<i32, i32>(&a, &layout_a, &b, &layout_b, Some(bias.as_slice()), GemmCoord::new(33, 17, 20));
        assert_eq!(c, want);
        assert_eq!(memory.live_buffers(), 0);
    }

    #[test]
    fn test_matmul_rejects_inner_mismatch() {
        let memory = DeviceMemory::new();
        let operands = HostOperands::<f32, f32> {
            a: &[0.0; 6],
            layout_a: Layout::row_major(2, 3),
            b: &[0.0; 8],
            layout_b: Layout::row_major(4, 2),
            bias: None,
        };
        let result = matmul(
            &memory,
            &ThreadLauncher,
            &PlatformDescriptor::default(),
            &CostModel::default(),
            operands,
        );
        assert!(matches!(result, Err(GemmError::ShapeMismatch { .. })));
    }
}

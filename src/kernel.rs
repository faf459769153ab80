//! Kernel entry
//!
//! [`GemmKernel`] checks a problem against a set of tiling parameters,
//! sizes and allocates the workspace, writes the parameter blob, and runs
//! the launch. Every execution context enters the same body and branches
//! on its role: compute contexts drive the block MMA over the tiles their
//! scheduler hands them, transfer contexts pad operands beforehand and
//! run the reduction or epilogue passes afterwards.

use crate::block_mmad::{
    BlockMmad, DrainCallbacks, DrainTarget, MmadTile, OperandView, PingPongMmad, PreloadAsyncMmad,
};
use crate::coord::{GemmCoord, MatrixCoord};
use crate::element::Element;
use crate::error::{GemmError, GemmResult};
use crate::hardware::{ElementSizes, PlatformDescriptor};
use crate::launcher::{CoreRole, ExecContext, Launcher};
use crate::layout::Layout;
use crate::memory::{Allocator, BufferHandle, DeviceMemory, Region};
use crate::padding::{pad_operand, remove_padding};
use crate::params::{KernelVariant, PipelineKind, TilingParameters};
use crate::reduction::{reduce_slices, reduce_stream_k, remove_padding_cast};
use crate::scheduler::{BlockScheduler, IdentityScheduler, SplitKScheduler, StreamKScheduler};
use crate::sync::{ComputeSignal, CoreSync, EpilogueMessage, TransferSignal};
use crate::workspace::{OutputRegion, OutputWorkspace, WorkspacePlan};
use std::marker::PhantomData;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Device operands of one GEMM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmArguments {
    pub problem: GemmCoord,
    pub layout_a: Layout,
    pub layout_b: Layout,
    pub layout_c: Layout,
    pub a: BufferHandle,
    pub b: BufferHandle,
    pub c: BufferHandle,
    /// One output-typed value per column of C
    pub bias: Option<BufferHandle>,
}

/// Everything a launch needs, as produced by [`GemmKernel::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchArguments {
    pub arguments: GemmArguments,
    /// Encoded tiling parameters
    pub blob: BufferHandle,
    pub workspace: Option<BufferHandle>,
    pub block_dim: usize,
}

/// Decoded launch state shared by every execution context
#[derive(Debug, Clone, Copy)]
pub struct KernelParams {
    pub tiling: TilingParameters,
    pub arguments: GemmArguments,
    pub plan: WorkspacePlan,
    pub workspace: Option<BufferHandle>,
}

impl KernelParams {
    fn operand(&self, source: BufferHandle, layout: Layout, padded: Option<Region>, plan: Option<Layout>) -> OperandView {
        match (padded, plan) {
            (Some(region), Some(layout)) => OperandView { region, layout },
            _ => OperandView {
                region: source.region(),
                layout,
            },
        }
    }

    pub fn a_view(&self) -> OperandView {
        let padded = self.workspace.and_then(|ws| self.plan.a_region(ws));
        self.operand(self.arguments.a, self.arguments.layout_a, padded, self.plan.a.map(|a| a.layout))
    }

    pub fn b_view(&self) -> OperandView {
        let padded = self.workspace.and_then(|ws| self.plan.b_region(ws));
        self.operand(self.arguments.b, self.arguments.layout_b, padded, self.plan.b.map(|b| b.layout))
    }

    /// The C-side workspace region and what it holds
    pub fn output_workspace(&self) -> Option<(Region, OutputRegion)> {
        let ws = self.workspace?;
        Some((self.plan.c_region(ws)?, self.plan.c?))
    }

    fn pads_operands(&self) -> bool {
        self.tiling.padding_a.is_padded() || self.tiling.padding_b.is_padded()
    }

    fn bias(&self) -> Option<Region> {
        self.arguments.bias.map(|bias| bias.region())
    }
}

/// Host handle of the GEMM kernel for input element `E` and output `O`
pub struct GemmKernel<E, O> {
    platform: PlatformDescriptor,
    _types: PhantomData<fn() -> (E, O)>,
}

impl<E, O> GemmKernel<E, O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    pub fn new(platform: PlatformDescriptor) -> Self {
        Self {
            platform,
            _types: PhantomData,
        }
    }

    pub fn platform(&self) -> &PlatformDescriptor {
        &self.platform
    }

    /// Why `params` cannot run `args`, if it cannot
    pub fn check(&self, args: &GemmArguments, params: &TilingParameters) -> GemmResult<()> {
        self.platform.validate()?;
        params.check()?;
        if params.element != E::DTYPE {
            return Err(GemmError::shape(E::DTYPE.to_string(), params.element.to_string()));
        }
        if args.problem != params.problem {
            return Err(GemmError::shape(params.problem.to_string(), args.problem.to_string()));
        }
        if params.padding_c.is_padded() && matches!(params.variant, KernelVariant::SplitK | KernelVariant::StreamK) {
            return Err(GemmError::infeasible(format!("output padding on variant {}", params.variant)));
        }
        if params.block_dim > self.platform.core_count {
            return Err(GemmError::infeasible(format!(
                "block dim {} exceeds {} cores",
                params.block_dim, self.platform.core_count
            )));
        }

        let GemmCoord { m, n, k } = args.problem;
        let operands = [
            ("A", &args.layout_a, MatrixCoord::new(m, k), Some(params.layout_a)),
            ("B", &args.layout_b, MatrixCoord::new(k, n), Some(params.layout_b)),
            ("C", &args.layout_c, MatrixCoord::new(m, n), None),
        ];
        for (name, layout, shape, tag) in operands {
            if layout.shape() != shape {
                return Err(GemmError::shape(format!("{name} {shape}"), format!("{name} {}", layout.shape())));
            }
            if let Some(tag) = tag {
                if layout.tag != tag {
                    return Err(GemmError::shape(format!("{name} {tag}"), format!("{name} {}", layout.tag)));
                }
            }
        }

        let buffers = [
            (args.a, args.layout_a.capacity() * E::size()),
            (args.b, args.layout_b.capacity() * E::size()),
            (args.c, args.layout_c.capacity() * O::size()),
        ];
        for (handle, need) in buffers.into_iter().chain(args.bias.map(|bias| (bias, n * O::size()))) {
            if handle.bytes() < need {
                return Err(GemmError::buffer(
                    handle.id(),
                    format!("holds {} bytes, needs {need}", handle.bytes()),
                ));
            }
        }

        let sizes = ElementSizes {
            a: E::size(),
            b: E::size(),
            accumulator: <E::Accumulator as Element>::size(),
            bias: args.bias.map(|_| O::size()),
        };
        params.tiles.validate(&self.platform, &sizes, &params.pipeline.stages())
    }

    pub fn can_implement(&self, args: &GemmArguments, params: &TilingParameters) -> bool {
        match self.check(args, params) {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, "cannot implement");
                false
            }
        }
    }

    /// Workspace bytes a launch of `params` needs
    pub fn workspace_size(&self, params: &TilingParameters) -> usize {
        WorkspacePlan::new(params, O::DTYPE).bytes
    }

    /// Allocate the workspace and write the parameter blob
    pub fn initialize(
        &self,
        memory: &DeviceMemory,
        args: &GemmArguments,
        params: &TilingParameters,
    ) -> GemmResult<LaunchArguments> {
        self.check(args, params)?;
        let bytes = self.workspace_size(params);
        let workspace = (bytes > 0).then(|| memory.allocate(bytes));
        let blob = memory.upload_bytes(&params.to_bytes()?);
        debug!(
            variant = %params.variant,
            workspace = bytes,
            key = ?params.tiling_key(),
            "kernel initialized"
        );
        Ok(LaunchArguments {
            arguments: *args,
            blob,
            workspace,
            block_dim: params.block_dim,
        })
    }

    /// Decode the blob and rebuild the workspace plan from it
    pub fn to_underlying_arguments(&self, memory: &DeviceMemory, launch: &LaunchArguments) -> GemmResult<KernelParams> {
        let bytes = memory.download_bytes(launch.blob)?;
        let tiling = TilingParameters::from_bytes(&bytes)?;
        if tiling.element != E::DTYPE {
            return Err(GemmError::blob(format!(
                "blob element {} does not match kernel element {}",
                tiling.element,
                E::DTYPE
            )));
        }
        if tiling.block_dim != launch.block_dim {
            return Err(GemmError::blob(format!(
                "blob block dim {} does not match launch block dim {}",
                tiling.block_dim, launch.block_dim
            )));
        }
        let plan = WorkspacePlan::new(&tiling, O::DTYPE);
        let workspace = match launch.workspace {
            _ if plan.bytes == 0 => launch.workspace,
            Some(ws) if ws.bytes() >= plan.bytes => Some(ws),
            other => {
                return Err(GemmError::capacity("workspace", plan.bytes, other.map_or(0, |ws| ws.bytes())));
            }
        };
        Ok(KernelParams {
            tiling,
            arguments: launch.arguments,
            plan,
            workspace,
        })
    }

    /// Run every execution context of the launch to completion
    pub fn launch(&self, memory: &DeviceMemory, launcher: &dyn Launcher, launch: &LaunchArguments) -> GemmResult<()> {
        let params = self.to_underlying_arguments(memory, launch)?;
        let sub_blocks = self.platform.transfer_units_per_core;
        let sync = CoreSync::new(params.tiling.block_dim, sub_blocks);
        info!(
            variant = %params.tiling.variant,
            problem = %params.tiling.problem,
            block_dim = params.tiling.block_dim,
            split = params.tiling.split_factor,
            "launching gemm"
        );
        let started = Instant::now();
        launcher.launch(params.tiling.block_dim, sub_blocks, &|ctx| match ctx.role {
            CoreRole::Compute => self.compute(memory, &params, &sync, ctx),
            CoreRole::Transfer { sub_idx } => self.transfer(memory, &params, &sync, ctx, sub_idx),
        })?;
        debug!(elapsed = ?started.elapsed(), "gemm finished");
        Ok(())
    }

    fn compute(&self, memory: &DeviceMemory, params: &KernelParams, sync: &CoreSync, ctx: ExecContext) {
        let tiling = &params.tiling;
        let core = ctx.core_idx;
        if params.pads_operands() {
            sync.wait_transfer(core, TransferSignal::PaddingDone);
        }
        let (a, b) = (params.a_view(), params.b_view());
        let stages = tiling.pipeline.stages();

        thread::scope(|scope| {
            let mut mmad: Box<dyn BlockMmad<'_> + '_> = match tiling.pipeline {
                PipelineKind::PingPong => {
                    Box::new(PingPongMmad::<E, O>::new(scope, memory, a, b, tiling.tiles, stages))
                }
                PipelineKind::PreloadAsync => {
                    Box::new(PreloadAsyncMmad::<E, O>::new(scope, memory, a, b, tiling.tiles, stages))
                }
            };
            match tiling.variant {
                KernelVariant::SplitK => self.run_split_k(params, core, &mut *mmad),
                KernelVariant::StreamK => self.run_stream_k(params, sync, core, &mut *mmad),
                _ => self.run_tiles(params, sync, core, &mut *mmad),
            }
            mmad.synchronize();
        });

        match (tiling.variant, params.output_workspace()) {
            (KernelVariant::SplitK, Some(_)) => sync.signal_transfer(core, ComputeSignal::Finished),
            (KernelVariant::StreamK, _) | (_, None) => {}
            (_, Some(_)) => sync.close_epilogue(core),
        }
        trace!(core, "compute context done");
    }

    /// One pass over the full-K tiles of `core`
    fn run_tiles<'s, M>(&self, params: &'s KernelParams, sync: &'s CoreSync, core: usize, mmad: &mut M)
    where
        M: BlockMmad<'s> + ?Sized,
    {
        let tiling = &params.tiling;
        let args = &params.arguments;
        let scheduler = IdentityScheduler::from_params(tiling);
        let (out, out_layout, epilogue) = match params.output_workspace() {
            Some((region, ws)) => (region, ws.layout, true),
            None => (args.c.region(), args.layout_c, false),
        };
        for loop_idx in (core..scheduler.core_loops()).step_by(tiling.block_dim) {
            let Some(coord) = scheduler.block_coord(loop_idx) else {
                continue;
            };
            let offset = scheduler.block_offset(&coord);
            let shape = scheduler.actual_block_shape(&coord);
            let tile = MmadTile {
                offset,
                shape,
                bias: params.bias(),
                target: DrainTarget::Output {
                    region: out,
                    layout: out_layout,
                    origin: MatrixCoord::new(offset.m, offset.n),
                },
                write: coord.write,
            };
            let callbacks = if epilogue {
                let message = EpilogueMessage::Tile {
                    row: offset.m,
                    column: offset.n,
                    rows: shape.m,
                    cols: shape.n,
                };
                DrainCallbacks {
                    before: None,
                    after: Some(Box::new(move || sync.push_epilogue(core, message))),
                }
            } else {
                DrainCallbacks::default()
            };
            mmad.run_with_callbacks(tile, callbacks);
        }
    }

    fn run_split_k<'s, M>(&self, params: &'s KernelParams, core: usize, mmad: &mut M)
    where
        M: BlockMmad<'s> + ?Sized,
    {
        let tiling = &params.tiling;
        let args = &params.arguments;
        let scheduler = SplitKScheduler::from_params(tiling);
        let acc_size = <E::Accumulator as Element>::size();
        for loop_idx in (core..scheduler.core_loops()).step_by(tiling.block_dim) {
            let Some(coord) = scheduler.block_coord(loop_idx) else {
                continue;
            };
            let offset = scheduler.block_offset(&coord);
            let origin = MatrixCoord::new(offset.m, offset.n);
            let target = match params.output_workspace() {
                Some((region, ws)) => {
                    let region = match ws.kind {
                        OutputWorkspace::SplitSlices { .. } => {
                            let slice_bytes = ws.layout.capacity() * acc_size;
                            region.slice(coord.slice * slice_bytes, slice_bytes)
                        }
                        _ => region,
                    };
                    DrainTarget::Workspace {
                        region,
                        layout: ws.layout,
                        origin,
                    }
                }
                None => DrainTarget::Output {
                    region: args.c.region(),
                    layout: args.layout_c,
                    origin,
                },
            };
            mmad.run(MmadTile {
                offset,
                shape: scheduler.actual_block_shape(&coord),
                bias: if coord.k == 0 { params.bias() } else { None },
                target,
                write: coord.write,
            });
        }
    }

    fn run_stream_k<'s, M>(&self, params: &'s KernelParams, sync: &'s CoreSync, core: usize, mmad: &mut M)
    where
        M: BlockMmad<'s> + ?Sized,
    {
        let args = &params.arguments;
        let scheduler = StreamKScheduler::from_params(&params.tiling);
        let tile = scheduler.identity().tile();
        let slot_layout = Layout::row_major(tile.m, tile.n);
        let slot_bytes = slot_layout.capacity() * <E::Accumulator as Element>::size();
        let slots = params.output_workspace().map(|(region, _)| region);

        for loop_idx in scheduler.loop_order(core) {
            if let Some(coord) = scheduler.normal_block(loop_idx) {
                let offset = scheduler.block_offset(&coord);
                mmad.run(MmadTile {
                    offset,
                    shape: scheduler.actual_block_shape(&coord),
                    bias: params.bias(),
                    target: DrainTarget::Output {
                        region: args.c.region(),
                        layout: args.layout_c,
                        origin: MatrixCoord::new(offset.m, offset.n),
                    },
                    write: coord.write,
                });
                continue;
            }
            if let Some(slots) = slots {
                for piece in scheduler.pieces(core) {
                    mmad.run(MmadTile {
                        offset: scheduler.block_offset(&piece.coord),
                        shape: scheduler.actual_block_shape(&piece.coord),
                        bias: if piece.coord.k == 0 { params.bias() } else { None },
                        target: DrainTarget::Workspace {
                            region: slots.slice(piece.slot * slot_bytes, slot_bytes),
                            layout: slot_layout,
                            origin: MatrixCoord::new(0, 0),
                        },
                        write: piece.coord.write,
                    });
                }
            }
            mmad.synchronize();
            sync.signal_transfer(core, ComputeSignal::StreamKStored);
        }
    }

    fn transfer(&self, memory: &DeviceMemory, params: &KernelParams, sync: &CoreSync, ctx: ExecContext, sub_idx: usize) {
        let Some(unit) = ctx.transfer_idx() else {
            return;
        };
        let units = ctx.transfer_count();
        let tiling = &params.tiling;
        let args = &params.arguments;

        if params.pads_operands() {
            let task_bytes = self.platform.padding_task_bytes();
            let a = params.a_view();
            if tiling.padding_a.is_padded() {
                pad_operand::<E>(memory, args.a, &args.layout_a, a.region, &a.layout, unit, units, task_bytes);
            }
            let b = params.b_view();
            if tiling.padding_b.is_padded() {
                pad_operand::<E>(memory, args.b, &args.layout_b, b.region, &b.layout, unit, units, task_bytes);
            }
            sync.transfer_barrier();
            sync.signal_compute(unit, TransferSignal::PaddingDone);
        }

        let Some((ws, region)) = params.output_workspace() else {
            return;
        };
        let out = args.c.region();
        match tiling.variant {
            KernelVariant::SplitK => {
                sync.wait_compute(unit, ComputeSignal::Finished);
                sync.transfer_barrier();
                match region.kind {
                    OutputWorkspace::SplitSlices { split } => reduce_slices::<E::Accumulator, O>(
                        memory,
                        ws,
                        tiling.problem.mn(),
                        split,
                        out,
                        &args.layout_c,
                        unit,
                        units,
                    ),
                    _ => remove_padding_cast::<E::Accumulator, O>(
                        memory,
                        ws,
                        &region.layout,
                        out,
                        &args.layout_c,
                        unit,
                        units,
                    ),
                }
            }
            KernelVariant::StreamK => {
                sync.wait_compute(unit, ComputeSignal::StreamKStored);
                sync.transfer_barrier();
                let scheduler = StreamKScheduler::from_params(tiling);
                for block in 0..scheduler.stream_blocks() {
                    let cores = scheduler.reduce_range(block);
                    if !cores.contains(&ctx.core_idx) {
                        continue;
                    }
                    let local = (ctx.core_idx - cores.start) * ctx.sub_blocks + sub_idx;
                    reduce_stream_k::<E::Accumulator, O>(
                        memory,
                        &scheduler,
                        ws,
                        out,
                        &args.layout_c,
                        block,
                        local,
                        cores.len() * ctx.sub_blocks,
                    );
                }
            }
            _ => {
                while let EpilogueMessage::Tile { row, column, rows, cols } = sync.next_epilogue(ctx.core_idx) {
                    remove_padding::<O, O>(
                        memory,
                        ws,
                        &region.layout,
                        out,
                        &args.layout_c,
                        MatrixCoord::new(row, column),
                        MatrixCoord::new(rows, cols),
                        0,
                        1,
                    );
                }
            }
        }
        trace!(unit, "transfer context done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::TileConfig;
    use crate::launcher::ThreadLauncher;
    use crate::layout::LayoutTag;
    use crate::padding::PaddingTag;
    use crate::reference::{fill_pattern, reference_gemm};
    use pretty_assertions::assert_eq;

    fn platform() -> PlatformDescriptor {
        PlatformDescriptor::new(4, 2)
    }

    fn tiles() -> TileConfig {
        TileConfig::new(GemmCoord::new(32, 32, 16), GemmCoord::new(16, 16, 8))
    }

    struct Fixture {
        memory: DeviceMemory,
        args: GemmArguments,
        params: TilingParameters,
        a: Vec<i32>,
        b: Vec<i32>,
    }

    fn fixture(problem: GemmCoord) -> Fixture {
        let memory = DeviceMemory::new();
        let layout_a = Layout::row_major(problem.m, problem.k);
        let layout_b = Layout::column_major(problem.k, problem.n);
        let layout_c = Layout::row_major(problem.m, problem.n);
        let a: Vec<i32> = fill_pattern(layout_a.capacity(), 1);
        let b: Vec<i32> = fill_pattern(layout_b.capacity(), 2);
        let args = GemmArguments {
            problem,
            layout_a,
            layout_b,
            layout_c,
            a: memory.upload(&a),
            b: memory.upload(&b),
            c: memory.allocate(layout_c.capacity() * 4),
            bias: None,
        };
        let params = TilingParameters::common(
            problem,
            LayoutTag::RowMajor,
            LayoutTag::ColumnMajor,
            crate::element::DataType::I32,
            tiles(),
            4,
        );
        Fixture {
            memory,
            args,
            params,
            a,
            b,
        }
    }

    fn run(f: &Fixture) -> Vec<i32> {
        let kernel = GemmKernel::<i32, i32>::new(platform());
        let launch = kernel.initialize(&f.memory, &f.args, &f.params).unwrap();
        kernel.launch(&f.memory, &ThreadLauncher, &launch).unwrap();
        f.memory.download::<i32>(f.args.c, f.args.layout_c.capacity()).unwrap()
    }

    fn expected(f: &Fixture) -> Vec<i32> {
        reference_gemm::<i32, i32>(&f.a, &f.args.layout_a, &f.b, &f.args.layout_b, None, f.args.problem)
    }

    #[test]
    fn test_common_launch_matches_reference() {
        let f = fixture(GemmCoord::new(70, 45, 40));
        assert_eq!(run(&f), expected(&f));
    }

    #[test]
    fn test_padded_operands_and_output() {
        let mut f = fixture(GemmCoord::new(50, 40, 24));
        f.params.variant = KernelVariant::PaddingCommon;
        f.params.padding_a = PaddingTag::Nz;
        f.params.padding_b = PaddingTag::BlockNd;
        f.params.padding_c = PaddingTag::Nd;
        f.params.pipeline = PipelineKind::PreloadAsync;
        assert_eq!(run(&f), expected(&f));
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let f = fixture(GemmCoord::new(64, 64, 32));
        let kernel = GemmKernel::<i32, i32>::new(platform());
        assert!(kernel.can_implement(&f.args, &f.params));

        let mut args = f.args;
        args.layout_b = Layout::column_major(16, 64);
        assert!(matches!(kernel.check(&args, &f.params), Err(GemmError::ShapeMismatch { .. })));

        let mut params = f.params;
        params.block_dim = 9;
        assert!(!kernel.can_implement(&f.args, &params));

        let mut args = f.args;
        args.c = f.memory.allocate(16);
        assert!(matches!(kernel.check(&args, &f.params), Err(GemmError::InvalidBuffer { .. })));
    }

    #[test]
    fn test_rejects_wrong_element() {
        let f = fixture(GemmCoord::new(64, 64, 32));
        let kernel = GemmKernel::<f32, f32>::new(platform());
        assert!(!kernel.can_implement(&f.args, &f.params));
    }

    #[test]
    fn test_blob_is_checked_on_entry() {
        let f = fixture(GemmCoord::new(64, 64, 32));
        let kernel = GemmKernel::<i32, i32>::new(platform());
        let mut launch = kernel.initialize(&f.memory, &f.args, &f.params).unwrap();
        launch.blob = f.memory.upload_bytes(&[0u8; 8]);
        assert!(matches!(
            kernel.to_underlying_arguments(&f.memory, &launch),
            Err(GemmError::InvalidBlob { .. })
        ));
    }

    #[test]
    fn test_missing_workspace_is_reported() {
        let mut f = fixture(GemmCoord::new(64, 64, 32));
        f.params.padding_a = PaddingTag::Nd;
        f.params.variant = KernelVariant::PaddingCommon;
        let kernel = GemmKernel::<i32, i32>::new(platform());
        let mut launch = kernel.initialize(&f.memory, &f.args, &f.params).unwrap();
        assert!(launch.workspace.is_some());
        launch.workspace = None;
        assert!(matches!(
            kernel.to_underlying_arguments(&f.memory, &launch),
            Err(GemmError::CapacityExceeded { .. })
        ));
    }
}

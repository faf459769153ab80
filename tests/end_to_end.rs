//! End-to-end launches: selection, workspace, every variant's device flow,
//! and the result checked against the host reference.

use pretty_assertions::assert_eq;
use staged_gemm::reference::{fill_pattern, reference_gemm};
use staged_gemm::{
    matmul, plan, Allocator, CostModel, DataType, DeviceMemory, Element, GemmArguments, GemmCoord, GemmKernel,
    HostOperands, KernelVariant, Layout, LayoutTag, PaddingTag, PipelineKind, PlatformDescriptor, ProblemDescriptor,
    SplitMode, ThreadLauncher, TileConfig, TilingParameters,
};

fn small_tiles() -> TileConfig {
    TileConfig::new(GemmCoord::new(32, 32, 16), GemmCoord::new(16, 16, 8))
}

struct Outcome<O> {
    c: Vec<O>,
    expected: Vec<O>,
    workspace_size: usize,
    high_water: usize,
}

/// Run `params` on generated operands through the kernel directly
fn launch<E, O>(platform: &PlatformDescriptor, params: &TilingParameters, with_bias: bool) -> Outcome<O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    let problem = params.problem;
    let layout_a = Layout::natural(params.layout_a, problem.m, problem.k);
    let layout_b = Layout::natural(params.layout_b, problem.k, problem.n);
    let layout_c = Layout::row_major(problem.m, problem.n);
    let a: Vec<E> = fill_pattern(layout_a.capacity(), 11);
    let b: Vec<E> = fill_pattern(layout_b.capacity(), 12);
    let bias: Option<Vec<O>> = with_bias.then(|| fill_pattern(problem.n, 13));

    let memory = DeviceMemory::new();
    let args = GemmArguments {
        problem,
        layout_a,
        layout_b,
        layout_c,
        a: memory.upload(&a),
        b: memory.upload(&b),
        c: memory.allocate(layout_c.capacity() * O::size()),
        bias: bias.as_deref().map(|bias| memory.upload(bias)),
    };
    let kernel = GemmKernel::<E, O>::new(platform.clone());
    let launch = kernel.initialize(&memory, &args, params).unwrap();
    kernel.launch(&memory, &ThreadLauncher, &launch).unwrap();

    Outcome {
        c: memory.download::<O>(args.c, layout_c.capacity()).unwrap(),
        expected: reference_gemm::<E, O>(&a, &layout_a, &b, &layout_b, bias.as_deref(), problem),
        workspace_size: kernel.workspace_size(params),
        high_water: launch.workspace.map_or(0, |ws| memory.high_water(ws).unwrap()),
    }
}

fn split_params(problem: GemmCoord, split: usize, mode: SplitMode, element: DataType, cores: usize) -> TilingParameters {
    let mut params =
        TilingParameters::common(problem, LayoutTag::RowMajor, LayoutTag::ColumnMajor, element, small_tiles(), cores);
    params.variant = KernelVariant::SplitK;
    params.split_mode = mode;
    params.split_factor = split;
    params.block_dim = (problem.tile_count_mn(&params.tiles.l1) * split).min(cores);
    params
}

#[test]
fn test_thin_problem_runs_as_small_matmul() {
    let memory = DeviceMemory::new();
    let layout_a = Layout::column_major(1, 1024);
    let layout_b = Layout::row_major(1024, 512);
    let a: Vec<f32> = fill_pattern(layout_a.capacity(), 1);
    let b: Vec<f32> = fill_pattern(layout_b.capacity(), 2);
    let operands = HostOperands::<f32, f32> {
        a: &a,
        layout_a,
        b: &b,
        layout_b,
        bias: None,
    };
    let (selection, c) =
        matmul(&memory, &ThreadLauncher, &PlatformDescriptor::default(), &CostModel::default(), operands).unwrap();
    assert_eq!(selection.params.variant, KernelVariant::SmallMatmul);
    assert!(selection.normalized_a);
    assert_eq!(c, reference_gemm::<f32, f32>(&a, &layout_a, &b, &layout_b, None, GemmCoord::new(1, 512, 1024)));
}

#[test]
fn test_narrow_inner_dimension_is_padded_and_correct() {
    let memory = DeviceMemory::new();
    let layout_a = Layout::row_major(1024, 4);
    let layout_b = Layout::row_major(4, 64);
    let a: Vec<f32> = fill_pattern(layout_a.capacity(), 3);
    let b: Vec<f32> = fill_pattern(layout_b.capacity(), 4);
    let operands = HostOperands::<f32, f32> {
        a: &a,
        layout_a,
        b: &b,
        layout_b,
        bias: None,
    };
    let (selection, c) =
        matmul(&memory, &ThreadLauncher, &PlatformDescriptor::default(), &CostModel::default(), operands).unwrap();
    assert_eq!(selection.params.variant, KernelVariant::PaddingCommon);
    assert_eq!(selection.params.padding_a, PaddingTag::Nz);
    assert_eq!(c, reference_gemm::<f32, f32>(&a, &layout_a, &b, &layout_b, None, GemmCoord::new(1024, 64, 4)));
    assert_eq!(memory.live_buffers(), 0);
}

fn full_tiles() -> TileConfig {
    TileConfig::new(GemmCoord::new(128, 128, 64), GemmCoord::new(128, 128, 64))
}

#[test]
fn test_square_problem_on_full_tiles() {
    let platform = PlatformDescriptor::new(4, 2);
    let problem = GemmCoord::new(256, 256, 256);
    let params =
        TilingParameters::common(problem, LayoutTag::RowMajor, LayoutTag::RowMajor, DataType::I32, full_tiles(), 4);
    assert_eq!(params.block_dim, 4);
    let out = launch::<i32, i32>(&platform, &params, false);
    assert_eq!(out.c, out.expected);
}

#[test]
fn test_edge_tiles_are_computed() {
    let platform = PlatformDescriptor::new(4, 2);
    let problem = GemmCoord::new(130, 130, 64);
    for (la, lb) in [
        (LayoutTag::RowMajor, LayoutTag::RowMajor),
        (LayoutTag::ColumnMajor, LayoutTag::ColumnMajor),
    ] {
        let params = TilingParameters::common(problem, la, lb, DataType::I32, full_tiles(), 4);
        // one full tile, two 2-wide strips and a 2 x 2 corner
        assert_eq!(problem.tile_count_mn(&params.tiles.l1), 4);
        let out = launch::<i32, i32>(&platform, &params, true);
        assert_eq!(out.c, out.expected);
    }
}

#[test]
fn test_bias_problem_that_fills_l1_runs() {
    let memory = DeviceMemory::new();
    let layout_a = Layout::column_major(256, 256);
    let layout_b = Layout::row_major(256, 256);
    let a: Vec<i32> = fill_pattern(layout_a.capacity(), 8);
    let b: Vec<i32> = fill_pattern(layout_b.capacity(), 9);
    let bias: Vec<i32> = fill_pattern(256, 10);
    let operands = HostOperands {
        a: &a,
        layout_a,
        b: &b,
        layout_b,
        bias: Some(bias.as_slice()),
    };
    let (selection, c) =
        matmul(&memory, &ThreadLauncher, &PlatformDescriptor::new(4, 2), &CostModel::default(), operands).unwrap();
    assert!(selection.feasible);
    let want = reference_gemm::<i32, i32>(&a, &layout_a, &b, &layout_b, Some(bias.as_slice()), GemmCoord::new(256, 256, 256));
    assert_eq!(c, want);
}

#[test]
fn test_selected_split_k_adds_bias_once() {
    let platform = PlatformDescriptor::new(8, 2);
    let problem = GemmCoord::new(40, 24, 6144);
    let descriptor = ProblemDescriptor::new(problem, LayoutTag::RowMajor, LayoutTag::RowMajor, DataType::I32)
        .with_bias(true);
    let selection = plan(&descriptor, &platform, &CostModel::default());
    assert_eq!(selection.params.variant, KernelVariant::SplitK);
    assert_eq!(selection.params.split_mode, SplitMode::Partitioned);
    assert!(selection.params.split_factor > 1);

    let out = launch::<i32, i32>(&platform, &selection.params, true);
    assert_eq!(out.c, out.expected);
    assert_eq!(out.high_water, out.workspace_size);
}

#[test]
fn test_partitioned_split_narrows_after_the_sum() {
    let platform = PlatformDescriptor::new(4, 2);
    let params = split_params(GemmCoord::new(50, 40, 200), 3, SplitMode::Partitioned, DataType::I8, 4);
    let out = launch::<i8, i8>(&platform, &params, true);
    assert_eq!(out.c, out.expected);
    assert_eq!(out.high_water, out.workspace_size);
}

#[test]
fn test_sequential_split_accumulates_in_place() {
    let platform = PlatformDescriptor::new(4, 2);
    let params = split_params(GemmCoord::new(70, 45, 200), 3, SplitMode::Sequential, DataType::I32, 4);
    let out = launch::<i32, i32>(&platform, &params, true);
    assert_eq!(out.workspace_size, 0);
    assert_eq!(out.c, out.expected);
}

#[test]
fn test_sequential_split_through_accumulator_workspace() {
    let platform = PlatformDescriptor::new(4, 2);
    let params = split_params(GemmCoord::new(70, 45, 200), 3, SplitMode::Sequential, DataType::I8, 4);
    let out = launch::<i8, i8>(&platform, &params, false);
    assert!(out.workspace_size > 0);
    assert_eq!(out.c, out.expected);
    assert_eq!(out.high_water, out.workspace_size);
}

#[test]
fn test_stream_k_matches_reference() {
    let platform = PlatformDescriptor::new(4, 2);
    let problem = GemmCoord::new(130, 70, 96);
    let mut params =
        TilingParameters::common(problem, LayoutTag::ColumnMajor, LayoutTag::RowMajor, DataType::I32, small_tiles(), 4);
    params.variant = KernelVariant::StreamK;
    params.block_dim = 4;
    let out = launch::<i32, i32>(&platform, &params, true);
    assert_eq!(out.c, out.expected);
    assert!(out.high_water <= out.workspace_size);
}

#[test]
fn test_stream_k_with_every_tile_streamed() {
    let platform = PlatformDescriptor::new(4, 2);
    let problem = GemmCoord::new(60, 40, 160);
    let mut params =
        TilingParameters::common(problem, LayoutTag::RowMajor, LayoutTag::RowMajor, DataType::I32, small_tiles(), 4);
    params.variant = KernelVariant::StreamK;
    params.block_dim = 4;
    let out = launch::<i32, i32>(&platform, &params, false);
    assert_eq!(out.c, out.expected);
}

#[test]
fn test_padded_launch_fills_its_workspace() {
    let platform = PlatformDescriptor::new(4, 2);
    let problem = GemmCoord::new(66, 50, 40);
    let mut params =
        TilingParameters::common(problem, LayoutTag::ColumnMajor, LayoutTag::ColumnMajor, DataType::I32, small_tiles(), 4);
    params.variant = KernelVariant::PaddingCommon;
    params.padding_a = PaddingTag::BlockNd;
    params.padding_b = PaddingTag::Nd;
    params.padding_c = PaddingTag::Nd;
    params.pipeline = PipelineKind::PreloadAsync;
    let out = launch::<i32, i32>(&platform, &params, true);
    assert_eq!(out.c, out.expected);
    assert_eq!(out.high_water, out.workspace_size);
}

#[test]
fn test_runs_are_deterministic() {
    let platform = PlatformDescriptor::new(4, 2);
    let params = split_params(GemmCoord::new(50, 40, 200), 4, SplitMode::Partitioned, DataType::F16, 4);
    let first = launch::<half::f16, f32>(&platform, &params, true);
    let second = launch::<half::f16, f32>(&platform, &params, true);
    assert_eq!(first.c, second.c);

    let descriptor = ProblemDescriptor::new(
        GemmCoord::new(1280, 1536, 4096),
        LayoutTag::RowMajor,
        LayoutTag::RowMajor,
        DataType::F16,
    );
    let cost_model = CostModel::default();
    let platform = PlatformDescriptor::default();
    assert_eq!(plan(&descriptor, &platform, &cost_model), plan(&descriptor, &platform, &cost_model));
}

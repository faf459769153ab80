//! Example: Split-K Execution
//!
//! Runs a deep-K problem with few output tiles on a small platform, once
//! with the selected split-K launch and once forced onto the common
//! variant, and checks both against the host reference.
//!
//! Run with: cargo run --example split_k

use staged_gemm::reference::{fill_pattern, reference_gemm};
use staged_gemm::{
    plan, Allocator, CostModel, DataType, DeviceMemory, GemmArguments, GemmCoord, GemmKernel, KernelVariant, Layout,
    LayoutTag, PlatformDescriptor, ProblemDescriptor, SplitMode, ThreadLauncher, TilingParameters,
};

fn main() {
    println!("=== Split-K Execution ===\n");

    let platform = PlatformDescriptor::new(8, 2);
    let problem = GemmCoord::new(96, 80, 6144);
    let layout_a = Layout::row_major(problem.m, problem.k);
    let layout_b = Layout::row_major(problem.k, problem.n);
    let layout_c = Layout::row_major(problem.m, problem.n);

    let descriptor = ProblemDescriptor::new(problem, LayoutTag::RowMajor, LayoutTag::RowMajor, DataType::I32);
    let selection = plan(&descriptor, &platform, &CostModel::default());
    let split = selection.params;
    println!("Problem: {}", problem);
    println!("Selected: {} (split {}, {:?})", split.variant, split.split_factor, split.split_mode);
    println!("Tiles: {}\n", split.tiles);

    let mut common = TilingParameters::common(
        problem,
        LayoutTag::RowMajor,
        LayoutTag::RowMajor,
        DataType::I32,
        split.tiles,
        platform.core_count,
    );
    common.variant = KernelVariant::Common;
    common.split_mode = SplitMode::None;

    let a: Vec<i32> = fill_pattern(layout_a.capacity(), 1);
    let b: Vec<i32> = fill_pattern(layout_b.capacity(), 2);
    let want = reference_gemm::<i32, i32>(&a, &layout_a, &b, &layout_b, None, problem);

    let memory = DeviceMemory::new();
    let kernel = GemmKernel::<i32, i32>::new(platform.clone());
    for (name, params) in [("selected", split), ("common", common)] {
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
        let launch = kernel.initialize(&memory, &args, &params).unwrap();
        kernel.launch(&memory, &ThreadLauncher, &launch).unwrap();
        let c = memory.download::<i32>(args.c, layout_c.capacity()).unwrap();

        println!("{} launch:", name);
        println!("  - Launch cores: {}", params.block_dim);
        println!("  - Workspace: {} bytes", kernel.workspace_size(&params));
        println!("  - Matches reference: {}", c == want);
        println!();
    }
}

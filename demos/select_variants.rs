//! Example: Kernel Variant Selection
//!
//! Shows which variant and tiling the selector picks for a handful of
//! characteristic shapes on the default 24-core platform.
//!
//! Run with: cargo run --example select_variants

use staged_gemm::{plan, CostModel, DataType, GemmCoord, LayoutTag, PlatformDescriptor, ProblemDescriptor};

fn main() {
    println!("=== Kernel Variant Selection ===\n");

    let platform = PlatformDescriptor::default();
    let cost_model = CostModel::default();
    println!("Platform: {}\n", platform);

    let cases = [
        ("GEMV-like, column-major A", (1, 512, 1024), LayoutTag::ColumnMajor, LayoutTag::RowMajor),
        ("Deep K, many tiles", (4096, 4096, 16384), LayoutTag::RowMajor, LayoutTag::RowMajor),
        ("Deep K, few tiles", (256, 256, 10000), LayoutTag::RowMajor, LayoutTag::RowMajor),
        ("Ragged last wave", (1280, 1536, 4096), LayoutTag::RowMajor, LayoutTag::RowMajor),
        ("Very narrow inner dimension", (1024, 64, 4), LayoutTag::RowMajor, LayoutTag::RowMajor),
        ("Large output, odd width", (4096, 2100, 64), LayoutTag::RowMajor, LayoutTag::RowMajor),
        ("Plain square", (2048, 2048, 2048), LayoutTag::RowMajor, LayoutTag::ColumnMajor),
    ];

    for (name, (m, n, k), layout_a, layout_b) in cases {
        let problem = ProblemDescriptor::new(GemmCoord::new(m, n, k), layout_a, layout_b, DataType::F32);
        let selection = plan(&problem, &platform, &cost_model);
        let params = &selection.params;

        println!("{} ({}x{}x{}, A {}, B {})", name, m, n, k, layout_a, layout_b);
        println!("  - Variant: {}", params.variant);
        println!("  - Tiles: {}", params.tiles);
        println!("  - Launch cores: {}", params.block_dim);
        if params.split_factor > 1 {
            println!("  - Split K: {} ({:?})", params.split_factor, params.split_mode);
        }
        println!(
            "  - Padding: A {:?}, B {:?}, C {:?}",
            params.padding_a, params.padding_b, params.padding_c
        );
        println!("  - Feasible: {}", selection.feasible);
        println!();
    }
}

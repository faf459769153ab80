//! Staged GEMM CLI
//!
//! Usage:
//!   stagedgemm plan 4096 4096 16384 --dtype f16
//!   stagedgemm plan 1 512 1024 --layout-a col --json
//!   stagedgemm run 300 200 5000 --dtype i8 --output i32 --verify

use clap::{Args as ClapArgs, Parser as ClapParser, Subcommand};
use colored::Colorize;
use half::{bf16, f16};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use staged_gemm::matmul;
use staged_gemm::reference::{fill_pattern, max_relative_error, reference_gemm};
use staged_gemm::{
    plan, CostModel, DataType, DeviceMemory, Element, GemmCoord, GemmError, GemmResult, Layout, LayoutTag,
    PlatformDescriptor, ProblemDescriptor, Selection, ThreadLauncher,
};

#[derive(ClapParser, Debug)]
#[command(name = "stagedgemm")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Plans and runs tiled multi-stage GEMM launches")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Platform description (JSON); defaults to the 24-core part
    #[arg(long = "platform", global = true)]
    platform: Option<String>,

    /// Padding cost model (JSON); defaults to the built-in fit
    #[arg(long = "cost-model", global = true)]
    cost_model: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the variant and tiling chosen for a problem
    Plan {
        #[command(flatten)]
        problem: ProblemArgs,

        /// Output as JSON
        #[arg(short = 'j', long = "json")]
        json_output: bool,
    },
    /// Run a problem on generated data
    Run {
        #[command(flatten)]
        problem: ProblemArgs,

        /// Compare against the host reference
        #[arg(long = "verify")]
        verify: bool,

        /// Seed for the generated operands
        #[arg(long = "seed", default_value = "1")]
        seed: usize,
    },
}

#[derive(ClapArgs, Debug)]
struct ProblemArgs {
    m: usize,
    n: usize,
    k: usize,

    /// Layout of A (row or col)
    #[arg(long = "layout-a", default_value = "row", value_parser = parse_layout)]
    layout_a: LayoutTag,

    /// Layout of B (row or col)
    #[arg(long = "layout-b", default_value = "row", value_parser = parse_layout)]
    layout_b: LayoutTag,

    /// Input element type
    #[arg(short = 'd', long = "dtype", default_value = "f16", value_parser = parse_dtype)]
    dtype: DataType,

    /// Output element type; defaults to the input type
    #[arg(short = 'o', long = "output", value_parser = parse_dtype)]
    output: Option<DataType>,

    /// Add a bias row
    #[arg(long = "bias")]
    bias: bool,
}

impl ProblemArgs {
    fn descriptor(&self) -> ProblemDescriptor {
        ProblemDescriptor::new(GemmCoord::new(self.m, self.n, self.k), self.layout_a, self.layout_b, self.dtype)
            .with_output(self.output.unwrap_or(self.dtype))
            .with_bias(self.bias)
    }
}

fn parse_layout(s: &str) -> Result<LayoutTag, String> {
    LayoutTag::parse(s).ok_or_else(|| format!("Invalid layout: {} (expected row or col)", s))
}

fn parse_dtype(s: &str) -> Result<DataType, String> {
    DataType::parse(s).ok_or_else(|| format!("Invalid element type: {}", s))
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let platform = match &args.platform {
        Some(path) => PlatformDescriptor::from_json_file(path),
        None => Ok(PlatformDescriptor::default()),
    }
    .unwrap_or_else(|e| {
        eprintln!("{}: {}", "Platform error".red(), e);
        std::process::exit(1);
    });
    let cost_model = match &args.cost_model {
        Some(path) => CostModel::from_json_file(path),
        None => Ok(CostModel::default()),
    }
    .unwrap_or_else(|e| {
        eprintln!("{}: {}", "Cost model error".red(), e);
        std::process::exit(1);
    });

    if args.verbose {
        println!("{}", "Staged GEMM".bold().blue());
        println!("{}", "=".repeat(35));
        println!("{}: {}", "Platform".green(), platform);
        println!();
    }

    match args.command {
        Command::Plan { problem, json_output } => {
            let selection = plan(&problem.descriptor(), &platform, &cost_model);
            if json_output {
                match serde_json::to_string_pretty(&selection) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                        std::process::exit(1);
                    }
                }
            } else {
                print_selection(&selection, args.verbose);
            }
        }
        Command::Run { problem, verify, seed } => {
            let output = problem.output.unwrap_or(problem.dtype);
            let result = match (problem.dtype, output) {
                (DataType::F32, DataType::F32) => run_typed::<f32, f32>(&problem, &platform, &cost_model, verify, seed),
                (DataType::F16, DataType::F16) => run_typed::<f16, f16>(&problem, &platform, &cost_model, verify, seed),
                (DataType::F16, DataType::F32) => run_typed::<f16, f32>(&problem, &platform, &cost_model, verify, seed),
                (DataType::Bf16, DataType::Bf16) => {
                    run_typed::<bf16, bf16>(&problem, &platform, &cost_model, verify, seed)
                }
                (DataType::Bf16, DataType::F32) => run_typed::<bf16, f32>(&problem, &platform, &cost_model, verify, seed),
                (DataType::I8, DataType::I8) => run_typed::<i8, i8>(&problem, &platform, &cost_model, verify, seed),
                (DataType::I8, DataType::I32) => run_typed::<i8, i32>(&problem, &platform, &cost_model, verify, seed),
                (DataType::I32, DataType::I32) => run_typed::<i32, i32>(&problem, &platform, &cost_model, verify, seed),
                (input, output) => Err(GemmError::config(format!(
                    "no kernel for {input} inputs with {output} output"
                ))),
            };
            if let Err(e) = result {
                eprintln!("{}: {}", "Run error".red(), e);
                std::process::exit(1);
            }
        }
    }
}

fn run_typed<E, O>(
    problem: &ProblemArgs,
    platform: &PlatformDescriptor,
    cost_model: &CostModel,
    verify: bool,
    seed: usize,
) -> GemmResult<()>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    let layout_a = Layout::natural(problem.layout_a, problem.m, problem.k);
    let layout_b = Layout::natural(problem.layout_b, problem.k, problem.n);
    let a: Vec<E> = fill_pattern(layout_a.capacity(), seed);
    let b: Vec<E> = fill_pattern(layout_b.capacity(), seed + 1);
    let bias: Option<Vec<O>> = problem.bias.then(|| fill_pattern(problem.n, seed + 2));

    let memory = DeviceMemory::new();
    let started = Instant::now();
    let (selection, c) = matmul(
        &memory,
        &ThreadLauncher,
        platform,
        cost_model,
        staged_gemm::HostOperands {
            a: &a,
            layout_a,
            b: &b,
            layout_b,
            bias: bias.as_deref(),
        },
    )?;
    let elapsed = started.elapsed();

    println!("{}", "Run Results".bold().green());
    println!("{}", "=".repeat(50));
    println!("{}: {}", "Variant".cyan(), selection.params.variant);
    println!("{}: {}", "Launch cores".cyan(), selection.params.block_dim);
    println!("{}: {:.2?}", "Elapsed".cyan(), elapsed);

    if verify {
        let problem_shape = GemmCoord::new(problem.m, problem.n, problem.k);
        let want = reference_gemm::<E, O>(&a, &layout_a, &b, &layout_b, bias.as_deref(), problem_shape);
        let error = max_relative_error(&c, &want);
        let tolerance = match O::DTYPE {
            DataType::I8 | DataType::I32 => 0.0,
            DataType::F32 => 1e-5,
            DataType::F16 | DataType::Bf16 => 1e-2,
        };
        if error > tolerance {
            println!("{}: max relative error {:.3e}", "Mismatch".red().bold(), error);
            std::process::exit(2);
        }
        println!("{}: max relative error {:.3e}", "Verified".green().bold(), error);
    }
    Ok(())
}

fn print_selection(selection: &Selection, verbose: bool) {
    let params = &selection.params;
    println!("{}", "Selection".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {}", "Problem".cyan(), params.problem);
    println!("{}: {}", "Variant".cyan(), params.variant.to_string().bold());
    println!("{}: {}", "Tiles".cyan(), params.tiles);
    println!("{}: {}", "Launch cores".cyan(), params.block_dim);
    println!(
        "{}: offset {}, direction {}",
        "Swizzle".cyan(),
        params.swizzle_offset,
        params.swizzle_direction
    );
    if params.split_factor > 1 {
        println!("{}: {} ({:?})", "Split K".cyan(), params.split_factor, params.split_mode);
    }
    println!(
        "{}: A {:?}, B {:?}, C {:?}",
        "Padding".cyan(),
        params.padding_a,
        params.padding_b,
        params.padding_c
    );
    println!("{}: {:?}", "Pipeline".cyan(), params.pipeline);
    if !selection.feasible {
        println!("{}", "Tiles do not fit the platform".red().bold());
    }

    if verbose {
        println!();
        println!("{}", "Details".bold().yellow());
        println!("{}", "-".repeat(50));
        println!("  {}: {}, {}", "Strides A/B".cyan(), params.stride_a, params.stride_b);
        println!("  {}: {}", "Stride C".cyan(), params.stride_c);
        println!("  {}: {:?}", "Tiling key".cyan(), params.tiling_key());
        if selection.normalized_a || selection.normalized_b {
            println!(
                "  {}: A {}, B {}",
                "Normalized".cyan(),
                selection.normalized_a,
                selection.normalized_b
            );
        }
    }
}

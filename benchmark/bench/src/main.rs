use clap::Parser;

use bench::hardware::get_benchmark_config;
use bench::{batch_reduce_from_str, check_kernel, datatype_from_str, time_generation, KernelReport};
use jitgemm_x86::{ArchTier, BatchReduce, CallConv, GemmDescriptor};

/// Generates one GEMM kernel and reports its size and generation time
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// number of repeats
    #[arg(long, default_value_t = 5)]
    n_repeats: usize,

    /// dim m
    #[arg(short, long, default_value_t = 64)]
    m: usize,

    /// dim n
    #[arg(short, long, default_value_t = 64)]
    n: usize,

    /// dim k
    #[arg(short, long, default_value_t = 64)]
    k: usize,

    /// input datatype: f64, f32, bf16, i16, i8
    #[arg(short, long, default_value_t = String::from("f32"))]
    dtype: String,

    /// output datatype, defaults to the input one
    #[arg(short, long)]
    out_dtype: Option<String>,

    /// target tier, defaults to the host
    #[arg(short, long)]
    arch: Option<String>,

    /// A stored transposed
    #[arg(short, long, default_value_t = false)]
    trans_a: bool,

    /// overwrite C instead of accumulating
    #[arg(long, default_value_t = false)]
    beta_zero: bool,

    /// batch-reduce mode: none, address, offset, stride
    #[arg(long, default_value_t = String::from("none"))]
    batch_reduce: String,

    /// batch dim
    #[arg(short, long, default_value_t = 4)]
    batch_dim: usize,

    /// run the kernel on the dev machine and compare with the reference
    #[arg(short, long, default_value_t = false)]
    check: bool,

    /// include host information in the report
    #[arg(long, default_value_t = false)]
    host: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), String> {
    let input = datatype_from_str(&args.dtype)?;
    let output = match &args.out_dtype {
        Some(s) => datatype_from_str(s)?,
        None => input,
    };
    let arch = match &args.arch {
        Some(s) => s.parse::<ArchTier>().map_err(|e| e.to_string())?,
        None => ArchTier::host(),
    };
    let mode = batch_reduce_from_str(&args.batch_reduce)?;

    let mut builder = GemmDescriptor::builder(args.m, args.n, args.k, input)
        .output(output)
        .call_conv(CallConv::host())
        .trans_a(args.trans_a)
        .beta_zero(args.beta_zero);
    builder = match mode {
        BatchReduce::Stride => {
            let a_rows = if args.trans_a { args.k } else { args.m };
            let a_cols = if args.trans_a { args.m } else { args.k };
            let c1 = a_rows * a_cols * input.size();
            let c2 = args.k * args.n * input.size();
            builder.strides(c1 as i64, c2 as i64)
        }
        mode => builder.batch_reduce(mode),
    };
    let desc = builder.build().map_err(|e| e.to_string())?;
    tracing::info!(%arch, m = args.m, n = args.n, k = args.k, %input, %output, "generating");

    let (code, timing) = time_generation(&desc, arch, args.n_repeats).map_err(|e| e.to_string())?;
    let mut report = KernelReport::new(&desc, arch, &code, timing);
    if args.check {
        match check_kernel(&desc, &code, args.batch_dim) {
            Ok(check) => report.check = Some(check),
            Err(why) => report.check_skipped = Some(why),
        }
    }

    let mut json = serde_json::to_value(&report).map_err(|e| e.to_string())?;
    if args.host {
        let host = serde_json::to_value(get_benchmark_config()).map_err(|e| e.to_string())?;
        json["host"] = host;
    }
    let text = serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?;
    println!("{}", text);
    match &report.check {
        Some(check) if !check.passed => Err(format!("check failed, diff_max: {}", check.diff_max)),
        _ => Ok(()),
    }
}

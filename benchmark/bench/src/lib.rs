pub mod hardware;

use std::time::Instant;

use half::bf16;
use serde::Serialize;

use jitgemm_dev::{gemm_fallback, max_abs_diff, random_matrix_seeded, Bound, Diff, Elem, Machine};
use jitgemm_x86::{
    generate, ArchTier, BatchReduce, Datatype, GemmDescriptor, GenError, GeneratedCode, KernelAbi,
};

pub fn datatype_from_str(s: &str) -> Result<Datatype, String> {
    match s.to_ascii_lowercase().as_str() {
        "f64" | "d" => Ok(Datatype::F64),
        "f32" | "s" => Ok(Datatype::F32),
        "bf16" => Ok(Datatype::Bf16),
        "i32" => Ok(Datatype::I32),
        "i16" => Ok(Datatype::I16),
        "i8" => Ok(Datatype::I8),
        _ => Err(format!("unknown datatype `{}`", s)),
    }
}

pub fn batch_reduce_from_str(s: &str) -> Result<BatchReduce, String> {
    match s.to_ascii_lowercase().as_str() {
        "none" => Ok(BatchReduce::None),
        "address" => Ok(BatchReduce::Address),
        "offset" => Ok(BatchReduce::Offset),
        "stride" => Ok(BatchReduce::Stride),
        _ => Err(format!("unknown batch-reduce mode `{}`", s)),
    }
}

#[derive(Debug, Serialize)]
pub struct GenerationTiming {
    pub best_time: f64,
    pub total_time: f64,
    pub kernels_per_sec: f64,
}

fn timed_generate(desc: &GemmDescriptor, arch: ArchTier) -> Result<(GeneratedCode, f64), GenError> {
    let start_time = Instant::now();
    let code = generate(desc, arch)?;
    Ok((code, start_time.elapsed().as_nanos() as f64 / 1e9))
}

/// Generates `desc` `n_repeats` times, at least once, and keeps the last kernel.
pub fn time_generation(
    desc: &GemmDescriptor,
    arch: ArchTier,
    n_repeats: usize,
) -> Result<(GeneratedCode, GenerationTiming), GenError> {
    let (mut code, first) = timed_generate(desc, arch)?;
    let (mut best_time, mut total_time) = (first, first);
    for _ in 1..n_repeats {
        let (kernel, end_time) = timed_generate(desc, arch)?;
        total_time += end_time;
        best_time = best_time.min(end_time);
        code = kernel;
    }
    let timing = GenerationTiming { best_time, total_time, kernels_per_sec: 1.0 / best_time.max(1e-12) };
    Ok((code, timing))
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub diff_max: f64,
    pub eps: f64,
    pub passed: bool,
    pub executed_instructions: u64,
}

/// Runs `code` on the dev machine against the reference GEMM.
///
/// Covers the plain ABI without batch reduction or with stride
/// batch-reduce over `batch_dim` products.
pub fn check_kernel(desc: &GemmDescriptor, code: &GeneratedCode, batch_dim: usize) -> Result<CheckReport, String> {
    if desc.abi() != KernelAbi::Plain || desc.vnni_c() {
        return Err("only plain-abi kernels are checked".to_string());
    }
    match desc.batch_reduce() {
        BatchReduce::None | BatchReduce::Stride => {}
        mode => return Err(format!("{:?} batch-reduce is not checked", mode)),
    }
    match (desc.input(), desc.output()) {
        (Datatype::F32, Datatype::F32) => check_typed::<f32, f32>(desc, code, batch_dim, 1e-3),
        (Datatype::F64, Datatype::F64) => check_typed::<f64, f64>(desc, code, batch_dim, 1e-6),
        (Datatype::Bf16, Datatype::F32) => check_typed::<bf16, f32>(desc, code, batch_dim, 1e-3),
        (Datatype::Bf16, Datatype::Bf16) => check_typed::<bf16, bf16>(desc, code, batch_dim, 2e-2),
        (Datatype::I16, Datatype::I32) => check_typed::<i16, i32>(desc, code, batch_dim, 0.5),
        (Datatype::I8, Datatype::I32) => check_typed::<i8, i32>(desc, code, batch_dim, 0.5),
        (input, output) => Err(format!("{} -> {} is not checked", input, output)),
    }
}

fn check_typed<TA, TC>(desc: &GemmDescriptor, code: &GeneratedCode, batch_dim: usize, eps: f64) -> Result<CheckReport, String>
where
    TA: Elem + Bound,
    TC: Elem + Bound + Diff,
{
    let (m, n, k) = (desc.m(), desc.n(), desc.k());
    let count = if desc.batch_reduce() == BatchReduce::Stride { batch_dim.max(1) } else { 1 };
    let a_len = desc.lda() * if desc.trans_a() { m } else { k };
    let b_len = desc.ldb() * n;
    let a_stride = desc.c1() as usize / TA::DT.size();
    let b_stride = desc.c2() as usize / TA::DT.size();
    let mut a = vec![TA::default(); a_len + a_stride * (count - 1)];
    let mut b = vec![TA::default(); b_len + b_stride * (count - 1)];
    let mut c = vec![TC::default(); desc.ldc() * n];
    random_matrix_seeded(&mut a, 1);
    random_matrix_seeded(&mut b, 2);
    random_matrix_seeded(&mut c, 3);

    let mut c_ref = c.clone();
    for r in 0..count {
        let beta_zero = desc.beta_zero() && r == 0;
        let (a_r, b_r) = (&a[r * a_stride..], &b[r * b_stride..]);
        gemm_fallback(m, n, k, a_r, desc.lda(), desc.trans_a(), b_r, desc.ldb(), beta_zero, &mut c_ref, desc.ldc());
    }

    let count_arg = count as u64;
    let mut args = vec![a.as_ptr() as u64, b.as_ptr() as u64, c.as_mut_ptr() as u64];
    if desc.batch_reduce() == BatchReduce::Stride {
        args.push(&count_arg as *const u64 as u64);
    }
    let mut machine = Machine::new();
    unsafe { machine.call(code, desc.call_conv(), &args) }.map_err(|e| e.to_string())?;
    let diff_max = max_abs_diff(&c, &c_ref, eps);
    Ok(CheckReport { diff_max, eps, passed: diff_max < eps, executed_instructions: machine.executed() })
}

#[derive(Debug, Serialize)]
pub struct KernelReport {
    pub arch: String,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub input: String,
    pub output: String,
    pub trans_a: bool,
    pub beta_zero: bool,
    pub batch_reduce: String,
    pub code_bytes: usize,
    pub instructions: usize,
    pub timing: GenerationTiming,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_skipped: Option<String>,
}

impl KernelReport {
    pub fn new(desc: &GemmDescriptor, arch: ArchTier, code: &GeneratedCode, timing: GenerationTiming) -> Self {
        KernelReport {
            arch: arch.to_string(),
            m: desc.m(),
            n: desc.n(),
            k: desc.k(),
            input: desc.input().to_string(),
            output: desc.output().to_string(),
            trans_a: desc.trans_a(),
            beta_zero: desc.beta_zero(),
            batch_reduce: format!("{:?}", desc.batch_reduce()).to_lowercase(),
            code_bytes: code.len(),
            instructions: code.instructions().map_or(0, |i| i.len()),
            timing,
            check: None,
            check_skipped: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_x86::CallConv;

    #[test]
    fn parses_names() {
        assert_eq!(datatype_from_str("BF16"), Ok(Datatype::Bf16));
        assert!(datatype_from_str("f16").is_err());
        assert_eq!(batch_reduce_from_str("stride"), Ok(BatchReduce::Stride));
    }

    #[test]
    fn stride_kernel_checks_out() {
        let desc = GemmDescriptor::builder(20, 6, 9, Datatype::F32)
            .call_conv(CallConv::SysV)
            .strides((20 * 9 * 4) as i64, (9 * 6 * 4) as i64)
            .build()
            .unwrap();
        let (code, timing) = time_generation(&desc, ArchTier::Avx2, 2).unwrap();
        assert!(timing.best_time <= timing.total_time);
        let report = check_kernel(&desc, &code, 3).unwrap();
        assert!(report.passed, "{:?}", report);
    }
}

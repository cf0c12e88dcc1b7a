#![allow(dead_code)]
#![allow(unused)]

pub mod vm;

pub use vm::{quantize_i8, round_to, Machine, Program, VmError};

use half::bf16;
use jitgemm_base::Datatype;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Element types a kernel reads or writes.
pub trait Elem: Copy + Default + std::fmt::Debug {
    const DT: Datatype;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl Elem for f64 {
    const DT: Datatype = Datatype::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl Elem for f32 {
    const DT: Datatype = Datatype::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Elem for bf16 {
    const DT: Datatype = Datatype::Bf16;
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        bf16::from_f64(v)
    }
}

impl Elem for i32 {
    const DT: Datatype = Datatype::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64 as i32
    }
}

impl Elem for i16 {
    const DT: Datatype = Datatype::I16;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64 as i16
    }
}

impl Elem for i8 {
    const DT: Datatype = Datatype::I8;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        quantize_i8(v)
    }
}

pub trait Bound {
    type X: rand::distributions::uniform::SampleUniform;
    fn min_value() -> Self::X;
    fn max_value() -> Self::X;
    fn my_sample(dist: &Uniform<Self::X>, rng: &mut StdRng) -> Self;
}

impl Bound for f32 {
    type X = f32;
    fn min_value() -> Self {
        -2.0
    }
    fn max_value() -> Self {
        2.0
    }
    fn my_sample(dist: &Uniform<Self>, rng: &mut StdRng) -> Self {
        dist.sample(rng)
    }
}

impl Bound for f64 {
    type X = f64;
    fn min_value() -> Self {
        -10.0
    }
    fn max_value() -> Self {
        10.0
    }
    fn my_sample(dist: &Uniform<Self>, rng: &mut StdRng) -> Self {
        dist.sample(rng)
    }
}

impl Bound for bf16 {
    type X = f32;
    fn min_value() -> f32 {
        -1.0
    }
    fn max_value() -> f32 {
        1.0
    }
    fn my_sample(dist: &Uniform<f32>, rng: &mut StdRng) -> Self {
        bf16::from_f32(dist.sample(rng))
    }
}

impl Bound for i32 {
    type X = i32;
    fn min_value() -> Self {
        -10
    }
    fn max_value() -> Self {
        10
    }
    fn my_sample(dist: &Uniform<Self>, rng: &mut StdRng) -> Self {
        dist.sample(rng)
    }
}

impl Bound for i16 {
    type X = i16;
    fn min_value() -> Self {
        -10
    }
    fn max_value() -> Self {
        10
    }
    fn my_sample(dist: &Uniform<Self>, rng: &mut StdRng) -> Self {
        dist.sample(rng)
    }
}

impl Bound for i8 {
    type X = i8;
    fn min_value() -> Self {
        -10
    }
    fn max_value() -> Self {
        10
    }
    fn my_sample(dist: &Uniform<Self>, rng: &mut StdRng) -> Self {
        dist.sample(rng)
    }
}

pub fn random_matrix_std<T>(arr: &mut [T])
where
    rand::distributions::Standard: rand::prelude::Distribution<T>,
{
    let mut x = StdRng::seed_from_u64(43);
    arr.iter_mut().for_each(|p| *p = x.gen::<T>());
}

pub fn random_matrix_uniform<T>(arr: &mut [T])
where
    T: Bound,
    T::X: rand::distributions::uniform::SampleUniform,
{
    random_matrix_seeded(arr, 43);
}

/// Like [`random_matrix_uniform`], for operands that must differ from each other.
pub fn random_matrix_seeded<T>(arr: &mut [T], seed: u64)
where
    T: Bound,
    T::X: rand::distributions::uniform::SampleUniform,
{
    let t0 = T::min_value();
    let t1 = T::max_value();
    let mut x = StdRng::seed_from_u64(seed);
    let un_dist = Uniform::new(t0, t1);
    arr.iter_mut().for_each(|p| *p = T::my_sample(&un_dist, &mut x));
}

pub trait Diff {
    fn diff(&self, other: &Self) -> f64;
}

impl Diff for f32 {
    fn diff(&self, other: &Self) -> f64 {
        let diff_abs = (self - other).abs();
        let diff_rel = diff_abs / self.abs();
        diff_abs.min(diff_rel) as f64
    }
}

impl Diff for f64 {
    fn diff(&self, other: &Self) -> f64 {
        let diff_abs = (self - other).abs();
        let diff_rel = diff_abs / self.abs();
        diff_abs.min(diff_rel)
    }
}

impl Diff for bf16 {
    fn diff(&self, other: &Self) -> f64 {
        self.to_f32().diff(&other.to_f32())
    }
}

impl Diff for i32 {
    fn diff(&self, other: &Self) -> f64 {
        (*self as i64 - *other as i64).abs() as f64
    }
}

impl Diff for i8 {
    fn diff(&self, other: &Self) -> f64 {
        (*self as i16 - *other as i16).abs() as f64
    }
}

pub fn max_abs_diff<T: Copy + std::fmt::Debug>(ap: &[T], bp: &[T], eps: f64) -> f64
where
    T: Diff,
{
    let mut diff = 0_f64;
    let mut diff_idx = 0;
    for (i, (a, b)) in ap.iter().zip(bp).enumerate() {
        let cur_diff = a.diff(b);
        if cur_diff > diff {
            diff_idx = i;
            diff = cur_diff;
        }
    }
    if diff > eps {
        println!("a: {:?}, b: {:?}, diff: {}, idx: {}", ap[diff_idx], bp[diff_idx], diff, diff_idx);
    }
    diff
}

/// Column-major `C = A * B (+ C)` accumulated in `f64`.
///
/// `A(i, p)` is read from `a[i + p * lda]`, or from `a[p + i * lda]` when
/// `trans_a` is set.
#[allow(clippy::too_many_arguments)]
pub fn gemm_fallback<TA: Elem, TC: Elem>(
    m: usize,
    n: usize,
    k: usize,
    a: &[TA],
    lda: usize,
    trans_a: bool,
    b: &[TA],
    ldb: usize,
    beta_zero: bool,
    c: &mut [TC],
    ldc: usize,
) {
    for j in 0..n {
        for i in 0..m {
            let mut dx = 0.0;
            for p in 0..k {
                let a_ip = if trans_a { a[p + i * lda] } else { a[i + p * lda] };
                dx += a_ip.to_f64() * b[p + j * ldb].to_f64();
            }
            let c_ij = &mut c[i + j * ldc];
            let prev = if beta_zero { 0.0 } else { c_ij.to_f64() };
            *c_ij = TC::from_f64(prev + dx);
        }
    }
}

/// 8-bit GEMM whose 32-bit result is scaled in `f32` and quantized.
#[allow(clippy::too_many_arguments)]
pub fn gemm_fallback_scaled_i8(
    m: usize,
    n: usize,
    k: usize,
    a: &[i8],
    lda: usize,
    b: &[i8],
    ldb: usize,
    scale: f32,
    c: &mut [i8],
    ldc: usize,
) {
    for j in 0..n {
        for i in 0..m {
            let mut acc = 0i32;
            for p in 0..k {
                acc = acc.wrapping_add(a[i + p * lda] as i32 * b[p + j * ldb] as i32);
            }
            c[i + j * ldc] = quantize_i8((acc as f32 * scale) as f64);
        }
    }
}

/// Position of `C(m, n)` in the packed layout: column pairs interleaved row by row.
pub fn vnni_index(m: usize, n: usize, ldc: usize) -> usize {
    (n / 2) * 2 * ldc + 2 * m + n % 2
}

pub fn pack_vnni<T: Copy>(plain: &[T], m: usize, n: usize, ldc: usize, packed: &mut [T]) {
    for j in 0..n {
        for i in 0..m {
            packed[vnni_index(i, j, ldc)] = plain[i + j * ldc];
        }
    }
}

pub fn unpack_vnni<T: Copy>(packed: &[T], m: usize, n: usize, ldc: usize, plain: &mut [T]) {
    for j in 0..n {
        for i in 0..m {
            plain[i + j * ldc] = packed[vnni_index(i, j, ldc)];
        }
    }
}

/// M extents around the block size `mb` and vector length `vl`.
pub fn generate_m_dims(mb: usize, vl: usize) -> Vec<usize> {
    let mut a_dims = vec![1, vl, mb, mb + 1, 2 * mb + vl / 2 + 1];
    for m in 1..vl.min(4) {
        a_dims.push(m + vl);
    }
    a_dims.sort_unstable();
    a_dims.dedup();
    a_dims
}

pub fn generate_n_dims(nb: usize) -> Vec<usize> {
    let mut a_dims = vec![1, 2, nb.saturating_sub(1).max(1), nb, nb + 1, 2 * nb + 3];
    a_dims.sort_unstable();
    a_dims.dedup();
    a_dims
}

// covers the unrolled, blocked and blocked-with-remainder k loops
pub fn generate_k_dims() -> Vec<usize> {
    vec![1, 3, 4, 23, 24, 25, 48, 51]
}

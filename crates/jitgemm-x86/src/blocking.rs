//! Table-driven blocking decisions.
//!
//! One [`BlockingEntry`] per (tier range, input type, output types) says how
//! M is swept, how wide N blocks may get and which micro-kernel body is used.
//! Everything here is a pure function of the descriptor and the tier.

use core::ops::RangeInclusive;

use jitgemm_base::arch::{VL256_TIERS, ZMM_TIERS};
use jitgemm_base::{ArchTier, BlockDim, Datatype, GemmDescriptor, GenError, Result};

use crate::config::{MicroKernelConfig, VectorKind};
pub use crate::kloop::k_blocking_strategy;
use crate::microkernel::{MicroKernelBody, BROADCAST_B, LOAD_A, MUL_ADD};

/// How M is cut into blocks.
#[derive(Debug)]
pub enum MLadder {
    /// fixed descending block sizes, the last ones narrower than a full vector
    Fixed(&'static [(usize, VectorKind)]),
    /// full blocks of `block` rows, then one masked remainder block
    Remainder { block: usize },
}

#[derive(Debug)]
pub struct BlockingEntry {
    pub tiers: RangeInclusive<ArchTier>,
    pub input: Datatype,
    pub outputs: &'static [Datatype],
    /// widest N block before the register budget is applied
    pub max_n: usize,
    pub ladder: MLadder,
    /// lanes a block must be a multiple of to go without masking
    pub granularity: usize,
    pub body: &'static dyn MicroKernelBody,
}

const SSE: RangeInclusive<ArchTier> = ArchTier::Generic..=ArchTier::Sse42;
const AVX: RangeInclusive<ArchTier> = ArchTier::Avx..=ArchTier::Avx;
const AVX2: RangeInclusive<ArchTier> = ArchTier::Avx2..=ArchTier::Avx2;
const MIC: RangeInclusive<ArchTier> = ArchTier::Avx512Mic..=ArchTier::Avx512Mic;
const KNM: RangeInclusive<ArchTier> = ArchTier::Avx512Knm..=ArchTier::Avx512Knm;
const MIC_KNM: RangeInclusive<ArchTier> = ArchTier::Avx512Mic..=ArchTier::Avx512Knm;
const CORE_SPR: RangeInclusive<ArchTier> = ArchTier::Avx512Core..=ArchTier::Avx512Spr;
const CLX_SPR: RangeInclusive<ArchTier> = ArchTier::Avx512Clx..=ArchTier::Avx512Spr;
const MIC_CORE: RangeInclusive<ArchTier> = ArchTier::Avx512Mic..=ArchTier::Avx512Core;
const VL256_PLAIN: RangeInclusive<ArchTier> = ArchTier::Avx512Vl256..=ArchTier::Avx512Vl256;
const VL256_VNNI: RangeInclusive<ArchTier> = ArchTier::Avx512Vl256Clx..=ArchTier::Avx512Vl256Cpx;

const F32_OUT: &[Datatype] = &[Datatype::F32];
const F64_OUT: &[Datatype] = &[Datatype::F64];
const BF16_OUT: &[Datatype] = &[Datatype::F32, Datatype::Bf16];
const I16_OUT: &[Datatype] = &[Datatype::I32];
const I8_OUT: &[Datatype] = &[Datatype::I32, Datatype::I8];

use VectorKind::{Full, Half, Scalar};

macro_rules! entry {
    ($tiers:expr, $input:ident, $outputs:expr, $max_n:expr, $ladder:expr, $gran:expr, $body:expr) => {
        BlockingEntry {
            tiers: $tiers,
            input: Datatype::$input,
            outputs: $outputs,
            max_n: $max_n,
            ladder: $ladder,
            granularity: $gran,
            body: $body,
        }
    };
}

pub static BLOCKING_TABLE: &[BlockingEntry] = &[
    entry!(SSE, F32, F32_OUT, 3, MLadder::Fixed(&[(16, Full), (12, Full), (8, Full), (4, Full), (1, Scalar)]), 4, &MUL_ADD),
    entry!(SSE, F64, F64_OUT, 3, MLadder::Fixed(&[(8, Full), (6, Full), (4, Full), (2, Full), (1, Scalar)]), 2, &MUL_ADD),
    entry!(AVX, F32, F32_OUT, 3, MLadder::Fixed(&[(24, Full), (16, Full), (8, Full), (4, Half), (1, Scalar)]), 8, &MUL_ADD),
    entry!(AVX, F64, F64_OUT, 3, MLadder::Fixed(&[(12, Full), (8, Full), (4, Full), (2, Half), (1, Scalar)]), 4, &MUL_ADD),
    entry!(
        AVX2,
        F32,
        F32_OUT,
        3,
        MLadder::Fixed(&[(32, Full), (24, Full), (16, Full), (8, Full), (4, Half), (1, Scalar)]),
        8,
        &BROADCAST_B
    ),
    entry!(
        AVX2,
        F64,
        F64_OUT,
        3,
        MLadder::Fixed(&[(16, Full), (12, Full), (8, Full), (4, Full), (2, Half), (1, Scalar)]),
        4,
        &BROADCAST_B
    ),
    // 256-bit vectors, 32 registers, masked tails
    entry!(VL256_TIERS, F32, F32_OUT, 30, MLadder::Remainder { block: 64 }, 8, &BROADCAST_B),
    entry!(VL256_TIERS, F64, F64_OUT, 30, MLadder::Remainder { block: 16 }, 4, &BROADCAST_B),
    entry!(VL256_TIERS, Bf16, BF16_OUT, 28, MLadder::Remainder { block: 16 }, 8, &BROADCAST_B),
    entry!(VL256_PLAIN, I16, I16_OUT, 28, MLadder::Remainder { block: 8 }, 8, &BROADCAST_B),
    entry!(VL256_PLAIN, I8, I8_OUT, 28, MLadder::Remainder { block: 8 }, 8, &BROADCAST_B),
    entry!(VL256_VNNI, I16, I16_OUT, 28, MLadder::Remainder { block: 64 }, 8, &BROADCAST_B),
    entry!(VL256_VNNI, I8, I8_OUT, 28, MLadder::Remainder { block: 64 }, 8, &BROADCAST_B),
    // 512-bit vectors
    entry!(MIC, F32, F32_OUT, 30, MLadder::Remainder { block: 16 }, 16, &LOAD_A),
    entry!(KNM, F32, F32_OUT, 28, MLadder::Remainder { block: 16 }, 16, &LOAD_A),
    entry!(MIC_KNM, F64, F64_OUT, 30, MLadder::Remainder { block: 8 }, 8, &LOAD_A),
    entry!(CORE_SPR, F32, F32_OUT, 30, MLadder::Remainder { block: 64 }, 16, &LOAD_A),
    entry!(CORE_SPR, F64, F64_OUT, 30, MLadder::Remainder { block: 32 }, 8, &LOAD_A),
    entry!(ZMM_TIERS, Bf16, BF16_OUT, 28, MLadder::Remainder { block: 16 }, 16, &LOAD_A),
    entry!(MIC_CORE, I16, I16_OUT, 28, MLadder::Remainder { block: 16 }, 16, &LOAD_A),
    entry!(MIC_CORE, I8, I8_OUT, 28, MLadder::Remainder { block: 16 }, 16, &LOAD_A),
    entry!(CLX_SPR, I16, I16_OUT, 28, MLadder::Remainder { block: 64 }, 16, &LOAD_A),
    entry!(CLX_SPR, I8, I8_OUT, 28, MLadder::Remainder { block: 64 }, 16, &LOAD_A),
];

/// Finds the table entry for the descriptor's datatypes on `arch`.
pub fn lookup(arch: ArchTier, desc: &GemmDescriptor) -> Result<&'static BlockingEntry> {
    if !arch.is_x86() {
        return Err(GenError::UnsupportedArchitecture(arch));
    }
    let unsupported = GenError::UnsupportedDatatype { input: desc.input(), output: desc.output(), arch };
    if desc.compute() != desc.input().default_compute() {
        return Err(unsupported);
    }
    BLOCKING_TABLE
        .iter()
        .find(|e| e.tiers.contains(&arch) && e.input == desc.input() && e.outputs.contains(&desc.output()))
        .ok_or(unsupported)
}

/// One step of the M ladder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MBlocking {
    /// 0 once the ladder is exhausted
    pub size: usize,
    pub kind: VectorKind,
    pub masking: bool,
}

impl MBlocking {
    const DONE: MBlocking = MBlocking { size: 0, kind: Full, masking: false };
}

/// First M block size: the largest legal one not exceeding `m`.
pub fn initial_m_blocking(entry: &BlockingEntry, m: usize) -> MBlocking {
    match entry.ladder {
        MLadder::Fixed(ladder) => ladder
            .iter()
            .find(|&&(size, _)| size <= m)
            .map(|&(size, kind)| MBlocking { size, kind, masking: false })
            .unwrap_or(MBlocking::DONE),
        MLadder::Remainder { block } => {
            let size = block.min(m);
            MBlocking { size, kind: Full, masking: size % entry.granularity != 0 }
        }
    }
}

/// Next M block size after `current` has covered as much of `m` as it can.
pub fn update_m_blocking(entry: &BlockingEntry, m: usize, current: usize) -> MBlocking {
    match entry.ladder {
        MLadder::Fixed(ladder) => match ladder.iter().position(|&(size, _)| size == current) {
            Some(i) if i + 1 < ladder.len() => {
                let (size, kind) = ladder[i + 1];
                MBlocking { size, kind, masking: false }
            }
            _ => MBlocking::DONE,
        },
        MLadder::Remainder { block } => {
            if current == block && m % block != 0 && m > block {
                let size = m % block;
                MBlocking { size, kind: Full, masking: size % entry.granularity != 0 }
            } else {
                MBlocking::DONE
            }
        }
    }
}

/// Table-listed exceptions to the greedy M sweep: `(tier, input, m, block) -> rows covered`.
const M_SWEEP_QUIRKS: &[(ArchTier, Datatype, usize, usize, usize)] = &[(ArchTier::Avx2, Datatype::F64, 56, 16, 32)];

/// One run of equal M blocks inside an N block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MSweepStep {
    pub start: usize,
    pub end: usize,
    pub blocking: MBlocking,
}

impl MSweepStep {
    pub fn count(&self) -> usize {
        (self.end - self.start) / self.blocking.size
    }
}

/// Covers `0..m` with runs of descending block sizes.
pub fn m_sweep(arch: ArchTier, desc: &GemmDescriptor) -> Result<Vec<MSweepStep>> {
    let entry = lookup(arch, desc)?;
    let m = desc.m();
    let mut blocking = initial_m_blocking(entry, m);
    let mut done = 0;
    let mut steps = Vec::new();
    while done != m {
        if blocking.size == 0 {
            return Err(GenError::IllegalBlocking(BlockDim::M));
        }
        let quirk = M_SWEEP_QUIRKS
            .iter()
            .find(|q| (q.0, q.1, q.2, q.3) == (arch, desc.input(), m, blocking.size) && done == 0);
        let end = match quirk {
            Some(q) => q.4,
            None => done + (m - done) / blocking.size * blocking.size,
        };
        if end != done {
            steps.push(MSweepStep { start: done, end, blocking });
        }
        done = end;
        blocking = update_m_blocking(entry, m, blocking.size);
    }
    Ok(steps)
}

/// `(block size, blocks)` pairs of the M sweep, sizes strictly decreasing.
pub fn m_block_sequence(arch: ArchTier, desc: &GemmDescriptor) -> Result<Vec<(usize, usize)>> {
    Ok(m_sweep(arch, desc)?.iter().map(|s| (s.blocking.size, s.count())).collect())
}

/// `(block size, blocks)` pairs of the N sweep, at most two sizes.
pub fn n_block_sequence(arch: ArchTier, desc: &GemmDescriptor) -> Result<Vec<(usize, usize)>> {
    Ok(n_blocking(arch, desc)?.runs().collect())
}

/// Micro-kernel configuration for one M block.
pub fn config_for(arch: ArchTier, desc: &GemmDescriptor, blocking: MBlocking) -> MicroKernelConfig {
    MicroKernelConfig::new(arch, desc, blocking.kind, blocking.masking)
}

/// Widest N block whose tile fits the register file next to the first M block.
pub fn max_n_blocking(arch: ArchTier, desc: &GemmDescriptor) -> Result<usize> {
    let entry = lookup(arch, desc)?;
    let init = initial_m_blocking(entry, desc.m());
    let cfg = config_for(arch, desc, init);
    let m_vectors = cfg.m_vectors(init.size).max(1);
    let mut n = entry.max_n;
    while n > 0 && entry.body.regs_needed(m_vectors, n) > cfg.vector_reg_count {
        n -= 1;
    }
    Ok(n)
}

/// Split of a dimension into at most two block sizes.
///
/// `count_a` blocks of `size_a` followed by `count_b` blocks of `size_b`,
/// with `size_a = size_b + 1` when both are used.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EqualizedBlocking {
    pub size_a: usize,
    pub count_a: usize,
    pub size_b: usize,
    pub count_b: usize,
}

impl EqualizedBlocking {
    /// Non-empty `(size, count)` runs in sweep order.
    pub fn runs(&self) -> impl Iterator<Item = (usize, usize)> {
        [(self.size_a, self.count_a), (self.size_b, self.count_b)].into_iter().filter(|&(s, c)| s > 0 && c > 0)
    }

    pub fn covered(&self) -> usize {
        self.size_a * self.count_a + self.size_b * self.count_b
    }
}

/// Splits `size` into the fewest chunks of at most `max` with sizes differing by at most one.
pub fn equalized_blocking(size: usize, max: usize) -> EqualizedBlocking {
    if size == 0 || max == 0 {
        return EqualizedBlocking { size_a: 0, count_a: 0, size_b: 0, count_b: 0 };
    }
    let chunks = 1 + (size - 1) / max;
    let rem = size % chunks;
    let small = size / chunks;
    if rem == 0 {
        return EqualizedBlocking { size_a: small, count_a: chunks, size_b: 0, count_b: 0 };
    }
    let large = (small + 1).min(max);
    EqualizedBlocking { size_a: large, count_a: rem, size_b: small, count_b: chunks - rem }
}

/// N blocks of the kernel.
pub fn n_blocking(arch: ArchTier, desc: &GemmDescriptor) -> Result<EqualizedBlocking> {
    let max_n = max_n_blocking(arch, desc)?;
    if max_n == 0 {
        return Err(GenError::IllegalBlocking(BlockDim::N));
    }
    Ok(equalized_blocking(desc.n(), max_n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::CallConv;

    fn desc(m: usize, n: usize, k: usize, dt: Datatype) -> GemmDescriptor {
        GemmDescriptor::builder(m, n, k, dt).call_conv(CallConv::SysV).build().unwrap()
    }

    #[test]
    fn every_x86_tier_has_f32_and_f64() {
        for arch in ArchTier::ALL.into_iter().filter(|a| a.is_x86()) {
            for dt in [Datatype::F32, Datatype::F64] {
                assert!(lookup(arch, &desc(8, 8, 8, dt)).is_ok(), "{} {}", arch, dt);
            }
        }
    }

    #[test]
    fn lookup_errors() {
        let d = desc(8, 8, 8, Datatype::F32);
        assert_eq!(lookup(ArchTier::Reference, &d).unwrap_err(), GenError::UnsupportedArchitecture(ArchTier::Reference));
        assert!(matches!(lookup(ArchTier::Aarch64Sve, &d), Err(GenError::UnsupportedArchitecture(_))));
        let bf = desc(8, 8, 8, Datatype::Bf16);
        assert!(matches!(lookup(ArchTier::Avx2, &bf), Err(GenError::UnsupportedDatatype { .. })));
        assert!(lookup(ArchTier::Avx512Vl256, &bf).is_ok());
        let mixed = GemmDescriptor::builder(8, 8, 8, Datatype::F32).output(Datatype::F64).build().unwrap();
        assert!(matches!(lookup(ArchTier::Avx512Core, &mixed), Err(GenError::UnsupportedDatatype { .. })));
        let i8_i8 = GemmDescriptor::builder(8, 8, 8, Datatype::I8).beta_zero(true).build().unwrap();
        assert!(lookup(ArchTier::Avx512Clx, &i8_i8).is_ok());
    }

    #[test]
    fn fixed_ladders() {
        assert_eq!(m_block_sequence(ArchTier::Sse3, &desc(37, 3, 3, Datatype::F32)).unwrap(), [(16, 2), (4, 1), (1, 1)]);
        assert_eq!(m_block_sequence(ArchTier::Avx, &desc(30, 3, 3, Datatype::F32)).unwrap(), [(24, 1), (4, 1), (1, 2)]);
        assert_eq!(m_block_sequence(ArchTier::Avx2, &desc(7, 3, 3, Datatype::F64)).unwrap(), [(4, 1), (2, 1), (1, 1)]);
        let d = desc(30, 3, 3, Datatype::F32);
        let sweep = m_sweep(ArchTier::Avx, &d).unwrap();
        assert_eq!(sweep[1].blocking.kind, VectorKind::Half);
        assert_eq!(sweep[2].blocking.kind, VectorKind::Scalar);
    }

    #[test]
    fn remainder_ladder_masks_the_tail() {
        let sweep = m_sweep(ArchTier::Avx512Core, &desc(9, 10, 20, Datatype::F32)).unwrap();
        assert_eq!(sweep, [MSweepStep { start: 0, end: 9, blocking: MBlocking { size: 9, kind: Full, masking: true } }]);
        let seq = m_block_sequence(ArchTier::Avx512Core, &desc(150, 4, 4, Datatype::F32)).unwrap();
        assert_eq!(seq, [(64, 2), (22, 1)]);
        let sweep = m_sweep(ArchTier::Avx512Core, &desc(128, 4, 4, Datatype::F32)).unwrap();
        assert_eq!(sweep.len(), 1);
        assert!(!sweep[0].blocking.masking);
        let sweep = m_sweep(ArchTier::Avx512Core, &desc(80, 4, 4, Datatype::F32)).unwrap();
        assert!(!sweep[1].blocking.masking, "16 rows fill one zmm");
    }

    #[test]
    fn avx2_f64_m56_takes_two_blocks_of_16() {
        assert_eq!(m_block_sequence(ArchTier::Avx2, &desc(56, 3, 4, Datatype::F64)).unwrap(), [(16, 2), (12, 2)]);
        assert_eq!(m_block_sequence(ArchTier::Avx2, &desc(57, 3, 4, Datatype::F64)).unwrap(), [(16, 3), (8, 1), (1, 1)]);
    }

    #[test]
    fn n_budget_follows_the_body() {
        // 64 rows f32 on zmm: 4 A vectors, 4n + 4 + 1 <= 32
        assert_eq!(max_n_blocking(ArchTier::Avx512Core, &desc(64, 30, 4, Datatype::F32)).unwrap(), 6);
        assert_eq!(max_n_blocking(ArchTier::Avx512Core, &desc(64, 30, 4, Datatype::F64)).unwrap(), 6);
        assert_eq!(max_n_blocking(ArchTier::Avx512Mic, &desc(16, 30, 4, Datatype::F32)).unwrap(), 30);
        // one vector: table cap wins
        assert_eq!(max_n_blocking(ArchTier::Avx512Core, &desc(9, 30, 4, Datatype::F32)).unwrap(), 30);
        assert_eq!(max_n_blocking(ArchTier::Avx512Spr, &desc(16, 30, 4, Datatype::Bf16)).unwrap(), 28);
        // broadcast-b on 256-bit: 8 vectors, n + 1 + 8n <= 32
        assert_eq!(max_n_blocking(ArchTier::Avx512Vl256, &desc(64, 30, 4, Datatype::F32)).unwrap(), 3);
        assert_eq!(max_n_blocking(ArchTier::Avx2, &desc(32, 30, 4, Datatype::F32)).unwrap(), 3);
        // multiply-add: 4 A vectors, broadcast and product registers, 4n + 4 + 2 <= 16
        assert_eq!(max_n_blocking(ArchTier::Sse3, &desc(16, 30, 4, Datatype::F32)).unwrap(), 2);
        assert_eq!(max_n_blocking(ArchTier::Avx, &desc(24, 30, 4, Datatype::F32)).unwrap(), 3);
        assert_eq!(max_n_blocking(ArchTier::Sse3, &desc(12, 30, 4, Datatype::F32)).unwrap(), 3);
    }

    #[test]
    fn equalized_splits() {
        assert_eq!(equalized_blocking(10, 30), EqualizedBlocking { size_a: 10, count_a: 1, size_b: 0, count_b: 0 });
        assert_eq!(equalized_blocking(10, 3), EqualizedBlocking { size_a: 3, count_a: 2, size_b: 2, count_b: 2 });
        assert_eq!(equalized_blocking(7, 7), EqualizedBlocking { size_a: 7, count_a: 1, size_b: 0, count_b: 0 });
        assert_eq!(equalized_blocking(31, 30).runs().collect::<Vec<_>>(), [(16, 1), (15, 1)]);
        for size in 1..100 {
            for max in 1..32 {
                let e = equalized_blocking(size, max);
                assert_eq!(e.covered(), size);
                assert!(e.size_a <= max);
                assert!(e.count_b == 0 || e.size_a == e.size_b + 1);
            }
        }
    }

    #[test]
    fn n_blocking_for_the_small_tile() {
        let e = n_blocking(ArchTier::Avx512Core, &desc(9, 10, 20, Datatype::F32)).unwrap();
        assert_eq!(e.runs().collect::<Vec<_>>(), [(10, 1)]);
        assert_eq!(n_block_sequence(ArchTier::Avx2, &desc(8, 10, 4, Datatype::F32)).unwrap(), [(3, 2), (2, 2)]);
    }
}

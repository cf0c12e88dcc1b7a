//! K dimension: unrolling decision and the emitted k loop.

use core::ops::RangeInclusive;

use jitgemm_base::instr::AluOp;
use jitgemm_base::{ArchTier, Datatype, InstructionEmitter};

use crate::loops::{LoopBound, LoopLabelTracker};
use crate::microkernel::MicroKernelBody;
use crate::tile::Tile;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KLoopStrategy {
    /// k loop over blocks of `unroll` steps, no remainder
    Blocked { unroll: usize },
    /// all k steps inline, B addressed by displacement
    Unrolled,
    /// k loop over `blocked` steps, then `remainder` inline steps
    BlockedRemainder { unroll: usize, blocked: usize, remainder: usize },
}

/// One row of the unroll table; the first enabled matching row wins.
#[derive(Clone, Debug)]
pub struct KUnrollRule {
    pub tiers: RangeInclusive<ArchTier>,
    /// only for tiles of exactly one M vector
    pub single_m_vector: bool,
    pub exclude_f64: bool,
    pub unroll: usize,
    /// fully unroll up to this many k steps
    pub threshold: usize,
    pub enabled: bool,
}

impl KUnrollRule {
    fn matches(&self, arch: ArchTier, input: Datatype, m_vectors: usize) -> bool {
        self.enabled
            && self.tiers.contains(&arch)
            && (!self.single_m_vector || m_vectors == 1)
            && !(self.exclude_f64 && input == Datatype::F64)
    }
}

pub const DEFAULT_K_UNROLL: usize = 4;
pub const DEFAULT_K_THRESHOLD: usize = 23;

pub static K_UNROLL_RULES: &[KUnrollRule] = &[
    KUnrollRule {
        tiers: ArchTier::Avx512Vl256..=ArchTier::Avx512Knm,
        single_m_vector: true,
        exclude_f64: false,
        unroll: 16,
        threshold: 47,
        enabled: true,
    },
    // kept for tuning, measured slower than the default
    KUnrollRule {
        tiers: ArchTier::Avx512Vl256..=ArchTier::Avx512Vl256Cpx,
        single_m_vector: false,
        exclude_f64: true,
        unroll: 4,
        threshold: 12,
        enabled: false,
    },
];

pub fn k_blocking_strategy_with_rules(
    rules: &[KUnrollRule],
    arch: ArchTier,
    input: Datatype,
    m_vectors: usize,
    k: usize,
) -> KLoopStrategy {
    let (unroll, threshold) = rules
        .iter()
        .find(|r| r.matches(arch, input, m_vectors))
        .map_or((DEFAULT_K_UNROLL, DEFAULT_K_THRESHOLD), |r| (r.unroll, r.threshold));
    if k % unroll == 0 && k > threshold {
        KLoopStrategy::Blocked { unroll }
    } else if k <= threshold {
        KLoopStrategy::Unrolled
    } else {
        let blocked = k / unroll * unroll;
        KLoopStrategy::BlockedRemainder { unroll, blocked, remainder: k - blocked }
    }
}

pub fn k_blocking_strategy(arch: ArchTier, input: Datatype, m_vectors: usize, k: usize) -> KLoopStrategy {
    k_blocking_strategy_with_rules(K_UNROLL_RULES, arch, input, m_vectors, k)
}

/// Emits the whole K phase for one tile. A ends one panel further on,
/// B ends where it started.
pub fn emit_k_loop(
    code: &mut dyn InstructionEmitter,
    tracker: &mut LoopLabelTracker,
    tile: &Tile,
    body: &dyn MicroKernelBody,
    strategy: KLoopStrategy,
    k: usize,
) {
    let kloop = tile.regs.kloop;
    let rewind = (k * tile.cfg.datatype_size_in) as i64;
    match strategy {
        KLoopStrategy::Unrolled => {
            for kk in 0..k {
                body.emit_step(code, tile, Some(kk));
            }
        }
        KLoopStrategy::Blocked { unroll } => {
            tracker.open(code, kloop, 0, LoopBound::Imm(k as i64));
            for _ in 0..unroll {
                body.emit_step(code, tile, None);
            }
            tracker.close(code, kloop, unroll as i64);
            code.alu_imm(AluOp::Sub, tile.regs.b, rewind);
        }
        KLoopStrategy::BlockedRemainder { unroll, blocked, remainder } => {
            tracker.open(code, kloop, 0, LoopBound::Imm(blocked as i64));
            for _ in 0..unroll {
                body.emit_step(code, tile, None);
            }
            tracker.close(code, kloop, unroll as i64);
            for _ in 0..remainder {
                body.emit_step(code, tile, None);
            }
            code.alu_imm(AluOp::Sub, tile.regs.b, rewind);
        }
    }
}

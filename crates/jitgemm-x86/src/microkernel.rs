//! Micro-kernel bodies: one rank-1 update of the accumulator tile per call.
//!
//! Register layout is fixed per body. Accumulators always occupy the top of
//! the register file (see [`Tile::acc`]), operands the bottom.

use core::fmt;

use jitgemm_base::instr::{AluOp, Mem, VecOp};
use jitgemm_base::InstructionEmitter;

use crate::disp;
use crate::tile::Tile;

pub trait MicroKernelBody: Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Vector registers one tile of `m_vectors x n_blocking` needs, accumulators included.
    fn regs_needed(&self, m_vectors: usize, n_blocking: usize) -> usize;

    /// Emits one k step. With `k_offset` the B column entries are addressed
    /// at that displacement and B stays put, otherwise B advances one element.
    /// A always advances by one column.
    fn emit_step(&self, code: &mut dyn InstructionEmitter, tile: &Tile, k_offset: Option<usize>);
}

/// Multiply then add, for tiers without FMA: A vectors in registers,
/// one broadcast B register and one product temporary.
#[derive(Debug)]
pub struct MulAddBody;

/// FMA with all B entries of the k step broadcast up front and one A register.
#[derive(Debug)]
pub struct BroadcastBBody;

/// FMA with A vectors in registers and B broadcast from memory by the FMA itself.
/// One register below the accumulators stays unassigned.
#[derive(Debug)]
pub struct LoadABody;

pub static MUL_ADD: MulAddBody = MulAddBody;
pub static BROADCAST_B: BroadcastBBody = BroadcastBBody;
pub static LOAD_A: LoadABody = LoadABody;

fn b_entry(code: &mut dyn InstructionEmitter, tile: &Tile, n: usize, k_offset: Option<usize>) -> Mem {
    let elems = n * tile.ldb + k_offset.unwrap_or(0);
    Mem::disp(tile.regs.b, disp(code, (elems * tile.cfg.datatype_size_in) as i64))
}

fn a_vector(code: &mut dyn InstructionEmitter, tile: &Tile, mv: usize) -> Mem {
    let elems = mv * tile.cfg.vector_length;
    Mem::disp(tile.regs.a, disp(code, (elems * tile.cfg.datatype_size_in) as i64))
}

fn advance(code: &mut dyn InstructionEmitter, tile: &Tile, k_offset: Option<usize>) {
    let size = tile.cfg.datatype_size_in as i64;
    code.alu_imm(AluOp::Add, tile.regs.a, tile.lda as i64 * size);
    if k_offset.is_none() {
        code.alu_imm(AluOp::Add, tile.regs.b, size);
    }
}

impl MicroKernelBody for MulAddBody {
    fn name(&self) -> &'static str {
        "mul-add"
    }

    fn regs_needed(&self, m_vectors: usize, n_blocking: usize) -> usize {
        m_vectors + 2 + m_vectors * n_blocking
    }

    fn emit_step(&self, code: &mut dyn InstructionEmitter, tile: &Tile, k_offset: Option<usize>) {
        let cfg = &tile.cfg;
        let vl = cfg.vector_length;
        let mvec = tile.m_vectors();
        let b_reg = mvec as u8;
        let tmp = b_reg + 1;
        for mv in 0..mvec {
            let mem = a_vector(code, tile, mv);
            code.vec_load(cfg.input, vl, mem, mv as u8, cfg.mask_for(tile.m_blocking, mv));
        }
        for n in 0..tile.n_blocking {
            let mem = b_entry(code, tile, n, k_offset);
            code.vec_broadcast(cfg.input, vl, mem, b_reg);
            for mv in 0..mvec {
                code.vec_move(mv as u8, tmp);
                code.vec_arith(VecOp::Mul, cfg.compute, vl, b_reg, tmp);
                code.vec_arith(VecOp::Add, cfg.compute, vl, tmp, tile.acc(mv, n));
            }
        }
        advance(code, tile, k_offset);
    }
}

impl MicroKernelBody for BroadcastBBody {
    fn name(&self) -> &'static str {
        "broadcast-b"
    }

    fn regs_needed(&self, m_vectors: usize, n_blocking: usize) -> usize {
        n_blocking + 1 + m_vectors * n_blocking
    }

    fn emit_step(&self, code: &mut dyn InstructionEmitter, tile: &Tile, k_offset: Option<usize>) {
        let cfg = &tile.cfg;
        let vl = cfg.vector_length;
        let a_reg = tile.n_blocking as u8;
        for n in 0..tile.n_blocking {
            let mem = b_entry(code, tile, n, k_offset);
            code.vec_broadcast(cfg.input, vl, mem, n as u8);
        }
        for mv in 0..tile.m_vectors() {
            let mem = a_vector(code, tile, mv);
            code.vec_load(cfg.input, vl, mem, a_reg, cfg.mask_for(tile.m_blocking, mv));
            for n in 0..tile.n_blocking {
                code.vec_fma(cfg.compute, vl, a_reg, n as u8, tile.acc(mv, n));
            }
        }
        advance(code, tile, k_offset);
    }
}

impl MicroKernelBody for LoadABody {
    fn name(&self) -> &'static str {
        "load-a"
    }

    fn regs_needed(&self, m_vectors: usize, n_blocking: usize) -> usize {
        m_vectors * n_blocking + m_vectors + 1
    }

    fn emit_step(&self, code: &mut dyn InstructionEmitter, tile: &Tile, k_offset: Option<usize>) {
        let cfg = &tile.cfg;
        let vl = cfg.vector_length;
        let mvec = tile.m_vectors();
        for mv in 0..mvec {
            let mem = a_vector(code, tile, mv);
            code.vec_load(cfg.input, vl, mem, mv as u8, cfg.mask_for(tile.m_blocking, mv));
        }
        for n in 0..tile.n_blocking {
            let mem = b_entry(code, tile, n, k_offset);
            for mv in 0..mvec {
                code.vec_fma_bcast(cfg.compute, cfg.input, vl, mv as u8, mem, tile.acc(mv, n));
            }
        }
        advance(code, tile, k_offset);
    }
}

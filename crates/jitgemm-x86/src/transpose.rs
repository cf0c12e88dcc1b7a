//! On-the-fly transposition of A into a contiguous `m x k` buffer.
//!
//! A is stored `k x m` (`A(m, k)` at `in[k + m * lda]`); the buffer receives
//! `out[m + k * M]` so the GEMM body can read it with `lda = M`.

use jitgemm_base::instr::{AluOp, GpReg, Mem};
use jitgemm_base::{ArchTier, Datatype, GemmDescriptor, InstructionEmitter};

use crate::disp;
use crate::loops::{LoopBound, LoopLabelTracker};
use crate::regs::{GpRegMapping, RegisterSaveScope};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransposeTier {
    Scalar,
    /// 256-bit loads, element stores
    ShortVector,
    /// 512-bit loads with a masked k tail
    FullVector,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransposeConfig {
    /// tier the code is emitted for; narrowed below the kernel's tier where needed
    pub arch: ArchTier,
    pub tier: TransposeTier,
    pub elem: Datatype,
    pub vector_length: usize,
}

impl TransposeConfig {
    pub fn for_arch(arch: ArchTier, elem: Datatype) -> TransposeConfig {
        let (arch, tier) = if arch >= ArchTier::Avx512Core {
            (arch, TransposeTier::FullVector)
        } else if arch >= ArchTier::Avx512Vl256 {
            (ArchTier::Avx2, TransposeTier::ShortVector)
        } else if arch >= ArchTier::Avx {
            (arch, TransposeTier::ShortVector)
        } else {
            (arch, TransposeTier::Scalar)
        };
        let vector_length = match tier {
            TransposeTier::Scalar => 1,
            _ => arch.vector_bytes() / elem.size(),
        };
        TransposeConfig { arch, tier, elem, vector_length }
    }
}

const SRC: GpReg = GpReg::R8;
const DST: GpReg = GpReg::R9;
const M_COUNTER: GpReg = GpReg::Rdx;
const K_COUNTER: GpReg = GpReg::Rax;
const MASK_TMP: GpReg = GpReg::R10;
const K_TAIL_MASK: u8 = 2;
/// Registers the transposition clobbers that may hold kernel arguments.
const SAVED: [GpReg; 6] = [GpReg::Rax, GpReg::Rdx, GpReg::Rcx, GpReg::Rdi, SRC, DST];

/// Holds the stack buffer between allocation and release.
pub const BUFFER: GpReg = GpReg::R11;

/// Bytes taken from the stack for the buffer plus the saved alignment.
pub fn stack_bytes(desc: &GemmDescriptor) -> i64 {
    let bytes = desc.m() * desc.k() * desc.input().size();
    ((bytes + 63) / 64 * 64 + 56) as i64
}

/// Aligns the stack to 64 bytes and carves the buffer out of it into [`BUFFER`].
pub fn alloc_stack_buffer(code: &mut dyn InstructionEmitter, desc: &GemmDescriptor) {
    code.alu_reg(AluOp::Mov, GpReg::Rsp, GpReg::R12);
    code.alu_imm(AluOp::And, GpReg::R12, 63);
    code.alu_reg(AluOp::Sub, GpReg::R12, GpReg::Rsp);
    code.push(GpReg::R12);
    code.alu_imm(AluOp::Sub, GpReg::Rsp, stack_bytes(desc));
    code.alu_reg(AluOp::Mov, GpReg::Rsp, BUFFER);
}

pub fn release_stack_buffer(code: &mut dyn InstructionEmitter, desc: &GemmDescriptor) {
    code.alu_imm(AluOp::Add, GpReg::Rsp, stack_bytes(desc));
    code.pop(GpReg::R12);
    code.alu_reg(AluOp::Add, GpReg::R12, GpReg::Rsp);
}

/// Transposes A into [`BUFFER`] and repoints the A role at it.
pub fn emit_transpose(
    code: &mut dyn InstructionEmitter,
    tracker: &mut LoopLabelTracker,
    regs: &GpRegMapping,
    desc: &GemmDescriptor,
    cfg: &TransposeConfig,
) {
    let size = cfg.elem.size();
    let m = desc.m();
    let k = desc.k();
    let vl = cfg.vector_length;
    let k_blocks = k / vl;
    let k_tail = k % vl;
    let column = (m * size) as i64;

    tracing::trace!(tier = ?cfg.tier, vl, k_blocks, k_tail, "transposing a");

    let scope = RegisterSaveScope::save(code, &SAVED);
    code.alu_reg(AluOp::Mov, regs.a, SRC);
    code.alu_reg(AluOp::Mov, BUFFER, DST);
    if cfg.tier == TransposeTier::FullVector && k_tail > 0 {
        code.alu_imm(AluOp::Mov, MASK_TMP, (1i64 << k_tail) - 1);
        code.mask_move(K_TAIL_MASK, MASK_TMP);
    }

    tracker.open(code, M_COUNTER, 0, LoopBound::Imm(m as i64));
    if k_blocks > 0 {
        tracker.open(code, K_COUNTER, 0, LoopBound::Imm(k_blocks as i64));
        if cfg.tier == TransposeTier::Scalar {
            code.vec_load(cfg.elem, 1, Mem::base(SRC), 0, None);
            code.vec_store(cfg.elem, 1, Mem::base(DST), 0, None);
        } else {
            code.vec_load(cfg.elem, vl, Mem::base(SRC), 0, None);
            for lane in 0..vl {
                let off = disp(code, lane as i64 * column);
                code.vec_store_lane(cfg.elem, lane, Mem::disp(DST, off), 0);
            }
        }
        code.alu_imm(AluOp::Add, SRC, (vl * size) as i64);
        code.alu_imm(AluOp::Add, DST, vl as i64 * column);
        tracker.close(code, K_COUNTER, 1);
    }
    if k_tail > 0 {
        if cfg.tier == TransposeTier::FullVector {
            code.vec_load(cfg.elem, vl, Mem::base(SRC), 0, Some(K_TAIL_MASK));
            for lane in 0..k_tail {
                let off = disp(code, lane as i64 * column);
                code.vec_store_lane(cfg.elem, lane, Mem::disp(DST, off), 0);
            }
        } else {
            for lane in 0..k_tail {
                let src = disp(code, (lane * size) as i64);
                let dst = disp(code, lane as i64 * column);
                code.vec_load(cfg.elem, 1, Mem::disp(SRC, src), 0, None);
                code.vec_store(cfg.elem, 1, Mem::disp(DST, dst), 0, None);
            }
        }
    }
    let walked = (k_blocks * vl) as i64;
    code.alu_imm(AluOp::Add, SRC, (desc.lda() as i64 - walked) * size as i64);
    code.alu_imm(AluOp::Add, DST, size as i64 - walked * column);
    tracker.close(code, M_COUNTER, 1);

    scope.restore(code);
    code.alu_reg(AluOp::Mov, BUFFER, regs.a);
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::instr::Instr;
    use jitgemm_base::{CallConv, GeneratedCode};

    #[test]
    fn tiers_and_narrowing() {
        let c = TransposeConfig::for_arch(ArchTier::Sse42, Datatype::F32);
        assert_eq!((c.tier, c.vector_length), (TransposeTier::Scalar, 1));
        let c = TransposeConfig::for_arch(ArchTier::Avx2, Datatype::F64);
        assert_eq!((c.tier, c.vector_length), (TransposeTier::ShortVector, 4));
        let c = TransposeConfig::for_arch(ArchTier::Avx512Knm, Datatype::F32);
        assert_eq!((c.arch, c.tier, c.vector_length), (ArchTier::Avx2, TransposeTier::ShortVector, 8));
        let c = TransposeConfig::for_arch(ArchTier::Avx512Spr, Datatype::F32);
        assert_eq!((c.tier, c.vector_length), (TransposeTier::FullVector, 16));
    }

    #[test]
    fn masked_tail_on_full_vectors() {
        let desc = GemmDescriptor::builder(6, 4, 19, Datatype::F32).call_conv(CallConv::SysV).trans_a(true).build().unwrap();
        let regs = GpRegMapping::for_descriptor(&desc).unwrap();
        let cfg = TransposeConfig::for_arch(ArchTier::Avx512Core, Datatype::F32);
        let mut code = GeneratedCode::new(ArchTier::Avx512Core);
        let mut tracker = LoopLabelTracker::new();
        emit_transpose(&mut code, &mut tracker, &regs, &desc, &cfg);
        tracker.finish(&mut code);
        assert!(code.is_ok());
        let instrs = code.instructions().unwrap();
        assert!(instrs.contains(&Instr::AluImm { op: AluOp::Mov, dst: MASK_TMP, imm: 0b111 }));
        let lanes = instrs.iter().filter(|i| matches!(i, Instr::VecStoreLane { .. })).count();
        assert_eq!(lanes, 16 + 3);
        assert_eq!(instrs.last(), Some(&Instr::AluReg { op: AluOp::Mov, src: BUFFER, dst: regs.a }));
    }

    #[test]
    fn stack_buffer_is_released_symmetrically() {
        let desc = GemmDescriptor::builder(5, 4, 3, Datatype::F64).call_conv(CallConv::SysV).trans_a(true).build().unwrap();
        assert_eq!(stack_bytes(&desc), 128 + 56);
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        alloc_stack_buffer(&mut code, &desc);
        release_stack_buffer(&mut code, &desc);
        let instrs = code.instructions().unwrap();
        assert_eq!(instrs.iter().filter(|i| matches!(i, Instr::Push(GpReg::R12))).count(), 1);
        assert_eq!(instrs.iter().filter(|i| matches!(i, Instr::Pop(GpReg::R12))).count(), 1);
    }
}

//! C tile load/store and the pointer arithmetic between tiles.

use jitgemm_base::instr::{AluOp, GpReg, Mem, PrefetchHint, VReg, VecOp};
use jitgemm_base::{BatchReduce, Datatype, GemmDescriptor, InstructionEmitter};

use crate::config::MicroKernelConfig;
use crate::frame::{self, StackVar};
use crate::regs::GpRegMapping;
use crate::{disp, effective_lda};

/// One `m_blocking x n_blocking` accumulator tile.
#[derive(Copy, Clone, Debug)]
pub struct Tile {
    pub cfg: MicroKernelConfig,
    pub regs: GpRegMapping,
    pub m_blocking: usize,
    pub n_blocking: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
}

/// Free register for post-processing once the K phase is done.
const SCRATCH_VREG: VReg = 0;

impl Tile {
    pub fn new(
        cfg: MicroKernelConfig,
        regs: GpRegMapping,
        desc: &GemmDescriptor,
        m_blocking: usize,
        n_blocking: usize,
    ) -> Tile {
        Tile { cfg, regs, m_blocking, n_blocking, lda: effective_lda(desc), ldb: desc.ldb(), ldc: desc.ldc() }
    }

    #[inline]
    pub fn m_vectors(&self) -> usize {
        self.cfg.m_vectors(self.m_blocking)
    }

    /// Accumulator for vector `mv` of column `n`.
    #[inline]
    pub fn acc(&self, mv: usize, n: usize) -> VReg {
        let mvec = self.m_vectors();
        (self.cfg.vector_reg_count - mvec * self.n_blocking + n * mvec + mv) as VReg
    }

    fn c_entry(&self, code: &mut dyn InstructionEmitter, mv: usize, n: usize) -> Mem {
        let elems = n * self.ldc + mv * self.cfg.vector_length;
        Mem::disp(self.regs.c, disp(code, (elems * self.cfg.datatype_size_out) as i64))
    }

    fn each_acc(&self) -> impl Iterator<Item = (usize, usize)> {
        let mvec = self.m_vectors();
        (0..self.n_blocking).flat_map(move |n| (0..mvec).map(move |mv| (mv, n)))
    }
}

/// Zeroes or loads the accumulators and issues the tile's prefetch hints.
pub fn load_c(code: &mut dyn InstructionEmitter, tile: &Tile, desc: &GemmDescriptor) {
    let cfg = &tile.cfg;
    for (mv, n) in tile.each_acc() {
        let acc = tile.acc(mv, n);
        if desc.beta_zero() {
            code.vec_zero(cfg.vector_length, acc);
        } else {
            let mem = tile.c_entry(code, mv, n);
            code.vec_load(cfg.output, cfg.vector_length, mem, acc, cfg.mask_for(tile.m_blocking, mv));
        }
    }
    if let Some(a_pf) = tile.regs.a_prefetch {
        if desc.batch_reduce() != BatchReduce::Address {
            prefetch_a(code, tile, a_pf);
        }
    }
    if let Some(b_pf) = tile.regs.b_prefetch {
        for n in 0..tile.n_blocking {
            let off = disp(code, (n * tile.ldc * cfg.datatype_size_out) as i64);
            code.prefetch(PrefetchHint::T1, Mem::disp(b_pf, off));
        }
    }
}

/// Hints the A panel of the next kernel call, one line per M vector.
pub fn prefetch_a(code: &mut dyn InstructionEmitter, tile: &Tile, a_pf: GpReg) {
    for mv in 0..tile.m_vectors() {
        let off = disp(code, (mv * tile.cfg.vector_length * tile.cfg.datatype_size_in) as i64);
        code.prefetch(PrefetchHint::T1, Mem::disp(a_pf, off));
    }
}

/// Applies scaling and post operations, then writes the accumulators back.
pub fn store_c(code: &mut dyn InstructionEmitter, tile: &Tile, desc: &GemmDescriptor) {
    let cfg = &tile.cfg;
    let vl = cfg.vector_length;
    if let Some(scf) = tile.regs.scale_factor {
        code.vec_broadcast(Datatype::F32, vl, Mem::base(scf), SCRATCH_VREG);
        for (mv, n) in tile.each_acc() {
            let acc = tile.acc(mv, n);
            code.vec_convert(Datatype::I32, Datatype::F32, vl, acc);
            code.vec_arith(VecOp::Mul, Datatype::F32, vl, SCRATCH_VREG, acc);
        }
    }
    let post_op = desc.post_op();
    if post_op.has_bias() {
        let bias = tile.regs.help0;
        frame::load_var(code, StackVar::Bias, bias);
        let size = cfg.datatype_size_out;
        for mv in 0..tile.m_vectors() {
            let off = disp(code, (mv * vl * size) as i64);
            let mem = Mem::indexed(bias, tile.regs.mloop, size as u8, off);
            code.vec_load(cfg.output, vl, mem, SCRATCH_VREG, cfg.mask_for(tile.m_blocking, mv));
            for n in 0..tile.n_blocking {
                code.vec_arith(VecOp::Add, cfg.compute, vl, SCRATCH_VREG, tile.acc(mv, n));
            }
        }
    }
    if post_op.has_relu() {
        code.vec_zero(vl, SCRATCH_VREG);
        for (mv, n) in tile.each_acc() {
            code.vec_arith(VecOp::Max, cfg.compute, vl, SCRATCH_VREG, tile.acc(mv, n));
        }
    }
    for (mv, n) in tile.each_acc() {
        let mem = tile.c_entry(code, mv, n);
        code.vec_store(cfg.output, vl, mem, tile.acc(mv, n), cfg.mask_for(tile.m_blocking, mv));
    }
}

/// Moves every pointer from one M block to the next.
pub fn footer_m(code: &mut dyn InstructionEmitter, regs: &GpRegMapping, desc: &GemmDescriptor, m_blocking: usize) {
    let size_in = desc.input().size() as i64;
    let size_out = desc.output().size() as i64;
    let mb = m_blocking as i64;
    let address = desc.batch_reduce() == BatchReduce::Address;
    code.alu_imm(AluOp::Add, regs.c, mb * size_out);
    if !address {
        let k_panel = desc.k() as i64 * effective_lda(desc) as i64;
        code.alu_imm(AluOp::Sub, regs.a, (k_panel - mb) * size_in);
        if let Some(a_pf) = regs.a_prefetch {
            code.alu_imm(AluOp::Add, a_pf, mb * size_in);
        }
    }
    if let Some(b_pf) = regs.b_prefetch {
        code.alu_imm(AluOp::Add, b_pf, mb * size_out);
    }
}

/// Moves every pointer from the end of one N block to the start of the next.
pub fn footer_n(code: &mut dyn InstructionEmitter, regs: &GpRegMapping, desc: &GemmDescriptor, n_blocking: usize) {
    let size_in = desc.input().size() as i64;
    let size_out = desc.output().size() as i64;
    let m = desc.m() as i64;
    let c_step = (n_blocking * desc.ldc()) as i64 - m;
    code.alu_imm(AluOp::Add, regs.c, c_step * size_out);
    if desc.batch_reduce() != BatchReduce::Address {
        code.alu_imm(AluOp::Add, regs.b, (n_blocking * desc.ldb()) as i64 * size_in);
        code.alu_imm(AluOp::Sub, regs.a, m * size_in);
        if let Some(a_pf) = regs.a_prefetch {
            code.alu_imm(AluOp::Sub, a_pf, m * size_in);
        }
    }
    if let Some(b_pf) = regs.b_prefetch {
        code.alu_imm(AluOp::Add, b_pf, c_step * size_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::instr::Instr;
    use jitgemm_base::{ArchTier, CallConv, GeneratedCode};

    fn tile(desc: &GemmDescriptor, arch: ArchTier, mb: usize, nb: usize) -> Tile {
        let cfg = MicroKernelConfig::fullvector(arch, desc, true);
        Tile::new(cfg, GpRegMapping::for_descriptor(desc).unwrap(), desc, mb, nb)
    }

    #[test]
    fn accumulators_fill_the_top_of_the_register_file() {
        let d = GemmDescriptor::builder(64, 6, 4, Datatype::F32).call_conv(CallConv::SysV).build().unwrap();
        let t = tile(&d, ArchTier::Avx512Core, 64, 7);
        assert_eq!(t.acc(0, 0), 32 - 28);
        assert_eq!(t.acc(3, 6), 31);
        let t = tile(&d, ArchTier::Avx2, 32, 3);
        assert_eq!(t.acc(0, 0), 4);
        assert_eq!(t.acc(1, 0), 5);
        assert_eq!(t.acc(0, 1), 8);
    }

    #[test]
    fn beta_zero_skips_the_c_load() {
        let d = GemmDescriptor::builder(9, 2, 4, Datatype::F32).call_conv(CallConv::SysV).beta_zero(true).build().unwrap();
        let t = tile(&d, ArchTier::Avx512Core, 9, 2);
        let mut code = GeneratedCode::new(ArchTier::Avx512Core);
        load_c(&mut code, &t, &d);
        store_c(&mut code, &t, &d);
        let instrs = code.instructions().unwrap();
        assert!(!instrs.iter().any(|i| matches!(i, Instr::VecLoad { .. })));
        assert_eq!(instrs.iter().filter(|i| matches!(i, Instr::VecZero { .. })).count(), 2);
        // one partial vector per column, stored under the tail mask
        let masked = instrs.iter().filter(|i| matches!(i, Instr::VecStore { mask: Some(1), .. })).count();
        assert_eq!(masked, 2);
    }

    #[test]
    fn footers_restore_a_and_b() {
        let d = GemmDescriptor::builder(10, 6, 5, Datatype::F64).call_conv(CallConv::SysV).lda(12).build().unwrap();
        let regs = GpRegMapping::for_descriptor(&d).unwrap();
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        footer_m(&mut code, &regs, &d, 4);
        footer_n(&mut code, &regs, &d, 3);
        let instrs = code.instructions().unwrap();
        assert_eq!(
            instrs,
            [
                Instr::AluImm { op: AluOp::Add, dst: regs.c, imm: 32 },
                Instr::AluImm { op: AluOp::Sub, dst: regs.a, imm: (5 * 12 - 4) * 8 },
                Instr::AluImm { op: AluOp::Add, dst: regs.c, imm: (3 * 10 - 10) * 8 },
                Instr::AluImm { op: AluOp::Add, dst: regs.b, imm: 3 * 5 * 8 },
                Instr::AluImm { op: AluOp::Sub, dst: regs.a, imm: 10 * 8 },
            ]
        );
    }
}

//! Stack frame for the extended ABI and packed (VNNI) output.
//!
//! Frame variables live in fixed `rbp`-relative slots. Packed output is
//! computed into a plain column-major scratch C and converted at the end.

use jitgemm_base::instr::{AluOp, GpReg, Mem};
use jitgemm_base::{Datatype, GemmDescriptor, GemmParam, InstructionEmitter, KernelAbi};

use crate::loops::{LoopBound, LoopLabelTracker};
use crate::regs::GpRegMapping;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackVar {
    Scratch = 1,
    TransposeBuffer = 2,
    TrueC = 3,
    Bias = 4,
}

/// Bytes reserved below `rbp` for the frame variables.
pub const FRAME_VARS_BYTES: i64 = 64;

const ALIGN: usize = 64;

fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) / ALIGN * ALIGN
}

pub fn var_mem(var: StackVar) -> Mem {
    Mem::disp(GpReg::Rbp, -8 * var as i32)
}

pub fn load_var(code: &mut dyn InstructionEmitter, var: StackVar, dst: GpReg) {
    code.load_gp(var_mem(var), dst);
}

pub fn store_var(code: &mut dyn InstructionEmitter, var: StackVar, src: GpReg) {
    code.store_gp(var_mem(var), src);
}

pub fn needs_frame(desc: &GemmDescriptor) -> bool {
    desc.abi() == KernelAbi::Extended || desc.vnni_c()
}

/// Split of the caller-provided scratch block under the extended ABI:
/// the transposed A first, then the plain C the packed output is built from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScratchLayout {
    pub transpose_bytes: usize,
    pub c_bytes: usize,
}

impl ScratchLayout {
    pub fn of(desc: &GemmDescriptor) -> ScratchLayout {
        let transpose_bytes = if desc.trans_a() { round_up(desc.m() * desc.k() * desc.input().size()) } else { 0 };
        let c_bytes = if desc.vnni_c() { round_up(desc.ldc() * desc.n() * desc.output().size()) } else { 0 };
        ScratchLayout { transpose_bytes, c_bytes }
    }

    pub fn total(&self) -> usize {
        self.transpose_bytes + self.c_bytes
    }
}

/// Offset of the plain C inside the scratch pointed to by [`StackVar::Scratch`].
fn c_scratch_offset(desc: &GemmDescriptor) -> usize {
    if desc.abi() == KernelAbi::Extended {
        ScratchLayout::of(desc).transpose_bytes
    } else {
        0
    }
}

pub fn setup(code: &mut dyn InstructionEmitter, regs: &GpRegMapping, desc: &GemmDescriptor) {
    let tmp = regs.help0;
    code.push(GpReg::Rbp);
    code.alu_reg(AluOp::Mov, GpReg::Rsp, GpReg::Rbp);
    code.alu_imm(AluOp::Sub, GpReg::Rsp, FRAME_VARS_BYTES);

    if desc.abi() == KernelAbi::Extended {
        if let Some(pb) = regs.param_block {
            code.load_gp(Mem::disp(pb, GemmParam::BIAS), tmp);
            store_var(code, StackVar::Bias, tmp);
            code.load_gp(Mem::disp(pb, GemmParam::SCRATCH), tmp);
            store_var(code, StackVar::Scratch, tmp);
            if desc.trans_a() {
                store_var(code, StackVar::TransposeBuffer, tmp);
            }
        }
    } else if desc.vnni_c() {
        let bytes = ScratchLayout::of(desc).c_bytes;
        code.alu_imm(AluOp::Sub, GpReg::Rsp, bytes as i64);
        code.alu_imm(AluOp::And, GpReg::Rsp, -(ALIGN as i64));
        code.alu_reg(AluOp::Mov, GpReg::Rsp, tmp);
        store_var(code, StackVar::Scratch, tmp);
    }

    if desc.vnni_c() {
        store_var(code, StackVar::TrueC, regs.c);
        load_var(code, StackVar::Scratch, regs.c);
        let off = c_scratch_offset(desc);
        if off != 0 {
            code.alu_imm(AluOp::Add, regs.c, off as i64);
        }
    }
}

pub fn teardown(code: &mut dyn InstructionEmitter) {
    code.alu_reg(AluOp::Mov, GpReg::Rbp, GpReg::Rsp);
    code.pop(GpReg::Rbp);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VnniDirection {
    /// plain scratch C into the packed caller C
    Pack,
    /// packed caller C into the plain scratch C, for beta = 1
    Unpack,
}

/// Converts between the plain scratch C and the caller's packed C, where
/// element `(m, n)` sits at `(n / 2) * 2 * ldc + 2 * m + n % 2`.
pub fn vnni_pass(
    code: &mut dyn InstructionEmitter,
    tracker: &mut LoopLabelTracker,
    regs: &GpRegMapping,
    desc: &GemmDescriptor,
    dir: VnniDirection,
) {
    let plain = regs.help0;
    let packed = regs.help2;
    let size = Datatype::Bf16.size() as i64;
    let m = desc.m() as i64;
    let ldc = desc.ldc() as i64;
    let ldc_bytes = (ldc * size) as i32;

    load_var(code, StackVar::Scratch, plain);
    let off = c_scratch_offset(desc);
    if off != 0 {
        code.alu_imm(AluOp::Add, plain, off as i64);
    }
    load_var(code, StackVar::TrueC, packed);

    tracker.open(code, regs.nloop, 0, LoopBound::Imm(desc.n() as i64 / 2));
    tracker.open(code, regs.mloop, 0, LoopBound::Imm(m));
    let (even, odd) = (Mem::base(plain), Mem::disp(plain, ldc_bytes));
    let (lo, hi) = (Mem::base(packed), Mem::disp(packed, size as i32));
    match dir {
        VnniDirection::Pack => {
            code.vec_load(Datatype::Bf16, 1, even, 0, None);
            code.vec_load(Datatype::Bf16, 1, odd, 1, None);
            code.vec_store(Datatype::Bf16, 1, lo, 0, None);
            code.vec_store(Datatype::Bf16, 1, hi, 1, None);
        }
        VnniDirection::Unpack => {
            code.vec_load(Datatype::Bf16, 1, lo, 0, None);
            code.vec_load(Datatype::Bf16, 1, hi, 1, None);
            code.vec_store(Datatype::Bf16, 1, even, 0, None);
            code.vec_store(Datatype::Bf16, 1, odd, 1, None);
        }
    }
    code.alu_imm(AluOp::Add, plain, size);
    code.alu_imm(AluOp::Add, packed, 2 * size);
    tracker.close(code, regs.mloop, 1);
    code.alu_imm(AluOp::Add, plain, (2 * ldc - m) * size);
    code.alu_imm(AluOp::Add, packed, (2 * ldc - 2 * m) * size);
    tracker.close(code, regs.nloop, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::instr::Instr;
    use jitgemm_base::{ArchTier, CallConv, GeneratedCode};

    #[test]
    fn scratch_layout_is_aligned() {
        let d = GemmDescriptor::builder(10, 6, 5, Datatype::F32)
            .call_conv(CallConv::SysV)
            .abi(KernelAbi::Extended)
            .trans_a(true)
            .build()
            .unwrap();
        assert_eq!(ScratchLayout::of(&d), ScratchLayout { transpose_bytes: 256, c_bytes: 0 });
        let d = GemmDescriptor::builder(10, 6, 5, Datatype::F32)
            .output(Datatype::Bf16)
            .call_conv(CallConv::SysV)
            .abi(KernelAbi::Extended)
            .vnni_c(true)
            .ldc(12)
            .build()
            .unwrap();
        assert_eq!(ScratchLayout::of(&d).c_bytes, 192);
        assert_eq!(ScratchLayout::of(&d).total(), 192);
    }

    #[test]
    fn frame_setup_and_teardown_balance() {
        let d = GemmDescriptor::builder(8, 4, 4, Datatype::F32)
            .call_conv(CallConv::SysV)
            .abi(KernelAbi::Extended)
            .build()
            .unwrap();
        let regs = GpRegMapping::for_descriptor(&d).unwrap();
        let mut code = GeneratedCode::new(ArchTier::Avx512Core);
        setup(&mut code, &regs, &d);
        teardown(&mut code);
        let instrs = code.instructions().unwrap();
        assert_eq!(instrs.first(), Some(&Instr::Push(GpReg::Rbp)));
        assert_eq!(instrs.last(), Some(&Instr::Pop(GpReg::Rbp)));
        assert!(instrs.contains(&Instr::AluStore { mem: var_mem(StackVar::Bias), src: regs.help0 }));
    }

    #[test]
    fn vnni_pass_closes_its_loops() {
        let d = GemmDescriptor::builder(5, 4, 4, Datatype::Bf16)
            .call_conv(CallConv::SysV)
            .vnni_c(true)
            .build()
            .unwrap();
        let regs = GpRegMapping::for_descriptor(&d).unwrap();
        let mut code = GeneratedCode::new(ArchTier::Avx512Core);
        let mut tracker = LoopLabelTracker::new();
        vnni_pass(&mut code, &mut tracker, &regs, &d, VnniDirection::Pack);
        tracker.finish(&mut code);
        assert!(code.is_ok());
        assert_eq!(tracker.depth(), 0);
    }
}

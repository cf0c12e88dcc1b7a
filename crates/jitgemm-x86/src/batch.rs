//! Batch-reduce loop around the K phase: `C += sum_r A_r * B_r`.
//!
//! Offset and stride modes keep the tile's base A and B on the stack for the
//! whole loop and rebuild the per-iteration pointers from them. Address mode
//! keeps the pointer arrays in the A and B roles and loads the iteration's
//! matrices on top of them, so the caller's arrays are only read.

use jitgemm_base::instr::{AluOp, GpReg, Mem};
use jitgemm_base::{BatchReduce, GemmDescriptor, GenError, InstructionEmitter};

use crate::loops::{LoopBound, LoopLabelTracker};
use crate::tile::{self, Tile};

const PTR: u8 = 8;

fn count_reg(code: &mut dyn InstructionEmitter, tile: &Tile) -> GpReg {
    match tile.regs.reduce_count {
        Some(r) => r,
        None => {
            code.set_error(GenError::IllegalAbiCombination("batch-reduce without a count register"));
            tile.regs.reduce_loop
        }
    }
}

/// Opens the reduce loop and points A and B at the iteration's matrices.
pub fn reduce_header(
    code: &mut dyn InstructionEmitter,
    tracker: &mut LoopLabelTracker,
    tile: &Tile,
    desc: &GemmDescriptor,
) {
    let regs = &tile.regs;
    let r = regs.reduce_loop;
    let count = count_reg(code, tile);
    let mode = desc.batch_reduce();
    if matches!(mode, BatchReduce::Offset | BatchReduce::Stride) {
        code.push(regs.b);
        code.push(regs.a);
    }
    tracker.open(code, r, 0, LoopBound::Reg(count));
    match mode {
        BatchReduce::None => {}
        BatchReduce::Address => {
            let size_in = desc.input().size() as i64;
            code.push(regs.a);
            code.push(regs.b);
            code.load_gp(Mem::indexed(regs.a, r, PTR, 0), regs.a);
            code.load_gp(Mem::indexed(regs.b, r, PTR, 0), regs.b);
            code.alu_reg(AluOp::Mov, regs.mloop, regs.help0);
            code.alu_imm(AluOp::Imul, regs.help0, size_in);
            code.alu_reg(AluOp::Add, regs.help0, regs.a);
            code.alu_reg(AluOp::Mov, regs.nloop, regs.help0);
            code.alu_imm(AluOp::Imul, regs.help0, desc.ldb() as i64 * size_in);
            code.alu_reg(AluOp::Add, regs.help0, regs.b);
            if let Some(a_pf) = regs.a_prefetch {
                code.push(a_pf);
                code.load_gp(Mem::indexed(a_pf, r, PTR, 0), a_pf);
                code.alu_reg(AluOp::Mov, regs.mloop, regs.help0);
                code.alu_imm(AluOp::Imul, regs.help0, size_in);
                code.alu_reg(AluOp::Add, regs.help0, a_pf);
                tile::prefetch_a(code, tile, a_pf);
            }
        }
        BatchReduce::Offset | BatchReduce::Stride => {
            code.pop(regs.a);
            code.pop(regs.b);
            code.push(regs.b);
            code.push(regs.a);
            if mode == BatchReduce::Offset {
                if let (Some(a_off), Some(b_off)) = (regs.a_offsets, regs.b_offsets) {
                    code.alu_mem(AluOp::Add, Mem::indexed(a_off, r, PTR, 0), regs.a);
                    code.alu_mem(AluOp::Add, Mem::indexed(b_off, r, PTR, 0), regs.b);
                } else {
                    code.set_error(GenError::IllegalAbiCombination("offset batch-reduce without offset arrays"));
                }
            } else {
                for (stride, dst) in [(desc.c1(), regs.a), (desc.c2(), regs.b)] {
                    code.alu_reg(AluOp::Mov, r, regs.help0);
                    code.alu_imm(AluOp::Imul, regs.help0, stride);
                    code.alu_reg(AluOp::Add, regs.help0, dst);
                }
            }
        }
    }
}

/// Closes the reduce loop and brings A and B back to the state a
/// single product would have left them in.
pub fn reduce_footer(
    code: &mut dyn InstructionEmitter,
    tracker: &mut LoopLabelTracker,
    tile: &Tile,
    desc: &GemmDescriptor,
) {
    let regs = &tile.regs;
    let r = regs.reduce_loop;
    let mode = desc.batch_reduce();
    if mode == BatchReduce::Address {
        if let Some(a_pf) = regs.a_prefetch {
            code.pop(a_pf);
        }
        code.pop(regs.b);
        code.pop(regs.a);
    }
    tracker.close(code, r, 1);
    match mode {
        BatchReduce::Offset => {
            if let (Some(a_off), Some(b_off)) = (regs.a_offsets, regs.b_offsets) {
                code.alu_mem(AluOp::Sub, Mem::indexed(a_off, r, PTR, -(PTR as i32)), regs.a);
                code.alu_mem(AluOp::Sub, Mem::indexed(b_off, r, PTR, -(PTR as i32)), regs.b);
            }
        }
        BatchReduce::Stride => {
            for (stride, dst) in [(desc.c1(), regs.a), (desc.c2(), regs.b)] {
                code.alu_reg(AluOp::Mov, r, regs.help0);
                code.alu_imm(AluOp::Sub, regs.help0, 1);
                code.alu_imm(AluOp::Imul, regs.help0, stride);
                code.alu_reg(AluOp::Sub, regs.help0, dst);
            }
        }
        BatchReduce::None | BatchReduce::Address => {}
    }
    if matches!(mode, BatchReduce::Offset | BatchReduce::Stride) {
        code.pop(regs.help0);
        code.pop(regs.help0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MicroKernelConfig;
    use crate::regs::GpRegMapping;
    use jitgemm_base::instr::Instr;
    use jitgemm_base::{ArchTier, CallConv, Datatype, GeneratedCode};

    fn run(desc: &GemmDescriptor) -> Vec<Instr> {
        let regs = GpRegMapping::for_descriptor(desc).unwrap();
        let cfg = MicroKernelConfig::fullvector(ArchTier::Avx512Core, desc, true);
        let t = Tile::new(cfg, regs, desc, 16, 2);
        let mut code = GeneratedCode::new(ArchTier::Avx512Core);
        let mut tracker = LoopLabelTracker::new();
        reduce_header(&mut code, &mut tracker, &t, desc);
        reduce_footer(&mut code, &mut tracker, &t, desc);
        tracker.finish(&mut code);
        assert!(code.is_ok(), "{:?}", code.error());
        code.instructions().unwrap()
    }

    fn stack_balance(instrs: &[Instr]) -> i64 {
        instrs
            .iter()
            .map(|i| match i {
                Instr::Push(_) => 1,
                Instr::Pop(_) => -1,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn every_mode_balances_the_stack() {
        let base = || GemmDescriptor::builder(16, 2, 4, Datatype::F32).call_conv(CallConv::SysV);
        for desc in [
            base().batch_reduce(BatchReduce::Address).build().unwrap(),
            base().batch_reduce(BatchReduce::Offset).build().unwrap(),
            base().strides(256, 512).build().unwrap(),
        ] {
            // the loop body is emitted once, so pushes inside it pair with pops inside it
            assert_eq!(stack_balance(&run(&desc)), 0, "{:?}", desc.batch_reduce());
        }
    }

    #[test]
    fn offset_footer_subtracts_the_last_offset() {
        let desc = GemmDescriptor::builder(16, 2, 4, Datatype::F32)
            .call_conv(CallConv::SysV)
            .batch_reduce(BatchReduce::Offset)
            .build()
            .unwrap();
        let regs = GpRegMapping::for_descriptor(&desc).unwrap();
        let instrs = run(&desc);
        assert_eq!(regs.a_offsets, Some(GpReg::R8));
        let last_a = Mem::indexed(GpReg::R8, regs.reduce_loop, 8, -8);
        assert!(instrs.contains(&Instr::AluLoad { op: AluOp::Sub, mem: last_a, dst: regs.a }));
    }
}

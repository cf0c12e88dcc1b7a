//! Counted loops with backward branches.
//!
//! Every loop is a do-while: the body runs at least once, so callers only
//! open a loop whose trip count is known to be positive.

use jitgemm_base::instr::{AluOp, Cond, GpReg};
use jitgemm_base::{GenError, InstructionEmitter};

/// Deepest nesting a single kernel may use.
pub const MAX_LOOP_DEPTH: usize = 512;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopBound {
    Imm(i64),
    Reg(GpReg),
}

#[derive(Copy, Clone, Debug)]
struct OpenLoop {
    label: usize,
    counter: GpReg,
    bound: LoopBound,
}

/// Stack of open loop labels for one generation call.
#[derive(Debug, Default)]
pub struct LoopLabelTracker {
    open: Vec<OpenLoop>,
}

impl LoopLabelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// `mov counter, start` followed by the loop label.
    pub fn open(&mut self, code: &mut dyn InstructionEmitter, counter: GpReg, start: i64, bound: LoopBound) {
        if self.open.len() >= MAX_LOOP_DEPTH {
            code.set_error(GenError::LoopNesting("loop nesting too deep"));
            return;
        }
        if self.open.iter().any(|l| l.counter == counter) {
            code.set_error(GenError::LoopNesting("counter already drives an enclosing loop"));
            return;
        }
        code.alu_imm(AluOp::Mov, counter, start);
        self.open.push(OpenLoop { label: code.position(), counter, bound });
    }

    /// `add counter, step; cmp counter, bound; jl label` for the innermost loop.
    pub fn close(&mut self, code: &mut dyn InstructionEmitter, counter: GpReg, step: i64) {
        let Some(l) = self.open.pop() else {
            code.set_error(GenError::LoopNesting("loop closed without a matching open"));
            return;
        };
        if l.counter != counter {
            code.set_error(GenError::LoopNesting("loops closed out of order"));
            return;
        }
        code.alu_imm(AluOp::Add, counter, step);
        match l.bound {
            LoopBound::Imm(bound) => code.alu_imm(AluOp::Cmp, counter, bound),
            LoopBound::Reg(bound) => code.alu_reg(AluOp::Cmp, bound, counter),
        }
        code.jump_back(Cond::Less, l.label);
    }

    /// Records an error if any loop is still open.
    pub fn finish(&self, code: &mut dyn InstructionEmitter) {
        if !self.open.is_empty() {
            code.set_error(GenError::LoopNesting("loops left open at the end of the kernel"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::instr::Instr;
    use jitgemm_base::{ArchTier, GeneratedCode};

    #[test]
    fn nested_loops_close_cleanly() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        let mut t = LoopLabelTracker::new();
        t.open(&mut code, GpReg::R11, 0, LoopBound::Imm(12));
        t.open(&mut code, GpReg::R10, 0, LoopBound::Imm(9));
        assert_eq!(t.depth(), 2);
        t.close(&mut code, GpReg::R10, 3);
        t.close(&mut code, GpReg::R11, 4);
        t.finish(&mut code);
        assert!(code.is_ok());
        let instrs = code.instructions().unwrap();
        assert_eq!(instrs.len(), 2 + 3 + 3);
        assert_eq!(instrs[2], Instr::AluImm { op: AluOp::Add, dst: GpReg::R10, imm: 3 });
        assert_eq!(instrs[3], Instr::AluImm { op: AluOp::Cmp, dst: GpReg::R10, imm: 9 });
        assert!(matches!(instrs[4], Instr::Jump { cond: Cond::Less, disp } if disp < 0));
        assert_eq!(instrs[6], Instr::AluImm { op: AluOp::Cmp, dst: GpReg::R11, imm: 12 });
        assert!(matches!(instrs[7], Instr::Jump { cond: Cond::Less, disp } if disp < 0));
    }

    #[test]
    fn misordered_close_is_an_error() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        let mut t = LoopLabelTracker::new();
        t.open(&mut code, GpReg::R11, 0, LoopBound::Imm(2));
        t.open(&mut code, GpReg::R10, 0, LoopBound::Imm(2));
        t.close(&mut code, GpReg::R11, 1);
        assert_eq!(code.error(), Some(&GenError::LoopNesting("loops closed out of order")));
    }

    #[test]
    fn underflow_and_leftovers_are_errors() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        LoopLabelTracker::new().close(&mut code, GpReg::R10, 1);
        assert!(matches!(code.error(), Some(GenError::LoopNesting(_))));

        let mut code = GeneratedCode::new(ArchTier::Avx2);
        let mut t = LoopLabelTracker::new();
        t.open(&mut code, GpReg::R13, 0, LoopBound::Reg(GpReg::Rcx));
        t.finish(&mut code);
        assert!(matches!(code.error(), Some(GenError::LoopNesting(_))));
    }

    #[test]
    fn counter_reuse_is_an_error() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        let mut t = LoopLabelTracker::new();
        t.open(&mut code, GpReg::R10, 0, LoopBound::Imm(2));
        t.open(&mut code, GpReg::R10, 0, LoopBound::Imm(2));
        assert!(matches!(code.error(), Some(GenError::LoopNesting(_))));
    }
}

use crate::error::GenError;
use crate::instr::{AluOp, Cond, GpReg, Instr, MaskReg, Mem, PrefetchHint, VReg, VecOp, JUMP_LEN};
use crate::{ArchTier, Datatype};

/// Capability the generators write through.
///
/// Every operation either appends an instruction or, once an error has been
/// recorded, does nothing. Implementors only provide the five required
/// methods; the opcode-level helpers are built on [`emit`](Self::emit).
pub trait InstructionEmitter {
    fn arch(&self) -> ArchTier;
    /// Current end of the code; loop labels are positions.
    fn position(&self) -> usize;
    fn error(&self) -> Option<&GenError>;
    /// Records `err` unless an earlier error is already recorded.
    fn set_error(&mut self, err: GenError);
    fn emit(&mut self, instr: Instr);

    fn is_ok(&self) -> bool {
        self.error().is_none()
    }

    fn alu_reg(&mut self, op: AluOp, src: GpReg, dst: GpReg) {
        self.emit(Instr::AluReg { op, src, dst });
    }

    fn alu_imm(&mut self, op: AluOp, dst: GpReg, imm: i64) {
        self.emit(Instr::AluImm { op, dst, imm });
    }

    fn alu_mem(&mut self, op: AluOp, mem: Mem, dst: GpReg) {
        self.emit(Instr::AluLoad { op, mem, dst });
    }

    fn load_gp(&mut self, mem: Mem, dst: GpReg) {
        self.emit(Instr::AluLoad { op: AluOp::Mov, mem, dst });
    }

    fn store_gp(&mut self, mem: Mem, src: GpReg) {
        self.emit(Instr::AluStore { mem, src });
    }

    fn push(&mut self, reg: GpReg) {
        self.emit(Instr::Push(reg));
    }

    fn pop(&mut self, reg: GpReg) {
        self.emit(Instr::Pop(reg));
    }

    /// Branch back to `target`, a position returned by [`position`](Self::position).
    fn jump_back(&mut self, cond: Cond, target: usize) {
        let end = self.position() + JUMP_LEN;
        match i32::try_from(end as i64 - target as i64) {
            Ok(dist) if target <= self.position() => self.emit(Instr::Jump { cond, disp: -dist }),
            _ => self.set_error(GenError::Encoding(format!("branch target {} not reachable from {}", target, end))),
        }
    }

    fn ret(&mut self) {
        self.emit(Instr::Ret);
    }

    fn vec_load(&mut self, elem: Datatype, lanes: usize, mem: Mem, dst: VReg, mask: Option<MaskReg>) {
        self.emit(Instr::VecLoad { elem, lanes: lanes as u8, mem, dst, mask });
    }

    fn vec_store(&mut self, elem: Datatype, lanes: usize, mem: Mem, src: VReg, mask: Option<MaskReg>) {
        self.emit(Instr::VecStore { elem, lanes: lanes as u8, mem, src, mask });
    }

    fn vec_broadcast(&mut self, elem: Datatype, lanes: usize, mem: Mem, dst: VReg) {
        self.emit(Instr::VecBroadcast { elem, lanes: lanes as u8, mem, dst });
    }

    fn vec_zero(&mut self, lanes: usize, dst: VReg) {
        self.emit(Instr::VecZero { lanes: lanes as u8, dst });
    }

    fn vec_move(&mut self, src: VReg, dst: VReg) {
        self.emit(Instr::VecMove { src, dst });
    }

    fn vec_fma(&mut self, dt: Datatype, lanes: usize, a: VReg, b: VReg, acc: VReg) {
        self.emit(Instr::VecFma { dt, lanes: lanes as u8, a, b, acc });
    }

    fn vec_fma_bcast(&mut self, dt: Datatype, elem: Datatype, lanes: usize, a: VReg, mem: Mem, acc: VReg) {
        self.emit(Instr::VecFmaBcast { dt, elem, lanes: lanes as u8, a, mem, acc });
    }

    fn vec_arith(&mut self, op: VecOp, dt: Datatype, lanes: usize, src: VReg, dst: VReg) {
        self.emit(Instr::VecArith { op, dt, lanes: lanes as u8, src, dst });
    }

    fn vec_convert(&mut self, from: Datatype, to: Datatype, lanes: usize, reg: VReg) {
        self.emit(Instr::VecConvert { from, to, lanes: lanes as u8, reg });
    }

    fn vec_store_lane(&mut self, elem: Datatype, lane: usize, mem: Mem, src: VReg) {
        self.emit(Instr::VecStoreLane { elem, lane: lane as u8, mem, src });
    }

    fn mask_move(&mut self, mask: MaskReg, src: GpReg) {
        self.emit(Instr::MaskMove { mask, src });
    }

    fn prefetch(&mut self, hint: PrefetchHint, mem: Mem) {
        self.emit(Instr::Prefetch { hint, mem });
    }
}

/// Code buffer produced by one generation call.
///
/// The buffer only grows. Once an error is recorded further emission is a
/// no-op and the buffer must not be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedCode {
    buffer: Vec<u8>,
    arch: ArchTier,
    error: Option<GenError>,
}

impl GeneratedCode {
    pub fn new(arch: ArchTier) -> Self {
        Self { buffer: Vec::new(), arch, error: None }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Decodes the whole buffer.
    pub fn instructions(&self) -> Result<Vec<Instr>, GenError> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < self.buffer.len() {
            let (instr, len) = Instr::decode(&self.buffer[pos..])
                .ok_or_else(|| GenError::Encoding(format!("undecodable record at {}", pos)))?;
            out.push(instr);
            pos += len;
        }
        Ok(out)
    }
}

impl InstructionEmitter for GeneratedCode {
    fn arch(&self) -> ArchTier {
        self.arch
    }

    fn position(&self) -> usize {
        self.buffer.len()
    }

    fn error(&self) -> Option<&GenError> {
        self.error.as_ref()
    }

    fn set_error(&mut self, err: GenError) {
        if self.error.is_none() {
            tracing::warn!("code generation failed: {}", err);
            self.error = Some(err);
        }
    }

    fn emit(&mut self, instr: Instr) {
        if self.error.is_some() {
            return;
        }
        match instr.validate() {
            Ok(()) => instr.encode(&mut self.buffer),
            Err(msg) => self.set_error(GenError::Encoding(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_sticky() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.push(GpReg::Rbx);
        let len = code.len();
        code.vec_zero(8, 40);
        assert!(matches!(code.error(), Some(GenError::Encoding(_))));
        code.pop(GpReg::Rbx);
        code.set_error(GenError::LoopNesting("late"));
        assert_eq!(code.len(), len);
        assert!(matches!(code.error(), Some(GenError::Encoding(_))));
    }

    #[test]
    fn backward_jump_lands_on_label() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.alu_imm(AluOp::Mov, GpReg::R10, 0);
        let label = code.position();
        code.alu_imm(AluOp::Add, GpReg::R10, 1);
        code.alu_imm(AluOp::Cmp, GpReg::R10, 4);
        let before = code.position();
        code.jump_back(Cond::Less, label);
        let jump_end = code.position();
        assert_eq!(jump_end - before, JUMP_LEN);
        match code.instructions().unwrap()[3] {
            Instr::Jump { cond: Cond::Less, disp } => assert_eq!(jump_end as i64 + disp as i64, label as i64),
            ref other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn forward_jump_is_rejected() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.jump_back(Cond::Always, 100);
        assert!(code.error().is_some());
        assert!(code.is_empty());
    }
}

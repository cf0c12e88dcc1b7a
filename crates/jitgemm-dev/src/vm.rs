//! Interpreter for the symbolic instruction set.
//!
//! Kernels run against real host memory: the arguments are host pointers and
//! every load and store dereferences them. Only the stack is private to the
//! machine, so stack discipline (balanced pushes, callee-saved registers,
//! the return address) is checked precisely.

use core::ptr;

use half::bf16;
use jitgemm_base::instr::{AluOp, Cond, GpReg, Instr, Mem, VecOp, MAX_LANES, MAX_VREGS};
use jitgemm_base::{CallConv, Datatype, GenError, GeneratedCode, InstructionEmitter};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    #[error("kernel was not generated: {0}")]
    Generation(#[from] GenError),

    #[error("undecodable instruction at byte {0}")]
    Decode(usize),

    #[error("branch at instruction {at} does not land on an instruction (byte {target})")]
    BadBranch { at: usize, target: i64 },

    #[error("conditional branch at instruction {0} without a preceding compare")]
    NoFlags(usize),

    #[error("execution ran past the end of the code")]
    FellOffEnd,

    #[error("stack pointer {0:#x} outside the machine stack")]
    StackOutOfBounds(u64),

    #[error("return to {0:#x} instead of the caller")]
    BadReturn(u64),

    #[error("callee-saved register {0} clobbered")]
    CalleeSavedClobbered(GpReg),

    #[error("stack pointer off by {0} bytes after return")]
    StackImbalance(i64),

    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),

    #[error("{0} arguments do not fit the {1:?} argument registers")]
    TooManyArguments(usize, CallConv),
}

const SYSV_ARGS: [GpReg; 6] = [GpReg::Rdi, GpReg::Rsi, GpReg::Rdx, GpReg::Rcx, GpReg::R8, GpReg::R9];
const WIN64_ARGS: [GpReg; 4] = [GpReg::Rcx, GpReg::Rdx, GpReg::R8, GpReg::R9];
const SYSV_CALLEE_SAVED: [GpReg; 6] = [GpReg::Rbx, GpReg::Rbp, GpReg::R12, GpReg::R13, GpReg::R14, GpReg::R15];
const WIN64_CALLEE_SAVED: [GpReg; 8] =
    [GpReg::Rbx, GpReg::Rbp, GpReg::Rdi, GpReg::Rsi, GpReg::R12, GpReg::R13, GpReg::R14, GpReg::R15];

const RETURN_SENTINEL: u64 = 0x7e7e_0000_c0de_0001;
const POISON: u64 = 0x5a5a_5a5a_0000_0000;

pub const DEFAULT_STACK_BYTES: usize = 1 << 20;
pub const DEFAULT_STEP_LIMIT: u64 = 1 << 28;

/// Decoded instruction stream with the byte offset of every record.
#[derive(Clone, Debug)]
pub struct Program {
    instrs: Vec<Instr>,
    starts: Vec<usize>,
    ends: Vec<usize>,
}

impl Program {
    pub fn decode(bytes: &[u8]) -> Result<Program, VmError> {
        let mut p = Program { instrs: Vec::new(), starts: Vec::new(), ends: Vec::new() };
        let mut pos = 0;
        while pos < bytes.len() {
            let (instr, len) = Instr::decode(&bytes[pos..]).ok_or(VmError::Decode(pos))?;
            p.instrs.push(instr);
            p.starts.push(pos);
            pos += len;
            p.ends.push(pos);
        }
        Ok(p)
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instrs
    }

    fn branch_target(&self, at: usize, disp: i32) -> Result<usize, VmError> {
        let target = self.ends[at] as i64 + disp as i64;
        usize::try_from(target)
            .ok()
            .and_then(|t| self.starts.binary_search(&t).ok())
            .ok_or(VmError::BadBranch { at, target })
    }
}

/// Register file plus a private stack.
pub struct Machine {
    gp: [u64; 16],
    vregs: [[f64; MAX_LANES as usize]; MAX_VREGS as usize],
    masks: [u64; 8],
    /// `(lhs, rhs)` of the last compare
    flags: Option<(i64, i64)>,
    stack: Vec<u64>,
    step_limit: u64,
    executed: u64,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::with_stack_bytes(DEFAULT_STACK_BYTES)
    }

    pub fn with_stack_bytes(bytes: usize) -> Self {
        Machine {
            gp: [0; 16],
            vregs: [[0.0; MAX_LANES as usize]; MAX_VREGS as usize],
            masks: [0; 8],
            flags: None,
            stack: vec![0; (bytes + 7) / 8],
            step_limit: DEFAULT_STEP_LIMIT,
            executed: 0,
        }
    }

    pub fn step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Instructions executed by the last call.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn gp(&self, reg: GpReg) -> u64 {
        self.gp[reg.index()]
    }

    /// Calls the kernel in `code` with integer arguments in the argument
    /// registers of `conv`.
    ///
    /// # Safety
    /// Every pointer argument must be valid for all accesses the kernel makes.
    pub unsafe fn call(&mut self, code: &GeneratedCode, conv: CallConv, args: &[u64]) -> Result<(), VmError> {
        if let Some(e) = code.error() {
            return Err(e.clone().into());
        }
        let program = Program::decode(code.as_bytes())?;
        self.run(&program, conv, args)
    }

    /// # Safety
    /// See [`call`](Self::call).
    pub unsafe fn run(&mut self, program: &Program, conv: CallConv, args: &[u64]) -> Result<(), VmError> {
        let (arg_regs, saved): (&[GpReg], &[GpReg]) = match conv {
            CallConv::SysV => (&SYSV_ARGS, &SYSV_CALLEE_SAVED),
            CallConv::Win64 => (&WIN64_ARGS, &WIN64_CALLEE_SAVED),
        };
        if args.len() > arg_regs.len() {
            return Err(VmError::TooManyArguments(args.len(), conv));
        }
        for (i, r) in self.gp.iter_mut().enumerate() {
            *r = POISON | i as u64;
        }
        for (&reg, &v) in arg_regs.iter().zip(args) {
            self.gp[reg.index()] = v;
        }
        let initial = self.gp;
        self.flags = None;
        self.masks = [0; 8];
        self.executed = 0;

        let (base, top) = self.stack_bounds();
        self.gp[GpReg::Rsp.index()] = top;
        self.push(RETURN_SENTINEL)?;
        let entry_rsp = self.gp[GpReg::Rsp.index()];

        let mut pc = 0;
        loop {
            if self.executed >= self.step_limit {
                return Err(VmError::StepLimit(self.step_limit));
            }
            self.executed += 1;
            let instr = *program.instrs.get(pc).ok_or(VmError::FellOffEnd)?;
            let mut next = pc + 1;
            match instr {
                Instr::Jump { cond, disp } => {
                    let taken = match cond {
                        Cond::Always => true,
                        Cond::Less => {
                            let (l, r) = self.flags.ok_or(VmError::NoFlags(pc))?;
                            l < r
                        }
                        Cond::NotEqual => {
                            let (l, r) = self.flags.ok_or(VmError::NoFlags(pc))?;
                            l != r
                        }
                    };
                    if taken {
                        next = program.branch_target(pc, disp)?;
                    }
                }
                Instr::Ret => {
                    let ret = self.pop()?;
                    if ret != RETURN_SENTINEL {
                        return Err(VmError::BadReturn(ret));
                    }
                    break;
                }
                other => self.exec(other, base, top)?,
            }
            pc = next;
        }

        for &r in saved {
            if self.gp[r.index()] != initial[r.index()] {
                return Err(VmError::CalleeSavedClobbered(r));
            }
        }
        let rsp = self.gp[GpReg::Rsp.index()];
        let expected = entry_rsp + 8;
        if rsp != expected {
            return Err(VmError::StackImbalance(rsp as i64 - expected as i64));
        }
        Ok(())
    }

    fn stack_bounds(&mut self) -> (u64, u64) {
        let base = self.stack.as_mut_ptr() as u64;
        let top = (base + 8 * self.stack.len() as u64) & !63;
        (base, top)
    }

    fn check_rsp(&self, base: u64, top: u64) -> Result<(), VmError> {
        let rsp = self.gp[GpReg::Rsp.index()];
        if rsp < base || rsp > top {
            return Err(VmError::StackOutOfBounds(rsp));
        }
        Ok(())
    }

    fn push(&mut self, v: u64) -> Result<(), VmError> {
        let (base, top) = self.stack_bounds();
        let rsp = self.gp[GpReg::Rsp.index()].wrapping_sub(8);
        if rsp < base || rsp + 8 > top {
            return Err(VmError::StackOutOfBounds(rsp));
        }
        self.gp[GpReg::Rsp.index()] = rsp;
        unsafe { ptr::write_unaligned(rsp as *mut u64, v) };
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, VmError> {
        let (base, top) = self.stack_bounds();
        let rsp = self.gp[GpReg::Rsp.index()];
        if rsp < base || rsp + 8 > top {
            return Err(VmError::StackOutOfBounds(rsp));
        }
        let v = unsafe { ptr::read_unaligned(rsp as *const u64) };
        self.gp[GpReg::Rsp.index()] = rsp + 8;
        Ok(v)
    }

    fn address(&self, mem: &Mem) -> u64 {
        let index = mem.index.map_or(0, |r| self.gp[r.index()].wrapping_mul(mem.scale as u64));
        self.gp[mem.base.index()].wrapping_add(index).wrapping_add(mem.disp as i64 as u64)
    }

    fn alu(&mut self, op: AluOp, dst: GpReg, src: u64) {
        let d = self.gp[dst.index()];
        let v = match op {
            AluOp::Mov => src,
            AluOp::Add => d.wrapping_add(src),
            AluOp::Sub => d.wrapping_sub(src),
            AluOp::Imul => (d as i64).wrapping_mul(src as i64) as u64,
            AluOp::And => d & src,
            AluOp::Cmp => {
                self.flags = Some((d as i64, src as i64));
                return;
            }
        };
        self.gp[dst.index()] = v;
    }

    fn lane_enabled(&self, mask: Option<u8>, lane: usize) -> bool {
        mask.map_or(true, |k| self.masks[k as usize] >> lane & 1 == 1)
    }

    unsafe fn exec(&mut self, instr: Instr, base: u64, top: u64) -> Result<(), VmError> {
        match instr {
            Instr::AluReg { op, src, dst } => {
                self.alu(op, dst, self.gp[src.index()]);
                if dst == GpReg::Rsp {
                    self.check_rsp(base, top)?;
                }
            }
            Instr::AluImm { op, dst, imm } => {
                self.alu(op, dst, imm as u64);
                if dst == GpReg::Rsp {
                    self.check_rsp(base, top)?;
                }
            }
            Instr::AluLoad { op, mem, dst } => {
                let v = ptr::read_unaligned(self.address(&mem) as *const u64);
                self.alu(op, dst, v);
            }
            Instr::AluStore { mem, src } => {
                ptr::write_unaligned(self.address(&mem) as *mut u64, self.gp[src.index()]);
            }
            Instr::Push(r) => self.push(self.gp[r.index()])?,
            Instr::Pop(r) => {
                let v = self.pop()?;
                self.gp[r.index()] = v;
            }
            Instr::VecLoad { elem, lanes, mem, dst, mask } => {
                let addr = self.address(&mem);
                let mut v = [0.0; MAX_LANES as usize];
                for (i, lane) in v.iter_mut().enumerate().take(lanes as usize) {
                    if self.lane_enabled(mask, i) {
                        *lane = read_elem(elem, addr + (i * elem.size()) as u64);
                    }
                }
                self.vregs[dst as usize] = v;
            }
            Instr::VecStore { elem, lanes, mem, src, mask } => {
                let addr = self.address(&mem);
                for i in 0..lanes as usize {
                    if self.lane_enabled(mask, i) {
                        write_elem(elem, addr + (i * elem.size()) as u64, self.vregs[src as usize][i]);
                    }
                }
            }
            Instr::VecBroadcast { elem, lanes, mem, dst } => {
                let x = read_elem(elem, self.address(&mem));
                let mut v = [0.0; MAX_LANES as usize];
                v[..lanes as usize].iter_mut().for_each(|l| *l = x);
                self.vregs[dst as usize] = v;
            }
            Instr::VecZero { dst, .. } => self.vregs[dst as usize] = [0.0; MAX_LANES as usize],
            Instr::VecMove { src, dst } => self.vregs[dst as usize] = self.vregs[src as usize],
            Instr::VecFma { dt, lanes, a, b, acc } => {
                for i in 0..lanes as usize {
                    let p = self.vregs[a as usize][i] * self.vregs[b as usize][i];
                    let r = &mut self.vregs[acc as usize][i];
                    *r = round_to(dt, *r + p);
                }
            }
            Instr::VecFmaBcast { dt, elem, lanes, a, mem, acc } => {
                let x = read_elem(elem, self.address(&mem));
                for i in 0..lanes as usize {
                    let p = self.vregs[a as usize][i] * x;
                    let r = &mut self.vregs[acc as usize][i];
                    *r = round_to(dt, *r + p);
                }
            }
            Instr::VecArith { op, dt, lanes, src, dst } => {
                for i in 0..lanes as usize {
                    let s = self.vregs[src as usize][i];
                    let d = &mut self.vregs[dst as usize][i];
                    *d = round_to(
                        dt,
                        match op {
                            VecOp::Add => *d + s,
                            VecOp::Mul => *d * s,
                            VecOp::Max => d.max(s),
                        },
                    );
                }
            }
            Instr::VecConvert { to, lanes, reg, .. } => {
                for l in self.vregs[reg as usize][..lanes as usize].iter_mut() {
                    *l = round_to(to, *l);
                }
            }
            Instr::VecStoreLane { elem, lane, mem, src } => {
                write_elem(elem, self.address(&mem), self.vregs[src as usize][lane as usize]);
            }
            Instr::MaskMove { mask, src } => self.masks[mask as usize] = self.gp[src.index()],
            Instr::Prefetch { .. } => {}
            Instr::Jump { .. } | Instr::Ret => unreachable!("control flow is handled by the run loop"),
        }
        Ok(())
    }
}

/// Value of `v` in the arithmetic domain of `dt`.
pub fn round_to(dt: Datatype, v: f64) -> f64 {
    match dt {
        Datatype::F64 => v,
        Datatype::F32 => v as f32 as f64,
        Datatype::Bf16 => bf16::from_f64(v).to_f64(),
        Datatype::I32 => (v as i64) as i32 as f64,
        Datatype::I16 => (v as i64) as i16 as f64,
        Datatype::I8 => (v as i64) as i8 as f64,
    }
}

/// Round half to even, then saturate to the `i8` range.
pub fn quantize_i8(v: f64) -> i8 {
    let r = v.round();
    let r = if (v - v.trunc()).abs() == 0.5 { 2.0 * (v / 2.0).round() } else { r };
    r.clamp(i8::MIN as f64, i8::MAX as f64) as i8
}

unsafe fn read_elem(dt: Datatype, addr: u64) -> f64 {
    match dt {
        Datatype::F64 => ptr::read_unaligned(addr as *const f64),
        Datatype::F32 => ptr::read_unaligned(addr as *const f32) as f64,
        Datatype::Bf16 => bf16::from_bits(ptr::read_unaligned(addr as *const u16)).to_f64(),
        Datatype::I32 => ptr::read_unaligned(addr as *const i32) as f64,
        Datatype::I16 => ptr::read_unaligned(addr as *const i16) as f64,
        Datatype::I8 => ptr::read_unaligned(addr as *const i8) as f64,
    }
}

unsafe fn write_elem(dt: Datatype, addr: u64, v: f64) {
    match dt {
        Datatype::F64 => ptr::write_unaligned(addr as *mut f64, v),
        Datatype::F32 => ptr::write_unaligned(addr as *mut f32, v as f32),
        Datatype::Bf16 => ptr::write_unaligned(addr as *mut u16, bf16::from_f64(v).to_bits()),
        Datatype::I32 => ptr::write_unaligned(addr as *mut i32, (v as i64) as i32),
        Datatype::I16 => ptr::write_unaligned(addr as *mut i16, (v as i64) as i16),
        Datatype::I8 => ptr::write_unaligned(addr as *mut i8, quantize_i8(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::instr::JUMP_LEN;
    use jitgemm_base::ArchTier;

    fn counting_loop(code: &mut GeneratedCode, n: i64) {
        code.push(GpReg::R12);
        code.alu_imm(AluOp::Mov, GpReg::R12, 0);
        code.alu_imm(AluOp::Mov, GpReg::Rax, 0);
        let label = code.position();
        code.alu_imm(AluOp::Add, GpReg::Rax, 3);
        code.alu_imm(AluOp::Add, GpReg::R12, 1);
        code.alu_imm(AluOp::Cmp, GpReg::R12, n);
        code.jump_back(Cond::Less, label);
        code.pop(GpReg::R12);
    }

    #[test]
    fn loop_runs_and_returns() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        counting_loop(&mut code, 5);
        code.ret();
        let mut vm = Machine::new();
        unsafe { vm.call(&code, CallConv::SysV, &[]) }.unwrap();
        assert_eq!(vm.gp(GpReg::Rax), 15);
    }

    #[test]
    fn vector_store_through_a_mask() {
        let mut out = [0f32; 8];
        let src = [1f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let mut code = GeneratedCode::new(ArchTier::Avx512Core);
        code.alu_imm(AluOp::Mov, GpReg::Rax, 0b101);
        code.mask_move(1, GpReg::Rax);
        code.vec_load(Datatype::F32, 8, Mem::base(GpReg::Rdi), 3, Some(1));
        code.vec_store(Datatype::F32, 8, Mem::base(GpReg::Rsi), 3, None);
        code.ret();
        let args = [src.as_ptr() as u64, out.as_mut_ptr() as u64];
        unsafe { Machine::new().call(&code, CallConv::SysV, &args) }.unwrap();
        assert_eq!(out, [1.0, 0.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn clobbered_callee_saved_register_is_reported() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.alu_imm(AluOp::Mov, GpReg::Rbx, 1);
        code.ret();
        let err = unsafe { Machine::new().call(&code, CallConv::SysV, &[]) }.unwrap_err();
        assert_eq!(err, VmError::CalleeSavedClobbered(GpReg::Rbx));
        // rdi is callee-saved on win64 only
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.alu_imm(AluOp::Mov, GpReg::Rdi, 1);
        code.ret();
        assert!(unsafe { Machine::new().call(&code, CallConv::SysV, &[]) }.is_ok());
        let err = unsafe { Machine::new().call(&code, CallConv::Win64, &[]) }.unwrap_err();
        assert_eq!(err, VmError::CalleeSavedClobbered(GpReg::Rdi));
    }

    #[test]
    fn unbalanced_stack_is_reported() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.push(GpReg::Rax);
        code.ret();
        let err = unsafe { Machine::new().call(&code, CallConv::SysV, &[]) }.unwrap_err();
        assert!(matches!(err, VmError::BadReturn(_)));
    }

    #[test]
    fn runaway_loop_hits_the_step_limit() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.jump_back(Cond::Always, 0);
        assert_eq!(code.len(), JUMP_LEN);
        let err = unsafe { Machine::new().step_limit(1000).call(&code, CallConv::SysV, &[]) }.unwrap_err();
        assert_eq!(err, VmError::StepLimit(1000));
    }

    #[test]
    fn failed_code_is_not_run() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        code.set_error(GenError::LoopNesting("x"));
        let err = unsafe { Machine::new().call(&code, CallConv::SysV, &[]) }.unwrap_err();
        assert_eq!(err, VmError::Generation(GenError::LoopNesting("x")));
    }

    #[test]
    fn datatype_domains() {
        assert_eq!(round_to(Datatype::I32, (i32::MAX as f64) + 1.0), i32::MIN as f64);
        assert_eq!(round_to(Datatype::F32, 0.1), 0.1f32 as f64);
        assert_eq!(quantize_i8(2.5), 2);
        assert_eq!(quantize_i8(3.5), 4);
        assert_eq!(quantize_i8(-2.5), -2);
        assert_eq!(quantize_i8(300.0), 127);
        assert_eq!(quantize_i8(-300.0), -128);
    }
}

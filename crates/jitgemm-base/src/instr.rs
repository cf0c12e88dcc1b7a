//! Symbolic instruction set written by [`GeneratedCode`](crate::GeneratedCode).
//!
//! Each instruction is one tagged record, little-endian, position independent:
//! branches carry a displacement relative to the end of the branch record.

use core::fmt;

use crate::Datatype;

/// Vector register index.
pub type VReg = u8;
/// Mask register index, `k1..k7`. `k0` is never used as a write mask.
pub type MaskReg = u8;

pub const MAX_VREGS: u8 = 32;
pub const MAX_LANES: u8 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GpReg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl GpReg {
    pub const ALL: [GpReg; 16] = [
        GpReg::Rax,
        GpReg::Rcx,
        GpReg::Rdx,
        GpReg::Rbx,
        GpReg::Rsp,
        GpReg::Rbp,
        GpReg::Rsi,
        GpReg::Rdi,
        GpReg::R8,
        GpReg::R9,
        GpReg::R10,
        GpReg::R11,
        GpReg::R12,
        GpReg::R13,
        GpReg::R14,
        GpReg::R15,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: u8) -> Option<GpReg> {
        GpReg::ALL.get(idx as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            GpReg::Rax => "rax",
            GpReg::Rcx => "rcx",
            GpReg::Rdx => "rdx",
            GpReg::Rbx => "rbx",
            GpReg::Rsp => "rsp",
            GpReg::Rbp => "rbp",
            GpReg::Rsi => "rsi",
            GpReg::Rdi => "rdi",
            GpReg::R8 => "r8",
            GpReg::R9 => "r9",
            GpReg::R10 => "r10",
            GpReg::R11 => "r11",
            GpReg::R12 => "r12",
            GpReg::R13 => "r13",
            GpReg::R14 => "r14",
            GpReg::R15 => "r15",
        }
    }
}

impl fmt::Display for GpReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `[base + index*scale + disp]`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mem {
    pub base: GpReg,
    pub index: Option<GpReg>,
    pub scale: u8,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: GpReg) -> Mem {
        Mem { base, index: None, scale: 1, disp: 0 }
    }

    pub fn disp(base: GpReg, disp: i32) -> Mem {
        Mem { base, index: None, scale: 1, disp }
    }

    pub fn indexed(base: GpReg, index: GpReg, scale: u8, disp: i32) -> Mem {
        Mem { base, index: Some(index), scale, disp }
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.base)?;
        if let Some(index) = self.index {
            write!(f, " + {}*{}", index, self.scale)?;
        }
        if self.disp != 0 {
            write!(f, " {:+}", self.disp)?;
        }
        f.write_str("]")
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluOp {
    Mov,
    Add,
    Sub,
    Imul,
    And,
    Cmp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cond {
    Always,
    Less,
    NotEqual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VecOp {
    Add,
    Mul,
    Max,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrefetchHint {
    T0,
    T1,
    T2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Instr {
    AluReg { op: AluOp, src: GpReg, dst: GpReg },
    AluImm { op: AluOp, dst: GpReg, imm: i64 },
    /// `dst op= [mem]`
    AluLoad { op: AluOp, mem: Mem, dst: GpReg },
    /// `[mem] = src`
    AluStore { mem: Mem, src: GpReg },
    Push(GpReg),
    Pop(GpReg),
    Jump { cond: Cond, disp: i32 },
    Ret,
    /// `lanes` elements of `elem` converted to the register domain
    VecLoad { elem: Datatype, lanes: u8, mem: Mem, dst: VReg, mask: Option<MaskReg> },
    VecStore { elem: Datatype, lanes: u8, mem: Mem, src: VReg, mask: Option<MaskReg> },
    VecBroadcast { elem: Datatype, lanes: u8, mem: Mem, dst: VReg },
    VecZero { lanes: u8, dst: VReg },
    VecMove { src: VReg, dst: VReg },
    /// `acc += a * b`
    VecFma { dt: Datatype, lanes: u8, a: VReg, b: VReg, acc: VReg },
    /// `acc += a * broadcast([mem])`
    VecFmaBcast { dt: Datatype, elem: Datatype, lanes: u8, a: VReg, mem: Mem, acc: VReg },
    /// `dst = dst op src`
    VecArith { op: VecOp, dt: Datatype, lanes: u8, src: VReg, dst: VReg },
    VecConvert { from: Datatype, to: Datatype, lanes: u8, reg: VReg },
    VecStoreLane { elem: Datatype, lane: u8, mem: Mem, src: VReg },
    /// mask bits from the low bits of a general register
    MaskMove { mask: MaskReg, src: GpReg },
    Prefetch { hint: PrefetchHint, mem: Mem },
}

/// Encoded size of [`Instr::Jump`].
pub const JUMP_LEN: usize = 6;

mod tag {
    pub const ALU_REG: u8 = 0x01;
    pub const ALU_IMM: u8 = 0x02;
    pub const ALU_LOAD: u8 = 0x03;
    pub const ALU_STORE: u8 = 0x04;
    pub const PUSH: u8 = 0x05;
    pub const POP: u8 = 0x06;
    pub const JUMP: u8 = 0x07;
    pub const RET: u8 = 0x08;
    pub const VEC_LOAD: u8 = 0x10;
    pub const VEC_STORE: u8 = 0x11;
    pub const VEC_BCAST: u8 = 0x12;
    pub const VEC_ZERO: u8 = 0x13;
    pub const VEC_FMA: u8 = 0x14;
    pub const VEC_FMA_BCAST: u8 = 0x15;
    pub const VEC_ARITH: u8 = 0x16;
    pub const VEC_CONVERT: u8 = 0x17;
    pub const VEC_STORE_LANE: u8 = 0x18;
    pub const VEC_MOVE: u8 = 0x19;
    pub const MASK_MOVE: u8 = 0x20;
    pub const PREFETCH: u8 = 0x21;
}

const NO_REG: u8 = 0xff;

impl AluOp {
    fn code(self) -> u8 {
        self as u8
    }
    fn from_code(c: u8) -> Option<AluOp> {
        [AluOp::Mov, AluOp::Add, AluOp::Sub, AluOp::Imul, AluOp::And, AluOp::Cmp].get(c as usize).copied()
    }
}

impl Cond {
    fn from_code(c: u8) -> Option<Cond> {
        [Cond::Always, Cond::Less, Cond::NotEqual].get(c as usize).copied()
    }
}

impl VecOp {
    fn from_code(c: u8) -> Option<VecOp> {
        [VecOp::Add, VecOp::Mul, VecOp::Max].get(c as usize).copied()
    }
}

impl PrefetchHint {
    fn from_code(c: u8) -> Option<PrefetchHint> {
        [PrefetchHint::T0, PrefetchHint::T1, PrefetchHint::T2].get(c as usize).copied()
    }
}

fn put_mem(out: &mut Vec<u8>, mem: &Mem) {
    out.push(mem.base as u8);
    out.push(mem.index.map_or(NO_REG, |r| r as u8));
    out.push(mem.scale);
    out.extend_from_slice(&mem.disp.to_le_bytes());
}

fn put_mask(out: &mut Vec<u8>, mask: Option<MaskReg>) {
    out.push(mask.unwrap_or(0));
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }
    fn i32(&mut self) -> Option<i32> {
        let s = self.bytes.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }
    fn i64(&mut self) -> Option<i64> {
        let s = self.bytes.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Some(i64::from_le_bytes(b))
    }
    fn gp(&mut self) -> Option<GpReg> {
        GpReg::from_index(self.u8()?)
    }
    fn dt(&mut self) -> Option<Datatype> {
        Datatype::from_code(self.u8()?)
    }
    fn mask(&mut self) -> Option<Option<MaskReg>> {
        let m = self.u8()?;
        Some(if m == 0 { None } else { Some(m) })
    }
    fn mem(&mut self) -> Option<Mem> {
        let base = self.gp()?;
        let index = match self.u8()? {
            NO_REG => None,
            r => Some(GpReg::from_index(r)?),
        };
        let scale = self.u8()?;
        let disp = self.i32()?;
        Some(Mem { base, index, scale, disp })
    }
}

impl Instr {
    /// Operand checks the encoder enforces.
    pub fn validate(&self) -> Result<(), String> {
        let check_vreg = |r: VReg| if r < MAX_VREGS { Ok(()) } else { Err(format!("vector register {} out of range", r)) };
        let check_lanes = |l: u8| {
            if (1..=MAX_LANES).contains(&l) {
                Ok(())
            } else {
                Err(format!("{} lanes out of range", l))
            }
        };
        let check_mem = |m: &Mem| {
            if matches!(m.scale, 1 | 2 | 4 | 8) {
                Ok(())
            } else {
                Err(format!("scale {} in {}", m.scale, m))
            }
        };
        let check_mask = |m: Option<MaskReg>| match m {
            Some(k) if !(1..8).contains(&k) => Err(format!("mask register k{} not usable", k)),
            _ => Ok(()),
        };
        match *self {
            Instr::AluImm { op, imm, .. } => {
                if op != AluOp::Mov && i32::try_from(imm).is_err() {
                    return Err(format!("immediate {} does not fit 32 bits", imm));
                }
                Ok(())
            }
            Instr::AluLoad { op, ref mem, .. } => {
                if !matches!(op, AluOp::Mov | AluOp::Add | AluOp::Sub) {
                    return Err(format!("{:?} has no memory form", op));
                }
                check_mem(mem)
            }
            Instr::AluStore { ref mem, .. } | Instr::Prefetch { ref mem, .. } => check_mem(mem),
            Instr::VecLoad { lanes: l, mem: ref m, dst, mask: k, .. } => {
                check_lanes(l)?;
                check_vreg(dst)?;
                check_mask(k)?;
                check_mem(m)
            }
            Instr::VecStore { lanes: l, mem: ref m, src, mask: k, .. } => {
                check_lanes(l)?;
                check_vreg(src)?;
                check_mask(k)?;
                check_mem(m)
            }
            Instr::VecBroadcast { lanes: l, mem: ref m, dst, .. } => {
                check_lanes(l)?;
                check_vreg(dst)?;
                check_mem(m)
            }
            Instr::VecZero { lanes: l, dst } => {
                check_lanes(l)?;
                check_vreg(dst)
            }
            Instr::VecMove { src, dst } => {
                check_vreg(src)?;
                check_vreg(dst)
            }
            Instr::VecFma { lanes: l, a, b, acc, .. } => {
                check_lanes(l)?;
                check_vreg(a)?;
                check_vreg(b)?;
                check_vreg(acc)
            }
            Instr::VecFmaBcast { lanes: l, a, mem: ref m, acc, .. } => {
                check_lanes(l)?;
                check_vreg(a)?;
                check_vreg(acc)?;
                check_mem(m)
            }
            Instr::VecArith { lanes: l, src, dst, .. } => {
                check_lanes(l)?;
                check_vreg(src)?;
                check_vreg(dst)
            }
            Instr::VecConvert { lanes: l, reg, .. } => {
                check_lanes(l)?;
                check_vreg(reg)
            }
            Instr::VecStoreLane { lane, mem: ref m, src, .. } => {
                if lane >= MAX_LANES {
                    return Err(format!("lane {} out of range", lane));
                }
                check_vreg(src)?;
                check_mem(m)
            }
            Instr::MaskMove { mask: k, .. } => check_mask(Some(k)),
            Instr::AluReg { .. } | Instr::Push(_) | Instr::Pop(_) | Instr::Jump { .. } | Instr::Ret => Ok(()),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Instr::AluReg { op, src, dst } => {
                out.extend_from_slice(&[tag::ALU_REG, op.code(), src as u8, dst as u8]);
            }
            Instr::AluImm { op, dst, imm } => {
                out.extend_from_slice(&[tag::ALU_IMM, op.code(), dst as u8]);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Instr::AluLoad { op, ref mem, dst } => {
                out.extend_from_slice(&[tag::ALU_LOAD, op.code(), dst as u8]);
                put_mem(out, mem);
            }
            Instr::AluStore { ref mem, src } => {
                out.extend_from_slice(&[tag::ALU_STORE, src as u8]);
                put_mem(out, mem);
            }
            Instr::Push(r) => out.extend_from_slice(&[tag::PUSH, r as u8]),
            Instr::Pop(r) => out.extend_from_slice(&[tag::POP, r as u8]),
            Instr::Jump { cond, disp } => {
                out.extend_from_slice(&[tag::JUMP, cond as u8]);
                out.extend_from_slice(&disp.to_le_bytes());
            }
            Instr::Ret => out.push(tag::RET),
            Instr::VecLoad { elem, lanes, ref mem, dst, mask } => {
                out.extend_from_slice(&[tag::VEC_LOAD, elem.code(), lanes, dst]);
                put_mask(out, mask);
                put_mem(out, mem);
            }
            Instr::VecStore { elem, lanes, ref mem, src, mask } => {
                out.extend_from_slice(&[tag::VEC_STORE, elem.code(), lanes, src]);
                put_mask(out, mask);
                put_mem(out, mem);
            }
            Instr::VecBroadcast { elem, lanes, ref mem, dst } => {
                out.extend_from_slice(&[tag::VEC_BCAST, elem.code(), lanes, dst]);
                put_mem(out, mem);
            }
            Instr::VecZero { lanes, dst } => out.extend_from_slice(&[tag::VEC_ZERO, lanes, dst]),
            Instr::VecMove { src, dst } => out.extend_from_slice(&[tag::VEC_MOVE, src, dst]),
            Instr::VecFma { dt, lanes, a, b, acc } => {
                out.extend_from_slice(&[tag::VEC_FMA, dt.code(), lanes, a, b, acc]);
            }
            Instr::VecFmaBcast { dt, elem, lanes, a, ref mem, acc } => {
                out.extend_from_slice(&[tag::VEC_FMA_BCAST, dt.code(), elem.code(), lanes, a, acc]);
                put_mem(out, mem);
            }
            Instr::VecArith { op, dt, lanes, src, dst } => {
                out.extend_from_slice(&[tag::VEC_ARITH, op as u8, dt.code(), lanes, src, dst]);
            }
            Instr::VecConvert { from, to, lanes, reg } => {
                out.extend_from_slice(&[tag::VEC_CONVERT, from.code(), to.code(), lanes, reg]);
            }
            Instr::VecStoreLane { elem, lane, ref mem, src } => {
                out.extend_from_slice(&[tag::VEC_STORE_LANE, elem.code(), lane, src]);
                put_mem(out, mem);
            }
            Instr::MaskMove { mask, src } => out.extend_from_slice(&[tag::MASK_MOVE, mask, src as u8]),
            Instr::Prefetch { hint, ref mem } => {
                out.extend_from_slice(&[tag::PREFETCH, hint as u8]);
                put_mem(out, mem);
            }
        }
    }

    /// Decodes one instruction at the start of `bytes`, returning it with its encoded length.
    pub fn decode(bytes: &[u8]) -> Option<(Instr, usize)> {
        let mut r = Reader { bytes, pos: 0 };
        let instr = match r.u8()? {
            tag::ALU_REG => {
                let op = AluOp::from_code(r.u8()?)?;
                let src = r.gp()?;
                let dst = r.gp()?;
                Instr::AluReg { op, src, dst }
            }
            tag::ALU_IMM => {
                let op = AluOp::from_code(r.u8()?)?;
                let dst = r.gp()?;
                let imm = r.i64()?;
                Instr::AluImm { op, dst, imm }
            }
            tag::ALU_LOAD => {
                let op = AluOp::from_code(r.u8()?)?;
                let dst = r.gp()?;
                let mem = r.mem()?;
                Instr::AluLoad { op, mem, dst }
            }
            tag::ALU_STORE => {
                let src = r.gp()?;
                let mem = r.mem()?;
                Instr::AluStore { mem, src }
            }
            tag::PUSH => Instr::Push(r.gp()?),
            tag::POP => Instr::Pop(r.gp()?),
            tag::JUMP => {
                let cond = Cond::from_code(r.u8()?)?;
                let disp = r.i32()?;
                Instr::Jump { cond, disp }
            }
            tag::RET => Instr::Ret,
            tag::VEC_LOAD => {
                let elem = r.dt()?;
                let lanes = r.u8()?;
                let dst = r.u8()?;
                let mask = r.mask()?;
                let mem = r.mem()?;
                Instr::VecLoad { elem, lanes, mem, dst, mask }
            }
            tag::VEC_STORE => {
                let elem = r.dt()?;
                let lanes = r.u8()?;
                let src = r.u8()?;
                let mask = r.mask()?;
                let mem = r.mem()?;
                Instr::VecStore { elem, lanes, mem, src, mask }
            }
            tag::VEC_BCAST => {
                let elem = r.dt()?;
                let lanes = r.u8()?;
                let dst = r.u8()?;
                let mem = r.mem()?;
                Instr::VecBroadcast { elem, lanes, mem, dst }
            }
            tag::VEC_ZERO => {
                let lanes = r.u8()?;
                let dst = r.u8()?;
                Instr::VecZero { lanes, dst }
            }
            tag::VEC_MOVE => {
                let src = r.u8()?;
                let dst = r.u8()?;
                Instr::VecMove { src, dst }
            }
            tag::VEC_FMA => {
                let dt = r.dt()?;
                let lanes = r.u8()?;
                let a = r.u8()?;
                let b = r.u8()?;
                let acc = r.u8()?;
                Instr::VecFma { dt, lanes, a, b, acc }
            }
            tag::VEC_FMA_BCAST => {
                let dt = r.dt()?;
                let elem = r.dt()?;
                let lanes = r.u8()?;
                let a = r.u8()?;
                let acc = r.u8()?;
                let mem = r.mem()?;
                Instr::VecFmaBcast { dt, elem, lanes, a, mem, acc }
            }
            tag::VEC_ARITH => {
                let op = VecOp::from_code(r.u8()?)?;
                let dt = r.dt()?;
                let lanes = r.u8()?;
                let src = r.u8()?;
                let dst = r.u8()?;
                Instr::VecArith { op, dt, lanes, src, dst }
            }
            tag::VEC_CONVERT => {
                let from = r.dt()?;
                let to = r.dt()?;
                let lanes = r.u8()?;
                let reg = r.u8()?;
                Instr::VecConvert { from, to, lanes, reg }
            }
            tag::VEC_STORE_LANE => {
                let elem = r.dt()?;
                let lane = r.u8()?;
                let src = r.u8()?;
                let mem = r.mem()?;
                Instr::VecStoreLane { elem, lane, mem, src }
            }
            tag::MASK_MOVE => {
                let mask = r.u8()?;
                let src = r.gp()?;
                Instr::MaskMove { mask, src }
            }
            tag::PREFETCH => {
                let hint = PrefetchHint::from_code(r.u8()?)?;
                let mem = r.mem()?;
                Instr::Prefetch { hint, mem }
            }
            _ => return None,
        };
        Some((instr, r.pos))
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |m: Option<MaskReg>| m.map(|k| format!("{{k{}}}", k)).unwrap_or_default();
        match self {
            Instr::AluReg { op, src, dst } => write!(f, "{:?} {}, {}", op, dst, src),
            Instr::AluImm { op, dst, imm } => write!(f, "{:?} {}, {}", op, dst, imm),
            Instr::AluLoad { op, mem, dst } => write!(f, "{:?} {}, qword {}", op, dst, mem),
            Instr::AluStore { mem, src } => write!(f, "Mov qword {}, {}", mem, src),
            Instr::Push(r) => write!(f, "push {}", r),
            Instr::Pop(r) => write!(f, "pop {}", r),
            Instr::Jump { cond, disp } => write!(f, "j{:?} {:+}", cond, disp),
            Instr::Ret => f.write_str("ret"),
            Instr::VecLoad { elem, lanes, mem, dst, mask: m } => {
                write!(f, "vload.{}x{} v{}{}, {}", elem, lanes, dst, mask(*m), mem)
            }
            Instr::VecStore { elem, lanes, mem, src, mask: m } => {
                write!(f, "vstore.{}x{} {}{}, v{}", elem, lanes, mem, mask(*m), src)
            }
            Instr::VecBroadcast { elem, lanes, mem, dst } => write!(f, "vbroadcast.{}x{} v{}, {}", elem, lanes, dst, mem),
            Instr::VecZero { lanes, dst } => write!(f, "vzero.x{} v{}", lanes, dst),
            Instr::VecMove { src, dst } => write!(f, "vmov v{}, v{}", dst, src),
            Instr::VecFma { dt, lanes, a, b, acc } => write!(f, "vfma.{}x{} v{}, v{}, v{}", dt, lanes, acc, a, b),
            Instr::VecFmaBcast { dt, elem, lanes, a, mem, acc } => {
                write!(f, "vfma.{}x{} v{}, v{}, {}.{}{{1to{}}}", dt, lanes, acc, a, mem, elem, lanes)
            }
            Instr::VecArith { op, dt, lanes, src, dst } => write!(f, "v{:?}.{}x{} v{}, v{}", op, dt, lanes, dst, src),
            Instr::VecConvert { from, to, lanes, reg } => write!(f, "vcvt.{}->{}x{} v{}", from, to, lanes, reg),
            Instr::VecStoreLane { elem, lane, mem, src } => write!(f, "vextract.{} {}, v{}[{}]", elem, mem, src, lane),
            Instr::MaskMove { mask, src } => write!(f, "kmov k{}, {}", mask, src),
            Instr::Prefetch { hint, mem } => write!(f, "prefetch{:?} {}", hint, mem),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_record_length() {
        let mut out = Vec::new();
        Instr::Jump { cond: Cond::Less, disp: -42 }.encode(&mut out);
        assert_eq!(out.len(), JUMP_LEN);
        assert_eq!(Instr::decode(&out), Some((Instr::Jump { cond: Cond::Less, disp: -42 }, JUMP_LEN)));
    }

    #[test]
    fn decode_stream() {
        let stream = [
            Instr::Push(GpReg::Rbx),
            Instr::AluImm { op: AluOp::Mov, dst: GpReg::R10, imm: -7 },
            Instr::AluLoad { op: AluOp::Add, mem: Mem::indexed(GpReg::R8, GpReg::R13, 8, -8), dst: GpReg::Rdi },
            Instr::VecLoad {
                elem: Datatype::Bf16,
                lanes: 16,
                mem: Mem::disp(GpReg::Rdi, 64),
                dst: 3,
                mask: Some(1),
            },
            Instr::VecFmaBcast {
                dt: Datatype::F32,
                elem: Datatype::F32,
                lanes: 16,
                a: 0,
                mem: Mem::disp(GpReg::Rsi, 12),
                acc: 31,
            },
            Instr::Ret,
        ];
        let mut out = Vec::new();
        for i in &stream {
            i.encode(&mut out);
        }
        let mut pos = 0;
        let mut decoded = Vec::new();
        while pos < out.len() {
            let (i, len) = Instr::decode(&out[pos..]).unwrap();
            decoded.push(i);
            pos += len;
        }
        assert_eq!(decoded, stream);
    }

    #[test]
    fn validation_rejects_bad_operands() {
        assert!(Instr::VecZero { lanes: 4, dst: 32 }.validate().is_err());
        assert!(Instr::VecZero { lanes: 0, dst: 1 }.validate().is_err());
        assert!(Instr::AluImm { op: AluOp::Add, dst: GpReg::Rax, imm: 1 << 40 }.validate().is_err());
        assert!(Instr::AluImm { op: AluOp::Mov, dst: GpReg::Rax, imm: 1 << 40 }.validate().is_ok());
        assert!(Instr::AluLoad { op: AluOp::Imul, mem: Mem::base(GpReg::Rax), dst: GpReg::Rax }.validate().is_err());
        assert!(Instr::MaskMove { mask: 0, src: GpReg::R15 }.validate().is_err());
        let bad_scale = Mem { base: GpReg::Rax, index: Some(GpReg::Rcx), scale: 3, disp: 0 };
        assert!(Instr::Prefetch { hint: PrefetchHint::T1, mem: bad_scale }.validate().is_err());
        assert_eq!(Mem::indexed(GpReg::Rdi, GpReg::R13, 8, -8).to_string(), "[rdi + r13*8 -8]");
    }
}

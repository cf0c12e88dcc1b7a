//! General-purpose register roles for one kernel.

use jitgemm_base::instr::GpReg;
use jitgemm_base::{BatchReduce, CallConv, GemmDescriptor, GenError, InstructionEmitter, KernelAbi, Result};

/// Which argument layout the kernel entry follows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbiVariant {
    /// `a, b, c [, scale] [, a_prefetch, b_prefetch]`
    Plain,
    /// `a, b, c, count [, scale] [, a_prefetch, b_prefetch]` (address and stride)
    BatchPointers,
    /// `a, b, c, count, a_offsets, b_offsets`
    BatchOffsets,
    /// one pointer to a parameter block
    ParamBlock,
}

impl AbiVariant {
    pub fn of(desc: &GemmDescriptor) -> AbiVariant {
        if desc.abi().uses_param_struct() {
            return AbiVariant::ParamBlock;
        }
        match desc.batch_reduce() {
            BatchReduce::None => AbiVariant::Plain,
            BatchReduce::Address | BatchReduce::Stride => AbiVariant::BatchPointers,
            BatchReduce::Offset => AbiVariant::BatchOffsets,
        }
    }
}

/// Assignment of every role the generators use to a physical register.
///
/// Built once per generation call and read-only afterwards. The counters
/// `mloop`/`nloop` hold the element offset of the current tile.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GpRegMapping {
    pub a: GpReg,
    pub b: GpReg,
    pub c: GpReg,
    pub a_prefetch: Option<GpReg>,
    pub b_prefetch: Option<GpReg>,
    pub scale_factor: Option<GpReg>,
    pub reduce_count: Option<GpReg>,
    pub a_offsets: Option<GpReg>,
    pub b_offsets: Option<GpReg>,
    /// holds the parameter block pointer for the whole kernel
    pub param_block: Option<GpReg>,
    pub mloop: GpReg,
    pub nloop: GpReg,
    pub kloop: GpReg,
    pub reduce_loop: GpReg,
    pub help0: GpReg,
    pub help1: GpReg,
    pub help2: GpReg,
}

const SYSV_ARGS: [GpReg; 6] = [GpReg::Rdi, GpReg::Rsi, GpReg::Rdx, GpReg::Rcx, GpReg::R8, GpReg::R9];
const WIN64_ARGS: [GpReg; 4] = [GpReg::Rcx, GpReg::Rdx, GpReg::R8, GpReg::R9];

const SYSV_CALLEE_SAVED: [GpReg; 6] = [GpReg::Rbx, GpReg::Rbp, GpReg::R12, GpReg::R13, GpReg::R14, GpReg::R15];
const WIN64_CALLEE_SAVED: [GpReg; 8] =
    [GpReg::Rbx, GpReg::Rbp, GpReg::Rdi, GpReg::Rsi, GpReg::R12, GpReg::R13, GpReg::R14, GpReg::R15];

pub fn callee_saved(call_conv: CallConv) -> &'static [GpReg] {
    match call_conv {
        CallConv::SysV => &SYSV_CALLEE_SAVED,
        CallConv::Win64 => &WIN64_CALLEE_SAVED,
    }
}

pub fn argument_registers(call_conv: CallConv) -> &'static [GpReg] {
    match call_conv {
        CallConv::SysV => &SYSV_ARGS,
        CallConv::Win64 => &WIN64_ARGS,
    }
}

impl GpRegMapping {
    pub fn for_descriptor(desc: &GemmDescriptor) -> Result<GpRegMapping> {
        let variant = AbiVariant::of(desc);
        let scf = desc.has_scale_factor();
        let pf = desc.prefetch();
        let mut map = GpRegMapping {
            a: GpReg::Rdi,
            b: GpReg::Rsi,
            c: GpReg::Rdx,
            a_prefetch: None,
            b_prefetch: None,
            scale_factor: None,
            reduce_count: None,
            a_offsets: None,
            b_offsets: None,
            param_block: None,
            mloop: GpReg::R10,
            nloop: GpReg::R11,
            kloop: GpReg::R12,
            reduce_loop: GpReg::R13,
            help0: GpReg::R14,
            help1: GpReg::R15,
            help2: GpReg::Rbx,
        };

        if desc.call_conv() == CallConv::Win64 && desc.abi() == KernelAbi::Plain {
            if variant != AbiVariant::Plain || scf || pf.prefetches_a() || pf.prefetches_b() {
                return Err(GenError::IllegalAbiCombination(
                    "win64 register arguments only cover a, b and c; use the parameter block",
                ));
            }
            map.a = GpReg::Rcx;
            map.b = GpReg::Rdx;
            map.c = GpReg::R8;
            return Ok(map);
        }

        // trailing argument registers, in order
        let mut rest = [GpReg::Rcx, GpReg::R8, GpReg::R9].into_iter();
        match variant {
            AbiVariant::Plain => {
                if scf {
                    map.scale_factor = rest.next();
                }
                map.a_prefetch = rest.next();
                map.b_prefetch = rest.next();
            }
            AbiVariant::BatchPointers => {
                map.reduce_count = rest.next();
                if scf {
                    map.scale_factor = rest.next();
                }
                map.a_prefetch = rest.next();
                map.b_prefetch = rest.next();
            }
            AbiVariant::BatchOffsets => {
                map.reduce_count = Some(GpReg::Rcx);
                map.a_offsets = Some(GpReg::R8);
                map.b_offsets = Some(GpReg::R9);
                if scf {
                    map.scale_factor = Some(GpReg::Rax);
                }
            }
            AbiVariant::ParamBlock => {
                map.param_block = Some(map.help1);
                if desc.batch_reduce().is_active() {
                    map.reduce_count = Some(GpReg::Rcx);
                }
                if desc.batch_reduce() == BatchReduce::Offset {
                    map.a_offsets = Some(GpReg::R8);
                    map.b_offsets = Some(GpReg::R9);
                    map.scale_factor = scf.then_some(GpReg::Rax);
                } else {
                    map.scale_factor = scf.then_some(GpReg::R8);
                    map.a_prefetch = Some(GpReg::R9);
                    map.b_prefetch = Some(GpReg::Rax);
                }
            }
        }
        if desc.batch_reduce() == BatchReduce::Offset && (pf.prefetches_a() || pf.prefetches_b()) {
            return Err(GenError::IllegalAbiCombination("prefetch pointers with offset batch-reduce"));
        }
        if !pf.prefetches_a() {
            map.a_prefetch = None;
        }
        if !pf.prefetches_b() {
            map.b_prefetch = None;
        }
        Ok(map)
    }

    /// Register the caller passes the first argument in.
    pub fn first_argument(call_conv: CallConv) -> GpReg {
        argument_registers(call_conv)[0]
    }
}

/// Registers pushed on entry to a nested generator and popped, in reverse
/// order, when it is done. Consuming [`restore`](Self::restore) keeps the
/// push/pop pairing in one place.
#[must_use]
pub struct RegisterSaveScope {
    regs: Vec<GpReg>,
}

impl RegisterSaveScope {
    pub fn save(code: &mut dyn InstructionEmitter, regs: &[GpReg]) -> RegisterSaveScope {
        for &r in regs {
            code.push(r);
        }
        RegisterSaveScope { regs: regs.to_vec() }
    }

    pub fn restore(self, code: &mut dyn InstructionEmitter) {
        for &r in self.regs.iter().rev() {
            code.pop(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::instr::Instr;
    use jitgemm_base::{ArchTier, Datatype, GeneratedCode, Prefetch};

    fn desc() -> jitgemm_base::GemmDescriptorBuilder {
        GemmDescriptor::builder(8, 8, 8, Datatype::F32).call_conv(CallConv::SysV)
    }

    #[test]
    fn plain_roles() {
        let m = GpRegMapping::for_descriptor(&desc().prefetch(Prefetch::AL2BL2ViaC).build().unwrap()).unwrap();
        assert_eq!((m.a, m.b, m.c), (GpReg::Rdi, GpReg::Rsi, GpReg::Rdx));
        assert_eq!((m.a_prefetch, m.b_prefetch), (Some(GpReg::Rcx), Some(GpReg::R8)));

        let d = GemmDescriptor::builder(8, 8, 8, Datatype::I8)
            .call_conv(CallConv::SysV)
            .prefetch(Prefetch::AL2)
            .beta_zero(true)
            .build()
            .unwrap();
        let m = GpRegMapping::for_descriptor(&d).unwrap();
        assert_eq!(m.scale_factor, Some(GpReg::Rcx));
        assert_eq!(m.a_prefetch, Some(GpReg::R8));
        assert_eq!(m.b_prefetch, None);
    }

    #[test]
    fn batch_roles() {
        let m = GpRegMapping::for_descriptor(&desc().batch_reduce(BatchReduce::Address).build().unwrap()).unwrap();
        assert_eq!(m.reduce_count, Some(GpReg::Rcx));
        let m = GpRegMapping::for_descriptor(&desc().batch_reduce(BatchReduce::Offset).build().unwrap()).unwrap();
        assert_eq!((m.reduce_count, m.a_offsets, m.b_offsets), (Some(GpReg::Rcx), Some(GpReg::R8), Some(GpReg::R9)));
        let m = GpRegMapping::for_descriptor(&desc().strides(64, 128).build().unwrap()).unwrap();
        assert_eq!(m.reduce_count, Some(GpReg::Rcx));
    }

    #[test]
    fn win64_plain_is_limited_to_three_pointers() {
        let d = desc().call_conv(CallConv::Win64).build().unwrap();
        let m = GpRegMapping::for_descriptor(&d).unwrap();
        assert_eq!((m.a, m.b, m.c), (GpReg::Rcx, GpReg::Rdx, GpReg::R8));
        let d = desc().call_conv(CallConv::Win64).batch_reduce(BatchReduce::Stride).build().unwrap();
        assert!(matches!(GpRegMapping::for_descriptor(&d), Err(GenError::IllegalAbiCombination(_))));
        let d = desc().call_conv(CallConv::Win64).abi(KernelAbi::Struct).batch_reduce(BatchReduce::Stride).build().unwrap();
        assert!(GpRegMapping::for_descriptor(&d).is_ok());
    }

    #[test]
    fn roles_do_not_alias() {
        let descs = [
            desc().build().unwrap(),
            desc().prefetch(Prefetch::AL2BL2ViaC).build().unwrap(),
            desc().batch_reduce(BatchReduce::Offset).build().unwrap(),
            desc().abi(KernelAbi::Extended).batch_reduce(BatchReduce::Address).prefetch(Prefetch::AL2BL2ViaC).build().unwrap(),
            desc().abi(KernelAbi::Struct).batch_reduce(BatchReduce::Offset).build().unwrap(),
        ];
        for d in &descs {
            let m = GpRegMapping::for_descriptor(d).unwrap();
            let mut roles = vec![m.a, m.b, m.c, m.mloop, m.nloop, m.kloop, m.reduce_loop, m.help0, m.help1, m.help2];
            roles.extend([m.a_prefetch, m.b_prefetch, m.scale_factor, m.reduce_count, m.a_offsets, m.b_offsets].iter().flatten());
            let mut sorted = roles.clone();
            sorted.sort_by_key(|r| r.index());
            sorted.dedup();
            assert_eq!(sorted.len(), roles.len(), "aliasing roles in {:?}", m);
            assert!(!roles.contains(&GpReg::Rsp));
            assert!(!roles.contains(&GpReg::Rbp));
        }
    }

    #[test]
    fn save_scope_pops_in_reverse() {
        let mut code = GeneratedCode::new(ArchTier::Avx2);
        let scope = RegisterSaveScope::save(&mut code, &[GpReg::Rdx, GpReg::Rcx, GpReg::R8]);
        scope.restore(&mut code);
        let pops: Vec<_> = code
            .instructions()
            .unwrap()
            .into_iter()
            .filter_map(|i| match i {
                Instr::Pop(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(pops, [GpReg::R8, GpReg::Rcx, GpReg::Rdx]);
    }
}

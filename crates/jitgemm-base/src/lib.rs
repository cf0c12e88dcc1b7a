//! # Shared vocabulary of the jitgemm generator
//! Architecture tiers and host detection, datatypes, the kernel descriptor,
//! the symbolic instruction set and the code buffer it is written into.

use once_cell::sync::Lazy;

pub mod arch;
pub mod code;
pub mod datatype;
pub mod descriptor;
pub mod error;
pub mod instr;

pub use arch::ArchTier;
pub use code::{GeneratedCode, InstructionEmitter};
pub use datatype::Datatype;
pub use descriptor::{
    BatchReduce, CallConv, GemmArg, GemmDescriptor, GemmDescriptorBuilder, GemmParam, KernelAbi, PostOp, Prefetch,
};
pub use error::{BlockDim, GenError, Result};

#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuFeatures {
    pub sse2: bool,
    pub sse3: bool,
    pub sse42: bool,
    pub avx: bool,
    pub avx2: bool,
    pub fma: bool,
    pub avx512f: bool,
    pub avx512bw: bool,
    pub avx512vl: bool,
    pub avx512dq: bool,
    pub avx512er: bool,
    pub avx512pf: bool,
    pub avx512_vnni: bool,
    pub avx512f16: bool,
}

#[cfg(target_arch = "aarch64")]
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuFeatures {
    pub neon: bool,
    pub sve: bool,
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuFeatures {
    pub dummy: bool,
}

pub struct HWConfig {
    pub cpu_ft: CpuFeatures,
    arch: ArchTier,
    #[cfg(target_arch = "x86_64")]
    family_id: u8,
    #[cfg(target_arch = "x86_64")]
    model_id: u8,
}

impl HWConfig {
    pub fn cpu_ft(&self) -> CpuFeatures {
        self.cpu_ft
    }

    pub fn arch(&self) -> ArchTier {
        self.arch
    }

    #[cfg(target_arch = "x86_64")]
    pub fn family_id(&self) -> u8 {
        self.family_id
    }

    #[cfg(target_arch = "x86_64")]
    pub fn model_id(&self) -> u8 {
        self.model_id
    }
}

#[inline]
fn detect_hw_config() -> HWConfig {
    #[cfg(target_arch = "x86_64")]
    {
        let cpuid = raw_cpuid::CpuId::new();
        let cpu_ft = match (cpuid.get_feature_info(), cpuid.get_extended_feature_info()) {
            (Some(feature_info), Some(extended_feature_info)) => {
                let cpu_ft = CpuFeatures {
                    sse2: feature_info.has_sse2(),
                    sse3: feature_info.has_sse3(),
                    sse42: feature_info.has_sse42(),
                    avx: feature_info.has_avx(),
                    fma: feature_info.has_fma(),
                    avx2: extended_feature_info.has_avx2(),
                    avx512f: extended_feature_info.has_avx512f(),
                    avx512bw: extended_feature_info.has_avx512bw(),
                    avx512vl: extended_feature_info.has_avx512vl(),
                    avx512dq: extended_feature_info.has_avx512dq(),
                    avx512er: extended_feature_info.has_avx512er(),
                    avx512pf: extended_feature_info.has_avx512pf(),
                    avx512_vnni: extended_feature_info.has_avx512vnni(),
                    avx512f16: extended_feature_info.has_avx512_fp16(),
                };
                let family_id = feature_info.family_id();
                let model_id = feature_info.model_id();
                (cpu_ft, family_id, model_id)
            }
            // cpuid leaves missing, e.g. under some emulators
            _ => (CpuFeatures::default(), 0, 0),
        };
        let (cpu_ft, family_id, model_id) = cpu_ft;
        let arch = ArchTier::from_features(cpu_ft);
        return HWConfig { cpu_ft, arch, family_id, model_id };
    }
    #[cfg(target_arch = "aarch64")]
    {
        use std::arch::is_aarch64_feature_detected;
        let neon = is_aarch64_feature_detected!("neon");
        let sve = is_aarch64_feature_detected!("sve");
        let cpu_ft = CpuFeatures { neon, sve };
        return HWConfig { cpu_ft, arch: ArchTier::from_features(cpu_ft) };
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        return HWConfig { cpu_ft: CpuFeatures { dummy: false }, arch: ArchTier::Reference };
    }
}

#[cfg(feature = "debug_cpu_features")]
#[allow(unused)]
fn apply_debug_cpu_features(cpu_ft: &mut CpuFeatures) {
    #[cfg(target_arch = "x86_64")]
    {
        let off = |name: &str| std::env::var(format!("JITGEMM_{}_OFF", name)).is_ok();
        cpu_ft.sse2 = cpu_ft.sse2 && !off("SSE2");
        cpu_ft.sse3 = cpu_ft.sse3 && !off("SSE3");
        cpu_ft.sse42 = cpu_ft.sse42 && !off("SSE42");
        cpu_ft.avx = cpu_ft.avx && !off("AVX");
        cpu_ft.avx2 = cpu_ft.avx2 && !off("AVX2");
        cpu_ft.fma = cpu_ft.fma && !off("FMA");
        cpu_ft.avx512f = cpu_ft.avx512f && !off("AVX512F");
        cpu_ft.avx512bw = cpu_ft.avx512bw && !off("AVX512BW");
        cpu_ft.avx512vl = cpu_ft.avx512vl && !off("AVX512VL");
        cpu_ft.avx512dq = cpu_ft.avx512dq && !off("AVX512DQ");
        cpu_ft.avx512_vnni = cpu_ft.avx512_vnni && !off("AVX512_VNNI");
        cpu_ft.avx512f16 = cpu_ft.avx512f16 && !off("AVX512F16");
    }
    #[cfg(target_arch = "aarch64")]
    {
        let neon_turn_off = std::env::var("JITGEMM_NEON_OFF").is_ok();
        let sve_turn_off = std::env::var("JITGEMM_SVE_OFF").is_ok();
        cpu_ft.neon = cpu_ft.neon && !neon_turn_off;
        cpu_ft.sve = cpu_ft.sve && !sve_turn_off;
    }
}

#[cfg(not(feature = "debug_cpu_features"))]
pub static RUNTIME_HW_CONFIG: Lazy<HWConfig> = Lazy::new(detect_hw_config);
#[cfg(feature = "debug_cpu_features")]
pub static RUNTIME_HW_CONFIG: Lazy<HWConfig> = Lazy::new(|| {
    let mut hw_config = detect_hw_config();
    apply_debug_cpu_features(&mut hw_config.cpu_ft);
    hw_config.arch = ArchTier::from_features(hw_config.cpu_ft);
    hw_config
});

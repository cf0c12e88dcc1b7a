use core::fmt;
use core::ops::RangeInclusive;
use core::str::FromStr;

use once_cell::sync::Lazy;

use crate::error::ParseArchTierError;
use crate::{CpuFeatures, RUNTIME_HW_CONFIG};

/// Target architecture tag, ordered from the least to the most capable tier.
///
/// Ordering is meaningful: the generator compares tiers with `<`/`>=` and
/// keys its tables on inclusive tier ranges.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArchTier {
    /// no vector isa, reference code only
    Reference,
    Generic,
    Sse3,
    Sse42,
    Avx,
    Avx2,
    Avx512Vl256,
    Avx512Vl256Clx,
    Avx512Vl256Cpx,
    Avx512Mic,
    Avx512Knm,
    Avx512Core,
    Avx512Clx,
    Avx512Cpx,
    Avx512Spr,
    // no x86 generator path exists for these
    Aarch64Neon,
    Aarch64Sve,
}

/// Tiers the x86 generator has a path for.
pub const X86_TIERS: RangeInclusive<ArchTier> = ArchTier::Generic..=ArchTier::Avx512Spr;
/// 256-bit vectors with AVX512 masking and 32 registers.
pub const VL256_TIERS: RangeInclusive<ArchTier> = ArchTier::Avx512Vl256..=ArchTier::Avx512Vl256Cpx;
/// Tiers with full 512-bit vectors.
pub const ZMM_TIERS: RangeInclusive<ArchTier> = ArchTier::Avx512Mic..=ArchTier::Avx512Spr;

impl ArchTier {
    pub const ALL: [ArchTier; 17] = [
        ArchTier::Reference,
        ArchTier::Generic,
        ArchTier::Sse3,
        ArchTier::Sse42,
        ArchTier::Avx,
        ArchTier::Avx2,
        ArchTier::Avx512Vl256,
        ArchTier::Avx512Vl256Clx,
        ArchTier::Avx512Vl256Cpx,
        ArchTier::Avx512Mic,
        ArchTier::Avx512Knm,
        ArchTier::Avx512Core,
        ArchTier::Avx512Clx,
        ArchTier::Avx512Cpx,
        ArchTier::Avx512Spr,
        ArchTier::Aarch64Neon,
        ArchTier::Aarch64Sve,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArchTier::Reference => "reference",
            ArchTier::Generic => "generic",
            ArchTier::Sse3 => "sse3",
            ArchTier::Sse42 => "sse42",
            ArchTier::Avx => "avx",
            ArchTier::Avx2 => "avx2",
            ArchTier::Avx512Vl256 => "avx512_vl256",
            ArchTier::Avx512Vl256Clx => "avx512_vl256_clx",
            ArchTier::Avx512Vl256Cpx => "avx512_vl256_cpx",
            ArchTier::Avx512Mic => "avx512_mic",
            ArchTier::Avx512Knm => "avx512_knm",
            ArchTier::Avx512Core => "avx512_core",
            ArchTier::Avx512Clx => "avx512_clx",
            ArchTier::Avx512Cpx => "avx512_cpx",
            ArchTier::Avx512Spr => "avx512_spr",
            ArchTier::Aarch64Neon => "aarch64_neon",
            ArchTier::Aarch64Sve => "aarch64_sve",
        }
    }

    #[inline]
    pub fn is_x86(self) -> bool {
        X86_TIERS.contains(&self)
    }

    /// Width of one vector register in bytes, 0 outside the x86 tiers.
    pub fn vector_bytes(self) -> usize {
        match self {
            ArchTier::Generic | ArchTier::Sse3 | ArchTier::Sse42 => 16,
            ArchTier::Avx | ArchTier::Avx2 => 32,
            t if VL256_TIERS.contains(&t) => 32,
            t if ZMM_TIERS.contains(&t) => 64,
            _ => 0,
        }
    }

    pub fn vector_reg_count(self) -> usize {
        if self >= ArchTier::Avx512Vl256 {
            32
        } else {
            16
        }
    }

    /// Tail handling via mask registers.
    #[inline]
    pub fn has_masking(self) -> bool {
        self >= ArchTier::Avx512Vl256 && self.is_x86()
    }

    #[inline]
    pub fn has_fma(self) -> bool {
        self >= ArchTier::Avx2 && self.is_x86()
    }

    /// Highest tier supported by the running host, unless `JITGEMM_TARGET` overrides it.
    pub fn host() -> ArchTier {
        match *TARGET_OVERRIDE {
            Some(t) => t,
            None => RUNTIME_HW_CONFIG.arch(),
        }
    }

    #[cfg(target_arch = "x86_64")]
    pub fn from_features(cpu_ft: CpuFeatures) -> ArchTier {
        let avx512_core = cpu_ft.avx512f && cpu_ft.avx512bw && cpu_ft.avx512vl && cpu_ft.avx512dq;
        if avx512_core {
            if cpu_ft.avx512f16 {
                return ArchTier::Avx512Spr;
            }
            if cpu_ft.avx512_vnni {
                return ArchTier::Avx512Clx;
            }
            return ArchTier::Avx512Core;
        }
        if cpu_ft.avx512f && cpu_ft.avx512er && cpu_ft.avx512pf {
            return ArchTier::Avx512Mic;
        }
        if cpu_ft.avx2 && cpu_ft.fma {
            return ArchTier::Avx2;
        }
        if cpu_ft.avx {
            return ArchTier::Avx;
        }
        if cpu_ft.sse42 {
            return ArchTier::Sse42;
        }
        if cpu_ft.sse3 {
            return ArchTier::Sse3;
        }
        if cpu_ft.sse2 {
            return ArchTier::Generic;
        }
        ArchTier::Reference
    }

    #[cfg(target_arch = "aarch64")]
    pub fn from_features(cpu_ft: CpuFeatures) -> ArchTier {
        if cpu_ft.sve {
            return ArchTier::Aarch64Sve;
        }
        if cpu_ft.neon {
            return ArchTier::Aarch64Neon;
        }
        ArchTier::Reference
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn from_features(_cpu_ft: CpuFeatures) -> ArchTier {
        ArchTier::Reference
    }
}

impl fmt::Display for ArchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArchTier {
    type Err = ParseArchTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let tier = match lower.as_str() {
            "reference" | "noarch" => ArchTier::Reference,
            "generic" | "x86" | "sse2" => ArchTier::Generic,
            "sse3" => ArchTier::Sse3,
            "sse42" | "sse4_2" | "wsm" => ArchTier::Sse42,
            "avx" | "snb" => ArchTier::Avx,
            "avx2" | "hsw" => ArchTier::Avx2,
            "avx512_vl256" => ArchTier::Avx512Vl256,
            "avx512_vl256_clx" => ArchTier::Avx512Vl256Clx,
            "avx512_vl256_cpx" => ArchTier::Avx512Vl256Cpx,
            "avx512_mic" | "knl" => ArchTier::Avx512Mic,
            "avx512_knm" | "knm" => ArchTier::Avx512Knm,
            "avx512_core" | "avx512" | "skx" => ArchTier::Avx512Core,
            "avx512_clx" | "clx" => ArchTier::Avx512Clx,
            "avx512_cpx" | "cpx" => ArchTier::Avx512Cpx,
            "avx512_spr" | "spr" => ArchTier::Avx512Spr,
            "aarch64" | "aarch64_neon" | "neon" => ArchTier::Aarch64Neon,
            "aarch64_sve" | "sve" => ArchTier::Aarch64Sve,
            _ => return Err(ParseArchTierError(s.to_string())),
        };
        Ok(tier)
    }
}

static TARGET_OVERRIDE: Lazy<Option<ArchTier>> = Lazy::new(|| {
    let name = std::env::var("JITGEMM_TARGET").ok()?;
    match name.parse::<ArchTier>() {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!("ignoring JITGEMM_TARGET: {}", e);
            None
        }
    }
});

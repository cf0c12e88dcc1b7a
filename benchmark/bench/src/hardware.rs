use serde::{Deserialize, Serialize};

use jitgemm_base::{ArchTier, RUNTIME_HW_CONFIG};

#[derive(Debug, Serialize, Deserialize)]
pub struct HWConfig {
    /// tier from cpuid alone
    pub detected_tier: String,
    /// tier after `JITGEMM_TARGET`
    pub host_tier: String,
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u8>,
}

pub fn detect_hw_config() -> HWConfig {
    let hw = &*RUNTIME_HW_CONFIG;
    let detected_tier = hw.arch().to_string();
    let host_tier = ArchTier::host().to_string();
    #[cfg(target_arch = "x86_64")]
    {
        let ft = hw.cpu_ft();
        let features = [
            ("sse2", ft.sse2),
            ("sse3", ft.sse3),
            ("sse4.2", ft.sse42),
            ("avx", ft.avx),
            ("avx2", ft.avx2),
            ("fma", ft.fma),
            ("avx512f", ft.avx512f),
            ("avx512bw", ft.avx512bw),
            ("avx512vl", ft.avx512vl),
            ("avx512dq", ft.avx512dq),
            ("avx512er", ft.avx512er),
            ("avx512pf", ft.avx512pf),
            ("avx512_vnni", ft.avx512_vnni),
            ("avx512fp16", ft.avx512f16),
        ]
        .into_iter()
        .filter(|f| f.1)
        .map(|f| f.0.to_string())
        .collect();
        return HWConfig {
            detected_tier,
            host_tier,
            features,
            family_id: Some(hw.family_id()),
            model_id: Some(hw.model_id()),
        };
    }
    #[cfg(target_arch = "aarch64")]
    {
        let ft = hw.cpu_ft();
        let features =
            [("neon", ft.neon), ("sve", ft.sve)].into_iter().filter(|f| f.1).map(|f| f.0.to_string()).collect();
        return HWConfig { detected_tier, host_tier, features, family_id: None, model_id: None };
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        return HWConfig { detected_tier, host_tier, features: Vec::new(), family_id: None, model_id: None };
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub hw_config: HWConfig,
    pub os: String,
    pub arch: String,
    pub num_threads: usize,
}

pub fn get_benchmark_config() -> BenchmarkConfig {
    let hw_config = detect_hw_config();
    let os = std::env::consts::OS.to_string();
    let arch = std::env::consts::ARCH.to_string();
    let default_num_threads = std::thread::available_parallelism().map_or(1, |n| n.get());
    let num_threads =
        std::env::var("NUM_THREADS").ok().and_then(|s| s.parse().ok()).unwrap_or(default_num_threads);
    BenchmarkConfig { hw_config, os, arch, num_threads }
}

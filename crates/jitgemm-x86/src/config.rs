use jitgemm_base::{ArchTier, Datatype, GemmDescriptor};

/// Width class of the vectors one M block is computed with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VectorKind {
    Full,
    /// half of the tier's vector, used for short M tails below AVX512
    Half,
    /// one element per register
    Scalar,
}

/// Derived parameters of one micro-kernel variant.
///
/// Immutable once built. The symbolic instruction set carries element type
/// and lane count in every vector record, so these two fields select the
/// move, load and arithmetic forms.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MicroKernelConfig {
    pub arch: ArchTier,
    pub kind: VectorKind,
    /// lanes of the compute type per register
    pub vector_length: usize,
    pub vector_reg_count: usize,
    pub input: Datatype,
    pub output: Datatype,
    pub compute: Datatype,
    pub datatype_size_in: usize,
    pub datatype_size_out: usize,
    /// the last M vector of a block is partial and goes through mask `k1`
    pub use_masking_a_c: bool,
    pub vnni_format_c: bool,
    pub fma: bool,
}

/// Mask register for M tails.
pub const TAIL_MASK: u8 = 1;

impl MicroKernelConfig {
    pub fn new(arch: ArchTier, desc: &GemmDescriptor, kind: VectorKind, use_masking: bool) -> Self {
        let full = arch.vector_bytes() / desc.compute().size();
        let vector_length = match kind {
            VectorKind::Full => full,
            VectorKind::Half => full / 2,
            VectorKind::Scalar => 1,
        };
        MicroKernelConfig {
            arch,
            kind,
            vector_length: vector_length.max(1),
            vector_reg_count: arch.vector_reg_count(),
            input: desc.input(),
            output: desc.output(),
            compute: desc.compute(),
            datatype_size_in: desc.input().size(),
            datatype_size_out: desc.output().size(),
            use_masking_a_c: use_masking && arch.has_masking(),
            vnni_format_c: desc.vnni_c(),
            fma: arch.has_fma(),
        }
    }

    pub fn fullvector(arch: ArchTier, desc: &GemmDescriptor, use_masking: bool) -> Self {
        Self::new(arch, desc, VectorKind::Full, use_masking)
    }

    pub fn halfvector(arch: ArchTier, desc: &GemmDescriptor) -> Self {
        Self::new(arch, desc, VectorKind::Half, false)
    }

    pub fn scalar(arch: ArchTier, desc: &GemmDescriptor) -> Self {
        Self::new(arch, desc, VectorKind::Scalar, false)
    }

    /// Vector registers needed to cover `m_blocking` rows.
    #[inline]
    pub fn m_vectors(&self, m_blocking: usize) -> usize {
        (m_blocking + self.vector_length - 1) / self.vector_length
    }

    /// Active lanes of the last vector of an `m_blocking` block.
    pub fn tail_lanes(&self, m_blocking: usize) -> usize {
        match m_blocking % self.vector_length {
            0 => self.vector_length,
            r => r,
        }
    }

    /// Mask for the `mv`-th vector of an `m_blocking` block, if it is partial.
    pub fn mask_for(&self, m_blocking: usize, mv: usize) -> Option<u8> {
        let last = mv + 1 == self.m_vectors(m_blocking);
        (self.use_masking_a_c && last && m_blocking % self.vector_length != 0).then_some(TAIL_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_lengths_per_tier() {
        let f32d = GemmDescriptor::builder(16, 4, 4, Datatype::F32).build().unwrap();
        let f64d = GemmDescriptor::builder(16, 4, 4, Datatype::F64).build().unwrap();
        let bf16d = GemmDescriptor::builder(16, 4, 4, Datatype::Bf16).build().unwrap();
        assert_eq!(MicroKernelConfig::fullvector(ArchTier::Sse3, &f32d, false).vector_length, 4);
        assert_eq!(MicroKernelConfig::fullvector(ArchTier::Avx2, &f64d, false).vector_length, 4);
        assert_eq!(MicroKernelConfig::halfvector(ArchTier::Avx, &f32d).vector_length, 4);
        assert_eq!(MicroKernelConfig::scalar(ArchTier::Avx2, &f64d).vector_length, 1);
        assert_eq!(MicroKernelConfig::fullvector(ArchTier::Avx512Vl256, &f32d, true).vector_length, 8);
        assert_eq!(MicroKernelConfig::fullvector(ArchTier::Avx512Core, &f64d, true).vector_length, 8);
        // bf16 accumulates in f32
        assert_eq!(MicroKernelConfig::fullvector(ArchTier::Avx512Spr, &bf16d, true).vector_length, 16);
    }

    #[test]
    fn masking_needs_mask_registers() {
        let d = GemmDescriptor::builder(9, 4, 4, Datatype::F32).build().unwrap();
        assert!(!MicroKernelConfig::fullvector(ArchTier::Avx2, &d, true).use_masking_a_c);
        let cfg = MicroKernelConfig::fullvector(ArchTier::Avx512Core, &d, true);
        assert!(cfg.use_masking_a_c);
        assert_eq!(cfg.m_vectors(9), 1);
        assert_eq!(cfg.tail_lanes(9), 9);
        assert_eq!(cfg.mask_for(9, 0), Some(TAIL_MASK));
        assert_eq!(cfg.mask_for(16, 0), None);
        assert_eq!(cfg.m_vectors(40), 3);
        assert_eq!(cfg.mask_for(40, 1), None);
        assert_eq!(cfg.mask_for(40, 2), Some(TAIL_MASK));
    }
}

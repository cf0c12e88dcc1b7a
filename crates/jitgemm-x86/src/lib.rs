//! # jitgemm-x86
//! Generates small dense GEMM kernels, `C = A * B (+ C)`, for the x86 tiers
//! in [`ArchTier`]. A kernel is planned from its [`GemmDescriptor`] first and
//! only then emitted through an [`InstructionEmitter`], so configuration
//! errors never leave half-written code behind.
//!
//! ```ignore
//! let desc = GemmDescriptor::builder(9, 10, 20, Datatype::F32).build()?;
//! let code = jitgemm_x86::generate(&desc, ArchTier::Avx512Core)?;
//! ```

pub mod blocking;
pub mod config;
pub mod kloop;
pub mod loops;
pub mod microkernel;
pub mod regs;
pub mod tile;
pub mod transpose;

mod batch;
mod driver;
mod frame;

pub use driver::{generate, generate_for_host, generate_gemm_kernel, plan, scratch_size, GemmPlan, MBlockPlan};
pub use frame::ScratchLayout;
pub use jitgemm_base::{
    ArchTier, BatchReduce, CallConv, Datatype, GemmArg, GemmDescriptor, GemmDescriptorBuilder, GemmParam, GenError,
    GeneratedCode, InstructionEmitter, KernelAbi, PostOp, Prefetch, Result,
};

/// Leading dimension the GEMM body reads A with; a transposed A is first
/// copied into an `m x k` buffer.
pub(crate) fn effective_lda(desc: &GemmDescriptor) -> usize {
    if desc.trans_a() {
        desc.m()
    } else {
        desc.lda()
    }
}

/// Byte displacement as `i32`, recording an encoding error when it does not fit.
pub(crate) fn disp(code: &mut dyn InstructionEmitter, bytes: i64) -> i32 {
    match i32::try_from(bytes) {
        Ok(d) => d,
        Err(_) => {
            code.set_error(GenError::Encoding(format!("displacement {} does not fit 32 bits", bytes)));
            0
        }
    }
}

use jitgemm_base::instr::{AluOp, Mem};
use jitgemm_base::{
    ArchTier, Datatype, GemmDescriptor, GemmParam, GenError, GeneratedCode, InstructionEmitter, KernelAbi, PostOp,
    Result,
};

use crate::batch;
use crate::blocking::{self, EqualizedBlocking, MSweepStep};
use crate::config::{MicroKernelConfig, TAIL_MASK};
use crate::frame::{self, ScratchLayout, StackVar, VnniDirection};
use crate::kloop::{self, KLoopStrategy};
use crate::loops::{LoopBound, LoopLabelTracker};
use crate::microkernel::MicroKernelBody;
use crate::regs::{self, AbiVariant, GpRegMapping, RegisterSaveScope};
use crate::tile::{self, Tile};
use crate::transpose::{self, TransposeConfig};

/// Decisions for one run of equal M blocks.
#[derive(Copy, Clone, Debug)]
pub struct MBlockPlan {
    pub step: MSweepStep,
    pub config: MicroKernelConfig,
    pub body: &'static dyn MicroKernelBody,
    pub k_strategy: KLoopStrategy,
}

/// Everything decided about a kernel before any code is emitted.
#[derive(Clone, Debug)]
pub struct GemmPlan {
    pub arch: ArchTier,
    pub regs: GpRegMapping,
    pub n_blocking: EqualizedBlocking,
    pub m_blocks: Vec<MBlockPlan>,
    pub transpose: Option<TransposeConfig>,
}

fn check_abi(desc: &GemmDescriptor, arch: ArchTier) -> Result<()> {
    let illegal = |why| Err(GenError::IllegalAbiCombination(why));
    if desc.abi() == KernelAbi::Extended || desc.vnni_c() {
        if arch < ArchTier::Avx {
            return Err(GenError::UnsupportedArchitecture(arch));
        }
        if !matches!(desc.input(), Datatype::F32 | Datatype::Bf16) {
            return illegal("fused operations support f32 and bf16 inputs only");
        }
    }
    if desc.vnni_c() {
        if desc.output() != Datatype::Bf16 {
            return illegal("packed output must be bf16");
        }
        if desc.n() % 2 != 0 {
            return illegal("packed output needs an even n");
        }
    }
    if desc.post_op() != PostOp::None && desc.abi() != KernelAbi::Extended {
        return illegal("post operations need the extended abi");
    }
    if desc.trans_a() && desc.batch_reduce().is_active() {
        return illegal("transposed a cannot be combined with batch-reduce");
    }
    if desc.has_scale_factor() && !desc.beta_zero() {
        return illegal("8-bit output needs beta = 0");
    }
    Ok(())
}

/// Validates `desc` for `arch` and makes every blocking decision.
///
/// Errors come in a fixed order: architecture, datatypes, ABI, blocking.
pub fn plan(desc: &GemmDescriptor, arch: ArchTier) -> Result<GemmPlan> {
    let entry = blocking::lookup(arch, desc)?;
    if desc.trans_a() && !matches!(desc.input(), Datatype::F32 | Datatype::F64) {
        return Err(GenError::UnsupportedDatatype { input: desc.input(), output: desc.output(), arch });
    }
    check_abi(desc, arch)?;
    let regs = GpRegMapping::for_descriptor(desc)?;
    let n_blocking = blocking::n_blocking(arch, desc)?;
    let m_blocks = blocking::m_sweep(arch, desc)?
        .into_iter()
        .map(|step| {
            let config = blocking::config_for(arch, desc, step.blocking);
            let m_vectors = config.m_vectors(step.blocking.size);
            let k_strategy = kloop::k_blocking_strategy(arch, desc.input(), m_vectors, desc.k());
            MBlockPlan { step, config, body: entry.body, k_strategy }
        })
        .collect();
    let transpose = desc.trans_a().then(|| TransposeConfig::for_arch(arch, desc.input()));
    Ok(GemmPlan { arch, regs, n_blocking, m_blocks, transpose })
}

/// Appends the kernel for `desc` to `code`, targeting `code.arch()`.
///
/// On error nothing usable is left in `code`: planning errors are raised
/// before the first instruction, emission errors stick to `code`.
pub fn generate_gemm_kernel(desc: &GemmDescriptor, code: &mut dyn InstructionEmitter) -> Result<()> {
    let arch = code.arch();
    tracing::debug!(%arch, m = desc.m(), n = desc.n(), k = desc.k(), input = %desc.input(), "generating gemm kernel");
    let plan = match plan(desc, arch) {
        Ok(plan) => plan,
        Err(e) => {
            tracing::warn!(%arch, "kernel rejected: {}", e);
            code.set_error(e.clone());
            return Err(e);
        }
    };
    tracing::trace!(abi = ?AbiVariant::of(desc), n_blocking = ?plan.n_blocking, "kernel plan");
    for block in &plan.m_blocks {
        tracing::trace!(m_block = block.step.blocking.size, count = block.step.count(), k = ?block.k_strategy, "m sweep");
    }
    let start = code.position();
    emit_kernel(code, desc, &plan);
    match code.error() {
        Some(e) => {
            tracing::warn!(%arch, "kernel emission failed: {}", e);
            Err(e.clone())
        }
        None => {
            tracing::debug!(bytes = code.position() - start, "kernel generated");
            Ok(())
        }
    }
}

/// Generates into a fresh buffer.
pub fn generate(desc: &GemmDescriptor, arch: ArchTier) -> Result<GeneratedCode> {
    let mut code = GeneratedCode::new(arch);
    generate_gemm_kernel(desc, &mut code)?;
    Ok(code)
}

/// Generates for the host tier, see [`ArchTier::host`].
pub fn generate_for_host(desc: &GemmDescriptor) -> Result<GeneratedCode> {
    generate(desc, ArchTier::host())
}

/// Bytes of scratch the caller must pass in `op.primary` under the extended ABI.
pub fn scratch_size(desc: &GemmDescriptor) -> usize {
    match desc.abi() {
        KernelAbi::Extended => ScratchLayout::of(desc).total(),
        _ => 0,
    }
}

fn load_params(code: &mut dyn InstructionEmitter, regs: &GpRegMapping, desc: &GemmDescriptor) {
    let Some(pb) = regs.param_block else { return };
    code.alu_reg(AluOp::Mov, GpRegMapping::first_argument(desc.call_conv()), pb);
    code.load_gp(Mem::disp(pb, GemmParam::A), regs.a);
    code.load_gp(Mem::disp(pb, GemmParam::B), regs.b);
    code.load_gp(Mem::disp(pb, GemmParam::C), regs.c);
    let optional = [
        (regs.reduce_count, GemmParam::COUNT),
        (regs.a_offsets, GemmParam::A_OFFSETS),
        (regs.b_offsets, GemmParam::B_OFFSETS),
        (regs.a_prefetch, GemmParam::A_PREFETCH),
        (regs.b_prefetch, GemmParam::B_PREFETCH),
        (regs.scale_factor, GemmParam::SCALE),
    ];
    for (reg, off) in optional {
        if let Some(reg) = reg {
            code.load_gp(Mem::disp(pb, off), reg);
        }
    }
}

fn emit_kernel(code: &mut dyn InstructionEmitter, desc: &GemmDescriptor, plan: &GemmPlan) {
    let regs = &plan.regs;
    let mut tracker = LoopLabelTracker::new();

    let saved = RegisterSaveScope::save(code, regs::callee_saved(desc.call_conv()));
    load_params(code, regs, desc);
    if let Some(count) = regs.reduce_count {
        // the count arrives by pointer
        code.load_gp(Mem::base(count), count);
    }

    let framed = frame::needs_frame(desc);
    if framed {
        frame::setup(code, regs, desc);
    }
    if let Some(cfg) = &plan.transpose {
        if desc.abi() == KernelAbi::Extended {
            frame::load_var(code, StackVar::TransposeBuffer, transpose::BUFFER);
        } else {
            transpose::alloc_stack_buffer(code, desc);
        }
        transpose::emit_transpose(code, &mut tracker, regs, desc, cfg);
    }
    if desc.vnni_c() && !desc.beta_zero() {
        frame::vnni_pass(code, &mut tracker, regs, desc, VnniDirection::Unpack);
    }

    let mut n_done = 0;
    for (nb, count) in plan.n_blocking.runs() {
        let n_end = n_done + nb * count;
        tracker.open(code, regs.nloop, n_done as i64, LoopBound::Imm(n_end as i64));
        for block in &plan.m_blocks {
            emit_m_block(code, &mut tracker, desc, plan, block, nb);
        }
        tile::footer_n(code, regs, desc, nb);
        tracker.close(code, regs.nloop, nb as i64);
        n_done = n_end;
    }

    if desc.vnni_c() {
        frame::vnni_pass(code, &mut tracker, regs, desc, VnniDirection::Pack);
    }
    if framed {
        frame::teardown(code);
    } else if plan.transpose.is_some() {
        transpose::release_stack_buffer(code, desc);
    }
    saved.restore(code);
    code.ret();
    tracker.finish(code);
}

fn emit_m_block(
    code: &mut dyn InstructionEmitter,
    tracker: &mut LoopLabelTracker,
    desc: &GemmDescriptor,
    plan: &GemmPlan,
    block: &MBlockPlan,
    n_blocking: usize,
) {
    let regs = &plan.regs;
    let step = block.step;
    let mb = step.blocking.size;
    let tile = Tile::new(block.config, *regs, desc, mb, n_blocking);
    let cfg = &tile.cfg;

    if cfg.use_masking_a_c && mb % cfg.vector_length != 0 {
        let bits = (1i64 << cfg.tail_lanes(mb)) - 1;
        code.alu_imm(AluOp::Mov, regs.help1, bits);
        code.mask_move(TAIL_MASK, regs.help1);
    }

    tracker.open(code, regs.mloop, step.start as i64, LoopBound::Imm(step.end as i64));
    tile::load_c(code, &tile, desc);
    let batched = desc.batch_reduce().is_active();
    if batched {
        batch::reduce_header(code, tracker, &tile, desc);
    }
    kloop::emit_k_loop(code, tracker, &tile, block.body, block.k_strategy, desc.k());
    if batched {
        batch::reduce_footer(code, tracker, &tile, desc);
    }
    tile::store_c(code, &tile, desc);
    tile::footer_m(code, regs, desc, mb);
    tracker.close(code, regs.mloop, mb as i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitgemm_base::{BatchReduce, CallConv};

    fn builder(m: usize, n: usize, k: usize, dt: Datatype) -> jitgemm_base::GemmDescriptorBuilder {
        GemmDescriptor::builder(m, n, k, dt).call_conv(CallConv::SysV)
    }

    #[test]
    fn abi_checks() {
        let d = builder(8, 8, 8, Datatype::F32).abi(KernelAbi::Extended).build().unwrap();
        assert_eq!(plan(&d, ArchTier::Sse42).unwrap_err(), GenError::UnsupportedArchitecture(ArchTier::Sse42));
        assert!(plan(&d, ArchTier::Avx).is_ok());

        let d = builder(8, 8, 8, Datatype::F64).abi(KernelAbi::Extended).build().unwrap();
        assert!(matches!(plan(&d, ArchTier::Avx512Core), Err(GenError::IllegalAbiCombination(_))));

        let d = builder(8, 7, 8, Datatype::Bf16).output(Datatype::Bf16).vnni_c(true).build().unwrap();
        assert!(matches!(plan(&d, ArchTier::Avx512Core), Err(GenError::IllegalAbiCombination(_))));

        let d = builder(8, 8, 8, Datatype::F32).post_op(PostOp::Relu).build().unwrap();
        assert!(matches!(plan(&d, ArchTier::Avx512Core), Err(GenError::IllegalAbiCombination(_))));

        let d = builder(8, 8, 8, Datatype::F32).trans_a(true).batch_reduce(BatchReduce::Address).build().unwrap();
        assert!(matches!(plan(&d, ArchTier::Avx2), Err(GenError::IllegalAbiCombination(_))));

        let d = builder(8, 8, 8, Datatype::I8).output(Datatype::I8).build().unwrap();
        assert!(matches!(plan(&d, ArchTier::Avx512Clx), Err(GenError::IllegalAbiCombination(_))));
    }

    #[test]
    fn architecture_is_checked_first() {
        let d = builder(8, 7, 8, Datatype::I16).abi(KernelAbi::Extended).trans_a(true).build().unwrap();
        assert_eq!(plan(&d, ArchTier::Reference).unwrap_err(), GenError::UnsupportedArchitecture(ArchTier::Reference));
        assert!(matches!(plan(&d, ArchTier::Avx512Core), Err(GenError::UnsupportedDatatype { .. })));
    }

    #[test]
    fn failed_generation_leaves_the_error_on_the_buffer() {
        let d = builder(8, 8, 8, Datatype::F32).build().unwrap();
        let mut code = GeneratedCode::new(ArchTier::Aarch64Neon);
        let err = generate_gemm_kernel(&d, &mut code).unwrap_err();
        assert_eq!(code.error(), Some(&err));
        assert!(code.is_empty());
    }

    #[test]
    fn small_tile_plan() {
        let d = builder(9, 10, 20, Datatype::F32).build().unwrap();
        let p = plan(&d, ArchTier::Avx512Core).unwrap();
        assert_eq!(p.n_blocking.runs().collect::<Vec<_>>(), [(10, 1)]);
        assert_eq!(p.m_blocks.len(), 1);
        assert!(p.m_blocks[0].config.use_masking_a_c);
        assert_eq!(p.m_blocks[0].k_strategy, KLoopStrategy::Unrolled);
    }

    #[test]
    fn scratch_only_for_the_extended_abi() {
        let d = builder(16, 8, 16, Datatype::F32).trans_a(true).build().unwrap();
        assert_eq!(scratch_size(&d), 0);
        let d = builder(16, 8, 16, Datatype::F32).trans_a(true).abi(KernelAbi::Extended).build().unwrap();
        assert_eq!(scratch_size(&d), 1024);
    }
}

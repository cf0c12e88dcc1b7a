use crate::error::{GenError, Result};
use crate::Datatype;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum BatchReduce {
    #[default]
    None,
    /// arrays of A and B pointers
    Address,
    /// base pointers plus arrays of byte offsets
    Offset,
    /// base pointers plus fixed byte strides `c1` (A) and `c2` (B)
    Stride,
}

impl BatchReduce {
    #[inline]
    pub fn is_active(self) -> bool {
        self != BatchReduce::None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Prefetch {
    #[default]
    None,
    AL2,
    BL2ViaC,
    AL2BL2ViaC,
}

impl Prefetch {
    pub fn prefetches_a(self) -> bool {
        matches!(self, Prefetch::AL2 | Prefetch::AL2BL2ViaC)
    }

    pub fn prefetches_b(self) -> bool {
        matches!(self, Prefetch::BL2ViaC | Prefetch::AL2BL2ViaC)
    }
}

/// Elementwise operation applied to the C tile before it is stored.
/// Only available through the extended ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum PostOp {
    #[default]
    None,
    /// adds `bias[m]` to every column
    BiasAdd,
    Relu,
    BiasAddRelu,
}

impl PostOp {
    pub fn has_bias(self) -> bool {
        matches!(self, PostOp::BiasAdd | PostOp::BiasAddRelu)
    }

    pub fn has_relu(self) -> bool {
        matches!(self, PostOp::Relu | PostOp::BiasAddRelu)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum KernelAbi {
    /// operands in argument registers
    #[default]
    Plain,
    /// one pointer to a [`GemmParam`]
    Struct,
    /// struct ABI plus a stack frame for fused elementwise operations
    Extended,
}

impl KernelAbi {
    pub fn uses_param_struct(self) -> bool {
        self != KernelAbi::Plain
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallConv {
    SysV,
    Win64,
}

impl CallConv {
    pub const fn host() -> CallConv {
        if cfg!(windows) {
            CallConv::Win64
        } else {
            CallConv::SysV
        }
    }
}

impl Default for CallConv {
    fn default() -> Self {
        CallConv::host()
    }
}

/// Immutable description of one column-major GEMM kernel `C = A*B (+ C)`.
///
/// `A` is `m x k` (stored `k x m` when `trans_a` is set), `B` is `k x n`,
/// `C` is `m x n`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GemmDescriptor {
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
    input: Datatype,
    output: Datatype,
    compute: Datatype,
    trans_a: bool,
    batch_reduce: BatchReduce,
    vnni_c: bool,
    abi: KernelAbi,
    call_conv: CallConv,
    prefetch: Prefetch,
    beta_zero: bool,
    post_op: PostOp,
    c1: i64,
    c2: i64,
}

impl GemmDescriptor {
    pub fn builder(m: usize, n: usize, k: usize, dt: Datatype) -> GemmDescriptorBuilder {
        GemmDescriptorBuilder::new(m, n, k, dt)
    }

    pub fn m(&self) -> usize {
        self.m
    }
    pub fn n(&self) -> usize {
        self.n
    }
    pub fn k(&self) -> usize {
        self.k
    }
    pub fn lda(&self) -> usize {
        self.lda
    }
    pub fn ldb(&self) -> usize {
        self.ldb
    }
    pub fn ldc(&self) -> usize {
        self.ldc
    }
    pub fn input(&self) -> Datatype {
        self.input
    }
    pub fn output(&self) -> Datatype {
        self.output
    }
    pub fn compute(&self) -> Datatype {
        self.compute
    }
    pub fn trans_a(&self) -> bool {
        self.trans_a
    }
    pub fn batch_reduce(&self) -> BatchReduce {
        self.batch_reduce
    }
    pub fn vnni_c(&self) -> bool {
        self.vnni_c
    }
    pub fn abi(&self) -> KernelAbi {
        self.abi
    }
    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }
    pub fn prefetch(&self) -> Prefetch {
        self.prefetch
    }
    pub fn beta_zero(&self) -> bool {
        self.beta_zero
    }
    pub fn post_op(&self) -> PostOp {
        self.post_op
    }
    /// Byte stride between consecutive A matrices in stride mode.
    pub fn c1(&self) -> i64 {
        self.c1
    }
    /// Byte stride between consecutive B matrices in stride mode.
    pub fn c2(&self) -> i64 {
        self.c2
    }
    /// 8-bit output is produced by scaling the 32-bit accumulator.
    pub fn has_scale_factor(&self) -> bool {
        self.output == Datatype::I8
    }
}

#[derive(Clone, Debug)]
pub struct GemmDescriptorBuilder {
    desc: GemmDescriptor,
    lda: Option<usize>,
    ldb: Option<usize>,
    ldc: Option<usize>,
}

impl GemmDescriptorBuilder {
    pub fn new(m: usize, n: usize, k: usize, dt: Datatype) -> Self {
        let desc = GemmDescriptor {
            m,
            n,
            k,
            lda: 0,
            ldb: 0,
            ldc: 0,
            input: dt,
            output: dt,
            compute: dt.default_compute(),
            trans_a: false,
            batch_reduce: BatchReduce::None,
            vnni_c: false,
            abi: KernelAbi::Plain,
            call_conv: CallConv::host(),
            prefetch: Prefetch::None,
            beta_zero: false,
            post_op: PostOp::None,
            c1: 0,
            c2: 0,
        };
        Self { desc, lda: None, ldb: None, ldc: None }
    }

    pub fn lda(mut self, lda: usize) -> Self {
        self.lda = Some(lda);
        self
    }
    pub fn ldb(mut self, ldb: usize) -> Self {
        self.ldb = Some(ldb);
        self
    }
    pub fn ldc(mut self, ldc: usize) -> Self {
        self.ldc = Some(ldc);
        self
    }
    pub fn output(mut self, dt: Datatype) -> Self {
        self.desc.output = dt;
        self
    }
    pub fn compute(mut self, dt: Datatype) -> Self {
        self.desc.compute = dt;
        self
    }
    pub fn trans_a(mut self, trans_a: bool) -> Self {
        self.desc.trans_a = trans_a;
        self
    }
    pub fn batch_reduce(mut self, mode: BatchReduce) -> Self {
        self.desc.batch_reduce = mode;
        self
    }
    /// Stride mode, byte strides for A and B.
    pub fn strides(mut self, c1: i64, c2: i64) -> Self {
        self.desc.batch_reduce = BatchReduce::Stride;
        self.desc.c1 = c1;
        self.desc.c2 = c2;
        self
    }
    pub fn vnni_c(mut self, vnni_c: bool) -> Self {
        self.desc.vnni_c = vnni_c;
        self
    }
    pub fn abi(mut self, abi: KernelAbi) -> Self {
        self.desc.abi = abi;
        self
    }
    pub fn call_conv(mut self, call_conv: CallConv) -> Self {
        self.desc.call_conv = call_conv;
        self
    }
    pub fn prefetch(mut self, prefetch: Prefetch) -> Self {
        self.desc.prefetch = prefetch;
        self
    }
    pub fn beta_zero(mut self, beta_zero: bool) -> Self {
        self.desc.beta_zero = beta_zero;
        self
    }
    pub fn post_op(mut self, post_op: PostOp) -> Self {
        self.desc.post_op = post_op;
        self
    }

    pub fn build(self) -> Result<GemmDescriptor> {
        let mut desc = self.desc;
        if desc.m == 0 || desc.n == 0 || desc.k == 0 {
            return Err(GenError::InvalidDescriptor(format!(
                "extents must be positive, got m={} n={} k={}",
                desc.m, desc.n, desc.k
            )));
        }
        // A is stored k x m when transposed
        let a_rows = if desc.trans_a { desc.k } else { desc.m };
        desc.lda = self.lda.unwrap_or(a_rows);
        desc.ldb = self.ldb.unwrap_or(desc.k);
        desc.ldc = self.ldc.unwrap_or(desc.m);
        if desc.lda < a_rows {
            return Err(GenError::InvalidDescriptor(format!("lda={} < {}", desc.lda, a_rows)));
        }
        if desc.ldb < desc.k {
            return Err(GenError::InvalidDescriptor(format!("ldb={} < k={}", desc.ldb, desc.k)));
        }
        if desc.ldc < desc.m {
            return Err(GenError::InvalidDescriptor(format!("ldc={} < m={}", desc.ldc, desc.m)));
        }
        if desc.batch_reduce != BatchReduce::Stride && (desc.c1 != 0 || desc.c2 != 0) {
            return Err(GenError::InvalidDescriptor("c1/c2 are only used by stride batch-reduce".to_string()));
        }
        Ok(desc)
    }
}

/// One operand group of the parameter block.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct GemmArg {
    pub primary: *mut u8,
    pub secondary: *mut u8,
    pub tertiary: *mut u8,
    pub quaternary: *mut u8,
}

impl Default for GemmArg {
    fn default() -> Self {
        Self {
            primary: core::ptr::null_mut(),
            secondary: core::ptr::null_mut(),
            tertiary: core::ptr::null_mut(),
            quaternary: core::ptr::null_mut(),
        }
    }
}

/// Parameter block passed by pointer under the struct and extended ABIs.
///
/// | field | meaning |
/// |---|---|
/// | `op.primary` | scratch block (extended ABI) |
/// | `op.tertiary` | pointer to the 64-bit batch count |
/// | `a.primary` / `b.primary` / `c.primary` | operands (arrays in address mode) |
/// | `a.secondary` / `b.secondary` | offset arrays (offset mode) |
/// | `a.quaternary` / `b.quaternary` | prefetch pointers |
/// | `c.tertiary` | scale factor for 8-bit output |
/// | `d.primary` | bias vector (extended ABI) |
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct GemmParam {
    pub op: GemmArg,
    pub a: GemmArg,
    pub b: GemmArg,
    pub c: GemmArg,
    pub d: GemmArg,
}

impl GemmParam {
    pub const SCRATCH: i32 = 0;
    pub const COUNT: i32 = 16;
    pub const A: i32 = 32;
    pub const A_OFFSETS: i32 = 40;
    pub const A_PREFETCH: i32 = 56;
    pub const B: i32 = 64;
    pub const B_OFFSETS: i32 = 72;
    pub const B_PREFETCH: i32 = 88;
    pub const C: i32 = 96;
    pub const SCALE: i32 = 112;
    pub const BIAS: i32 = 128;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let d = GemmDescriptor::builder(9, 10, 20, Datatype::F32).build().unwrap();
        assert_eq!((d.lda(), d.ldb(), d.ldc()), (9, 20, 9));
        assert_eq!(d.compute(), Datatype::F32);
        assert!(!d.beta_zero());
        assert_eq!(d.batch_reduce(), BatchReduce::None);

        let d = GemmDescriptor::builder(9, 10, 20, Datatype::F32).trans_a(true).build().unwrap();
        assert_eq!(d.lda(), 20);

        let d = GemmDescriptor::builder(4, 4, 4, Datatype::Bf16).build().unwrap();
        assert_eq!(d.compute(), Datatype::F32);
    }

    #[test]
    fn builder_rejects_bad_shapes() {
        let e = GemmDescriptor::builder(0, 1, 1, Datatype::F32).build().unwrap_err();
        assert!(matches!(e, GenError::InvalidDescriptor(_)));
        let e = GemmDescriptor::builder(8, 1, 1, Datatype::F32).lda(4).build().unwrap_err();
        assert!(matches!(e, GenError::InvalidDescriptor(_)));
        let e = GemmDescriptor::builder(8, 4, 6, Datatype::F32).ldb(5).build().unwrap_err();
        assert!(matches!(e, GenError::InvalidDescriptor(_)));
        let e = GemmDescriptor::builder(8, 4, 6, Datatype::F32).ldc(7).build().unwrap_err();
        assert!(matches!(e, GenError::InvalidDescriptor(_)));
    }

    #[test]
    fn param_block_layout() {
        let p = GemmParam::default();
        let base = &p as *const GemmParam as usize;
        let off = |addr: *const *mut u8| (addr as usize - base) as i32;
        assert_eq!(off(&p.op.primary), GemmParam::SCRATCH);
        assert_eq!(off(&p.op.tertiary), GemmParam::COUNT);
        assert_eq!(off(&p.a.primary), GemmParam::A);
        assert_eq!(off(&p.a.secondary), GemmParam::A_OFFSETS);
        assert_eq!(off(&p.a.quaternary), GemmParam::A_PREFETCH);
        assert_eq!(off(&p.b.primary), GemmParam::B);
        assert_eq!(off(&p.b.secondary), GemmParam::B_OFFSETS);
        assert_eq!(off(&p.b.quaternary), GemmParam::B_PREFETCH);
        assert_eq!(off(&p.c.primary), GemmParam::C);
        assert_eq!(off(&p.c.tertiary), GemmParam::SCALE);
        assert_eq!(off(&p.d.primary), GemmParam::BIAS);
        assert_eq!(core::mem::size_of::<GemmParam>(), 160);
    }
}

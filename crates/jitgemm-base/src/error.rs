use core::fmt;

use thiserror::Error;

use crate::{ArchTier, Datatype};

pub type Result<T> = std::result::Result<T, GenError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockDim {
    M,
    N,
}

impl fmt::Display for BlockDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDim::M => f.write_str("M"),
            BlockDim::N => f.write_str("N"),
        }
    }
}

/// Everything that can stop a kernel from being generated.
///
/// Errors are static configuration errors: the same descriptor on the same
/// tier always fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(ArchTier),

    #[error("unsupported datatype combination {input} -> {output} on {arch}")]
    UnsupportedDatatype { input: Datatype, output: Datatype, arch: ArchTier },

    #[error("illegal {0} blocking, register budget cannot hold a minimal tile")]
    IllegalBlocking(BlockDim),

    #[error("illegal ABI combination: {0}")]
    IllegalAbiCombination(&'static str),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("loop nesting error: {0}")]
    LoopNesting(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown architecture tier `{0}`")]
pub struct ParseArchTierError(pub String);

// This module defines error types for the x64gen backend using the thiserror crate for
// idiomatic Rust error handling. By the time this backend runs, the input program has
// already passed semantic validation, so every variant here is an internal-invariant
// violation rather than a user-facing diagnostic: a condition code requested for a
// non-relational operator, a spill request with every candidate register excluded, a
// parameter whose entry location was never recorded, or a global that was never
// declared in the program prologue. There is no recovery path; callers propagate these
// with `?` and the driver aborts code generation. The module also provides
// CodegenResult<T> as a convenience alias for Result<T, CodegenError>.

//! Error types for assembly generation.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use crate::ir::BinOp;
use crate::x64::regs::Reg;

/// Main error type for assembly lowering.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("operator {op} has no condition code")]
    NotAComparison { op: BinOp },

    #[error("no register available for spilling (avoid set: {avoid:?})")]
    NoSpillableRegister { avoid: Vec<Reg> },

    #[error("parameter {name} has no recorded argument location")]
    UnresolvedParameter { name: String },

    #[error("global {name} was never declared")]
    UndeclaredGlobal { name: String },
}

/// Result type alias for lowering operations.
pub type CodegenResult<T> = Result<T, CodegenError>;

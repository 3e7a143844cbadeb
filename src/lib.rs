//! x64gen - assembly emission for a small imperative language.
//!
//! This crate is the backend of the compiler: it takes the optimized,
//! register-allocated three-address IR produced by the upstream pipeline and
//! lowers it to textual x86-64 assembly for a System V style calling
//! convention (six integer argument registers, caller-pushed overflow
//! arguments, 16-byte-aligned frames). The allocator itself stays outside;
//! its decisions arrive through the read-only [`AllocationOracle`] trait.
//!
//! # Usage
//!
//! ```
//! use x64gen::ir::{Block, IrInst, IrValue, Method, Program};
//! use x64gen::AllocationMap;
//!
//! let program = Program::new(
//!     vec![],
//!     vec![Method::new(
//!         "main",
//!         vec![],
//!         vec![Block::entry(vec![IrInst::Return(Some(IrValue::int(0)))])],
//!     )],
//! );
//! let oracle = AllocationMap::new();
//! let text = x64gen::generate_assembly(&program, &oracle).unwrap();
//! assert!(text.contains("_main:"));
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - the three-address IR consumed read-only
//! - [`regalloc`] - the register-allocation oracle boundary
//! - [`x64`] - registers, operands, the resolver and the emitter
//! - [`error`] - internal-invariant failures

pub mod error;
pub mod ir;
pub mod regalloc;
pub mod x64;

pub use error::{CodegenError, CodegenResult};
pub use regalloc::{AllocationMap, AllocationOracle};
pub use x64::program::AsmProgram;
pub use x64::writer::AsmWriter;

/// Lower `program` to its final textual assembly.
pub fn generate_assembly(
    program: &ir::Program,
    oracle: &dyn AllocationOracle,
) -> CodegenResult<String> {
    Ok(AsmWriter::new(program, oracle).assemble()?.to_string())
}

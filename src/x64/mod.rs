//! x86-64 specific code.
//!
//! This module contains everything that knows about the target machine:
//! - Register enumeration and calling-convention partitions (`regs`)
//! - Concrete operands and their AT&T renderings (`operand`)
//! - Textual machine instructions (`inst`)
//! - The program/method output buffers (`program`)
//! - The value resolver (`resolver`) and the instruction emitter (`writer`)

pub mod inst;
pub mod operand;
pub mod program;
pub mod regs;
pub mod resolver;
pub mod writer;

pub use inst::{BinaryOp, CondCode, Inst, UnaryOp};
pub use operand::{Operand, RegOperand, StackOperand};
pub use program::{AsmMethod, AsmProgram};
pub use regs::{Reg, N_ARG_REGISTERS, WORD_SIZE};
pub use resolver::ValueResolver;
pub use writer::AsmWriter;

//! Textual machine-instruction lines.
//!
//! The emitter produces a flat list of these per method; rendering one line
//! yields one line of AT&T assembly. Register and stack operands carrying
//! debug tags render a trailing `#` comment naming the IR values involved,
//! matching the shape of hand-inspected compiler output.

use std::fmt;

use crate::ir::BinOp;
use crate::x64::operand::Operand;

/// Two-operand opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Movq,
    Movzbq,
    Addq,
    Subq,
    Imulq,
    Andq,
    Orq,
    Xorq,
    Xorl,
    Cmpq,
    Leaq,
}

impl BinaryOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            BinaryOp::Movq => "movq",
            BinaryOp::Movzbq => "movzbq",
            BinaryOp::Addq => "addq",
            BinaryOp::Subq => "subq",
            BinaryOp::Imulq => "imulq",
            BinaryOp::Andq => "andq",
            BinaryOp::Orq => "orq",
            BinaryOp::Xorq => "xorq",
            BinaryOp::Xorl => "xorl",
            BinaryOp::Cmpq => "cmpq",
            BinaryOp::Leaq => "leaq",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Single-operand opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Pushq,
    Popq,
    Negq,
    Idivq,
    /// `set<cc>` into a byte register.
    Set(CondCode),
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Pushq => write!(f, "pushq"),
            UnaryOp::Popq => write!(f, "popq"),
            UnaryOp::Negq => write!(f, "negq"),
            UnaryOp::Idivq => write!(f, "idivq"),
            UnaryOp::Set(cc) => write!(f, "set{}", cc.suffix()),
        }
    }
}

/// Condition codes for `set<cc>` and `j<cc>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCode {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
}

impl CondCode {
    pub fn suffix(&self) -> &'static str {
        match self {
            CondCode::E => "e",
            CondCode::Ne => "ne",
            CondCode::L => "l",
            CondCode::Le => "le",
            CondCode::G => "g",
            CondCode::Ge => "ge",
        }
    }

    /// The code that fires exactly when `self` does not.
    pub fn negate(&self) -> CondCode {
        match self {
            CondCode::E => CondCode::Ne,
            CondCode::Ne => CondCode::E,
            CondCode::L => CondCode::Ge,
            CondCode::Ge => CondCode::L,
            CondCode::Le => CondCode::G,
            CondCode::G => CondCode::Le,
        }
    }
}

/// Condition code of a relational operator, if it has one.
pub fn condition_code(op: BinOp) -> Option<CondCode> {
    match op {
        BinOp::Eq => Some(CondCode::E),
        BinOp::Neq => Some(CondCode::Ne),
        BinOp::Lt => Some(CondCode::L),
        BinOp::Gt => Some(CondCode::G),
        BinOp::Leq => Some(CondCode::Le),
        BinOp::Geq => Some(CondCode::Ge),
        _ => None,
    }
}

/// One line of emitted assembly.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Binary {
        op: BinaryOp,
        src: Operand,
        dst: Operand,
    },
    Unary {
        op: UnaryOp,
        operand: Operand,
    },
    /// Sign-extend rax into rdx:rax.
    Cqto,
    Ret,
    Call {
        symbol: String,
    },
    Jmp {
        target: String,
    },
    JumpIf {
        cc: CondCode,
        target: String,
    },
    /// `text:` line; the caller supplies any leading dot.
    Label(String),
    /// A raw directive or blank line, written as given.
    Directive(String),
}

impl Inst {
    pub fn mov(src: Operand, dst: Operand) -> Inst {
        Inst::Binary { op: BinaryOp::Movq, src, dst }
    }

    pub fn binary(op: BinaryOp, src: Operand, dst: Operand) -> Inst {
        Inst::Binary { op, src, dst }
    }

    pub fn unary(op: UnaryOp, operand: Operand) -> Inst {
        Inst::Unary { op, operand }
    }

    pub fn directive(text: &str) -> Inst {
        Inst::Directive(text.to_string())
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Binary { op, src, dst } => {
                write!(f, "\t{op}\t{src}, {dst}")?;
                match (src.tag(), dst.tag()) {
                    (Some(s), Some(d)) => write!(f, "\t\t# {op} {s} to {d}"),
                    (Some(t), None) | (None, Some(t)) => write!(f, "\t\t# {t}"),
                    (None, None) => Ok(()),
                }
            }
            Inst::Unary { op, operand } => {
                write!(f, "\t{op}\t{operand}")?;
                if let Some(t) = operand.tag() {
                    write!(f, "\t\t# {t}")?;
                }
                Ok(())
            }
            Inst::Cqto => write!(f, "\tcqto"),
            Inst::Ret => write!(f, "\tretq"),
            Inst::Call { symbol } => write!(f, "\tcallq\t{symbol}"),
            Inst::Jmp { target } => write!(f, "\tjmp\t.{target}"),
            Inst::JumpIf { cc, target } => write!(f, "\tj{}\t.{target}", cc.suffix()),
            Inst::Label(text) => write!(f, "{text}:"),
            Inst::Directive(text) => write!(f, "{text}"),
        }
    }
}

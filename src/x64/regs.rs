// This module enumerates the sixteen x86-64 integer registers and fixes their roles
// for the single calling convention this backend targets. The partitions are: six
// argument registers in the ABI-mandated order, four callee-saved registers the
// prologue preserves, the caller-saved set (which includes the result register and
// the scratch register), and exactly one scratch register (r10) that is reserved for
// instruction staging and never handed out by the register allocator. The spill
// preference order is used only by the resolver's spill heuristic, never by the
// external allocator. Everything here is a pure enumeration plus canonical text
// renderings for the 64-bit, 32-bit and 8-bit views of each register.

//! Physical register model.

use std::fmt;

/// Number of integer argument registers in the calling convention.
pub const N_ARG_REGISTERS: usize = 6;

/// Size of one stack word in bytes.
pub const WORD_SIZE: i32 = 8;

/// Round `n` up to the next 16-byte boundary.
pub fn round_up_16(n: i32) -> i32 {
    (n + 15) & !15
}

/// An x86-64 integer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    /// Argument-passing registers in ABI order.
    pub const ARGUMENT: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

    /// Registers the prologue must preserve.
    pub const CALLEE_SAVED: [Reg; 4] = [Reg::R12, Reg::R13, Reg::R14, Reg::R15];

    /// Registers a call may clobber.
    pub const CALLER_SAVED: [Reg; 9] = [
        Reg::R10,
        Reg::R11,
        Reg::Rdi,
        Reg::Rsi,
        Reg::Rdx,
        Reg::Rcx,
        Reg::R8,
        Reg::R9,
        Reg::Rax,
    ];

    /// Candidate order for the resolver's spill heuristic. The argument
    /// registers come last so forced values preferentially land in registers
    /// with no calling-convention role.
    pub const SPILL_PREFERENCE: [Reg; 11] = [
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
        Reg::Rdx,
        Reg::Rcx,
        Reg::R9,
        Reg::R8,
        Reg::Rsi,
        Reg::Rdi,
    ];

    /// Reserved for instruction staging; never assigned by the allocator and
    /// never live across an instruction boundary.
    pub const SCRATCH: Reg = Reg::R10;

    /// Return-value register.
    pub const RESULT: Reg = Reg::Rax;

    /// Holds the remainder after a divide.
    pub const REMAINDER: Reg = Reg::Rdx;

    /// Holds the dividend and the quotient around a divide.
    pub const QUOTIENT: Reg = Reg::Rax;

    /// Canonical 64-bit rendering, e.g. `%rax`.
    pub fn name(&self) -> &'static str {
        match self {
            Reg::Rax => "%rax",
            Reg::Rbx => "%rbx",
            Reg::Rcx => "%rcx",
            Reg::Rdx => "%rdx",
            Reg::Rsi => "%rsi",
            Reg::Rdi => "%rdi",
            Reg::Rsp => "%rsp",
            Reg::Rbp => "%rbp",
            Reg::R8 => "%r8",
            Reg::R9 => "%r9",
            Reg::R10 => "%r10",
            Reg::R11 => "%r11",
            Reg::R12 => "%r12",
            Reg::R13 => "%r13",
            Reg::R14 => "%r14",
            Reg::R15 => "%r15",
        }
    }

    /// 32-bit rendering, e.g. `%eax`.
    pub fn dword_name(&self) -> &'static str {
        match self {
            Reg::Rax => "%eax",
            Reg::Rbx => "%ebx",
            Reg::Rcx => "%ecx",
            Reg::Rdx => "%edx",
            Reg::Rsi => "%esi",
            Reg::Rdi => "%edi",
            Reg::Rsp => "%esp",
            Reg::Rbp => "%ebp",
            Reg::R8 => "%r8d",
            Reg::R9 => "%r9d",
            Reg::R10 => "%r10d",
            Reg::R11 => "%r11d",
            Reg::R12 => "%r12d",
            Reg::R13 => "%r13d",
            Reg::R14 => "%r14d",
            Reg::R15 => "%r15d",
        }
    }

    /// 8-bit rendering, e.g. `%al`.
    pub fn byte_name(&self) -> &'static str {
        match self {
            Reg::Rax => "%al",
            Reg::Rbx => "%bl",
            Reg::Rcx => "%cl",
            Reg::Rdx => "%dl",
            Reg::Rsi => "%sil",
            Reg::Rdi => "%dil",
            Reg::Rsp => "%spl",
            Reg::Rbp => "%bpl",
            Reg::R8 => "%r8b",
            Reg::R9 => "%r9b",
            Reg::R10 => "%r10b",
            Reg::R11 => "%r11b",
            Reg::R12 => "%r12b",
            Reg::R13 => "%r13b",
            Reg::R14 => "%r14b",
            Reg::R15 => "%r15b",
        }
    }

    pub fn is_caller_saved(&self) -> bool {
        Reg::CALLER_SAVED.contains(self)
    }

    pub fn is_callee_saved(&self) -> bool {
        Reg::CALLEE_SAVED.contains(self)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_register_order() {
        assert_eq!(
            Reg::ARGUMENT,
            [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9]
        );
    }

    #[test]
    fn test_scratch_is_never_allocatable() {
        assert!(!Reg::SPILL_PREFERENCE.contains(&Reg::SCRATCH));
        assert!(Reg::SCRATCH.is_caller_saved());
    }

    #[test]
    fn test_partitions_are_disjoint_where_required() {
        for reg in Reg::CALLEE_SAVED {
            assert!(!Reg::CALLER_SAVED.contains(&reg));
            assert!(!Reg::ARGUMENT.contains(&reg));
        }
        // The frame registers are never candidates for spilling.
        assert!(!Reg::SPILL_PREFERENCE.contains(&Reg::Rsp));
        assert!(!Reg::SPILL_PREFERENCE.contains(&Reg::Rbp));
    }

    #[test]
    fn test_renderings() {
        assert_eq!(Reg::Rax.name(), "%rax");
        assert_eq!(Reg::Rax.dword_name(), "%eax");
        assert_eq!(Reg::Rax.byte_name(), "%al");
        assert_eq!(Reg::R12.byte_name(), "%r12b");
        assert_eq!(Reg::Rsi.byte_name(), "%sil");
    }

    #[test]
    fn test_round_up_16() {
        assert_eq!(round_up_16(0), 0);
        assert_eq!(round_up_16(1), 16);
        assert_eq!(round_up_16(16), 16);
        assert_eq!(round_up_16(24), 32);
    }
}

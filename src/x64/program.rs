//! Assembly program builder.
//!
//! Emitted instructions accumulate per method in an index-addressable buffer
//! so the prologue can be spliced in at a recorded patch point after the
//! whole body has been generated. The program builder orders the data
//! section, the method bodies and the trailing directive into the final text.

use std::fmt;

use crate::x64::inst::Inst;

/// Instruction buffer for one method, supporting positional insertion.
#[derive(Debug, Default)]
pub struct AsmMethod {
    lines: Vec<Inst>,
}

impl AsmMethod {
    pub fn new() -> Self {
        AsmMethod { lines: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn push(&mut self, inst: Inst) {
        self.lines.push(inst);
    }

    pub fn extend(&mut self, insts: Vec<Inst>) {
        self.lines.extend(insts);
    }

    /// Splice `inst` in so it renders at position `index`.
    pub fn insert(&mut self, index: usize, inst: Inst) {
        self.lines.insert(index, inst);
    }

    pub fn lines(&self) -> &[Inst] {
        &self.lines
    }
}

impl fmt::Display for AsmMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// The whole output program: data section, methods, trailing directives.
#[derive(Debug, Default)]
pub struct AsmProgram {
    data: Vec<Inst>,
    methods: Vec<AsmMethod>,
    trailer: Vec<Inst>,
}

impl AsmProgram {
    pub fn new() -> Self {
        AsmProgram::default()
    }

    pub fn push_data(&mut self, inst: Inst) {
        self.data.push(inst);
    }

    pub fn add_method(&mut self, method: AsmMethod) {
        self.methods.push(method);
    }

    pub fn push_trailer(&mut self, inst: Inst) {
        self.trailer.push(inst);
    }

    pub fn methods(&self) -> &[AsmMethod] {
        &self.methods
    }
}

impl fmt::Display for AsmProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.data {
            writeln!(f, "{line}")?;
        }
        for method in &self.methods {
            write!(f, "{method}")?;
        }
        for line in &self.trailer {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

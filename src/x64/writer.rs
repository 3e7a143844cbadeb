// This module walks the scheduled instruction trace of each method exactly once and
// translates every IR instruction into one or more machine instructions, consulting
// the resolver for every operand. It owns the parts of lowering that are about the
// machine rather than about placement: calling-convention lowering (overflow argument
// slots, collision-free argument-register moves, caller save/restore), divide/modulo
// lowering around the fixed rax/rdx pair, comparison materialization with remembered
// operators so a following conditional branch can reuse the still-valid flags, and
// prologue/epilogue synthesis. The frame footprint is only known once the whole body
// has been generated, so the prologue is spliced in at a patch point recorded at
// method entry.

//! Method-by-method instruction emission.

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{BinOp, Block, BlockLabel, DataItem, IrInst, IrValue, Method, Program, UnOp};
use crate::regalloc::AllocationOracle;
use crate::x64::inst::{condition_code, BinaryOp, CondCode, Inst, UnaryOp};
use crate::x64::operand::{ImmOperand, Operand, RegOperand, RegWidth, StackOperand};
use crate::x64::program::{AsmMethod, AsmProgram};
use crate::x64::regs::{round_up_16, Reg, N_ARG_REGISTERS, WORD_SIZE};
use crate::x64::resolver::ValueResolver;

/// Lowers a whole program to textual assembly.
pub struct AsmWriter<'a> {
    program: &'a Program,
    oracle: &'a dyn AllocationOracle,
    resolver: ValueResolver<'a>,
    out: AsmProgram,

    current_method: String,
    /// Operator of the comparison whose flags are still valid, if any.
    last_comparison: Option<BinOp>,
    /// Where the frame-setup instructions get spliced in at method exit.
    patch_index: usize,
    inst_index: usize,
    text_marker_emitted: bool,
}

impl<'a> AsmWriter<'a> {
    pub fn new(program: &'a Program, oracle: &'a dyn AllocationOracle) -> Self {
        AsmWriter {
            program,
            oracle,
            resolver: ValueResolver::new(program, oracle),
            out: AsmProgram::new(),
            current_method: String::new(),
            last_comparison: None,
            patch_index: 0,
            inst_index: 0,
            text_marker_emitted: false,
        }
    }

    /// Lower the whole program and hand back the ordered output.
    pub fn assemble(mut self) -> CodegenResult<AsmProgram> {
        let program = self.program;
        self.emit_data_section(program);
        for method in &program.methods {
            let lowered = self.emit_method(method)?;
            self.out.add_method(lowered);
        }
        self.out
            .push_trailer(Inst::directive(".subsections_via_symbols"));
        Ok(self.out)
    }

    fn emit_data_section(&mut self, program: &Program) {
        self.out.push_data(Inst::directive(".data"));
        for item in &program.globals {
            match item {
                DataItem::Scalar { name, size } => {
                    self.out
                        .push_data(Inst::Directive(format!("\t.comm {name},{size},8")));
                }
                DataItem::Array { name, len } => {
                    self.out.push_data(Inst::Directive(format!(
                        "\t.comm {name},{},16",
                        len * WORD_SIZE as u64
                    )));
                }
                DataItem::StringConstant { label, content } => {
                    self.out.push_data(Inst::Label(label.clone()));
                    self.out
                        .push_data(Inst::Directive(format!("\t.string {content:?}")));
                }
            }
        }
        self.out.push_data(Inst::directive(""));
    }

    fn emit_method(&mut self, method: &Method) -> CodegenResult<AsmMethod> {
        let mut out = AsmMethod::new();
        self.current_method = method.name.clone();
        self.last_comparison = None;
        self.inst_index = 0;
        self.resolver.prepare_for_method(method);
        log::debug!(
            "lowering method {} ({} blocks, {} params)",
            method.name,
            method.blocks.len(),
            method.params.len()
        );

        self.emit_method_entry(method, &mut out)?;
        for block in &method.blocks {
            if let BlockLabel::Named(label) = &block.label {
                out.push(Inst::Label(format!(".{label}")));
            }
            self.emit_block(block, &mut out)?;
        }
        self.emit_method_exit(method, &mut out);
        Ok(out)
    }

    fn emit_method_entry(&mut self, method: &Method, out: &mut AsmMethod) -> CodegenResult<()> {
        if !self.text_marker_emitted {
            out.push(Inst::directive(".text"));
            self.text_marker_emitted = true;
        }
        if method.is_main() {
            out.push(Inst::directive(".global _main"));
            out.push(Inst::directive(".p2align  4, 0x90"));
            out.push(Inst::Label("_main".to_string()));
        } else {
            out.push(Inst::Label(method.name.clone()));
        }
        self.patch_index = out.len();
        // Park every parameter in its allocator-assigned location; the
        // resolver emits the moves out of the ABI entry locations.
        for param in &method.params {
            self.resolver.resolve(param, out)?;
        }
        Ok(())
    }

    fn emit_block(&mut self, block: &Block, out: &mut AsmMethod) -> CodegenResult<()> {
        for inst in &block.insts {
            self.resolver.set_instruction_index(self.inst_index);
            self.emit_instruction(inst, out)?;
            self.inst_index += 1;
        }
        Ok(())
    }

    fn emit_instruction(&mut self, inst: &IrInst, out: &mut AsmMethod) -> CodegenResult<()> {
        match inst {
            IrInst::Binary { op, lhs, rhs, dest } => self.lower_binary(*op, lhs, rhs, dest, out),
            IrInst::Unary { op, operand, dest } => self.lower_unary(*op, operand, dest, out),
            IrInst::Copy { src, dest } => self.lower_copy(src, dest, out),
            IrInst::GetAddress { dest, .. } => {
                // Materializes base/index staging at the right spot; the
                // operand itself is re-derived by later uses.
                self.resolver.resolve(dest, out)?;
                Ok(())
            }
            IrInst::Call { method, args, dest, external } => {
                self.lower_call(method, args, dest.as_ref(), *external, out)
            }
            IrInst::Return(value) => {
                if let Some(value) = value {
                    let operand = self.resolver.resolve(value, out)?;
                    out.push(Inst::mov(operand, Operand::reg(Reg::RESULT)));
                }
                Ok(())
            }
            IrInst::Branch { target } => {
                out.push(Inst::Jmp { target: target.clone() });
                Ok(())
            }
            IrInst::CondBranch { condition, target } => {
                self.lower_cond_branch(condition, target, out)
            }
            // Checked and raised upstream respectively.
            IrInst::BoundsCheck { .. } | IrInst::Trap { .. } => Ok(()),
        }
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &IrValue,
        rhs: &IrValue,
        dest: &IrValue,
        out: &mut AsmMethod,
    ) -> CodegenResult<()> {
        match op {
            BinOp::Add => self.lower_arithmetic(BinaryOp::Addq, lhs, rhs, dest, out),
            BinOp::Sub => self.lower_arithmetic(BinaryOp::Subq, lhs, rhs, dest, out),
            BinOp::Mul => self.lower_arithmetic(BinaryOp::Imulq, lhs, rhs, dest, out),
            BinOp::And => self.lower_arithmetic(BinaryOp::Andq, lhs, rhs, dest, out),
            BinOp::Or => self.lower_arithmetic(BinaryOp::Orq, lhs, rhs, dest, out),
            BinOp::Div | BinOp::Mod => self.lower_division(op, lhs, rhs, dest, out),
            BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Gt | BinOp::Leq | BinOp::Geq => {
                self.lower_comparison(op, lhs, rhs, dest, out)
            }
        }
    }

    fn lower_arithmetic(
        &mut self,
        opcode: BinaryOp,
        lhs: &IrValue,
        rhs: &IrValue,
        dest: &IrValue,
        out: &mut AsmMethod,
    ) -> CodegenResult<()> {
        let lhs_op = self.resolver.resolve(lhs, out)?;
        out.push(Inst::mov(lhs_op, Operand::reg(Reg::SCRATCH)));
        let rhs_op = self.resolver.resolve(rhs, out)?;
        out.push(Inst::binary(opcode, rhs_op, Operand::reg(Reg::SCRATCH)));
        let dest_op = self.resolver.resolve(dest, out)?;
        out.push(Inst::mov(Operand::reg(Reg::SCRATCH), dest_op));
        Ok(())
    }

    fn lower_division(
        &mut self,
        op: BinOp,
        lhs: &IrValue,
        rhs: &IrValue,
        dest: &IrValue,
        out: &mut AsmMethod,
    ) -> CodegenResult<()> {
        let dest_op = self.resolver.resolve(dest, out)?;
        // The divide clobbers the remainder register; preserve it unless the
        // destination is that very register.
        let dest_is_remainder =
            matches!(&dest_op, Operand::Register(home) if home.reg == Reg::REMAINDER);
        if !dest_is_remainder {
            let slot = self.resolver.temp_save_slot(Reg::REMAINDER);
            out.push(Inst::mov(Operand::reg(Reg::REMAINDER), Operand::Stack(slot)));
        }

        let lhs_op = self.resolver.resolve(lhs, out)?;
        out.push(Inst::mov(lhs_op, Operand::reg(Reg::QUOTIENT)));
        if matches!(rhs, IrValue::Int(_)) {
            // idiv takes no immediate operand.
            let rhs_op = self.resolver.resolve(rhs, out)?;
            out.push(Inst::mov(rhs_op, Operand::reg(Reg::SCRATCH)));
            out.push(Inst::Cqto);
            out.push(Inst::unary(UnaryOp::Idivq, Operand::reg(Reg::SCRATCH)));
        } else {
            out.push(Inst::Cqto);
            let rhs_op = self.resolver.resolve(rhs, out)?;
            out.push(Inst::unary(UnaryOp::Idivq, rhs_op));
        }

        let result = if matches!(op, BinOp::Mod) { Reg::REMAINDER } else { Reg::QUOTIENT };
        out.push(Inst::mov(Operand::reg(result), dest_op));
        if !dest_is_remainder {
            let slot = self.resolver.temp_save_slot(Reg::REMAINDER);
            out.push(Inst::mov(Operand::Stack(slot), Operand::reg(Reg::REMAINDER)));
        }
        Ok(())
    }

    fn lower_comparison(
        &mut self,
        op: BinOp,
        lhs: &IrValue,
        rhs: &IrValue,
        dest: &IrValue,
        out: &mut AsmMethod,
    ) -> CodegenResult<()> {
        self.last_comparison = Some(op);
        let lhs_op = self.resolver.resolve(lhs, out)?;
        out.push(Inst::mov(lhs_op, Operand::reg(Reg::SCRATCH)));
        let rhs_op = self.resolver.resolve(rhs, out)?;
        out.push(Inst::binary(BinaryOp::Cmpq, rhs_op, Operand::reg(Reg::SCRATCH)));
        out.push(Inst::unary(
            UnaryOp::Set(cc_for(op)?),
            Operand::Register(RegOperand::byte(Reg::RESULT)),
        ));
        out.push(Inst::binary(
            BinaryOp::Movzbq,
            Operand::Register(RegOperand::byte(Reg::RESULT)),
            Operand::reg(Reg::SCRATCH),
        ));
        let dest_op = self.resolver.resolve(dest, out)?;
        out.push(Inst::mov(Operand::reg(Reg::SCRATCH), dest_op));
        Ok(())
    }

    fn lower_unary(
        &mut self,
        op: UnOp,
        operand: &IrValue,
        dest: &IrValue,
        out: &mut AsmMethod,
    ) -> CodegenResult<()> {
        match op {
            UnOp::Not => {
                // The xor invalidates any remembered comparison.
                self.last_comparison = None;
                let src = self.resolver.resolve(operand, out)?;
                out.push(Inst::mov(src, Operand::reg(Reg::SCRATCH)));
                let dest_op = self.resolver.resolve(dest, out)?;
                out.push(Inst::mov(Operand::reg(Reg::SCRATCH), dest_op.clone()));
                out.push(Inst::binary(
                    BinaryOp::Xorq,
                    Operand::Imm(ImmOperand::Int(1)),
                    dest_op,
                ));
            }
            UnOp::Neg => {
                let src = self.resolver.resolve(operand, out)?;
                out.push(Inst::mov(src, Operand::reg(Reg::SCRATCH)));
                out.push(Inst::unary(UnaryOp::Negq, Operand::reg(Reg::SCRATCH)));
                let dest_op = self.resolver.resolve(dest, out)?;
                out.push(Inst::mov(Operand::reg(Reg::SCRATCH), dest_op));
            }
        }
        Ok(())
    }

    fn lower_copy(&mut self, src: &IrValue, dest: &IrValue, out: &mut AsmMethod) -> CodegenResult<()> {
        let src_op = self.resolver.resolve(src, out)?;
        let dest_op = self.resolver.resolve(dest, out)?;
        if src_op == dest_op {
            return Ok(());
        }
        // Registers, immediates and computed addresses move directly, except
        // where that would pair two memory operands; everything else stages
        // through scratch.
        let direct = matches!(
            src_op,
            Operand::Register(_) | Operand::Imm(_) | Operand::Address(_)
        ) && !(src_op.is_memory() && dest_op.is_memory());
        if direct {
            out.push(Inst::mov(src_op, dest_op));
        } else {
            out.push(Inst::mov(src_op, Operand::reg(Reg::SCRATCH)));
            out.push(Inst::mov(Operand::reg(Reg::SCRATCH), dest_op));
        }
        Ok(())
    }

    fn lower_cond_branch(
        &mut self,
        condition: &IrValue,
        target: &str,
        out: &mut AsmMethod,
    ) -> CodegenResult<()> {
        let cond_op = self.resolver.resolve(condition, out)?;
        if let Some(op) = self.last_comparison.take() {
            // The comparison's flags are still valid; branch on the negated
            // condition without re-comparing.
            out.push(Inst::JumpIf {
                cc: cc_for(op)?.negate(),
                target: target.to_string(),
            });
            return Ok(());
        }
        if matches!(condition, IrValue::Int(_)) {
            // cmp cannot take the immediate in this position.
            out.push(Inst::mov(cond_op, Operand::reg(Reg::SCRATCH)));
            out.push(Inst::binary(
                BinaryOp::Cmpq,
                Operand::Imm(ImmOperand::Int(0)),
                Operand::reg(Reg::SCRATCH),
            ));
        } else {
            out.push(Inst::binary(
                BinaryOp::Cmpq,
                Operand::Imm(ImmOperand::Int(0)),
                cond_op,
            ));
        }
        out.push(Inst::JumpIf { cc: CondCode::E, target: target.to_string() });
        Ok(())
    }

    fn lower_call(
        &mut self,
        name: &str,
        args: &[IrValue],
        dest: Option<&IrValue>,
        external: bool,
        out: &mut AsmMethod,
    ) -> CodegenResult<()> {
        let dest_op = match dest {
            Some(dest) => Some(self.resolver.resolve(dest, out)?),
            None => None,
        };
        self.caller_save(dest_op.as_ref(), out);
        self.schedule_arguments(args, out)?;
        if external {
            // Variadic-safe external calls expect a zeroed low result register.
            out.push(Inst::binary(
                BinaryOp::Xorl,
                Operand::Register(RegOperand::dword(Reg::RESULT)),
                Operand::Register(RegOperand::dword(Reg::RESULT)),
            ));
        }
        out.push(Inst::Call { symbol: call_symbol(name, external) });
        if let Some(dest_op) = &dest_op {
            out.push(Inst::mov(Operand::reg(Reg::RESULT), dest_op.clone()));
        }
        if args.len() > N_ARG_REGISTERS {
            let space = overflow_space(args.len());
            out.push(Inst::binary(
                BinaryOp::Addq,
                Operand::Imm(ImmOperand::Int(space as i64)),
                Operand::reg(Reg::Rsp),
            ));
        }
        self.caller_restore(dest_op.as_ref(), out);
        Ok(())
    }

    /// Place every argument per the calling convention without clobbering
    /// any source a later move still reads.
    fn schedule_arguments(&mut self, args: &[IrValue], out: &mut AsmMethod) -> CodegenResult<()> {
        if args.len() > N_ARG_REGISTERS {
            let space = overflow_space(args.len());
            out.push(Inst::binary(
                BinaryOp::Subq,
                Operand::Imm(ImmOperand::Int(space as i64)),
                Operand::reg(Reg::Rsp),
            ));
            for (position, arg) in args.iter().enumerate().skip(N_ARG_REGISTERS) {
                let slot = Operand::Stack(StackOperand::new(
                    Reg::Rsp,
                    (position - N_ARG_REGISTERS) as i32 * WORD_SIZE,
                ));
                // The slot is memory, so memory-resident sources (stack
                // slots, globals, computed addresses, string labels) must
                // stage through scratch.
                let src = self.resolver.resolve(arg, out)?;
                if src.is_memory() {
                    let opcode = if src.is_string_constant() { BinaryOp::Leaq } else { BinaryOp::Movq };
                    out.push(Inst::binary(opcode, src, Operand::reg(Reg::SCRATCH)));
                    out.push(Inst::mov(Operand::reg(Reg::SCRATCH), slot));
                } else {
                    out.push(Inst::mov(src, slot));
                }
            }
        }

        let count = args.len().min(N_ARG_REGISTERS);
        let dests = &Reg::ARGUMENT[..count];
        let mut resolved = Vec::with_capacity(count);
        let mut preps: Vec<Option<Vec<Inst>>> = Vec::with_capacity(count);
        for arg in &args[..count] {
            let (operand, prep) = self.resolver.resolve_deferred(arg)?;
            resolved.push(operand);
            preps.push(Some(prep));
        }

        // An argument sourced from a later destination register would be
        // clobbered before its move; park it in a fresh slot first.
        for i in 0..count {
            let later = &dests[i + 1..];
            let collides = resolved[i]
                .registers_in_use()
                .iter()
                .any(|reg| later.contains(reg));
            if !collides {
                continue;
            }
            if let Some(prep) = preps[i].take() {
                out.extend(prep);
            }
            let slot = self.resolver.fresh_stack_slot();
            if matches!(resolved[i], Operand::Address(_)) {
                out.push(Inst::mov(resolved[i].clone(), Operand::reg(Reg::SCRATCH)));
                out.push(Inst::mov(Operand::reg(Reg::SCRATCH), Operand::Stack(slot.clone())));
            } else {
                out.push(Inst::mov(resolved[i].clone(), Operand::Stack(slot.clone())));
            }
            log::trace!("pre-staged call argument {i} into {slot}");
            resolved[i] = Operand::Stack(slot);
        }

        // Reverse order: every destination register is written only after
        // all later arguments have read their sources.
        for i in (0..count).rev() {
            if let Some(prep) = preps[i].take() {
                out.extend(prep);
            }
            let dst = Operand::Register(RegOperand {
                reg: dests[i],
                width: RegWidth::Qword,
                tag: resolved[i].tag().map(str::to_string),
            });
            let opcode = if resolved[i].is_string_constant() { BinaryOp::Leaq } else { BinaryOp::Movq };
            out.push(Inst::binary(opcode, resolved[i].clone(), dst));
        }
        Ok(())
    }

    fn caller_save(&mut self, result: Option<&Operand>, out: &mut AsmMethod) {
        let live = self
            .oracle
            .live_registers_across(&self.current_method, self.inst_index);
        for reg in Reg::CALLER_SAVED {
            if !live.contains(&reg) {
                continue;
            }
            if let Some(Operand::Register(home)) = result {
                // The call result lands here anyway.
                if home.reg == reg {
                    continue;
                }
            }
            let slot = self.resolver.temp_save_slot(reg);
            out.push(Inst::mov(Operand::reg(reg), Operand::Stack(slot)));
        }
    }

    fn caller_restore(&mut self, result: Option<&Operand>, out: &mut AsmMethod) {
        let live = self
            .oracle
            .live_registers_across(&self.current_method, self.inst_index);
        for reg in Reg::CALLER_SAVED {
            if !live.contains(&reg) {
                continue;
            }
            if let Some(Operand::Register(home)) = result {
                if home.reg == reg {
                    continue;
                }
            }
            let slot = self.resolver.temp_save_slot(reg);
            out.push(Inst::mov(Operand::Stack(slot), Operand::reg(reg)));
        }
    }

    /// Splice the frame setup in at the patch point and close the method.
    fn emit_method_exit(&mut self, method: &Method, out: &mut AsmMethod) {
        let footprint = round_up_16(-self.resolver.current_stack_offset());
        let patch = self.patch_index;
        out.insert(
            patch,
            Inst::binary(
                BinaryOp::Subq,
                Operand::Imm(ImmOperand::Int(footprint as i64)),
                Operand::reg(Reg::Rsp),
            ),
        );
        for reg in Reg::CALLEE_SAVED {
            out.insert(patch, Inst::unary(UnaryOp::Pushq, Operand::reg(reg)));
        }
        out.insert(patch, Inst::mov(Operand::reg(Reg::Rsp), Operand::reg(Reg::Rbp)));
        out.insert(patch, Inst::unary(UnaryOp::Pushq, Operand::reg(Reg::Rbp)));

        if method.is_main() {
            out.push(Inst::binary(
                BinaryOp::Xorl,
                Operand::Register(RegOperand::dword(Reg::RESULT)),
                Operand::Register(RegOperand::dword(Reg::RESULT)),
            ));
        }
        out.push(Inst::binary(
            BinaryOp::Addq,
            Operand::Imm(ImmOperand::Int(footprint as i64)),
            Operand::reg(Reg::Rsp),
        ));
        for reg in Reg::CALLEE_SAVED {
            out.push(Inst::unary(UnaryOp::Popq, Operand::reg(reg)));
        }
        out.push(Inst::mov(Operand::reg(Reg::Rbp), Operand::reg(Reg::Rsp)));
        out.push(Inst::unary(UnaryOp::Popq, Operand::reg(Reg::Rbp)));
        out.push(Inst::Ret);
    }
}

fn cc_for(op: BinOp) -> CodegenResult<CondCode> {
    condition_code(op).ok_or(CodegenError::NotAComparison { op })
}

fn call_symbol(name: &str, external: bool) -> String {
    if external || name == "main" {
        format!("_{name}")
    } else {
        name.to_string()
    }
}

fn overflow_space(arg_count: usize) -> i32 {
    round_up_16((arg_count - N_ARG_REGISTERS) as i32 * WORD_SIZE)
}

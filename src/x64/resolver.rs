// This module maps every abstract IR value appearing in an instruction to a concrete
// physical operand, and owns all per-method placement bookkeeping: the mutable copy of
// the allocator's register placements, the permanent stack offsets of spilled values,
// the parameters' initial ABI locations (consumed once each), the cached temporary
// save slots, and the monotonically decreasing stack cursor. Resolution can require
// corrective instructions (parameter localization moves, spill/rebind moves, global
// address loads); these are buffered and either committed to the current method's
// instruction list or handed back to the caller, so querying a resolution never
// lengthens the emitted stream by itself. The spill-selection procedure relocates the
// register-resident values with the fewest live occupants when a computed address
// needs a register, consulting the allocation oracle for liveness.

//! IR value resolution and per-method placement state.

use hashbrown::HashMap;

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{DataItem, IrValue, Method, Program};
use crate::regalloc::AllocationOracle;
use crate::x64::inst::{BinaryOp, Inst};
use crate::x64::operand::{
    AddressBase, AddressIndex, AddressOperand, GlobalOperand, ImmOperand, Operand, RegOperand,
    StackOperand,
};
use crate::x64::program::AsmMethod;
use crate::x64::regs::{round_up_16, Reg, N_ARG_REGISTERS, WORD_SIZE};

/// Resolves IR values to physical operands for one program.
///
/// Program-wide caches (constants, global scalars) live for the whole run;
/// everything else is re-initialized by [`prepare_for_method`].
///
/// [`prepare_for_method`]: ValueResolver::prepare_for_method
pub struct ValueResolver<'a> {
    oracle: &'a dyn AllocationOracle,

    /// Interned constant operands, one per distinct constant.
    constants: HashMap<IrValue, Operand>,
    /// Global scalar operands, seeded from the program prologue.
    globals: HashMap<IrValue, Operand>,

    /// Values currently resident in a register. Seeded lazily from the
    /// oracle, rebound only by the spill procedure.
    register_mapped: HashMap<IrValue, RegOperand>,
    /// Permanent frame offsets of spilled values and stack arrays.
    stack_offsets: HashMap<IrValue, i32>,
    /// Each parameter's ABI entry location, consumed on first resolution.
    initial_args: HashMap<IrValue, Operand>,
    /// Cached save slots for caller-save and divide lowering, per register.
    temp_slots: HashMap<Reg, i32>,

    /// Most negative offset ever reached, per method.
    high_water: HashMap<String, i32>,
    stack_offset: i32,
    method: String,
    inst_index: usize,

    /// Buffered corrective instructions for the resolution in progress.
    prep: Vec<Inst>,
}

impl<'a> ValueResolver<'a> {
    pub fn new(program: &Program, oracle: &'a dyn AllocationOracle) -> Self {
        let mut constants = HashMap::new();
        let mut globals = HashMap::new();
        for item in &program.globals {
            match item {
                DataItem::Scalar { name, .. } => {
                    globals.insert(
                        IrValue::GlobalScalar { name: name.clone() },
                        Operand::Global(GlobalOperand { symbol: name.clone() }),
                    );
                }
                DataItem::StringConstant { label, content } => {
                    constants.insert(
                        IrValue::Str {
                            label: label.clone(),
                            content: content.clone(),
                        },
                        Operand::Imm(ImmOperand::Str { label: label.clone() }),
                    );
                }
                // Global arrays resolve through their allocator-assigned
                // address register, nothing to intern.
                DataItem::Array { .. } => {}
            }
        }
        ValueResolver {
            oracle,
            constants,
            globals,
            register_mapped: HashMap::new(),
            stack_offsets: HashMap::new(),
            initial_args: HashMap::new(),
            temp_slots: HashMap::new(),
            high_water: HashMap::new(),
            stack_offset: 0,
            method: String::new(),
            inst_index: 0,
            prep: Vec::new(),
        }
    }

    /// Reset per-method state. The stack cursor resumes from the largest
    /// offset previously reached for this method so re-lowering never
    /// aliases earlier slots.
    pub fn prepare_for_method(&mut self, method: &Method) {
        self.method = method.name.clone();
        self.stack_offset = self.high_water.get(&method.name).copied().unwrap_or(0);
        self.register_mapped.clear();
        self.stack_offsets.clear();
        self.initial_args.clear();
        self.temp_slots.clear();
        self.inst_index = 0;
        for (i, param) in method.params.iter().enumerate() {
            let initial = if i < N_ARG_REGISTERS {
                Operand::Register(RegOperand::tagged(Reg::ARGUMENT[i], param))
            } else {
                // Past the return address and the saved frame pointer.
                let offset = WORD_SIZE * (i - N_ARG_REGISTERS) as i32 + 2 * WORD_SIZE;
                Operand::Stack(StackOperand::tagged(Reg::Rbp, offset, param))
            };
            self.initial_args.insert(param.clone(), initial);
        }
    }

    /// Tell the resolver which trace instruction is being lowered; liveness
    /// queries for spill selection are keyed on it.
    pub fn set_instruction_index(&mut self, inst: usize) {
        self.inst_index = inst;
    }

    /// Resolve `value`, committing any corrective instructions to `out`.
    pub fn resolve(&mut self, value: &IrValue, out: &mut AsmMethod) -> CodegenResult<Operand> {
        let (operand, prep) = self.resolve_deferred(value)?;
        out.extend(prep);
        Ok(operand)
    }

    /// Resolve `value` and return the corrective instructions for the caller
    /// to place. Used when their ordering relative to other setup matters,
    /// e.g. call argument lowering.
    pub fn resolve_deferred(&mut self, value: &IrValue) -> CodegenResult<(Operand, Vec<Inst>)> {
        self.prep.clear();
        let operand = self.resolve_internal(value)?;
        Ok((operand, std::mem::take(&mut self.prep)))
    }

    fn resolve_internal(&mut self, value: &IrValue) -> CodegenResult<Operand> {
        if self.initial_args.contains_key(value) {
            return self.localize_argument(value);
        }
        match value {
            IrValue::Int(v) => Ok(self.intern_constant(value, ImmOperand::Int(*v))),
            IrValue::Str { label, .. } => {
                Ok(self.intern_constant(value, ImmOperand::Str { label: label.clone() }))
            }
            IrValue::GlobalScalar { name } => self
                .globals
                .get(value)
                .cloned()
                .ok_or_else(|| CodegenError::UndeclaredGlobal { name: name.clone() }),
            IrValue::StackArray { len, .. } => {
                Ok(Operand::Stack(self.stack_array_slot(value, *len)))
            }
            IrValue::MemoryAddress { base, index } => {
                let base = (**base).clone();
                let index = (**index).clone();
                self.resolve_memory_address(&base, &index)
            }
            IrValue::Register { .. } | IrValue::GlobalArray { .. } => Ok(self.resolve_local(value)),
        }
    }

    fn intern_constant(&mut self, value: &IrValue, imm: ImmOperand) -> Operand {
        self.constants
            .entry(value.clone())
            .or_insert(Operand::Imm(imm))
            .clone()
    }

    /// Register-mapped or spilled temporaries, parameters and global-array
    /// address registers. A value the oracle never placed is spilled and
    /// gets its permanent offset on first encounter.
    fn resolve_local(&mut self, value: &IrValue) -> Operand {
        if let Some(&offset) = self.stack_offsets.get(value) {
            return Operand::Stack(StackOperand::tagged(Reg::Rbp, offset, value));
        }
        if let Some(home) = self.register_mapped.get(value) {
            return Operand::Register(home.clone());
        }
        if let Some(reg) = self.oracle.assigned_register(&self.method, value) {
            let home = RegOperand::tagged(reg, value);
            self.register_mapped.insert(value.clone(), home.clone());
            return Operand::Register(home);
        }
        let offset = self.push_stack();
        self.stack_offsets.insert(value.clone(), offset);
        log::trace!("assigned spill slot {offset} to {value}");
        Operand::Stack(StackOperand::tagged(Reg::Rbp, offset, value))
    }

    /// First resolution of a parameter: move it from its ABI entry location
    /// into the allocator's placement and forget the entry location.
    fn localize_argument(&mut self, value: &IrValue) -> CodegenResult<Operand> {
        let initial = match self.initial_args.remove(value) {
            Some(operand) => operand,
            None => {
                return Err(CodegenError::UnresolvedParameter { name: value.to_string() });
            }
        };
        let localized = self.resolve_local(value);
        if localized != initial {
            if initial.is_memory() && localized.is_memory() {
                self.prep.push(Inst::mov(initial, Operand::reg(Reg::SCRATCH)));
                self.prep
                    .push(Inst::mov(Operand::reg(Reg::SCRATCH), localized.clone()));
            } else {
                self.prep.push(Inst::mov(initial, localized.clone()));
            }
            log::trace!("localized parameter {value}");
        }
        Ok(localized)
    }

    fn resolve_memory_address(&mut self, base: &IrValue, index: &IrValue) -> CodegenResult<Operand> {
        let resolved_index = self.resolve_internal(index)?;
        let index_part = match resolved_index {
            Operand::Register(home) => AddressIndex::Reg(home),
            Operand::Imm(ImmOperand::Int(v)) if !base.is_global() => AddressIndex::Int(v),
            _ => {
                // The index must sit in a register; try not to take the one
                // the base already lives in.
                let mut avoid = Vec::new();
                if let Some(reg) = self.current_register_of(base) {
                    avoid.push(reg);
                }
                let reg = self.select_spill_register(index, &avoid)?;
                AddressIndex::Reg(RegOperand::tagged(reg, index))
            }
        };

        if let IrValue::StackArray { len, .. } = base {
            let slot = self.stack_array_slot(base, *len);
            return Ok(Operand::Address(AddressOperand {
                base: AddressBase::Stack(slot),
                index: index_part,
            }));
        }

        let resolved_base = self.resolve_internal(base)?;
        let base_part = match resolved_base {
            Operand::Register(home) => home,
            _ => {
                let avoid = match &index_part {
                    AddressIndex::Reg(home) => vec![home.reg],
                    AddressIndex::Int(_) => Vec::new(),
                };
                let reg = self.select_spill_register(base, &avoid)?;
                RegOperand::tagged(reg, base)
            }
        };
        if let IrValue::GlobalArray { name, .. } = base {
            self.prep.push(Inst::binary(
                BinaryOp::Leaq,
                Operand::Global(GlobalOperand { symbol: name.clone() }),
                Operand::Register(base_part.clone()),
            ));
        }
        Ok(Operand::Address(AddressOperand {
            base: AddressBase::Reg(base_part),
            index: index_part,
        }))
    }

    /// Where `value` currently lives, register-wise: the resolver's own
    /// (possibly rebound) mapping first, the oracle's placement otherwise.
    fn current_register_of(&self, value: &IrValue) -> Option<Reg> {
        if self.stack_offsets.contains_key(value) {
            return None;
        }
        if let Some(home) = self.register_mapped.get(value) {
            return Some(home.reg);
        }
        self.oracle.assigned_register(&self.method, value)
    }

    /// Free a register for `forced` and rebind `forced` into it.
    ///
    /// Among the registers not in `avoid`, the one backing the fewest values
    /// live across the current instruction wins; its occupants move to fresh
    /// permanent stack slots first.
    fn select_spill_register(&mut self, forced: &IrValue, avoid: &[Reg]) -> CodegenResult<Reg> {
        let live = if matches!(forced, IrValue::Int(_)) {
            Vec::new()
        } else {
            self.oracle.live_values_across(&self.method, self.inst_index)
        };
        let mut occupants: HashMap<Reg, Vec<IrValue>> = HashMap::new();
        for value in live {
            if let Some(reg) = self.current_register_of(&value) {
                occupants.entry(reg).or_default().push(value);
            }
        }

        let mut chosen = None;
        let mut fewest = usize::MAX;
        for reg in Reg::SPILL_PREFERENCE {
            if avoid.contains(&reg) {
                continue;
            }
            let count = occupants.get(&reg).map_or(0, Vec::len);
            if count < fewest {
                fewest = count;
                chosen = Some(reg);
            }
        }
        let Some(reg) = chosen else {
            return Err(CodegenError::NoSpillableRegister { avoid: avoid.to_vec() });
        };

        if let Some(evicted) = occupants.remove(&reg) {
            for value in evicted {
                let offset = self.push_stack();
                self.prep.push(Inst::mov(
                    Operand::Register(RegOperand::tagged(reg, &value)),
                    Operand::Stack(StackOperand::tagged(Reg::Rbp, offset, &value)),
                ));
                self.register_mapped.remove(&value);
                self.stack_offsets.insert(value.clone(), offset);
                log::trace!("spilled {value} from {reg} to offset {offset}");
            }
        }

        let old_home = self.resolve_internal(forced)?;
        let new_home = RegOperand::tagged(reg, forced);
        self.prep
            .push(Inst::mov(old_home, Operand::Register(new_home.clone())));
        self.register_mapped.remove(forced);
        self.stack_offsets.remove(forced);
        self.register_mapped.insert(forced.clone(), new_home);
        log::trace!("forced {forced} into {reg}");
        Ok(reg)
    }

    fn stack_array_slot(&mut self, value: &IrValue, len: u64) -> StackOperand {
        if let Some(&offset) = self.stack_offsets.get(value) {
            return StackOperand::tagged(Reg::Rbp, offset, value);
        }
        // The block spans `len` words, rounded out to a 16-byte boundary.
        self.stack_offset -= WORD_SIZE * len as i32;
        let offset = -round_up_16(-self.stack_offset);
        self.stack_offset = offset;
        self.note_high_water();
        self.stack_offsets.insert(value.clone(), offset);
        StackOperand::tagged(Reg::Rbp, offset, value)
    }

    /// Whether `value` currently resolves to a frame slot.
    pub fn is_stack_mapped(&self, value: &IrValue) -> bool {
        self.stack_offsets.contains_key(value)
    }

    /// The cached temporary save slot preserving `reg`, allocated on first
    /// use and reused for the rest of the method.
    pub fn temp_save_slot(&mut self, reg: Reg) -> StackOperand {
        if let Some(&offset) = self.temp_slots.get(&reg) {
            return StackOperand::new(Reg::Rbp, offset);
        }
        let offset = self.push_stack();
        self.temp_slots.insert(reg, offset);
        StackOperand::new(Reg::Rbp, offset)
    }

    /// A fresh, uncached frame slot.
    pub fn fresh_stack_slot(&mut self) -> StackOperand {
        let offset = self.push_stack();
        StackOperand::new(Reg::Rbp, offset)
    }

    fn push_stack(&mut self) -> i32 {
        self.stack_offset -= WORD_SIZE;
        self.note_high_water();
        self.stack_offset
    }

    fn note_high_water(&mut self) {
        let entry = self.high_water.entry(self.method.clone()).or_insert(0);
        if self.stack_offset < *entry {
            *entry = self.stack_offset;
        }
    }

    /// The current cursor; the frame footprint is its rounded magnitude.
    pub fn current_stack_offset(&self) -> i32 {
        self.stack_offset
    }
}

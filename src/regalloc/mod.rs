// This module is the boundary between the backend and the register allocator. The
// backend never sees how allocation was computed (graph coloring, linear scan, ...);
// it consumes the result through the read-only AllocationOracle trait: the physical
// register assigned to a value (absence meaning spilled), the physical registers
// holding values live across an instruction (driving caller-save decisions), and the
// IR values whose live range covers an instruction (driving the resolver's spill
// heuristic). Instructions are identified by their flat index within the method's
// scheduled trace. AllocationMap is the plain-data implementation used by the test
// suites and by allocators that hand over their results as maps.

//! Register-allocation oracle boundary.

use hashbrown::HashMap;

use crate::ir::IrValue;
use crate::x64::regs::Reg;

/// Read-only view of a register allocator's decisions.
pub trait AllocationOracle {
    /// The allocator's placement for `value` in `method`; `None` means the
    /// value was spilled.
    fn assigned_register(&self, method: &str, value: &IrValue) -> Option<Reg>;

    /// Physical registers holding values whose live range crosses the
    /// instruction at `inst` in `method`'s trace.
    fn live_registers_across(&self, method: &str, inst: usize) -> Vec<Reg>;

    /// IR values whose live range covers the instruction at `inst`.
    fn live_values_across(&self, method: &str, inst: usize) -> Vec<IrValue>;
}

/// Oracle implementation over plain maps.
#[derive(Debug, Default)]
pub struct AllocationMap {
    registers: HashMap<String, HashMap<IrValue, Reg>>,
    live_registers: HashMap<String, HashMap<usize, Vec<Reg>>>,
    live_values: HashMap<String, HashMap<usize, Vec<IrValue>>>,
}

impl AllocationMap {
    pub fn new() -> Self {
        AllocationMap::default()
    }

    /// Record that the allocator placed `value` in `reg` for `method`.
    pub fn assign(&mut self, method: &str, value: IrValue, reg: Reg) {
        self.registers
            .entry(method.to_string())
            .or_default()
            .insert(value, reg);
    }

    /// Record the registers live across the instruction at `inst`.
    pub fn mark_live_registers(&mut self, method: &str, inst: usize, regs: Vec<Reg>) {
        self.live_registers
            .entry(method.to_string())
            .or_default()
            .insert(inst, regs);
    }

    /// Record the values live across the instruction at `inst`.
    pub fn mark_live_values(&mut self, method: &str, inst: usize, values: Vec<IrValue>) {
        self.live_values
            .entry(method.to_string())
            .or_default()
            .insert(inst, values);
    }
}

impl AllocationOracle for AllocationMap {
    fn assigned_register(&self, method: &str, value: &IrValue) -> Option<Reg> {
        self.registers.get(method)?.get(value).copied()
    }

    fn live_registers_across(&self, method: &str, inst: usize) -> Vec<Reg> {
        self.live_registers
            .get(method)
            .and_then(|m| m.get(&inst))
            .cloned()
            .unwrap_or_default()
    }

    fn live_values_across(&self, method: &str, inst: usize) -> Vec<IrValue> {
        self.live_values
            .get(method)
            .and_then(|m| m.get(&inst))
            .cloned()
            .unwrap_or_default()
    }
}

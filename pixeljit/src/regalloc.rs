//! Register assignment and evaluation ordering.
//!
//! A post-order walk from each channel root hands every node a register
//! and appends it to the schedule of its loop level. Reuse is preferred
//! in this order: inherit the first input's register, flip a commutative
//! op to inherit the second, evict a dead occupant, take a fresh
//! register, clobber a non-primary input. Exhaustion is fatal.

use itertools::Itertools;

use crate::error::CompileError;
use crate::ir::{Dag, NodeId, Op, Ty};

/// rax carries the column counter.
pub const REG_X: u8 = 0;
/// rcx carries the row counter.
pub const REG_Y: u8 = 1;
/// r8 carries the frame counter.
pub const REG_T: u8 = 8;
/// rsi carries the channel counter.
pub const REG_C: u8 = 6;
/// rdx carries the input base pointer.
pub const REG_IN: u8 = 2;
/// rdi is the output write cursor.
pub const REG_OUT: u8 = 7;
/// r9 parks the output base pointer.
pub const REG_OUT_BASE: u8 = 9;
/// r15 is the emitter's integer scratch.
pub const REG_TMP: u8 = 15;

const REG_RSP: u8 = 4;

/// Registers the allocator must never hand out: the loop counters, the
/// pointers, the stack pointer, the integer scratch, and the two SSE
/// scratch registers xmm14/xmm15.
pub const RESERVED: u32 = (1 << REG_X)
    | (1 << REG_Y)
    | (1 << REG_T)
    | (1 << REG_C)
    | (1 << REG_IN)
    | (1 << REG_OUT)
    | (1 << REG_OUT_BASE)
    | (1 << REG_TMP)
    | (1 << REG_RSP)
    | (1 << 30)
    | (1 << 31);

/// The allocator's product: per-level ordered node lists plus the
/// register masks each level touches and exports.
#[derive(Debug, Default)]
pub struct Schedule {
    /// Nodes to evaluate at each loop level, in emission order.
    pub order: [Vec<NodeId>; 5],
    /// Registers written while executing each level.
    pub clobbered: [u32; 5],
    /// Registers whose values must survive past each level, because a
    /// deeper level reads them.
    pub outputs: [u32; 5],
}

/// Assign every node reachable from `roots` a register and build the
/// per-level schedule. Later roots may not clobber the outputs of
/// earlier ones.
pub fn assign_registers(dag: &mut Dag, roots: &[NodeId]) -> Result<Schedule, CompileError> {
    let mut regs: [Option<NodeId>; 32] = [None; 32];
    let mut schedule = Schedule::default();
    let mut reserved = RESERVED;

    for &root in roots {
        assign(dag, root, &mut regs, &mut schedule.order, reserved)?;
        if let Some(reg) = dag.node(root).reg {
            reserved |= 1 << reg;
        }
    }

    for level in 0..5 {
        schedule.clobbered[level] = (1 << 30) | (1 << 31);
        for &id in &schedule.order[level] {
            if let Some(reg) = dag.node(id).reg {
                schedule.clobbered[level] |= 1 << reg;
            }
        }
    }
    for level in 0..5 {
        for &id in &schedule.order[level] {
            for &input in &dag.node(id).inputs {
                let node = dag.node(input);
                if node.level != dag.node(id).level {
                    if let Some(reg) = node.reg {
                        schedule.outputs[node.level as usize] |= 1 << reg;
                    }
                }
            }
        }
    }
    for &root in roots {
        if let Some(reg) = dag.node(root).reg {
            schedule.outputs[4] |= 1 << reg;
        }
    }

    Ok(schedule)
}

fn assign(
    dag: &mut Dag,
    id: NodeId,
    regs: &mut [Option<NodeId>; 32],
    order: &mut [Vec<NodeId>; 5],
    reserved: u32,
) -> Result<(), CompileError> {
    if dag.node(id).reg.is_some() {
        return Ok(());
    }

    let inputs = dag.node(id).inputs.clone();
    for &input in &inputs {
        assign(dag, input, regs, order, reserved)?;
    }

    let level = dag.node(id).level;
    let gpr = dag.node(id).ty == Ty::Int;

    // inherit the first input's register when this node is its last
    // consumer at this level; first is optimal for the two-operand forms
    if let Some(&first) = inputs.first() {
        if can_clobber(dag, id, first, reserved, gpr) {
            take(dag, id, input_reg(dag, first), regs, order);
            return Ok(());
        }
    }

    // commutative ops can clobber the second input just as cheaply
    if flippable(dag.node(id).op) && inputs.len() == 2 && can_clobber(dag, id, inputs[1], reserved, gpr)
    {
        take(dag, id, input_reg(dag, inputs[1]), regs, order);
        return Ok(());
    }

    // evict an occupant whose consumers have all been evaluated
    for r in 0..32u8 {
        if gpr && r >= 16 {
            break;
        }
        if !gpr && r < 16 {
            continue;
        }
        if reserved & (1 << r) != 0 {
            continue;
        }
        let Some(occupant) = regs[r as usize] else {
            continue;
        };
        if dag.node(occupant).level < level {
            continue;
        }
        let safe = dag.node(occupant).outputs.iter().all(|&out| {
            dag.node(out).reg.is_some() && dag.node(out).level <= level
        });
        if safe {
            take(dag, id, r, regs, order);
            return Ok(());
        }
    }

    // a completely unused register
    for r in 0..32u8 {
        if gpr && r >= 16 {
            break;
        }
        if !gpr && r < 16 {
            continue;
        }
        if reserved & (1 << r) != 0 {
            continue;
        }
        if regs[r as usize].is_none() {
            take(dag, id, r, regs, order);
            return Ok(());
        }
    }

    // clobber a non-primary input; costs an extra move at emission
    for &input in inputs.iter().skip(1) {
        if can_clobber(dag, id, input, reserved, gpr) {
            take(dag, id, input_reg(dag, input), regs, order);
            return Ok(());
        }
    }

    Err(CompileError::OutOfRegisters {
        op: dag.node(id).op.name(),
        map: register_map(dag, regs, reserved),
    })
}

fn input_reg(dag: &Dag, id: NodeId) -> u8 {
    // inputs are assigned before their consumers ask
    dag.node(id).reg.unwrap_or(0)
}

fn flippable(op: Op) -> bool {
    use Op::*;
    matches!(op, And | Or | Plus | Times | Lt | Gt | Lte | Gte | Eq | Neq)
}

// A consumer may overwrite an input's register when the register is not
// reserved, sits in the right bank, the input lives at the same level,
// and every other consumer of the input has already been emitted here.
fn can_clobber(dag: &Dag, node: NodeId, input: NodeId, reserved: u32, gpr: bool) -> bool {
    let Some(reg) = dag.node(input).reg else {
        return false;
    };
    if reserved & (1 << reg) != 0 {
        return false;
    }
    if gpr != (reg < 16) {
        return false;
    }
    if dag.node(node).level != dag.node(input).level {
        return false;
    }
    dag.node(input).outputs.iter().all(|&out| {
        out == node
            || (dag.node(out).level == dag.node(node).level && dag.node(out).reg.is_some())
    })
}

fn take(
    dag: &mut Dag,
    id: NodeId,
    reg: u8,
    regs: &mut [Option<NodeId>; 32],
    order: &mut [Vec<NodeId>; 5],
) {
    let level = dag.node(id).level as usize;
    let position = order[level].len() as u32;
    let node = dag.node_mut(id);
    node.reg = Some(reg);
    node.order = position;
    regs[reg as usize] = Some(id);
    order[level].push(id);
}

// One line per register, printed when allocation fails.
fn register_map(dag: &Dag, regs: &[Option<NodeId>; 32], reserved: u32) -> String {
    (0..32u8)
        .map(|r| {
            let name = if r < 16 {
                format!("r{r}")
            } else {
                format!("xmm{}", r - 16)
            };
            let occupant = match regs[r as usize] {
                Some(id) => dag.node(id).op.name(),
                None if reserved & (1 << r) != 0 => "(reserved)",
                None => "(empty)",
            };
            format!("{name}: {occupant}")
        })
        .join("\n")
}

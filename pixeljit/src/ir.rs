//! The operation DAG.
//!
//! Nodes live in a single arena and reference each other by index. The
//! constructor keeps the graph in canonical form: hash-consing through
//! the first input's output edges, constant folding, strength reduction,
//! and summation rebalancing all happen as nodes are made, so no
//! separate peephole pass exists.

use std::collections::HashMap;

use crate::error::CompileError;

bitflags::bitflags! {
    /// Loop variables a value depends on.
    pub struct Deps: u32 {
        /// Frame counter.
        const T = 1;
        /// Row counter.
        const Y = 2;
        /// Column counter.
        const X = 4;
        /// Channel counter.
        const C = 8;
        /// Input image memory.
        const MEM = 16;
    }
}

/// Primitive operations of the DAG.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Op {
    Const,
    NoOp,
    VarX,
    VarY,
    VarT,
    VarC,
    Plus,
    Minus,
    Times,
    Divide,
    Power,
    Sin,
    Cos,
    Tan,
    ASin,
    ACos,
    ATan,
    ATan2,
    Abs,
    Floor,
    Ceil,
    Round,
    Exp,
    Log,
    Mod,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    And,
    Or,
    Nand,
    Load,
    LoadImm,
    IntToFloat,
    FloatToInt,
    PlusImm,
    TimesImm,
}

impl Op {
    /// The opcode's display name.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Value types. `Bool` is physically an all-ones/all-zeros lane mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Ty {
    /// 32-bit integer, lives in a general-purpose register.
    Int,
    /// Packed single-precision float, lives in an SSE register.
    Float,
    /// Lane mask, lives in an SSE register.
    Bool,
}

/// Index of a node within its [`Dag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One operation in the DAG.
#[derive(Debug, Clone)]
pub struct Node {
    /// Opcode.
    pub op: Op,
    /// Value type.
    pub ty: Ty,
    /// Constant payload for `Const` of type `Float`.
    pub fval: f32,
    /// Constant payload for `Const` of type `Int`/`Bool`, and the fused
    /// immediate of `PlusImm`, `TimesImm` and `LoadImm`.
    pub ival: i32,
    /// Ordered inputs.
    pub inputs: Vec<NodeId>,
    /// Reverse edges, appended as consumers are constructed.
    pub outputs: Vec<NodeId>,
    /// Loop variables the value depends on.
    pub deps: Deps,
    /// Deepest loop at which the value is invariant; the loop it is
    /// evaluated in. 0 is outermost, 4 the per-channel body.
    pub level: u8,
    /// Allocated register: 0-15 general purpose, 16-31 SSE.
    pub reg: Option<u8>,
    /// Position within the level's emission schedule.
    pub order: u32,
}

/// Arena of hash-consed nodes.
///
/// The arena is cleared wholesale between compilations; nodes are never
/// freed individually. Cross-references are indices resolved through the
/// arena.
#[derive(Debug, Default)]
pub struct Dag {
    nodes: Vec<Node>,
    float_consts: HashMap<u32, NodeId>,
    int_consts: HashMap<i32, NodeId>,
    bool_consts: HashMap<bool, NodeId>,
    vars: HashMap<Op, NodeId>,
}

impl Dag {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// All live node ids.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let inputs = node.inputs.clone();
        self.nodes.push(node);
        for input in inputs {
            self.node_mut(input).outputs.push(id);
        }
        id
    }

    /// The interned float constant `v`.
    pub fn float_const(&mut self, v: f32) -> NodeId {
        if let Some(&id) = self.float_consts.get(&v.to_bits()) {
            return id;
        }
        let id = self.push(Node {
            op: Op::Const,
            ty: Ty::Float,
            fval: v,
            ival: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            deps: Deps::empty(),
            level: 0,
            reg: None,
            order: 0,
        });
        self.float_consts.insert(v.to_bits(), id);
        id
    }

    /// The interned integer constant `v`.
    pub fn int_const(&mut self, v: i32) -> NodeId {
        if let Some(&id) = self.int_consts.get(&v) {
            return id;
        }
        let id = self.push(Node {
            op: Op::Const,
            ty: Ty::Int,
            fval: 0.0,
            ival: v,
            inputs: Vec::new(),
            outputs: Vec::new(),
            deps: Deps::empty(),
            level: 0,
            reg: None,
            order: 0,
        });
        self.int_consts.insert(v, id);
        id
    }

    fn bool_const(&mut self, v: bool) -> NodeId {
        if let Some(&id) = self.bool_consts.get(&v) {
            return id;
        }
        let id = self.push(Node {
            op: Op::Const,
            ty: Ty::Bool,
            fval: 0.0,
            ival: v as i32,
            inputs: Vec::new(),
            outputs: Vec::new(),
            deps: Deps::empty(),
            level: 0,
            reg: None,
            order: 0,
        });
        self.bool_consts.insert(v, id);
        id
    }

    /// The interned loop-variable leaf for `VarX`/`VarY`/`VarT`/`VarC`.
    pub fn var(&mut self, op: Op) -> NodeId {
        if let Some(&id) = self.vars.get(&op) {
            return id;
        }
        let deps = var_dep(op).unwrap_or(Deps::empty());
        let id = self.push(Node {
            op,
            ty: Ty::Int,
            fval: 0.0,
            ival: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            deps,
            level: level_of(deps),
            reg: None,
            order: 0,
        });
        self.vars.insert(op, id);
        id
    }

    /// Pin a variable leaf to its ABI register, if the variable occurs.
    pub fn preassign_var(&mut self, op: Op, reg: u8) {
        if let Some(&id) = self.vars.get(&op) {
            self.node_mut(id).reg = Some(reg);
        }
    }

    /// Construct (or reuse) the node `op(inputs)` with fused immediate
    /// `ival`, applying coercion, folding and the strength-reduction
    /// rewrites.
    pub fn make(
        &mut self,
        op: Op,
        mut inputs: Vec<NodeId>,
        ival: i32,
    ) -> Result<NodeId, CompileError> {
        use Op::*;

        let ty = match op {
            Const => {
                return Err(CompileError::Type(
                    "constants are interned through their own constructors".to_string(),
                ))
            }
            NoOp => {
                self.expect_arity(op, &inputs, 1)?;
                self.node(inputs[0]).ty
            }
            VarX | VarY | VarT | VarC => {
                self.expect_arity(op, &inputs, 0)?;
                return Ok(self.var(op));
            }
            Plus | Minus | Times | Power | Mod => {
                self.expect_arity(op, &inputs, 2)?;
                let t = self.common_numeric(inputs[0], inputs[1]);
                inputs[0] = self.coerce(inputs[0], t)?;
                inputs[1] = self.coerce(inputs[1], t)?;
                t
            }
            Divide | ATan2 => {
                self.expect_arity(op, &inputs, 2)?;
                inputs[0] = self.coerce(inputs[0], Ty::Float)?;
                inputs[1] = self.coerce(inputs[1], Ty::Float)?;
                Ty::Float
            }
            Sin | Cos | Tan | ASin | ACos | ATan | Exp | Log => {
                self.expect_arity(op, &inputs, 1)?;
                inputs[0] = self.coerce(inputs[0], Ty::Float)?;
                Ty::Float
            }
            Abs => {
                self.expect_arity(op, &inputs, 1)?;
                if self.node(inputs[0]).ty == Ty::Bool {
                    return Ok(inputs[0]);
                }
                self.node(inputs[0]).ty
            }
            Floor | Ceil | Round => {
                self.expect_arity(op, &inputs, 1)?;
                if self.node(inputs[0]).ty != Ty::Float {
                    return Ok(inputs[0]);
                }
                Ty::Float
            }
            Lt | Gt | Lte | Gte | Eq | Neq => {
                // packed compares are float-lane instructions, so both
                // sides live in the SSE bank
                self.expect_arity(op, &inputs, 2)?;
                inputs[0] = self.coerce(inputs[0], Ty::Float)?;
                inputs[1] = self.coerce(inputs[1], Ty::Float)?;
                Ty::Bool
            }
            And | Nand => {
                self.expect_arity(op, &inputs, 2)?;
                inputs[0] = self.coerce(inputs[0], Ty::Bool)?;
                self.node(inputs[1]).ty
            }
            Or => {
                self.expect_arity(op, &inputs, 2)?;
                let (a, b) = (self.node(inputs[0]).ty, self.node(inputs[1]).ty);
                let t = if a == Ty::Float || b == Ty::Float {
                    Ty::Float
                } else if a == Ty::Int || b == Ty::Int {
                    Ty::Int
                } else {
                    Ty::Bool
                };
                inputs[0] = self.coerce(inputs[0], t)?;
                inputs[1] = self.coerce(inputs[1], t)?;
                t
            }
            IntToFloat => {
                self.expect_arity(op, &inputs, 1)?;
                if self.node(inputs[0]).ty != Ty::Int {
                    return Err(CompileError::Type(
                        "IntToFloat takes an integer".to_string(),
                    ));
                }
                Ty::Float
            }
            FloatToInt => {
                self.expect_arity(op, &inputs, 1)?;
                if self.node(inputs[0]).ty != Ty::Float {
                    return Err(CompileError::Type("FloatToInt takes a float".to_string()));
                }
                Ty::Int
            }
            PlusImm | TimesImm => {
                self.expect_arity(op, &inputs, 1)?;
                if self.node(inputs[0]).ty != Ty::Int {
                    return Err(CompileError::Type(format!(
                        "{} takes an integer",
                        op.name()
                    )));
                }
                Ty::Int
            }
            Load | LoadImm => {
                self.expect_arity(op, &inputs, 1)?;
                inputs[0] = self.coerce(inputs[0], Ty::Int)?;
                Ty::Float
            }
        };

        // constant folding
        if !inputs.is_empty() && inputs.iter().all(|&i| self.node(i).op == Const) {
            if let Some(id) = self.fold(op, &inputs, ival, ty) {
                return Ok(id);
            }
        }

        // strength reduction
        if op == NoOp {
            return Ok(inputs[0]);
        }

        if op == Divide && self.node(inputs[1]).level < self.node(inputs[0]).level {
            // x / a = x * (1 / a) once the divisor is loop-invariant
            let one = self.float_const(1.0);
            let recip = self.make(Divide, vec![one, inputs[1]], 0)?;
            return self.make(Times, vec![inputs[0], recip], 0);
        }

        if op == Times {
            if let Some(id) = self.distribute_times(&inputs)? {
                return Ok(id);
            }
            if let Some(id) = self.reassociate_times(&inputs)? {
                return Ok(id);
            }
        }

        // rebalance summations feeding a non-sum node
        if !matches!(op, Plus | Minus | PlusImm) {
            for input in inputs.iter_mut() {
                *input = self.rebalance(*input)?;
            }
        }

        // fuse address arithmetic into loads
        if matches!(op, Load | LoadImm) {
            let addr = inputs[0];
            let addr_node = self.node(addr);
            match addr_node.op {
                Plus => {
                    let (l, r) = (addr_node.inputs[0], addr_node.inputs[1]);
                    if self.node(l).op == Const {
                        let k = self.node(l).ival;
                        return self.make(LoadImm, vec![r], k + ival);
                    }
                    if self.node(r).op == Const {
                        let k = self.node(r).ival;
                        return self.make(LoadImm, vec![l], k + ival);
                    }
                }
                Minus if self.node(addr_node.inputs[1]).op == Const => {
                    let l = addr_node.inputs[0];
                    let k = self.node(addr_node.inputs[1]).ival;
                    return self.make(LoadImm, vec![l], -k + ival);
                }
                PlusImm => {
                    let inner = addr_node.inputs[0];
                    let k = addr_node.ival;
                    return self.make(LoadImm, vec![inner], k + ival);
                }
                _ => {}
            }
        }

        // integer multiplication by a constant becomes a fused immediate
        if op == Times && ty == Ty::Int {
            if self.node(inputs[0]).op == Const {
                let k = self.node(inputs[0]).ival;
                return self.make(TimesImm, vec![inputs[1]], k);
            }
            if self.node(inputs[1]).op == Const {
                let k = self.node(inputs[1]).ival;
                return self.make(TimesImm, vec![inputs[0]], k);
            }
        }

        // hash-consing: scan the first input's consumers for this exact op
        if let Some(&first) = inputs.first() {
            for candidate in self.node(first).outputs.clone() {
                let n = self.node(candidate);
                if n.op == op
                    && n.ival == ival
                    && n.ty == ty
                    && n.inputs == inputs
                {
                    return Ok(candidate);
                }
            }
        }

        let mut deps = match op {
            Load => Deps::MEM,
            _ => Deps::empty(),
        };
        for &input in &inputs {
            deps |= self.node(input).deps;
        }

        Ok(self.push(Node {
            op,
            ty,
            fval: 0.0,
            ival,
            inputs,
            outputs: Vec::new(),
            deps,
            level: level_of(deps),
            reg: None,
            order: 0,
        }))
    }

    fn expect_arity(&self, op: Op, inputs: &[NodeId], n: usize) -> Result<(), CompileError> {
        if inputs.len() == n {
            Ok(())
        } else {
            Err(CompileError::Type(format!(
                "wrong number of inputs for {}: {}",
                op.name(),
                inputs.len()
            )))
        }
    }

    fn common_numeric(&self, a: NodeId, b: NodeId) -> Ty {
        if self.node(a).ty == Ty::Float || self.node(b).ty == Ty::Float {
            Ty::Float
        } else {
            Ty::Int
        }
    }

    /// Insert an explicit conversion so `id` has type `ty`.
    pub fn coerce(&mut self, id: NodeId, ty: Ty) -> Result<NodeId, CompileError> {
        use Op::*;
        let from = self.node(id).ty;
        if from == ty {
            return Ok(id);
        }
        match (from, ty) {
            (Ty::Int, Ty::Float) => self.make(IntToFloat, vec![id], 0),
            (Ty::Int, Ty::Bool) => {
                let zero = self.int_const(0);
                self.make(Neq, vec![id, zero], 0)
            }
            (Ty::Bool, Ty::Float) => {
                let one = self.float_const(1.0);
                self.make(And, vec![id, one], 0)
            }
            (Ty::Bool, Ty::Int) => {
                let one = self.int_const(1);
                self.make(And, vec![id, one], 0)
            }
            (Ty::Float, Ty::Bool) => {
                let zero = self.float_const(0.0);
                self.make(Neq, vec![id, zero], 0)
            }
            (Ty::Float, Ty::Int) => self.make(FloatToInt, vec![id], 0),
            _ => Err(CompileError::Type(format!(
                "cannot coerce {from:?} to {ty:?}"
            ))),
        }
    }

    fn fold(&mut self, op: Op, inputs: &[NodeId], ival: i32, ty: Ty) -> Option<NodeId> {
        use Op::*;
        let f = |i: usize| self.node(inputs[i]).fval;
        let iv = |i: usize| self.node(inputs[i]).ival;
        let (f0, i0) = (f(0), iv(0));
        let (f1, i1) = if inputs.len() > 1 {
            (f(1), iv(1))
        } else {
            (0.0, 0)
        };

        let id = match (op, ty) {
            (Plus, Ty::Float) => self.float_const(f0 + f1),
            (Plus, Ty::Int) => self.int_const(i0.wrapping_add(i1)),
            (Minus, Ty::Float) => self.float_const(f0 - f1),
            (Minus, Ty::Int) => self.int_const(i0.wrapping_sub(i1)),
            (Times, Ty::Float) => self.float_const(f0 * f1),
            (Times, Ty::Int) => self.int_const(i0.wrapping_mul(i1)),
            (PlusImm, _) => self.int_const(i0.wrapping_add(ival)),
            (TimesImm, _) => self.int_const(i0.wrapping_mul(ival)),
            (Divide, _) => self.float_const(f0 / f1),
            (And, Ty::Float) => self.float_const(if i0 != 0 { f1 } else { 0.0 }),
            (And, Ty::Int) => self.int_const(if i0 != 0 { i1 } else { 0 }),
            (And, Ty::Bool) => self.bool_const(i0 != 0 && i1 != 0),
            (Nand, Ty::Float) => self.float_const(if i0 == 0 { f1 } else { 0.0 }),
            (Nand, Ty::Int) => self.int_const(if i0 == 0 { i1 } else { 0 }),
            (Nand, Ty::Bool) => self.bool_const(i0 == 0 && i1 != 0),
            (Or, Ty::Float) => self.float_const(f0 + f1),
            (Or, Ty::Int) => self.int_const(i0 | i1),
            (Or, Ty::Bool) => self.bool_const(i0 != 0 || i1 != 0),
            (IntToFloat, _) => self.float_const(i0 as f32),
            (FloatToInt, _) => self.int_const(f0 as i32),
            (Sin, _) => self.float_const(f0.sin()),
            (Cos, _) => self.float_const(f0.cos()),
            (Tan, _) => self.float_const(f0.tan()),
            (ASin, _) => self.float_const(f0.asin()),
            (ACos, _) => self.float_const(f0.acos()),
            (ATan, _) => self.float_const(f0.atan()),
            (ATan2, _) => self.float_const(f0.atan2(f1)),
            (Exp, _) => self.float_const(f0.exp()),
            (Log, _) => self.float_const(f0.ln()),
            (Abs, Ty::Float) => self.float_const(f0.abs()),
            (Abs, Ty::Int) => self.int_const(i0.wrapping_abs()),
            (Floor, _) => self.float_const(f0.floor()),
            (Ceil, _) => self.float_const(f0.ceil()),
            (Round, _) => self.float_const(f0.round()),
            (Power, Ty::Float) => self.float_const(f0.powf(f1)),
            (Mod, Ty::Float) if f1 != 0.0 => self.float_const(f0 % f1),
            (Lt, _) => self.bool_const(f0 < f1),
            (Gt, _) => self.bool_const(f0 > f1),
            (Lte, _) => self.bool_const(f0 <= f1),
            (Gte, _) => self.bool_const(f0 >= f1),
            (Eq, _) => self.bool_const(f0 == f1),
            (Neq, _) => self.bool_const(f0 != f1),
            _ => return None,
        };
        Some(id)
    }

    // (x + a) * b = x*b + a*b when a and b are hoistable past x
    fn distribute_times(&mut self, inputs: &[NodeId]) -> Result<Option<NodeId>, CompileError> {
        use Op::*;
        let shaped = if self.node(inputs[0]).op == Plus {
            let n = self.node(inputs[0]);
            Some((n.inputs[1], n.inputs[0], inputs[1]))
        } else if self.node(inputs[1]).op == Plus {
            let n = self.node(inputs[1]);
            Some((n.inputs[1], n.inputs[0], inputs[0]))
        } else {
            None
        };

        if let Some((mut x, mut a, b)) = shaped {
            if self.node(x).level < self.node(a).level {
                std::mem::swap(&mut x, &mut a);
            }
            if self.node(x).level > self.node(a).level && self.node(x).level > self.node(b).level
            {
                let xb = self.make(Times, vec![x, b], 0)?;
                let ab = self.make(Times, vec![a, b], 0)?;
                return Ok(Some(self.make(Plus, vec![xb, ab], 0)?));
            }
        }

        // fused-immediate sums distribute unconditionally
        if self.node(inputs[0]).op == PlusImm {
            let n = self.node(inputs[0]);
            let (inner, k) = (n.inputs[0], n.ival);
            let xb = self.make(Times, vec![inner, inputs[1]], 0)?;
            let kn = self.int_const(k);
            let kb = self.make(Times, vec![inputs[1], kn], 0)?;
            return Ok(Some(self.make(Plus, vec![xb, kb], 0)?));
        }

        Ok(None)
    }

    // (x * a) * b = x * (a * b) when a and b are hoistable past x
    fn reassociate_times(&mut self, inputs: &[NodeId]) -> Result<Option<NodeId>, CompileError> {
        use Op::*;
        let shaped = if self.node(inputs[0]).op == Times {
            let n = self.node(inputs[0]);
            Some((n.inputs[0], n.inputs[1], inputs[1]))
        } else if self.node(inputs[1]).op == Times {
            let n = self.node(inputs[1]);
            Some((n.inputs[0], n.inputs[1], inputs[0]))
        } else {
            None
        };

        if let Some((mut x, mut a, b)) = shaped {
            if self.node(x).level < self.node(a).level {
                std::mem::swap(&mut x, &mut a);
            }
            if self.node(x).level > self.node(a).level && self.node(x).level > self.node(b).level
            {
                let ab = self.make(Times, vec![a, b], 0)?;
                return Ok(Some(self.make(Times, vec![x, ab], 0)?));
            }
        }
        Ok(None)
    }

    /// Flatten a Plus/Minus/PlusImm chain, sort its terms so the
    /// deepest-level work forms the outermost addition, and rebuild.
    /// Float chains keep the folded constant innermost; integer chains
    /// push it outermost where load fusion can absorb it.
    pub fn rebalance(&mut self, id: NodeId) -> Result<NodeId, CompileError> {
        use Op::*;
        if !matches!(self.node(id).op, Plus | Minus | PlusImm) {
            return Ok(id);
        }
        let ty = self.node(id).ty;

        let mut terms = Vec::new();
        self.collect_sum(id, true, &mut terms);

        let (consts, mut terms): (Vec<_>, Vec<_>) = terms
            .into_iter()
            .partition(|&(t, _)| self.node(t).op == Const);
        terms.sort_by_key(|&(t, _)| self.node(t).level);

        let mut fc = 0.0f32;
        let mut ic = 0i32;
        for &(t, pos) in &consts {
            let n = self.node(t);
            if ty == Ty::Float {
                fc += if pos { n.fval } else { -n.fval };
            } else {
                ic = if pos {
                    ic.wrapping_add(n.ival)
                } else {
                    ic.wrapping_sub(n.ival)
                };
            }
        }

        let Some(&(first, first_pos)) = terms.first() else {
            // constants only
            return Ok(if ty == Ty::Float {
                self.float_const(fc)
            } else {
                self.int_const(ic)
            });
        };

        let (mut acc, mut acc_pos) = (first, first_pos);
        if ty == Ty::Float && fc != 0.0 {
            let c = self.float_const(fc);
            acc = if acc_pos {
                self.make(Plus, vec![c, acc], 0)?
            } else {
                self.make(Minus, vec![c, acc], 0)?
            };
            acc_pos = true;
        }

        for &(term, pos) in &terms[1..] {
            if pos == acc_pos {
                acc = self.make(Plus, vec![acc, term], 0)?;
            } else if acc_pos {
                acc = self.make(Minus, vec![acc, term], 0)?;
            } else {
                acc = self.make(Minus, vec![term, acc], 0)?;
                acc_pos = true;
            }
        }

        if !acc_pos {
            // a chain of nothing but negated terms
            let zero = if ty == Ty::Float {
                self.float_const(0.0)
            } else {
                self.int_const(0)
            };
            acc = self.make(Minus, vec![zero, acc], 0)?;
        }

        if ty == Ty::Int && ic != 0 {
            acc = self.make(PlusImm, vec![acc], ic)?;
        }

        Ok(acc)
    }

    fn collect_sum(&mut self, id: NodeId, positive: bool, terms: &mut Vec<(NodeId, bool)>) {
        use Op::*;
        let n = self.node(id);
        match n.op {
            Plus => {
                let (a, b) = (n.inputs[0], n.inputs[1]);
                self.collect_sum(a, positive, terms);
                self.collect_sum(b, positive, terms);
            }
            Minus => {
                let (a, b) = (n.inputs[0], n.inputs[1]);
                self.collect_sum(a, positive, terms);
                self.collect_sum(b, !positive, terms);
            }
            PlusImm => {
                let (a, k) = (n.inputs[0], n.ival);
                self.collect_sum(a, positive, terms);
                let c = self.int_const(k);
                terms.push((c, positive));
            }
            _ => terms.push((id, positive)),
        }
    }

    /// Rebalance from the root, then mark-sweep every node the root does
    /// not reach, compacting the arena and re-interning the survivors.
    pub fn cleanup(&mut self, root: NodeId) -> Result<NodeId, CompileError> {
        let root = self.rebalance(root)?;

        let mut live = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if live[id.index()] {
                continue;
            }
            live[id.index()] = true;
            stack.extend(&self.node(id).inputs);
        }

        let mut remap: Vec<Option<NodeId>> = vec![None; self.nodes.len()];
        let mut kept = 0u32;
        for (i, alive) in live.iter().enumerate() {
            if *alive {
                remap[i] = Some(NodeId(kept));
                kept += 1;
            }
        }

        let old = std::mem::take(&mut self.nodes);
        self.float_consts.clear();
        self.int_consts.clear();
        self.bool_consts.clear();
        self.vars.clear();

        for (i, mut node) in old.into_iter().enumerate() {
            let Some(new_id) = remap[i] else { continue };
            for input in node.inputs.iter_mut() {
                *input = remap[input.index()].unwrap_or(*input);
            }
            node.outputs = node
                .outputs
                .iter()
                .filter_map(|o| remap[o.index()])
                .collect();
            match node.op {
                Op::Const => match node.ty {
                    Ty::Float => {
                        self.float_consts.insert(node.fval.to_bits(), new_id);
                    }
                    Ty::Int => {
                        self.int_consts.insert(node.ival, new_id);
                    }
                    Ty::Bool => {
                        self.bool_consts.insert(node.ival != 0, new_id);
                    }
                },
                Op::VarX | Op::VarY | Op::VarT | Op::VarC => {
                    self.vars.insert(node.op, new_id);
                }
                _ => {}
            }
            self.nodes.push(node);
        }

        remap[root.index()].ok_or_else(|| {
            CompileError::Type("cleanup lost the root".to_string())
        })
    }

    /// Clone the subgraph with `var` replaced by the literal `val`;
    /// nodes independent of the variable are shared, not copied.
    pub fn substitute(&mut self, id: NodeId, var: Op, val: i32) -> Result<NodeId, CompileError> {
        let dep = var_dep(var).ok_or_else(|| {
            CompileError::Type(format!("{} is not a loop variable", var.name()))
        })?;

        let n = self.node(id);
        if n.op == var {
            return Ok(self.int_const(val));
        }
        if !n.deps.contains(dep) {
            return Ok(id);
        }
        let (op, ival, inputs) = (n.op, n.ival, n.inputs.clone());
        let rebuilt = inputs
            .into_iter()
            .map(|i| self.substitute(i, var, val))
            .collect::<Result<Vec<_>, _>>()?;
        self.make(op, rebuilt, ival)
    }

    /// The per-x-step integer delta of an address-arithmetic value, when
    /// it is linear in x with a compile-time slope. `Some(0)` for values
    /// independent of x, `None` when the slope cannot be determined.
    pub fn x_slope(&self, id: NodeId) -> Option<i64> {
        use Op::*;
        let n = self.node(id);
        if !n.deps.contains(Deps::X) {
            return Some(0);
        }
        match n.op {
            VarX => Some(1),
            Plus => Some(self.x_slope(n.inputs[0])? + self.x_slope(n.inputs[1])?),
            Minus => Some(self.x_slope(n.inputs[0])? - self.x_slope(n.inputs[1])?),
            PlusImm => self.x_slope(n.inputs[0]),
            TimesImm => Some(self.x_slope(n.inputs[0])? * n.ival as i64),
            _ => None,
        }
    }

    /// Semantic evaluation of a node at one pixel, ignoring lanes.
    /// Integers are exact in the f64 domain. `im` backs the load
    /// opcodes; address operands are byte offsets from its buffer start.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn eval_scalar(
        &self,
        id: NodeId,
        (x, y, t, c): (i64, i64, i64, i64),
        im: Option<&crate::image::ImageView<'_>>,
    ) -> f64 {
        use Op::*;
        let n = self.node(id);
        let arg = |i: usize| self.eval_scalar(n.inputs[i], (x, y, t, c), im);
        match n.op {
            Const => match n.ty {
                Ty::Float => n.fval as f64,
                _ => n.ival as f64,
            },
            NoOp => arg(0),
            VarX => x as f64,
            VarY => y as f64,
            VarT => t as f64,
            VarC => c as f64,
            Plus => arg(0) + arg(1),
            Minus => arg(0) - arg(1),
            Times => arg(0) * arg(1),
            Divide => arg(0) / arg(1),
            Power => arg(0).powf(arg(1)),
            Mod => arg(0) % arg(1),
            Sin => arg(0).sin(),
            Cos => arg(0).cos(),
            Tan => arg(0).tan(),
            ASin => arg(0).asin(),
            ACos => arg(0).acos(),
            ATan => arg(0).atan(),
            ATan2 => arg(0).atan2(arg(1)),
            Abs => arg(0).abs(),
            Floor => arg(0).floor(),
            Ceil => arg(0).ceil(),
            Round => arg(0).round(),
            Exp => arg(0).exp(),
            Log => arg(0).ln(),
            Lt => (arg(0) < arg(1)) as i32 as f64,
            Gt => (arg(0) > arg(1)) as i32 as f64,
            Lte => (arg(0) <= arg(1)) as i32 as f64,
            Gte => (arg(0) >= arg(1)) as i32 as f64,
            Eq => (arg(0) == arg(1)) as i32 as f64,
            Neq => (arg(0) != arg(1)) as i32 as f64,
            And => {
                if arg(0) != 0.0 {
                    arg(1)
                } else {
                    0.0
                }
            }
            Nand => {
                if arg(0) == 0.0 {
                    arg(1)
                } else {
                    0.0
                }
            }
            Or => match n.ty {
                Ty::Bool => (arg(0) != 0.0 || arg(1) != 0.0) as i32 as f64,
                // the masked sides of a select are disjoint
                _ => arg(0) + arg(1),
            },
            IntToFloat => arg(0),
            FloatToInt => arg(0).trunc(),
            PlusImm => arg(0) + n.ival as f64,
            TimesImm => arg(0) * n.ival as f64,
            Load | LoadImm => {
                let offset = if n.op == LoadImm { n.ival as i64 } else { 0 };
                let byte = arg(0) as i64 + offset;
                let im = im.expect("evaluating a load needs an image");
                im.data()[(byte / 4) as usize] as f64
            }
        }
    }

    /// Human-readable listing line for the schedule dump.
    pub fn describe(&self, id: NodeId) -> String {
        let n = self.node(id);
        let dst = reg_name(n.reg);
        match n.op {
            Op::Const => match n.ty {
                Ty::Float => format!("{dst} = {}", n.fval),
                _ => format!("{dst} = {}", n.ival),
            },
            Op::PlusImm => format!("{dst} = {} + {}", self.arg(n.inputs[0]), n.ival),
            Op::TimesImm => format!("{dst} = {} * {}", self.arg(n.inputs[0]), n.ival),
            Op::LoadImm => format!("{dst} = Load {} + {}", self.arg(n.inputs[0]), n.ival),
            _ => {
                let mut line = format!("{dst} = {}", n.op.name());
                for &input in &n.inputs {
                    line.push(' ');
                    line.push_str(&self.arg(input));
                }
                line
            }
        }
    }

    fn arg(&self, id: NodeId) -> String {
        let n = self.node(id);
        match n.reg {
            Some(_) => reg_name(n.reg),
            None if n.op == Op::Const && n.ty == Ty::Float => format!("{}", n.fval),
            None => format!("{}", n.ival),
        }
    }
}

/// Dependency bit contributed by a variable opcode.
fn var_dep(op: Op) -> Option<Deps> {
    match op {
        Op::VarX => Some(Deps::X),
        Op::VarY => Some(Deps::Y),
        Op::VarT => Some(Deps::T),
        Op::VarC => Some(Deps::C),
        _ => None,
    }
}

/// Loop level implied by a dependency set.
pub fn level_of(deps: Deps) -> u8 {
    if deps.intersects(Deps::C | Deps::MEM) {
        4
    } else if deps.contains(Deps::X) {
        3
    } else if deps.contains(Deps::Y) {
        2
    } else if deps.contains(Deps::T) {
        1
    } else {
        0
    }
}

/// Register index display: 0-15 are GPRs, 16-31 SSE.
pub fn reg_name(reg: Option<u8>) -> String {
    match reg {
        Some(r) if r < 16 => format!("r{r}"),
        Some(r) => format!("xmm{}", r - 16),
        None => "_".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn xf(dag: &mut Dag) -> NodeId {
        let x = dag.var(Op::VarX);
        dag.make(Op::IntToFloat, vec![x], 0).unwrap()
    }

    #[test]
    fn identical_subexpressions_share_identity() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let one = dag.int_const(1);
        let a = dag.make(Op::Plus, vec![x, one], 0).unwrap();
        let b = dag.make(Op::Plus, vec![x, one], 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn variable_and_constant_leaves_are_singletons() {
        let mut dag = Dag::new();
        assert_eq!(dag.var(Op::VarY), dag.var(Op::VarY));
        assert_eq!(dag.float_const(2.5), dag.float_const(2.5));
        assert_eq!(dag.int_const(-7), dag.int_const(-7));
        assert_ne!(dag.float_const(2.5), dag.float_const(2.25));
    }

    #[test]
    fn constant_expressions_fold_to_a_literal() {
        let mut dag = Dag::new();
        let two = dag.int_const(2);
        let three = dag.int_const(3);
        let product = dag.make(Op::Times, vec![two, three], 0).unwrap();
        let n = dag.node(product);
        assert_eq!(n.op, Op::Const);
        assert_eq!(n.ival, 6);

        let half = dag.float_const(0.5);
        let athird = dag.float_const(0.25);
        let s = dag.make(Op::Plus, vec![half, athird], 0).unwrap();
        assert_eq!(dag.node(s).fval, 0.75);
    }

    #[test]
    fn unary_functions_of_constants_fold() {
        let mut dag = Dag::new();
        let v = dag.float_const(0.3);
        let s = dag.make(Op::Sin, vec![v], 0).unwrap();
        assert_eq!(dag.node(s).op, Op::Const);
        assert_eq!(dag.node(s).fval, 0.3f32.sin());
    }

    #[test]
    fn comparisons_of_constants_fold_to_masks() {
        let mut dag = Dag::new();
        let a = dag.int_const(2);
        let b = dag.int_const(3);
        let lt = dag.make(Op::Lt, vec![a, b], 0).unwrap();
        let n = dag.node(lt);
        assert_eq!(n.op, Op::Const);
        assert_eq!(n.ty, Ty::Bool);
        assert_eq!(n.ival, 1);
    }

    #[test]
    fn noop_vanishes() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        assert_eq!(dag.make(Op::NoOp, vec![x], 0).unwrap(), x);
    }

    #[test]
    fn division_by_an_invariant_becomes_multiplication() {
        let mut dag = Dag::new();
        let xf = xf(&mut dag);
        let two = dag.float_const(2.0);
        let d = dag.make(Op::Divide, vec![xf, two], 0).unwrap();
        let n = dag.node(d);
        assert_eq!(n.op, Op::Times);
        let has_half = n
            .inputs
            .iter()
            .any(|&i| dag.node(i).op == Op::Const && dag.node(i).fval == 0.5);
        assert!(has_half);
    }

    #[test]
    fn integer_multiplication_by_a_constant_fuses() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let twelve = dag.int_const(12);
        let m = dag.make(Op::Times, vec![x, twelve], 0).unwrap();
        let n = dag.node(m);
        assert_eq!(n.op, Op::TimesImm);
        assert_eq!(n.ival, 12);
        assert_eq!(n.inputs, vec![x]);
    }

    #[test]
    fn loads_fuse_their_constant_offsets() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let scaled = dag.make(Op::TimesImm, vec![x], 12).unwrap();
        let eight = dag.int_const(8);
        let addr = dag.make(Op::Plus, vec![scaled, eight], 0).unwrap();
        let load = dag.make(Op::Load, vec![addr], 0).unwrap();
        let n = dag.node(load);
        assert_eq!(n.op, Op::LoadImm);
        assert_eq!(n.ival, 8);
        assert_eq!(n.inputs, vec![scaled]);
    }

    #[test]
    fn deps_and_levels_follow_the_loop_order() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let y = dag.var(Op::VarY);
        let t = dag.var(Op::VarT);
        assert_eq!(dag.node(x).level, 3);
        assert_eq!(dag.node(y).level, 2);
        assert_eq!(dag.node(t).level, 1);

        let sum = dag.make(Op::Plus, vec![y, t], 0).unwrap();
        assert_eq!(dag.node(sum).level, 2);
        assert!(dag.node(sum).deps.contains(Deps::Y | Deps::T));
        assert!(!dag.node(sum).deps.contains(Deps::X));

        let load = dag.make(Op::Load, vec![x], 0).unwrap();
        assert_eq!(dag.node(load).level, 4);
        assert!(dag.node(load).deps.contains(Deps::MEM));
    }

    #[test]
    fn bool_coercion_inserts_masked_one() {
        let mut dag = Dag::new();
        let xf = xf(&mut dag);
        let zero = dag.float_const(0.0);
        let b = dag.make(Op::Neq, vec![xf, zero], 0).unwrap();
        assert_eq!(dag.node(b).ty, Ty::Bool);
        let as_float = dag.coerce(b, Ty::Float).unwrap();
        let n = dag.node(as_float);
        assert_eq!(n.op, Op::And);
        assert_eq!(n.ty, Ty::Float);
    }

    #[test]
    fn rebalance_sorts_terms_innermost_last_and_pockets_the_constant() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let y = dag.var(Op::VarY);
        let five = dag.int_const(5);
        let inner = dag.make(Op::Plus, vec![x, five], 0).unwrap();
        let root = dag.make(Op::Plus, vec![inner, y], 0).unwrap();
        let root = dag.rebalance(root).unwrap();

        // the integer constant migrates outward as a fused immediate
        let n = dag.node(root);
        assert_eq!(n.op, Op::PlusImm);
        assert_eq!(n.ival, 5);
        let body = dag.node(n.inputs[0]);
        assert_eq!(body.op, Op::Plus);
        assert_eq!(body.inputs, vec![y, x]);
    }

    #[test]
    fn rebalance_handles_an_all_negative_chain() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let zero = dag.int_const(0);
        let neg = dag.make(Op::Minus, vec![zero, x], 0).unwrap();
        let root = dag.rebalance(neg).unwrap();
        // -x must still evaluate to -x
        assert_eq!(dag.eval_scalar(root, (7, 0, 0, 0), None), -7.0);
    }

    #[quickcheck]
    fn rebalance_is_an_identity(terms: Vec<(u8, i8, bool)>) -> bool {
        let mut dag = Dag::new();
        let mut acc = dag.var(Op::VarT);
        for &(which, k, positive) in &terms {
            let term = match which % 4 {
                0 => dag.var(Op::VarX),
                1 => dag.var(Op::VarY),
                2 => dag.var(Op::VarC),
                _ => dag.int_const(k as i32),
            };
            let op = if positive { Op::Plus } else { Op::Minus };
            acc = dag.make(op, vec![acc, term], 0).unwrap();
        }
        let before = dag.eval_scalar(acc, (11, -3, 5, 2), None);
        let after = dag.rebalance(acc).unwrap();
        dag.eval_scalar(after, (11, -3, 5, 2), None) == before
    }

    #[test]
    fn cleanup_removes_orphans_and_reinterns_survivors() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let y = dag.var(Op::VarY);
        // an abandoned computation
        let ten = dag.int_const(10);
        let _orphan = dag.make(Op::Times, vec![y, ten], 0).unwrap();
        let root = dag.make(Op::Plus, vec![x, x], 0).unwrap();

        let root = dag.cleanup(root).unwrap();

        // every surviving node is reachable from the root
        let mut live = vec![false; dag.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if live[id.index()] {
                continue;
            }
            live[id.index()] = true;
            stack.extend(&dag.node(id).inputs);
        }
        assert!(live.into_iter().all(|l| l));

        // interning still works against the compacted arena
        let x2 = dag.var(Op::VarX);
        assert_eq!(dag.node(root).inputs, vec![x2, x2]);
    }

    #[test]
    fn substitution_shares_independent_subgraphs() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let c = dag.var(Op::VarC);
        let xpart = dag.make(Op::TimesImm, vec![x], 12).unwrap();
        let cpart = dag.make(Op::TimesImm, vec![c], 4).unwrap();
        let root = dag.make(Op::Plus, vec![xpart, cpart], 0).unwrap();

        let ch2 = dag.substitute(root, Op::VarC, 2).unwrap();
        assert_ne!(ch2, root);
        // the x half is shared, not cloned
        assert!(dag.node(ch2).op == Op::PlusImm || dag.node(ch2).inputs.contains(&xpart));
        assert_eq!(dag.eval_scalar(ch2, (3, 0, 0, 99), None), 36.0 + 8.0);

        // independent roots are returned as-is
        let xonly = dag.substitute(xpart, Op::VarC, 1).unwrap();
        assert_eq!(xonly, xpart);
    }

    #[test]
    fn x_slope_tracks_linear_address_arithmetic() {
        let mut dag = Dag::new();
        let x = dag.var(Op::VarX);
        let y = dag.var(Op::VarY);
        let xs = dag.make(Op::TimesImm, vec![x], 12).unwrap();
        let ys = dag.make(Op::TimesImm, vec![y], 48).unwrap();
        let sum = dag.make(Op::Plus, vec![xs, ys], 0).unwrap();
        let addr = dag.make(Op::PlusImm, vec![sum], 8).unwrap();

        assert_eq!(dag.x_slope(x), Some(1));
        assert_eq!(dag.x_slope(xs), Some(12));
        assert_eq!(dag.x_slope(ys), Some(0));
        assert_eq!(dag.x_slope(addr), Some(12));

        let sq = dag.make(Op::Times, vec![x, x], 0).unwrap();
        assert_eq!(dag.x_slope(sq), None);
    }

    #[test]
    fn masked_select_folds_when_the_condition_is_constant() {
        let mut dag = Dag::new();
        let t = dag.bool_const(true);
        let a = dag.float_const(2.0);
        let b = dag.float_const(5.0);
        let then_side = dag.make(Op::And, vec![t, a], 0).unwrap();
        let else_side = dag.make(Op::Nand, vec![t, b], 0).unwrap();
        let sel = dag.make(Op::Or, vec![then_side, else_side], 0).unwrap();
        let n = dag.node(sel);
        assert_eq!(n.op, Op::Const);
        assert_eq!(n.fval, 2.0);
    }
}

//! Schedule simulator.
//!
//! Executes a register-allocated schedule with the same machine model
//! the emitted code runs on: sixteen scalar integer registers, sixteen
//! four-lane f32 registers, the loop nest of the emitter, strided loads
//! from the real input buffer, and the lane-ramp integer conversion.
//! The test-suite uses it to hold compiled programs against the
//! reference interpreter without executing native code.

use crate::image::{ImageBuf, ImageView};
use crate::ir::{Dag, NodeId, Op, Ty};
use crate::regalloc::{Schedule, REG_C, REG_T, REG_X, REG_Y};

/// Run the schedule over `input`, writing every pixel of `output`.
pub fn run(
    dag: &Dag,
    schedule: &Schedule,
    roots: &[NodeId],
    input: ImageView<'_>,
    output: &mut ImageBuf,
) {
    let mut m = Machine {
        dag,
        input,
        gpr: [0; 16],
        sse: [[0; 4]; 16],
    };

    m.exec(&schedule.order[0]);
    for t in 0..input.frames {
        m.gpr[REG_T as usize] = t as i64;
        m.exec(&schedule.order[1]);
        for y in 0..input.height {
            m.gpr[REG_Y as usize] = y as i64;
            m.exec(&schedule.order[2]);
            for x in (0..input.width).step_by(4) {
                m.gpr[REG_X as usize] = x as i64;
                m.exec(&schedule.order[3]);
                m.gpr[REG_C as usize] = 0;
                m.exec(&schedule.order[4]);
                for (c, &root) in roots.iter().enumerate() {
                    let lanes = m.lanes_f(root);
                    for (k, v) in lanes.into_iter().enumerate() {
                        output.set(x + k, y, t, c, v);
                    }
                }
            }
        }
    }
}

struct Machine<'a> {
    dag: &'a Dag,
    input: ImageView<'a>,
    gpr: [i64; 16],
    sse: [[u32; 4]; 16],
}

impl Machine<'_> {
    fn reg(&self, id: NodeId) -> usize {
        self.dag.node(id).reg.expect("schedule node without a register") as usize
    }

    fn int(&self, id: NodeId) -> i64 {
        self.gpr[self.reg(id)]
    }

    fn lanes(&self, id: NodeId) -> [u32; 4] {
        self.sse[self.reg(id) - 16]
    }

    fn lanes_f(&self, id: NodeId) -> [f32; 4] {
        self.lanes(id).map(f32::from_bits)
    }

    fn set_int(&mut self, id: NodeId, v: i64) {
        let r = self.reg(id);
        self.gpr[r] = v;
    }

    fn set_lanes(&mut self, id: NodeId, v: [u32; 4]) {
        let r = self.reg(id) - 16;
        self.sse[r] = v;
    }

    fn set_lanes_f(&mut self, id: NodeId, v: [f32; 4]) {
        self.set_lanes(id, v.map(f32::to_bits));
    }

    fn exec(&mut self, code: &[NodeId]) {
        for &id in code {
            self.step(id);
        }
    }

    fn step(&mut self, id: NodeId) {
        use Op::*;
        let node = self.dag.node(id);
        let inputs = &node.inputs;

        match node.op {
            Const => match node.ty {
                Ty::Float => self.set_lanes(id, [node.fval.to_bits(); 4]),
                Ty::Int => self.set_int(id, node.ival as i64),
                Ty::Bool => {
                    let mask = if node.ival != 0 { u32::MAX } else { 0 };
                    self.set_lanes(id, [mask; 4]);
                }
            },

            VarX | VarY | VarT | VarC => {}

            Plus | Minus | Times => {
                if node.ty == Ty::Int {
                    let (a, b) = (self.int(inputs[0]), self.int(inputs[1]));
                    let v = match node.op {
                        Plus => a.wrapping_add(b),
                        Minus => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    };
                    self.set_int(id, v);
                } else {
                    let (a, b) = (self.lanes_f(inputs[0]), self.lanes_f(inputs[1]));
                    let mut out = [0.0f32; 4];
                    for k in 0..4 {
                        out[k] = match node.op {
                            Plus => a[k] + b[k],
                            Minus => a[k] - b[k],
                            _ => a[k] * b[k],
                        };
                    }
                    self.set_lanes_f(id, out);
                }
            }
            Divide => {
                let (a, b) = (self.lanes_f(inputs[0]), self.lanes_f(inputs[1]));
                let mut out = [0.0f32; 4];
                for k in 0..4 {
                    out[k] = a[k] / b[k];
                }
                self.set_lanes_f(id, out);
            }
            PlusImm => {
                let v = self.int(inputs[0]).wrapping_add(node.ival as i64);
                self.set_int(id, v);
            }
            TimesImm => {
                let v = self.int(inputs[0]).wrapping_mul(node.ival as i64);
                self.set_int(id, v);
            }

            And | Or | Nand => {
                let (a, b) = (self.lanes(inputs[0]), self.lanes(inputs[1]));
                let mut out = [0u32; 4];
                for k in 0..4 {
                    out[k] = match node.op {
                        And => a[k] & b[k],
                        Or => a[k] | b[k],
                        _ => !a[k] & b[k],
                    };
                }
                self.set_lanes(id, out);
            }

            Lt | Gt | Lte | Gte | Eq | Neq => {
                let (a, b) = (self.lanes_f(inputs[0]), self.lanes_f(inputs[1]));
                let mut out = [0u32; 4];
                for k in 0..4 {
                    let hit = match node.op {
                        Lt => a[k] < b[k],
                        Gt => a[k] > b[k],
                        Lte => a[k] <= b[k],
                        Gte => a[k] >= b[k],
                        Eq => a[k] == b[k],
                        _ => a[k] != b[k],
                    };
                    out[k] = if hit { u32::MAX } else { 0 };
                }
                self.set_lanes(id, out);
            }

            IntToFloat => {
                let v = self.int(inputs[0]);
                // the emitter broadcasts when the slope is unknown
                let slope = self.dag.x_slope(inputs[0]).unwrap_or(0);
                let mut out = [0.0f32; 4];
                for (k, o) in out.iter_mut().enumerate() {
                    *o = (v + k as i64 * slope) as f32;
                }
                self.set_lanes_f(id, out);
            }

            Load | LoadImm => {
                let offset = if node.op == LoadImm { node.ival } else { 0 } as i64;
                let base = self.int(inputs[0]) + offset;
                let xs4 = (self.input.xstride * 4) as i64;
                let mut out = [0u32; 4];
                for (k, o) in out.iter_mut().enumerate() {
                    let byte = base + k as i64 * xs4;
                    let elem = (byte / 4) as usize;
                    *o = self.input.data()[elem].to_bits();
                }
                self.set_lanes(id, out);
            }

            // the emitter produced a diagnostic and no instruction, so
            // the destination register keeps its stale value
            ATan2 | Mod | Power | Sin | Cos | Tan | ASin | ACos | ATan | Exp | Log | Floor
            | Ceil | Round | Abs | FloatToInt | NoOp => {}
        }
    }
}

//! Machine-code emission.
//!
//! Walks the allocator's schedule and turns every node into x86-64
//! instructions, wrapping the per-level bodies in the frame/row/column
//! loop nest and finishing each four-pixel step with a channel
//! transpose written through non-temporal stores.
//!
//! The emitter has three states: prologue, in-loop, epilogue; the
//! transitions are linear and there are no back-edges besides the loop
//! branches themselves.

use pixeljit_asm::{Assembler, CmpOp, Mem, RegId, XmmId};
use tracing::warn;

use crate::error::CompileError;
use crate::image::ImageView;
use crate::ir::{Dag, NodeId, Op, Ty};
use crate::regalloc::Schedule;

const X: RegId = RegId::RAX;
const Y: RegId = RegId::RCX;
const T: RegId = RegId::R8;
const C: RegId = RegId::RSI;
const IN: RegId = RegId::RDX;
const OUT: RegId = RegId::RDI;
const OUT_BASE: RegId = RegId::R9;
const TMP: RegId = RegId::R15;
const STMP: XmmId = XmmId::XMM15;
const STMP2: XmmId = XmmId::XMM14;

/// Emits the compiled routine for one schedule.
pub struct CodeGen<'a> {
    asm: &'a mut Assembler,
    dag: &'a Dag,
    input: &'a ImageView<'a>,
    output: &'a ImageView<'a>,
    unsupported: Vec<&'static str>,
}

impl<'a> CodeGen<'a> {
    /// A fresh emitter over `asm`.
    pub fn new(
        asm: &'a mut Assembler,
        dag: &'a Dag,
        input: &'a ImageView<'a>,
        output: &'a ImageView<'a>,
    ) -> Self {
        Self {
            asm,
            dag,
            input,
            output,
            unsupported: Vec::new(),
        }
    }

    /// The opcodes that produced diagnostics instead of instructions.
    pub fn into_unsupported(self) -> Vec<&'static str> {
        self.unsupported
    }

    /// Emit the whole routine: prologue, the five schedule levels inside
    /// their loops, the transpose-and-store epilogue of the x step, and
    /// the counter updates.
    pub fn emit_program(
        &mut self,
        schedule: &Schedule,
        roots: &[NodeId],
    ) -> Result<(), CompileError> {
        let channels = self.output.channels;
        let group_bytes = (channels * 4 * 4) as i32;

        // align the stack and save the callee-saved registers we touch
        self.asm.sub_ri(RegId::RSP, 8);
        for reg in [
            RegId::RBX,
            RegId::RBP,
            RegId::R12,
            RegId::R13,
            RegId::R14,
            RegId::R15,
        ] {
            self.asm.push(reg);
        }
        self.asm.mov_rr(OUT_BASE, OUT);

        // compile-time constants
        self.body(&schedule.order[0])?;
        self.asm.mov_ri(T, 0);
        self.asm.label("tloop")?;

        // frame-invariant values
        self.body(&schedule.order[1])?;
        self.asm.mov_ri(Y, 0);
        self.asm.label("yloop")?;

        // out cursor = base + t*tstride*4 + y*ystride*4
        self.asm.mov_rr(OUT, OUT_BASE);
        self.asm.mov_rr(TMP, T);
        self.asm
            .imul_rri(TMP, TMP, (self.output.tstride * 4) as i32);
        self.asm.add_rr(OUT, TMP);
        self.asm.mov_rr(TMP, Y);
        self.asm
            .imul_rri(TMP, TMP, (self.output.ystride * 4) as i32);
        self.asm.add_rr(OUT, TMP);

        // row-invariant values
        self.body(&schedule.order[2])?;
        self.asm.mov_ri(X, 0);
        self.asm.label("xloop")?;

        // column-step values
        self.body(&schedule.order[3])?;

        // the channel variable was substituted away; the counter only
        // keeps the documented ABI shape
        self.asm.mov_ri(C, 0);
        self.body(&schedule.order[4])?;

        self.transpose(roots)?;

        self.asm.add_ri(OUT, group_bytes);
        self.asm.add_ri(X, 4);
        self.asm.cmp_ri(X, self.input.width as i32);
        self.asm.jl("xloop");
        self.asm.add_ri(Y, 1);
        self.asm.cmp_ri(Y, self.input.height as i32);
        self.asm.jl("yloop");
        self.asm.add_ri(T, 1);
        self.asm.cmp_ri(T, self.input.frames as i32);
        self.asm.jl("tloop");

        for reg in [
            RegId::R15,
            RegId::R14,
            RegId::R13,
            RegId::R12,
            RegId::RBP,
            RegId::RBX,
        ] {
            self.asm.pop(reg);
        }
        self.asm.add_ri(RegId::RSP, 8);
        self.asm.ret();
        Ok(())
    }

    fn reg_of(&self, id: NodeId) -> Result<u8, CompileError> {
        self.dag
            .node(id)
            .reg
            .ok_or_else(|| CompileError::Type(format!("{} was never allocated", self.dag.node(id).op.name())))
    }

    fn body(&mut self, code: &[NodeId]) -> Result<(), CompileError> {
        for &id in code {
            self.emit_node(id)?;
        }
        Ok(())
    }

    fn emit_node(&mut self, id: NodeId) -> Result<(), CompileError> {
        use Op::*;
        let node = self.dag.node(id);
        let op = node.op;
        let inputs = node.inputs.clone();
        let reg = self.reg_of(id)?;
        let gpr = reg < 16;

        let in_reg = |gen: &Self, i: usize| gen.reg_of(inputs[i]);

        match op {
            Const => self.emit_const(id, reg)?,

            // the loop counters already live in their ABI registers
            VarX | VarY | VarT | VarC => {}

            Plus => {
                if gpr {
                    let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                    self.int_operands(op, s1, s2)?;
                    gpr_commutative(self.asm, Assembler::add_rr, g(reg), g(s1), g(s2));
                } else {
                    let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                    self.sse_operands(op, s1, s2)?;
                    sse_commutative(self.asm, Assembler::addps, x(reg), x(s1), x(s2));
                }
            }
            Minus => {
                if gpr {
                    let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                    self.int_operands(op, s1, s2)?;
                    gpr_noncommutative(self.asm, Assembler::sub_rr, g(reg), g(s1), g(s2));
                } else {
                    let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                    self.sse_operands(op, s1, s2)?;
                    sse_noncommutative(self.asm, Assembler::subps, x(reg), x(s1), x(s2));
                }
            }
            Times => {
                if gpr {
                    let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                    self.int_operands(op, s1, s2)?;
                    gpr_commutative(self.asm, Assembler::imul_rr, g(reg), g(s1), g(s2));
                } else {
                    let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                    self.sse_operands(op, s1, s2)?;
                    sse_commutative(self.asm, Assembler::mulps, x(reg), x(s1), x(s2));
                }
            }
            PlusImm => {
                let s1 = in_reg(self, 0)?;
                let imm = node.ival;
                if reg == s1 {
                    self.asm.add_ri(g(reg), imm);
                } else {
                    self.asm.mov_ri(g(reg), imm as i64);
                    self.asm.add_rr(g(reg), g(s1));
                }
            }
            TimesImm => {
                let s1 = in_reg(self, 0)?;
                self.asm.imul_rri(g(reg), g(s1), node.ival);
            }
            Divide => {
                let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                self.sse_operands(op, s1, s2)?;
                sse_noncommutative(self.asm, Assembler::divps, x(reg), x(s1), x(s2));
            }
            And => {
                let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                self.sse_operands(op, s1, s2)?;
                sse_commutative(self.asm, Assembler::andps, x(reg), x(s1), x(s2));
            }
            Nand => {
                let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                self.sse_operands(op, s1, s2)?;
                sse_noncommutative(self.asm, Assembler::andnps, x(reg), x(s1), x(s2));
            }
            Or => {
                let (s1, s2) = (in_reg(self, 0)?, in_reg(self, 1)?);
                self.sse_operands(op, s1, s2)?;
                sse_commutative(self.asm, Assembler::orps, x(reg), x(s1), x(s2));
            }
            Eq => self.compare(id, CmpOp::Eq, CmpOp::Eq)?,
            Neq => self.compare(id, CmpOp::Neq, CmpOp::Neq)?,
            Lt => self.compare(id, CmpOp::Lt, CmpOp::Nle)?,
            Gt => self.compare(id, CmpOp::Nle, CmpOp::Lt)?,
            Lte => self.compare(id, CmpOp::Le, CmpOp::Nlt)?,
            Gte => self.compare(id, CmpOp::Nlt, CmpOp::Le)?,

            IntToFloat => {
                let s1 = in_reg(self, 0)?;
                if !(s1 < 16 && !gpr) {
                    return Err(CompileError::Type(
                        "IntToFloat converts a GPR into an SSE register".to_string(),
                    ));
                }
                self.int_to_float(x(reg), g(s1), inputs[0]);
            }

            Load | LoadImm => {
                let s1 = in_reg(self, 0)?;
                if !(s1 < 16 && !gpr) {
                    return Err(CompileError::Type(
                        "loads take a GPR address into an SSE register".to_string(),
                    ));
                }
                let offset = if op == LoadImm { node.ival } else { 0 };
                self.load_lanes(x(reg), g(s1), offset);
            }

            ATan2 | Mod | Power | Sin | Cos | Tan | ASin | ACos | ATan | Exp | Log | Floor
            | Ceil | Round | Abs | FloatToInt => {
                warn!(opcode = op.name(), "not implemented, no instruction emitted");
                self.unsupported.push(op.name());
            }

            NoOp => {}
        }
        Ok(())
    }

    fn emit_const(&mut self, id: NodeId, reg: u8) -> Result<(), CompileError> {
        let node = self.dag.node(id);
        match node.ty {
            Ty::Float => {
                let dst = x(reg);
                if node.fval == 0.0 {
                    self.asm.xorps(dst, dst);
                } else {
                    // materialise through the scratch GPR; no data
                    // section, no relocations
                    self.asm.mov_ri32(TMP, node.fval.to_bits());
                    self.asm.movd(dst, TMP);
                    self.asm.shufps(dst, dst, 0, 0, 0, 0);
                }
            }
            Ty::Bool => {
                let dst = x(reg);
                if node.ival != 0 {
                    self.asm.cmpps(dst, dst, CmpOp::Eq);
                } else {
                    self.asm.xorps(dst, dst);
                }
            }
            Ty::Int => {
                if reg >= 16 {
                    return Err(CompileError::Type(
                        "integer constant allocated to an SSE register".to_string(),
                    ));
                }
                self.asm.mov_ri(g(reg), node.ival as i64);
            }
        }
        Ok(())
    }

    fn compare(&mut self, id: NodeId, pred: CmpOp, flipped: CmpOp) -> Result<(), CompileError> {
        let node = self.dag.node(id);
        let (a, b) = (node.inputs[0], node.inputs[1]);
        let dst = x(self.reg_of(id)?);
        let s1 = x(self.reg_of(a)?);
        let s2 = x(self.reg_of(b)?);
        if dst == s1 {
            self.asm.cmpps(dst, s2, pred);
        } else if dst == s2 {
            self.asm.cmpps(dst, s1, flipped);
        } else {
            self.asm.movaps(dst, s1);
            self.asm.cmpps(dst, s2, pred);
        }
        Ok(())
    }

    // Broadcast conversion of an integer. A value that is linear in x
    // carries a different integer in each lane, so the lanes are
    // gathered like a load: convert v, v+s, v+2s, v+3s and pack.
    fn int_to_float(&mut self, dst: XmmId, src: RegId, input: NodeId) {
        match self.dag.x_slope(input) {
            Some(0) => {
                self.asm.cvtsi2ss(dst, src);
                self.asm.shufps(dst, dst, 0, 0, 0, 0);
            }
            Some(slope) => {
                self.asm.cvtsi2ss(dst, src);
                self.asm.mov_rr(TMP, src);
                self.asm.add_ri(TMP, slope as i32);
                self.asm.cvtsi2ss(STMP, TMP);
                self.asm.punpckldq(dst, STMP);
                self.asm.mov_rr(TMP, src);
                self.asm.add_ri(TMP, 2 * slope as i32);
                self.asm.cvtsi2ss(STMP, TMP);
                self.asm.mov_rr(TMP, src);
                self.asm.add_ri(TMP, 3 * slope as i32);
                self.asm.cvtsi2ss(STMP2, TMP);
                self.asm.punpckldq(STMP, STMP2);
                self.asm.punpcklqdq(dst, STMP);
            }
            None => {
                warn!("IntToFloat of a value non-linear in x; lanes collapse to the first pixel");
                self.unsupported.push("IntToFloat");
                self.asm.cvtsi2ss(dst, src);
                self.asm.shufps(dst, dst, 0, 0, 0, 0);
            }
        }
    }

    // Four scalar loads one x step apart, packed into one register.
    fn load_lanes(&mut self, dst: XmmId, addr: RegId, offset: i32) {
        let xs4 = (self.input.xstride * 4) as i32;
        let lane = |k: i32| Mem::base_index_disp(IN, addr, offset + k * xs4);
        self.asm.movss_load(dst, lane(0));
        self.asm.movss_load(STMP, lane(1));
        self.asm.punpckldq(dst, STMP);
        self.asm.movss_load(STMP, lane(2));
        self.asm.movss_load(STMP2, lane(3));
        self.asm.punpckldq(STMP, STMP2);
        self.asm.punpcklqdq(dst, STMP);
    }

    // Interleave the three channel vectors into pixel order and store
    // them. Builds every output block in the scratch registers so the
    // channel roots survive into the next iteration (they may have been
    // hoisted out of this loop).
    fn transpose(&mut self, roots: &[NodeId]) -> Result<(), CompileError> {
        if roots.len() != 3 {
            return Err(CompileError::Shape(format!(
                "transpose handles 3 channels, got {}",
                roots.len()
            )));
        }
        let r = x(self.reg_of(roots[0])?);
        let gch = x(self.reg_of(roots[1])?);
        let b = x(self.reg_of(roots[2])?);

        // r = r0 r1 r2 r3, g = g0 g1 g2 g3, b = b0 b1 b2 b3
        self.asm.movaps(STMP2, r);
        self.asm.shufps(STMP2, gch, 0, 1, 0, 1);
        // STMP2 = r0 r1 g0 g1
        self.asm.movaps(STMP, b);
        self.asm.shufps(STMP, r, 0, 0, 1, 1);
        // STMP = b0 b0 r1 r1
        self.asm.shufps(STMP2, STMP, 0, 2, 0, 2);
        // STMP2 = r0 g0 b0 r1
        self.asm.movntps(Mem::base(OUT), STMP2);

        self.asm.movaps(STMP2, gch);
        self.asm.shufps(STMP2, b, 1, 2, 1, 2);
        // STMP2 = g1 g2 b1 b2
        self.asm.movaps(STMP, r);
        self.asm.shufps(STMP, gch, 2, 2, 2, 2);
        // STMP = r2 r2 g2 g2
        self.asm.shufps(STMP2, STMP, 0, 2, 0, 2);
        // STMP2 = g1 b1 r2 g2
        self.asm.movntps(Mem::base_disp(OUT, 16), STMP2);

        self.asm.movaps(STMP2, b);
        self.asm.shufps(STMP2, r, 2, 2, 3, 3);
        // STMP2 = b2 b2 r3 r3
        self.asm.movaps(STMP, gch);
        self.asm.shufps(STMP, b, 3, 3, 3, 3);
        // STMP = g3 g3 b3 b3
        self.asm.shufps(STMP2, STMP, 0, 2, 0, 2);
        // STMP2 = b2 r3 g3 b3
        self.asm.movntps(Mem::base_disp(OUT, 32), STMP2);
        Ok(())
    }

    fn int_operands(&self, op: Op, s1: u8, s2: u8) -> Result<(), CompileError> {
        if s1 < 16 && s2 < 16 {
            Ok(())
        } else {
            Err(CompileError::Type(format!(
                "{} mixes register banks",
                op.name()
            )))
        }
    }

    fn sse_operands(&self, op: Op, s1: u8, s2: u8) -> Result<(), CompileError> {
        if s1 >= 16 && s2 >= 16 {
            Ok(())
        } else {
            Err(CompileError::Type(format!(
                "{} mixes register banks",
                op.name()
            )))
        }
    }
}

fn g(reg: u8) -> RegId {
    RegId::new(reg)
}

fn x(reg: u8) -> XmmId {
    XmmId::new(reg - 16)
}

// dst-inheritance patterns for the two-operand instruction forms

fn sse_commutative(
    asm: &mut Assembler,
    op: fn(&mut Assembler, XmmId, XmmId),
    dst: XmmId,
    s1: XmmId,
    s2: XmmId,
) {
    if dst == s1 {
        op(asm, dst, s2);
    } else if dst == s2 {
        op(asm, dst, s1);
    } else {
        asm.movaps(dst, s1);
        op(asm, dst, s2);
    }
}

fn sse_noncommutative(
    asm: &mut Assembler,
    op: fn(&mut Assembler, XmmId, XmmId),
    dst: XmmId,
    s1: XmmId,
    s2: XmmId,
) {
    if dst == s1 {
        op(asm, dst, s2);
    } else if dst == s2 {
        // rearrange through scratch so the subtrahend survives
        asm.movaps(STMP, s2);
        asm.movaps(s2, s1);
        op(asm, s2, STMP);
    } else {
        asm.movaps(dst, s1);
        op(asm, dst, s2);
    }
}

fn gpr_commutative(
    asm: &mut Assembler,
    op: fn(&mut Assembler, RegId, RegId),
    dst: RegId,
    s1: RegId,
    s2: RegId,
) {
    if dst == s1 {
        op(asm, dst, s2);
    } else if dst == s2 {
        op(asm, dst, s1);
    } else {
        asm.mov_rr(dst, s1);
        op(asm, dst, s2);
    }
}

fn gpr_noncommutative(
    asm: &mut Assembler,
    op: fn(&mut Assembler, RegId, RegId),
    dst: RegId,
    s1: RegId,
    s2: RegId,
) {
    if dst == s1 {
        op(asm, dst, s2);
    } else if dst == s2 {
        asm.mov_rr(TMP, s2);
        asm.mov_rr(s2, s1);
        op(asm, s2, TMP);
    } else {
        asm.mov_rr(dst, s1);
        op(asm, dst, s2);
    }
}

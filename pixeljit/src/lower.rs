//! AST to DAG lowering.
//!
//! Statistics fold to literals, the branch-free conditional is built
//! from And/Nand/Or masks, and sampling becomes integer address
//! arithmetic feeding `Load`. Addresses are byte offsets relative to
//! the input base pointer register, one `var * (4 * stride)` term per
//! axis, so the rebalancer can hoist the outer-loop partial sums and
//! the load fusion can absorb the specialised channel term.

use crate::ast::{BinOp, CmpFn, Expr, StatFn, UnaryFn};
use crate::error::CompileError;
use crate::image::ImageView;
use crate::ir::{Dag, NodeId, Op, Ty};
use crate::stats::Stats;

/// Lower `expr` into `dag`, returning the root node.
pub fn lower(
    dag: &mut Dag,
    im: &ImageView<'_>,
    stats: &Stats,
    expr: &Expr,
) -> Result<NodeId, CompileError> {
    Lowerer { dag, im, stats }.go(expr)
}

struct Lowerer<'a, 'im> {
    dag: &'a mut Dag,
    im: &'a ImageView<'im>,
    stats: &'a Stats,
}

impl Lowerer<'_, '_> {
    fn go(&mut self, expr: &Expr) -> Result<NodeId, CompileError> {
        match expr {
            Expr::X => Ok(self.dag.var(Op::VarX)),
            Expr::Y => Ok(self.dag.var(Op::VarY)),
            Expr::T => Ok(self.dag.var(Op::VarT)),
            Expr::C => Ok(self.dag.var(Op::VarC)),
            Expr::Width => Ok(self.dag.int_const(self.im.width as i32)),
            Expr::Height => Ok(self.dag.int_const(self.im.height as i32)),
            Expr::Frames => Ok(self.dag.int_const(self.im.frames as i32)),
            Expr::Channels => Ok(self.dag.int_const(self.im.channels as i32)),
            Expr::Lit(v) => Ok(self.literal(*v)),

            Expr::Val => {
                let x = self.dag.var(Op::VarX);
                let y = self.dag.var(Op::VarY);
                let t = self.dag.var(Op::VarT);
                let c = self.dag.var(Op::VarC);
                let addr = self.address(x, y, t, c)?;
                self.dag.make(Op::Load, vec![addr], 0)
            }
            Expr::SampleHere(u) => {
                let x = self.dag.var(Op::VarX);
                let y = self.dag.var(Op::VarY);
                let t = self.dag.var(Op::VarT);
                let u = self.go(u)?;
                let u = self.dag.coerce(u, Ty::Int)?;
                let addr = self.address(x, y, t, u)?;
                self.dag.make(Op::Load, vec![addr], 0)
            }
            Expr::Sample2D(u, v) => {
                let u = self.go(u)?;
                let u = self.dag.coerce(u, Ty::Int)?;
                let v = self.go(v)?;
                let v = self.dag.coerce(v, Ty::Int)?;
                let t = self.dag.var(Op::VarT);
                let c = self.dag.var(Op::VarC);
                let addr = self.address(u, v, t, c)?;
                self.dag.make(Op::Load, vec![addr], 0)
            }
            Expr::Sample3D(u, v, w) => {
                let u = self.go(u)?;
                let u = self.dag.coerce(u, Ty::Int)?;
                let v = self.go(v)?;
                let v = self.dag.coerce(v, Ty::Int)?;
                let w = self.go(w)?;
                let w = self.dag.coerce(w, Ty::Int)?;
                let c = self.dag.var(Op::VarC);
                let addr = self.address(u, v, w, c)?;
                self.dag.make(Op::Load, vec![addr], 0)
            }

            Expr::Stat(f) => Ok(self.dag.float_const(self.whole_image_stat(*f))),
            Expr::StatOf(f, arg) => {
                let c = self.constant_channel(arg, "channel statistic")?;
                let v = match f {
                    StatFn::Mean => self.stats.mean_of(c),
                    StatFn::Sum => self.stats.sum_of(c),
                    StatFn::Min => self.stats.minimum_of(c),
                    StatFn::Max => self.stats.maximum_of(c),
                    StatFn::Variance => self.stats.variance_of(c),
                    StatFn::Stddev => self.stats.stddev_of(c),
                    StatFn::Skew => self.stats.skew_of(c),
                    StatFn::Kurtosis => self.stats.kurtosis_of(c),
                };
                Ok(self.dag.float_const(v))
            }
            Expr::Covariance(a, b) => {
                let c1 = self.constant_channel(a, "covariance")?;
                let c2 = self.constant_channel(b, "covariance")?;
                Ok(self.dag.float_const(self.stats.covariance(c1, c2)))
            }

            Expr::Neg(arg) => {
                let arg = self.go(arg)?;
                let zero = self.dag.int_const(0);
                self.dag.make(Op::Minus, vec![zero, arg], 0)
            }
            Expr::Unary(f, arg) => {
                let arg = self.go(arg)?;
                let op = match f {
                    UnaryFn::Sin => Op::Sin,
                    UnaryFn::Cos => Op::Cos,
                    UnaryFn::Tan => Op::Tan,
                    UnaryFn::Asin => Op::ASin,
                    UnaryFn::Acos => Op::ACos,
                    UnaryFn::Atan => Op::ATan,
                    UnaryFn::Abs => Op::Abs,
                    UnaryFn::Floor => Op::Floor,
                    UnaryFn::Ceil => Op::Ceil,
                    UnaryFn::Round => Op::Round,
                    UnaryFn::Log => Op::Log,
                    UnaryFn::Exp => Op::Exp,
                };
                self.dag.make(op, vec![arg], 0)
            }
            Expr::Binary(f, a, b) => {
                let a = self.go(a)?;
                let b = self.go(b)?;
                let op = match f {
                    BinOp::Add => Op::Plus,
                    BinOp::Sub => Op::Minus,
                    BinOp::Mul => Op::Times,
                    BinOp::Div => Op::Divide,
                    BinOp::Mod => Op::Mod,
                    BinOp::Pow => Op::Power,
                    BinOp::Atan2 => Op::ATan2,
                };
                self.dag.make(op, vec![a, b], 0)
            }
            Expr::Cmp(f, a, b) => {
                let a = self.go(a)?;
                let b = self.go(b)?;
                let op = match f {
                    CmpFn::Lt => Op::Lt,
                    CmpFn::Gt => Op::Gt,
                    CmpFn::Le => Op::Lte,
                    CmpFn::Ge => Op::Gte,
                    CmpFn::Eq => Op::Eq,
                    CmpFn::Ne => Op::Neq,
                };
                self.dag.make(op, vec![a, b], 0)
            }

            Expr::IfThenElse(cond, then_case, else_case) => {
                let cond = self.go(cond)?;
                if self.dag.node(cond).op == Op::Const {
                    // branch on folded conditions immediately
                    let n = self.dag.node(cond);
                    let truthy = match n.ty {
                        Ty::Float => n.fval != 0.0,
                        _ => n.ival != 0,
                    };
                    return if truthy {
                        self.go(then_case)
                    } else {
                        self.go(else_case)
                    };
                }

                let then_n = self.go(then_case)?;
                let else_n = self.go(else_case)?;
                // masks live in the SSE bank, so numeric arms unify there
                let arm_ty = if self.dag.node(then_n).ty == Ty::Bool
                    && self.dag.node(else_n).ty == Ty::Bool
                {
                    Ty::Bool
                } else {
                    Ty::Float
                };
                let then_n = self.dag.coerce(then_n, arm_ty)?;
                let else_n = self.dag.coerce(else_n, arm_ty)?;
                let masked_then = self.dag.make(Op::And, vec![cond, then_n], 0)?;
                let masked_else = self.dag.make(Op::Nand, vec![cond, else_n], 0)?;
                self.dag.make(Op::Or, vec![masked_then, masked_else], 0)
            }
        }
    }

    // integral literals stay in the integer domain so address arithmetic
    // and fused immediates can use them
    fn literal(&mut self, v: f32) -> NodeId {
        if v == v.floor() && v.abs() < i32::MAX as f32 {
            self.dag.int_const(v as i32)
        } else {
            self.dag.float_const(v)
        }
    }

    // byte offset of (x, y, t, c) relative to the input base pointer
    fn address(
        &mut self,
        x: NodeId,
        y: NodeId,
        t: NodeId,
        c: NodeId,
    ) -> Result<NodeId, CompileError> {
        let mut addr = self.stride_term(t, self.im.tstride)?;
        let y_term = self.stride_term(y, self.im.ystride)?;
        addr = self.dag.make(Op::Plus, vec![addr, y_term], 0)?;
        let x_term = self.stride_term(x, self.im.xstride)?;
        addr = self.dag.make(Op::Plus, vec![addr, x_term], 0)?;
        let c_term = self.stride_term(c, self.im.cstride)?;
        self.dag.make(Op::Plus, vec![addr, c_term], 0)
    }

    fn stride_term(&mut self, index: NodeId, stride: usize) -> Result<NodeId, CompileError> {
        let scale = self.dag.int_const(4 * stride as i32);
        self.dag.make(Op::Times, vec![index, scale], 0)
    }

    fn whole_image_stat(&self, f: StatFn) -> f32 {
        match f {
            StatFn::Mean => self.stats.mean(),
            StatFn::Sum => self.stats.sum(),
            StatFn::Min => self.stats.minimum(),
            StatFn::Max => self.stats.maximum(),
            StatFn::Variance => self.stats.variance(),
            StatFn::Stddev => self.stats.stddev(),
            StatFn::Skew => self.stats.skew(),
            StatFn::Kurtosis => self.stats.kurtosis(),
        }
    }

    // statistics index channels at compile time, so the argument must
    // fold to a constant
    fn constant_channel(&mut self, arg: &Expr, what: &str) -> Result<usize, CompileError> {
        let id = self.go(arg)?;
        let n = self.dag.node(id);
        if n.op != Op::Const {
            return Err(CompileError::Type(format!(
                "{what} argument must be a constant channel index"
            )));
        }
        let c = match n.ty {
            Ty::Float => n.fval.round() as i64,
            _ => n.ival as i64,
        };
        if c < 0 || c >= self.im.channels as i64 {
            return Err(CompileError::Type(format!(
                "{what} channel {c} out of range for {} channels",
                self.im.channels
            )));
        }
        Ok(c as usize)
    }
}

//! Reference tree-walking interpreter.
//!
//! Evaluates the AST directly at one pixel with f32 arithmetic. The
//! compiled routine must agree with this walker at every pixel; the
//! test-suite holds the two against each other.

use crate::ast::{BinOp, CmpFn, Expr, StatFn, UnaryFn};
use crate::image::ImageView;
use crate::stats::Stats;

/// Interprets expressions over one input image.
#[derive(Debug)]
pub struct Interpreter<'a> {
    im: ImageView<'a>,
    stats: Stats,
}

impl<'a> Interpreter<'a> {
    /// Build the statistics oracle and wrap the image.
    pub fn new(im: ImageView<'a>) -> Self {
        let stats = Stats::new(&im);
        Self { im, stats }
    }

    /// Evaluate `expr` at pixel `(x, y, t, c)`.
    pub fn eval(&self, expr: &Expr, x: usize, y: usize, t: usize, c: usize) -> f32 {
        let at = Point { x, y, t, c };
        self.go(expr, at)
    }

    fn go(&self, e: &Expr, at: Point) -> f32 {
        match e {
            Expr::X => at.x as f32,
            Expr::Y => at.y as f32,
            Expr::T => at.t as f32,
            Expr::C => at.c as f32,
            Expr::Val => self.im.at(at.x, at.y, at.t, at.c),
            Expr::Width => self.im.width as f32,
            Expr::Height => self.im.height as f32,
            Expr::Frames => self.im.frames as f32,
            Expr::Channels => self.im.channels as f32,
            Expr::Lit(v) => *v,
            Expr::Neg(a) => -self.go(a, at),
            Expr::Unary(f, a) => {
                let v = self.go(a, at);
                match f {
                    UnaryFn::Sin => v.sin(),
                    UnaryFn::Cos => v.cos(),
                    UnaryFn::Tan => v.tan(),
                    UnaryFn::Asin => v.asin(),
                    UnaryFn::Acos => v.acos(),
                    UnaryFn::Atan => v.atan(),
                    UnaryFn::Abs => v.abs(),
                    UnaryFn::Floor => v.floor(),
                    UnaryFn::Ceil => v.ceil(),
                    UnaryFn::Round => v.round(),
                    UnaryFn::Log => v.ln(),
                    UnaryFn::Exp => v.exp(),
                }
            }
            Expr::Binary(f, a, b) => {
                let a = self.go(a, at);
                let b = self.go(b, at);
                match f {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Mod => a % b,
                    BinOp::Pow => a.powf(b),
                    BinOp::Atan2 => a.atan2(b),
                }
            }
            Expr::Cmp(f, a, b) => {
                let a = self.go(a, at);
                let b = self.go(b, at);
                let hit = match f {
                    CmpFn::Lt => a < b,
                    CmpFn::Gt => a > b,
                    CmpFn::Le => a <= b,
                    CmpFn::Ge => a >= b,
                    CmpFn::Eq => a == b,
                    CmpFn::Ne => a != b,
                };
                hit as i32 as f32
            }
            // any nonzero condition selects the then branch, matching
            // the compiled mask semantics
            Expr::IfThenElse(cond, t, f) => {
                if self.go(cond, at) != 0.0 {
                    self.go(t, at)
                } else {
                    self.go(f, at)
                }
            }
            Expr::Stat(f) => self.whole_image(*f),
            Expr::StatOf(f, arg) => {
                let ch = self.channel(arg, at);
                match f {
                    StatFn::Mean => self.stats.mean_of(ch),
                    StatFn::Sum => self.stats.sum_of(ch),
                    StatFn::Min => self.stats.minimum_of(ch),
                    StatFn::Max => self.stats.maximum_of(ch),
                    StatFn::Variance => self.stats.variance_of(ch),
                    StatFn::Stddev => self.stats.stddev_of(ch),
                    StatFn::Skew => self.stats.skew_of(ch),
                    StatFn::Kurtosis => self.stats.kurtosis_of(ch),
                }
            }
            Expr::Covariance(a, b) => {
                let c1 = self.channel(a, at);
                let c2 = self.channel(b, at);
                self.stats.covariance(c1, c2)
            }
            Expr::SampleHere(u) => {
                let ch = self.channel(u, at);
                self.im.at(at.x, at.y, at.t, ch)
            }
            Expr::Sample2D(u, v) => {
                let fx = self.go(u, at);
                let fy = self.go(v, at);
                let mut sample = vec![0.0; self.im.channels];
                self.im.sample2d(fx, fy, at.t, &mut sample);
                sample[at.c]
            }
            Expr::Sample3D(u, v, w) => {
                let fx = self.go(u, at);
                let fy = self.go(v, at);
                let ft = self.go(w, at);
                let mut sample = vec![0.0; self.im.channels];
                self.im.sample3d(fx, fy, ft, &mut sample);
                sample[at.c]
            }
        }
    }

    fn whole_image(&self, f: StatFn) -> f32 {
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

    fn channel(&self, e: &Expr, at: Point) -> usize {
        let c = self.go(e, at).round() as i64;
        c.clamp(0, self.im.channels as i64 - 1) as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Point {
    x: usize,
    y: usize,
    t: usize,
    c: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuf;
    use crate::parser::parse;

    fn ramp() -> ImageBuf {
        let mut im = ImageBuf::new(4, 2, 1, 3);
        im.fill_with(|x, y, _, c| 10.0 * x as f32 + y as f32 + 0.1 * c as f32);
        im
    }

    #[test]
    fn coordinates_and_uniforms() {
        let im = ramp();
        let interp = Interpreter::new(im.view());
        let e = parse("x + 10 * y + width").unwrap();
        assert_eq!(interp.eval(&e, 2, 1, 0, 0), 2.0 + 10.0 + 4.0);
    }

    #[test]
    fn val_reads_the_current_sample() {
        let im = ramp();
        let interp = Interpreter::new(im.view());
        let e = parse("val * 2").unwrap();
        assert_eq!(interp.eval(&e, 3, 1, 0, 2), 2.0 * (30.0 + 1.0 + 0.2));
    }

    #[test]
    fn ternary_follows_the_mask_semantics() {
        let im = ramp();
        let interp = Interpreter::new(im.view());
        let e = parse("(x > 1) ? 1 : 0").unwrap();
        assert_eq!(interp.eval(&e, 1, 0, 0, 0), 0.0);
        assert_eq!(interp.eval(&e, 2, 0, 0, 0), 1.0);
    }

    #[test]
    fn sample_here_indexes_a_channel() {
        let im = ramp();
        let interp = Interpreter::new(im.view());
        let e = parse("[2]").unwrap();
        assert!((interp.eval(&e, 1, 0, 0, 0) - 10.2).abs() < 1e-5);
    }

    #[test]
    fn integer_resample_matches_val() {
        let im = ramp();
        let interp = Interpreter::new(im.view());
        let e = parse("[x, y]").unwrap();
        let val = parse("val").unwrap();
        for y in 0..2 {
            for x in 0..4 {
                for c in 0..3 {
                    let a = interp.eval(&e, x, y, 0, c);
                    let b = interp.eval(&val, x, y, 0, c);
                    assert!((a - b).abs() < 1e-4, "({x},{y},{c}): {a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn statistics_are_pixel_invariant() {
        let im = ramp();
        let interp = Interpreter::new(im.view());
        let e = parse("mean()").unwrap();
        let first = interp.eval(&e, 0, 0, 0, 0);
        for x in 0..4 {
            assert_eq!(interp.eval(&e, x, 1, 0, 2), first);
        }
    }
}

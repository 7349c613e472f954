//! Recursive-descent parser for the expression grammar.
//!
//! ```text
//! IfThenElse := Condition ('?' Condition ':' Condition)?
//! Condition  := Sum (('<'|'<='|'>'|'>='|'=='|'!=') Sum)?
//! Sum        := Product (('+'|'-') Product)*
//! Product    := Factor (('*'|'/'|'%') Factor)*
//! Factor     := Term ('^' Term)?
//! Term       := Funct0 '(' ')' | Funct1 '(' IfThenElse ')'
//!             | Funct2 '(' IfThenElse ',' IfThenElse ')'
//!             | '-' Term | Var | '(' IfThenElse ')' | Float
//!             | '[' IfThenElse (',' IfThenElse){0,2} ']'
//!             | Uniform | Const
//! ```
//!
//! Whitespace is insignificant; unknown identifiers are fatal.

use crate::ast::{BinOp, CmpFn, Expr, StatFn, UnaryFn};
use crate::error::CompileError;

/// Parse an expression string into its syntax tree.
pub fn parse(src: &str) -> Result<Expr, CompileError> {
    let mut p = Parser { src, pos: 0 };
    let expr = p.if_then_else()?;
    p.skip_ws();
    if p.pos != src.len() {
        return Err(p.error("unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::Parse {
            pos: self.pos,
            msg: msg.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self
            .src
            .as_bytes()
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.as_bytes().get(self.pos).copied()
    }

    // consume `tok` if it is next, longest alternatives first at the
    // call sites
    fn eat(&mut self, tok: &str) -> bool {
        self.skip_ws();
        if self.src[self.pos..].starts_with(tok) {
            self.pos += tok.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &str) -> Result<(), CompileError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{tok}`")))
        }
    }

    fn if_then_else(&mut self) -> Result<Expr, CompileError> {
        let cond = self.condition()?;
        if self.eat("?") {
            let then_case = self.condition()?;
            self.expect(":")?;
            let else_case = self.condition()?;
            Ok(Expr::IfThenElse(
                Box::new(cond),
                Box::new(then_case),
                Box::new(else_case),
            ))
        } else {
            Ok(cond)
        }
    }

    fn condition(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.sum()?;
        let cmp = if self.eat("<=") {
            CmpFn::Le
        } else if self.eat(">=") {
            CmpFn::Ge
        } else if self.eat("==") {
            CmpFn::Eq
        } else if self.eat("!=") {
            CmpFn::Ne
        } else if self.eat("<") {
            CmpFn::Lt
        } else if self.eat(">") {
            CmpFn::Gt
        } else {
            return Ok(lhs);
        };
        let rhs = self.sum()?;
        Ok(Expr::Cmp(cmp, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.product()?;
        loop {
            let op = if self.eat("+") {
                BinOp::Add
            } else if self.eat("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn product(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.factor()?;
        loop {
            let op = if self.eat("*") {
                BinOp::Mul
            } else if self.eat("/") {
                BinOp::Div
            } else if self.eat("%") {
                BinOp::Mod
            } else {
                return Ok(lhs);
            };
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn factor(&mut self) -> Result<Expr, CompileError> {
        let base = self.term()?;
        if self.eat("^") {
            let exponent = self.term()?;
            Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)))
        } else {
            Ok(base)
        }
    }

    fn term(&mut self) -> Result<Expr, CompileError> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.term()?)))
            }
            Some(b'(') => {
                self.pos += 1;
                let inner = self.if_then_else()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(b'[') => {
                self.pos += 1;
                let u = self.if_then_else()?;
                let expr = if self.eat(",") {
                    let v = self.if_then_else()?;
                    if self.eat(",") {
                        let w = self.if_then_else()?;
                        Expr::Sample3D(Box::new(u), Box::new(v), Box::new(w))
                    } else {
                        Expr::Sample2D(Box::new(u), Box::new(v))
                    }
                } else {
                    Expr::SampleHere(Box::new(u))
                };
                self.expect("]")?;
                Ok(expr)
            }
            Some(b) if b.is_ascii_digit() || b == b'.' => self.float(),
            Some(b) if b.is_ascii_alphabetic() => self.identifier(),
            _ => Err(self.error("expected a term")),
        }
    }

    fn float(&mut self) -> Result<Expr, CompileError> {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        while bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        text.parse::<f32>()
            .map(Expr::Lit)
            .map_err(|_| CompileError::Parse {
                pos: start,
                msg: format!("malformed number `{text}`"),
            })
    }

    fn identifier(&mut self) -> Result<Expr, CompileError> {
        let start = self.pos;
        let bytes = self.src.as_bytes();
        while bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        let name = &self.src[start..self.pos];

        match name {
            "x" => Ok(Expr::X),
            "y" => Ok(Expr::Y),
            "t" => Ok(Expr::T),
            "c" => Ok(Expr::C),
            "val" => Ok(Expr::Val),
            "width" => Ok(Expr::Width),
            "height" => Ok(Expr::Height),
            "frames" => Ok(Expr::Frames),
            "channels" => Ok(Expr::Channels),
            "pi" => Ok(Expr::Lit(std::f32::consts::PI)),
            "e" => Ok(Expr::Lit(std::f32::consts::E)),
            "sin" => self.unary_call(UnaryFn::Sin),
            "cos" => self.unary_call(UnaryFn::Cos),
            "tan" => self.unary_call(UnaryFn::Tan),
            "asin" => self.unary_call(UnaryFn::Asin),
            "acos" => self.unary_call(UnaryFn::Acos),
            "atan" => self.unary_call(UnaryFn::Atan),
            "abs" => self.unary_call(UnaryFn::Abs),
            "floor" => self.unary_call(UnaryFn::Floor),
            "ceil" => self.unary_call(UnaryFn::Ceil),
            "round" => self.unary_call(UnaryFn::Round),
            "log" => self.unary_call(UnaryFn::Log),
            "exp" => self.unary_call(UnaryFn::Exp),
            "atan2" => {
                self.expect("(")?;
                let a = self.if_then_else()?;
                self.expect(",")?;
                let b = self.if_then_else()?;
                self.expect(")")?;
                Ok(Expr::Binary(BinOp::Atan2, Box::new(a), Box::new(b)))
            }
            "covariance" => {
                self.expect("(")?;
                let a = self.if_then_else()?;
                self.expect(",")?;
                let b = self.if_then_else()?;
                self.expect(")")?;
                Ok(Expr::Covariance(Box::new(a), Box::new(b)))
            }
            "mean" => self.stat_call(StatFn::Mean),
            "sum" => self.stat_call(StatFn::Sum),
            "min" => self.stat_call(StatFn::Min),
            "max" => self.stat_call(StatFn::Max),
            "variance" => self.stat_call(StatFn::Variance),
            "stddev" => self.stat_call(StatFn::Stddev),
            "skew" => self.stat_call(StatFn::Skew),
            "kurtosis" => self.stat_call(StatFn::Kurtosis),
            _ => Err(CompileError::Parse {
                pos: start,
                msg: format!("unknown identifier `{name}`"),
            }),
        }
    }

    fn unary_call(&mut self, f: UnaryFn) -> Result<Expr, CompileError> {
        self.expect("(")?;
        let arg = self.if_then_else()?;
        self.expect(")")?;
        Ok(Expr::Unary(f, Box::new(arg)))
    }

    // statistics take either zero arguments (whole image) or a channel
    fn stat_call(&mut self, stat: StatFn) -> Result<Expr, CompileError> {
        self.expect("(")?;
        if self.eat(")") {
            return Ok(Expr::Stat(stat));
        }
        let arg = self.if_then_else()?;
        self.expect(")")?;
        Ok(Expr::StatOf(stat, Box::new(arg)))
    }
}

//! Expression evaluation for stateful ALU attributes.
//!
//! Conditions, update predicates, update values and the output value of a
//! stateful ALU are small expressions over PHV fields and a list of local
//! values supplied by the engine (register halves, condition results, ...).
//!
//! Expressions are parsed once at load time against a [`LocalAliases`]
//! table that names the locals available to that attribute, so
//! `register_lo + 1` resolves `register_lo` to local slot 0 before any
//! packet is seen. `$N` always addresses local slot N directly.
//!
//! # Semantics
//!
//! - Arithmetic is 64-bit two's complement and wraps.
//! - Comparisons are signed.
//! - Booleans are integers: `true` is 1, anything non-zero is true.
//! - An empty expression evaluates to 0; the ALU engine gives emptiness its
//!   own meaning for predicates.
//!
//! # Example
//!
//! ```
//! use salu_emu::expr::{Expression, LocalAliases};
//! use salu_emu::device::{Phv, PhvLayout};
//! use std::sync::Arc;
//!
//! let aliases = LocalAliases::new(2, &[("lo", 0), ("hi", 1)]);
//! let expr = Expression::parse("lo + hi * 2", &aliases).unwrap();
//! let phv = Phv::new(Arc::new(PhvLayout::new()));
//! assert_eq!(expr.eval_arith(&phv, &[1, 3]).unwrap(), 7);
//! ```

mod parser;

pub(crate) use parser::parse_number;

use crate::device::{DeviceError, Phv};
use std::fmt;
use thiserror::Error;

/// Errors from parsing or evaluating an expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// The expression text is malformed.
    #[error("syntax error at offset {pos}: {message}")]
    Syntax {
        /// Byte offset into the source text.
        pos: usize,
        /// What went wrong.
        message: String,
    },

    /// A field reference could not be resolved against the PHV.
    #[error(transparent)]
    Field(#[from] DeviceError),

    /// The engine supplied fewer locals than the expression uses.
    #[error("local ${index} not supplied (got {supplied} locals)")]
    LocalOutOfRange {
        /// Requested slot.
        index: usize,
        /// Number of locals supplied.
        supplied: usize,
    },
}

/// Named local slots visible to an expression.
#[derive(Debug, Clone)]
pub struct LocalAliases {
    len: usize,
    names: Vec<(&'static str, usize)>,
}

impl LocalAliases {
    /// A table of `len` local slots with the given names.
    pub fn new(len: usize, names: &[(&'static str, usize)]) -> Self {
        Self {
            len,
            names: names.to_vec(),
        }
    }

    /// No locals at all.
    pub fn none() -> Self {
        Self::new(0, &[])
    }

    /// Number of local slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no local slots.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot index for `name`, if it is an alias.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.names.iter().find(|(n, _)| *n == name).map(|(_, i)| *i)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Logical not.
    Not,
    /// Bitwise complement.
    BitNot,
    /// Two's complement negation.
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinOp {
    LogicalOr,
    LogicalAnd,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Integer literal.
    Const(i64),
    /// Engine-supplied local slot.
    Local(usize),
    /// PHV field reference.
    Field(String),
    /// Unary operation.
    Unary(UnOp, Box<Expr>),
    /// Binary operation.
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `cond ? then : otherwise`.
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, phv: &Phv, locals: &[i64]) -> Result<i64, ExprError> {
        Ok(match self {
            Expr::Const(v) => *v,
            Expr::Local(index) => *locals.get(*index).ok_or(ExprError::LocalOutOfRange {
                index: *index,
                supplied: locals.len(),
            })?,
            Expr::Field(name) => phv.get(name)? as i64,
            Expr::Unary(op, e) => {
                let v = e.eval(phv, locals)?;
                match op {
                    UnOp::Not => (v == 0) as i64,
                    UnOp::BitNot => !v,
                    UnOp::Neg => v.wrapping_neg(),
                }
            }
            Expr::Binary(BinOp::LogicalAnd, a, b) => {
                (a.eval(phv, locals)? != 0 && b.eval(phv, locals)? != 0) as i64
            }
            Expr::Binary(BinOp::LogicalOr, a, b) => {
                (a.eval(phv, locals)? != 0 || b.eval(phv, locals)? != 0) as i64
            }
            Expr::Binary(op, a, b) => {
                let a = a.eval(phv, locals)?;
                let b = b.eval(phv, locals)?;
                match op {
                    BinOp::BitOr => a | b,
                    BinOp::BitXor => a ^ b,
                    BinOp::BitAnd => a & b,
                    BinOp::Eq => (a == b) as i64,
                    BinOp::Ne => (a != b) as i64,
                    BinOp::Lt => (a < b) as i64,
                    BinOp::Le => (a <= b) as i64,
                    BinOp::Gt => (a > b) as i64,
                    BinOp::Ge => (a >= b) as i64,
                    BinOp::Shl => {
                        if (0..64).contains(&b) {
                            a.wrapping_shl(b as u32)
                        } else {
                            0
                        }
                    }
                    BinOp::Shr => a >> b.clamp(0, 63),
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::LogicalAnd => (a != 0 && b != 0) as i64,
                    BinOp::LogicalOr => (a != 0 || b != 0) as i64,
                }
            }
            Expr::Ternary(c, t, f) => {
                if c.eval(phv, locals)? != 0 {
                    t.eval(phv, locals)?
                } else {
                    f.eval(phv, locals)?
                }
            }
        })
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Const(_) | Expr::Local(_) => {}
            Expr::Field(name) => out.push(name),
            Expr::Unary(_, e) => e.collect_fields(out),
            Expr::Binary(_, a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
            Expr::Ternary(c, t, f) => {
                c.collect_fields(out);
                t.collect_fields(out);
                f.collect_fields(out);
            }
        }
    }
}

/// A parsed, possibly empty, expression attribute.
#[derive(Debug, Clone, Default)]
pub struct Expression {
    source: String,
    root: Option<Expr>,
}

impl Expression {
    /// Parse `src`. Blank text yields an empty expression.
    pub fn parse(src: &str, aliases: &LocalAliases) -> Result<Self, ExprError> {
        let source = src.trim();
        if source.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self {
            source: source.to_string(),
            root: Some(parser::parse(source, aliases)?),
        })
    }

    /// Whether the attribute was omitted.
    pub fn empty(&self) -> bool {
        self.root.is_none()
    }

    /// Source text, as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate as an integer. Empty expressions yield 0.
    pub fn eval_arith(&self, phv: &Phv, locals: &[i64]) -> Result<i64, ExprError> {
        match &self.root {
            Some(root) => root.eval(phv, locals),
            None => Ok(0),
        }
    }

    /// Evaluate as a boolean. Empty expressions yield `false`.
    pub fn eval_bool(&self, phv: &Phv, locals: &[i64]) -> Result<bool, ExprError> {
        Ok(self.eval_arith(phv, locals)? != 0)
    }

    /// PHV fields referenced by this expression.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            root.collect_fields(&mut out);
        }
        out
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty() {
            f.write_str("<empty>")
        } else {
            f.write_str(&self.source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PhvLayout;
    use std::sync::Arc;

    fn phv() -> Phv {
        let mut layout = PhvLayout::new();
        layout.declare("meta.x", 16);
        layout.declare("flag", 1);
        let mut phv = Phv::new(Arc::new(layout));
        phv.set("meta.x", 10).unwrap();
        phv.set("flag", 1).unwrap();
        phv
    }

    fn regs() -> LocalAliases {
        LocalAliases::new(2, &[("register_lo", 0), ("lo", 0), ("register_hi", 1), ("hi", 1)])
    }

    fn eval(src: &str, locals: &[i64]) -> i64 {
        Expression::parse(src, &regs())
            .unwrap()
            .eval_arith(&phv(), locals)
            .unwrap()
    }

    #[test]
    fn test_empty_expression() {
        let e = Expression::parse("   ", &regs()).unwrap();
        assert!(e.empty());
        assert_eq!(e.eval_arith(&phv(), &[]).unwrap(), 0);
        assert!(!e.eval_bool(&phv(), &[]).unwrap());
        assert_eq!(e.to_string(), "<empty>");
    }

    #[test]
    fn test_locals_and_fields() {
        assert_eq!(eval("lo + 1", &[5, 0]), 6);
        assert_eq!(eval("register_hi - meta.x", &[0, 3]), -7);
        assert_eq!(eval("$1 << 4 | $0", &[1, 2]), 0x21);
        assert_eq!(eval("flag ? lo : hi", &[7, 9]), 7);
    }

    #[test]
    fn test_boolean_operators() {
        assert_eq!(eval("true && !false", &[0, 0]), 1);
        assert_eq!(eval("lo > 3 || hi == 2", &[1, 2]), 1);
        assert_eq!(eval("lo - 5 < 0", &[3, 0]), 1);
        assert_eq!(eval("~0 & 0xF", &[0, 0]), 0xF);
    }

    #[test]
    fn test_shift_out_of_range() {
        assert_eq!(eval("1 << 64", &[0, 0]), 0);
        assert_eq!(eval("-8 >> 1", &[0, 0]), -4);
    }

    #[test]
    fn test_fields_collected() {
        let e = Expression::parse("meta.x + hdr.y * lo", &regs()).unwrap();
        assert_eq!(e.fields(), vec!["meta.x", "hdr.y"]);
    }

    #[test]
    fn test_eval_errors() {
        let e = Expression::parse("meta.missing", &regs()).unwrap();
        assert!(matches!(e.eval_arith(&phv(), &[0, 0]), Err(ExprError::Field(_))));

        let e = Expression::parse("hi", &regs()).unwrap();
        assert!(matches!(
            e.eval_arith(&phv(), &[0]),
            Err(ExprError::LocalOutOfRange { index: 1, supplied: 1 })
        ));
    }
}

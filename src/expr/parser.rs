//! Tokenizer and recursive-descent parser for ALU expressions.
//!
//! Precedence, lowest first:
//!
//! ```text
//! ?:  ||  &&  |  ^  &  == !=  < <= > >=  << >>  + -  *  unary(! ~ -)
//! ```

use super::{BinOp, Expr, ExprError, LocalAliases, UnOp};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Num(i64),
    Ident(String),
    Local(usize),
    Op(&'static str),
    LParen,
    RParen,
    Question,
    Colon,
}

/// Operators, longest first so that `<<` wins over `<`.
const OPERATORS: &[&str] = &[
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "<", ">", "+", "-", "*", "&", "|", "^", "~",
    "!",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let text = &src[start..i];
            tokens.push((start, Token::Num(parse_number(text, start)?)));
            continue;
        }

        if c == b'$' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let index = src[start + 1..i].parse().map_err(|_| ExprError::Syntax {
                pos: start,
                message: "expected local index after '$'".to_string(),
            })?;
            tokens.push((start, Token::Local(index)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push((start, Token::Ident(src[start..i].to_string())));
            continue;
        }

        let single = match c {
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            b'?' => Some(Token::Question),
            b':' => Some(Token::Colon),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push((start, tok));
            i += 1;
            continue;
        }

        match OPERATORS.iter().find(|op| src[i..].starts_with(**op)) {
            Some(op) => {
                tokens.push((start, Token::Op(op)));
                i += op.len();
            }
            None => {
                return Err(ExprError::Syntax {
                    pos: start,
                    message: format!("unexpected character '{}'", c as char),
                })
            }
        }
    }

    Ok(tokens)
}

/// Parse an integer literal: decimal, `0x` hex or `0b` binary.
pub(crate) fn parse_number(text: &str, pos: usize) -> Result<i64, ExprError> {
    let clean = text.replace('_', "");
    let parsed = if let Some(hex) = clean.strip_prefix("0x").or_else(|| clean.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = clean.strip_prefix("0b").or_else(|| clean.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2)
    } else {
        clean.parse::<u64>()
    };
    parsed.map(|v| v as i64).map_err(|_| ExprError::Syntax {
        pos,
        message: format!("invalid number '{}'", text),
    })
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    aliases: &'a LocalAliases,
}

/// Parse `src` into an expression tree.
pub(crate) fn parse(src: &str, aliases: &LocalAliases) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        end: src.len(),
        aliases,
    };
    let expr = parser.ternary()?;
    if let Some((pos, tok)) = parser.tokens.get(parser.pos) {
        return Err(ExprError::Syntax {
            pos: *pos,
            message: format!("unexpected trailing token {:?}", tok),
        });
    }
    Ok(expr)
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn here(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        if self.peek() == Some(&want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError::Syntax {
                pos: self.here(),
                message: format!("expected {:?}", want),
            })
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(0)?;
        if self.peek() != Some(&Token::Question) {
            return Ok(cond);
        }
        self.pos += 1;
        let then = self.ternary()?;
        self.expect(Token::Colon)?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    /// Precedence climbing over the binary operator levels.
    fn binary(&mut self, level: usize) -> Result<Expr, ExprError> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["|"],
            &["^"],
            &["&"],
            &["==", "!="],
            &["<", "<=", ">", ">="],
            &["<<", ">>"],
            &["+", "-"],
            &["*"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }

        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = self.eat_op(LEVELS[level]) {
            let rhs = self.binary(level + 1)?;
            lhs = Expr::Binary(binop(op), Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.eat_op(&["!", "~", "-"]) {
            Some("!") => UnOp::Not,
            Some("~") => UnOp::BitNot,
            Some(_) => UnOp::Neg,
            None => return self.primary(),
        };
        Ok(Expr::Unary(op, Box::new(self.unary()?)))
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let pos = self.here();
        let tok = match self.tokens.get(self.pos) {
            Some((_, tok)) => tok.clone(),
            None => {
                return Err(ExprError::Syntax {
                    pos,
                    message: "unexpected end of expression".to_string(),
                })
            }
        };
        self.pos += 1;

        match tok {
            Token::Num(v) => Ok(Expr::Const(v)),
            Token::Local(index) => self.local(index, pos),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Const(1)),
                "false" => Ok(Expr::Const(0)),
                _ => match self.aliases.resolve(&name) {
                    Some(index) => Ok(Expr::Local(index)),
                    None => Ok(Expr::Field(name)),
                },
            },
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(ExprError::Syntax {
                pos,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }

    fn local(&self, index: usize, pos: usize) -> Result<Expr, ExprError> {
        if index >= self.aliases.len() {
            return Err(ExprError::Syntax {
                pos,
                message: format!("local ${} out of range (have {})", index, self.aliases.len()),
            });
        }
        Ok(Expr::Local(index))
    }
}

fn binop(op: &str) -> BinOp {
    match op {
        "||" => BinOp::LogicalOr,
        "&&" => BinOp::LogicalAnd,
        "|" => BinOp::BitOr,
        "^" => BinOp::BitXor,
        "&" => BinOp::BitAnd,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "<<" => BinOp::Shl,
        ">>" => BinOp::Shr,
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        _ => BinOp::Mul,
    }
}

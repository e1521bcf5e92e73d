use std::fmt;

use rust_decimal::Decimal;

use crate::BidAsk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Plus,
    Minus,
}

const UNARY_PRECEDENCE: u8 = 3;
const PRIMARY_PRECEDENCE: u8 = 4;

/// Rate rule expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expr {
    Literal(Decimal),
    /// `(a, b, ...)`; only pairs evaluate.
    Tuple(Vec<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Identifier(String),
    Call { target: Box<Expr>, args: Vec<Expr> },
    /// A quote substituted for a call before evaluation.
    Rate(BidAsk),
}

impl Expr {
    pub(crate) fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub(crate) fn call(target: &str, arg: Expr) -> Expr {
        Expr::Call { target: Box::new(Expr::Identifier(target.to_owned())), args: vec![arg] }
    }

    /// The exchange name if this is a call on a plain identifier.
    pub(crate) fn call_target(&self) -> Option<&str> {
        match self {
            Expr::Call { target, .. } => match target.as_ref() {
                Expr::Identifier(name) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary(op, ..) => op.precedence(),
            Expr::Unary(..) => UNARY_PRECEDENCE,
            Expr::Rate(bid_ask) if bid_ask.bid().is_sign_negative() => UNARY_PRECEDENCE,
            Expr::Literal(value) if value.is_sign_negative() => UNARY_PRECEDENCE,
            _ => PRIMARY_PRECEDENCE,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter, parenthesize: bool) -> fmt::Result {
        if parenthesize {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Rate(bid_ask) => write!(f, "{bid_ask}"),
            Expr::Identifier(name) => f.write_str(name),
            Expr::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Expr::Call { target, args } => {
                target.fmt_operand(f, target.precedence() < PRIMARY_PRECEDENCE)?;
                f.write_str("(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Expr::Unary(op, operand) => {
                f.write_str(match op {
                    UnaryOp::Plus => "+",
                    UnaryOp::Minus => "-",
                })?;
                operand.fmt_operand(f, operand.precedence() < UNARY_PRECEDENCE)
            }
            Expr::Binary(op, lhs, rhs) => {
                let precedence = op.precedence();
                lhs.fmt_operand(f, lhs.precedence() < precedence)?;
                write!(f, " {} ", op.symbol())?;
                rhs.fmt_operand(f, rhs.precedence() <= precedence)
            }
        }
    }
}

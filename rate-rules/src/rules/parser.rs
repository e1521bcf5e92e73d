//! Tokenizer and recursive-descent parser for rate rule scripts.
//!
//! ```text
//! script    := { statement }
//! statement := expr [ "=" expr ] ( ";" | newline | EOF )
//! expr      := term { ("+" | "-") term }
//! term      := unary { ("*" | "/") unary }
//! unary     := ("+" | "-") unary | postfix
//! postfix   := primary { "(" [ expr { "," expr } ] ")" }
//! primary   := number | identifier | "(" expr { "," expr } ")"
//! ```
//!
//! Newlines inside parentheses are insignificant, as are newlines directly
//! after an operator or `=`. `//` starts a comment running to the end of the
//! line.

use std::str::FromStr;

use rust_decimal::Decimal;

use super::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Number(Decimal),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Assign,
    Semicolon,
    Newline,
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    line: usize,
}

fn tokenize(script: &str) -> Result<Vec<Spanned>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = script.chars().peekable();
    let mut line = 1;
    let mut depth = 0usize;

    while let Some(&c) = chars.peek() {
        let token = match c {
            '\n' => {
                chars.next();
                line += 1;
                if depth == 0 {
                    tokens.push(Spanned { token: Token::Newline, line: line - 1 });
                }
                continue;
            }
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    while chars.peek().is_some_and(|&c| c != '\n') {
                        chars.next();
                    }
                    continue;
                }
                Token::Slash
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = Decimal::from_str(&literal).map_err(|e| SyntaxError {
                    line,
                    message: format!("invalid number '{literal}': {e}"),
                })?;
                tokens.push(Spanned { token: Token::Number(value), line });
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Spanned { token: Token::Identifier(name), line });
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '(' => {
                depth += 1;
                Token::LParen
            }
            ')' => {
                depth = depth.saturating_sub(1);
                Token::RParen
            }
            ',' => Token::Comma,
            '=' => Token::Assign,
            ';' => Token::Semicolon,
            other => {
                return Err(SyntaxError { line, message: format!("unexpected character '{other}'") })
            }
        };
        if token != Token::Slash {
            chars.next();
        }
        tokens.push(Spanned { token, line });
    }
    Ok(tokens)
}

/// One parsed statement: `target = value`, or a bare expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Statement {
    pub target: Option<Expr>,
    pub value: Expr,
}

pub(crate) fn parse_script(script: &str) -> Result<Vec<Statement>, SyntaxError> {
    let tokens = tokenize(script)?;
    Parser { tokens, pos: 0 }.script()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> { self.tokens.get(self.pos).map(|t| &t.token) }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) { while self.eat(&Token::Newline) {} }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError { line: self.line(), message: message.into() }
    }

    fn expect(&mut self, token: Token) -> Result<(), SyntaxError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}, found {:?}", self.peek())))
        }
    }

    fn script(&mut self) -> Result<Vec<Statement>, SyntaxError> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&Token::Newline) || self.eat(&Token::Semicolon) {}
            if self.peek().is_none() {
                return Ok(statements);
            }
            statements.push(self.statement()?);
        }
    }

    fn statement(&mut self) -> Result<Statement, SyntaxError> {
        let first = self.expr()?;
        let statement = if self.eat(&Token::Assign) {
            self.skip_newlines();
            let value = self.expr()?;
            Statement { target: Some(first), value }
        } else {
            Statement { target: None, value: first }
        };
        match self.peek() {
            None | Some(Token::Newline) | Some(Token::Semicolon) => Ok(statement),
            Some(other) => Err(self.error(format!("unexpected {other:?} after statement"))),
        }
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            self.skip_newlines();
            lhs = Expr::binary(op, lhs, self.term()?);
        }
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            self.skip_newlines();
            lhs = Expr::binary(op, lhs, self.unary()?);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.peek() {
            Some(Token::Plus) => UnaryOp::Plus,
            Some(Token::Minus) => UnaryOp::Minus,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.skip_newlines();
        Ok(Expr::Unary(op, Box::new(self.unary()?)))
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        while self.eat(&Token::LParen) {
            let mut args = Vec::new();
            if !self.eat(&Token::RParen) {
                args = self.comma_list()?;
                self.expect(Token::RParen)?;
            }
            expr = Expr::Call { target: Box::new(expr), args };
        }
        Ok(expr)
    }

    fn comma_list(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = vec![self.expr()?];
        while self.eat(&Token::Comma) {
            items.push(self.expr()?);
        }
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::Literal(value)),
            Some(Token::Identifier(name)) => Ok(Expr::Identifier(name)),
            Some(Token::LParen) => {
                let mut items = self.comma_list()?;
                self.expect(Token::RParen)?;
                if items.len() == 1 {
                    Ok(items.remove(0))
                } else {
                    Ok(Expr::Tuple(items))
                }
            }
            other => Err(SyntaxError { line, message: format!("unexpected {other:?}") }),
        }
    }
}

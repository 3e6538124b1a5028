//! Arithmetic expressions over host facts.
//!
//! Sizing values may be written relative to the machine, e.g. `2*cores` or
//! `mem / 1024 / 64`. The grammar is deliberately small:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := ('+' | '-') factor | number | symbol | '(' expr ')'
//! symbol := "cores" | "mem"
//! ```

use std::iter::Peekable;
use std::str::CharIndices;

use thiserror::Error;

use crate::host::HostFacts;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("expression is empty")]
    Empty,

    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown symbol `{0}` (expected `cores` or `mem`)")]
    UnknownSymbol(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NotFinite,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Symbol(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {}", n),
            Token::Symbol(s) => format!("symbol `{}`", s),
            Token::Plus => "`+`".into(),
            Token::Minus => "`-`".into(),
            Token::Star => "`*`".into(),
            Token::Slash => "`/`".into(),
            Token::LParen => "`(`".into(),
            Token::RParen => "`)`".into(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<CharIndices<'_>> = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' | '×' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == '_' {
                        if d != '_' {
                            literal.push(d);
                        }
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedChar(c, pos))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Symbol(ident));
            }
            other => return Err(ExprError::UnexpectedChar(other, pos)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    facts: &'a HostFacts,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<f64, ExprError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, ExprError> {
        let mut value = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    value /= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, ExprError> {
        let token = self.next().cloned().ok_or(ExprError::UnexpectedEnd)?;
        match token {
            Token::Minus => Ok(-self.factor()?),
            Token::Plus => self.factor(),
            Token::Number(n) => Ok(n),
            Token::Symbol(name) => match name.as_str() {
                "cores" => Ok(self.facts.cores as f64),
                "mem" => Ok(self.facts.mem_kb as f64),
                _ => Err(ExprError::UnknownSymbol(name)),
            },
            Token::LParen => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    Some(other) => Err(ExprError::UnexpectedToken(other.describe())),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            other => Err(ExprError::UnexpectedToken(other.describe())),
        }
    }
}

/// Evaluate `input` against the given host facts.
pub fn evaluate(input: &str, facts: &HostFacts) -> Result<f64, ExprError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Empty);
    }

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        facts,
    };
    let value = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(ExprError::UnexpectedToken(extra.describe()));
    }
    if !value.is_finite() {
        return Err(ExprError::NotFinite);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> HostFacts {
        HostFacts {
            cores: 4,
            mem_kb: 8 * 1024 * 1024,
        }
    }

    fn eval(input: &str) -> Result<f64, ExprError> {
        evaluate(input, &facts())
    }

    #[test]
    fn literals() {
        assert_eq!(eval("256"), Ok(256.0));
        assert_eq!(eval("1.5"), Ok(1.5));
        assert_eq!(eval("10_000"), Ok(10_000.0));
    }

    #[test]
    fn symbols() {
        assert_eq!(eval("cores"), Ok(4.0));
        assert_eq!(eval("mem / 1024"), Ok(8.0 * 1024.0));
    }

    #[test]
    fn precedence_and_parens() {
        assert_eq!(eval("2 + 3 * cores"), Ok(14.0));
        assert_eq!(eval("(2 + 3) * cores"), Ok(20.0));
        assert_eq!(eval("cores * cores - 1"), Ok(15.0));
        assert_eq!(eval("2×cores"), Ok(8.0));
        assert_eq!(eval("-cores + 10"), Ok(6.0));
    }

    #[test]
    fn division_by_zero() {
        assert_eq!(eval("cores / (cores - 4)"), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn malformed() {
        assert_eq!(eval(""), Err(ExprError::Empty));
        assert_eq!(eval("   "), Err(ExprError::Empty));
        assert_eq!(eval("2 *"), Err(ExprError::UnexpectedEnd));
        assert_eq!(eval("(2 + 3"), Err(ExprError::UnexpectedEnd));
        assert_eq!(eval("threads"), Err(ExprError::UnknownSymbol("threads".into())));
        assert!(matches!(eval("2 $ 3"), Err(ExprError::UnexpectedChar('$', 2))));
        assert!(matches!(eval("2 3"), Err(ExprError::UnexpectedToken(_))));
        assert!(matches!(eval("1.2.3"), Err(ExprError::UnexpectedChar('1', 0))));
    }
}

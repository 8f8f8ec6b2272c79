//! Admin-authored expression language used by rules, state-machine guards,
//! webhook conditions, and workflow condition steps.
//!
//! The language is deliberately small and side-effect free: literals,
//! dot-path identifiers, arrays, unary `!`/`-`, arithmetic, comparisons,
//! logical and/or, membership `in`, and a fixed set of pure builtins.
//! Expressions compile once into a [`Program`] that is cached on the
//! metadata object owning it and reused until the registry reloads.

pub mod eval;

use std::fmt;
use std::sync::Arc;

pub use eval::{truthy, Env};

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("Evaluation error: {0}")]
    Eval(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Expr>),
    /// Dot-separated identifier path, e.g. `record.status`.
    Path(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// A compiled expression. Cheap to clone; the AST is shared.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    root: Arc<Expr>,
}

impl Program {
    pub fn compile(source: &str) -> Result<Program, ExprError> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let root = parser.parse_expr(0)?;
        parser.expect_end()?;
        Ok(Program {
            source: source.to_string(),
            root: Arc::new(root),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    In,
    Not,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

struct Lexed {
    token: Token,
    position: usize,
}

fn lex(source: &str) -> Result<Vec<Lexed>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '(' => {
                tokens.push(Lexed { token: Token::LParen, position: start });
                i += 1;
            }
            ')' => {
                tokens.push(Lexed { token: Token::RParen, position: start });
                i += 1;
            }
            '[' => {
                tokens.push(Lexed { token: Token::LBracket, position: start });
                i += 1;
            }
            ']' => {
                tokens.push(Lexed { token: Token::RBracket, position: start });
                i += 1;
            }
            ',' => {
                tokens.push(Lexed { token: Token::Comma, position: start });
                i += 1;
            }
            '.' => {
                tokens.push(Lexed { token: Token::Dot, position: start });
                i += 1;
            }
            '+' => {
                tokens.push(Lexed { token: Token::Plus, position: start });
                i += 1;
            }
            '-' => {
                tokens.push(Lexed { token: Token::Minus, position: start });
                i += 1;
            }
            '*' => {
                tokens.push(Lexed { token: Token::Star, position: start });
                i += 1;
            }
            '/' => {
                tokens.push(Lexed { token: Token::Slash, position: start });
                i += 1;
            }
            '%' => {
                tokens.push(Lexed { token: Token::Percent, position: start });
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Lexed { token: Token::EqEq, position: start });
                    i += 2;
                } else {
                    return Err(parse_error(start, "expected '==' (assignment is not supported)"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Lexed { token: Token::NotEq, position: start });
                    i += 2;
                } else {
                    tokens.push(Lexed { token: Token::Not, position: start });
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Lexed { token: Token::Le, position: start });
                    i += 2;
                } else {
                    tokens.push(Lexed { token: Token::Lt, position: start });
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Lexed { token: Token::Ge, position: start });
                    i += 2;
                } else {
                    tokens.push(Lexed { token: Token::Gt, position: start });
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Lexed { token: Token::And, position: start });
                    i += 2;
                } else {
                    return Err(parse_error(start, "expected '&&'"));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Lexed { token: Token::Or, position: start });
                    i += 2;
                } else {
                    return Err(parse_error(start, "expected '||'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&next) => {
                                    text.push(match next {
                                        'n' => '\n',
                                        't' => '\t',
                                        other => other,
                                    });
                                    i += 2;
                                }
                                None => return Err(parse_error(i, "unterminated string")),
                            }
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                        None => return Err(parse_error(start, "unterminated string")),
                    }
                }
                tokens.push(Lexed { token: Token::Str(text), position: start });
            }
            '0'..='9' => {
                let mut end = i;
                let mut seen_dot = false;
                while end < chars.len() {
                    let ch = chars[end];
                    if ch.is_ascii_digit() {
                        end += 1;
                    } else if ch == '.' && !seen_dot && chars.get(end + 1).is_some_and(|n| n.is_ascii_digit()) {
                        seen_dot = true;
                        end += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[i..end].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(start, "invalid number literal"))?;
                tokens.push(Lexed { token: Token::Number(number), position: start });
                i = end;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[i..end].iter().collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                };
                tokens.push(Lexed { token, position: start });
                i = end;
            }
            other => {
                return Err(parse_error(start, &format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn parse_error(position: usize, message: &str) -> ExprError {
    ExprError::Parse {
        position,
        message: message.to_string(),
    }
}

struct Parser {
    tokens: Vec<Lexed>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|lexed| &lexed.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|lexed| lexed.token.clone());
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn source_position(&self) -> usize {
        self.tokens
            .get(self.position)
            .map(|lexed| lexed.position)
            .unwrap_or_else(|| self.tokens.last().map(|l| l.position + 1).unwrap_or(0))
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        let position = self.source_position();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(parse_error(position, &format!("expected {what}"))),
        }
    }

    fn expect_end(&self) -> Result<(), ExprError> {
        if self.position == self.tokens.len() {
            Ok(())
        } else {
            Err(parse_error(self.source_position(), "trailing input after expression"))
        }
    }

    fn parse_expr(&mut self, min_precedence: u8) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;

        loop {
            let Some(op) = self.peek().and_then(binary_op) else {
                break;
            };
            let precedence = binary_precedence(op);
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let right = self.parse_expr(precedence + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let position = self.source_position();
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.advance();
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.parse_expr(0)?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        _ => return Err(parse_error(position, "expected ',' or ']' in array")),
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() == Some(&Token::RParen) {
                        self.advance();
                        return Ok(Expr::Call(name, args));
                    }
                    loop {
                        args.push(self.parse_expr(0)?);
                        match self.advance() {
                            Some(Token::Comma) => continue,
                            Some(Token::RParen) => break,
                            _ => return Err(parse_error(position, "expected ',' or ')' in call")),
                        }
                    }
                    return Ok(Expr::Call(name, args));
                }

                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => return Err(parse_error(position, "expected identifier after '.'")),
                    }
                }
                Ok(Expr::Path(path))
            }
            _ => Err(parse_error(position, "expected expression")),
        }
    }
}

fn binary_op(token: &Token) -> Option<BinaryOp> {
    match token {
        Token::Or => Some(BinaryOp::Or),
        Token::And => Some(BinaryOp::And),
        Token::In => Some(BinaryOp::In),
        Token::EqEq => Some(BinaryOp::Eq),
        Token::NotEq => Some(BinaryOp::Ne),
        Token::Lt => Some(BinaryOp::Lt),
        Token::Le => Some(BinaryOp::Le),
        Token::Gt => Some(BinaryOp::Gt),
        Token::Ge => Some(BinaryOp::Ge),
        Token::Plus => Some(BinaryOp::Add),
        Token::Minus => Some(BinaryOp::Sub),
        Token::Star => Some(BinaryOp::Mul),
        Token::Slash => Some(BinaryOp::Div),
        Token::Percent => Some(BinaryOp::Rem),
        _ => None,
    }
}

fn binary_precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::In => 3,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
        BinaryOp::Add | BinaryOp::Sub => 5,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dot_paths() {
        let program = Program::compile("record.status == 'draft'").unwrap();
        match program.root() {
            Expr::Binary(BinaryOp::Eq, left, right) => {
                assert_eq!(
                    **left,
                    Expr::Path(vec!["record".to_string(), "status".to_string()])
                );
                assert_eq!(**right, Expr::Str("draft".to_string()));
            }
            other => panic!("unexpected AST: {other:?}"),
        }
    }

    #[test]
    fn precedence_binds_arithmetic_over_comparison() {
        let program = Program::compile("context.amount + 5 > 100").unwrap();
        match program.root() {
            Expr::Binary(BinaryOp::Gt, left, _) => {
                assert!(matches!(**left, Expr::Binary(BinaryOp::Add, _, _)));
            }
            other => panic!("unexpected AST: {other:?}"),
        }
    }

    #[test]
    fn keyword_and_symbol_logic_are_equivalent() {
        let a = Program::compile("a and b or c").unwrap();
        let b = Program::compile("a && b || c").unwrap();
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn parses_membership_and_arrays() {
        let program = Program::compile("record.status in ['draft', 'sent']").unwrap();
        match program.root() {
            Expr::Binary(BinaryOp::In, _, right) => {
                assert!(matches!(**right, Expr::Array(ref items) if items.len() == 2));
            }
            other => panic!("unexpected AST: {other:?}"),
        }
    }

    #[test]
    fn parses_calls_with_arguments() {
        let program = Program::compile("startsWith(record.number, 'INV-')").unwrap();
        match program.root() {
            Expr::Call(name, args) => {
                assert_eq!(name, "startsWith");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected AST: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Program::compile("record.status =").is_err());
        assert!(Program::compile("1 +").is_err());
        assert!(Program::compile("'unterminated").is_err());
        assert!(Program::compile("a = b").is_err());
        assert!(Program::compile("f(1, )").is_err());
        assert!(Program::compile("a b").is_err());
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(Program::compile("1 2").is_err());
    }
}

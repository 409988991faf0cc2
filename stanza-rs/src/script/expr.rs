//! Expression lexer, AST, parser, and evaluator.
//!
//! The language evaluated inside `${…}` placeholders, tag attributes and
//! steps statements.  It supports integer/float arithmetic, string
//! concatenation, comparison, ternary, assignment (to variables, members and
//! indices), glob (`=~`) and regex (`=/`) matching, member and method access,
//! indexing, list/map literals, blocks and closures.
//!
//! Operator precedence (lowest → highest):
//!   comma  →  assign / lambda  →  ternary  →  or  →  and  →  relational  →
//!   bitor  →  bitxor  →  bitand  →  shift  →  additive  →  multiplicative  →
//!   unary  →  postfix (`.name`, `.name(…)`, `[…]`, `(…)`)  →  primary
//!
//! Closures: `x -> x + 1`, `() -> 42`, `(a, b) -> a * b`.
//! Braces: `{}` is an empty map, `{k: v, 'k2': v2}` a map, `{a; b}` a block
//! whose value is its last expression.

use std::sync::Arc;

use super::value::Value;
use crate::error::Error;
use crate::flow::Outcome;
use crate::pattern::{self, MatchMode};
use crate::scope::Scope;

// ── EvalContext ───────────────────────────────────────────────────────────────

/// Interface the evaluator uses to reach variables, properties and calls.
///
/// [`Interp`](crate::interp::Interp) implements this with the full resolver
/// chain; tests use a flat map.
pub trait EvalContext {
    /// Resolve a bare name.
    fn lookup(&mut self, name: &str) -> Outcome;

    /// Bind a bare name.
    fn assign(&mut self, name: &str, value: Value) -> Outcome<()>;

    /// `base.name`
    fn get_property(&mut self, base: &Value, name: &str) -> Outcome;

    /// `base.name = value`
    fn set_property(&mut self, base: &Value, name: &str, value: Value) -> Outcome<()>;

    /// `name(args)` when `base` is `None`, `base.name(args)` otherwise.
    fn invoke(&mut self, base: Option<&Value>, name: &str, args: Vec<Value>) -> Outcome;

    /// Call a value directly: `(x -> x)(1)`, `list[0](2)`.
    fn apply(&mut self, callee: &Value, args: Vec<Value>) -> Outcome;

    /// Capture the current scope for a lambda literal.
    fn make_closure(&mut self, def: &Arc<LambdaDef>) -> Value;
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Tilde,
    Ampersand,
    Pipe,
    Caret,
    ShiftLeft,
    ShiftRight,

    // Comparison
    Eq, // ==
    Ne, // !=
    Lt,
    Le,
    Gt,
    Ge,
    GlobMatch,     // =~
    RegexMatch,    // =/
    NotGlobMatch,  // !~
    NotRegexMatch, // !/

    // Logical
    And, // &&
    Or,  // ||

    // Assignment
    Assign,        // =
    PlusAssign,    // +=
    MinusAssign,   // -=
    StarAssign,    // *=
    SlashAssign,   // /=
    PercentAssign, // %=

    // Structure
    Arrow, // ->
    Dot,
    Question,
    Colon,
    Semicolon,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    /// Unrecognised input character, reported by the parser.
    Unknown(char),
    Eof,
}

/// Byte range of a token in the source.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut it = self.src[self.pos..].chars();
        it.next();
        it.next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn read_number(&mut self, start: usize) -> Token {
        let mut is_float = false;

        if &self.src[start..self.pos] == "0" && matches!(self.peek(), Some('x' | 'X')) {
            self.advance();
            let digits = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            return Token::Int(i64::from_str_radix(&self.src[digits..self.pos], 16).unwrap_or(0));
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e' | 'E'))
            && self
                .peek2()
                .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-')
        {
            is_float = true;
            self.advance();
            if matches!(self.peek(), Some('+' | '-')) {
                self.advance();
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        let text = &self.src[start..self.pos];
        if is_float {
            Token::Float(text.parse().unwrap_or(0.0))
        } else {
            match text.parse() {
                Ok(n) => Token::Int(n),
                Err(_) => Token::Float(text.parse().unwrap_or(0.0)),
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Token {
        let mut s = String::new();
        loop {
            match self.advance() {
                None => break,
                Some('\\') => match self.advance() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some(c) => s.push(c),
                    None => break,
                },
                Some(c) if c == quote => break,
                Some(c) => s.push(c),
            }
        }
        Token::Str(s)
    }

    fn read_ident(&mut self, start: usize) -> Token {
        while self.peek().is_some_and(is_ident_continue) {
            self.advance();
        }
        Token::Ident(self.src[start..self.pos].to_owned())
    }

    fn next_token(&mut self) -> (Token, Span) {
        self.skip_ws();
        let start = self.pos;
        let Some(ch) = self.advance() else {
            return (Token::Eof, Span { start, end: start });
        };

        let tok = match ch {
            '0'..='9' => self.read_number(start),
            '"' | '\'' => self.read_string(ch),
            c if is_ident_start(c) => self.read_ident(start),
            '+' if self.eat('=') => Token::PlusAssign,
            '+' => Token::Plus,
            '-' if self.eat('=') => Token::MinusAssign,
            '-' if self.eat('>') => Token::Arrow,
            '-' => Token::Minus,
            '*' if self.eat('=') => Token::StarAssign,
            '*' => Token::Star,
            '/' if self.eat('=') => Token::SlashAssign,
            '/' => Token::Slash,
            '%' if self.eat('=') => Token::PercentAssign,
            '%' => Token::Percent,
            '!' if self.eat('=') => Token::Ne,
            '!' if self.eat('~') => Token::NotGlobMatch,
            '!' if self.eat('/') => Token::NotRegexMatch,
            '!' => Token::Bang,
            '~' => Token::Tilde,
            '^' => Token::Caret,
            '&' if self.eat('&') => Token::And,
            '&' => Token::Ampersand,
            '|' if self.eat('|') => Token::Or,
            '|' => Token::Pipe,
            '<' if self.eat('<') => Token::ShiftLeft,
            '<' if self.eat('=') => Token::Le,
            '<' => Token::Lt,
            '>' if self.eat('>') => Token::ShiftRight,
            '>' if self.eat('=') => Token::Ge,
            '>' => Token::Gt,
            '=' if self.eat('=') => Token::Eq,
            '=' if self.eat('~') => Token::GlobMatch,
            '=' if self.eat('/') => Token::RegexMatch,
            '=' => Token::Assign,
            '.' => Token::Dot,
            '?' => Token::Question,
            ':' => Token::Colon,
            ';' => Token::Semicolon,
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            c => Token::Unknown(c),
        };
        (tok, Span { start, end: self.pos })
    }

    fn tokenize(mut self) -> Vec<(Token, Span)> {
        let mut tokens = Vec::new();
        loop {
            let t = self.next_token();
            let done = matches!(t.0, Token::Eof);
            tokens.push(t);
            if done {
                break;
            }
        }
        tokens
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    GlobMatch,
    RegexMatch,
    NotGlobMatch,
    NotRegexMatch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Left-hand side of an assignment.
#[derive(Debug, Clone)]
pub enum Target {
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
}

/// A parsed lambda literal, shared by every closure created from it.
#[derive(Debug)]
pub struct LambdaDef {
    pub params: Vec<String>,
    pub body: Arc<Expr>,
    pub source: String,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign(Target, AssignOp, Box<Expr>),
    Call(String, Vec<Expr>),
    Member(Box<Expr>, String),
    MethodCall(Box<Expr>, String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Apply(Box<Expr>, Vec<Expr>),
    Lambda(Arc<LambdaDef>),
    ListLit(Vec<Expr>),
    MapLit(Vec<(String, Expr)>),
    Block(Vec<Expr>),
    Comma(Vec<Expr>),
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

type PResult<T> = Result<T, String>;

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser { src, tokens: Lexer::new(src).tokenize(), pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &Token {
        self.tokens.get(self.pos + n).map(|t| &t.0).unwrap_or(&Token::Eof)
    }

    fn span_start(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.1.start).unwrap_or(self.src.len())
    }

    fn prev_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.1.end)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).map(|t| t.0.clone()).unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> PResult<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!("expected {what}, found {}", describe(self.peek())))
        }
    }

    // ── Grammar ───────────────────────────────────────────────────────────────

    fn parse_top(&mut self) -> PResult<Expr> {
        let expr = self.parse_comma()?;
        if *self.peek() != Token::Eof {
            return Err(format!("unexpected {}", describe(self.peek())));
        }
        Ok(expr)
    }

    fn parse_comma(&mut self) -> PResult<Expr> {
        let first = self.parse_assign()?;
        if self.peek() == &Token::Comma {
            let mut exprs = vec![first];
            while self.eat(&Token::Comma) {
                exprs.push(self.parse_assign()?);
            }
            Ok(Expr::Comma(exprs))
        } else {
            Ok(first)
        }
    }

    /// Parameter list of a lambda starting at the current token, and how many
    /// tokens it spans including the arrow.
    fn lambda_head(&self) -> Option<(Vec<String>, usize)> {
        match (self.peek(), self.peek_at(1)) {
            (Token::Ident(name), Token::Arrow) => return Some((vec![name.clone()], 2)),
            (Token::LParen, _) => {}
            _ => return None,
        }
        let mut params = Vec::new();
        let mut n = 1;
        if *self.peek_at(n) != Token::RParen {
            loop {
                match self.peek_at(n) {
                    Token::Ident(p) => params.push(p.clone()),
                    _ => return None,
                }
                n += 1;
                match self.peek_at(n) {
                    Token::Comma => n += 1,
                    Token::RParen => break,
                    _ => return None,
                }
            }
        }
        (*self.peek_at(n + 1) == Token::Arrow).then_some((params, n + 2))
    }

    fn parse_assign(&mut self) -> PResult<Expr> {
        if let Some((params, len)) = self.lambda_head() {
            let start = self.span_start();
            self.pos += len;
            let body = self.parse_assign()?;
            let source = self.src[start..self.prev_end()].trim().to_owned();
            return Ok(Expr::Lambda(Arc::new(LambdaDef { params, body: Arc::new(body), source })));
        }

        let lhs = self.parse_ternary()?;
        let op = match self.peek() {
            Token::Assign => AssignOp::Set,
            Token::PlusAssign => AssignOp::Add,
            Token::MinusAssign => AssignOp::Sub,
            Token::StarAssign => AssignOp::Mul,
            Token::SlashAssign => AssignOp::Div,
            Token::PercentAssign => AssignOp::Rem,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let target = match lhs {
            Expr::Var(name) => Target::Var(name),
            Expr::Member(base, name) => Target::Member(base, name),
            Expr::Index(base, idx) => Target::Index(base, idx),
            _ => return Err("invalid assignment target".into()),
        };
        let rhs = self.parse_assign()?;
        Ok(Expr::Assign(target, op, Box::new(rhs)))
    }

    fn parse_ternary(&mut self) -> PResult<Expr> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_assign()?;
            self.expect(&Token::Colon, "':' in ternary")?;
            let else_ = self.parse_assign()?;
            Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(else_)))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_relational()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_bitor()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                Token::GlobMatch => BinOp::GlobMatch,
                Token::RegexMatch => BinOp::RegexMatch,
                Token::NotGlobMatch => BinOp::NotGlobMatch,
                Token::NotRegexMatch => BinOp::NotRegexMatch,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_bitor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_binary_level(
        &mut self,
        table: &[(Token, BinOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (tok, op) in table {
                if self.peek() == tok {
                    self.pos += 1;
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(Token::Pipe, BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(Token::Caret, BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(Token::Ampersand, BinOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[(Token::ShiftLeft, BinOp::Shl), (Token::ShiftRight, BinOp::Shr)],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[
                (Token::Star, BinOp::Mul),
                (Token::Slash, BinOp::Div),
                (Token::Percent, BinOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Bang => UnaryOp::Not,
            Token::Tilde => UnaryOp::BitNot,
            _ => return self.parse_postfix(),
        };
        self.pos += 1;
        Ok(Expr::Unary(op, Box::new(self.parse_unary()?)))
    }

    fn parse_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() != &Token::RParen {
            args.push(self.parse_assign()?);
            while self.eat(&Token::Comma) {
                args.push(self.parse_assign()?);
            }
        }
        self.expect(&Token::RParen, "')' after arguments")?;
        Ok(args)
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.pos += 1;
                    let name = match self.advance() {
                        Token::Ident(n) => n,
                        Token::Int(n) => n.to_string(),
                        other => return Err(format!("expected name after '.', found {}", describe(&other))),
                    };
                    if self.eat(&Token::LParen) {
                        let args = self.parse_args()?;
                        expr = Expr::MethodCall(Box::new(expr), name, args);
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Token::LBracket => {
                    self.pos += 1;
                    let idx = self.parse_assign()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(idx));
                }
                Token::LParen => {
                    self.pos += 1;
                    let args = self.parse_args()?;
                    expr = Expr::Apply(Box::new(expr), args);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::Literal(Value::Int(n))),
            Token::Float(x) => Ok(Expr::Literal(Value::Float(x))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.eat(&Token::LParen) => {
                    let args = self.parse_args()?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Var(name)),
            },
            Token::LParen => {
                let inner = self.parse_comma()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_assign()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma, "',' or ']' in list")?;
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                    }
                }
                Ok(Expr::ListLit(items))
            }
            Token::LBrace => self.parse_brace(),
            other => Err(format!("unexpected {}", describe(&other))),
        }
    }

    /// After `{`: map literal or block.
    fn parse_brace(&mut self) -> PResult<Expr> {
        if self.eat(&Token::RBrace) {
            return Ok(Expr::MapLit(Vec::new()));
        }
        let is_map = matches!(self.peek(), Token::Ident(_) | Token::Str(_) | Token::Int(_))
            && *self.peek_at(1) == Token::Colon;
        if is_map {
            let mut entries = Vec::new();
            loop {
                let key = match self.advance() {
                    Token::Ident(k) | Token::Str(k) => k,
                    Token::Int(n) => n.to_string(),
                    other => return Err(format!("expected map key, found {}", describe(&other))),
                };
                self.expect(&Token::Colon, "':' after map key")?;
                entries.push((key, self.parse_assign()?));
                if self.eat(&Token::RBrace) {
                    break;
                }
                self.expect(&Token::Comma, "',' or '}' in map")?;
                if self.eat(&Token::RBrace) {
                    break;
                }
            }
            return Ok(Expr::MapLit(entries));
        }
        let mut exprs = Vec::new();
        loop {
            while self.eat(&Token::Semicolon) {}
            if self.eat(&Token::RBrace) {
                break;
            }
            exprs.push(self.parse_comma()?);
            if self.eat(&Token::RBrace) {
                break;
            }
            self.expect(&Token::Semicolon, "';' or '}' in block")?;
        }
        Ok(Expr::Block(exprs))
    }
}

fn describe(tok: &Token) -> String {
    match tok {
        Token::Eof => "end of expression".into(),
        Token::Ident(n) => format!("'{n}'"),
        Token::Unknown(c) => format!("character '{c}'"),
        other => format!("{other:?}"),
    }
}

/// Parse an expression string into an AST.
pub fn parse_expr(src: &str) -> Result<Expr, Error> {
    Parser::new(src)
        .parse_top()
        .map_err(|msg| Error::Syntax(format!("{msg} in '{}'", src.trim())))
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// Evaluate an [`Expr`] AST node against the given context.
pub fn eval_expr(expr: &Expr, ctx: &mut dyn EvalContext) -> Outcome {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),

        Expr::Var(name) => ctx.lookup(name),

        Expr::Unary(op, inner) => {
            let v = eval_expr(inner, ctx)?;
            Ok(match op {
                UnaryOp::Neg => v.arith_neg()?,
                UnaryOp::Not => Value::Bool(!v.as_bool()),
                UnaryOp::BitNot => Value::Int(!v.as_int()),
            })
        }

        Expr::Binary(op, lhs, rhs) => {
            match op {
                BinOp::And => {
                    let l = eval_expr(lhs, ctx)?;
                    if !l.as_bool() {
                        return Ok(Value::Bool(false));
                    }
                    return Ok(Value::Bool(eval_expr(rhs, ctx)?.as_bool()));
                }
                BinOp::Or => {
                    let l = eval_expr(lhs, ctx)?;
                    if l.as_bool() {
                        return Ok(Value::Bool(true));
                    }
                    return Ok(Value::Bool(eval_expr(rhs, ctx)?.as_bool()));
                }
                _ => {}
            }
            let l = eval_expr(lhs, ctx)?;
            let r = eval_expr(rhs, ctx)?;
            Ok(eval_binop(*op, &l, &r)?)
        }

        Expr::Ternary(cond, then, else_) => {
            if eval_expr(cond, ctx)?.as_bool() {
                eval_expr(then, ctx)
            } else {
                eval_expr(else_, ctx)
            }
        }

        Expr::Assign(target, op, rhs) => match target {
            Target::Var(name) => {
                let rval = eval_expr(rhs, ctx)?;
                let new_val = match op {
                    AssignOp::Set => rval,
                    _ => combine(*op, &ctx.lookup(name)?, &rval)?,
                };
                ctx.assign(name, new_val.clone())?;
                Ok(new_val)
            }
            Target::Member(base, name) => {
                let base = eval_expr(base, ctx)?;
                let rval = eval_expr(rhs, ctx)?;
                let new_val = match op {
                    AssignOp::Set => rval,
                    _ => combine(*op, &ctx.get_property(&base, name)?, &rval)?,
                };
                ctx.set_property(&base, name, new_val.clone())?;
                Ok(new_val)
            }
            Target::Index(base, idx) => {
                let base = eval_expr(base, ctx)?;
                let idx = eval_expr(idx, ctx)?;
                let rval = eval_expr(rhs, ctx)?;
                let new_val = match op {
                    AssignOp::Set => rval,
                    _ => combine(*op, &index_get(ctx, &base, &idx)?, &rval)?,
                };
                index_set(ctx, &base, &idx, new_val.clone())?;
                Ok(new_val)
            }
        },

        Expr::Call(name, arg_exprs) => {
            let args = eval_args(arg_exprs, ctx)?;
            ctx.invoke(None, name, args)
        }

        Expr::MethodCall(base, name, arg_exprs) => {
            let base = eval_expr(base, ctx)?;
            let args = eval_args(arg_exprs, ctx)?;
            ctx.invoke(Some(&base), name, args)
        }

        Expr::Member(base, name) => {
            let base = eval_expr(base, ctx)?;
            ctx.get_property(&base, name)
        }

        Expr::Index(base, idx) => {
            let base = eval_expr(base, ctx)?;
            let idx = eval_expr(idx, ctx)?;
            index_get(ctx, &base, &idx)
        }

        Expr::Apply(callee, arg_exprs) => {
            let callee = eval_expr(callee, ctx)?;
            let args = eval_args(arg_exprs, ctx)?;
            ctx.apply(&callee, args)
        }

        Expr::Lambda(def) => Ok(ctx.make_closure(def)),

        Expr::ListLit(items) => Ok(Value::list(eval_args(items, ctx)?)),

        Expr::MapLit(entries) => {
            let map = Scope::new();
            for (k, e) in entries {
                map.set(k.clone(), eval_expr(e, ctx)?);
            }
            Ok(Value::Map(map))
        }

        Expr::Block(exprs) | Expr::Comma(exprs) => {
            let mut last = Value::Null;
            for e in exprs {
                last = eval_expr(e, ctx)?;
            }
            Ok(last)
        }
    }
}

fn eval_args(exprs: &[Expr], ctx: &mut dyn EvalContext) -> Outcome<Vec<Value>> {
    exprs.iter().map(|e| eval_expr(e, ctx)).collect()
}

fn combine(op: AssignOp, cur: &Value, rval: &Value) -> Result<Value, Error> {
    match op {
        AssignOp::Set => Ok(rval.clone()),
        AssignOp::Add => cur.arith_add(rval),
        AssignOp::Sub => cur.arith_sub(rval),
        AssignOp::Mul => cur.arith_mul(rval),
        AssignOp::Div => cur.arith_div(rval),
        AssignOp::Rem => cur.arith_rem(rval),
    }
}

/// Resolve a list/string position, counting negative indices from the end.
fn position(idx: &Value, len: usize) -> Option<usize> {
    let i = idx.as_int();
    let len = i64::try_from(len).ok()?;
    let i = if i < 0 { i + len } else { i };
    (0..len).contains(&i).then(|| i as usize)
}

fn index_get(ctx: &mut dyn EvalContext, base: &Value, idx: &Value) -> Outcome {
    match base {
        Value::List(items) => {
            let items = items.read();
            Ok(position(idx, items.len()).map(|i| items[i].clone()).unwrap_or_default())
        }
        Value::Str(s) => {
            let count = s.chars().count();
            Ok(position(idx, count)
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(c.to_string()))
                .unwrap_or_default())
        }
        Value::Null => Ok(Value::Null),
        _ => ctx.get_property(base, &idx.to_string()),
    }
}

fn index_set(ctx: &mut dyn EvalContext, base: &Value, idx: &Value, value: Value) -> Outcome<()> {
    match base {
        Value::List(items) => {
            let mut items = items.write();
            let len = items.len();
            if idx.as_int() == len as i64 {
                items.push(value);
                return Ok(());
            }
            match position(idx, len) {
                Some(i) => {
                    items[i] = value;
                    Ok(())
                }
                None => Err(Error::type_error(format!("list index {idx} out of range (size {len})")).into()),
            }
        }
        Value::Map(_) | Value::Object(_) => ctx.set_property(base, &idx.to_string(), value),
        other => Err(Error::type_error(format!("cannot index into {}", other.type_name())).into()),
    }
}

fn eval_binop(op: BinOp, l: &Value, r: &Value) -> Result<Value, Error> {
    use std::cmp::Ordering;
    let text_match = |mode: MatchMode| -> Result<bool, Error> {
        pattern::is_match(&r.to_string(), &l.to_string(), mode)
            .map_err(|e| Error::type_error(e.to_string()))
    };
    Ok(match op {
        BinOp::Add => l.arith_add(r)?,
        BinOp::Sub => l.arith_sub(r)?,
        BinOp::Mul => l.arith_mul(r)?,
        BinOp::Div => l.arith_div(r)?,
        BinOp::Rem => l.arith_rem(r)?,

        BinOp::Eq => Value::Bool(l.loose_eq(r)),
        BinOp::Ne => Value::Bool(!l.loose_eq(r)),
        BinOp::Lt => Value::Bool(l.cmp_value(r) == Ordering::Less),
        BinOp::Le => Value::Bool(l.cmp_value(r) != Ordering::Greater),
        BinOp::Gt => Value::Bool(l.cmp_value(r) == Ordering::Greater),
        BinOp::Ge => Value::Bool(l.cmp_value(r) != Ordering::Less),

        BinOp::BitAnd => Value::Int(l.as_int() & r.as_int()),
        BinOp::BitOr => Value::Int(l.as_int() | r.as_int()),
        BinOp::BitXor => Value::Int(l.as_int() ^ r.as_int()),
        BinOp::Shl => Value::Int(l.as_int() << (r.as_int() & 63)),
        BinOp::Shr => Value::Int(l.as_int() >> (r.as_int() & 63)),

        BinOp::GlobMatch => Value::Bool(text_match(MatchMode::Glob)?),
        BinOp::RegexMatch => Value::Bool(text_match(MatchMode::Regex)?),
        BinOp::NotGlobMatch => Value::Bool(!text_match(MatchMode::Glob)?),
        BinOp::NotRegexMatch => Value::Bool(!text_match(MatchMode::Regex)?),

        BinOp::And | BinOp::Or => Value::Bool(false),
    })
}

/// Convenience: parse and evaluate an expression string.
pub fn eval_str(src: &str, ctx: &mut dyn EvalContext) -> Outcome {
    let expr = parse_expr(src)?;
    eval_expr(&expr, ctx)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Signal;
    use std::collections::HashMap;

    // ── Minimal EvalContext for tests ─────────────────────────────────────────

    struct TestCtx {
        vars: HashMap<String, Value>,
    }

    impl TestCtx {
        fn new() -> Self {
            TestCtx { vars: HashMap::new() }
        }
        fn with(mut self, k: &str, v: Value) -> Self {
            self.vars.insert(k.into(), v);
            self
        }
    }

    impl EvalContext for TestCtx {
        fn lookup(&mut self, name: &str) -> Outcome {
            Ok(self.vars.get(name).cloned().unwrap_or_default())
        }
        fn assign(&mut self, name: &str, value: Value) -> Outcome<()> {
            self.vars.insert(name.into(), value);
            Ok(())
        }
        fn get_property(&mut self, base: &Value, name: &str) -> Outcome {
            match base {
                Value::Map(m) => Ok(m.get(name).unwrap_or_default()),
                _ => Ok(Value::Null),
            }
        }
        fn set_property(&mut self, base: &Value, name: &str, value: Value) -> Outcome<()> {
            if let Value::Map(m) = base {
                m.set(name, value);
            }
            Ok(())
        }
        fn invoke(&mut self, base: Option<&Value>, name: &str, args: Vec<Value>) -> Outcome {
            match (base, name) {
                (None, "twice") => Ok(args[0].arith_mul(&Value::Int(2))?),
                (None, "return") => Err(Signal::Return(args.into_iter().next().unwrap_or_default())),
                (Some(Value::List(l)), "size") => Ok(Value::from(l.read().len())),
                _ => Err(Error::UnknownMethod { name: name.into(), target: "test".into() }.into()),
            }
        }
        fn apply(&mut self, callee: &Value, args: Vec<Value>) -> Outcome {
            let Value::Closure(c) = callee else {
                return Err(Error::type_error("not callable").into());
            };
            for (p, a) in c.params.iter().zip(args) {
                self.vars.insert(p.clone(), a);
            }
            eval_expr(&c.body, self)
        }
        fn make_closure(&mut self, def: &Arc<LambdaDef>) -> Value {
            Value::Closure(Arc::new(crate::script::value::Closure {
                params: def.params.clone(),
                body: def.body.clone(),
                source: def.source.clone(),
                scope: Scope::new(),
            }))
        }
    }

    fn eval(src: &str) -> Value {
        eval_ctx(src, &mut TestCtx::new())
    }

    fn eval_ctx(src: &str, ctx: &mut TestCtx) -> Value {
        match eval_str(src, ctx) {
            Ok(v) => v,
            Err(Signal::Return(v)) => panic!("unexpected return of {v}"),
            Err(Signal::Error(e)) => panic!("eval of {src:?} failed: {e}"),
        }
    }

    #[test]
    #[allow(clippy::approx_constant)]
    fn literals() {
        assert_eq!(eval("42"), Value::Int(42));
        assert_eq!(eval("3.14"), Value::Float(3.14));
        assert_eq!(eval("\"hello\""), Value::Str("hello".into()));
        assert_eq!(eval("'it\\'s'"), Value::Str("it's".into()));
        assert_eq!(eval("true"), Value::Bool(true));
        assert_eq!(eval("null"), Value::Null);
        assert_eq!(eval("'héllo'"), Value::Str("héllo".into()));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("2 + 3"), Value::Int(5));
        assert_eq!(eval("10 - 4"), Value::Int(6));
        assert_eq!(eval("3 * 4"), Value::Int(12));
        assert_eq!(eval("10 / 3"), Value::Int(3));
        assert_eq!(eval("10 % 3"), Value::Int(1));
        assert_eq!(eval("'a' + 1"), Value::Str("a1".into()));
    }

    #[test]
    fn precedence() {
        assert_eq!(eval("2 + 3 * 4"), Value::Int(14));
        assert_eq!(eval("(2 + 3) * 4"), Value::Int(20));
        assert_eq!(eval("-(3 + 2)"), Value::Int(-5));
    }

    #[test]
    fn comparison_and_logic() {
        assert_eq!(eval("3 == 3"), Value::Bool(true));
        assert_eq!(eval("'3' == 3"), Value::Bool(true));
        assert_eq!(eval("3 != 4"), Value::Bool(true));
        assert_eq!(eval("2 < 3 && 3 >= 3"), Value::Bool(true));
        assert_eq!(eval("0 || ''"), Value::Bool(false));
        assert_eq!(eval("!0"), Value::Bool(true));
    }

    #[test]
    fn ternary() {
        assert_eq!(eval("1 ? 10 : 20"), Value::Int(10));
        assert_eq!(eval("0 ? 10 : 20"), Value::Int(20));
    }

    #[test]
    fn variables_and_assignment() {
        let mut ctx = TestCtx::new().with("x", Value::Int(7));
        assert_eq!(eval_ctx("x + 1", &mut ctx), Value::Int(8));
        eval_ctx("y = 5", &mut ctx);
        assert_eq!(ctx.vars.get("y"), Some(&Value::Int(5)));
        eval_ctx("x += 5", &mut ctx);
        assert_eq!(ctx.vars.get("x"), Some(&Value::Int(12)));
    }

    #[test]
    fn dollar_identifiers() {
        let mut ctx = TestCtx::new().with("$1", Value::Int(4)).with("$args", Value::Null);
        assert_eq!(eval_ctx("$1 * 2", &mut ctx), Value::Int(8));
    }

    #[test]
    fn member_and_index() {
        assert_eq!(eval("{'a': 1, b: [10, 20]}.b[1]"), Value::Int(20));
        assert_eq!(eval("[1, 2, 3][-1]"), Value::Int(3));
        assert_eq!(eval("[1, 2, 3][9]"), Value::Null);
        assert_eq!(eval("'abc'[1]"), Value::Str("b".into()));
    }

    #[test]
    fn member_and_index_assignment() {
        let mut ctx = TestCtx::new();
        eval_ctx("m = {}", &mut ctx);
        eval_ctx("m.k = 3", &mut ctx);
        eval_ctx("m['j'] = 4", &mut ctx);
        let Some(Value::Map(m)) = ctx.vars.get("m") else { panic!("no map") };
        assert_eq!(m.get("k"), Some(Value::Int(3)));
        assert_eq!(m.get("j"), Some(Value::Int(4)));

        eval_ctx("l = [1]", &mut ctx);
        eval_ctx("l[1] = 2", &mut ctx);
        eval_ctx("l[0] += 10", &mut ctx);
        assert_eq!(ctx.vars.get("l").unwrap().to_string(), "[11, 2]");
    }

    #[test]
    fn blocks_and_maps() {
        assert_eq!(eval("{1; 2; 3}"), Value::Int(3));
        assert!(matches!(eval("{}"), Value::Map(m) if m.is_empty()));
        assert_eq!(eval("{x: 1}").to_string(), "{x: 1}");
    }

    #[test]
    fn calls_and_methods() {
        assert_eq!(eval("twice(21)"), Value::Int(42));
        assert_eq!(eval("[1, 2].size()"), Value::Int(2));
    }

    #[test]
    fn lambdas() {
        assert_eq!(eval("(x -> x + 1)(2)"), Value::Int(3));
        assert_eq!(eval("((a, b) -> a * b)(3, 4)"), Value::Int(12));
        assert_eq!(eval("(() -> 42)()"), Value::Int(42));
        let Value::Closure(c) = eval("(a, b) -> a + b") else { panic!("not a closure") };
        assert_eq!(c.source, "(a, b) -> a + b");
        assert_eq!(c.params, vec!["a", "b"]);
    }

    #[test]
    fn return_propagates_as_signal() {
        let res = eval_str("1 + return(5)", &mut TestCtx::new());
        assert!(matches!(res, Err(Signal::Return(Value::Int(5)))));
    }

    #[test]
    fn glob_and_regex_ops() {
        assert_eq!(eval("\"hello\" =~ \"hel*\""), Value::Bool(true));
        assert_eq!(eval("\"hello\" !~ \"hel*\""), Value::Bool(false));
        assert_eq!(eval("\"hello\" =/ \"^hel.o$\""), Value::Bool(true));
        assert_eq!(eval("\"hello\" !/ \"xyz\""), Value::Bool(true));
    }

    #[test]
    fn bitwise_and_hex() {
        assert_eq!(eval("0xff"), Value::Int(255));
        assert_eq!(eval("5 & 3"), Value::Int(1));
        assert_eq!(eval("5 | 2"), Value::Int(7));
        assert_eq!(eval("1 << 3"), Value::Int(8));
    }

    #[test]
    fn syntax_errors() {
        for src in ["1 +", "(1", "a b", "3 = 4", "[1, 2", "@"] {
            assert!(matches!(parse_expr(src), Err(Error::Syntax(_))), "{src:?} should fail");
        }
    }

    #[test]
    fn type_errors_surface() {
        let res = eval_str("'a' - 1", &mut TestCtx::new());
        assert!(matches!(res, Err(Signal::Error(Error::Type(_)))));
    }
}

//! Recursive-descent parser for the procedure dialect.
//!
//! A procedure is a list of statements, each either `name = expr`,
//! `table["column"] = expr`, or a bare expression. There are no blocks,
//! loops, definitions or imports.

use super::lexer::{Spanned, Token, tokenize};
use super::runtime::SandboxError;

/// Names that would reach outside the sandbox. Rejected wherever they appear.
pub const DENIED_NAMES: &[&str] = &[
    "import",
    "from",
    "def",
    "class",
    "lambda",
    "global",
    "nonlocal",
    "exec",
    "eval",
    "compile",
    "open",
    "input",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "__import__",
    "__builtins__",
];

/// Control-flow keywords the dialect has no syntax for.
const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "with", "try", "except", "finally", "return", "yield",
    "del", "raise", "assert", "async", "await", "pass", "break", "continue",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Name(String),
    Attr {
        target: Box<Expr>,
        name: String,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Column { table: String, column: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub line: usize,
    pub target: Option<Target>,
    pub expr: Expr,
}

/// Nesting limit used by [`parse`].
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Tokenize and parse a whole procedure.
pub fn parse(source: &str) -> Result<Vec<Statement>, SandboxError> {
    parse_with_depth(source, DEFAULT_MAX_DEPTH)
}

/// Like [`parse`], rejecting expressions nested deeper than `max_depth`.
pub fn parse_with_depth(source: &str, max_depth: usize) -> Result<Vec<Statement>, SandboxError> {
    let tokens = tokenize(source)?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
        max_depth,
    }
    .program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Token::Ident(name) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), SandboxError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {}", what, describe(self.peek()))))
        }
    }

    /// One level deeper. Callers restore `depth` themselves once the nested
    /// part is built; an error aborts the whole parse.
    fn descend(&mut self) -> Result<(), SandboxError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(SandboxError::TooDeep {
                line: self.line(),
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn program(&mut self) -> Result<Vec<Statement>, SandboxError> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&Token::Newline) {}
            if *self.peek() == Token::Eof {
                break;
            }
            statements.push(self.statement()?);
        }
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Statement, SandboxError> {
        let line = self.line();
        if let Token::Ident(name) = self.peek() {
            if DENIED_NAMES.contains(&name.as_str()) {
                return Err(SandboxError::CapabilityDenied(format!(
                    "'{}' is not allowed in procedures",
                    name
                )));
            }
            if UNSUPPORTED_KEYWORDS.contains(&name.as_str()) {
                return Err(self.error(format!("'{}' statements are not supported", name)));
            }
        }

        let expr = self.expression()?;
        let (target, expr) = if self.eat(&Token::Assign) {
            let target = match expr {
                Expr::Name(name) => Target::Name(name),
                Expr::Index { target, index } => match (*target, *index) {
                    (Expr::Name(table), Expr::Literal(Literal::Str(column))) => {
                        Target::Column { table, column }
                    }
                    _ => return Err(self.error("only table[\"column\"] can be assigned by index")),
                },
                _ => return Err(self.error("only names and table columns can be assigned")),
            };
            (Some(target), self.expression()?)
        } else {
            (None, expr)
        };

        match self.peek() {
            Token::Newline => {
                self.pos += 1;
            }
            Token::Eof => {}
            other => {
                return Err(self.error(format!("unexpected {} after statement", describe(other))));
            }
        }
        Ok(Statement { line, target, expr })
    }

    fn expression(&mut self) -> Result<Expr, SandboxError> {
        self.descend()?;
        let expr = self.or_expr()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, SandboxError> {
        let mark = self.depth;
        let mut left = self.and_expr()?;
        while self.eat(&Token::Pipe) || self.eat_keyword("or") {
            self.descend()?;
            let right = self.and_expr()?;
            left = binary(BinaryOp::Or, left, right);
        }
        self.depth = mark;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SandboxError> {
        let mark = self.depth;
        let mut left = self.not_expr()?;
        while self.eat(&Token::Amp) || self.eat_keyword("and") {
            self.descend()?;
            let right = self.not_expr()?;
            left = binary(BinaryOp::And, left, right);
        }
        self.depth = mark;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SandboxError> {
        if self.eat(&Token::Tilde) || self.eat_keyword("not") {
            self.descend()?;
            let operand = self.not_expr()?;
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SandboxError> {
        let left = self.additive()?;
        let not_in = matches!(self.peek(), Token::Ident(k) if k == "not")
            && matches!(self.peek_at(1), Token::Ident(k) if k == "in");
        if not_in {
            self.pos += 2;
            let right = self.additive()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(binary(BinaryOp::In, left, right)),
            });
        }
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::Ident(k) if k == "in" => BinaryOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(binary(op, left, right))
    }

    fn additive(&mut self) -> Result<Expr, SandboxError> {
        let mark = self.depth;
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let right = self.term()?;
            left = binary(op, left, right);
        }
        self.depth = mark;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SandboxError> {
        let mark = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        self.depth = mark;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        if self.eat(&Token::Minus) {
            self.descend()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return Ok(match operand {
                Expr::Literal(Literal::Int(i)) => Expr::Literal(Literal::Int(-i)),
                Expr::Literal(Literal::Float(f)) => Expr::Literal(Literal::Float(-f)),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(other),
                },
            });
        }
        if self.eat(&Token::Plus) {
            self.descend()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return Ok(operand);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SandboxError> {
        let mark = self.depth;
        let mut expr = self.primary()?;
        loop {
            if matches!(self.peek(), Token::Dot | Token::LParen | Token::LBracket) {
                self.descend()?;
            }
            match self.peek() {
                Token::Dot => {
                    self.pos += 1;
                    let name = match self.advance() {
                        Token::Ident(name) => name,
                        other => {
                            return Err(self.error(format!(
                                "expected attribute name, found {}",
                                describe(&other)
                            )));
                        }
                    };
                    if name.starts_with('_') {
                        return Err(SandboxError::CapabilityDenied(format!(
                            "access to '{}' is not allowed",
                            name
                        )));
                    }
                    expr = Expr::Attr {
                        target: Box::new(expr),
                        name,
                    };
                }
                Token::LParen => {
                    self.pos += 1;
                    let (args, kwargs) = self.call_arguments()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    };
                }
                Token::LBracket => {
                    self.pos += 1;
                    let index = self.expression()?;
                    if *self.peek() == Token::Colon {
                        return Err(self.error("slices are not supported; use head() or tail()"));
                    }
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        self.depth = mark;
        Ok(expr)
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), SandboxError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.eat(&Token::RParen) {
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Token::Ident(name), Token::Assign) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.pos += 2;
                let value = self.expression()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.eat(&Token::Comma) {
                self.expect(Token::RParen, "',' or ')'")?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn primary(&mut self) -> Result<Expr, SandboxError> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Literal::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Literal::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Token::Ident(name) => match name.as_str() {
                "True" => Ok(Expr::Literal(Literal::Bool(true))),
                "False" => Ok(Expr::Literal(Literal::Bool(false))),
                "None" => Ok(Expr::Literal(Literal::None)),
                n if DENIED_NAMES.contains(&n) || n.starts_with("__") => Err(
                    SandboxError::CapabilityDenied(format!("'{}' is not allowed in procedures", n)),
                ),
                n if UNSUPPORTED_KEYWORDS.contains(&n) => {
                    Err(self.error(format!("'{}' is not supported", n)))
                }
                _ => Ok(Expr::Name(name)),
            },
            Token::LParen => {
                let inner = self.expression()?;
                if *self.peek() == Token::Comma {
                    return Err(self.error("tuples are not supported; use a list"));
                }
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    items.push(self.expression()?);
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBracket, "',' or ']'")?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                while !self.eat(&Token::RBrace) {
                    let key = self.expression()?;
                    self.expect(Token::Colon, "':'")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBrace, "',' or '}'")?;
                        break;
                    }
                }
                Ok(Expr::Dict(entries))
            }
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("unexpected {}", describe(&other))))
            }
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("'{}'", name),
        Token::Int(i) => i.to_string(),
        Token::Float(f) => f.to_string(),
        Token::Str(s) => format!("string \"{}\"", s),
        Token::Newline => "end of line".to_string(),
        Token::Eof => "end of input".to_string(),
        other => format!("{:?}", other),
    }
}

//! Lexer and recursive-descent parser for the subset of the guest language the
//! reference guest evaluates.

use std::fmt;
use std::rc::Rc;

use crate::value::{parse_number, Function, Value};

pub(crate) type Block = Vec<Stmt>;

#[derive(Debug)]
pub(crate) enum Stmt {
    Local(Vec<Rc<str>>, Vec<Expr>),
    Assign(Vec<Expr>, Vec<Expr>),
    Call(Expr),
    Return(Vec<Expr>),
    If(Vec<(Expr, Block)>, Option<Block>),
    While(Expr, Block),
    Do(Block),
}

#[derive(Debug)]
pub(crate) enum Expr {
    Const(Value),
    Name(Rc<str>),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Function(Rc<Function>),
    Table(Vec<Field>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug)]
pub(crate) enum Field {
    Positional(Expr),
    Keyed(Expr, Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnOp {
    Neg,
    Not,
    Len,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SyntaxError {
    pub(crate) line: u32,
    pub(crate) message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Name(Rc<str>),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Kw(&'static str),
    Sym(&'static str),
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Name(n) => write!(f, "'{n}'"),
            Tok::Int(n) => write!(f, "'{n}'"),
            Tok::Float(n) => write!(f, "'{n}'"),
            Tok::Str(s) => write!(f, "'{s}'"),
            Tok::Kw(k) | Tok::Sym(k) => write!(f, "'{k}'"),
            Tok::Eof => f.write_str("<eof>"),
        }
    }
}

const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

const SYMBOLS: &[&str] = &[
    "...", "..", "==", "~=", "<=", ">=", "(", ")", "{", "}", "[", "]", ",", ";", ".", "=", "<",
    ">", "+", "-", "*", "/", "#", ":",
];

fn lex(src: &str) -> Result<Vec<(Tok, u32)>, SyntaxError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    let mut line = 1u32;
    let err = |line: u32, message: String| SyntaxError { line, message };

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if src[i..].starts_with("--") {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &src[start..i];
            match KEYWORDS.iter().find(|k| **k == word) {
                Some(k) => out.push((Tok::Kw(*k), line)),
                None => out.push((Tok::Name(Rc::from(word)), line)),
            }
            continue;
        }
        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric()
                    || bytes[i] == b'.'
                    || ((bytes[i] == b'-' || bytes[i] == b'+')
                        && matches!(bytes[i - 1], b'e' | b'E')))
            {
                i += 1;
            }
            let text = &src[start..i];
            let tok = match parse_number(text) {
                Some(Value::Int(n)) => Tok::Int(n),
                Some(Value::Num(n)) => Tok::Float(n),
                _ => return Err(err(line, format!("malformed number near '{text}'"))),
            };
            out.push((tok, line));
            continue;
        }
        if c == b'"' || c == b'\'' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            loop {
                let Some(&b) = bytes.get(i) else {
                    return Err(err(line, format!("unfinished string near '{}'", &src[..i])));
                };
                if b == quote {
                    i += 1;
                    break;
                }
                if b == b'\n' {
                    return Err(err(line, "unfinished string".to_string()));
                }
                if b == b'\\' {
                    let esc = bytes.get(i + 1).copied();
                    s.push(match esc {
                        Some(b'n') => '\n',
                        Some(b't') => '\t',
                        Some(b'\\') => '\\',
                        Some(b'"') => '"',
                        Some(b'\'') => '\'',
                        _ => return Err(err(line, "invalid escape sequence".to_string())),
                    });
                    i += 2;
                    continue;
                }
                let ch_len = src[i..].chars().next().map_or(1, char::len_utf8);
                s.push_str(&src[i..i + ch_len]);
                i += ch_len;
            }
            out.push((Tok::Str(Rc::from(s.as_str())), line));
            continue;
        }
        match SYMBOLS.iter().find(|s| src[i..].starts_with(**s)) {
            Some(sym) => {
                out.push((Tok::Sym(*sym), line));
                i += sym.len();
            }
            None => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(err(line, format!("unexpected symbol near '{ch}'")));
            }
        }
    }
    out.push((Tok::Eof, line));
    Ok(out)
}

pub(crate) fn parse_chunk(src: &str) -> Result<Block, SyntaxError> {
    let toks = lex(src)?;
    let mut p = Parser { toks, pos: 0 };
    let block = p.block()?;
    if p.peek() != &Tok::Eof {
        return Err(p.error(format!("'<eof>' expected near {}", p.peek())));
    }
    Ok(block)
}

struct Parser {
    toks: Vec<(Tok, u32)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos].0
    }

    fn line(&self) -> u32 {
        self.toks[self.pos].1
    }

    fn bump(&mut self) -> Tok {
        let tok = self.toks[self.pos].0.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: String) -> SyntaxError {
        SyntaxError {
            line: self.line(),
            message,
        }
    }

    fn is_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Tok::Sym(s) if *s == sym)
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Kw(k) if *k == kw)
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if self.is_sym(sym) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), SyntaxError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("'{sym}' expected near {}", self.peek())))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), SyntaxError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("'{kw}' expected near {}", self.peek())))
        }
    }

    fn name(&mut self) -> Result<Rc<str>, SyntaxError> {
        match self.peek().clone() {
            Tok::Name(n) => {
                self.bump();
                Ok(n)
            }
            other => Err(self.error(format!("<name> expected near {other}"))),
        }
    }

    fn block_ends(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
            || self.is_kw("end")
            || self.is_kw("else")
            || self.is_kw("elseif")
    }

    fn block(&mut self) -> Result<Block, SyntaxError> {
        let mut stmts = Vec::new();
        while !self.block_ends() {
            if self.eat_sym(";") {
                continue;
            }
            if self.eat_kw("return") {
                let exprs = if self.block_ends() || self.is_sym(";") {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.eat_sym(";");
                stmts.push(Stmt::Return(exprs));
                if !self.block_ends() {
                    return Err(self.error(format!("'end' expected near {}", self.peek())));
                }
                break;
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        if self.eat_kw("local") {
            if self.eat_kw("function") {
                let name = self.name()?;
                let func = self.func_body()?;
                return Ok(Stmt::Local(vec![name], vec![Expr::Function(func)]));
            }
            let mut names = vec![self.name()?];
            while self.eat_sym(",") {
                names.push(self.name()?);
            }
            let exprs = if self.eat_sym("=") {
                self.expr_list()?
            } else {
                Vec::new()
            };
            return Ok(Stmt::Local(names, exprs));
        }
        if self.eat_kw("function") {
            let mut target = Expr::Name(self.name()?);
            while self.eat_sym(".") {
                let field = self.name()?;
                target = Expr::Index(Box::new(target), Box::new(Expr::Const(Value::Str(field))));
            }
            let func = self.func_body()?;
            return Ok(Stmt::Assign(vec![target], vec![Expr::Function(func)]));
        }
        if self.eat_kw("if") {
            let mut arms = Vec::new();
            let cond = self.expr()?;
            self.expect_kw("then")?;
            arms.push((cond, self.block()?));
            let mut otherwise = None;
            loop {
                if self.eat_kw("elseif") {
                    let cond = self.expr()?;
                    self.expect_kw("then")?;
                    arms.push((cond, self.block()?));
                } else if self.eat_kw("else") {
                    otherwise = Some(self.block()?);
                    self.expect_kw("end")?;
                    break;
                } else {
                    self.expect_kw("end")?;
                    break;
                }
            }
            return Ok(Stmt::If(arms, otherwise));
        }
        if self.eat_kw("while") {
            let cond = self.expr()?;
            self.expect_kw("do")?;
            let body = self.block()?;
            self.expect_kw("end")?;
            return Ok(Stmt::While(cond, body));
        }
        if self.eat_kw("do") {
            let body = self.block()?;
            self.expect_kw("end")?;
            return Ok(Stmt::Do(body));
        }

        let first = self.suffixed()?;
        if self.is_sym("=") || self.is_sym(",") {
            let mut targets = vec![first];
            while self.eat_sym(",") {
                targets.push(self.suffixed()?);
            }
            self.expect_sym("=")?;
            if targets
                .iter()
                .any(|t| !matches!(t, Expr::Name(_) | Expr::Index(..)))
            {
                return Err(self.error("syntax error near '='".to_string()));
            }
            let exprs = self.expr_list()?;
            return Ok(Stmt::Assign(targets, exprs));
        }
        match first {
            Expr::Call(..) => Ok(Stmt::Call(first)),
            _ => Err(self.error(format!("syntax error near {}", self.peek()))),
        }
    }

    fn func_body(&mut self) -> Result<Rc<Function>, SyntaxError> {
        self.expect_sym("(")?;
        let mut params = Vec::new();
        if !self.is_sym(")") {
            params.push(self.name()?);
            while self.eat_sym(",") {
                params.push(self.name()?);
            }
        }
        self.expect_sym(")")?;
        let body = self.block()?;
        self.expect_kw("end")?;
        Ok(Rc::new(Function {
            params,
            body: Rc::new(body),
        }))
    }

    fn expr_list(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut exprs = vec![self.expr()?];
        while self.eat_sym(",") {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.and_expr()?;
        while self.eat_kw("or") {
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.cmp_expr()?;
        while self.eat_kw("and") {
            let rhs = self.cmp_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.concat_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("==") => BinOp::Eq,
                Tok::Sym("~=") => BinOp::Ne,
                Tok::Sym("<") => BinOp::Lt,
                Tok::Sym("<=") => BinOp::Le,
                Tok::Sym(">") => BinOp::Gt,
                Tok::Sym(">=") => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.concat_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn concat_expr(&mut self) -> Result<Expr, SyntaxError> {
        let lhs = self.additive()?;
        if self.eat_sym("..") {
            let rhs = self.concat_expr()?;
            return Ok(Expr::Binary(BinOp::Concat, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("+") => BinOp::Add,
                Tok::Sym("-") => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("*") => BinOp::Mul,
                Tok::Sym("/") => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.peek() {
            Tok::Sym("-") => UnOp::Neg,
            Tok::Kw("not") => UnOp::Not,
            Tok::Sym("#") => UnOp::Len,
            _ => return self.simple(),
        };
        self.bump();
        let operand = self.unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn simple(&mut self) -> Result<Expr, SyntaxError> {
        let expr = match self.peek().clone() {
            Tok::Kw("nil") => Expr::Const(Value::Nil),
            Tok::Kw("true") => Expr::Const(Value::Bool(true)),
            Tok::Kw("false") => Expr::Const(Value::Bool(false)),
            Tok::Int(n) => Expr::Const(Value::Int(n)),
            Tok::Float(n) => Expr::Const(Value::Num(n)),
            Tok::Str(s) => Expr::Const(Value::Str(s)),
            Tok::Kw("function") => {
                self.bump();
                return Ok(Expr::Function(self.func_body()?));
            }
            Tok::Sym("{") => return self.table(),
            _ => return self.suffixed(),
        };
        self.bump();
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek().clone() {
            Tok::Name(n) => {
                self.bump();
                Ok(Expr::Name(n))
            }
            Tok::Sym("(") => {
                self.bump();
                let inner = self.expr()?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            other => Err(self.error(format!("unexpected symbol near {other}"))),
        }
    }

    fn suffixed(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek().clone() {
                Tok::Sym(".") => {
                    self.bump();
                    let field = self.name()?;
                    expr = Expr::Index(Box::new(expr), Box::new(Expr::Const(Value::Str(field))));
                }
                Tok::Sym("[") => {
                    self.bump();
                    let key = self.expr()?;
                    self.expect_sym("]")?;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                Tok::Sym("(") => {
                    self.bump();
                    let args = if self.is_sym(")") {
                        Vec::new()
                    } else {
                        self.expr_list()?
                    };
                    self.expect_sym(")")?;
                    expr = Expr::Call(Box::new(expr), args);
                }
                Tok::Str(s) => {
                    self.bump();
                    expr = Expr::Call(Box::new(expr), vec![Expr::Const(Value::Str(s))]);
                }
                Tok::Sym("{") => {
                    let table = self.table()?;
                    expr = Expr::Call(Box::new(expr), vec![table]);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn table(&mut self) -> Result<Expr, SyntaxError> {
        self.expect_sym("{")?;
        let mut fields = Vec::new();
        while !self.is_sym("}") {
            if self.eat_sym("[") {
                let key = self.expr()?;
                self.expect_sym("]")?;
                self.expect_sym("=")?;
                fields.push(Field::Keyed(key, self.expr()?));
            } else if matches!(self.peek(), Tok::Name(_))
                && matches!(self.toks.get(self.pos + 1), Some((Tok::Sym("="), _)))
            {
                let name = self.name()?;
                self.bump();
                fields.push(Field::Keyed(Expr::Const(Value::Str(name)), self.expr()?));
            } else {
                fields.push(Field::Positional(self.expr()?));
            }
            if !self.eat_sym(",") && !self.eat_sym(";") {
                break;
            }
        }
        self.expect_sym("}")?;
        Ok(Expr::Table(fields))
    }
}

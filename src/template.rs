//! A minimal Jinja-like template evaluator: the value tree, a small
//! expression/statement parser, and a renderer supporting a practical subset
//! of Jinja syntax. No `include`/`extends`/macros, no whitespace-control
//! dashes (`{%-`/`-%}`) — this collaborator isn't meant to be a
//! general-purpose template engine.
//!
//! Arrays and objects are `Rc<RefCell<..>>` so that `namespace()` values can
//! be mutated in place across scopes (the reason a *second* loop variable
//! beyond `{% set %}` exists at all — a plain `set` inside `{% for %}` does
//! not escape the loop body's scope, matching upstream Jinja).

use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

pub type Array = Rc<RefCell<Vec<Value>>>;
pub type Object = Rc<RefCell<IndexMap<ValueKey, Value>>>;

#[derive(Clone)]
pub struct Callable(pub Rc<dyn Fn(&[Value]) -> Result<Value>>);

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<callable>")
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// The runtime value tree: a tagged sum covering everything a template
/// expression can produce or a context can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A name that resolved to nothing, distinct from an explicit `none`
    /// (needed for the `is defined` test).
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Array),
    Object(Object),
    Callable(Callable),
}

/// A value restricted to the subset usable as an object/context key.
/// `Context::get` is canonically `Value`-keyed; this is what rejects
/// non-hashable keys (arrays, objects, floats, callables) at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Bool(bool),
    Int(i64),
    String(String),
}

impl ValueKey {
    pub fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Bool(b) => Ok(ValueKey::Bool(*b)),
            Value::Int(i) => Ok(ValueKey::Int(*i)),
            Value::String(s) => Ok(ValueKey::String(s.clone())),
            other => Err(Error::bad_state(format!(
                "value of type '{}' is not hashable as a context key",
                other.type_name()
            ))),
        }
    }

    fn into_value(self) -> Value {
        match self {
            ValueKey::Bool(b) => Value::Bool(b),
            ValueKey::Int(i) => Value::Int(i),
            ValueKey::String(s) => Value::String(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(entries: Vec<(ValueKey, Value)>) -> Self {
        Value::Object(Rc::new(RefCell::new(entries.into_iter().collect())))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "none",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "sequence",
            Value::Object(_) => "mapping",
            Value::Callable(_) => "callable",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Object(o) => !o.borrow().is_empty(),
            Value::Callable(_) => true,
        }
    }

    /// Plain-text rendering used by `{{ expr }}` interpolation and `join`.
    pub fn stringify(&self) -> String {
        match self {
            Value::Undefined => String::new(),
            Value::Null => "none".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(a) => a.borrow().iter().map(Value::stringify).collect::<Vec<_>>().join(", "),
            Value::Object(_) => to_json(self).to_string(),
            Value::Callable(_) => "<callable>".to_string(),
        }
    }

    fn iter_values(&self) -> Result<Vec<Value>> {
        match self {
            Value::Array(a) => Ok(a.borrow().clone()),
            Value::Object(o) => Ok(o.borrow().keys().cloned().map(ValueKey::into_value).collect()),
            Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
            other => Err(Error::bad_state(format!("value of type '{}' is not iterable", other.type_name()))),
        }
    }

    fn numeric(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            other => Err(Error::bad_state(format!("value of type '{}' is not numeric", other.type_name()))),
        }
    }
}

fn to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(a) => serde_json::Value::Array(a.borrow().iter().map(to_json).collect()),
        Value::Object(o) => {
            let mut map = serde_json::Map::new();
            for (k, v) in o.borrow().iter() {
                let key = match k {
                    ValueKey::String(s) => s.clone(),
                    ValueKey::Int(i) => i.to_string(),
                    ValueKey::Bool(b) => b.to_string(),
                };
                map.insert(key, to_json(v));
            }
            serde_json::Value::Object(map)
        }
        Value::Callable(_) => serde_json::Value::Null,
    }
}

/// Holds the values a template renders against. A thin wrapper over a
/// shared ordered map so that top-level values created before render (e.g.
/// a `namespace()` passed in by the caller) are visible to, and mutable
/// from, the template.
#[derive(Debug, Clone, Default)]
pub struct Context {
    root: Object,
}

impl Context {
    pub fn new() -> Self {
        Self { root: Rc::new(RefCell::new(IndexMap::new())) }
    }

    pub fn insert(&self, name: &str, value: Value) {
        self.root.borrow_mut().insert(ValueKey::String(name.to_string()), value);
    }

    pub fn get(&self, key: &Value) -> Result<Value> {
        let k = ValueKey::from_value(key)?;
        Ok(self.root.borrow().get(&k).cloned().unwrap_or(Value::Undefined))
    }
}

// ---------------------------------------------------------------------
// Template tokenizing: split raw source into text / `{{ }}` / `{% %}`,
// dropping `{# #}` comments entirely.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum TplToken {
    Text(String),
    Expr(String),
    Stmt(String),
}

fn tokenize(src: &str) -> Result<Vec<TplToken>> {
    let mut tokens = Vec::new();
    let mut rest = src;
    while !rest.is_empty() {
        let candidates = [
            rest.find("{{").map(|i| (i, 0u8)),
            rest.find("{%").map(|i| (i, 1u8)),
            rest.find("{#").map(|i| (i, 2u8)),
        ];
        let chosen = candidates.into_iter().flatten().min_by_key(|&(i, _)| i);
        let Some((i, kind)) = chosen else {
            tokens.push(TplToken::Text(rest.to_string()));
            break;
        };
        if i > 0 {
            tokens.push(TplToken::Text(rest[..i].to_string()));
        }
        let close = match kind {
            0 => "}}",
            1 => "%}",
            _ => "#}",
        };
        let after_open = &rest[i + 2..];
        let close_rel = after_open
            .find(close)
            .ok_or_else(|| Error::invalid_pattern("unterminated template tag"))?;
        let inner = after_open[..close_rel].trim();
        match kind {
            0 => tokens.push(TplToken::Expr(inner.to_string())),
            1 => tokens.push(TplToken::Stmt(inner.to_string())),
            _ => {}
        }
        rest = &after_open[close_rel + close.len()..];
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------
// Statement tree
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum SetTarget {
    Name(String),
    Attr(String, String),
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Expr(Expr),
    If(Vec<(Expr, Vec<Node>)>, Option<Vec<Node>>),
    For {
        var: String,
        iter: Expr,
        cond: Option<Expr>,
        recursive: bool,
        body: Vec<Node>,
    },
    Set(SetTarget, Expr),
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or("")
}

fn strip_keyword<'a>(s: &'a str, kw: &str) -> &'a str {
    s.strip_prefix(kw).unwrap_or(s).trim()
}

fn parse_block(tokens: &[TplToken], pos: &mut usize) -> Result<(Vec<Node>, Option<String>)> {
    let mut nodes = Vec::new();
    while *pos < tokens.len() {
        match &tokens[*pos] {
            TplToken::Text(t) => {
                nodes.push(Node::Text(t.clone()));
                *pos += 1;
            }
            TplToken::Expr(src) => {
                nodes.push(Node::Expr(parse_expr_str(src)?));
                *pos += 1;
            }
            TplToken::Stmt(src) => {
                let word = first_word(src);
                if matches!(word, "endif" | "endfor" | "else" | "elif") {
                    return Ok((nodes, Some(src.clone())));
                }
                *pos += 1;
                match word {
                    "if" => nodes.push(parse_if(tokens, pos, src)?),
                    "for" => nodes.push(parse_for(tokens, pos, src)?),
                    "set" => nodes.push(parse_set(src)?),
                    other => return Err(Error::invalid_pattern(format!("unknown template statement '{other}'"))),
                }
            }
        }
    }
    Ok((nodes, None))
}

fn parse_if(tokens: &[TplToken], pos: &mut usize, opening: &str) -> Result<Node> {
    let mut branches = Vec::new();
    let mut cond_src = strip_keyword(opening, "if").to_string();
    let mut else_body = None;
    loop {
        let cond = parse_expr_str(&cond_src)?;
        let (body, stop) = parse_block(tokens, pos)?;
        branches.push((cond, body));
        match stop {
            Some(s) if first_word(&s) == "elif" => {
                cond_src = strip_keyword(&s, "elif").to_string();
                *pos += 1;
            }
            Some(s) if first_word(&s) == "else" => {
                *pos += 1;
                let (body, stop2) = parse_block(tokens, pos)?;
                else_body = Some(body);
                match stop2 {
                    Some(s2) if first_word(&s2) == "endif" => {
                        *pos += 1;
                        break;
                    }
                    _ => return Err(Error::invalid_pattern("missing endif")),
                }
            }
            Some(s) if first_word(&s) == "endif" => {
                *pos += 1;
                break;
            }
            _ => return Err(Error::invalid_pattern("missing endif")),
        }
    }
    Ok(Node::If(branches, else_body))
}

fn parse_for(tokens: &[TplToken], pos: &mut usize, opening: &str) -> Result<Node> {
    let (var, iter, cond, recursive) = parse_for_header(opening)?;
    let (body, stop) = parse_block(tokens, pos)?;
    match stop {
        Some(s) if first_word(&s) == "endfor" => {
            *pos += 1;
        }
        _ => return Err(Error::invalid_pattern("missing endfor")),
    }
    Ok(Node::For { var, iter, cond, recursive, body })
}

fn find_top_level_keyword(s: &str, kw: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut in_str: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = in_str {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == q {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' => {
                in_str = Some(c);
                i += 1;
            }
            b'(' | b'[' => {
                depth += 1;
                i += 1;
            }
            b')' | b']' => {
                depth -= 1;
                i += 1;
            }
            _ => {
                if depth == 0 && s[i..].starts_with(kw) {
                    let before_ok = i == 0 || !is_ident_byte(bytes[i - 1]);
                    let after_idx = i + kw.len();
                    let after_ok = after_idx >= bytes.len() || !is_ident_byte(bytes[after_idx]);
                    if before_ok && after_ok {
                        return Some(i);
                    }
                }
                i += 1;
            }
        }
    }
    None
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn find_top_level_eq(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut in_str: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = in_str {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == q {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' => {
                in_str = Some(c);
                i += 1;
            }
            b'(' | b'[' => {
                depth += 1;
                i += 1;
            }
            b')' | b']' => {
                depth -= 1;
                i += 1;
            }
            b'=' if depth == 0 => {
                let next_is_eq = bytes.get(i + 1) == Some(&b'=');
                let prev_is_cmp = i > 0 && matches!(bytes[i - 1], b'=' | b'!' | b'<' | b'>');
                if !next_is_eq && !prev_is_cmp {
                    return Some(i);
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

fn parse_for_header(src: &str) -> Result<(String, Expr, Option<Expr>, bool)> {
    let rest = strip_keyword(src, "for");
    let in_pos = find_top_level_keyword(rest, "in").ok_or_else(|| Error::invalid_pattern("for loop missing 'in'"))?;
    let var = rest[..in_pos].trim().to_string();
    if var.is_empty() || !var.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(Error::invalid_pattern("for loop variable must be a single identifier"));
    }
    let mut tail = rest[in_pos + 2..].trim();
    let mut recursive = false;
    if let Some(stripped) = tail.strip_suffix("recursive") {
        let stripped = stripped.trim_end();
        if stripped.len() < tail.len() && (stripped.is_empty() || !is_ident_byte(*stripped.as_bytes().last().unwrap())) {
            recursive = true;
            tail = stripped;
        }
    }
    let (iter_src, cond_src) = match find_top_level_keyword(tail, "if") {
        Some(p) => (tail[..p].trim(), Some(tail[p + 2..].trim())),
        None => (tail.trim(), None),
    };
    let iter = parse_expr_str(iter_src)?;
    let cond = cond_src.map(parse_expr_str).transpose()?;
    Ok((var, iter, cond, recursive))
}

fn parse_set(src: &str) -> Result<Node> {
    let rest = strip_keyword(src, "set");
    let eq = find_top_level_eq(rest).ok_or_else(|| Error::invalid_pattern("set statement missing '='"))?;
    let target_src = rest[..eq].trim();
    let expr_src = rest[eq + 1..].trim();
    let expr = parse_expr_str(expr_src)?;
    let target = match target_src.find('.') {
        Some(dot) => SetTarget::Attr(target_src[..dot].trim().to_string(), target_src[dot + 1..].trim().to_string()),
        None => SetTarget::Name(target_src.to_string()),
    };
    Ok(Node::Set(target, expr))
}

// ---------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Arg {
    Positional(Expr),
    Named(String, Expr),
}

#[derive(Debug, Clone)]
enum BinOp {
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
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Var(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Arg>),
    Pipe(Box<Expr>, String, Vec<Arg>),
    Is(Box<Expr>, String, Vec<Arg>, bool),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Eof,
}

fn lex_expr(s: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = s.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    is_float = true;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                toks.push(Tok::Float(text.parse().map_err(|_| Error::invalid_pattern(format!("bad float literal: {text}")))?));
            } else {
                toks.push(Tok::Int(text.parse().map_err(|_| Error::invalid_pattern(format!("bad int literal: {text}")))?));
            }
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            toks.push(Tok::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut out = String::new();
            while i < chars.len() && chars[i] != quote {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 1;
                    out.push(match chars[i] {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    out.push(chars[i]);
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(Error::invalid_pattern("unterminated string literal"));
            }
            i += 1;
            toks.push(Tok::Str(out));
            continue;
        }
        let two: Option<&'static str> = if i + 1 < chars.len() {
            match (c, chars[i + 1]) {
                ('=', '=') => Some("=="),
                ('!', '=') => Some("!="),
                ('<', '=') => Some("<="),
                ('>', '=') => Some(">="),
                _ => None,
            }
        } else {
            None
        };
        if let Some(op) = two {
            toks.push(Tok::Op(op));
            i += 2;
            continue;
        }
        let one: &'static str = match c {
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            '<' => "<",
            '>' => ">",
            '|' => "|",
            '.' => ".",
            ',' => ",",
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            '=' => "=",
            other => return Err(Error::invalid_pattern(format!("unexpected character in expression: {other}"))),
        };
        toks.push(Tok::Op(one));
        i += 1;
    }
    toks.push(Tok::Eof);
    Ok(toks)
}

struct ExprParser {
    toks: Vec<Tok>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn bump(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if matches!(self.peek(), Tok::Ident(i) if i == name) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Tok::Op(o) if *o == op) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(Error::invalid_pattern(format!("expected '{op}' in expression")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_ident("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat_ident("and") {
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_ident("not") {
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_is()
        }
    }

    fn parse_is(&mut self) -> Result<Expr> {
        let lhs = self.parse_cmp()?;
        if self.eat_ident("is") {
            let negate = self.eat_ident("not");
            let name = match self.bump() {
                Tok::Ident(n) => n,
                _ => return Err(Error::invalid_pattern("expected test name after 'is'")),
            };
            let args = if self.eat_op("(") { self.parse_args()? } else { Vec::new() };
            Ok(Expr::Is(Box::new(lhs), name, args, negate))
        } else {
            Ok(lhs)
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Tok::Op("==") => BinOp::Eq,
                Tok::Op("!=") => BinOp::Ne,
                Tok::Op("<") => BinOp::Lt,
                Tok::Op("<=") => BinOp::Le,
                Tok::Op(">") => BinOp::Gt,
                Tok::Op(">=") => BinOp::Ge,
                Tok::Ident(i) if i == "in" => BinOp::In,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_add()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_op("-") {
            Ok(Expr::Neg(Box::new(self.parse_unary()?)))
        } else {
            self.parse_pipe()
        }
    }

    fn parse_pipe(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_postfix()?;
        while self.eat_op("|") {
            let name = match self.bump() {
                Tok::Ident(n) => n,
                _ => return Err(Error::invalid_pattern("expected filter name after '|'")),
            };
            let args = if self.eat_op("(") { self.parse_args()? } else { Vec::new() };
            lhs = Expr::Pipe(Box::new(lhs), name, args);
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut base = self.parse_primary()?;
        loop {
            if self.eat_op(".") {
                let name = match self.bump() {
                    Tok::Ident(n) => n,
                    _ => return Err(Error::invalid_pattern("expected identifier after '.'")),
                };
                base = Expr::Attr(Box::new(base), name);
            } else if self.eat_op("[") {
                let idx = self.parse_or()?;
                self.expect_op("]")?;
                base = Expr::Index(Box::new(base), Box::new(idx));
            } else if self.eat_op("(") {
                let args = self.parse_args()?;
                base = Expr::Call(Box::new(base), args);
            } else {
                break;
            }
        }
        Ok(base)
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        if self.eat_op(")") {
            return Ok(args);
        }
        loop {
            // named argument: `ident = expr`, distinguished from a bare
            // identifier expression by lookahead past it for `=` (not `==`).
            if let Tok::Ident(name) = self.peek().clone() {
                if matches!(self.toks.get(self.pos + 1), Some(Tok::Op("=")) if !matches!(self.toks.get(self.pos + 2), Some(Tok::Op("=")))) {
                    self.bump();
                    self.bump();
                    let value = self.parse_or()?;
                    args.push(Arg::Named(name, value));
                    if self.eat_op(",") {
                        continue;
                    }
                    self.expect_op(")")?;
                    break;
                }
            }
            let value = self.parse_or()?;
            args.push(Arg::Positional(value));
            if self.eat_op(",") {
                continue;
            }
            self.expect_op(")")?;
            break;
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Tok::Int(i) => Ok(Expr::Lit(Value::Int(i))),
            Tok::Float(f) => Ok(Expr::Lit(Value::Float(f))),
            Tok::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Tok::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Lit(Value::Bool(true))),
                "false" => Ok(Expr::Lit(Value::Bool(false))),
                "none" => Ok(Expr::Lit(Value::Null)),
                _ => Ok(Expr::Var(name)),
            },
            Tok::Op("(") => {
                let inner = self.parse_or()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                if !self.eat_op("]") {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat_op(",") {
                            continue;
                        }
                        self.expect_op("]")?;
                        break;
                    }
                }
                // Represented as a literal array of literal sub-expressions
                // evaluated eagerly would lose variable references, so wrap
                // as a call to the identity-list builtin instead.
                Ok(Expr::Call(Box::new(Expr::Var("__list__".to_string())), items.into_iter().map(Arg::Positional).collect()))
            }
            other => Err(Error::invalid_pattern(format!("unexpected token in expression: {other:?}"))),
        }
    }
}

fn parse_expr_str(src: &str) -> Result<Expr> {
    let toks = lex_expr(src)?;
    let mut parser = ExprParser { toks, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.peek() != &Tok::Eof {
        return Err(Error::invalid_pattern(format!("trailing tokens in expression: {src}")));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------

/// A `{% for %}` marked `recursive`, captured so a `loop(seq)` call anywhere
/// in its body can re-render it against a new sequence.
#[derive(Debug, Clone)]
struct LoopFrame {
    var: String,
    cond: Option<Expr>,
    body: Vec<Node>,
}

struct Renderer<'a> {
    ctx: &'a Context,
    scopes: Vec<IndexMap<ValueKey, Value>>,
    loop_stack: Vec<LoopFrame>,
}

impl<'a> Renderer<'a> {
    fn lookup(&self, name: &str) -> Result<Value> {
        let key = ValueKey::String(name.to_string());
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(&key) {
                return Ok(v.clone());
            }
        }
        self.ctx.get(&Value::String(name.to_string()))
    }

    fn set_local(&mut self, name: &str, value: Value) {
        let key = ValueKey::String(name.to_string());
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(key, value);
        }
    }

    fn render(&mut self, nodes: &[Node], out: &mut String) -> Result<()> {
        for node in nodes {
            self.render_node(node, out)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &Node, out: &mut String) -> Result<()> {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Expr(e) => out.push_str(&self.eval(e)?.stringify()),
            Node::If(branches, else_body) => {
                for (cond, body) in branches {
                    if self.eval(cond)?.is_truthy() {
                        self.render(body, out)?;
                        return Ok(());
                    }
                }
                if let Some(body) = else_body {
                    self.render(body, out)?;
                }
            }
            Node::For { var, iter, cond, recursive, body } => {
                let items = self.eval(iter)?.iter_values()?;
                if *recursive {
                    self.loop_stack.push(LoopFrame {
                        var: var.clone(),
                        cond: cond.clone(),
                        body: body.clone(),
                    });
                }
                self.scopes.push(IndexMap::new());
                for item in items {
                    self.set_local(var, item);
                    if let Some(cond) = cond {
                        if !self.eval(cond)?.is_truthy() {
                            continue;
                        }
                    }
                    self.render(body, out)?;
                }
                self.scopes.pop();
                if *recursive {
                    self.loop_stack.pop();
                }
            }
            Node::Set(target, expr) => {
                let value = self.eval(expr)?;
                match target {
                    SetTarget::Name(name) => self.set_local(name, value),
                    SetTarget::Attr(obj_name, field) => {
                        let obj = self.lookup(obj_name)?;
                        match obj {
                            Value::Object(map) => {
                                map.borrow_mut().insert(ValueKey::String(field.clone()), value);
                            }
                            other => {
                                return Err(Error::bad_state(format!(
                                    "cannot set attribute on a value of type '{}'",
                                    other.type_name()
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn eval_args(&mut self, args: &[Arg]) -> Result<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut named = Vec::new();
        for a in args {
            match a {
                Arg::Positional(e) => positional.push(self.eval(e)?),
                Arg::Named(name, e) => named.push((name.clone(), self.eval(e)?)),
            }
        }
        Ok((positional, named))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Var(name) => self.lookup(name),
            Expr::Attr(base, field) => {
                let v = self.eval(base)?;
                match v {
                    Value::Object(map) => Ok(map
                        .borrow()
                        .get(&ValueKey::String(field.clone()))
                        .cloned()
                        .unwrap_or(Value::Undefined)),
                    Value::Undefined => Ok(Value::Undefined),
                    other => Err(Error::bad_state(format!("value of type '{}' has no attribute '{field}'", other.type_name()))),
                }
            }
            Expr::Index(base, idx) => {
                let v = self.eval(base)?;
                let i = self.eval(idx)?;
                match (&v, &i) {
                    (Value::Array(a), Value::Int(n)) => {
                        let items = a.borrow();
                        let idx = if *n < 0 { items.len() as i64 + n } else { *n };
                        Ok(usize::try_from(idx).ok().and_then(|i| items.get(i)).cloned().unwrap_or(Value::Undefined))
                    }
                    (Value::Object(_), _) | (Value::String(_), _) => {
                        let key = if let Value::String(s) = &v {
                            return match i {
                                Value::Int(n) => Ok(s
                                    .chars()
                                    .nth(if n < 0 { (s.chars().count() as i64 + n) as usize } else { n as usize })
                                    .map(|c| Value::String(c.to_string()))
                                    .unwrap_or(Value::Undefined)),
                                other => Err(Error::bad_state(format!("cannot index a string with '{}'", other.type_name()))),
                            };
                        } else {
                            ValueKey::from_value(&i)?
                        };
                        if let Value::Object(o) = &v {
                            Ok(o.borrow().get(&key).cloned().unwrap_or(Value::Undefined))
                        } else {
                            unreachable!()
                        }
                    }
                    _ => Err(Error::bad_state(format!("value of type '{}' is not subscriptable", v.type_name()))),
                }
            }
            Expr::Call(callee, args) => {
                if let Expr::Var(name) = callee.as_ref() {
                    return self.eval_named_call(name, args);
                }
                let v = self.eval(callee)?;
                let (positional, _named) = self.eval_args(args)?;
                match v {
                    Value::Callable(f) => (f.0)(&positional),
                    other => Err(Error::bad_state(format!("value of type '{}' is not callable", other.type_name()))),
                }
            }
            Expr::Pipe(base, name, args) => {
                let input = self.eval(base)?;
                let (mut positional, _named) = self.eval_args(args)?;
                positional.insert(0, input);
                call_builtin(name, &positional)
            }
            Expr::Is(base, name, args, negate) => {
                let v = self.eval(base)?;
                let (positional, _named) = self.eval_args(args)?;
                let result = run_test(name, &v, &positional)?;
                Ok(Value::Bool(result != *negate))
            }
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(Error::bad_state(format!("cannot negate a value of type '{}'", other.type_name()))),
            },
            Expr::And(l, r) => {
                let lv = self.eval(l)?;
                if !lv.is_truthy() {
                    Ok(lv)
                } else {
                    self.eval(r)
                }
            }
            Expr::Or(l, r) => {
                let lv = self.eval(l)?;
                if lv.is_truthy() {
                    Ok(lv)
                } else {
                    self.eval(r)
                }
            }
            Expr::BinOp(op, l, r) => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                eval_binop(op, lv, rv)
            }
        }
    }

    fn eval_named_call(&mut self, name: &str, args: &[Arg]) -> Result<Value> {
        if name == "namespace" {
            let (_positional, named) = self.eval_args(args)?;
            let entries = named.into_iter().map(|(k, v)| (ValueKey::String(k), v)).collect();
            return Ok(Value::object(entries));
        }
        if name == "__list__" {
            let (positional, _named) = self.eval_args(args)?;
            return Ok(Value::array(positional));
        }
        if name == "loop" {
            let frame = self
                .loop_stack
                .last()
                .cloned()
                .ok_or_else(|| Error::bad_state("'loop' called outside a recursive for"))?;
            let (positional, _named) = self.eval_args(args)?;
            let seq = positional
                .first()
                .ok_or_else(|| Error::bad_state("'loop' requires a sequence argument"))?
                .iter_values()?;
            let mut rendered = String::new();
            self.loop_stack.push(frame.clone());
            self.scopes.push(IndexMap::new());
            for item in seq {
                self.set_local(&frame.var, item);
                if let Some(cond) = &frame.cond {
                    if !self.eval(cond)?.is_truthy() {
                        continue;
                    }
                }
                self.render(&frame.body, &mut rendered)?;
            }
            self.scopes.pop();
            self.loop_stack.pop();
            return Ok(Value::String(rendered));
        }
        if let Ok(v) = self.lookup(name) {
            if let Value::Callable(f) = v {
                let (positional, _named) = self.eval_args(args)?;
                return (f.0)(&positional);
            }
        }
        let (positional, _named) = self.eval_args(args)?;
        call_builtin(name, &positional)
    }
}

fn eval_binop(op: &BinOp, l: Value, r: Value) -> Result<Value> {
    use BinOp::*;
    match op {
        Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::array(items))
            }
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            _ => Ok(Value::Float(l.numeric()? + r.numeric()?)),
        },
        Sub => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            _ => Ok(Value::Float(l.numeric()? - r.numeric()?)),
        },
        Mul => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            _ => Ok(Value::Float(l.numeric()? * r.numeric()?)),
        },
        Div => Ok(Value::Float(l.numeric()? / r.numeric()?)),
        Mod => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
            _ => Ok(Value::Float(l.numeric()? % r.numeric()?)),
        },
        Eq => Ok(Value::Bool(l == r)),
        Ne => Ok(Value::Bool(l != r)),
        Lt => Ok(Value::Bool(l.numeric()? < r.numeric()?)),
        Le => Ok(Value::Bool(l.numeric()? <= r.numeric()?)),
        Gt => Ok(Value::Bool(l.numeric()? > r.numeric()?)),
        Ge => Ok(Value::Bool(l.numeric()? >= r.numeric()?)),
        In => match &r {
            Value::Array(a) => Ok(Value::Bool(a.borrow().iter().any(|v| v == &l))),
            Value::Object(o) => Ok(Value::Bool(ValueKey::from_value(&l).map(|k| o.borrow().contains_key(&k)).unwrap_or(false))),
            Value::String(s) => match &l {
                Value::String(needle) => Ok(Value::Bool(s.contains(needle.as_str()))),
                _ => Err(Error::bad_state("'in' on a string requires a string operand")),
            },
            other => Err(Error::bad_state(format!("'in' is not supported on a value of type '{}'", other.type_name()))),
        },
    }
}

fn run_test(name: &str, v: &Value, args: &[Value]) -> Result<bool> {
    Ok(match name {
        "none" => matches!(v, Value::Null),
        "boolean" => matches!(v, Value::Bool(_)),
        "integer" => matches!(v, Value::Int(_)),
        "float" => matches!(v, Value::Float(_)),
        "number" => matches!(v, Value::Int(_) | Value::Float(_)),
        "string" => matches!(v, Value::String(_)),
        "mapping" => matches!(v, Value::Object(_)),
        "iterable" => matches!(v, Value::Array(_) | Value::Object(_) | Value::String(_)),
        "sequence" => matches!(v, Value::Array(_) | Value::String(_)),
        "defined" => !matches!(v, Value::Undefined),
        other => {
            let mut call_args = vec![v.clone()];
            call_args.extend_from_slice(args);
            return Ok(call_builtin(other, &call_args)?.is_truthy());
        }
    })
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "range" => {
            let (start, stop, step) = match args {
                [Value::Int(n)] => (0, *n, 1),
                [Value::Int(a), Value::Int(b)] => (*a, *b, 1),
                [Value::Int(a), Value::Int(b), Value::Int(s)] => (*a, *b, *s),
                _ => return Err(Error::bad_state("range() expects 1-3 integer arguments")),
            };
            if step == 0 {
                return Err(Error::bad_state("range() step must not be zero"));
            }
            let mut items = Vec::new();
            let mut i = start;
            if step > 0 {
                while i < stop {
                    items.push(Value::Int(i));
                    i += step;
                }
            } else {
                while i > stop {
                    items.push(Value::Int(i));
                    i += step;
                }
            }
            Ok(Value::array(items))
        }
        "join" => {
            let (items, sep) = match args {
                [Value::Array(a)] => (a.borrow().clone(), String::new()),
                [Value::Array(a), sep] => (a.borrow().clone(), sep.stringify()),
                _ => return Err(Error::bad_state("join() expects an array and an optional separator")),
            };
            Ok(Value::String(items.iter().map(Value::stringify).collect::<Vec<_>>().join(&sep)))
        }
        "tojson" => {
            let v = args.first().ok_or_else(|| Error::bad_state("tojson() expects one argument"))?;
            Ok(Value::String(to_json(v).to_string()))
        }
        "trim" => match args {
            [Value::String(s)] => Ok(Value::String(s.trim().to_string())),
            _ => Err(Error::bad_state("trim() expects a string argument")),
        },
        "count" => match args.first() {
            Some(Value::Array(a)) => Ok(Value::Int(a.borrow().len() as i64)),
            Some(Value::Object(o)) => Ok(Value::Int(o.borrow().len() as i64)),
            Some(Value::String(s)) => Ok(Value::Int(s.chars().count() as i64)),
            _ => Err(Error::bad_state("count() expects an array, mapping or string")),
        },
        "equalto" => match args {
            [a, b] => Ok(Value::Bool(a == b)),
            _ => Err(Error::bad_state("equalto() expects two arguments")),
        },
        "reject" => match args {
            [Value::Array(a), Value::String(test_name), rest @ ..] => {
                let items = a.borrow();
                let mut kept = Vec::new();
                for item in items.iter() {
                    if !run_test(test_name, item, rest)? {
                        kept.push(item.clone());
                    }
                }
                Ok(Value::array(kept))
            }
            _ => Err(Error::bad_state("reject() expects an array and a test name")),
        },
        "raise_exception" => {
            let msg = args.first().map(Value::stringify).unwrap_or_default();
            Err(Error::bad_state(msg))
        }
        other => Err(Error::bad_state(format!("unknown callable: {other}"))),
    }
}

/// Parses and renders `source` against `ctx` in one pass.
pub fn render(source: &str, ctx: &Context) -> Result<String> {
    let tokens = tokenize(source)?;
    let mut pos = 0;
    let (nodes, stop) = parse_block(&tokens, &mut pos)?;
    if stop.is_some() {
        return Err(Error::invalid_pattern("unmatched block-closing statement"));
    }
    let mut renderer = Renderer { ctx, scopes: vec![IndexMap::new()], loop_stack: Vec::new() };
    let mut out = String::new();
    renderer.render(&nodes, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_a_variable() {
        let ctx = Context::new();
        ctx.insert("name", Value::from("world"));
        assert_eq!(render("hello {{ name }}!", &ctx).unwrap(), "hello world!");
    }

    #[test]
    fn if_elif_else() {
        let ctx = Context::new();
        ctx.insert("n", Value::Int(2));
        let tpl = "{% if n == 1 %}one{% elif n == 2 %}two{% else %}many{% endif %}";
        assert_eq!(render(tpl, &ctx).unwrap(), "two");
    }

    #[test]
    fn for_loop_over_array_with_filter_condition() {
        let ctx = Context::new();
        ctx.insert("items", Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]));
        let tpl = "{% for x in items if x % 2 == 0 %}{{ x }},{% endfor %}";
        assert_eq!(render(tpl, &ctx).unwrap(), "2,4,");
    }

    #[test]
    fn recursive_for_walks_nested_children() {
        let ctx = Context::new();
        let leaf = Value::object(vec![
            (ValueKey::String("name".into()), Value::from("b")),
            (ValueKey::String("children".into()), Value::array(vec![])),
        ]);
        let root = Value::object(vec![
            (ValueKey::String("name".into()), Value::from("a")),
            (ValueKey::String("children".into()), Value::array(vec![leaf])),
        ]);
        ctx.insert("tree", Value::array(vec![root]));
        let tpl = "{% for node in tree recursive %}{{ node.name }}{{ loop(node.children) }}{% endfor %}";
        assert_eq!(render(tpl, &ctx).unwrap(), "ab");
    }

    #[test]
    fn loop_outside_recursive_for_is_an_error() {
        let ctx = Context::new();
        assert!(render("{{ loop(1) }}", &ctx).is_err());
    }

    #[test]
    fn namespace_mutation_escapes_loop_scope() {
        let ctx = Context::new();
        ctx.insert("items", Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        let tpl = "{% set ns = namespace(total=0) %}{% for x in items %}{% set ns.total = ns.total + x %}{% endfor %}{{ ns.total }}";
        assert_eq!(render(tpl, &ctx).unwrap(), "6");
    }

    #[test]
    fn pipes_and_builtins() {
        let ctx = Context::new();
        ctx.insert("items", Value::array(vec![Value::from("a"), Value::from("b")]));
        assert_eq!(render("{{ items | join(', ') }}", &ctx).unwrap(), "a, b");
        assert_eq!(render("{{ '  hi  ' | trim }}", &ctx).unwrap(), "hi");
        assert_eq!(render("{{ items | count }}", &ctx).unwrap(), "2");
    }

    #[test]
    fn is_tests() {
        let ctx = Context::new();
        ctx.insert("x", Value::Int(5));
        assert_eq!(render("{{ x is defined }}", &ctx).unwrap(), "true");
        assert_eq!(render("{{ missing is defined }}", &ctx).unwrap(), "false");
        assert_eq!(render("{{ x is integer }}", &ctx).unwrap(), "true");
        assert_eq!(render("{{ x is not none }}", &ctx).unwrap(), "true");
    }

    #[test]
    fn range_and_reject() {
        let ctx = Context::new();
        let tpl = "{% for x in range(5) | reject('equalto', 2) %}{{ x }}{% endfor %}";
        assert_eq!(render(tpl, &ctx).unwrap(), "0134");
    }

    #[test]
    fn comments_are_dropped() {
        let ctx = Context::new();
        assert_eq!(render("a{# this is a comment #}b", &ctx).unwrap(), "ab");
    }

    #[test]
    fn tojson_round_trips_through_serde() {
        let ctx = Context::new();
        ctx.insert("v", Value::array(vec![Value::Int(1), Value::Bool(true), Value::Null]));
        assert_eq!(render("{{ v | tojson }}", &ctx).unwrap(), "[1,true,null]");
    }

    #[test]
    fn raise_exception_aborts_rendering() {
        let ctx = Context::new();
        let err = render("{{ raise_exception('nope') }}", &ctx).unwrap_err();
        assert!(matches!(err, Error::BadState(_)));
    }

    #[test]
    fn membership_and_indexing() {
        let ctx = Context::new();
        ctx.insert("items", Value::array(vec![Value::from("a"), Value::from("b")]));
        assert_eq!(render("{{ 'a' in items }}", &ctx).unwrap(), "true");
        assert_eq!(render("{{ items[1] }}", &ctx).unwrap(), "b");
        assert_eq!(render("{{ items[-1] }}", &ctx).unwrap(), "b");
    }
}

//! jq-style structured queries over JSON values
//!
//! Supports the subset needed to extract readings from device payloads:
//! paths (`.a.b`, `.["k"]`, `.[0]`, `.[]`), optional `?`, pipes, commas,
//! alternative `//`, `and`/`or`, comparisons, arithmetic, array
//! construction, literals and a handful of builtins.

use crate::error::{HeliosError, Result};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Field(String),
    Ident(String),
    Str(String),
    Num(f64),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Pipe,
    Comma,
    Semicolon,
    Question,
    Op(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
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
}

#[derive(Debug, Clone)]
enum Expr {
    Identity,
    Literal(Value),
    Index(Box<Expr>, Box<Expr>),
    Iterate(Box<Expr>),
    Try(Box<Expr>),
    Pipe(Box<Expr>, Box<Expr>),
    Comma(Box<Expr>, Box<Expr>),
    Alt(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Array(Option<Box<Expr>>),
    Call(String, Vec<Expr>),
}

/// Compiled query
#[derive(Debug, Clone)]
pub struct Query {
    source: String,
    expr: Expr,
}

impl Query {
    /// Compile a query; syntax errors and unknown functions fail here
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.pipe()?;
        if parser.pos != parser.tokens.len() {
            return Err(syntax(source, "unexpected trailing input"));
        }
        check_calls(&expr).map_err(|msg| syntax(source, &msg))?;
        Ok(Query {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// All outputs of the query for `input`
    pub fn run(&self, input: &Value) -> Result<Vec<Value>> {
        eval(&self.expr, input)
            .map_err(|msg| HeliosError::transform(format!("jq {}: {}", self.source, msg)))
    }

    /// First output of the query; an empty result is an error
    pub fn first(&self, input: &Value) -> Result<Value> {
        self.run(input)?.into_iter().next().ok_or_else(|| {
            HeliosError::transform(format!("jq {}: no result", self.source))
        })
    }
}

/// Render a query result the way it is handed to coercion: strings raw,
/// whole floats without a fraction, everything else as compact JSON
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn syntax(source: &str, msg: &str) -> HeliosError {
    HeliosError::config(format!("invalid jq query '{}': {}", source, msg))
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let ident_at = |i: usize| -> (String, usize) {
        let mut j = i;
        while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
            j += 1;
        }
        (chars[i..j].iter().collect(), j)
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                if i + 1 < chars.len() && (chars[i + 1].is_alphabetic() || chars[i + 1] == '_') {
                    let (name, j) = ident_at(i + 1);
                    tokens.push(Token::Field(name));
                    i = j;
                } else if i + 1 < chars.len() && chars[i + 1] == '"' {
                    let (s, j) = lex_string(&chars, i + 1).map_err(|m| syntax(src, &m))?;
                    tokens.push(Token::Field(s));
                    i = j;
                } else {
                    tokens.push(Token::Dot);
                    i += 1;
                }
            }
            '"' => {
                let (s, j) = lex_string(&chars, i).map_err(|m| syntax(src, &m))?;
                tokens.push(Token::Str(s));
                i = j;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_ascii_digit()
                        || chars[j] == '.'
                        || chars[j] == 'e'
                        || chars[j] == 'E'
                        || ((chars[j] == '-' || chars[j] == '+')
                            && matches!(chars[j - 1], 'e' | 'E')))
                {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(src, &format!("invalid number {}", text)))?;
                tokens.push(Token::Num(n));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' => {
                let (name, j) = ident_at(i);
                tokens.push(Token::Ident(name));
                i = j;
            }
            _ => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "//" => Some("//"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '<' => "<",
                    '>' => ">",
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '%' => "%",
                    _ => return Err(syntax(src, &format!("unexpected character '{}'", c))),
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> std::result::Result<(String, usize), String> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((out, i + 1)),
            '\\' => {
                i += 1;
                match chars.get(i) {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c @ ('"' | '\\' | '/')) => out.push(*c),
                    Some(c) => return Err(format!("invalid escape \\{}", c)),
                    None => break,
                }
            }
            c => out.push(c),
        }
        i += 1;
    }
    Err("unterminated string".to_string())
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, HeliosError>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op) && {
            self.pos += 1;
            true
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word) && {
            self.pos += 1;
            true
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(HeliosError::config(format!(
                "invalid jq query: expected {:?} at token {}",
                token, self.pos
            )))
        }
    }

    fn pipe(&mut self) -> ParseResult {
        let lhs = self.comma()?;
        if self.eat(&Token::Pipe) {
            let rhs = self.pipe()?;
            return Ok(Expr::Pipe(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn comma(&mut self) -> ParseResult {
        let mut lhs = self.alternative()?;
        while self.eat(&Token::Comma) {
            let rhs = self.alternative()?;
            lhs = Expr::Comma(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn alternative(&mut self) -> ParseResult {
        let lhs = self.or()?;
        if self.eat_op("//") {
            let rhs = self.alternative()?;
            return Ok(Expr::Alt(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> ParseResult {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> ParseResult {
        let mut lhs = self.comparison()?;
        while self.eat_keyword("and") {
            let rhs = self.comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> ParseResult {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => BinOp::Eq,
            Some(Token::Op("!=")) => BinOp::Ne,
            Some(Token::Op("<")) => BinOp::Lt,
            Some(Token::Op("<=")) => BinOp::Le,
            Some(Token::Op(">")) => BinOp::Gt,
            Some(Token::Op(">=")) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> ParseResult {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinOp::Add,
                Some(Token::Op("-")) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> ParseResult {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinOp::Mul,
                Some(Token::Op("/")) => BinOp::Div,
                Some(Token::Op("%")) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> ParseResult {
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Field(name)) => {
                    let key = Expr::Literal(Value::String(name.clone()));
                    self.pos += 1;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                Some(Token::Dot) if self.peek_at(1) == Some(&Token::LBracket) => {
                    self.pos += 1;
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    if self.eat(&Token::RBracket) {
                        expr = Expr::Iterate(Box::new(expr));
                    } else {
                        let index = self.pipe()?;
                        self.expect(&Token::RBracket)?;
                        expr = Expr::Index(Box::new(expr), Box::new(index));
                    }
                }
                Some(Token::Question) => {
                    self.pos += 1;
                    expr = Expr::Try(Box::new(expr));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> ParseResult {
        let token = self.peek().cloned().ok_or_else(|| {
            HeliosError::config("invalid jq query: unexpected end of input")
        })?;
        self.pos += 1;

        match token {
            Token::Dot => Ok(Expr::Identity),
            Token::Field(name) => Ok(Expr::Index(
                Box::new(Expr::Identity),
                Box::new(Expr::Literal(Value::String(name))),
            )),
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let mut args = Vec::new();
                    if self.eat(&Token::LParen) {
                        loop {
                            args.push(self.pipe()?);
                            if !self.eat(&Token::Semicolon) {
                                break;
                            }
                        }
                        self.expect(&Token::RParen)?;
                    }
                    Ok(Expr::Call(word, args))
                }
            },
            Token::LParen => {
                let inner = self.pipe()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::Array(None));
                }
                let inner = self.pipe()?;
                self.expect(&Token::RBracket)?;
                Ok(Expr::Array(Some(Box::new(inner))))
            }
            other => Err(HeliosError::config(format!(
                "invalid jq query: unexpected token {:?}",
                other
            ))),
        }
    }
}

const BUILTINS: &[(&str, usize)] = &[
    ("select", 1),
    ("map", 1),
    ("length", 0),
    ("keys", 0),
    ("has", 1),
    ("not", 0),
    ("tonumber", 0),
    ("tostring", 0),
    ("type", 0),
    ("first", 0),
    ("first", 1),
    ("last", 0),
    ("add", 0),
    ("empty", 0),
    ("min", 0),
    ("max", 0),
    ("floor", 0),
    ("ceil", 0),
    ("round", 0),
    ("abs", 0),
    ("ascii_downcase", 0),
    ("ascii_upcase", 0),
    ("test", 1),
];

fn check_calls(expr: &Expr) -> std::result::Result<(), String> {
    match expr {
        Expr::Call(name, args) => {
            if !BUILTINS
                .iter()
                .any(|(n, arity)| n == name && *arity == args.len())
            {
                return Err(format!("unknown function {}/{}", name, args.len()));
            }
            if name == "test"
                && let Some(Expr::Literal(Value::String(pattern))) = args.first()
            {
                Regex::new(pattern).map_err(|e| e.to_string())?;
            }
            args.iter().try_for_each(check_calls)
        }
        Expr::Index(a, b)
        | Expr::Pipe(a, b)
        | Expr::Comma(a, b)
        | Expr::Alt(a, b)
        | Expr::And(a, b)
        | Expr::Or(a, b)
        | Expr::Binary(_, a, b) => {
            check_calls(a)?;
            check_calls(b)
        }
        Expr::Iterate(e) | Expr::Try(e) | Expr::Neg(e) => check_calls(e),
        Expr::Array(Some(e)) => check_calls(e),
        Expr::Identity | Expr::Literal(_) | Expr::Array(None) => Ok(()),
    }
}

type EvalResult = std::result::Result<Vec<Value>, String>;

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Null | Value::Bool(false))
}

fn as_f64(v: &Value) -> std::result::Result<f64, String> {
    v.as_f64()
        .ok_or_else(|| format!("{} is not a number", type_name(v)))
}

fn eval(expr: &Expr, input: &Value) -> EvalResult {
    match expr {
        Expr::Identity => Ok(vec![input.clone()]),
        Expr::Literal(v) => Ok(vec![v.clone()]),
        Expr::Index(base, key) => {
            let mut out = Vec::new();
            for b in eval(base, input)? {
                for k in eval(key, input)? {
                    out.push(index(&b, &k)?);
                }
            }
            Ok(out)
        }
        Expr::Iterate(base) => {
            let mut out = Vec::new();
            for b in eval(base, input)? {
                match b {
                    Value::Array(items) => out.extend(items),
                    Value::Object(map) => out.extend(map.into_iter().map(|(_, v)| v)),
                    other => return Err(format!("cannot iterate over {}", type_name(&other))),
                }
            }
            Ok(out)
        }
        Expr::Try(inner) => Ok(eval(inner, input).unwrap_or_default()),
        Expr::Pipe(lhs, rhs) => {
            let mut out = Vec::new();
            for v in eval(lhs, input)? {
                out.extend(eval(rhs, &v)?);
            }
            Ok(out)
        }
        Expr::Comma(lhs, rhs) => {
            let mut out = eval(lhs, input)?;
            out.extend(eval(rhs, input)?);
            Ok(out)
        }
        Expr::Alt(lhs, rhs) => {
            let found: Vec<Value> = eval(lhs, input)
                .unwrap_or_default()
                .into_iter()
                .filter(truthy)
                .collect();
            if found.is_empty() {
                eval(rhs, input)
            } else {
                Ok(found)
            }
        }
        Expr::And(lhs, rhs) => {
            let mut out = Vec::new();
            for l in eval(lhs, input)? {
                if !truthy(&l) {
                    out.push(Value::Bool(false));
                    continue;
                }
                for r in eval(rhs, input)? {
                    out.push(Value::Bool(truthy(&r)));
                }
            }
            Ok(out)
        }
        Expr::Or(lhs, rhs) => {
            let mut out = Vec::new();
            for l in eval(lhs, input)? {
                if truthy(&l) {
                    out.push(Value::Bool(true));
                    continue;
                }
                for r in eval(rhs, input)? {
                    out.push(Value::Bool(truthy(&r)));
                }
            }
            Ok(out)
        }
        Expr::Binary(op, lhs, rhs) => {
            let mut out = Vec::new();
            for r in eval(rhs, input)? {
                for l in eval(lhs, input)? {
                    out.push(binary(*op, &l, &r)?);
                }
            }
            Ok(out)
        }
        Expr::Neg(inner) => eval(inner, input)?
            .iter()
            .map(|v| as_f64(v).map(|f| number(-f)))
            .collect(),
        Expr::Array(None) => Ok(vec![Value::Array(Vec::new())]),
        Expr::Array(Some(inner)) => Ok(vec![Value::Array(eval(inner, input)?)]),
        Expr::Call(name, args) => call(name, args, input),
    }
}

fn index(base: &Value, key: &Value) -> std::result::Result<Value, String> {
    match (base, key) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Object(map), Value::String(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Value::Number(n)) => {
            let i = n.as_f64().unwrap_or(0.0).floor() as i64;
            let i = if i < 0 { items.len() as i64 + i } else { i };
            Ok(usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null))
        }
        _ => Err(format!(
            "cannot index {} with {}",
            type_name(base),
            type_name(key)
        )),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut xk: Vec<&String> = x.keys().collect();
            let mut yk: Vec<&String> = y.keys().collect();
            xk.sort();
            yk.sort();
            xk.cmp(&yk).then_with(|| {
                xk.iter()
                    .map(|k| compare(&x[k.as_str()], &y[k.as_str()]))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            })
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> std::result::Result<Value, String> {
    let ord = || compare(l, r);
    match op {
        BinOp::Eq => Ok(Value::Bool(ord() == Ordering::Equal)),
        BinOp::Ne => Ok(Value::Bool(ord() != Ordering::Equal)),
        BinOp::Lt => Ok(Value::Bool(ord() == Ordering::Less)),
        BinOp::Le => Ok(Value::Bool(ord() != Ordering::Greater)),
        BinOp::Gt => Ok(Value::Bool(ord() == Ordering::Greater)),
        BinOp::Ge => Ok(Value::Bool(ord() != Ordering::Less)),
        BinOp::Add => match (l, r) {
            (Value::Null, other) | (other, Value::Null) => Ok(other.clone()),
            (Value::Number(_), Value::Number(_)) => Ok(number(as_f64(l)? + as_f64(r)?)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            (Value::Object(a), Value::Object(b)) => {
                let mut merged: Map<String, Value> = a.clone();
                merged.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(Value::Object(merged))
            }
            _ => Err(format!("cannot add {} and {}", type_name(l), type_name(r))),
        },
        BinOp::Sub => match (l, r) {
            (Value::Number(_), Value::Number(_)) => Ok(number(as_f64(l)? - as_f64(r)?)),
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(
                a.iter().filter(|v| !b.contains(v)).cloned().collect(),
            )),
            _ => Err(format!("cannot subtract {} from {}", type_name(r), type_name(l))),
        },
        BinOp::Mul => Ok(number(as_f64(l)? * as_f64(r)?)),
        BinOp::Div => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::Array(
                a.split(b.as_str())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )),
            _ => {
                let d = as_f64(r)?;
                if d == 0.0 {
                    return Err("division by zero".to_string());
                }
                Ok(number(as_f64(l)? / d))
            }
        },
        BinOp::Mod => {
            let d = as_f64(r)?.trunc() as i64;
            if d == 0 {
                return Err("modulo by zero".to_string());
            }
            let n = as_f64(l)?.trunc() as i64;
            n.checked_rem(d)
                .map(|m| number(m as f64))
                .ok_or_else(|| format!("{} % {} overflows", n, d))
        }
    }
}

fn call(name: &str, args: &[Expr], input: &Value) -> EvalResult {
    let one = |v: Value| Ok(vec![v]);
    match (name, args) {
        ("empty", _) => Ok(Vec::new()),
        ("select", [cond]) => Ok(eval(cond, input)?
            .iter()
            .filter(|c| truthy(c))
            .map(|_| input.clone())
            .collect()),
        ("map", [f]) => match input {
            Value::Array(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(eval(f, item)?);
                }
                one(Value::Array(out))
            }
            other => Err(format!("cannot map over {}", type_name(other))),
        },
        ("first", [f]) => Ok(eval(f, input)?.into_iter().take(1).collect()),
        ("first", []) => one(index(input, &Value::from(0))?),
        ("last", []) => one(index(input, &Value::from(-1))?),
        ("length", []) => match input {
            Value::Null => one(Value::from(0)),
            Value::Bool(_) => Err("boolean has no length".to_string()),
            Value::Number(n) => one(number(n.as_f64().unwrap_or(0.0).abs())),
            Value::String(s) => one(Value::from(s.chars().count())),
            Value::Array(items) => one(Value::from(items.len())),
            Value::Object(map) => one(Value::from(map.len())),
        },
        ("keys", []) => match input {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                one(Value::Array(
                    keys.into_iter().map(|k| Value::String(k.clone())).collect(),
                ))
            }
            Value::Array(items) => one(Value::Array((0..items.len()).map(Value::from).collect())),
            other => Err(format!("{} has no keys", type_name(other))),
        },
        ("has", [key]) => {
            let mut out = Vec::new();
            for k in eval(key, input)? {
                let found = match (input, &k) {
                    (Value::Object(map), Value::String(k)) => map.contains_key(k),
                    (Value::Array(items), Value::Number(n)) => n
                        .as_f64()
                        .is_some_and(|i| i >= 0.0 && (i as usize) < items.len()),
                    _ => return Err(format!("cannot check {} for key", type_name(input))),
                };
                out.push(Value::Bool(found));
            }
            Ok(out)
        }
        ("not", []) => one(Value::Bool(!truthy(input))),
        ("type", []) => one(Value::String(type_name(input).to_string())),
        ("tonumber", []) => match input {
            Value::Number(_) => one(input.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| vec![number(f)])
                .map_err(|_| format!("cannot parse '{}' as number", s)),
            other => Err(format!("{} cannot be parsed as a number", type_name(other))),
        },
        ("tostring", []) => match input {
            Value::String(_) => one(input.clone()),
            other => one(Value::String(other.to_string())),
        },
        ("add", []) => match input {
            Value::Array(items) => {
                let mut acc = Value::Null;
                for item in items {
                    acc = binary(BinOp::Add, &acc, item)?;
                }
                one(acc)
            }
            Value::Null => one(Value::Null),
            other => Err(format!("cannot add elements of {}", type_name(other))),
        },
        ("min", []) | ("max", []) => match input {
            Value::Array(items) => {
                let pick = items.iter().reduce(|a, b| {
                    let ord = compare(a, b);
                    let keep_a = if name == "min" {
                        ord != Ordering::Greater
                    } else {
                        ord == Ordering::Greater
                    };
                    if keep_a { a } else { b }
                });
                one(pick.cloned().unwrap_or(Value::Null))
            }
            other => Err(format!("{} has no {}", type_name(other), name)),
        },
        ("floor", []) => one(number(as_f64(input)?.floor())),
        ("ceil", []) => one(number(as_f64(input)?.ceil())),
        ("round", []) => one(number(as_f64(input)?.round())),
        ("abs", []) => one(number(as_f64(input)?.abs())),
        ("ascii_downcase", []) | ("ascii_upcase", []) => match input {
            Value::String(s) if name == "ascii_downcase" => {
                one(Value::String(s.to_ascii_lowercase()))
            }
            Value::String(s) => one(Value::String(s.to_ascii_uppercase())),
            other => Err(format!("{} cannot be case-converted", type_name(other))),
        },
        ("test", [pattern]) => {
            let Value::String(text) = input else {
                return Err(format!("{} cannot be matched", type_name(input)));
            };
            let mut out = Vec::new();
            for p in eval(pattern, input)? {
                let Value::String(p) = p else {
                    return Err("test pattern must be a string".to_string());
                };
                let re = Regex::new(&p).map_err(|e| e.to_string())?;
                out.push(Value::Bool(re.is_match(text)));
            }
            Ok(out)
        }
        _ => Err(format!("unknown function {}/{}", name, args.len())),
    }
}

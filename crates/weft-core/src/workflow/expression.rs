//! Expression evaluator for `when` gates and `{{ }}` templates.
//!
//! Expressions are parsed once into a small tagged AST (`Expr`) at workflow
//! load time and evaluated against an immutable `VariableContext` snapshot
//! of the run's parameter store. Evaluation is pure: no I/O, no clock.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ("==" | "!=" | ">" | "<" | ">=" | "<=") unary )?
//! unary   := "!" unary | primary
//! primary := literal | path | "{{" path "}}" | "(" or ")"
//! path    := name | "params." name | "tasks." task ".outputs." name
//! ```
//!
//! A reference that is not bound is always an `UnresolvedReference` error;
//! it is never defaulted to null or empty.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Number, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unresolved reference '{0}'")]
    UnresolvedReference(String),

    #[error("type error: {0}")]
    Type(String),
}

impl EvalError {
    fn parse(position: usize, message: impl Into<String>) -> Self {
        EvalError::Parse {
            position,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// A parameter reference: a global parameter or an upstream task output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VarPath {
    /// `params.<name>` or bare `<name>`.
    Param(String),
    /// `tasks.<task>.outputs.<name>`.
    TaskOutput { task: String, output: String },
}

impl VarPath {
    /// Parse a dotted reference path.
    pub fn parse(src: &str) -> Result<Self, EvalError> {
        let src = src.trim();
        let segments: Vec<&str> = src.split('.').collect();
        if segments.iter().any(|s| !is_name(s)) {
            return Err(EvalError::parse(0, format!("invalid reference '{src}'")));
        }
        match segments.as_slice() {
            [name] => Ok(VarPath::Param((*name).to_string())),
            ["params", name] => Ok(VarPath::Param((*name).to_string())),
            ["tasks", task, "outputs", output] => Ok(VarPath::TaskOutput {
                task: (*task).to_string(),
                output: (*output).to_string(),
            }),
            _ => Err(EvalError::parse(
                0,
                format!(
                    "invalid reference '{src}' (expected '<param>', 'params.<param>' or 'tasks.<task>.outputs.<name>')"
                ),
            )),
        }
    }

    /// The upstream task this reference points into, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            VarPath::Param(_) => None,
            VarPath::TaskOutput { task, .. } => Some(task),
        }
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarPath::Param(name) => write!(f, "params.{name}"),
            VarPath::TaskOutput { task, output } => write!(f, "tasks.{task}.outputs.{output}"),
        }
    }
}

/// Valid name for a task, parameter or output: alphanumeric plus `-` and `_`.
pub fn is_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

// ---------------------------------------------------------------------------
// Variable context
// ---------------------------------------------------------------------------

/// Immutable scope an expression is evaluated against.
///
/// Built by the parameter store; artifacts appear as their URI string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableContext {
    params: BTreeMap<String, Value>,
    outputs: BTreeMap<String, BTreeMap<String, Value>>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert_param(name, value);
        self
    }

    pub fn with_output(
        mut self,
        task: impl Into<String>,
        output: impl Into<String>,
        value: Value,
    ) -> Self {
        self.insert_output(task, output, value);
        self
    }

    pub fn insert_param(&mut self, name: impl Into<String>, value: Value) {
        self.params.insert(name.into(), value);
    }

    pub fn insert_output(&mut self, task: impl Into<String>, output: impl Into<String>, value: Value) {
        self.outputs
            .entry(task.into())
            .or_default()
            .insert(output.into(), value);
    }

    pub fn lookup(&self, path: &VarPath) -> Option<&Value> {
        match path {
            VarPath::Param(name) => self.params.get(name),
            VarPath::TaskOutput { task, output } => {
                self.outputs.get(task).and_then(|o| o.get(output))
            }
        }
    }

    fn resolve(&self, path: &VarPath) -> Result<&Value, EvalError> {
        self.lookup(path)
            .ok_or_else(|| EvalError::UnresolvedReference(path.to_string()))
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    VarRef(VarPath),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Parse an expression string.
    pub fn parse(src: &str) -> Result<Self, EvalError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: src.len(),
        };
        let expr = parser.parse_or()?;
        if let Some((offset, tok)) = parser.tokens.get(parser.pos) {
            return Err(EvalError::parse(
                *offset,
                format!("unexpected token {tok:?} after expression"),
            ));
        }
        Ok(expr)
    }

    /// All references the expression reads, in source order.
    pub fn references(&self) -> Vec<&VarPath> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a VarPath>) {
        match self {
            Expr::Literal(_) => {}
            Expr::VarRef(path) => out.push(path),
            Expr::Not(inner) => inner.collect_references(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_references(out);
                rhs.collect_references(out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate an expression to a JSON value.
pub fn evaluate(expr: &Expr, ctx: &VariableContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::VarRef(path) => ctx.resolve(path).cloned(),
        Expr::Not(inner) => {
            let v = expect_bool(evaluate(inner, ctx)?, "!")?;
            Ok(Value::Bool(!v))
        }
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => {
                if !expect_bool(evaluate(lhs, ctx)?, "&&")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(expect_bool(evaluate(rhs, ctx)?, "&&")?))
            }
            BinaryOp::Or => {
                if expect_bool(evaluate(lhs, ctx)?, "||")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(expect_bool(evaluate(rhs, ctx)?, "||")?))
            }
            cmp => {
                let l = evaluate(lhs, ctx)?;
                let r = evaluate(rhs, ctx)?;
                compare(*cmp, &l, &r).map(Value::Bool)
            }
        },
    }
}

/// Evaluate an expression that must produce a boolean (a `when` gate).
pub fn evaluate_condition(expr: &Expr, ctx: &VariableContext) -> Result<bool, EvalError> {
    match evaluate(expr, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::Type(format!(
            "condition must evaluate to a boolean, got {other}"
        ))),
    }
}

fn expect_bool(v: Value, op: &str) -> Result<bool, EvalError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::Type(format!(
            "operand of '{op}' must be a boolean, got {other}"
        ))),
    }
}

/// Numeric view of a value; numeric strings coerce.
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    match op {
        BinaryOp::Eq => Ok(loosely_equal(l, r)),
        BinaryOp::Ne => Ok(!loosely_equal(l, r)),
        _ => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => match (as_number(l), as_number(r)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| {
                        EvalError::Type(format!("cannot order {l} and {r}"))
                    })?,
                    _ => {
                        return Err(EvalError::Type(format!(
                            "'{}' needs numbers or strings, got {l} and {r}",
                            op.symbol()
                        )));
                    }
                },
            };
            Ok(match op {
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => ordering.is_le(),
            })
        }
    }
}

/// Equality with number/numeric-string coercion. Everything else is strict.
fn loosely_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) | (Value::Number(_), Value::Number(_)) => {
            match (as_number(l), as_number(r)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => l == r,
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Var(VarPath),
}

/// A string with `{{ path }}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, EvalError> {
        let mut segments = Vec::new();
        let mut rest = src;
        let mut offset = 0;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| EvalError::parse(offset + open, "unterminated '{{'"))?;
            let path = VarPath::parse(&after[..close]).map_err(|e| match e {
                EvalError::Parse { message, .. } => EvalError::parse(offset + open, message),
                other => other,
            })?;
            segments.push(Segment::Var(path));
            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments })
    }

    /// Substitute every placeholder. Strings are inserted raw, other values
    /// as compact JSON.
    pub fn render(&self, ctx: &VariableContext) -> Result<String, EvalError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Var(path) => match ctx.resolve(path)? {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(out)
    }

    pub fn references(&self) -> impl Iterator<Item = &VarPath> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var(p) => Some(p),
            Segment::Text(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    OpenVar,
    CloseVar,
    LParen,
    RParen,
    Path(String),
    Literal(Value),
    Op(BinaryOp),
    Bang,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = peek(i + 1);
        match c {
            c if c.is_whitespace() => i += 1,
            '{' if next == Some('{') => {
                tokens.push((offset, Token::OpenVar));
                i += 2;
            }
            '}' if next == Some('}') => {
                tokens.push((offset, Token::CloseVar));
                i += 2;
            }
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Op(BinaryOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Op(BinaryOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Token::Bang));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push((offset, Token::Op(BinaryOp::Ge)));
                i += 2;
            }
            '<' if next == Some('=') => {
                tokens.push((offset, Token::Op(BinaryOp::Le)));
                i += 2;
            }
            '>' => {
                tokens.push((offset, Token::Op(BinaryOp::Gt)));
                i += 1;
            }
            '<' => {
                tokens.push((offset, Token::Op(BinaryOp::Lt)));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Token::Op(BinaryOp::And)));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Op(BinaryOp::Or)));
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match peek(i) {
                        None => return Err(EvalError::parse(offset, "unterminated string literal")),
                        Some(ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = peek(i + 1).ok_or_else(|| {
                                EvalError::parse(offset, "unterminated string literal")
                            })?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        }
                        Some(ch) if (ch == '{' || ch == '}') && peek(i + 1) == Some(ch) => {
                            return Err(EvalError::parse(
                                offset,
                                "templates are not expanded inside string literals; \
                                 write the {{ path }} reference unquoted",
                            ));
                        }
                        Some(ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((offset, Token::Literal(Value::String(value))));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while peek(i).is_some_and(|ch| ch.is_ascii_digit() || ch == '.') {
                    i += 1;
                }
                let end = chars.get(i).map_or(src.len(), |(o, _)| *o);
                let text = &src[offset..end];
                let number = if let Ok(n) = text.parse::<i64>() {
                    Number::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .ok_or_else(|| {
                            EvalError::parse(chars[start].0, format!("invalid number '{text}'"))
                        })?
                };
                tokens.push((offset, Token::Literal(Value::Number(number))));
            }
            c if c.is_alphabetic() || c == '_' => {
                i += 1;
                while peek(i).is_some_and(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.')) {
                    i += 1;
                }
                let end = chars.get(i).map_or(src.len(), |(o, _)| *o);
                let word = &src[offset..end];
                let token = match word {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Path(word.to_string()),
                };
                tokens.push((offset, token));
            }
            other => {
                return Err(EvalError::parse(offset, format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), EvalError> {
        let offset = self.offset();
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(EvalError::parse(offset, format!("expected {what}, found {tok:?}"))),
            None => Err(EvalError::parse(offset, format!("expected {what}, found end of input"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinaryOp::Or)) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Token::Op(BinaryOp::And)) {
            self.pos += 1;
            let rhs = self.parse_cmp()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, EvalError> {
        let lhs = self.parse_unary()?;
        match self.peek() {
            Some(Token::Op(op)) if !matches!(op, BinaryOp::And | BinaryOp::Or) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.parse_unary()?;
                Ok(binary(op, lhs, rhs))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Path(p)) => path_at(&p, offset).map(Expr::VarRef),
            Some(Token::OpenVar) => {
                let path_offset = self.offset();
                let path = match self.advance() {
                    Some(Token::Path(p)) => path_at(&p, path_offset)?,
                    _ => return Err(EvalError::parse(path_offset, "expected a reference inside '{{ }}'")),
                };
                self.expect(Token::CloseVar, "'}}'")?;
                Ok(Expr::VarRef(path))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(tok) => Err(EvalError::parse(offset, format!("unexpected token {tok:?}"))),
            None => Err(EvalError::parse(offset, "unexpected end of expression")),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn path_at(p: &str, offset: usize) -> Result<VarPath, EvalError> {
    VarPath::parse(p).map_err(|e| match e {
        EvalError::Parse { message, .. } => EvalError::parse(offset, message),
        other => other,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> VariableContext {
        VariableContext::new()
            .with_param("env", json!("staging"))
            .with_param("replicas", json!(3))
            .with_param("debug", json!(false))
            .with_output("build", "tag", json!("v1.2.3"))
            .with_output("test", "coverage", json!("87.5"))
    }

    fn eval_bool(src: &str) -> bool {
        evaluate_condition(&Expr::parse(src).unwrap(), &ctx()).unwrap()
    }

    // -----------------------------------------------------------------------
    // References
    // -----------------------------------------------------------------------

    #[test]
    fn test_var_path_forms() {
        assert_eq!(VarPath::parse("env").unwrap(), VarPath::Param("env".into()));
        assert_eq!(VarPath::parse("params.env").unwrap(), VarPath::Param("env".into()));
        assert_eq!(
            VarPath::parse("tasks.build.outputs.tag").unwrap(),
            VarPath::TaskOutput {
                task: "build".into(),
                output: "tag".into()
            }
        );
        assert!(VarPath::parse("tasks.build.tag").is_err());
        assert!(VarPath::parse("params.").is_err());
    }

    #[test]
    fn test_var_path_display_is_canonical() {
        assert_eq!(VarPath::parse("env").unwrap().to_string(), "params.env");
        assert_eq!(
            VarPath::parse("tasks.a.outputs.b").unwrap().to_string(),
            "tasks.a.outputs.b"
        );
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    #[test]
    fn test_env_equals_staging() {
        assert!(eval_bool("{{env}} == 'staging'"));
        let production = VariableContext::new().with_param("env", json!("production"));
        let expr = Expr::parse("{{env}} == 'staging'").unwrap();
        assert!(!evaluate_condition(&expr, &production).unwrap());
    }

    #[test]
    fn test_bare_and_prefixed_paths() {
        assert!(eval_bool("params.env != \"production\""));
        assert!(eval_bool("tasks.build.outputs.tag == 'v1.2.3'"));
        assert!(eval_bool("{{ tasks.build.outputs.tag }} == 'v1.2.3'"));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval_bool("replicas >= 3"));
        assert!(eval_bool("replicas < 3.5"));
        assert!(!eval_bool("replicas > 3"));
        assert!(eval_bool("-1 < replicas"));
    }

    #[test]
    fn test_numeric_string_coercion() {
        assert!(eval_bool("tasks.test.outputs.coverage > 80"));
        assert!(eval_bool("replicas == '3'"));
        assert!(!eval_bool("env == 3"));
    }

    #[test]
    fn test_string_ordering_is_lexical() {
        assert!(eval_bool("'abc' < 'abd'"));
    }

    #[test]
    fn test_boolean_logic_and_precedence() {
        assert!(eval_bool("env == 'staging' && replicas == 3"));
        assert!(eval_bool("debug || replicas == 3"));
        assert!(eval_bool("!debug"));
        assert!(eval_bool("false && true || true"));
        assert!(!eval_bool("false && (true || true)"));
        assert!(eval_bool("!(env == 'production')"));
    }

    #[test]
    fn test_short_circuit_skips_unresolved_rhs() {
        assert!(!eval_bool("debug && missing == 1"));
        assert!(eval_bool("!debug || missing == 1"));
    }

    #[test]
    fn test_literals() {
        let c = VariableContext::new();
        assert_eq!(evaluate(&Expr::parse("null").unwrap(), &c).unwrap(), Value::Null);
        assert_eq!(evaluate(&Expr::parse("2.5").unwrap(), &c).unwrap(), json!(2.5));
        assert_eq!(
            evaluate(&Expr::parse("'it\\'s'").unwrap(), &c).unwrap(),
            json!("it's")
        );
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_unresolved_reference_is_an_error() {
        let expr = Expr::parse("{{region}} == 'eu'").unwrap();
        let err = evaluate_condition(&expr, &ctx()).unwrap_err();
        assert_eq!(err, EvalError::UnresolvedReference("params.region".into()));
    }

    #[test]
    fn test_non_boolean_condition_is_type_error() {
        let expr = Expr::parse("env").unwrap();
        assert!(matches!(
            evaluate_condition(&expr, &ctx()),
            Err(EvalError::Type(_))
        ));
    }

    #[test]
    fn test_logic_on_non_boolean_is_type_error() {
        let expr = Expr::parse("replicas && true").unwrap();
        assert!(matches!(evaluate(&expr, &ctx()), Err(EvalError::Type(_))));
    }

    #[test]
    fn test_ordering_mismatched_types_is_type_error() {
        let expr = Expr::parse("debug > 1").unwrap();
        assert!(matches!(evaluate(&expr, &ctx()), Err(EvalError::Type(_))));
    }

    #[test]
    fn test_parse_errors() {
        for src in ["", "env ==", "(env == 'x'", "{{env", "env == 'x' 'y'", "'open", "a # b"] {
            assert!(
                matches!(Expr::parse(src), Err(EvalError::Parse { .. })),
                "expected parse error for {src:?}"
            );
        }
    }

    #[test]
    fn test_template_inside_string_literal_rejected() {
        for src in ["'{{env}}' == 'staging'", "env == \"{{ params.env }}\"", "env == 'a}}'"] {
            let err = Expr::parse(src).unwrap_err();
            assert!(err.to_string().contains("unquoted"), "{src:?}: {err}");
        }
        // Single braces and escaped doubles stay literal.
        let expr = Expr::parse(r"env != '{x}' && env != '\{{'").unwrap();
        assert_eq!(evaluate(&expr, &ctx()).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_references_collects_all_paths() {
        let expr = Expr::parse("env == 'x' && tasks.build.outputs.tag != null").unwrap();
        let refs: Vec<String> = expr.references().iter().map(|p| p.to_string()).collect();
        assert_eq!(refs, vec!["params.env", "tasks.build.outputs.tag"]);
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    #[test]
    fn test_template_render() {
        let t = Template::parse("deploy {{tasks.build.outputs.tag}} to {{ env }} x{{replicas}}").unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), "deploy v1.2.3 to staging x3");
        assert_eq!(t.references().count(), 3);
    }

    #[test]
    fn test_template_without_placeholders() {
        let t = Template::parse("plain text").unwrap();
        assert_eq!(t.render(&VariableContext::new()).unwrap(), "plain text");
    }

    #[test]
    fn test_template_errors() {
        assert!(matches!(Template::parse("a {{env"), Err(EvalError::Parse { .. })));
        let t = Template::parse("{{missing}}").unwrap();
        assert!(matches!(
            t.render(&ctx()),
            Err(EvalError::UnresolvedReference(_))
        ));
    }
}

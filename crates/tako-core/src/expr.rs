//! Restricted boolean expression language for step `if` and subscription
//! filters.
//!
//! Supported: `==` `!=` `<` `<=` `>` `>=`, `&&` `||` `!`, parentheses,
//! dot-paths into the evaluation context, string/number/boolean literals,
//! `in` over a string list, `has(<path>)`, and
//! `semver.major|minor|patch(<value>)`.
//!
//! Evaluation is total: a path that does not resolve yields "absent", which
//! is falsy, compares unequal to everything, and makes `has` return false.

use semver::Version;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

use crate::codes::ErrorCode;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unexpected character `{ch}` at offset {offset} in `{src}`")]
    UnexpectedChar {
        ch: char,
        offset: usize,
        src: String,
    },
    #[error("unterminated string literal in `{0}`")]
    UnterminatedString(String),
    #[error("unexpected end of expression `{0}`")]
    UnexpectedEnd(String),
    #[error("unexpected token `{token}` in `{src}`")]
    UnexpectedToken { token: String, src: String },
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("function `{func}` expects {expected} argument(s)")]
    Arity { func: String, expected: usize },
}

impl ExprError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ExpressionInvalid
    }
}

pub type Result<T> = std::result::Result<T, ExprError>;

/// Runtime value of a (sub)expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    List(Vec<Value>),
    Absent,
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Str(s) => !s.is_empty(),
            Self::Num(n) => *n != 0.0,
            Self::List(items) => !items.is_empty(),
            Self::Absent => false,
        }
    }

    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Absent,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect())
            }
            // Objects have no literal form in the language; treat reaching
            // one as a non-value.
            serde_json::Value::Object(_) => Self::Absent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(String),
    List(Vec<Expr>),
    Call { func: String, args: Vec<CallArg> },
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        needle: Box<Expr>,
        list: Box<Expr>,
    },
}

/// `has` takes a path name, everything else takes values.
#[derive(Debug, Clone)]
enum CallArg {
    Path(String),
    Expr(Box<Expr>),
}

/// A compiled expression, reusable across evaluations.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    ast: Expr,
}

impl Program {
    /// Parse `source` into an executable program.
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let ast = parser.parse_expr()?;
        parser.expect_end()?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a context tree.
    pub fn eval(&self, root: &serde_json::Value) -> Value {
        eval_expr(&self.ast, root)
    }

    /// Evaluate and reduce to a boolean via truthiness.
    pub fn eval_bool(&self, root: &serde_json::Value) -> bool {
        self.eval(root).truthy()
    }
}

/// Syntax-only validation used by the manifest validator.
pub fn check_syntax(source: &str) -> Result<()> {
    Program::compile(source).map(|_| ())
}

const CACHE_CAPACITY: usize = 256;

fn cache() -> &'static Mutex<HashMap<String, Arc<Program>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<Program>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Compile with a process-wide cache keyed by source text. The cache is
/// bounded; at capacity it is flushed whole, since recompilation is cheap.
pub fn compile_cached(source: &str) -> Result<Arc<Program>> {
    let mut guard = cache().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(program) = guard.get(source) {
        return Ok(Arc::clone(program));
    }
    let program = Arc::new(Program::compile(source)?);
    if guard.len() >= CACHE_CAPACITY {
        guard.clear();
    }
    guard.insert(source.to_string(), Arc::clone(&program));
    Ok(program)
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Not,
    AndAnd,
    OrOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => s.clone(),
            Self::Str(s) => format!("'{s}'"),
            Self::Num(n) => n.to_string(),
            Self::LParen => "(".into(),
            Self::RParen => ")".into(),
            Self::LBracket => "[".into(),
            Self::RBracket => "]".into(),
            Self::Comma => ",".into(),
            Self::Not => "!".into(),
            Self::AndAnd => "&&".into(),
            Self::OrOr => "||".into(),
            Self::Eq => "==".into(),
            Self::Ne => "!=".into(),
            Self::Lt => "<".into(),
            Self::Le => "<=".into(),
            Self::Gt => ">".into(),
            Self::Ge => ">=".into(),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString(source.to_string())),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&next) => literal.push(next),
                                None => {
                                    return Err(ExprError::UnterminatedString(source.to_string()))
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if !matches!(chars.get(i), Some('0'..='9')) {
                        return Err(ExprError::UnexpectedChar {
                            ch: c,
                            offset: start,
                            src: source.to_string(),
                        });
                    }
                }
                while matches!(chars.get(i), Some('0'..='9')) {
                    i += 1;
                }
                if chars.get(i) == Some(&'.') && matches!(chars.get(i + 1), Some('0'..='9')) {
                    i += 1;
                    while matches!(chars.get(i), Some('0'..='9')) {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| ExprError::UnexpectedChar {
                    ch: c,
                    offset: start,
                    src: source.to_string(),
                })?;
                tokens.push(Token::Num(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while matches!(
                    chars.get(i),
                    Some(ch) if ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '.'
                ) {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ExprError::UnexpectedChar {
                    ch: other,
                    offset: i,
                    src: source.to_string(),
                })
            }
        }
    }
    Ok(tokens)
}

// --- Parser ---

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ExprError::UnexpectedEnd(self.source.to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken {
                token: token.describe(),
                src: self.source.to_string(),
            })
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken {
                token: token.describe(),
                src: self.source.to_string(),
            }),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_unary()?;

        let is_in = matches!(self.peek(), Some(Token::Ident(name)) if name == "in");
        if is_in {
            self.pos += 1;
            let list = self.parse_unary()?;
            return Ok(Expr::In {
                needle: Box::new(lhs),
                list: Box::new(list),
            });
        }

        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_unary()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.next()?;
        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Num(n) => Ok(Expr::Literal(Value::Num(n))),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    match self.next()? {
                        Token::Comma => {}
                        Token::RBracket => break,
                        other => {
                            return Err(ExprError::UnexpectedToken {
                                token: other.describe(),
                                src: self.source.to_string(),
                            })
                        }
                    }
                }
                Ok(Expr::List(items))
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    self.parse_call(name)
                }
                _ => Ok(Expr::Path(name)),
            },
            other => Err(ExprError::UnexpectedToken {
                token: other.describe(),
                src: self.source.to_string(),
            }),
        }
    }

    fn parse_call(&mut self, func: String) -> Result<Expr> {
        match func.as_str() {
            "has" => {
                let token = self.next()?;
                let Token::Ident(path) = token else {
                    return Err(ExprError::UnexpectedToken {
                        token: token.describe(),
                        src: self.source.to_string(),
                    });
                };
                self.expect(&Token::RParen)?;
                Ok(Expr::Call {
                    func,
                    args: vec![CallArg::Path(path)],
                })
            }
            "semver.major" | "semver.minor" | "semver.patch" => {
                let arg = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Call {
                    func,
                    args: vec![CallArg::Expr(Box::new(arg))],
                })
            }
            other => Err(ExprError::UnknownFunction(other.to_string())),
        }
    }
}

// --- Evaluator ---

fn eval_expr(expr: &Expr, root: &serde_json::Value) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(path) => resolve_path(path, root),
        Expr::List(items) => Value::List(items.iter().map(|e| eval_expr(e, root)).collect()),
        Expr::Not(inner) => Value::Bool(!eval_expr(inner, root).truthy()),
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::And => {
                Value::Bool(eval_expr(lhs, root).truthy() && eval_expr(rhs, root).truthy())
            }
            BinOp::Or => {
                Value::Bool(eval_expr(lhs, root).truthy() || eval_expr(rhs, root).truthy())
            }
            _ => {
                let a = eval_expr(lhs, root);
                let b = eval_expr(rhs, root);
                Value::Bool(compare(*op, &a, &b))
            }
        },
        Expr::In { needle, list } => {
            let needle = eval_expr(needle, root);
            let Value::List(items) = eval_expr(list, root) else {
                return Value::Bool(false);
            };
            Value::Bool(items.iter().any(|item| values_equal(item, &needle)))
        }
        Expr::Call { func, args } => eval_call(func, args, root),
    }
}

/// Comparisons against an absent operand are false, both ways.
fn compare(op: BinOp, a: &Value, b: &Value) -> bool {
    if matches!(a, Value::Absent) || matches!(b, Value::Absent) {
        return false;
    }
    match op {
        BinOp::Eq => values_equal(a, b),
        BinOp::Ne => !values_equal(a, b),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => match (a, b) {
            (Value::Num(x), Value::Num(y)) => match op {
                BinOp::Lt => x < y,
                BinOp::Le => x <= y,
                BinOp::Gt => x > y,
                BinOp::Ge => x >= y,
                _ => unreachable!(),
            },
            (Value::Str(x), Value::Str(y)) => match op {
                BinOp::Lt => x < y,
                BinOp::Le => x <= y,
                BinOp::Gt => x > y,
                BinOp::Ge => x >= y,
                _ => unreachable!(),
            },
            _ => false,
        },
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => false,
    }
}

fn eval_call(func: &str, args: &[CallArg], root: &serde_json::Value) -> Value {
    match func {
        "has" => match args.first() {
            Some(CallArg::Path(path)) => {
                Value::Bool(!matches!(resolve_path(path, root), Value::Absent))
            }
            _ => Value::Bool(false),
        },
        "semver.major" | "semver.minor" | "semver.patch" => {
            let Some(CallArg::Expr(arg)) = args.first() else {
                return Value::Absent;
            };
            let Value::Str(raw) = eval_expr(arg, root) else {
                return Value::Absent;
            };
            match Version::parse(&raw) {
                Ok(version) => {
                    let part = match func {
                        "semver.major" => version.major,
                        "semver.minor" => version.minor,
                        _ => version.patch,
                    };
                    Value::Num(part as f64)
                }
                Err(_) => Value::Absent,
            }
        }
        _ => Value::Absent,
    }
}

/// Walk a dot-path through the context. A bare path that misses at the root
/// is retried under `event`, so filters can say `payload.environment`
/// instead of `event.payload.environment`.
fn resolve_path(path: &str, root: &serde_json::Value) -> Value {
    if let Some(value) = walk(path, root) {
        return Value::from_json(value);
    }
    if !path.starts_with("event.") {
        if let Some(event) = root.get("event") {
            if let Some(value) = walk(path, event) {
                return Value::from_json(value);
            }
        }
    }
    Value::Absent
}

fn walk<'a>(path: &str, root: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_ctx() -> serde_json::Value {
        json!({
            "event": {
                "type": "library_built",
                "schema_version": "1.1.0",
                "payload": {
                    "environment": "prod",
                    "version": "2.3.4",
                    "count": 7
                }
            },
            "subscription": { "workflow": "deploy" }
        })
    }

    #[test]
    fn equality_on_payload_field() {
        let program = Program::compile("payload.environment == 'prod'").unwrap();
        assert!(program.eval_bool(&event_ctx()));

        let program = Program::compile("payload.environment == 'dev'").unwrap();
        assert!(!program.eval_bool(&event_ctx()));
    }

    #[test]
    fn explicit_event_prefix_also_resolves() {
        let program = Program::compile("event.payload.environment == 'prod'").unwrap();
        assert!(program.eval_bool(&event_ctx()));
    }

    #[test]
    fn logical_operators_and_grouping() {
        let program = Program::compile(
            "(payload.environment == 'prod' || payload.environment == 'staging') && payload.count >= 5",
        )
        .unwrap();
        assert!(program.eval_bool(&event_ctx()));

        let program = Program::compile("!(payload.count > 5)").unwrap();
        assert!(!program.eval_bool(&event_ctx()));
    }

    #[test]
    fn in_operator_over_string_list() {
        let program = Program::compile("payload.environment in ['dev', 'prod']").unwrap();
        assert!(program.eval_bool(&event_ctx()));

        let program = Program::compile("payload.environment in ['dev', 'staging']").unwrap();
        assert!(!program.eval_bool(&event_ctx()));
    }

    #[test]
    fn has_reports_presence() {
        assert!(Program::compile("has(payload.environment)")
            .unwrap()
            .eval_bool(&event_ctx()));
        assert!(!Program::compile("has(payload.missing)")
            .unwrap()
            .eval_bool(&event_ctx()));
    }

    #[test]
    fn absent_paths_are_falsy_and_never_equal() {
        let ctx = event_ctx();
        assert!(!Program::compile("payload.missing").unwrap().eval_bool(&ctx));
        assert!(!Program::compile("payload.missing == 'x'")
            .unwrap()
            .eval_bool(&ctx));
        assert!(!Program::compile("payload.missing != 'x'")
            .unwrap()
            .eval_bool(&ctx));
    }

    #[test]
    fn semver_builtins_extract_parts() {
        let ctx = event_ctx();
        assert!(Program::compile("semver.major(payload.version) == 2")
            .unwrap()
            .eval_bool(&ctx));
        assert!(Program::compile("semver.minor(payload.version) == 3")
            .unwrap()
            .eval_bool(&ctx));
        assert!(Program::compile("semver.patch(payload.version) == 4")
            .unwrap()
            .eval_bool(&ctx));
        assert!(Program::compile("semver.major(event.schema_version) == 1")
            .unwrap()
            .eval_bool(&ctx));
    }

    #[test]
    fn numeric_ordering() {
        let ctx = event_ctx();
        assert!(Program::compile("payload.count > 5").unwrap().eval_bool(&ctx));
        assert!(Program::compile("payload.count <= 7").unwrap().eval_bool(&ctx));
        assert!(!Program::compile("payload.count < 7").unwrap().eval_bool(&ctx));
    }

    #[test]
    fn parse_errors() {
        assert!(Program::compile("payload.environment ==").is_err());
        assert!(Program::compile("(a == 'b'").is_err());
        assert!(Program::compile("a == 'b' extra").is_err());
        assert!(Program::compile("a @ b").is_err());
        assert!(Program::compile("'unterminated").is_err());
        assert!(Program::compile("unknown_fn(a)").is_err());
    }

    #[test]
    fn cached_compile_returns_same_program() {
        let a = compile_cached("payload.count > 1").unwrap();
        let b = compile_cached("payload.count > 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn boolean_literals() {
        let ctx = event_ctx();
        assert!(Program::compile("true").unwrap().eval_bool(&ctx));
        assert!(!Program::compile("false").unwrap().eval_bool(&ctx));
        assert!(Program::compile("true && payload.count == 7")
            .unwrap()
            .eval_bool(&ctx));
    }
}

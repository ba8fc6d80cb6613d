//! `${...}` expressions used by conditions and listener descriptors
//!
//! The language is deliberately small: property paths, literals, comparison,
//! boolean connectives and zero-argument calls of function beans. Identifiers
//! resolve against the variables visible from the current execution first and
//! the delegate catalog second.

use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

use super::error::{EngineError, Result};
use super::listener::{Delegate, DelegateExecution};

/// Result of evaluating an expression
#[derive(Debug, Clone)]
pub enum Resolved {
    /// Plain value
    Value(Value),
    /// Delegate bean the expression named
    Delegate(Delegate),
}

impl Resolved {
    /// Truthiness: `false` and `null` are false, everything else is true
    pub fn is_truthy(&self) -> bool {
        match self {
            Resolved::Value(Value::Bool(b)) => *b,
            Resolved::Value(Value::Null) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Path(Vec<String>),
    Call(Vec<String>),
    Not(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
}

/// Parsed `${...}` expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expression {
    /// Parse `${...}` (or `#{...}`) source text
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        let body = trimmed
            .strip_prefix("${")
            .or_else(|| trimmed.strip_prefix("#{"))
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| invalid(source, "expected ${...}"))?;

        let mut parser = Parser::new(source, body);
        let root = parser.parse_or()?;
        parser.skip_ws();
        if !parser.eof() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an execution
    pub fn evaluate(&self, execution: &mut DelegateExecution<'_>) -> Result<Resolved> {
        self.eval_node(&self.root, execution)
    }

    /// Evaluate and reduce to a boolean
    pub fn evaluate_condition(&self, execution: &mut DelegateExecution<'_>) -> Result<bool> {
        Ok(self.evaluate(execution)?.is_truthy())
    }

    fn eval_node(&self, node: &Node, execution: &mut DelegateExecution<'_>) -> Result<Resolved> {
        match node {
            Node::Literal(value) => Ok(Resolved::Value(value.clone())),
            Node::Path(path) => self.resolve_path(path, execution),
            Node::Call(path) => match self.resolve_path(path, execution)? {
                Resolved::Delegate(Delegate::Function(function)) => function(&mut *execution)
                    .map(Resolved::Value)
                    .map_err(|source| EngineError::ListenerInvocation {
                        listener: format!("expression:{}", self.source),
                        event: execution.event_name().to_string(),
                        source,
                    }),
                other => Err(invalid(
                    &self.source,
                    &format!("'{}' is not callable ({})", path.join("."), describe(&other)),
                )),
            },
            Node::Not(inner) => {
                let value = self.eval_node(inner, execution)?;
                Ok(Resolved::Value(Value::Bool(!value.is_truthy())))
            }
            Node::Binary(BinaryOp::And, lhs, rhs) => {
                if !self.eval_node(lhs, execution)?.is_truthy() {
                    return Ok(Resolved::Value(Value::Bool(false)));
                }
                let rhs = self.eval_node(rhs, execution)?.is_truthy();
                Ok(Resolved::Value(Value::Bool(rhs)))
            }
            Node::Binary(BinaryOp::Or, lhs, rhs) => {
                if self.eval_node(lhs, execution)?.is_truthy() {
                    return Ok(Resolved::Value(Value::Bool(true)));
                }
                let rhs = self.eval_node(rhs, execution)?.is_truthy();
                Ok(Resolved::Value(Value::Bool(rhs)))
            }
            Node::Binary(op, lhs, rhs) => {
                let lhs = self.value_of(lhs, execution)?;
                let rhs = self.value_of(rhs, execution)?;
                self.compare(*op, &lhs, &rhs).map(|b| Resolved::Value(Value::Bool(b)))
            }
        }
    }

    fn value_of(&self, node: &Node, execution: &mut DelegateExecution<'_>) -> Result<Value> {
        match self.eval_node(node, execution)? {
            Resolved::Value(value) => Ok(value),
            other => Err(invalid(
                &self.source,
                &format!("cannot compare a {}", describe(&other)),
            )),
        }
    }

    fn resolve_path(&self, path: &[String], execution: &DelegateExecution<'_>) -> Result<Resolved> {
        let Some((head, rest)) = path.split_first() else {
            return Err(invalid(&self.source, "empty property path"));
        };

        let root = match execution.variable(head) {
            Some(value) => Resolved::Value(value),
            None => match execution.engine.catalog.bean(head) {
                Some(Delegate::Value(value)) => Resolved::Value(value),
                Some(delegate) => Resolved::Delegate(delegate),
                None => {
                    return Err(invalid(
                        &self.source,
                        &format!("unknown property '{}'", head),
                    ));
                }
            },
        };

        if rest.is_empty() {
            return Ok(root);
        }
        let Resolved::Value(mut value) = root else {
            return Err(invalid(
                &self.source,
                &format!("'{}' has no properties", head),
            ));
        };
        for segment in rest {
            value = value.get(segment).cloned().unwrap_or(Value::Null);
        }
        Ok(Resolved::Value(value))
    }

    fn compare(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<bool> {
        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let equal = match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) if lhs.is_number() && rhs.is_number() => a == b,
                _ => lhs == rhs,
            };
            return Ok(if op == BinaryOp::Eq { equal } else { !equal });
        }

        let ordering = match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(a, b)| a.partial_cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
        .ok_or_else(|| {
            invalid(
                &self.source,
                &format!("cannot apply '{}' to {} and {}", op.symbol(), lhs, rhs),
            )
        })?;

        Ok(match op {
            BinaryOp::Lt => ordering == Ordering::Less,
            BinaryOp::Le => ordering != Ordering::Greater,
            BinaryOp::Gt => ordering == Ordering::Greater,
            BinaryOp::Ge => ordering != Ordering::Less,
            _ => false,
        })
    }
}

fn describe(resolved: &Resolved) -> String {
    match resolved {
        Resolved::Value(value) => format!("value {}", value),
        Resolved::Delegate(delegate) => delegate.kind().to_string(),
    }
}

fn invalid(expression: &str, detail: &str) -> EngineError {
    EngineError::InvalidExpression {
        expression: expression.to_string(),
        detail: detail.to_string(),
    }
}

struct Parser<'a> {
    source: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, body: &'a str) -> Self {
        Self {
            source,
            bytes: body.as_bytes(),
            index: 0,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn skip_ws(&mut self) {
        while self.current().is_some_and(|ch| ch.is_ascii_whitespace()) {
            self.advance();
        }
    }

    fn error(&self, message: &str) -> EngineError {
        invalid(self.source, &format!("{} at offset {}", message, self.index))
    }

    fn eat(&mut self, token: &[u8]) -> bool {
        self.skip_ws();
        if self.bytes[self.index..].starts_with(token) {
            self.index += token.len();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut lhs = self.parse_and()?;
        while self.eat(b"||") {
            let rhs = self.parse_and()?;
            lhs = Node::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(b"&&") {
            let rhs = self.parse_comparison()?;
            lhs = Node::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Node> {
        let lhs = self.parse_unary()?;
        self.skip_ws();
        let op = match (self.current(), self.peek(1)) {
            (Some(b'='), Some(b'=')) => BinaryOp::Eq,
            (Some(b'!'), Some(b'=')) => BinaryOp::Ne,
            (Some(b'<'), Some(b'=')) => BinaryOp::Le,
            (Some(b'>'), Some(b'=')) => BinaryOp::Ge,
            (Some(b'<'), _) => BinaryOp::Lt,
            (Some(b'>'), _) => BinaryOp::Gt,
            _ => return Ok(lhs),
        };
        let width = if matches!(op, BinaryOp::Lt | BinaryOp::Gt) { 1 } else { 2 };
        self.index += width;
        let rhs = self.parse_unary()?;
        Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_unary(&mut self) -> Result<Node> {
        self.skip_ws();
        if self.current() == Some(b'!') && self.peek(1) != Some(b'=') {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node> {
        self.skip_ws();
        match self.current() {
            None => Err(self.error("unexpected end of expression")),
            Some(b'(') => {
                self.advance();
                let inner = self.parse_or()?;
                if !self.eat(b")") {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(b'"') | Some(b'\'') => self.parse_string(),
            Some(b'-') | Some(b'0'..=b'9') => self.parse_number(),
            Some(ch) if ch.is_ascii_alphabetic() || ch == b'_' => self.parse_path(),
            Some(ch) => Err(self.error(&format!("unexpected character '{}'", ch as char))),
        }
    }

    fn parse_string(&mut self) -> Result<Node> {
        let Some(quote) = self.current() else {
            return Err(self.error("expected string"));
        };
        self.advance();
        let mut buf = Vec::new();
        while let Some(ch) = self.current() {
            self.advance();
            match ch {
                b'\\' => {
                    let Some(escaped) = self.current() else {
                        break;
                    };
                    self.advance();
                    buf.push(escaped);
                }
                _ if ch == quote => {
                    let text = String::from_utf8(buf)
                        .map_err(|_| self.error("string literal is not valid UTF-8"))?;
                    return Ok(Node::Literal(Value::String(text)));
                }
                _ => buf.push(ch),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_number(&mut self) -> Result<Node> {
        let start = self.index;
        if self.current() == Some(b'-') {
            self.advance();
        }
        while self.current().is_some_and(|ch| ch.is_ascii_digit() || ch == b'.') {
            self.advance();
        }
        let text = std::str::from_utf8(&self.bytes[start..self.index])
            .map_err(|_| self.error("invalid number"))?;
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Node::Literal(Value::Number(int.into())));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(|number| Node::Literal(Value::Number(number)))
            .ok_or_else(|| self.error(&format!("invalid number '{}'", text)))
    }

    fn parse_identifier(&mut self) -> Result<String> {
        self.skip_ws();
        let start = self.index;
        while self
            .current()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == b'_')
        {
            self.advance();
        }
        if start == self.index {
            return Err(self.error("expected identifier"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.index]).into_owned())
    }

    fn parse_path(&mut self) -> Result<Node> {
        let head = self.parse_identifier()?;
        match head.as_str() {
            "true" => return Ok(Node::Literal(Value::Bool(true))),
            "false" => return Ok(Node::Literal(Value::Bool(false))),
            "null" => return Ok(Node::Literal(Value::Null)),
            _ => {}
        }
        let mut path = vec![head];
        while self.current() == Some(b'.') {
            self.advance();
            path.push(self.parse_identifier()?);
        }
        self.skip_ws();
        if self.current() == Some(b'(') {
            self.advance();
            if !self.eat(b")") {
                return Err(self.error("only zero-argument calls are supported"));
            }
            return Ok(Node::Call(path));
        }
        Ok(Node::Path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precedence() {
        let expr = Expression::parse("${a > 1 && !done || flag}").unwrap();
        let Node::Binary(BinaryOp::Or, lhs, rhs) = &expr.root else {
            panic!("expected ||, got {:?}", expr.root);
        };
        assert!(matches!(lhs.as_ref(), Node::Binary(BinaryOp::And, _, _)));
        assert_eq!(rhs.as_ref(), &Node::Path(vec!["flag".to_string()]));
    }

    #[test]
    fn test_parse_literals_and_calls() {
        let expr = Expression::parse("#{ order.total >= -2.5 }").unwrap();
        let Node::Binary(BinaryOp::Ge, lhs, rhs) = &expr.root else {
            panic!("expected >=");
        };
        assert_eq!(
            lhs.as_ref(),
            &Node::Path(vec!["order".to_string(), "total".to_string()])
        );
        assert!(matches!(rhs.as_ref(), Node::Literal(Value::Number(_))));

        let call = Expression::parse("${audit.record()}").unwrap();
        assert!(matches!(call.root, Node::Call(ref path) if path.len() == 2));

        let string = Expression::parse("${status == 'done'}").unwrap();
        assert!(matches!(string.root, Node::Binary(BinaryOp::Eq, _, _)));
    }

    #[test]
    fn test_parse_errors() {
        for source in ["amount > 1", "${amount >}", "${(a}", "${a b}", "${f(x)}", "${'open}"] {
            assert!(
                matches!(
                    Expression::parse(source),
                    Err(EngineError::InvalidExpression { .. })
                ),
                "{} should not parse",
                source
            );
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(!Resolved::Value(Value::Null).is_truthy());
        assert!(!Resolved::Value(Value::Bool(false)).is_truthy());
        assert!(Resolved::Value(Value::from(0)).is_truthy());
        assert!(Resolved::Delegate(Delegate::Value(Value::Null)).is_truthy());
    }
}

//! Guard and branch expressions.
//!
//! Expressions are `operand [op operand]`. An operand is a dotted name, a
//! number, a quoted string, `true`, `false` or `null`; `op` is one of
//! `== != > < >= <=`. Names starting with `context.` or `result.` address that
//! scope; bare names are looked up in the result first, then the context.
//! A lone operand is tested for truthiness.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Empty expression")]
    Empty,

    #[error("Unexpected token {token:?} at {position} in {expression:?}")]
    UnexpectedToken {
        expression: String,
        token: String,
        position: usize,
    },

    #[error("Unterminated string in {0:?}")]
    UnterminatedString(String),

    #[error("Cannot order {left} and {right}")]
    Incomparable { left: String, right: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Name(String),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Operand(Operand),
    Op(Op),
}

/// A parsed expression
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    left: Operand,
    comparison: Option<(Op, Operand)>,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(expression)?;
        let unexpected = |(position, token): &(usize, Token)| ConditionError::UnexpectedToken {
            expression: expression.to_string(),
            token: format!("{:?}", token),
            position: *position,
        };

        let mut iter = tokens.into_iter();
        let left = match iter.next() {
            None => return Err(ConditionError::Empty),
            Some((_, Token::Operand(operand))) => operand,
            Some(other) => return Err(unexpected(&other)),
        };

        let comparison = match iter.next() {
            None => None,
            Some((_, Token::Op(op))) => match iter.next() {
                Some((_, Token::Operand(right))) => Some((op, right)),
                Some(other) => return Err(unexpected(&other)),
                None => {
                    return Err(ConditionError::UnexpectedToken {
                        expression: expression.to_string(),
                        token: "end of input".to_string(),
                        position: expression.len(),
                    })
                }
            },
            Some(other) => return Err(unexpected(&other)),
        };

        if let Some(extra) = iter.next() {
            return Err(unexpected(&extra));
        }
        Ok(Self { left, comparison })
    }

    /// Evaluate against a scope of the form `{"context": ..., "result": ...}`
    pub fn evaluate(&self, scope: &Value) -> Result<bool, ConditionError> {
        let left = resolve(&self.left, scope);
        let Some((op, right)) = &self.comparison else {
            return Ok(truthy(&left));
        };
        let right = resolve(right, scope);

        match op {
            Op::Eq => Ok(loose_eq(&left, &right)),
            Op::Ne => Ok(!loose_eq(&left, &right)),
            Op::Gt => Ok(order(&left, &right)? == Ordering::Greater),
            Op::Lt => Ok(order(&left, &right)? == Ordering::Less),
            Op::Ge => Ok(order(&left, &right)? != Ordering::Less),
            Op::Le => Ok(order(&left, &right)? != Ordering::Greater),
        }
    }
}

/// Parse and evaluate in one call
pub fn evaluate(expression: &str, scope: &Value) -> Result<bool, ConditionError> {
    Condition::parse(expression)?.evaluate(scope)
}

fn tokenize(expression: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let end = chars[i + 1..]
                .iter()
                .position(|&ch| ch == c)
                .ok_or_else(|| ConditionError::UnterminatedString(expression.to_string()))?;
            let text: String = chars[i + 1..i + 1 + end].iter().collect();
            tokens.push((start, Token::Operand(Operand::Literal(Value::String(text)))));
            i += end + 2;
            continue;
        }

        let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let op = match two.as_str() {
            "==" => Some((Op::Eq, 2)),
            "!=" => Some((Op::Ne, 2)),
            ">=" => Some((Op::Ge, 2)),
            "<=" => Some((Op::Le, 2)),
            _ if c == '>' => Some((Op::Gt, 1)),
            _ if c == '<' => Some((Op::Lt, 1)),
            _ => None,
        };
        if let Some((op, width)) = op {
            tokens.push((start, Token::Op(op)));
            i += width;
            continue;
        }

        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let number = text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .ok_or_else(|| ConditionError::UnexpectedToken {
                    expression: expression.to_string(),
                    token: text.clone(),
                    position: start,
                })?;
            tokens.push((start, Token::Operand(Operand::Literal(Value::Number(number)))));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '-')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let operand = match word.as_str() {
                "true" => Operand::Literal(Value::Bool(true)),
                "false" => Operand::Literal(Value::Bool(false)),
                "null" => Operand::Literal(Value::Null),
                _ => Operand::Name(word),
            };
            tokens.push((start, Token::Operand(operand)));
            continue;
        }

        return Err(ConditionError::UnexpectedToken {
            expression: expression.to_string(),
            token: c.to_string(),
            position: start,
        });
    }

    Ok(tokens)
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn resolve(operand: &Operand, scope: &Value) -> Value {
    match operand {
        Operand::Literal(value) => value.clone(),
        Operand::Name(name) => {
            let found = match name.split_once('.') {
                Some(("context", rest)) => scope.get("context").and_then(|c| lookup(c, rest)),
                Some(("result", rest)) => scope.get("result").and_then(|r| lookup(r, rest)),
                _ if name == "context" || name == "result" => scope.get(name.as_str()),
                _ => scope
                    .get("result")
                    .and_then(|r| lookup(r, name))
                    .or_else(|| scope.get("context").and_then(|c| lookup(c, name))),
            };
            found.cloned().unwrap_or(Value::Null)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Result<Ordering, ConditionError> {
    let ordering = match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64().zip(r.as_f64()).and_then(|(l, r)| l.partial_cmp(&r)),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    };
    ordering.ok_or_else(|| ConditionError::Incomparable {
        left: left.to_string(),
        right: right.to_string(),
    })
}

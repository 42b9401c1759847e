//! Pure interpreter over [`Expr`] trees.
//!
//! Evaluation never performs I/O and never mutates its environment, so the
//! same expression and environment always produce the same value.

use serde_json::{Number, Value};
use std::cmp::Ordering;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::ExpressionError;
use crate::constants::OUTCOME_VARIABLE;
use crate::models::Variables;

/// Root segment that addresses the business-data document
pub const BUSINESS_ROOT: &str = "business";
/// Root segment that addresses process variables explicitly
pub const VARIABLES_ROOT: &str = "variables";

/// Read-only inputs a condition is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct Environment<'a> {
    pub variables: &'a Variables,
    pub business_data: &'a Value,
    /// Outcome of the node being routed, visible as `outcome`
    pub outcome: Option<&'a str>,
}

impl<'a> Environment<'a> {
    pub fn new(variables: &'a Variables, business_data: &'a Value) -> Self {
        Self {
            variables,
            business_data,
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: Option<&'a str>) -> Self {
        self.outcome = outcome;
        self
    }

    /// Resolve a dotted path; unknown paths resolve to `null`. Only the
    /// value found is cloned.
    fn resolve(&self, segments: &[String]) -> Value {
        let Some((root, rest)) = segments.split_first() else {
            return Value::Null;
        };
        if root.as_str() == OUTCOME_VARIABLE && rest.is_empty() {
            if let Some(outcome) = self.outcome {
                return Value::String(outcome.to_string());
            }
        }

        let (base, rest) = match root.as_str() {
            BUSINESS_ROOT => (Some(self.business_data), rest),
            VARIABLES_ROOT if !rest.is_empty() => (self.variables.get(&rest[0]), &rest[1..]),
            name => (self.variables.get(name), rest),
        };

        let mut current = match base {
            Some(value) => value,
            None => return Value::Null,
        };
        for segment in rest {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
                _ => None,
            };
            current = match next {
                Some(value) => value,
                None => return Value::Null,
            };
        }
        current.clone()
    }
}

/// Evaluate an expression to a JSON value
pub fn evaluate(expr: &Expr, env: &Environment<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Path(segments) => Ok(env.resolve(segments)),
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value)?)),
                UnaryOp::Neg => match value {
                    Value::Number(n) => match n.as_i64().and_then(i64::checked_neg) {
                        Some(negated) if !n.is_f64() => Ok(Value::Number(negated.into())),
                        _ => number(-as_f64(&n)),
                    },
                    other => Err(type_mismatch("-", &other, &Value::Null)),
                },
            }
        }
        Expr::Binary { op, left, right } => match op {
            // Short-circuit
            BinaryOp::And => {
                if !truthy(&evaluate(left, env)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&evaluate(right, env)?)?))
            }
            BinaryOp::Or => {
                if truthy(&evaluate(left, env)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&evaluate(right, env)?)?))
            }
            _ => {
                let left = evaluate(left, env)?;
                let right = evaluate(right, env)?;
                apply_binary(*op, &left, &right)
            }
        },
    }
}

/// Evaluate an expression that must produce a boolean
pub fn evaluate_condition(expr: &Expr, env: &Environment<'_>) -> Result<bool, ExpressionError> {
    truthy(&evaluate(expr, env)?)
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            // Missing values never satisfy an ordering comparison
            if left.is_null() || right.is_null() {
                return Ok(Value::Bool(false));
            }
            let ordering = compare(left, right)
                .ok_or_else(|| type_mismatch(op.symbol(), left, right))?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::In => match right {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| values_equal(left, item)))),
            Value::String(haystack) => match left {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                _ => Err(type_mismatch("in", left, right)),
            },
            Value::Object(map) => match left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(type_mismatch("in", left, right)),
            },
            Value::Null => Ok(Value::Bool(false)),
            _ => Err(type_mismatch("in", left, right)),
        },
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => match integer_op(i64::checked_add, a, b) {
                Some(sum) => Ok(sum),
                None => number(as_f64(a) + as_f64(b)),
            },
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Err(type_mismatch("+", left, right)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Value::Number(a), Value::Number(b)) = (left, right) else {
                return Err(type_mismatch(op.symbol(), left, right));
            };
            let exact = match op {
                BinaryOp::Sub => integer_op(i64::checked_sub, a, b),
                BinaryOp::Mul => integer_op(i64::checked_mul, a, b),
                BinaryOp::Rem => integer_op(i64::checked_rem, a, b),
                _ => None,
            };
            if let Some(value) = exact {
                return Ok(value);
            }
            let (a, b) = (as_f64(a), as_f64(b));
            match op {
                BinaryOp::Sub => number(a - b),
                BinaryOp::Mul => number(a * b),
                _ if b == 0.0 => Err(ExpressionError::DivisionByZero),
                BinaryOp::Div => number(a / b),
                _ => number(a % b),
            }
        }
        BinaryOp::And => Ok(Value::Bool(truthy(left)? && truthy(right)?)),
        BinaryOp::Or => Ok(Value::Bool(truthy(left)? || truthy(right)?)),
    }
}

fn truthy(value: &Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        // A missing flag reads as false
        Value::Null => Ok(false),
        other => Err(ExpressionError::NotBoolean(other.to_string())),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b) == Some(Ordering::Equal),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Integers compare exactly; anything involving a float compares as `f64`
fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if a.is_f64() || b.is_f64() {
        return as_f64(a).partial_cmp(&as_f64(b));
    }
    match (a.as_i64(), b.as_i64()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        // The other side is above i64::MAX
        (Some(_), None) => Some(Ordering::Less),
        (None, Some(_)) => Some(Ordering::Greater),
        (None, None) => Some(a.as_u64()?.cmp(&b.as_u64()?)),
    }
}

/// Exact integer arithmetic when both sides are `i64` and the result fits
fn integer_op(op: fn(i64, i64) -> Option<i64>, a: &Number, b: &Number) -> Option<Value> {
    if a.is_f64() || b.is_f64() {
        return None;
    }
    op(a.as_i64()?, b.as_i64()?).map(|value| Value::Number(value.into()))
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

/// Integral results stay integers so `==` against integer literals and
/// JSON output look the way callers wrote them
fn number(value: f64) -> Result<Value, ExpressionError> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        return Ok(Value::Number((value as i64).into()));
    }
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or(ExpressionError::NonFiniteNumber)
}

fn type_mismatch(op: &str, left: &Value, right: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch {
        op: op.to_string(),
        left: type_name(left).to_string(),
        right: type_name(right).to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

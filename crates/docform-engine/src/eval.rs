//! Formula evaluation.
//!
//! Evaluation is a pure function of the expression and the values the resolver hands out: there
//! is no hidden state, so evaluating the same formula against the same values always yields the
//! same result or the same error.

use chrono::{Duration, NaiveDate};
use docform_model::{FieldId, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::ast::{BinaryOp, Expr, Formula, UnaryOp};
use crate::functions::{call_function, coerce_number};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("cannot apply `{op}` to {found}")]
    TypeMismatch { op: &'static str, found: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("`{op}` produced a non-finite number")]
    NonFinite { op: &'static str },
    #[error("invalid argument to `{function}`: {message}")]
    InvalidArgument {
        function: &'static str,
        message: String,
    },
}

impl FormulaError {
    pub(crate) fn type_mismatch<'v>(
        op: &'static str,
        operands: impl IntoIterator<Item = &'v Value>,
    ) -> Self {
        let found = operands
            .into_iter()
            .map(Value::type_name)
            .collect::<Vec<_>>()
            .join(" and ");
        FormulaError::TypeMismatch { op, found }
    }
}

/// Source of field values for evaluation.
///
/// Fields the resolver does not know are treated as `Null`, so a formula that references a field
/// nobody filled in yet degrades to `Null` instead of failing.
pub trait ValueResolver {
    fn get_field_value(&self, field: &FieldId) -> Option<Value>;
}

impl ValueResolver for HashMap<FieldId, Value> {
    fn get_field_value(&self, field: &FieldId) -> Option<Value> {
        self.get(field).cloned()
    }
}

impl ValueResolver for BTreeMap<FieldId, Value> {
    fn get_field_value(&self, field: &FieldId) -> Option<Value> {
        self.get(field).cloned()
    }
}

pub struct Evaluator<'a, R: ValueResolver + ?Sized> {
    resolver: &'a R,
}

impl<'a, R: ValueResolver + ?Sized> Evaluator<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    pub fn eval_formula(&self, formula: &Formula) -> Result<Value, FormulaError> {
        self.eval(formula.expr())
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, FormulaError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(id) => Ok(self.resolver.get_field_value(id).unwrap_or(Value::Null)),
            Expr::Unary { op, expr } => {
                let v = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                    UnaryOp::Plus | UnaryOp::Neg => {
                        if v.is_null() {
                            return Ok(Value::Null);
                        }
                        let n = coerce_number(op.as_str(), &v)?;
                        Ok(Value::Number(if *op == UnaryOp::Neg { -n } else { n }))
                    }
                }
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = self.eval(left)?;
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(truthy(&self.eval(right)?)))
                }
                BinaryOp::Or => {
                    let l = self.eval(left)?;
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(truthy(&self.eval(right)?)))
                }
                _ => {
                    let l = self.eval(left)?;
                    let r = self.eval(right)?;
                    binary(*op, &l, &r)
                }
            },
            Expr::Call { function, args } => call_function(self, *function, args),
        }
    }
}

/// Evaluates `formula` against `resolver`.
pub fn evaluate<R: ValueResolver + ?Sized>(
    formula: &Formula,
    resolver: &R,
) -> Result<Value, FormulaError> {
    Evaluator::new(resolver).eval_formula(formula)
}

/// Truthiness used by `if_else`, `not`, `and` and `or`.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0,
        Value::Text(s) => !s.is_empty(),
        Value::Date(_) => true,
        Value::List(items) => !items.is_empty(),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, FormulaError> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, l, r),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = compare(op, l, r)?;
            let out = match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(Value::Bool(out))
        }
        // Short-circuiting operators are handled by the evaluator.
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(truthy(l) && truthy(r))),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, FormulaError> {
    let sym = op.as_str();
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }

    match (op, l, r) {
        (BinaryOp::Add, Value::Date(d), other) | (BinaryOp::Add, other, Value::Date(d))
            if !matches!(other, Value::Date(_)) =>
        {
            let days = coerce_number(sym, other)?;
            return shift_date(sym, *d, days);
        }
        (BinaryOp::Sub, Value::Date(a), Value::Date(b)) => {
            return Ok(Value::Number(a.signed_duration_since(*b).num_days() as f64));
        }
        (BinaryOp::Sub, Value::Date(d), other) => {
            let days = coerce_number(sym, other)?;
            return shift_date(sym, *d, -days);
        }
        _ => {}
    }

    let (ln, rn) = match (coerce_number(sym, l), coerce_number(sym, r)) {
        (Ok(ln), Ok(rn)) => (ln, rn),
        _ => return Err(FormulaError::type_mismatch(sym, [l, r])),
    };
    let out = match op {
        BinaryOp::Add => ln + rn,
        BinaryOp::Sub => ln - rn,
        BinaryOp::Mul => ln * rn,
        _ => {
            if rn == 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            ln / rn
        }
    };
    if out.is_finite() {
        Ok(Value::Number(out))
    } else {
        Err(FormulaError::NonFinite { op: sym })
    }
}

fn shift_date(op: &'static str, date: NaiveDate, days: f64) -> Result<Value, FormulaError> {
    if days.fract() != 0.0 || days.abs() > i32::MAX as f64 {
        return Err(FormulaError::InvalidArgument {
            function: op,
            message: format!("date offsets must be whole days, got {days}"),
        });
    }
    date.checked_add_signed(Duration::days(days as i64))
        .map(Value::Date)
        .ok_or_else(|| FormulaError::InvalidArgument {
            function: op,
            message: "date out of range".to_string(),
        })
}

/// Numbers compare numerically with numeric text; otherwise values must match structurally.
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Text(_)) => coerce_number("==", r).is_ok_and(|b| *a == b),
        (Value::Text(_), Value::Number(b)) => coerce_number("==", l).is_ok_and(|a| a == *b),
        _ => l == r,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Ordering, FormulaError> {
    let sym = op.as_str();
    let mismatch = || FormulaError::type_mismatch(sym, [l, r]);
    match (l, r) {
        (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (Value::Number(_) | Value::Text(_), Value::Number(_) | Value::Text(_)) => {
            let a = coerce_number(sym, l).map_err(|_| mismatch())?;
            let b = coerce_number(sym, r).map_err(|_| mismatch())?;
            a.partial_cmp(&b).ok_or_else(mismatch)
        }
        _ => Err(mismatch()),
    }
}

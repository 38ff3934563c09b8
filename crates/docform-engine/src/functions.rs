//! The fixed allow-list of functions callable from formulas.
//!
//! There is no registration mechanism: a name that is not listed here is rejected by the parser.

use docform_model::Value;

use crate::ast::Expr;
use crate::eval::{truthy, Evaluator, FormulaError, ValueResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Abs,
    Min,
    Max,
    Round,
    Sum,
    Pow,
    Upper,
    Lower,
    Strip,
    Concat,
    IfElse,
    IsEmpty,
    Coalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Any,
    Number,
    Text,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub min_args: usize,
    /// `usize::MAX` for variadic functions.
    pub max_args: usize,
    pub return_type: ValueType,
}

impl FunctionSpec {
    pub fn accepts_arg_count(&self, count: usize) -> bool {
        (self.min_args..=self.max_args).contains(&count)
    }

    pub fn arity_description(&self) -> String {
        if self.min_args == self.max_args {
            format!("exactly {}", self.min_args)
        } else if self.max_args == usize::MAX {
            format!("at least {}", self.min_args)
        } else {
            format!("{} to {}", self.min_args, self.max_args)
        }
    }
}

impl Function {
    pub const ALL: [Function; 13] = [
        Function::Abs,
        Function::Min,
        Function::Max,
        Function::Round,
        Function::Sum,
        Function::Pow,
        Function::Upper,
        Function::Lower,
        Function::Strip,
        Function::Concat,
        Function::IfElse,
        Function::IsEmpty,
        Function::Coalesce,
    ];

    /// Case-insensitive lookup in the allow-list.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn spec(self) -> FunctionSpec {
        let (name, min_args, max_args, return_type) = match self {
            Function::Abs => ("abs", 1, 1, ValueType::Number),
            Function::Min => ("min", 1, usize::MAX, ValueType::Number),
            Function::Max => ("max", 1, usize::MAX, ValueType::Number),
            Function::Round => ("round", 1, 2, ValueType::Number),
            Function::Sum => ("sum", 1, usize::MAX, ValueType::Number),
            Function::Pow => ("pow", 2, 2, ValueType::Number),
            Function::Upper => ("upper", 1, 1, ValueType::Text),
            Function::Lower => ("lower", 1, 1, ValueType::Text),
            Function::Strip => ("strip", 1, 1, ValueType::Text),
            Function::Concat => ("concat", 1, usize::MAX, ValueType::Text),
            Function::IfElse => ("if_else", 3, 3, ValueType::Any),
            Function::IsEmpty => ("is_empty", 1, 1, ValueType::Bool),
            Function::Coalesce => ("coalesce", 1, usize::MAX, ValueType::Any),
        };
        FunctionSpec {
            name,
            min_args,
            max_args,
            return_type,
        }
    }
}

/// Largest digit count `round` accepts in either direction.
const MAX_ROUND_DIGITS: f64 = 15.0;

pub(crate) fn call_function<R: ValueResolver + ?Sized>(
    eval: &Evaluator<'_, R>,
    function: Function,
    args: &[Expr],
) -> Result<Value, FormulaError> {
    let spec = function.spec();
    let name = spec.name;
    // Parsed formulas are arity-checked already; hand-built trees are not.
    if !spec.accepts_arg_count(args.len()) {
        return Err(FormulaError::InvalidArgument {
            function: name,
            message: format!(
                "expected {} argument(s), got {}",
                spec.arity_description(),
                args.len()
            ),
        });
    }
    match function {
        Function::Abs => {
            let v = eval.eval(&args[0])?;
            map_number(name, v, f64::abs)
        }
        Function::Min | Function::Max => {
            let numbers = collect_numbers(eval, name, args)?;
            let folded = numbers.into_iter().reduce(|acc, n| {
                if function == Function::Min {
                    acc.min(n)
                } else {
                    acc.max(n)
                }
            });
            Ok(folded.map_or(Value::Null, Value::Number))
        }
        Function::Sum => {
            let numbers = collect_numbers(eval, name, args)?;
            finite(name, numbers.into_iter().sum())
        }
        Function::Round => {
            let v = eval.eval(&args[0])?;
            let digits = match args.get(1) {
                Some(arg) => match eval.eval(arg)? {
                    Value::Null => 0.0,
                    other => coerce_number(name, &other)?,
                },
                None => 0.0,
            };
            if digits.fract() != 0.0 || digits.abs() > MAX_ROUND_DIGITS {
                return Err(FormulaError::InvalidArgument {
                    function: name,
                    message: format!("digits must be a whole number within ±{MAX_ROUND_DIGITS}"),
                });
            }
            let v = match v {
                Value::Null => return Ok(Value::Null),
                other => coerce_number(name, &other)?,
            };
            let factor = 10f64.powi(digits.abs() as i32);
            let rounded = if digits >= 0.0 {
                (v * factor).round() / factor
            } else {
                (v / factor).round() * factor
            };
            finite(name, rounded)
        }
        Function::Pow => {
            let base = eval.eval(&args[0])?;
            let exp = eval.eval(&args[1])?;
            if base.is_null() || exp.is_null() {
                return Ok(Value::Null);
            }
            let base = coerce_number(name, &base)?;
            let exp = coerce_number(name, &exp)?;
            finite(name, base.powf(exp))
        }
        Function::Upper => map_text(name, eval.eval(&args[0])?, |s| s.to_uppercase()),
        Function::Lower => map_text(name, eval.eval(&args[0])?, |s| s.to_lowercase()),
        Function::Strip => map_text(name, eval.eval(&args[0])?, |s| s.trim().to_string()),
        Function::Concat => {
            let mut out = String::new();
            for arg in args {
                let v = eval.eval(arg)?;
                out.push_str(&v.to_string());
            }
            Ok(Value::Text(out))
        }
        Function::IfElse => {
            let cond = eval.eval(&args[0])?;
            if truthy(&cond) {
                eval.eval(&args[1])
            } else {
                eval.eval(&args[2])
            }
        }
        Function::IsEmpty => Ok(Value::Bool(eval.eval(&args[0])?.is_empty())),
        Function::Coalesce => {
            for arg in args {
                let v = eval.eval(arg)?;
                if !v.is_empty() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
    }
}

/// Coerces numbers and numeric text; anything else is a type mismatch.
pub(crate) fn coerce_number(op: &'static str, value: &Value) -> Result<f64, FormulaError> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .ok_or_else(|| FormulaError::type_mismatch(op, [value])),
        other => Err(FormulaError::type_mismatch(op, [other])),
    }
}

fn finite(op: &'static str, n: f64) -> Result<Value, FormulaError> {
    if n.is_finite() {
        Ok(Value::Number(n))
    } else {
        Err(FormulaError::NonFinite { op })
    }
}

fn map_number(op: &'static str, v: Value, f: impl FnOnce(f64) -> f64) -> Result<Value, FormulaError> {
    match v {
        Value::Null => Ok(Value::Null),
        other => finite(op, f(coerce_number(op, &other)?)),
    }
}

fn map_text(
    op: &'static str,
    v: Value,
    f: impl FnOnce(&str) -> String,
) -> Result<Value, FormulaError> {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Text(s) => Ok(Value::Text(f(&s))),
        other => Err(FormulaError::type_mismatch(op, [&other])),
    }
}

/// Evaluates every argument, flattening lists and skipping nulls.
fn collect_numbers<R: ValueResolver + ?Sized>(
    eval: &Evaluator<'_, R>,
    op: &'static str,
    args: &[Expr],
) -> Result<Vec<f64>, FormulaError> {
    fn push(op: &'static str, v: &Value, out: &mut Vec<f64>) -> Result<(), FormulaError> {
        match v {
            Value::Null => Ok(()),
            Value::List(items) => items.iter().try_for_each(|item| push(op, item, out)),
            other => {
                out.push(coerce_number(op, other)?);
                Ok(())
            }
        }
    }

    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        push(op, &eval.eval(arg)?, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive_and_closed() {
        assert_eq!(Function::from_name("IF_ELSE"), Some(Function::IfElse));
        assert_eq!(Function::from_name("Coalesce"), Some(Function::Coalesce));
        assert_eq!(Function::from_name("exec"), None);
        assert_eq!(Function::from_name("__import__"), None);
    }

    #[test]
    fn every_function_round_trips_through_its_name() {
        for f in Function::ALL {
            assert_eq!(Function::from_name(f.name()), Some(f));
        }
    }

    #[test]
    fn arity_descriptions() {
        assert_eq!(Function::Pow.spec().arity_description(), "exactly 2");
        assert_eq!(Function::Sum.spec().arity_description(), "at least 1");
        assert_eq!(Function::Round.spec().arity_description(), "1 to 2");
        assert!(Function::Round.spec().accepts_arg_count(2));
        assert!(!Function::Round.spec().accepts_arg_count(3));
    }
}

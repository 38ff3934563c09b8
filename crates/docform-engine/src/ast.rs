use docform_model::{FieldId, Value};
use std::collections::BTreeSet;
use std::fmt;

use crate::functions::Function;
use crate::parser::{self, ParseError};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `{{field_id}}` reference.
    Field(FieldId),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
    Not,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Neg => "-",
            UnaryOp::Not => "not ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
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
    /// Binding power; higher binds tighter.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// Precedence of prefix operators; binds tighter than every binary operator.
pub(crate) const UNARY_PRECEDENCE: u8 = 6;

impl Expr {
    /// Collects every `{{field}}` reference in the expression.
    pub fn field_refs(&self) -> BTreeSet<FieldId> {
        let mut out = BTreeSet::new();
        self.collect_field_refs(&mut out);
        out
    }

    fn collect_field_refs(&self, out: &mut BTreeSet<FieldId>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Field(id) => {
                out.insert(id.clone());
            }
            Expr::Unary { expr, .. } => expr.collect_field_refs(out),
            Expr::Binary { left, right, .. } => {
                left.collect_field_refs(out);
                right.collect_field_refs(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_field_refs(out);
                }
            }
        }
    }

    fn fmt_with_precedence(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        match self {
            Expr::Literal(value) => fmt_literal(value, f),
            Expr::Field(id) => write!(f, "{{{{{id}}}}}"),
            Expr::Unary { op, expr } => {
                let wrap = parent > UNARY_PRECEDENCE;
                if wrap {
                    f.write_str("(")?;
                }
                f.write_str(op.as_str())?;
                expr.fmt_with_precedence(f, UNARY_PRECEDENCE)?;
                if wrap {
                    f.write_str(")")?;
                }
                Ok(())
            }
            Expr::Binary { op, left, right } => {
                let prec = op.precedence();
                let wrap = prec < parent;
                if wrap {
                    f.write_str("(")?;
                }
                left.fmt_with_precedence(f, prec)?;
                write!(f, " {} ", op.as_str())?;
                // Operators are left-associative, so an equal-precedence right operand needs
                // parentheses to round-trip.
                right.fmt_with_precedence(f, prec + 1)?;
                if wrap {
                    f.write_str(")")?;
                }
                Ok(())
            }
            Expr::Call { function, args } => {
                write!(f, "{}(", function.name())?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    arg.fmt_with_precedence(f, 0)?;
                }
                f.write_str(")")
            }
        }
    }
}

fn fmt_literal(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Number(n) => write!(f, "{n}"),
        other => {
            let text = other.to_string();
            write!(f, "\"{}\"", text.replace('"', "\"\""))
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with_precedence(f, 0)
    }
}

/// A parsed formula together with its cached dependency set.
///
/// The dependency set is extracted once when the formula is built and never changes afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
    dependencies: BTreeSet<FieldId>,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let expr = parser::parse(source)?;
        Ok(Self::from_parts(source.to_string(), expr))
    }

    pub fn from_expr(expr: Expr) -> Self {
        let source = expr.to_string();
        Self::from_parts(source, expr)
    }

    fn from_parts(source: String, expr: Expr) -> Self {
        let dependencies = expr.field_refs();
        Self {
            source,
            expr,
            dependencies,
        }
    }

    /// The formula text as registered.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn dependencies(&self) -> &BTreeSet<FieldId> {
        &self.dependencies
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.expr.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_adds_parentheses_only_where_needed() {
        let formula = Formula::parse("({{a}} + {{b}}) * 2 - (3 - {{c}})").unwrap();
        assert_eq!(formula.to_string(), "({{a}} + {{b}}) * 2 - (3 - {{c}})");

        let formula = Formula::parse("{{a}} + {{b}} * 2").unwrap();
        assert_eq!(formula.to_string(), "{{a}} + {{b}} * 2");
    }

    #[test]
    fn display_round_trips_through_the_parser() {
        let src = "IF_ELSE(not {{flag}} && {{n}} >= 10, concat('it''s', \"x\"), -{{n}})";
        let formula = Formula::parse(src).unwrap();
        let reparsed = Formula::parse(&formula.to_string()).unwrap();
        assert_eq!(reparsed.expr(), formula.expr());
        assert_eq!(
            formula.to_string(),
            "if_else(not {{flag}} and {{n}} >= 10, concat(\"it's\", \"x\"), -{{n}})"
        );
    }

    #[test]
    fn dependencies_are_deduplicated_and_sorted() {
        let formula = Formula::parse("{{b}} + {{a}} + {{b}}").unwrap();
        let deps: Vec<&str> = formula.dependencies().iter().map(FieldId::as_str).collect();
        assert_eq!(deps, vec!["a", "b"]);
    }
}

//! Edge-condition evaluation
//!
//! A condition is a boolean expression over the instance's variable map:
//! a single comparison (`amount >= 100`, `status == 'open'`) or a bare
//! identifier whose truthiness is the answer. The grammar is parsed by a
//! hand-written lexer and parser — no scripting engine.
//!
//! Evaluation is total: an empty or whitespace-only condition is `true`,
//! and any lexing, parsing or resolution failure is `false`. Gateways must
//! never crash an instance because an author mistyped an expression.

mod lexer;
mod parser;

pub use lexer::{LexError, Token};
pub use parser::{CmpOp, Expr, Literal, Operand, ParseError};

use std::cmp::Ordering;

use serde_json::{Map, Value};
use tracing::debug;

/// The variable map conditions are evaluated against
pub type Variables = Map<String, Value>;

/// Evaluate a condition against a variable map.
///
/// Type coercion: if both sides are numeric the comparison is numeric;
/// otherwise both sides are stringified and compared as strings.
pub fn evaluate(condition: &str, variables: &Variables) -> bool {
    let trimmed = condition.trim();
    if trimmed.is_empty() {
        return true;
    }

    let tokens = match lexer::tokenize(trimmed) {
        Ok(tokens) => tokens,
        Err(err) => {
            debug!(condition = trimmed, %err, "condition failed to tokenize");
            return false;
        }
    };

    let expr = match parser::parse(tokens) {
        Ok(expr) => expr,
        Err(err) => {
            debug!(condition = trimmed, %err, "condition failed to parse");
            return false;
        }
    };

    evaluate_expr(&expr, variables)
}

fn evaluate_expr(expr: &Expr, variables: &Variables) -> bool {
    match expr {
        Expr::Truthy(operand) => is_truthy(&resolve(operand, variables)),
        Expr::Compare { lhs, op, rhs } => {
            let lhs = resolve(lhs, variables);
            let rhs = resolve(rhs, variables);
            compare(&lhs, *op, &rhs)
        }
    }
}

/// A resolved operand value
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,

    /// Arrays/objects; compared by their JSON text, truthy when non-empty
    Json(Value),
}

fn resolve(operand: &Operand, variables: &Variables) -> Resolved {
    match operand {
        Operand::Lit(Literal::Number(n)) => Resolved::Number(*n),
        Operand::Lit(Literal::Str(s)) => Resolved::Str(s.clone()),
        Operand::Lit(Literal::Bool(b)) => Resolved::Bool(*b),
        Operand::Lit(Literal::Null) => Resolved::Null,
        Operand::Var(name) => match variables.get(name) {
            None | Some(Value::Null) => Resolved::Null,
            Some(Value::Bool(b)) => Resolved::Bool(*b),
            Some(Value::Number(n)) => match n.as_f64() {
                Some(f) => Resolved::Number(f),
                None => Resolved::Str(n.to_string()),
            },
            Some(Value::String(s)) => Resolved::Str(s.clone()),
            Some(other) => Resolved::Json(other.clone()),
        },
    }
}

fn compare(lhs: &Resolved, op: CmpOp, rhs: &Resolved) -> bool {
    let ordering = match (lhs, rhs) {
        (Resolved::Number(a), Resolved::Number(b)) => a.partial_cmp(b),
        _ => Some(stringify(lhs).cmp(&stringify(rhs))),
    };

    let Some(ordering) = ordering else {
        // NaN comparisons hold for != only.
        return op == CmpOp::Ne;
    };

    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
    }
}

fn stringify(value: &Resolved) -> String {
    match value {
        Resolved::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{}", *n as i64)
            } else {
                n.to_string()
            }
        }
        Resolved::Str(s) => s.clone(),
        Resolved::Bool(b) => b.to_string(),
        Resolved::Null => "null".to_string(),
        Resolved::Json(v) => v.to_string(),
    }
}

/// Truthiness of a value: non-null, non-empty, non-"false", non-zero
fn is_truthy(value: &Resolved) -> bool {
    match value {
        Resolved::Null => false,
        Resolved::Bool(b) => *b,
        Resolved::Number(n) => *n != 0.0,
        Resolved::Str(s) => !s.is_empty() && s != "false" && s != "0",
        Resolved::Json(Value::Array(items)) => !items.is_empty(),
        Resolved::Json(Value::Object(fields)) => !fields.is_empty(),
        Resolved::Json(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_empty_condition_is_true() {
        let variables = Variables::new();
        assert!(evaluate("", &variables));
        assert!(evaluate("   ", &variables));
    }

    #[test]
    fn test_numeric_comparisons() {
        let variables = vars(&[("amount", json!(150))]);
        assert!(evaluate("amount > 100", &variables));
        assert!(evaluate("amount >= 150", &variables));
        assert!(evaluate("amount <= 150", &variables));
        assert!(!evaluate("amount < 100", &variables));
        assert!(evaluate("amount == 150", &variables));
        assert!(evaluate("amount != 151", &variables));
    }

    #[test]
    fn test_boolean_comparison() {
        let variables = vars(&[("approved", json!(true))]);
        assert!(evaluate("approved == true", &variables));
        assert!(!evaluate("approved == false", &variables));
        assert!(evaluate("approved != false", &variables));
    }

    #[test]
    fn test_string_comparison_both_quote_styles() {
        let variables = vars(&[("status", json!("open"))]);
        assert!(evaluate("status == 'open'", &variables));
        assert!(evaluate(r#"status == "open""#, &variables));
        assert!(evaluate("status != 'closed'", &variables));
    }

    #[test]
    fn test_null_comparison() {
        let variables = vars(&[("missing", json!(null)), ("present", json!(1))]);
        assert!(evaluate("missing == null", &variables));
        assert!(evaluate("absent == null", &variables));
        assert!(evaluate("present != null", &variables));
    }

    #[test]
    fn test_mixed_types_compare_as_strings() {
        // Number vs string literal: stringified comparison.
        let variables = vars(&[("code", json!(42))]);
        assert!(evaluate("code == '42'", &variables));
        assert!(!evaluate("code == '042'", &variables));
    }

    #[test]
    fn test_bare_identifier_truthiness() {
        let variables = vars(&[
            ("yes", json!(true)),
            ("no", json!(false)),
            ("zero", json!(0)),
            ("count", json!(3)),
            ("empty", json!("")),
            ("word", json!("ready")),
            ("falsy_word", json!("false")),
            ("nothing", json!(null)),
            ("items", json!([1])),
        ]);
        assert!(evaluate("yes", &variables));
        assert!(!evaluate("no", &variables));
        assert!(!evaluate("zero", &variables));
        assert!(evaluate("count", &variables));
        assert!(!evaluate("empty", &variables));
        assert!(evaluate("word", &variables));
        assert!(!evaluate("falsy_word", &variables));
        assert!(!evaluate("nothing", &variables));
        assert!(!evaluate("undefined_var", &variables));
        assert!(evaluate("items", &variables));
    }

    #[test]
    fn test_malformed_conditions_are_false() {
        let variables = vars(&[("x", json!(1))]);
        assert!(!evaluate("x ==", &variables));
        assert!(!evaluate("x && y", &variables));
        assert!(!evaluate("== 1", &variables));
        assert!(!evaluate("x == 1 extra", &variables));
    }

    #[test]
    fn test_missing_variable_in_comparison() {
        let variables = Variables::new();
        // Missing resolves to null, which stringifies to "null".
        assert!(!evaluate("ghost == 'value'", &variables));
        assert!(evaluate("ghost == null", &variables));
    }
}

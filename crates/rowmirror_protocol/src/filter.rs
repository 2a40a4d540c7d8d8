//! Row filter expressions.
//!
//! Expressions use the `column=op.value` form, with several predicates
//! joined by `&`:
//!
//! ```text
//! owner=eq.alice&priority=gte.3&status=in.(open,blocked)
//! ```
//!
//! Every predicate must hold for a row to match.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Member of a parenthesised, comma-separated list.
    In,
}

impl FilterOp {
    /// Returns the operator token.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }

    /// Parses an operator token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "eq" => Some(FilterOp::Eq),
            "neq" => Some(FilterOp::Neq),
            "gt" => Some(FilterOp::Gt),
            "gte" => Some(FilterOp::Gte),
            "lt" => Some(FilterOp::Lt),
            "lte" => Some(FilterOp::Lte),
            "in" => Some(FilterOp::In),
            _ => None,
        }
    }
}

/// A single `column=op.value` test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    /// Column the predicate reads.
    pub column: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Raw operand text.
    pub operand: String,
}

impl Predicate {
    /// Evaluates the predicate against a row.
    ///
    /// A missing column only satisfies `neq`.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        let Some(value) = row.get(&self.column) else {
            return self.op == FilterOp::Neq;
        };

        match self.op {
            FilterOp::Eq => compare(value, &self.operand) == Some(Ordering::Equal),
            FilterOp::Neq => compare(value, &self.operand) != Some(Ordering::Equal),
            FilterOp::Gt => compare(value, &self.operand) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(value, &self.operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(value, &self.operand) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(value, &self.operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => in_list(&self.operand)
                .any(|item| compare(value, item) == Some(Ordering::Equal)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.operand)
    }
}

/// Compares a column value to operand text, using the value's own type.
fn compare(value: &Value, operand: &str) -> Option<Ordering> {
    match value {
        Value::String(s) => Some(s.as_str().cmp(operand)),
        Value::Number(n) => {
            let rhs: f64 = operand.parse().ok()?;
            n.as_f64()?.partial_cmp(&rhs)
        }
        Value::Bool(b) => {
            let rhs: bool = operand.parse().ok()?;
            Some(b.cmp(&rhs))
        }
        Value::Null => (operand == "null").then_some(Ordering::Equal),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn in_list(operand: &str) -> impl Iterator<Item = &str> {
    operand
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or(operand)
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

/// A conjunction of predicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilterExpr {
    predicates: Vec<Predicate>,
}

impl FilterExpr {
    /// Builds the single-predicate `column=eq.value` filter.
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            predicates: vec![Predicate {
                column: column.into(),
                op: FilterOp::Eq,
                operand: value.to_string(),
            }],
        }
    }

    /// Parses an expression.
    pub fn parse(expr: &str) -> ProtocolResult<Self> {
        let invalid = |reason: &str| ProtocolError::InvalidFilter {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let mut predicates = Vec::new();
        for part in expr.split('&').map(str::trim) {
            if part.is_empty() {
                return Err(invalid("empty predicate"));
            }
            let (column, rest) = part.split_once('=').ok_or_else(|| invalid("missing '='"))?;
            let (op, operand) = rest
                .split_once('.')
                .ok_or_else(|| invalid("missing operator"))?;
            let op = FilterOp::from_token(op).ok_or_else(|| invalid("unknown operator"))?;
            if column.is_empty() {
                return Err(invalid("empty column"));
            }
            predicates.push(Predicate {
                column: column.to_string(),
                op,
                operand: operand.to_string(),
            });
        }

        Ok(Self { predicates })
    }

    /// Returns the predicates.
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Returns true if every predicate holds for `row`.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, predicate) in self.predicates.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{predicate}")?;
        }
        Ok(())
    }
}

impl FromStr for FilterExpr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FilterExpr {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FilterExpr> for String {
    fn from(value: FilterExpr) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn eq_filter_formats_like_a_subscription_filter() {
        assert_eq!(FilterExpr::eq("id", "abc").to_string(), "id=eq.abc");
        assert_eq!(FilterExpr::eq("id", 7).to_string(), "id=eq.7");
    }

    #[test]
    fn parse_and_display_round_trip() {
        let raw = "owner=eq.alice&priority=gte.3&status=in.(open,blocked)";
        let expr = FilterExpr::parse(raw).unwrap();
        assert_eq!(expr.predicates().len(), 3);
        assert_eq!(expr.predicates()[2].op, FilterOp::In);
        assert_eq!(expr.to_string(), raw);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["", "owner", "owner=alice", "owner=like.a%", "=eq.1", "a=eq.1&"] {
            assert!(
                matches!(FilterExpr::parse(bad), Err(ProtocolError::InvalidFilter { .. })),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn matches_by_column_type() {
        let r = row(json!({"owner": "alice", "priority": 4, "done": false, "note": null}));

        assert!(FilterExpr::parse("owner=eq.alice").unwrap().matches(&r));
        assert!(!FilterExpr::parse("owner=eq.bob").unwrap().matches(&r));
        assert!(FilterExpr::parse("priority=gt.3").unwrap().matches(&r));
        assert!(FilterExpr::parse("priority=lte.4").unwrap().matches(&r));
        assert!(!FilterExpr::parse("priority=lt.4").unwrap().matches(&r));
        assert!(FilterExpr::parse("done=eq.false").unwrap().matches(&r));
        assert!(FilterExpr::parse("note=eq.null").unwrap().matches(&r));
        assert!(FilterExpr::parse("owner=in.(bob,alice)").unwrap().matches(&r));
        assert!(FilterExpr::parse("owner=neq.bob&priority=gte.4")
            .unwrap()
            .matches(&r));
    }

    #[test]
    fn missing_column_only_satisfies_neq() {
        let r = row(json!({"a": 1}));
        assert!(!FilterExpr::parse("b=eq.1").unwrap().matches(&r));
        assert!(FilterExpr::parse("b=neq.1").unwrap().matches(&r));
    }

    #[test]
    fn serde_uses_the_string_form() {
        let expr = FilterExpr::parse("a=eq.1").unwrap();
        let encoded = serde_json::to_string(&expr).unwrap();
        assert_eq!(encoded, "\"a=eq.1\"");
        let decoded: FilterExpr = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, expr);
    }
}

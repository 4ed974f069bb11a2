//! Filter expression AST, grammar-driven parser, and ternary evaluator
//! (spec.md §4.3).

use crate::error::{Error, Result};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "metadata/grammar.pest"]
struct FilterParser;

/// Comparison operator between a metadata field and a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    Prefix,
}

/// A parsed literal. Bare identifiers (no quotes) are treated as text,
/// matching the grammar's `literal := number | string | ident`.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

/// The filter expression AST.
#[derive(Debug, Clone)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        field: String,
        op: CompareOp,
        value: Literal,
    },
}

/// Three-valued evaluation result, per spec.md §4.3: a malformed predicate
/// (e.g. a non-parsable number for a numeric comparison) is `Error`, not
/// `False`, but `AND`/`OR` still short-circuit on a determinate `True`/
/// `False` operand before an `Error` on the other side is ever produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ternary {
    True,
    False,
    Error,
}

impl Expr {
    /// Parses `input` against the grammar in `grammar.pest`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` with the `pest` diagnostic on any
    /// syntax error.
    pub fn parse(input: &str) -> Result<Self> {
        let mut pairs = FilterParser::parse(Rule::program, input)
            .map_err(|e| Error::InvalidArgument(format!("filter expression: {e}")))?;
        let expr_pair = pairs
            .next()
            .ok_or_else(|| Error::InvalidArgument("empty filter expression".to_string()))?;
        Self::from_expr_pair(expr_pair)
    }

    fn from_expr_pair(pair: Pair<Rule>) -> Result<Self> {
        debug_assert_eq!(pair.as_rule(), Rule::expr);
        let mut terms = pair.into_inner();
        let mut node = Self::from_and_pair(terms.next().expect("expr has >=1 and_expr"))?;
        for next in terms {
            let rhs = Self::from_and_pair(next)?;
            node = Self::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn from_and_pair(pair: Pair<Rule>) -> Result<Self> {
        debug_assert_eq!(pair.as_rule(), Rule::and_expr);
        let mut terms = pair.into_inner();
        let mut node = Self::from_not_pair(terms.next().expect("and_expr has >=1 not_expr"))?;
        for next in terms {
            let rhs = Self::from_not_pair(next)?;
            node = Self::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn from_not_pair(pair: Pair<Rule>) -> Result<Self> {
        debug_assert_eq!(pair.as_rule(), Rule::not_expr);
        let mut negate = false;
        let mut primary = None;
        for child in pair.into_inner() {
            match child.as_rule() {
                Rule::not_kw => negate = true,
                Rule::primary => primary = Some(child),
                other => unreachable!("unexpected rule in not_expr: {other:?}"),
            }
        }
        let primary = primary.expect("not_expr always yields a primary");
        let node = Self::from_primary_pair(primary)?;
        Ok(if negate { Self::Not(Box::new(node)) } else { node })
    }

    fn from_primary_pair(pair: Pair<Rule>) -> Result<Self> {
        debug_assert_eq!(pair.as_rule(), Rule::primary);
        let inner = pair.into_inner().next().expect("primary has one child");
        match inner.as_rule() {
            Rule::expr => Self::from_expr_pair(inner),
            Rule::comparison => Self::from_comparison_pair(inner),
            other => unreachable!("unexpected rule in primary: {other:?}"),
        }
    }

    fn from_comparison_pair(pair: Pair<Rule>) -> Result<Self> {
        let mut parts = pair.into_inner();
        let field = parts.next().expect("comparison has a field").as_str().to_string();
        let op_pair = parts.next().expect("comparison has an operator");
        let literal_pair = parts.next().expect("comparison has a literal");

        let op = match op_pair.as_str().to_ascii_uppercase().as_str() {
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Neq,
            "<=" => CompareOp::Lte,
            ">=" => CompareOp::Gte,
            "<" => CompareOp::Lt,
            ">" => CompareOp::Gt,
            "CONTAINS" => CompareOp::Contains,
            "PREFIX" => CompareOp::Prefix,
            other => {
                return Err(Error::InvalidArgument(format!("unknown operator '{other}'")))
            }
        };

        let value = Self::literal_from_pair(literal_pair);
        Ok(Self::Compare { field, op, value })
    }

    fn literal_from_pair(pair: Pair<Rule>) -> Literal {
        let lit = pair.into_inner().next().expect("literal has one child");
        match lit.as_rule() {
            Rule::number => Literal::Number(lit.as_str().parse().unwrap_or(f64::NAN)),
            Rule::string => {
                let inner = lit.into_inner().next().expect("string has inner_string");
                Literal::Text(inner.as_str().to_string())
            }
            Rule::ident => Literal::Text(lit.as_str().to_string()),
            other => unreachable!("unexpected literal rule: {other:?}"),
        }
    }

    /// Evaluates this expression against a single record's metadata,
    /// resolved field-by-field via `lookup`.
    #[must_use]
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Ternary {
        match self {
            Self::And(a, b) => match a.evaluate(lookup) {
                Ternary::False => Ternary::False,
                Ternary::True => b.evaluate(lookup),
                Ternary::Error => match b.evaluate(lookup) {
                    Ternary::False => Ternary::False,
                    _ => Ternary::Error,
                },
            },
            Self::Or(a, b) => match a.evaluate(lookup) {
                Ternary::True => Ternary::True,
                Ternary::False => b.evaluate(lookup),
                Ternary::Error => match b.evaluate(lookup) {
                    Ternary::True => Ternary::True,
                    _ => Ternary::Error,
                },
            },
            Self::Not(inner) => match inner.evaluate(lookup) {
                Ternary::True => Ternary::False,
                Ternary::False => Ternary::True,
                Ternary::Error => Ternary::Error,
            },
            Self::Compare { field, op, value } => {
                let Some(stored) = lookup(field) else {
                    return Ternary::False;
                };
                Self::evaluate_compare(&stored, *op, value)
            }
        }
    }

    fn evaluate_compare(stored: &str, op: CompareOp, value: &Literal) -> Ternary {
        match op {
            CompareOp::Eq => from_bool(stored == Self::literal_as_text(value)),
            CompareOp::Neq => from_bool(stored != Self::literal_as_text(value)),
            CompareOp::Contains => from_bool(stored.contains(&Self::literal_as_text(value))),
            CompareOp::Prefix => from_bool(stored.starts_with(&Self::literal_as_text(value))),
            CompareOp::Lt | CompareOp::Lte | CompareOp::Gt | CompareOp::Gte => {
                let Literal::Number(target) = value else {
                    return Ternary::Error;
                };
                let Ok(stored_num) = stored.parse::<f64>() else {
                    return Ternary::False;
                };
                from_bool(match op {
                    CompareOp::Lt => stored_num < *target,
                    CompareOp::Lte => stored_num <= *target,
                    CompareOp::Gt => stored_num > *target,
                    CompareOp::Gte => stored_num >= *target,
                    _ => unreachable!(),
                })
            }
        }
    }

    fn literal_as_text(value: &Literal) -> String {
        match value {
            Literal::Text(s) => s.clone(),
            Literal::Number(n) => format!("{n}"),
        }
    }

    /// If this subtree is a single `(field, Eq, value)` comparison, returns
    /// the `(key, value)` pair so the caller can attempt a posting-list
    /// pre-filter lookup instead of a full scan.
    #[must_use]
    pub fn as_equality(&self) -> Option<(&str, &str)> {
        match self {
            Self::Compare {
                field,
                op: CompareOp::Eq,
                value: Literal::Text(v),
            } => Some((field.as_str(), v.as_str())),
            _ => None,
        }
    }
}

fn from_bool(b: bool) -> Ternary {
    if b {
        Ternary::True
    } else {
        Ternary::False
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
        move |field| {
            pairs
                .iter()
                .find(|(k, _)| *k == field)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn simple_equality() {
        let expr = Expr::parse("color == \"red\"").unwrap();
        assert_eq!(expr.evaluate(&lookup(&[("color", "red")])), Ternary::True);
        assert_eq!(expr.evaluate(&lookup(&[("color", "blue")])), Ternary::False);
    }

    #[test]
    fn and_or_precedence() {
        let expr = Expr::parse("a == \"1\" AND b == \"2\" OR c == \"3\"").unwrap();
        assert_eq!(
            expr.evaluate(&lookup(&[("a", "1"), ("b", "2"), ("c", "9")])),
            Ternary::True
        );
        assert_eq!(
            expr.evaluate(&lookup(&[("a", "1"), ("b", "9"), ("c", "3")])),
            Ternary::True
        );
        assert_eq!(
            expr.evaluate(&lookup(&[("a", "9"), ("b", "9"), ("c", "9")])),
            Ternary::False
        );
    }

    #[test]
    fn not_negates() {
        let expr = Expr::parse("NOT status == \"deleted\"").unwrap();
        assert_eq!(expr.evaluate(&lookup(&[("status", "active")])), Ternary::True);
        assert_eq!(expr.evaluate(&lookup(&[("status", "deleted")])), Ternary::False);
    }

    #[test]
    fn parentheses_group_correctly() {
        let expr = Expr::parse("(a == \"1\" OR b == \"2\") AND c == \"3\"").unwrap();
        assert_eq!(
            expr.evaluate(&lookup(&[("a", "1"), ("b", "9"), ("c", "3")])),
            Ternary::True
        );
        assert_eq!(
            expr.evaluate(&lookup(&[("a", "9"), ("b", "9"), ("c", "3")])),
            Ternary::False
        );
    }

    #[test]
    fn numeric_comparison() {
        let expr = Expr::parse("price >= 9.5").unwrap();
        assert_eq!(expr.evaluate(&lookup(&[("price", "10")])), Ternary::True);
        assert_eq!(expr.evaluate(&lookup(&[("price", "9")])), Ternary::False);
    }

    #[test]
    fn non_parsable_number_is_false_not_error() {
        let expr = Expr::parse("price >= 9.5").unwrap();
        assert_eq!(expr.evaluate(&lookup(&[("price", "not-a-number")])), Ternary::False);
    }

    #[test]
    fn contains_and_prefix() {
        let contains = Expr::parse("name CONTAINS \"ector\"").unwrap();
        assert_eq!(contains.evaluate(&lookup(&[("name", "GigaVector")])), Ternary::True);
        let prefix = Expr::parse("name PREFIX \"Giga\"").unwrap();
        assert_eq!(prefix.evaluate(&lookup(&[("name", "GigaVector")])), Ternary::True);
        assert_eq!(prefix.evaluate(&lookup(&[("name", "MicroVector")])), Ternary::False);
    }

    #[test]
    fn missing_field_is_false() {
        let expr = Expr::parse("missing == \"x\"").unwrap();
        assert_eq!(expr.evaluate(&lookup(&[])), Ternary::False);
    }

    #[test]
    fn as_equality_extracts_single_eq_comparison() {
        let expr = Expr::parse("color == \"red\"").unwrap();
        assert_eq!(expr.as_equality(), Some(("color", "red")));

        let compound = Expr::parse("color == \"red\" AND size == \"m\"").unwrap();
        assert_eq!(compound.as_equality(), None);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        /// Strategy for arbitrary leaf comparisons over a fixed, small field
        /// set so most generated expressions actually resolve against `lookup`.
        fn leaf_strategy() -> impl Strategy<Value = Expr> {
            ("[a-c]", "[x-z]").prop_map(|(field, value)| Expr::Compare {
                field,
                op: CompareOp::Eq,
                value: Literal::Text(value),
            })
        }

        /// Strategy for arbitrary (And/Or/Not/leaf) expression trees, bounded
        /// in depth so recursion terminates.
        fn expr_strategy() -> impl Strategy<Value = Expr> {
            leaf_strategy().prop_recursive(4, 16, 2, |inner| {
                prop_oneof![
                    (inner.clone(), inner.clone())
                        .prop_map(|(a, b)| Expr::And(Box::new(a), Box::new(b))),
                    (inner.clone(), inner.clone())
                        .prop_map(|(a, b)| Expr::Or(Box::new(a), Box::new(b))),
                    inner.prop_map(|a| Expr::Not(Box::new(a))),
                ]
            })
        }

        fn sample_lookup(field: &str) -> Option<String> {
            match field {
                "a" => Some("x".to_string()),
                "b" => Some("y".to_string()),
                _ => None,
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// Property: double negation is the identity on the ternary result,
            /// for every `Ternary` outcome (`True`/`False`/`Error` all round-trip).
            #[test]
            fn prop_double_negation_is_identity(expr in expr_strategy()) {
                let direct = expr.evaluate(&sample_lookup);
                let double_negated = Expr::Not(Box::new(Expr::Not(Box::new(expr)))).evaluate(&sample_lookup);
                prop_assert_eq!(direct, double_negated);
            }

            /// Property: `AND` with a literally-false right operand is always
            /// `False`, regardless of what the left operand evaluates to.
            #[test]
            fn prop_and_false_right_short_circuits(expr in expr_strategy()) {
                let always_false = Expr::Compare {
                    field: "missing".to_string(),
                    op: CompareOp::Eq,
                    value: Literal::Text("unused".to_string()),
                };
                let combined = Expr::And(Box::new(expr), Box::new(always_false));
                prop_assert_eq!(combined.evaluate(&sample_lookup), Ternary::False);
            }

            /// Property: `OR` with a literally-true right operand is always
            /// `True`, regardless of what the left operand evaluates to.
            #[test]
            fn prop_or_true_right_short_circuits(expr in expr_strategy()) {
                let always_true = Expr::Compare {
                    field: "a".to_string(),
                    op: CompareOp::Eq,
                    value: Literal::Text("x".to_string()),
                };
                let combined = Expr::Or(Box::new(expr), Box::new(always_true));
                prop_assert_eq!(combined.evaluate(&sample_lookup), Ternary::True);
            }
        }
    }
}

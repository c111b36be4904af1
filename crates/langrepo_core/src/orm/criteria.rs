//! Store-agnostic filter, ordering and pagination criteria.
//!
//! Field names are plain strings; entity managers validate them against their
//! own mapping when the criteria are evaluated.

use serde::{Deserialize, Serialize};

/// Literal operand used in criteria expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriteriaValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<bool> for CriteriaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CriteriaValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for CriteriaValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for CriteriaValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for CriteriaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CriteriaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<CriteriaValue>> From<Option<T>> for CriteriaValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Substring match; text operands only.
    Contains,
    /// Prefix match; text operands only.
    StartsWith,
    /// Suffix match; text operands only.
    EndsWith,
}

/// Boolean filter expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Compare {
        field: String,
        op: Comparison,
        value: CriteriaValue,
    },
    In {
        field: String,
        values: Vec<CriteriaValue>,
    },
    IsNull(String),
    /// Empty conjunction matches everything.
    And(Vec<Expr>),
    /// Empty disjunction matches nothing.
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn compare(field: impl Into<String>, op: Comparison, value: impl Into<CriteriaValue>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<CriteriaValue>) -> Self {
        Self::compare(field, Comparison::Eq, value)
    }

    pub fn neq(field: impl Into<String>, value: impl Into<CriteriaValue>) -> Self {
        Self::compare(field, Comparison::Neq, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<CriteriaValue>) -> Self {
        Self::compare(field, Comparison::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<CriteriaValue>) -> Self {
        Self::compare(field, Comparison::Lte, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<CriteriaValue>) -> Self {
        Self::compare(field, Comparison::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<CriteriaValue>) -> Self {
        Self::compare(field, Comparison::Gte, value)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(field, Comparison::Contains, CriteriaValue::Text(value.into()))
    }

    pub fn starts_with(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(field, Comparison::StartsWith, CriteriaValue::Text(value.into()))
    }

    pub fn ends_with(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare(field, Comparison::EndsWith, CriteriaValue::Text(value.into()))
    }

    pub fn is_in<V: Into<CriteriaValue>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull(field.into())
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Filter + ordering + pagination specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Criteria {
    filter: Option<Expr>,
    orderings: Vec<(String, Direction)>,
    first_result: Option<u32>,
    max_results: Option<u32>,
}

impl Criteria {
    /// Criteria matching every entity in store order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current filter.
    pub fn filter_by(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    /// Narrows the current filter with `expr`.
    pub fn and_where(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            None => expr,
            Some(Expr::And(mut terms)) => {
                terms.push(expr);
                Expr::And(terms)
            }
            Some(current) => Expr::And(vec![current, expr]),
        });
        self
    }

    /// Widens the current filter with `expr`.
    pub fn or_where(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            None => expr,
            Some(Expr::Or(mut terms)) => {
                terms.push(expr);
                Expr::Or(terms)
            }
            Some(current) => Expr::Or(vec![current, expr]),
        });
        self
    }

    /// Appends an ordering term; earlier terms take precedence.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.orderings.push((field.into(), direction));
        self
    }

    /// Skips the first `offset` matches.
    pub fn with_first_result(mut self, offset: u32) -> Self {
        self.first_result = Some(offset);
        self
    }

    /// Caps the number of matches.
    pub fn with_max_results(mut self, limit: u32) -> Self {
        self.max_results = Some(limit);
        self
    }

    pub fn filter(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn orderings(&self) -> &[(String, Direction)] {
        &self.orderings
    }

    pub fn first_result(&self) -> Option<u32> {
        self.first_result
    }

    pub fn max_results(&self) -> Option<u32> {
        self.max_results
    }
}

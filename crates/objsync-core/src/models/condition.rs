//! Filter conditions for sync collections
//!
//! Conditions are a flat list evaluated strictly left to right: each
//! condition's combinator joins it to everything before it, so
//! `a OR b AND c` means `(a OR b) AND c`. There is no implicit precedence.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::util::short_digest;

/// Pseudo-field that addresses the hierarchical parent column directly
pub const PARENT_FIELD: &str = "parent_id";

/// How a condition joins the conditions before it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

impl Combinator {
    const fn sql(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// Comparison applied to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Contains,
    BeginsWith,
    IsNull,
    IsNotNull,
}

impl Operator {
    const fn takes_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

/// One boolean predicate in a collection filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub combinator: Combinator,
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    /// Build a condition
    pub fn new(
        combinator: Combinator,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            combinator,
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !field_pattern().is_match(&self.field) {
            return Err(Error::InvalidFilter(format!(
                "'{}' is not a valid field name",
                self.field
            )));
        }

        if !self.operator.takes_value() {
            return Ok(());
        }

        match (&self.operator, &self.value) {
            (_, Value::Array(_) | Value::Object(_)) => Err(Error::InvalidFilter(format!(
                "condition on '{}' must compare against a scalar",
                self.field
            ))),
            (Operator::Contains | Operator::BeginsWith, value) if !value.is_string() => {
                Err(Error::InvalidFilter(format!(
                    "{:?} on '{}' requires a string value",
                    self.operator, self.field
                )))
            }
            (
                Operator::GreaterThan
                | Operator::GreaterOrEqual
                | Operator::LessThan
                | Operator::LessOrEqual,
                Value::Null,
            ) => Err(Error::InvalidFilter(format!(
                "{:?} on '{}' cannot compare against null",
                self.operator, self.field
            ))),
            _ => Ok(()),
        }
    }

    /// SQL fragment for this condition against the `fields` JSON column
    fn to_sql(&self, params: &mut Vec<SqlValue>) -> String {
        let expr = if self.field == PARENT_FIELD {
            PARENT_FIELD.to_string()
        } else {
            params.push(SqlValue::Text(format!("$.{}", self.field)));
            "json_extract(fields, ?)".to_string()
        };

        match self.operator {
            Operator::IsNull => format!("{expr} IS NULL"),
            Operator::IsNotNull => format!("{expr} IS NOT NULL"),
            Operator::Equals if self.value.is_null() => format!("{expr} IS NULL"),
            Operator::NotEquals if self.value.is_null() => format!("{expr} IS NOT NULL"),
            Operator::Equals => {
                params.push(sql_value(&self.value));
                format!("{expr} = ?")
            }
            Operator::NotEquals => {
                params.push(sql_value(&self.value));
                format!("{expr} IS NOT ?")
            }
            Operator::GreaterThan => {
                params.push(sql_value(&self.value));
                format!("{expr} > ?")
            }
            Operator::GreaterOrEqual => {
                params.push(sql_value(&self.value));
                format!("{expr} >= ?")
            }
            Operator::LessThan => {
                params.push(sql_value(&self.value));
                format!("{expr} < ?")
            }
            Operator::LessOrEqual => {
                params.push(sql_value(&self.value));
                format!("{expr} <= ?")
            }
            Operator::Contains => {
                params.push(sql_value(&self.value));
                format!("instr({expr}, ?) > 0")
            }
            Operator::BeginsWith => {
                let value = sql_value(&self.value);
                params.push(value.clone());
                params.push(value);
                format!("substr({expr}, 1, length(?)) = ?")
            }
        }
    }
}

/// Ordered list of conditions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// An empty filter that matches everything
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an `and` condition
    #[must_use]
    pub fn and(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.0
            .push(Condition::new(Combinator::And, field, operator, value));
        self
    }

    /// Append an `or` condition
    #[must_use]
    pub fn or(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.0
            .push(Condition::new(Combinator::Or, field, operator, value));
        self
    }

    /// Returns true if there are no conditions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of conditions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the conditions in evaluation order
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Parse conditions from their stored JSON form
    pub fn from_json(raw: &str) -> Result<Self> {
        let conditions: Self = serde_json::from_str(raw)
            .map_err(|error| Error::InvalidFilter(format!("malformed conditions: {error}")))?;
        conditions.validate_shape()?;
        Ok(conditions)
    }

    /// Stored JSON form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Stable short hash identifying this filter
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        short_digest(&canonical, 16)
    }

    /// Check operators and values without knowing the target schema
    pub fn validate_shape(&self) -> Result<()> {
        self.0.iter().try_for_each(Condition::validate)
    }

    /// Check shape and that every field is known for the stream
    pub fn validate(&self, known_fields: &HashSet<String>) -> Result<()> {
        self.validate_shape()?;
        for condition in &self.0 {
            if condition.field != PARENT_FIELD && !known_fields.contains(&condition.field) {
                return Err(Error::InvalidFilter(format!(
                    "unknown field '{}'",
                    condition.field
                )));
            }
        }
        Ok(())
    }

    /// Render as a parameterized SQL predicate, folding left to right.
    ///
    /// Returns `None` for an empty filter.
    pub fn to_sql(&self) -> Option<(String, Vec<SqlValue>)> {
        let mut iter = self.0.iter();
        let first = iter.next()?;
        let mut params = Vec::new();
        let mut sql = first.to_sql(&mut params);
        for condition in iter {
            let fragment = condition.to_sql(&mut params);
            sql = format!("({sql}) {} ({fragment})", condition.combinator.sql());
        }
        Some((sql, params))
    }
}

impl FromIterator<Condition> for Conditions {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex"))
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || SqlValue::Real(number.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Null | Value::Array(_) | Value::Object(_) => SqlValue::Null,
    }
}

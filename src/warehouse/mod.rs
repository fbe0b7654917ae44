//! Access to the SQL warehouse holding the DORA gold tables.
//!
//! Values only reach the warehouse as native named parameters (`:name` markers bound by the
//! driver); statement text is never built from user input.

pub mod databricks;
pub mod fake;
mod manager;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::DoraResult;

pub use manager::{ConnectionManager, HealthReport, HealthStatus};

/// A value bound to a named `:marker` in a statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    String(String),
    Timestamp(DateTime<Utc>),
}

impl QueryParam {
    /// SQL type name sent alongside the value
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "STRING",
            Self::Timestamp(_) => "TIMESTAMP",
        }
    }

    /// Textual form used on the wire
    pub fn to_wire(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<DateTime<Utc>> for QueryParam {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// A SQL statement with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Short label used in logs and by test doubles
    pub kind: &'static str,
    pub sql: String,
    pub params: Vec<(String, QueryParam)>,
    /// Organization the statement runs on behalf of, for log context
    pub organization: Option<String>,
}

impl Statement {
    pub fn new(kind: &'static str, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            params: Vec::new(),
            organization: None,
        }
    }

    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn param(&self, name: &str) -> Option<&QueryParam> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// All string values bound under names starting with `prefix`, in bind order
    pub fn string_params(&self, prefix: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(n, _)| n.starts_with(prefix))
            .filter_map(|(_, v)| v.as_str())
            .collect()
    }
}

/// One result row keyed by column name.
///
/// The warehouse returns most values as strings; the getters accept both the textual and
/// the native JSON form and treat SQL NULL as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarehouseRow(Map<String, Value>);

impl WarehouseRow {
    pub fn from_columns(columns: &[String], values: Vec<Value>) -> Self {
        Self(columns.iter().cloned().zip(values).collect())
    }

    /// Build a row from a JSON object; anything else yields an empty row
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.0.get(column).filter(|v| !v.is_null())
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        match self.value(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Non-negative count; missing or malformed values count as zero
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn get_count(&self, column: &str) -> u64 {
        self.get_f64(column)
            .filter(|v| v.is_finite() && *v > 0.0)
            .map_or(0, |v| v.round() as u64)
    }

    pub fn get_string(&self, column: &str) -> Option<String> {
        match self.value(column)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn get_date(&self, column: &str) -> Option<NaiveDate> {
        let raw = self.get_string(column)?;
        let day = raw.get(..10)?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    pub fn get_timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        let raw = self.get_string(column)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Some(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    /// A distinct, sorted list of strings from an array column.
    ///
    /// Array columns arrive either as JSON arrays or as their JSON text.
    pub fn get_string_list(&self, column: &str) -> Vec<String> {
        let items = match self.value(column) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::String(text)) => serde_json::from_str::<Vec<Value>>(text).unwrap_or_default(),
            _ => Vec::new(),
        };
        let mut list: Vec<String> = items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s),
                _ => None,
            })
            .collect();
        list.sort();
        list.dedup();
        list
    }
}

/// Opens connections to a warehouse
#[async_trait]
pub trait WarehouseConnector: Send + Sync {
    async fn connect(&self) -> DoraResult<Arc<dyn WarehouseConnection>>;
}

/// A live warehouse connection shared by concurrent requests
#[async_trait]
pub trait WarehouseConnection: Send + Sync {
    /// Run one statement and fetch every result row.
    ///
    /// Any warehouse-side handle opened for the statement is released on every exit path.
    async fn execute(&self, statement: &Statement) -> DoraResult<Vec<WarehouseRow>>;

    async fn close(&self) {}
}

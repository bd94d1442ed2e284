use crate::ai::sanitize::{validate_sql, SqlRejection, ValidatedSql};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    /// Set when the server-side cap cut rows off.
    pub truncated: bool,
    pub execution_time_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
}

impl ResultTable {
    pub fn new(columns: Vec<ColumnDef>, rows: Vec<Vec<Value>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            truncated: false,
            execution_time_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Option<impl Iterator<Item = &Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().filter_map(move |row| row.get(idx)))
    }

    /// Row-per-object view used by the HTTP layer.
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(col, value)| (col.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

/// Rows a [`BoundQuery`] may return before it fails outright.
pub const BOUND_ROW_LIMIT: usize = 1_000_000;

/// Compiled-in statement with positional `$n` parameters.
///
/// The `'static` bound keeps callers from binding text assembled at runtime.
/// Not subject to the model-SQL row cap: results are complete or an error.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    pub sql: &'static str,
    pub params: Vec<String>,
}

impl BoundQuery {
    pub fn new(sql: &'static str, params: Vec<String>) -> Self {
        Self { sql, params }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("statement refused by executor: {0}")]
    Refused(#[from] SqlRejection),
    #[error("query failed: {0}")]
    Query(String),
    #[error("query exceeded the {0:?} timeout")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl ExecutorError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::Refused(r) => r.kind(),
            ExecutorError::Timeout(_) => "query_timeout",
            ExecutorError::Query(_) | ExecutorError::Unavailable(_) => "query_execution_failure",
        }
    }
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(e: rusqlite::Error) -> Self {
        ExecutorError::Query(e.to_string())
    }
}

impl From<tokio_postgres::Error> for ExecutorError {
    fn from(e: tokio_postgres::Error) -> Self {
        ExecutorError::Query(e.to_string())
    }
}

/// Read-only access to the relational store.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run model-generated SQL. Implementations re-check the statement shape
    /// and cap the returned rows regardless of the statement's own LIMIT.
    async fn execute(&self, sql: &ValidatedSql) -> Result<ResultTable, ExecutorError>;

    /// Run a fixed internal statement with bound parameters. Returns every
    /// row, failing once [`BOUND_ROW_LIMIT`] is exceeded.
    async fn execute_bound(&self, query: BoundQuery) -> Result<ResultTable, ExecutorError>;

    /// Cheap liveness probe for health reporting.
    async fn ping(&self) -> bool;
}

/// Re-validate at the store boundary; the result must be unchanged.
pub(crate) fn recheck(sql: &ValidatedSql) -> Result<(), ExecutorError> {
    let again = validate_sql(sql.as_str())?;
    if again.as_str() != sql.as_str() {
        return Err(ExecutorError::Query("statement changed under re-validation".into()));
    }
    Ok(())
}

/// Fail a bound-query result that hit its row limit.
pub(crate) fn require_complete(table: ResultTable, limit: usize) -> Result<ResultTable, ExecutorError> {
    if table.truncated {
        return Err(ExecutorError::Query(format!(
            "internal query returned more than {limit} rows"
        )));
    }
    Ok(table)
}

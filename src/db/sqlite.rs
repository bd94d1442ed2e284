use super::query::{recheck, require_complete, BoundQuery, BOUND_ROW_LIMIT, ColumnDef, ExecutorError, QueryExecutor, ResultTable};
use crate::ai::sanitize::ValidatedSql;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Executes against the SQLite bank store.
///
/// Every query gets its own read-only connection, so concurrent requests
/// never share a handle and never take a write lock.
pub struct SqliteExecutor {
    path: PathBuf,
    row_cap: usize,
    timeout: Duration,
}

impl SqliteExecutor {
    pub fn new(path: impl Into<PathBuf>, row_cap: usize, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            row_cap,
            timeout,
        }
    }

    fn open(&self) -> Result<Connection, ExecutorError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ExecutorError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }

    async fn run(&self, sql: String, params: Vec<String>, cap: usize) -> Result<ResultTable, ExecutorError> {
        let conn = self.open()?;
        let interrupt = conn.get_interrupt_handle();

        let task = tokio::task::spawn_blocking(move || query_capped(&conn, &sql, &params, cap));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined.map_err(|e| ExecutorError::Query(format!("query task failed: {e}")))?,
            Err(_) => {
                warn!(timeout = ?self.timeout, "interrupting long-running query");
                interrupt.interrupt();
                Err(ExecutorError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, sql: &ValidatedSql) -> Result<ResultTable, ExecutorError> {
        recheck(sql)?;
        self.run(sql.as_str().to_string(), Vec::new(), self.row_cap).await
    }

    async fn execute_bound(&self, query: BoundQuery) -> Result<ResultTable, ExecutorError> {
        let table = self.run(query.sql.to_string(), query.params, BOUND_ROW_LIMIT).await?;
        require_complete(table, BOUND_ROW_LIMIT)
    }

    async fn ping(&self) -> bool {
        let conn = match self.open() {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        tokio::task::spawn_blocking(move || conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok())
            .await
            .unwrap_or(false)
    }
}

fn query_capped(
    conn: &Connection,
    sql: &str,
    params: &[String],
    cap: usize,
) -> Result<ResultTable, ExecutorError> {
    let start = Instant::now();
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(ExecutorError::Query("statement is not read-only".into()));
    }

    let columns: Vec<ColumnDef> = stmt
        .columns()
        .iter()
        .map(|col| ColumnDef {
            name: col.name().to_string(),
            data_type: col.decl_type().unwrap_or("").to_string(),
        })
        .collect();
    let width = columns.len();

    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut result_rows = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next()? {
        if result_rows.len() == cap {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(sqlite_value_to_json(row.get_ref(i)?));
        }
        result_rows.push(values);
    }

    let mut table = ResultTable::new(columns, result_rows);
    table.truncated = truncated;
    table.execution_time_ms = start.elapsed().as_millis();
    debug!(rows = table.row_count, truncated, "sqlite query finished");
    Ok(table)
}

fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::sanitize::validate_sql;
    use serde_json::json;
    use tempfile::TempDir;

    fn seeded(rows: usize) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE account (account_id TEXT PRIMARY KEY, account_currency TEXT, balance REAL);",
        )
        .unwrap();
        for i in 0..rows {
            conn.execute(
                "INSERT INTO account VALUES (?1, ?2, ?3)",
                rusqlite::params![format!("ACC-{i}"), "CHF", i as f64 * 1.5],
            )
            .unwrap();
        }
        (dir, path)
    }

    #[tokio::test]
    async fn returns_typed_columns_and_values() {
        let (_dir, path) = seeded(3);
        let exec = SqliteExecutor::new(&path, 100, Duration::from_secs(5));
        let sql = validate_sql("SELECT account_id, balance FROM account ORDER BY account_id").unwrap();
        let table = exec.execute(&sql).await.unwrap();
        assert_eq!(table.column_names(), vec!["account_id", "balance"]);
        assert_eq!(table.columns[0].data_type, "TEXT");
        assert_eq!(table.rows[1], vec![json!("ACC-1"), json!(1.5)]);
        assert!(!table.truncated);
    }

    #[tokio::test]
    async fn caps_rows_even_when_limit_is_larger() {
        let (_dir, path) = seeded(20);
        let exec = SqliteExecutor::new(&path, 5, Duration::from_secs(5));
        let sql = validate_sql("SELECT account_id FROM account LIMIT 1000").unwrap();
        let table = exec.execute(&sql).await.unwrap();
        assert_eq!(table.row_count, 5);
        assert!(table.truncated);
    }

    #[tokio::test]
    async fn bound_queries_ignore_the_row_cap() {
        let (_dir, path) = seeded(20);
        let exec = SqliteExecutor::new(&path, 5, Duration::from_secs(5));
        let table = exec
            .execute_bound(BoundQuery::new("SELECT account_id FROM account", vec![]))
            .await
            .unwrap();
        assert_eq!(table.row_count, 20);
        assert!(!table.truncated);
    }

    #[tokio::test]
    async fn binds_positional_parameters() {
        let (_dir, path) = seeded(4);
        let exec = SqliteExecutor::new(&path, 100, Duration::from_secs(5));
        let table = exec
            .execute_bound(BoundQuery::new(
                "SELECT account_id FROM account WHERE account_id = $1",
                vec!["ACC-2".into()],
            ))
            .await
            .unwrap();
        assert_eq!(table.rows, vec![vec![json!("ACC-2")]]);

        // quotes in parameters are data, not SQL
        let none = exec
            .execute_bound(BoundQuery::new(
                "SELECT account_id FROM account WHERE account_id = $1",
                vec!["x' OR '1'='1".into()],
            ))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn refuses_writes_on_the_bound_path() {
        let (_dir, path) = seeded(1);
        let exec = SqliteExecutor::new(&path, 100, Duration::from_secs(5));
        let err = exec
            .execute_bound(BoundQuery::new("DELETE FROM account", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Query(_)));
    }

    #[tokio::test]
    async fn unknown_column_is_an_execution_failure() {
        let (_dir, path) = seeded(1);
        let exec = SqliteExecutor::new(&path, 100, Duration::from_secs(5));
        let sql = validate_sql("SELECT no_such_column FROM account").unwrap();
        let err = exec.execute(&sql).await.unwrap_err();
        assert_eq!(err.kind(), "query_execution_failure");
    }

    #[tokio::test]
    async fn runaway_query_is_interrupted() {
        let (_dir, path) = seeded(1);
        let exec = SqliteExecutor::new(&path, 100, Duration::from_millis(50));
        let err = exec
            .execute_bound(BoundQuery::new(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c",
                vec![],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
    }

    #[tokio::test]
    async fn missing_store_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(dir.path().join("absent.db"), 10, Duration::from_secs(1));
        assert!(!exec.ping().await);
        let sql = validate_sql("SELECT 1").unwrap();
        assert!(matches!(exec.execute(&sql).await, Err(ExecutorError::Unavailable(_))));
    }
}

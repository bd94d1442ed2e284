use super::query::{recheck, require_complete, BoundQuery, BOUND_ROW_LIMIT, ColumnDef, ExecutorError, QueryExecutor, ResultTable};
use crate::ai::sanitize::ValidatedSql;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Client;

/// Executes against a PostgreSQL copy of the bank store.
///
/// `tokio_postgres::Client` pipelines concurrent queries over one connection,
/// so a single shared client serves all requests.
pub struct PostgresExecutor {
    client: Client,
    row_cap: usize,
    timeout: Duration,
}

impl PostgresExecutor {
    /// Sets a server-side `statement_timeout` matching the client-side one.
    pub async fn new(client: Client, row_cap: usize, timeout: Duration) -> Result<Self, ExecutorError> {
        client
            .batch_execute(&format!(
                "SET statement_timeout = {}; SET default_transaction_read_only = on",
                timeout.as_millis()
            ))
            .await?;
        Ok(Self {
            client,
            row_cap,
            timeout,
        })
    }

    async fn run(&self, sql: &str, params: &[String], cap: usize) -> Result<ResultTable, ExecutorError> {
        let start = Instant::now();
        let work = async {
            let stmt = self.client.prepare(sql).await?;
            let bound: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let rows = self.client.query(&stmt, &bound).await?;
            Ok::<_, ExecutorError>((stmt, rows))
        };
        let (stmt, rows) = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| ExecutorError::Timeout(self.timeout))??;

        let columns: Vec<ColumnDef> = stmt
            .columns()
            .iter()
            .map(|col| ColumnDef {
                name: col.name().to_string(),
                data_type: pg_type_to_string(col.type_()),
            })
            .collect();

        let truncated = rows.len() > cap;
        let result_rows: Vec<Vec<serde_json::Value>> = rows
            .iter()
            .take(cap)
            .map(|row| {
                stmt.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, col)| pg_value_to_json(row, i, col.type_()))
                    .collect()
            })
            .collect();

        let mut table = ResultTable::new(columns, result_rows);
        table.truncated = truncated;
        table.execution_time_ms = start.elapsed().as_millis();
        Ok(table)
    }
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    async fn execute(&self, sql: &ValidatedSql) -> Result<ResultTable, ExecutorError> {
        recheck(sql)?;
        self.run(sql.as_str(), &[], self.row_cap).await
    }

    async fn execute_bound(&self, query: BoundQuery) -> Result<ResultTable, ExecutorError> {
        let table = self.run(query.sql, &query.params, BOUND_ROW_LIMIT).await?;
        require_complete(table, BOUND_ROW_LIMIT)
    }

    async fn ping(&self) -> bool {
        self.client.simple_query("SELECT 1").await.is_ok()
    }
}

fn pg_type_to_string(pg_type: &Type) -> String {
    match *pg_type {
        Type::BOOL => "boolean".into(),
        Type::INT2 => "smallint".into(),
        Type::INT4 => "integer".into(),
        Type::INT8 => "bigint".into(),
        Type::FLOAT4 => "real".into(),
        Type::FLOAT8 => "double precision".into(),
        Type::NUMERIC => "numeric".into(),
        Type::VARCHAR => "varchar".into(),
        Type::TEXT => "text".into(),
        Type::BPCHAR => "char".into(),
        Type::TIMESTAMP => "timestamp".into(),
        Type::TIMESTAMPTZ => "timestamptz".into(),
        Type::DATE => "date".into(),
        Type::UUID => "uuid".into(),
        Type::JSON => "json".into(),
        Type::JSONB => "jsonb".into(),
        _ => pg_type.name().to_string(),
    }
}

fn pg_value_to_json(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> serde_json::Value {
    use serde_json::Value;

    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

use super::ddl::{create_bank_tables, Coercion, TableSpec, BANK_TABLES};
use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

#[derive(Debug, Clone, Serialize)]
pub struct TableLoad {
    pub table: String,
    pub rows: usize,
    /// Non-empty cells that failed coercion and were stored as NULL.
    pub coerced_to_null: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub tables: Vec<TableLoad>,
}

impl LoadReport {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

/// Rebuild the bank store at `db_path` from `<data_dir>/<table>.csv`.
///
/// Tables are built in a sibling file that replaces `db_path` only once every
/// table has committed, so a failed load leaves any previous store untouched.
pub fn load_store(db_path: &Path, data_dir: &Path) -> Result<LoadReport> {
    let staging = staging_path(db_path);
    if staging.exists() {
        fs::remove_file(&staging)
            .with_context(|| format!("failed to remove stale {}", staging.display()))?;
    }

    match build_store(&staging, data_dir) {
        Ok(report) => {
            fs::rename(&staging, db_path).with_context(|| {
                format!("failed to move {} to {}", staging.display(), db_path.display())
            })?;
            Ok(report)
        }
        Err(err) => {
            if let Err(rm) = fs::remove_file(&staging) {
                warn!(path = %staging.display(), error = %rm, "failed to remove partial store");
            }
            Err(err)
        }
    }
}

fn staging_path(db_path: &Path) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(".loading");
    PathBuf::from(name)
}

fn build_store(path: &Path, data_dir: &Path) -> Result<LoadReport> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    // source extracts carry dangling references; keep them as plain values
    conn.pragma_update(None, "foreign_keys", false)?;
    create_bank_tables(&conn)?;

    let mut report = LoadReport::default();
    for spec in BANK_TABLES {
        let csv_path = data_dir.join(spec.csv_file());
        let load = load_table(&mut conn, spec, &csv_path)
            .with_context(|| format!("failed to load {}", csv_path.display()))?;
        if load.coerced_to_null > 0 {
            warn!(table = spec.name, cells = load.coerced_to_null, "unparseable cells stored as NULL");
        }
        info!(table = spec.name, rows = load.rows, "table loaded");
        report.tables.push(load);
    }
    Ok(report)
}

fn load_table(conn: &mut Connection, spec: &TableSpec, csv_path: &Path) -> Result<TableLoad> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let mut coercions = Vec::with_capacity(headers.len());
    for header in &headers {
        match spec.coercion(header) {
            Some(c) => coercions.push(c),
            None => bail!("column {:?} is not part of table {}", header, spec.name),
        }
    }

    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        spec.name,
        headers
            .iter()
            .map(|h| quote_ident(h))
            .collect::<Vec<_>>()
            .join(", "),
        (1..=headers.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let tx = conn.transaction()?;
    let mut rows = 0;
    let mut coerced_to_null = 0;
    {
        let mut stmt = tx.prepare(&insert)?;
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("bad record at row {}", line + 1))?;
            let mut values = Vec::with_capacity(coercions.len());
            for (i, coercion) in coercions.iter().enumerate() {
                let raw = record.get(i).unwrap_or("");
                let value = coerce(raw, *coercion);
                if value == SqlValue::Null && !raw.trim().is_empty() {
                    coerced_to_null += 1;
                }
                values.push(value);
            }
            stmt.execute(rusqlite::params_from_iter(values))?;
            rows += 1;
        }
    }
    tx.commit()?;

    Ok(TableLoad {
        table: spec.name.to_string(),
        rows,
        coerced_to_null,
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert one CSV cell. Empty cells and unparseable values become NULL.
pub fn coerce(raw: &str, coercion: Coercion) -> SqlValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return SqlValue::Null;
    }
    match coercion {
        Coercion::Text => SqlValue::Text(raw.to_string()),
        Coercion::Date => parse_date(trimmed)
            .map(|d| SqlValue::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(SqlValue::Null),
        Coercion::DateTime => parse_datetime(trimmed)
            .map(|d| SqlValue::Text(d.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(SqlValue::Null),
        Coercion::Numeric => {
            if let Ok(i) = trimmed.parse::<i64>() {
                SqlValue::Integer(i)
            } else {
                match trimmed.parse::<f64>() {
                    Ok(f) if f.is_finite() => SqlValue::Real(f),
                    _ => SqlValue::Null,
                }
            }
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if let Some(d) = DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
    {
        return Some(d);
    }
    if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().ok().and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1));
    }
    parse_datetime(s).map(|dt| dt.date())
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_all_csvs(dir: &Path) {
        for spec in BANK_TABLES {
            let header = spec
                .columns
                .iter()
                .map(|(n, _)| n.to_string())
                .collect::<Vec<_>>()
                .join(",");
            fs::write(dir.join(spec.csv_file()), format!("{header}\n")).unwrap();
        }
    }

    #[test]
    fn coerces_cells() {
        assert_eq!(coerce("", Coercion::Text), SqlValue::Null);
        assert_eq!(coerce("  ", Coercion::Numeric), SqlValue::Null);
        assert_eq!(coerce("3", Coercion::Numeric), SqlValue::Integer(3));
        assert_eq!(coerce("12.50", Coercion::Numeric), SqlValue::Real(12.5));
        assert_eq!(coerce("n/a", Coercion::Numeric), SqlValue::Null);
        assert_eq!(coerce("NaN", Coercion::Numeric), SqlValue::Null);
        assert_eq!(coerce("2021-03-04", Coercion::Date), SqlValue::Text("2021-03-04".into()));
        assert_eq!(coerce("03/04/2021", Coercion::Date), SqlValue::Text("2021-03-04".into()));
        assert_eq!(coerce("1985", Coercion::Date), SqlValue::Text("1985-01-01".into()));
        assert_eq!(
            coerce("2021-03-04 10:00:00", Coercion::Date),
            SqlValue::Text("2021-03-04".into())
        );
        assert_eq!(coerce("yesterday", Coercion::Date), SqlValue::Null);
        assert_eq!(
            coerce("2021-03-04T10:15:30", Coercion::DateTime),
            SqlValue::Text("2021-03-04 10:15:30".into())
        );
        assert_eq!(
            coerce("2021-03-04", Coercion::DateTime),
            SqlValue::Text("2021-03-04 00:00:00".into())
        );
        assert_eq!(
            coerce("2021-03-04T10:15:30+02:00", Coercion::DateTime),
            SqlValue::Text("2021-03-04 08:15:30".into())
        );
    }

    #[test]
    fn loads_csvs_into_typed_tables() {
        let dir = tempfile::tempdir().unwrap();
        write_all_csvs(dir.path());
        fs::write(
            dir.path().join("transactions.csv"),
            "Transaction ID,Debit/Credit,Account ID,Amount,Balance,Currency,Date\n\
             T1,Debit,A1,100.5,900,CHF,2023-01-05 09:30:00\n\
             T2,Credit,A1,oops,,CHF,not a date\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("br_to_account.csv"),
            "br_id,account_id,relationship_id,relationship_status_code\nBR1,A1,R1,1\n",
        )
        .unwrap();

        let db = dir.path().join("bank.db");
        let report = load_store(&db, dir.path()).unwrap();
        assert_eq!(report.tables.len(), BANK_TABLES.len());
        assert_eq!(report.total_rows(), 3);
        let tx = report.tables.iter().find(|t| t.table == "transactions").unwrap();
        assert_eq!(tx.rows, 2);
        assert_eq!(tx.coerced_to_null, 2);

        let conn = Connection::open(&db).unwrap();
        let (amount, date, ext): (Option<f64>, Option<String>, Option<String>) = conn
            .query_row(
                "SELECT Amount, Date, ext_counterparty_country FROM transactions WHERE \"Transaction ID\" = 'T1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(amount, Some(100.5));
        assert_eq!(date.as_deref(), Some("2023-01-05 09:30:00"));
        assert_eq!(ext, None);

        let (amount, balance): (Option<f64>, Option<f64>) = conn
            .query_row(
                "SELECT Amount, Balance FROM transactions WHERE \"Transaction ID\" = 'T2'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((amount, balance), (None, None));

        let status: i64 = conn
            .query_row("SELECT relationship_status_code FROM br_to_account", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, 1);
    }

    #[test]
    fn reload_replaces_previous_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_all_csvs(dir.path());
        fs::write(dir.path().join("account.csv"), "account_id,account_currency\nA1,CHF\nA2,EUR\n").unwrap();
        let db = dir.path().join("bank.db");

        load_store(&db, dir.path()).unwrap();
        let report = load_store(&db, dir.path()).unwrap();
        assert_eq!(report.total_rows(), 2);
    }

    #[test]
    fn unknown_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_all_csvs(dir.path());
        fs::write(dir.path().join("account.csv"), "account_id,password\nA1,secret\n").unwrap();

        let err = load_store(&dir.path().join("bank.db"), dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("password"));
    }

    #[test]
    fn missing_csv_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bank.db");
        let err = load_store(&db, dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("account.csv"));
        assert!(!db.exists());
        assert!(!staging_path(&db).exists());
    }

    #[test]
    fn failed_reload_keeps_previous_store() {
        let dir = tempfile::tempdir().unwrap();
        write_all_csvs(dir.path());
        fs::write(dir.path().join("account.csv"), "account_id\nA1\n").unwrap();
        let db = dir.path().join("bank.db");
        load_store(&db, dir.path()).unwrap();

        fs::remove_file(dir.path().join("partner.csv")).unwrap();
        assert!(load_store(&db, dir.path()).is_err());

        let conn = Connection::open(&db).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM account", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn dangling_references_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        write_all_csvs(dir.path());
        fs::write(dir.path().join("account.csv"), "account_id\nA1\n").unwrap();
        fs::write(
            dir.path().join("transactions.csv"),
            "Transaction ID,Account ID,Amount,counterparty_Account_ID\nT1,A1,5,A999\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("partner_role.csv"),
            "partner_id,associated_partner_id,entity_type,entity_id\nP404,P405,BR,BR1\n",
        )
        .unwrap();

        let db = dir.path().join("bank.db");
        let report = load_store(&db, dir.path()).unwrap();
        assert_eq!(report.total_rows(), 3);

        let conn = Connection::open(&db).unwrap();
        let counterparty: String = conn
            .query_row("SELECT counterparty_Account_ID FROM transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(counterparty, "A999");
    }
}

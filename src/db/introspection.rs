use crate::ai::{ColumnContext, TableContext};
use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub table_type: String, // "table" or "view"
}

#[derive(Debug, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub ordinal_position: i32,
}

pub fn get_tables(conn: &Connection) -> Result<Vec<TableInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name, type FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TableInfo {
            name: row.get(0)?,
            table_type: row.get(1)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare("SELECT cid, name, type, \"notnull\", pk FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| {
        Ok(ColumnInfo {
            ordinal_position: row.get(0)?,
            name: row.get(1)?,
            data_type: row.get(2)?,
            is_nullable: row.get::<_, i64>(3)? == 0,
            is_primary_key: row.get::<_, i64>(4)? > 0,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Build prompt-ready table definitions from a live store.
pub fn describe_store(path: &Path) -> Result<Vec<TableContext>> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut tables = Vec::new();
    for table in get_tables(&conn)? {
        let columns = get_columns(&conn, &table.name)?;
        tables.push(TableContext {
            name: table.name,
            columns: columns
                .into_iter()
                .map(|c| ColumnContext {
                    name: c.name,
                    data_type: c.data_type,
                    nullable: c.is_nullable && !c.is_primary_key,
                })
                .collect(),
        });
    }
    Ok(tables)
}

mod ddl;
mod loader;

pub use ddl::*;
pub use loader::*;

use anyhow::Result;
use std::path::Path;
use tracing::info;

/// Loads the store only when `db_path` does not exist yet.
pub fn ensure_store(db_path: &Path, data_dir: &Path) -> Result<Option<LoadReport>> {
    if db_path.exists() {
        return Ok(None);
    }
    info!(db = %db_path.display(), data = %data_dir.display(), "initializing bank store");
    load_store(db_path, data_dir).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn failed_first_load_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bank.db");

        assert!(ensure_store(&db, dir.path()).is_err());
        assert!(ensure_store(&db, dir.path()).is_err());

        for spec in BANK_TABLES {
            let header: Vec<&str> = spec.columns.iter().map(|(n, _)| *n).collect();
            fs::write(dir.path().join(spec.csv_file()), format!("{}\n", header.join(","))).unwrap();
        }
        assert!(ensure_store(&db, dir.path()).unwrap().is_some());
        assert!(ensure_store(&db, dir.path()).unwrap().is_none());
    }
}

//! SQLite plumbing shared by the identity, peer and relay stores.
//!
//! Every operation opens its own connection and wraps its reads and writes in
//! a transaction. Read-modify-write paths use `BEGIN IMMEDIATE` so concurrent
//! callers (the shell and the background relay ticker) serialize in SQLite
//! rather than racing; the busy timeout turns contention into waiting.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, Row, Transaction, TransactionBehavior, types::Type};

use crate::error::AppError;

const BUSY_TIMEOUT_MS: i64 = 5000;

/// Handle to the node database. Cheap to clone; holds only the path.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Create the parent directory if needed and verify the file opens.
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let db = Self { path: path.to_path_buf() };
        db.connect()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection with WAL, foreign keys and a busy timeout applied.
    pub fn connect(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.path).map_err(|e| {
            AppError::Storage(format!("open {}: {e}", self.path.display()))
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::Storage(format!("set journal_mode WAL: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| AppError::Storage(format!("set foreign_keys ON: {e}")))?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
            .map_err(|e| AppError::Storage(format!("set busy_timeout: {e}")))?;
        Ok(conn)
    }

    /// Run `f` inside a write transaction (`BEGIN IMMEDIATE`); commits on `Ok`,
    /// rolls back on `Err`.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AppError::Storage(format!("begin tx: {e}")))?;
        let out = f(&tx)?;
        tx.commit()
            .map_err(|e| AppError::Storage(format!("commit: {e}")))?;
        Ok(out)
    }

    /// Run `f` inside a deferred (read) transaction for a consistent snapshot.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| AppError::Storage(format!("begin tx: {e}")))?;
        f(&tx)
    }
}

/// Fail with [`AppError::Storage`] when an existing `table` lacks any of
/// `columns`. A missing table passes; `CREATE TABLE IF NOT EXISTS` follows.
pub(crate) fn check_columns(
    conn: &Connection,
    table: &str,
    columns: &[&str],
) -> Result<(), AppError> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .map_err(|e| AppError::Storage(format!("inspect {table}: {e}")))?;
    let present = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if present.is_empty() {
        return Ok(());
    }
    let missing: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !present.iter().any(|p| p == c))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::Storage(format!(
            "incompatible schema: table '{table}' is missing column(s) {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Timestamps are stored as unix milliseconds so SQLite can order and compare
/// them directly.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Read a unix-millis column. A value outside chrono's range is a conversion
/// failure, not a default.
pub(crate) fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(idx, row.get(idx)?)
}

pub(crate) fn opt_millis_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_millis(idx, ms))
        .transpose()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {ms} ms is out of range").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("node.db");
        let db = Database::open(&path).unwrap();
        assert!(db.path().exists());
    }

    #[test]
    fn failed_write_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(&tmp.path().join("node.db")).unwrap();
        db.write(|tx| {
            tx.execute_batch("CREATE TABLE t (v INTEGER)")?;
            Ok(())
        })
        .unwrap();

        let result: Result<(), AppError> = db.write(|tx| {
            tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Err(AppError::Validation("nope".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .read(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn check_columns_reports_missing() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(&tmp.path().join("node.db")).unwrap();
        let conn = db.connect().unwrap();
        check_columns(&conn, "absent", &["a"]).unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT)").unwrap();
        check_columns(&conn, "t", &["a"]).unwrap();
        let err = check_columns(&conn, "t", &["a", "b"]).unwrap_err();
        assert!(err.to_string().contains("missing column(s) b"));
    }

    #[test]
    fn millis_round_trip() {
        let now = from_millis(0, to_millis(Utc::now())).unwrap();
        assert_eq!(from_millis(0, to_millis(now)).unwrap(), now);
    }

    #[test]
    fn out_of_range_timestamp_is_a_conversion_error() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(&tmp.path().join("node.db")).unwrap();
        let err = db
            .read(|tx| {
                Ok(tx.query_row("SELECT ?1, NULL", [i64::MAX], |row| {
                    assert_eq!(opt_millis_column(row, 1)?, None);
                    millis_column(row, 0)
                })?)
            })
            .unwrap_err();
        assert!(matches!(err, AppError::Storage(ref m) if m.contains("out of range")), "{err}");
    }
}

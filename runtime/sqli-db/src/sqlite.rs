//! SQLite connector helpers for the sqli engine.

use crate::error::{DbError, Result};
use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, OpenFlags, ffi};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const SQLITE_OK: i32 = ffi::SQLITE_OK;
pub const SQLITE_ERROR: i32 = ffi::SQLITE_ERROR;
pub const SQLITE_ABORT: i32 = ffi::SQLITE_ABORT;
pub const SQLITE_CANTOPEN: i32 = ffi::SQLITE_CANTOPEN;

const MEMORY_PATH: &str = ":memory:";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqliteOpenMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// What the row consumer wants after seeing a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowFlow {
    Continue,
    Abort,
}

pub fn is_memory_path(path: &Path) -> bool {
    path.as_os_str() == MEMORY_PATH
}

pub struct SqliteConn {
    conn: Connection,
}

impl SqliteConn {
    pub fn open(path: &Path, mode: SqliteOpenMode, busy_timeout: Duration) -> Result<Self> {
        let flags = match mode {
            SqliteOpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            SqliteOpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        let shown = path.display().to_string();
        let conn =
            Connection::open_with_flags(path, flags).map_err(|err| DbError::open(&shown, err))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|err| DbError::open(&shown, err))?;
        if matches!(mode, SqliteOpenMode::ReadOnly) {
            conn.execute_batch("PRAGMA query_only = 1;")
                .map_err(|err| DbError::open(&shown, err))?;
        }
        debug!(path = %shown, ?mode, "sqlite connection opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|err| DbError::open(MEMORY_PATH, err))?;
        Ok(Self { conn })
    }

    /// Runs every statement in `sql`, in order, handing each result row to
    /// `on_row` as column names plus text values (`None` for SQL NULL).
    ///
    /// Statements that produce no rows never reach `on_row`. Returning
    /// [`RowFlow::Abort`] stops delivery and fails with [`DbError::Aborted`].
    pub fn exec<F>(&self, sql: &str, mut on_row: F) -> Result<()>
    where
        F: FnMut(&[String], &[Option<String>]) -> RowFlow,
    {
        let mut batch = Batch::new(&self.conn, sql);
        while let Some(mut stmt) = batch.next().map_err(DbError::statement)? {
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let mut rows = stmt.query([]).map_err(DbError::statement)?;
            while let Some(row) = rows.next().map_err(DbError::statement)? {
                let mut values = Vec::with_capacity(columns.len());
                for idx in 0..columns.len() {
                    let value = row.get_ref(idx).map_err(DbError::statement)?;
                    values.push(value_text(value));
                }
                if on_row(&columns, &values) == RowFlow::Abort {
                    return Err(DbError::Aborted);
                }
            }
        }
        Ok(())
    }

    pub fn last_insert_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> u64 {
        self.conn.changes()
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| DbError::statement(err))
    }
}

/// Text form of a column value as `sqlite3_exec` hands it to its callback.
///
/// SQL NULL becomes `None`. BLOB bytes are read as UTF-8, with invalid
/// sequences replaced by U+FFFD.
fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(n) => Some(n.to_string()),
        ValueRef::Real(f) => Some(real_text(f)),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

const REAL_DIGITS: usize = 15;

// SQLite's `%!.15g`: 15 significant digits, trailing zeros dropped but at
// least one fractional digit kept, exponent form outside 1e-4..1e15.
fn real_text(f: f64) -> String {
    if f.is_infinite() {
        return if f > 0.0 { "Inf" } else { "-Inf" }.to_string();
    }
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f == 0.0 {
        return "0.0".to_string();
    }
    let scientific = format!("{:.*e}", REAL_DIGITS - 1, f);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return f.to_string();
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return f.to_string();
    };
    let sign = if mantissa.starts_with('-') { "-" } else { "" };
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    if exponent < -4 || exponent >= REAL_DIGITS as i32 {
        let (lead, rest) = digits.split_at(1);
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{sign}{lead}.{}e{exp_sign}{:02}",
            fraction(rest),
            exponent.unsigned_abs()
        )
    } else if exponent >= 0 {
        let (whole, rest) = digits.split_at(exponent as usize + 1);
        format!("{sign}{whole}.{}", fraction(rest))
    } else {
        let zeros = "0".repeat(exponent.unsigned_abs() as usize - 1);
        format!("{sign}0.{zeros}{}", fraction(&digits))
    }
}

fn fraction(digits: &str) -> &str {
    match digits.trim_end_matches('0') {
        "" => "0",
        kept => kept,
    }
}

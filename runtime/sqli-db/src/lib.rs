//! Embedded SQLite boundary for the sqli query engine.
//!
//! The engine treats SQLite as a black box: open a file, run statement text
//! with a per-row consumer, read back the last insert id and the number of
//! changed rows, close. Everything here runs on whichever thread holds the
//! connection; synchronisation is the caller's job.

mod error;
mod sqlite;

pub use error::{DbError, Result};
pub use sqlite::{
    RowFlow, SQLITE_ABORT, SQLITE_CANTOPEN, SQLITE_ERROR, SQLITE_OK, SqliteConn, SqliteOpenMode,
    is_memory_path,
};

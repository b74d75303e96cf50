use std::io;
use std::path::PathBuf;

use sqli_db::DbError;
use thiserror::Error;

use crate::host::ObjectId;

pub type Result<T> = std::result::Result<T, SqliError>;

#[derive(Debug, Error)]
pub enum SqliError {
    /// The worker could not open the database; the engine never becomes usable.
    #[error("can't open database: {message} (code {code})")]
    OpenFailure { code: i32, message: String },
    /// One statement failed; only that request is affected.
    #[error("statement failed: {message} (code {code})")]
    StatementFailure { code: i32, message: String },
    #[error("query engine is not initialized")]
    NotInitialized,
    #[error("query engine is shutting down")]
    ShuttingDown,
    #[error("query engine is already initialized")]
    AlreadyInitialized,
    #[error("can't find database file {}", .0.display())]
    DatabaseNotFound(PathBuf),
    #[error("result handle {0} is still being processed")]
    Busy(ObjectId),
    #[error("field index {index} out of range ({count} fields)")]
    FieldOutOfRange { index: usize, count: usize },
    #[error("field `{0}` not found")]
    UnknownField(String),
    #[error("no current record; call next_record() first")]
    NoCurrentRecord,
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SqliError {
    pub(crate) fn from_statement(err: &DbError) -> Self {
        SqliError::StatementFailure {
            code: err.code(),
            message: err.message(),
        }
    }

    /// SQLite status code for database failures, `None` for usage errors.
    pub fn code(&self) -> Option<i32> {
        match self {
            SqliError::OpenFailure { code, .. } | SqliError::StatementFailure { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }
}

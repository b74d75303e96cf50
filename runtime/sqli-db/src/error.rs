use thiserror::Error;

use crate::sqlite::{SQLITE_ABORT, SQLITE_ERROR};

pub type Result<T> = std::result::Result<T, DbError>;

/// Failure reported by the embedded engine, reduced to a status code and text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("can't open database {path}: {message} (code {code})")]
    Open {
        path: String,
        code: i32,
        message: String,
    },
    #[error("{message} (code {code})")]
    Statement { code: i32, message: String },
    /// The row consumer asked to stop delivery.
    #[error("query aborted by the row consumer")]
    Aborted,
}

impl DbError {
    pub(crate) fn open(path: &str, err: rusqlite::Error) -> Self {
        DbError::Open {
            path: path.to_string(),
            code: status_code(&err),
            message: err.to_string(),
        }
    }

    pub(crate) fn statement(err: rusqlite::Error) -> Self {
        DbError::Statement {
            code: status_code(&err),
            message: err.to_string(),
        }
    }

    /// Primary SQLite result code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            DbError::Open { code, .. } | DbError::Statement { code, .. } => *code,
            DbError::Aborted => SQLITE_ABORT,
        }
    }

    pub fn message(&self) -> String {
        match self {
            DbError::Open { message, .. } | DbError::Statement { message, .. } => message.clone(),
            DbError::Aborted => "query aborted".to_string(),
        }
    }
}

fn status_code(err: &rusqlite::Error) -> i32 {
    // Extended codes carry the primary code in the low byte.
    err.sqlite_error()
        .map(|inner| inner.extended_code & 0xff)
        .unwrap_or(SQLITE_ERROR)
}

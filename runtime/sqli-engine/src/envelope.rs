use std::fmt;
use std::sync::Arc;

use crate::result_handle::ResultHandle;

/// Lists every table with its schema text.
pub const TABLE_DUMP_SQL: &str = "SELECT name, sql FROM sqlite_master WHERE type='table';";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Stub,
    Generic,
    Select,
    Update,
    Exclusive,
    TableDump,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Stub => "stub",
            RequestKind::Generic => "generic",
            RequestKind::Select => "select",
            RequestKind::Update => "update",
            RequestKind::Exclusive => "exclusive",
            RequestKind::TableDump => "table_dump",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shared by every statement-carrying request.
#[derive(Clone)]
pub struct QueryRequest {
    pub sql: Arc<str>,
    pub handle: Option<Arc<ResultHandle>>,
    pub submit_counter: u64,
}

impl QueryRequest {
    pub fn new(sql: impl Into<Arc<str>>, handle: Option<Arc<ResultHandle>>) -> Self {
        Self {
            sql: sql.into(),
            handle,
            submit_counter: 0,
        }
    }
}

impl fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRequest")
            .field("sql", &self.sql)
            .field("handle", &self.handle.as_ref().map(|handle| handle.id()))
            .field("submit_counter", &self.submit_counter)
            .finish()
    }
}

/// One unit of queued work. Never mutated once posted.
#[derive(Clone, Debug)]
pub enum Request {
    Stub,
    Generic(QueryRequest),
    Select(QueryRequest),
    Update(QueryRequest),
    /// Only meaningful through the synchronous path; a queued one is a no-op.
    Exclusive(QueryRequest),
    TableDump(QueryRequest),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Stub => RequestKind::Stub,
            Request::Generic(_) => RequestKind::Generic,
            Request::Select(_) => RequestKind::Select,
            Request::Update(_) => RequestKind::Update,
            Request::Exclusive(_) => RequestKind::Exclusive,
            Request::TableDump(_) => RequestKind::TableDump,
        }
    }

    pub fn query(&self) -> Option<&QueryRequest> {
        match self {
            Request::Stub => None,
            Request::Generic(query)
            | Request::Select(query)
            | Request::Update(query)
            | Request::Exclusive(query)
            | Request::TableDump(query) => Some(query),
        }
    }

    pub fn submit_counter(&self) -> u64 {
        self.query().map_or(0, |query| query.submit_counter)
    }

    pub(crate) fn with_submit_counter(mut self, counter: u64) -> Self {
        match &mut self {
            Request::Stub => {}
            Request::Generic(query)
            | Request::Select(query)
            | Request::Update(query)
            | Request::Exclusive(query)
            | Request::TableDump(query) => query.submit_counter = counter,
        }
        self
    }
}
